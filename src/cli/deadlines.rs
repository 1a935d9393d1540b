//! sg deadlines command implementation

use chrono::Utc;
use serde::Serialize;

use crate::deadlines::parse_duration;
use crate::error::Result;
use crate::events::{Notification, NotificationKind};
use crate::output::{emit_success, HumanOutput};

use super::Globals;

#[derive(Serialize)]
struct DeadlinesReport {
    window: String,
    overdue: usize,
    approaching: usize,
    notifications: Vec<Notification>,
}

pub fn run(globals: &Globals, window: Option<&str>) -> Result<()> {
    let ctx = globals.context()?;
    let window_label = window
        .map(str::to_string)
        .unwrap_or_else(|| ctx.config.deadlines.window.clone());
    let window = parse_duration(&window_label)?;

    let notifications = ctx.workflow.scan_deadlines(Utc::now(), window)?;
    let overdue = notifications
        .iter()
        .filter(|note| note.kind == NotificationKind::Overdue)
        .count();
    let approaching = notifications.len() - overdue;

    let mut human = HumanOutput::new(format!(
        "sg deadlines: {overdue} overdue, {approaching} approaching"
    ));
    human.push_summary("window", window_label.clone());
    for note in &notifications {
        human.push_detail(format!(
            "[{}] {} -> {}",
            note.kind, note.message, note.recipient_user_id
        ));
    }

    let report = DeadlinesReport {
        window: window_label,
        overdue,
        approaching,
        notifications,
    };
    emit_success(globals.output(), "deadlines", &report, Some(&human))
}
