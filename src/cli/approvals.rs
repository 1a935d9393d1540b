//! sg approvals command implementation

use serde::Serialize;

use crate::approvals::ApprovalItem;
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};

use super::Globals;

#[derive(Serialize)]
struct ApprovalsReport {
    actor: String,
    items: Vec<ApprovalItem>,
}

pub fn run(globals: &Globals) -> Result<()> {
    let ctx = globals.context()?;
    let items = ctx.workflow.pending_approvals(&ctx.actor)?;

    let mut human = HumanOutput::new(format!("sg approvals: {} pending", items.len()));
    human.push_summary("actor", ctx.actor.to_string());
    for item in &items {
        human.push_detail(describe(item));
    }
    match items.first() {
        Some(item @ ApprovalItem::Stage { .. }) => {
            human.push_next_step(format!("sg stage approve {}", item.target_id()));
        }
        Some(item @ ApprovalItem::Task { .. }) => {
            let task_id = item.target_id();
            human.push_next_step(format!("sg task approve {task_id}"));
            human.push_next_step(format!("sg task reject {task_id} --reason <why>"));
        }
        None => {}
    }

    let report = ApprovalsReport {
        actor: ctx.actor.id.clone(),
        items,
    };
    emit_success(globals.output(), "approvals", &report, Some(&human))
}

fn describe(item: &ApprovalItem) -> String {
    match item {
        ApprovalItem::Stage {
            context,
            task_count,
        } => format!(
            "stage {} {} / {} ({} task(s))",
            context.stage_id, context.project_name, context.stage_name, task_count
        ),
        ApprovalItem::Task {
            context,
            task_id,
            task_title,
            priority,
            assigned_to,
        } => format!(
            "task {} {} ({}; {}) in {} / {}",
            task_id,
            task_title,
            priority,
            assigned_to.join(", "),
            context.project_name,
            context.stage_name
        ),
    }
}
