//! Notification events and the sinks that receive them.
//!
//! The workflow only decides *who* should hear about *what*. Delivery is
//! fire-and-forget: a sink failure is logged and never reaches the caller.
//! Sinks write JSON lines to stdout or a configured file, or collect into
//! memory for tests.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::{Priority, Task};

pub const EVENT_SCHEMA_VERSION: &str = "sg.event.v1";

#[derive(Debug, Clone)]
pub enum EventDestination {
    Stdout,
    File(PathBuf),
}

impl EventDestination {
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        raw.and_then(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return None;
            }
            if trimmed == "-" {
                return Some(EventDestination::Stdout);
            }
            Some(EventDestination::File(PathBuf::from(trimmed)))
        })
    }

    pub fn open(&self) -> Result<JsonlSink> {
        match self {
            EventDestination::Stdout => Ok(JsonlSink::stdout()),
            EventDestination::File(path) => JsonlSink::file(path),
        }
    }
}

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    TaskStatusChanged,
    TaskAssigned,
    Mention,
    DeadlineApproaching,
    Overdue,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NotificationKind::TaskStatusChanged => "task-status-changed",
            NotificationKind::TaskAssigned => "task-assigned",
            NotificationKind::Mention => "mention",
            NotificationKind::DeadlineApproaching => "deadline-approaching",
            NotificationKind::Overdue => "overdue",
        };
        f.write_str(label)
    }
}

/// One message for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub recipient_user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_task_id: Option<String>,
    pub priority: Priority,
}

impl Notification {
    /// One notification per assignee of `task`.
    pub fn for_assignees(
        task: &Task,
        kind: NotificationKind,
        title: &str,
        message: &str,
    ) -> Vec<Notification> {
        task.assigned_to
            .iter()
            .map(|recipient| Notification {
                recipient_user_id: recipient.to_string(),
                kind,
                title: title.to_string(),
                message: message.to_string(),
                related_task_id: Some(task.id.clone()),
                priority: task.priority,
            })
            .collect()
    }
}

/// "Task status changed", once per assignee.
pub fn status_change_notifications(task: &Task) -> Vec<Notification> {
    Notification::for_assignees(
        task,
        NotificationKind::TaskStatusChanged,
        "Task status changed",
        &format!("\"{}\" is now {}", task.title, task.status),
    )
}

/// Envelope written for every delivered notification.
#[derive(Debug, Clone, Serialize)]
pub struct Event<'a> {
    pub schema_version: &'static str,
    pub timestamp: DateTime<Utc>,
    pub notification: &'a Notification,
}

impl<'a> Event<'a> {
    pub fn new(notification: &'a Notification) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION,
            timestamp: Utc::now(),
            notification,
        }
    }
}

/// Receiver of notification events.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn deliver(&self, _notification: &Notification) -> Result<()> {
        Ok(())
    }
}

/// Sink that writes JSONL output to a destination.
pub struct JsonlSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonlSink {
    /// Emit events to stdout.
    pub fn stdout() -> Self {
        Self {
            writer: Mutex::new(Box::new(std::io::stdout())),
        }
    }

    /// Emit events to a file, creating it if necessary.
    pub fn file(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
        })
    }
}

impl NotificationSink for JsonlSink {
    fn deliver(&self, notification: &Notification) -> Result<()> {
        let serialized = serde_json::to_vec(&Event::new(notification))?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::StoreUnavailable("event writer poisoned".to_string()))?;
        writer.write_all(&serialized)?;
        writer.write_all(b"\n")?;
        writer.flush().map_err(Error::Io)?;
        Ok(())
    }
}

/// Sink that keeps every notification in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    delivered: Mutex<Vec<Notification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far.
    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered
            .lock()
            .map(|items| items.clone())
            .unwrap_or_default()
    }
}

impl NotificationSink for MemorySink {
    fn deliver(&self, notification: &Notification) -> Result<()> {
        self.delivered
            .lock()
            .map_err(|_| Error::StoreUnavailable("memory sink poisoned".to_string()))?
            .push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::model::{Assignees, TaskStatus};

    fn task() -> Task {
        Task {
            id: "tsk-1".to_string(),
            stage_id: "stg-1".to_string(),
            title: "Draft contract".to_string(),
            description: String::new(),
            status: TaskStatus::InProgress,
            priority: Priority::Critical,
            assigned_to: Assignees::new(["u-1", "u-2", " "]).expect("assignees"),
            created_by: "u-1".to_string(),
            created_at: Utc::now(),
            start_date: None,
            due_date: None,
            completed_at: None,
            approved_by: None,
            approved_at: None,
            requires_approval: false,
            parent_task_id: None,
            status_history: Vec::new(),
        }
    }

    #[test]
    fn status_change_notifies_each_assignee() {
        let notes = status_change_notifications(&task());
        let recipients: Vec<&str> = notes.iter().map(|n| n.recipient_user_id.as_str()).collect();
        assert_eq!(recipients, vec!["u-1", "u-2"]);
        assert!(notes.iter().all(|n| n.kind == NotificationKind::TaskStatusChanged));
        assert!(notes[0].message.contains("in-progress"));
        assert_eq!(notes[0].priority, Priority::Critical);
    }

    #[test]
    fn destination_parse() {
        assert!(EventDestination::parse(None).is_none());
        assert!(EventDestination::parse(Some("  ")).is_none());
        assert!(matches!(EventDestination::parse(Some("-")), Some(EventDestination::Stdout)));
        assert!(matches!(
            EventDestination::parse(Some("events.jsonl")),
            Some(EventDestination::File(_))
        ));
    }

    #[test]
    fn jsonl_sink_appends_envelopes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");
        let sink = JsonlSink::file(&path).expect("sink");
        for note in status_change_notifications(&task()) {
            sink.deliver(&note).expect("deliver");
        }

        let written = std::fs::read_to_string(&path).expect("read events");
        let lines: Vec<serde_json::Value> = written
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["schema_version"], EVENT_SCHEMA_VERSION);
        assert_eq!(lines[0]["notification"]["type"], "task-status-changed");
        assert_eq!(lines[1]["notification"]["recipientUserId"], "u-2");
        assert_eq!(lines[1]["notification"]["relatedTaskId"], "tsk-1");
    }

    #[test]
    fn memory_sink_collects() {
        let sink = MemorySink::new();
        for note in status_change_notifications(&task()) {
            sink.deliver(&note).expect("deliver");
        }
        assert_eq!(sink.delivered().len(), 2);
    }
}
