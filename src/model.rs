//! Entity model: projects, stages, tasks, comments and status history.
//!
//! Field names serialize in camelCase and status values in kebab-case so a
//! stored row reads the same as the relational tables it mirrors.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $label:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "kebab-case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(value: &str) -> Result<Self> {
                let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
                $name::ALL
                    .iter()
                    .copied()
                    .find(|candidate| candidate.as_str() == normalized)
                    .ok_or_else(|| {
                        let expected: Vec<&str> =
                            $name::ALL.iter().map(|entry| entry.as_str()).collect();
                        Error::InvalidArgument(format!(
                            "unknown {} '{}' (expected {})",
                            stringify!($name),
                            value.trim(),
                            expected.join("|")
                        ))
                    })
            }
        }
    };
}

status_enum! {
    /// Lifecycle state of a task.
    TaskStatus {
        Pending => "pending",
        InProgress => "in-progress",
        WaitingApproval => "waiting-approval",
        Approved => "approved",
        Completed => "completed",
        Rejected => "rejected",
    }
}

status_enum! {
    /// Derived state of a stage.
    StageStatus {
        Pending => "pending",
        WaitingApproval => "waiting-approval",
        Approved => "approved",
        Completed => "completed",
    }
}

status_enum! {
    /// Derived state of a project. `Closed` is terminal.
    ProjectStatus {
        Planning => "planning",
        InProgress => "in-progress",
        Completed => "completed",
        OnHold => "on-hold",
        Closed => "closed",
    }
}

status_enum! {
    Priority {
        Low => "low",
        Medium => "medium",
        High => "high",
        Critical => "critical",
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Non-empty set of assigned user ids.
///
/// Stored rows may carry either a bare id string (older rows) or an array;
/// both deserialize into the same set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AssigneesRepr", into = "Vec<String>")]
pub struct Assignees(BTreeSet<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum AssigneesRepr {
    Single(String),
    Many(Vec<String>),
}

impl TryFrom<AssigneesRepr> for Assignees {
    type Error = String;

    fn try_from(repr: AssigneesRepr) -> std::result::Result<Self, Self::Error> {
        let ids = match repr {
            AssigneesRepr::Single(id) => vec![id],
            AssigneesRepr::Many(ids) => ids,
        };
        Assignees::new(ids).map_err(|err| err.to_string())
    }
}

impl From<Assignees> for Vec<String> {
    fn from(assignees: Assignees) -> Self {
        assignees.0.into_iter().collect()
    }
}

impl Assignees {
    /// Build a set from raw ids, dropping blanks and duplicates.
    pub fn new<I, S>(ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: BTreeSet<String> = ids
            .into_iter()
            .filter_map(|id| non_empty(Some(id.as_ref())).map(str::to_string))
            .collect();
        if set.is_empty() {
            return Err(Error::InvalidArgument(
                "a task needs at least one assignee".to_string(),
            ));
        }
        Ok(Self(set))
    }

    pub fn single(id: &str) -> Result<Self> {
        Self::new([id])
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id.trim())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Assignees {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<&str> = self.iter().collect();
        f.write_str(&ids.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: ProjectStatus,
    #[serde(default)]
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub order: i32,
    #[serde(default)]
    pub requires_approval: bool,
    pub status: StageStatus,
    pub created_at: DateTime<Utc>,
}

/// One accepted status change. Never edited once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryEntry {
    pub status: TaskStatus,
    pub user_id: String,
    pub user_name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub stage_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    pub assigned_to: Assignees,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub status_history: Vec<StatusHistoryEntry>,
}

impl Task {
    /// Predecessor id, ignoring blank references.
    pub fn predecessor_id(&self) -> Option<&str> {
        non_empty(self.parent_task_id.as_deref())
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub task_id: String,
    pub content: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mentioned_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
}

/// Trimmed value, or `None` when missing or blank.
pub(crate) fn non_empty(input: Option<&str>) -> Option<&str> {
    input.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_use_kebab_case() {
        let json = serde_json::to_string(&TaskStatus::WaitingApproval).expect("serialize");
        assert_eq!(json, "\"waiting-approval\"");
        assert_eq!(
            "in_progress".parse::<TaskStatus>().expect("parse"),
            TaskStatus::InProgress
        );
        assert_eq!(
            "On-Hold".parse::<ProjectStatus>().expect("parse"),
            ProjectStatus::OnHold
        );
        assert!("done".parse::<StageStatus>().is_err());
    }

    #[test]
    fn assignees_accept_single_id_rows() {
        let single: Assignees = serde_json::from_str("\"u-1\"").expect("single");
        let many: Assignees = serde_json::from_str("[\"u-2\", \"u-1\", \"u-1\", \" \"]").expect("many");
        assert_eq!(single.iter().collect::<Vec<_>>(), vec!["u-1"]);
        assert_eq!(many.iter().collect::<Vec<_>>(), vec!["u-1", "u-2"]);
        assert_eq!(
            serde_json::to_string(&many).expect("serialize"),
            "[\"u-1\",\"u-2\"]"
        );
    }

    #[test]
    fn assignees_reject_empty_sets() {
        assert!(serde_json::from_str::<Assignees>("[]").is_err());
        assert!(serde_json::from_str::<Assignees>("\"\"").is_err());
        assert!(Assignees::new(Vec::<String>::new()).is_err());
    }

    #[test]
    fn blank_predecessor_is_ignored() {
        let task = Task {
            id: "tsk-1".to_string(),
            stage_id: "stg-1".to_string(),
            title: "Draft".to_string(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: Priority::default(),
            assigned_to: Assignees::single("u-1").expect("assignees"),
            created_by: "u-1".to_string(),
            created_at: Utc::now(),
            start_date: None,
            due_date: None,
            completed_at: None,
            approved_by: None,
            approved_at: None,
            requires_approval: false,
            parent_task_id: Some("  ".to_string()),
            status_history: Vec::new(),
        };
        assert_eq!(task.predecessor_id(), None);
    }
}
