//! Task status machine.
//!
//! Edges:
//!
//! ```text
//! pending          -> in-progress
//! in-progress      -> waiting-approval   (task requires approval)
//! in-progress      -> completed          (task does not require approval)
//! waiting-approval -> approved           (approver)
//! waiting-approval -> rejected           (approver, comment required)
//! approved         -> completed
//! completed        -> in-progress        (reopen)
//! rejected         -> in-progress        (rework)
//! ```
//!
//! Everything here is pure: validation returns a [`BlockReason`], and
//! application returns a new [`Task`] value. The workflow turns that value
//! into a patch; the store applies it and runs the cascade.

use chrono::{DateTime, Utc};

use crate::actor::{Actor, Capabilities, Permission};
use crate::error::BlockReason;
use crate::model::{non_empty, StatusHistoryEntry, Task, TaskStatus};

/// Whether `from -> to` is an edge for this task, ignoring who asks.
pub fn check_edge(task: &Task, to: TaskStatus) -> Result<(), BlockReason> {
    use TaskStatus::*;

    match (task.status, to) {
        (Pending, InProgress) | (Completed, InProgress) | (Rejected, InProgress) => Ok(()),
        (InProgress, WaitingApproval) => {
            if task.requires_approval {
                Ok(())
            } else {
                Err(BlockReason::ApprovalNotRequired {
                    task_id: task.id.clone(),
                })
            }
        }
        (InProgress, Completed) => {
            if task.requires_approval {
                Err(BlockReason::ApprovalRequired {
                    task_id: task.id.clone(),
                })
            } else {
                Ok(())
            }
        }
        (WaitingApproval, Approved) | (WaitingApproval, Rejected) | (Approved, Completed) => Ok(()),
        (from, to) => Err(BlockReason::InvalidTransition { from, to }),
    }
}

/// Capability needed to take the edge, if any.
pub fn required_permission(from: TaskStatus, to: TaskStatus) -> Option<Permission> {
    match (from, to) {
        (TaskStatus::WaitingApproval, TaskStatus::Approved)
        | (TaskStatus::WaitingApproval, TaskStatus::Rejected) => Some(Permission::Approve),
        _ => None,
    }
}

/// Full business-rule check, except the predecessor gate.
///
/// The predecessor gate needs the rest of the board and is checked by the
/// caller at the moment of transition.
pub fn validate(
    task: &Task,
    to: TaskStatus,
    actor: &Actor,
    capabilities: &Capabilities,
    comment: Option<&str>,
) -> Result<(), BlockReason> {
    check_edge(task, to)?;

    if let Some(permission) = required_permission(task.status, to) {
        if !capabilities.allows(actor, permission) {
            return Err(BlockReason::NotPermitted {
                actor: actor.to_string(),
                permission,
            });
        }
    }

    if to == TaskStatus::Rejected && non_empty(comment).is_none() {
        return Err(BlockReason::CommentRequired);
    }

    Ok(())
}

/// Apply an already validated transition.
///
/// Stamps completion/approval fields and appends exactly one history entry.
pub fn apply(task: &Task, to: TaskStatus, actor: &Actor, now: DateTime<Utc>) -> Task {
    let mut next = task.clone();
    let from = next.status;
    next.status = to;

    if to == TaskStatus::Completed {
        next.completed_at = Some(now);
    } else if from == TaskStatus::Completed {
        next.completed_at = None;
    }

    if to == TaskStatus::Approved {
        next.approved_by = Some(actor.id.clone());
        next.approved_at = Some(now);
    }

    record_history(&mut next, actor, now);
    next
}

/// Administrative completion used when a project is closed.
///
/// Returns `None` for tasks that are already completed.
pub fn force_complete(task: &Task, actor: &Actor, now: DateTime<Utc>) -> Option<Task> {
    if task.is_completed() {
        return None;
    }
    let mut next = task.clone();
    next.status = TaskStatus::Completed;
    next.completed_at = Some(now);
    record_history(&mut next, actor, now);
    Some(next)
}

/// Text of the comment persisted alongside a transition, if any.
pub fn transition_comment(to: TaskStatus, comment: Option<&str>) -> Option<String> {
    let comment = non_empty(comment);
    match to {
        TaskStatus::Rejected => comment.map(|reason| format!("Rejected: {reason}")),
        TaskStatus::Approved => comment.map(|note| format!("Approved: {note}")),
        _ => comment.map(str::to_string),
    }
}

fn record_history(task: &mut Task, actor: &Actor, now: DateTime<Utc>) {
    task.status_history.push(StatusHistoryEntry {
        status: task.status,
        user_id: actor.id.clone(),
        user_name: actor.name.clone(),
        timestamp: now,
    });
}
