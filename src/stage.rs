//! Stage status aggregation.
//!
//! A stage's status is re-derived from its current tasks after every task
//! change. Recomputing twice with no change in between yields the same
//! status.

use crate::actor::{Actor, Capabilities, Permission};
use crate::error::BlockReason;
use crate::model::{Stage, StageStatus, Task, TaskStatus};

/// Derive the stage status from its tasks.
///
/// Stages requiring approval:
/// - `pending`/`waiting-approval`: flagged for sign-off once every task is
///   completed (none waiting) or every task is approved; otherwise pending.
/// - `approved`: becomes `completed` once every task is completed.
/// - `completed`: stays.
///
/// Stages without approval are `completed` exactly when every task is.
/// A stage with no tasks keeps its current status.
pub fn recompute_stage(stage: &Stage, tasks: &[&Task]) -> StageStatus {
    if tasks.is_empty() {
        return stage.status;
    }

    let all_completed = tasks.iter().all(|task| task.status == TaskStatus::Completed);
    let all_approved = tasks.iter().all(|task| task.status == TaskStatus::Approved);
    let any_waiting = tasks
        .iter()
        .any(|task| task.status == TaskStatus::WaitingApproval);

    if !stage.requires_approval {
        return if all_completed {
            StageStatus::Completed
        } else {
            StageStatus::Pending
        };
    }

    match stage.status {
        StageStatus::Pending | StageStatus::WaitingApproval => {
            if (all_completed && !any_waiting) || all_approved {
                StageStatus::WaitingApproval
            } else {
                StageStatus::Pending
            }
        }
        StageStatus::Approved if all_completed => StageStatus::Completed,
        status => status,
    }
}

/// Status a stage moves to when an approver signs it off.
pub fn approve_stage(
    stage: &Stage,
    tasks: &[&Task],
    actor: &Actor,
    capabilities: &Capabilities,
) -> Result<StageStatus, BlockReason> {
    if !capabilities.allows(actor, Permission::Approve) {
        return Err(BlockReason::NotPermitted {
            actor: actor.to_string(),
            permission: Permission::Approve,
        });
    }
    if !stage.requires_approval {
        return Err(BlockReason::StageApprovalNotRequired {
            stage_id: stage.id.clone(),
            stage_name: stage.name.clone(),
        });
    }
    if matches!(stage.status, StageStatus::Approved | StageStatus::Completed) {
        return Err(BlockReason::StageAlreadySignedOff {
            stage_id: stage.id.clone(),
            stage_name: stage.name.clone(),
            status: stage.status,
        });
    }

    let all_completed =
        !tasks.is_empty() && tasks.iter().all(|task| task.status == TaskStatus::Completed);
    Ok(if all_completed {
        StageStatus::Completed
    } else {
        StageStatus::Approved
    })
}

/// Whether the stage belongs in the approval queue.
///
/// Covers stages already flagged and stages whose tasks qualify but whose
/// status has not been recomputed yet.
pub fn awaits_sign_off(stage: &Stage, tasks: &[&Task]) -> bool {
    if !stage.requires_approval {
        return false;
    }
    match stage.status {
        StageStatus::WaitingApproval => true,
        StageStatus::Pending => {
            !tasks.is_empty()
                && tasks.iter().all(|task| task.status == TaskStatus::Completed)
                && !tasks
                    .iter()
                    .any(|task| task.status == TaskStatus::WaitingApproval)
        }
        _ => false,
    }
}
