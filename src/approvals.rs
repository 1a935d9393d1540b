//! Approval queue.
//!
//! Rebuilt from a board snapshot on every call. Nothing is cached.

use serde::Serialize;

use crate::actor::{Actor, Capabilities, Permission};
use crate::board::Board;
use crate::model::{Priority, ProjectStatus, Task, TaskStatus};
use crate::stage::awaits_sign_off;

/// Project and stage context carried by every queue item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalContext {
    pub project_id: String,
    pub project_name: String,
    pub project_description: String,
    pub stage_id: String,
    pub stage_name: String,
    pub stage_description: String,
}

/// Something waiting for an approver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalItem {
    Stage {
        #[serde(flatten)]
        context: ApprovalContext,
        task_count: usize,
    },
    Task {
        #[serde(flatten)]
        context: ApprovalContext,
        task_id: String,
        task_title: String,
        priority: Priority,
        assigned_to: Vec<String>,
    },
}

impl ApprovalItem {
    pub fn context(&self) -> &ApprovalContext {
        match self {
            ApprovalItem::Stage { context, .. } | ApprovalItem::Task { context, .. } => context,
        }
    }

    /// Id of the stage or task to act on.
    pub fn target_id(&self) -> &str {
        match self {
            ApprovalItem::Stage { context, .. } => &context.stage_id,
            ApprovalItem::Task { task_id, .. } => task_id,
        }
    }
}

/// Stages awaiting sign-off and tasks awaiting approval.
///
/// Actors without the approve permission get an empty list. Items of
/// closed projects and orphaned rows are skipped.
pub fn list_pending_approvals(
    board: &Board,
    actor: &Actor,
    capabilities: &Capabilities,
) -> Vec<ApprovalItem> {
    if !capabilities.allows(actor, Permission::Approve) {
        return Vec::new();
    }

    let mut items = Vec::new();
    for project in board.projects_by_recency() {
        if project.status == ProjectStatus::Closed {
            continue;
        }
        for stage in board.stages_of(&project.id) {
            let tasks = board.tasks_of(&stage.id);
            let context = || ApprovalContext {
                project_id: project.id.clone(),
                project_name: project.name.clone(),
                project_description: project.description.clone(),
                stage_id: stage.id.clone(),
                stage_name: stage.name.clone(),
                stage_description: stage.description.clone(),
            };

            if awaits_sign_off(stage, &tasks) {
                items.push(ApprovalItem::Stage {
                    context: context(),
                    task_count: tasks.len(),
                });
            }
            items.extend(
                tasks
                    .iter()
                    .filter(|task| task.status == TaskStatus::WaitingApproval)
                    .map(|task| task_item(context(), task)),
            );
        }
    }
    items
}

fn task_item(context: ApprovalContext, task: &Task) -> ApprovalItem {
    ApprovalItem::Task {
        context,
        task_id: task.id.clone(),
        task_title: task.title.clone(),
        priority: task.priority,
        assigned_to: task.assigned_to.iter().map(str::to_string).collect(),
    }
}
