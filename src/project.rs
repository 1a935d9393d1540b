//! Project status aggregation and administrative close.

use chrono::{DateTime, Utc};

use crate::actor::{Actor, Capabilities, Permission};
use crate::error::BlockReason;
use crate::machine;
use crate::model::{Project, ProjectStatus, Stage, StageStatus, Task, TaskStatus};

/// Derive the project status from its stages and tasks.
///
/// Evaluated in order:
/// 1. `closed` never changes.
/// 2. Any task in progress makes the project `in-progress`.
/// 3. At least one stage, all `completed`, makes it `completed`.
///
/// Otherwise a `completed` project has open work again and moves back to
/// `in-progress`; any other status is kept, so a project that left
/// `planning` never drops back to it.
pub fn recompute_project(project: &Project, stages: &[&Stage], tasks: &[&Task]) -> ProjectStatus {
    if project.status == ProjectStatus::Closed {
        return ProjectStatus::Closed;
    }
    if tasks.iter().any(|task| task.status == TaskStatus::InProgress) {
        return ProjectStatus::InProgress;
    }
    if !stages.is_empty() && stages.iter().all(|stage| stage.status == StageStatus::Completed) {
        return ProjectStatus::Completed;
    }
    match project.status {
        ProjectStatus::Completed => ProjectStatus::InProgress,
        status => status,
    }
}

/// Rows rewritten by closing a project.
#[derive(Debug, Clone)]
pub struct ClosePlan {
    pub project: Project,
    pub stages: Vec<Stage>,
    pub tasks: Vec<Task>,
}

/// Force-complete every task and stage and mark the project closed.
///
/// Only rows that actually change are returned in the plan.
pub fn plan_close(
    project: &Project,
    stages: &[&Stage],
    tasks: &[&Task],
    actor: &Actor,
    capabilities: &Capabilities,
    now: DateTime<Utc>,
) -> Result<ClosePlan, BlockReason> {
    if !capabilities.allows(actor, Permission::Close) {
        return Err(BlockReason::NotPermitted {
            actor: actor.to_string(),
            permission: Permission::Close,
        });
    }
    if project.status == ProjectStatus::Closed {
        return Err(BlockReason::ProjectClosed {
            project_id: project.id.clone(),
            project_name: project.name.clone(),
        });
    }

    let tasks = tasks
        .iter()
        .filter_map(|task| machine::force_complete(task, actor, now))
        .collect();
    let stages = stages
        .iter()
        .filter(|stage| stage.status != StageStatus::Completed)
        .map(|stage| Stage {
            status: StageStatus::Completed,
            ..(*stage).clone()
        })
        .collect();
    let project = Project {
        status: ProjectStatus::Closed,
        ..project.clone()
    };

    Ok(ClosePlan {
        project,
        stages,
        tasks,
    })
}
