//! Immutable snapshot of every project, stage, task and comment.
//!
//! A workflow operation reads one `Board`, derives a [`ChangeSet`] from it
//! and hands the change set to the store. Only the store applies change
//! sets, under its lock, so stage and project statuses are always derived
//! from the children that are actually stored.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EntityKind, Error, Result};
use crate::model::{Comment, Project, Stage, Task};
use crate::project::recompute_project;
use crate::stage::recompute_stage;
use crate::store::ChangeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl Board {
    pub fn project(&self, id: &str) -> Option<&Project> {
        self.projects.iter().find(|project| project.id == id)
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.id == id)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn comment(&self, id: &str) -> Option<&Comment> {
        self.comments.iter().find(|comment| comment.id == id)
    }

    /// Projects, newest first.
    pub fn projects_by_recency(&self) -> Vec<&Project> {
        let mut projects: Vec<&Project> = self.projects.iter().collect();
        projects.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        projects
    }

    /// Stages of a project in their assigned order.
    pub fn stages_of(&self, project_id: &str) -> Vec<&Stage> {
        let mut stages: Vec<&Stage> = self
            .stages
            .iter()
            .filter(|stage| stage.project_id == project_id)
            .collect();
        stages.sort_by(|a, b| {
            a.order
                .cmp(&b.order)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        stages
    }

    /// Tasks of a stage in creation order.
    pub fn tasks_of(&self, stage_id: &str) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|task| task.stage_id == stage_id)
            .collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        tasks
    }

    /// Every task under any stage of the project.
    pub fn project_tasks(&self, project_id: &str) -> Vec<&Task> {
        self.stages_of(project_id)
            .into_iter()
            .flat_map(|stage| self.tasks_of(&stage.id))
            .collect()
    }

    /// Comments of a task, oldest first.
    pub fn comments_of(&self, task_id: &str) -> Vec<&Comment> {
        let mut comments: Vec<&Comment> = self
            .comments
            .iter()
            .filter(|comment| comment.task_id == task_id)
            .collect();
        comments.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        comments
    }

    /// Tasks whose predecessor is `task_id`.
    pub fn dependents_of(&self, task_id: &str) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|task| task.predecessor_id() == Some(task_id))
            .collect()
    }

    /// Owning project of a task, if both links resolve.
    pub fn project_of_task(&self, task: &Task) -> Option<&Project> {
        let stage = self.stage(&task.stage_id)?;
        self.project(&stage.project_id)
    }

    /// Resolve a project id, accepting a unique prefix of its suffix.
    pub fn resolve_project(&self, input: &str) -> Result<&Project> {
        let id = resolve_id(EntityKind::Project, input, self.projects.iter().map(|p| &p.id))?;
        self.project(&id)
            .ok_or_else(|| Error::not_found(EntityKind::Project, id))
    }

    pub fn resolve_stage(&self, input: &str) -> Result<&Stage> {
        let id = resolve_id(EntityKind::Stage, input, self.stages.iter().map(|s| &s.id))?;
        self.stage(&id)
            .ok_or_else(|| Error::not_found(EntityKind::Stage, id))
    }

    pub fn resolve_task(&self, input: &str) -> Result<&Task> {
        let id = resolve_id(EntityKind::Task, input, self.tasks.iter().map(|t| &t.id))?;
        self.task(&id)
            .ok_or_else(|| Error::not_found(EntityKind::Task, id))
    }

    pub fn resolve_comment(&self, input: &str) -> Result<&Comment> {
        let id = resolve_id(EntityKind::Comment, input, self.comments.iter().map(|c| &c.id))?;
        self.comment(&id)
            .ok_or_else(|| Error::not_found(EntityKind::Comment, id))
    }

    /// Apply a change set: upserts, then task patches, then deletions with
    /// cascade, then the stage and project recompute.
    pub fn apply(&mut self, change: &ChangeSet) {
        for project in &change.projects {
            upsert(&mut self.projects, project.clone(), |p| &p.id);
        }
        for stage in &change.stages {
            upsert(&mut self.stages, stage.clone(), |s| &s.id);
        }
        for task in &change.tasks {
            upsert(&mut self.tasks, task.clone(), |t| &t.id);
        }
        for comment in &change.comments {
            upsert(&mut self.comments, comment.clone(), |c| &c.id);
        }
        for patch in &change.task_patches {
            match self.tasks.iter_mut().find(|task| task.id == patch.task_id) {
                Some(task) => patch.apply_to(task),
                None => debug!(task_id = %patch.task_id, "patched task is gone; skipping"),
            }
        }

        let deleted_projects: HashSet<&str> =
            change.deleted_projects.iter().map(String::as_str).collect();
        let mut deleted_stages: HashSet<String> = change.deleted_stages.iter().cloned().collect();
        deleted_stages.extend(
            self.stages
                .iter()
                .filter(|stage| deleted_projects.contains(stage.project_id.as_str()))
                .map(|stage| stage.id.clone()),
        );
        let mut deleted_tasks: HashSet<String> = change.deleted_tasks.iter().cloned().collect();
        deleted_tasks.extend(
            self.tasks
                .iter()
                .filter(|task| deleted_stages.contains(&task.stage_id))
                .map(|task| task.id.clone()),
        );

        self.projects
            .retain(|project| !deleted_projects.contains(project.id.as_str()));
        self.stages.retain(|stage| !deleted_stages.contains(&stage.id));
        self.tasks.retain(|task| !deleted_tasks.contains(&task.id));
        self.comments
            .retain(|comment| !deleted_tasks.contains(&comment.task_id));

        self.recompute(&change.recompute_stages, &change.recompute_projects);
    }

    /// Re-derive `stage_ids` from their tasks, then the projects owning
    /// them plus `project_ids` from their stages and tasks.
    ///
    /// Missing stages or projects are skipped and logged.
    pub fn recompute(&mut self, stage_ids: &[String], project_ids: &[String]) {
        let mut projects: BTreeSet<String> = project_ids.iter().cloned().collect();

        let stage_ids: BTreeSet<&String> = stage_ids.iter().collect();
        for stage_id in stage_ids {
            let Some(stage) = self.stage(stage_id) else {
                warn!(stage_id = %stage_id, "stage not found; skipping stage aggregation");
                continue;
            };
            projects.insert(stage.project_id.clone());
            let from = stage.status;
            let status = recompute_stage(stage, &self.tasks_of(stage_id));
            if status == from {
                continue;
            }
            debug!(stage_id = %stage_id, %from, to = %status, "stage status recomputed");
            if let Some(row) = self.stages.iter_mut().find(|row| &row.id == stage_id) {
                row.status = status;
            }
        }

        for project_id in &projects {
            let Some(project) = self.project(project_id) else {
                warn!(project_id = %project_id, "project not found; skipping project aggregation");
                continue;
            };
            let from = project.status;
            let status = recompute_project(
                project,
                &self.stages_of(project_id),
                &self.project_tasks(project_id),
            );
            if status == from {
                continue;
            }
            debug!(project_id = %project_id, %from, to = %status, "project status recomputed");
            if let Some(row) = self.projects.iter_mut().find(|row| &row.id == project_id) {
                row.status = status;
            }
        }
    }
}

/// Exact id, exact suffix after the `xxx-` prefix, or a unique prefix of
/// either.
fn resolve_id<'a, I>(kind: EntityKind, input: &str, ids: I) -> Result<String>
where
    I: Iterator<Item = &'a String>,
{
    let wanted = input.trim().to_ascii_lowercase();
    if wanted.is_empty() {
        return Err(Error::InvalidArgument(format!("{kind} id cannot be empty")));
    }

    let mut exact = Vec::new();
    let mut partial = Vec::new();
    for id in ids {
        let normalized = id.to_ascii_lowercase();
        let suffix = normalized
            .split_once('-')
            .map_or(normalized.as_str(), |(_, rest)| rest);
        if normalized == wanted || suffix == wanted {
            exact.push(id.clone());
        } else if normalized.starts_with(&wanted) || suffix.starts_with(&wanted) {
            partial.push(id.clone());
        }
    }

    let candidates = if exact.is_empty() { partial } else { exact };
    match candidates.as_slice() {
        [] => Err(Error::not_found(kind, input.trim())),
        [only] => Ok(only.clone()),
        _ => Err(Error::InvalidArgument(format!(
            "ambiguous {kind} id '{}': {}",
            input.trim(),
            candidates.join(", ")
        ))),
    }
}

fn upsert<T, F>(rows: &mut Vec<T>, row: T, key: F)
where
    F: Fn(&T) -> &String,
{
    match rows.iter_mut().find(|existing| key(existing) == key(&row)) {
        Some(existing) => *existing = row,
        None => rows.push(row),
    }
}
