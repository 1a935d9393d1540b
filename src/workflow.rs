//! Lifecycle engine.
//!
//! Every mutating operation follows one path: read a snapshot, validate,
//! derive a single [`ChangeSet`] naming what it writes, what it was decided
//! against and which stages to re-derive, commit it, then hand
//! notifications to the sink if the store applied the change. The stage and
//! project cascade runs inside the commit, so reports are built from the
//! board the store hands back. Business-rule refusals come back as
//! [`Outcome::Blocked`]; store and input failures come back as [`Error`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::actor::{Actor, Capabilities, Permission};
use crate::approvals::{self, ApprovalItem};
use crate::board::Board;
use crate::config::Config;
use crate::deadlines;
use crate::dependency::{self, would_cycle};
use crate::error::{BlockReason, EntityKind, Error, Result};
use crate::events::{
    status_change_notifications, Notification, NotificationKind, NotificationSink, NullSink,
};
use crate::machine;
use crate::model::{
    non_empty, Assignees, Comment, Priority, Project, ProjectStatus, Stage, StageStatus,
    StatusHistoryEntry, Task, TaskStatus,
};
use crate::project::plan_close;
use crate::store::{ChangeSet, CommitReceipt, IdKind, StatusChange, Store, TaskPatch};

/// Result of a request that business rules may refuse.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The change was committed.
    Applied(T),
    /// Nothing to do: the entity already had the requested state, or the
    /// operation id had already been applied.
    Unchanged(T),
    Blocked(BlockReason),
}

impl<T> Outcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied(_))
    }

    pub fn blocked(&self) -> Option<&BlockReason> {
        match self {
            Outcome::Blocked(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Applied(value) | Outcome::Unchanged(value) => Some(value),
            Outcome::Blocked(_) => None,
        }
    }

    /// The value, with a refusal turned into [`Error::Blocked`].
    pub fn into_result(self) -> Result<T> {
        match self {
            Outcome::Applied(value) | Outcome::Unchanged(value) => Ok(value),
            Outcome::Blocked(reason) => Err(Error::Blocked(reason)),
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub task_id: String,
    pub to: TaskStatus,
    pub comment: Option<String>,
    /// Client-chosen id making a retried request safe to replay.
    pub op_id: Option<String>,
}

impl TransitionRequest {
    pub fn new(task_id: impl Into<String>, to: TaskStatus) -> Self {
        Self {
            task_id: task_id.into(),
            to,
            comment: None,
            op_id: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_op_id(mut self, op_id: impl Into<String>) -> Self {
        self.op_id = Some(op_id.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub assigned_to: Assignees,
    pub start_date: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub requires_approval: bool,
    pub parent_task_id: Option<String>,
}

impl NewTask {
    pub fn new(title: impl Into<String>, assigned_to: Assignees) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            priority: Priority::default(),
            assigned_to,
            start_date: None,
            due_date: None,
            requires_approval: false,
            parent_task_id: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewStage {
    pub name: String,
    pub description: String,
    /// Position among the project's stages; appended when `None`.
    pub order: Option<i32>,
    pub requires_approval: bool,
    pub tasks: Vec<NewTask>,
}

impl NewStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewProject {
    pub name: String,
    pub description: String,
    pub priority: Priority,
    pub stages: Vec<NewStage>,
}

#[derive(Debug, Clone, Default)]
pub struct NewComment {
    pub content: String,
    pub parent_id: Option<String>,
    pub mentioned_user_id: Option<String>,
    pub attachment_url: Option<String>,
}

impl NewComment {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// New state of a task and everything derived from it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub task: Task,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<Project>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<Comment>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<Notification>,
}

impl TaskReport {
    fn from_board(board: &Board, task: Task) -> Self {
        let stage = board.stage(&task.stage_id).cloned();
        let project = stage
            .as_ref()
            .and_then(|stage| board.project(&stage.project_id))
            .cloned();
        Self {
            task,
            previous_status: None,
            stage,
            project,
            comment: None,
            notifications: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub tasks: Vec<Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<Project>,
}

impl StageReport {
    fn from_board(board: &Board, stage: Stage) -> Self {
        let tasks = board.tasks_of(&stage.id).into_iter().cloned().collect();
        let project = board.project(&stage.project_id).cloned();
        Self {
            stage,
            tasks,
            project,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectReport {
    pub project: Project,
    pub stages: Vec<Stage>,
    pub tasks: Vec<Task>,
}

impl ProjectReport {
    fn from_board(board: &Board, project: Project) -> Self {
        let stages = board.stages_of(&project.id).into_iter().cloned().collect();
        let tasks = board
            .project_tasks(&project.id)
            .into_iter()
            .cloned()
            .collect();
        Self {
            project,
            stages,
            tasks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteReport {
    pub kind: EntityKind,
    pub id: String,
    pub removed_stages: usize,
    pub removed_tasks: usize,
    pub removed_comments: usize,
    /// Tasks whose predecessor link was cleared.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub detached_dependents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<Project>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommentReport {
    pub comment: Comment,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<Notification>,
}

/// Read model for a single task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskDetails {
    pub task: Task,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<Project>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<Comment>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<String>,
    /// Why the task could not be started right now, if it is startable at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_blocked_by: Option<BlockReason>,
}

// =============================================================================
// Engine
// =============================================================================

const DEFAULT_READ_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 50;

pub struct Workflow<S> {
    store: S,
    capabilities: Capabilities,
    sink: Arc<dyn NotificationSink>,
    read_retries: u32,
    retry_backoff: StdDuration,
}

impl<S: Store> Workflow<S> {
    pub fn new(store: S, capabilities: Capabilities) -> Self {
        Self {
            store,
            capabilities,
            sink: Arc::new(NullSink),
            read_retries: DEFAULT_READ_RETRIES,
            retry_backoff: StdDuration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }

    /// Engine with roles and retry settings taken from configuration.
    pub fn from_config(store: S, config: &Config) -> Self {
        Self::new(store, Capabilities::new(config.roles.clone()))
            .with_read_retries(config.store.read_retries, config.store.retry_backoff_ms)
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_read_retries(mut self, retries: u32, backoff_ms: u64) -> Self {
        self.read_retries = retries;
        self.retry_backoff = StdDuration::from_millis(backoff_ms);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Fresh snapshot, retrying transient store failures.
    pub fn load_board(&self) -> Result<Board> {
        let mut attempt = 0;
        loop {
            match self.store.load() {
                Ok(board) => return Ok(board),
                Err(err) if err.is_retryable() && attempt < self.read_retries => {
                    attempt += 1;
                    warn!(attempt, error = %err, "board read failed; retrying");
                    std::thread::sleep(self.retry_backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }

    // =========================================================================
    // Task status
    // =========================================================================

    /// Move a task to a new status and cascade to its stage and project.
    pub fn transition(&self, actor: &Actor, request: TransitionRequest) -> Result<Outcome<TaskReport>> {
        let board = self.load_board()?;
        let task = board.resolve_task(&request.task_id)?;
        let to = request.to;

        if let Some(reason) = closed_project(&board, &task.stage_id) {
            return Ok(Outcome::Blocked(reason));
        }
        if task.status == to {
            debug!(task_id = %task.id, status = %to, "task already in requested status");
            return Ok(Outcome::Unchanged(TaskReport::from_board(&board, task.clone())));
        }
        if let Err(reason) =
            machine::validate(task, to, actor, &self.capabilities, request.comment.as_deref())
        {
            info!(task_id = %task.id, from = %task.status, %to, %reason, "transition blocked");
            return Ok(Outcome::Blocked(reason));
        }
        let mut change = match request.op_id.as_deref().and_then(|id| non_empty(Some(id))) {
            Some(op_id) => ChangeSet::with_op_id(op_id),
            None => ChangeSet::new(),
        };
        if to == TaskStatus::InProgress {
            if let Err(reason) = dependency::can_start(task, &board) {
                info!(task_id = %task.id, %reason, "start blocked by predecessor");
                return Ok(Outcome::Blocked(reason));
            }
            if let Some(predecessor) = task.predecessor_id().and_then(|id| board.task(id)) {
                change.expect_task(predecessor);
            }
        }

        let now = Utc::now();
        let updated = machine::apply(task, to, actor, now);
        change.expect_task(task);
        expect_open(&board, &task.stage_id, &mut change);
        change.patch_task(TaskPatch {
            status: StatusChange::of(&updated),
            ..TaskPatch::new(&task.id)
        });

        let comment = machine::transition_comment(to, request.comment.as_deref())
            .map(|content| self.build_comment(&task.id, content, actor, now));
        if let Some(comment) = &comment {
            change.comments.push(comment.clone());
        }

        change.recompute_stage(&task.stage_id);
        let receipt = self.commit(&change)?;

        let current = receipt.board.task(&task.id).cloned().unwrap_or(updated);
        let mut report = TaskReport::from_board(&receipt.board, current);
        report.previous_status = Some(task.status);
        report.comment = comment;
        if !receipt.applied {
            return Ok(Outcome::Unchanged(report));
        }

        info!(task_id = %task.id, from = %task.status, %to, actor = %actor.id, "task status changed");
        report.notifications = status_change_notifications(&report.task);
        self.notify(&report.notifications);
        Ok(Outcome::Applied(report))
    }

    pub fn start_task(&self, actor: &Actor, task_id: &str) -> Result<Outcome<TaskReport>> {
        self.transition(actor, TransitionRequest::new(task_id, TaskStatus::InProgress))
    }

    /// Approve a task waiting for approval, with an optional note.
    pub fn approve_task(
        &self,
        actor: &Actor,
        task_id: &str,
        comment: Option<&str>,
    ) -> Result<Outcome<TaskReport>> {
        let mut request = TransitionRequest::new(task_id, TaskStatus::Approved);
        request.comment = comment.map(str::to_string);
        self.transition(actor, request)
    }

    /// Reject a task waiting for approval. `reason` must not be blank.
    pub fn reject_task(&self, actor: &Actor, task_id: &str, reason: &str) -> Result<Outcome<TaskReport>> {
        self.transition(
            actor,
            TransitionRequest::new(task_id, TaskStatus::Rejected).with_comment(reason),
        )
    }

    // =========================================================================
    // Assignment, dependencies and comments
    // =========================================================================

    /// Reassign a task without touching its status or history.
    pub fn transfer_task(
        &self,
        actor: &Actor,
        task_id: &str,
        assignees: Assignees,
        reason: Option<&str>,
    ) -> Result<Outcome<TaskReport>> {
        let board = self.load_board()?;
        let task = board.resolve_task(task_id)?;

        if let Some(reason) = closed_project(&board, &task.stage_id) {
            return Ok(Outcome::Blocked(reason));
        }
        if !task.assigned_to.contains(&actor.id)
            && !self.capabilities.allows(actor, Permission::Transfer)
        {
            return Ok(Outcome::Blocked(BlockReason::NotPermitted {
                actor: actor.to_string(),
                permission: Permission::Transfer,
            }));
        }
        if task.assigned_to == assignees {
            return Ok(Outcome::Unchanged(TaskReport::from_board(&board, task.clone())));
        }

        let now = Utc::now();
        let updated = Task {
            assigned_to: assignees.clone(),
            ..task.clone()
        };
        let mut content = format!(
            "Transferred from {} to {} by {}",
            task.assigned_to, assignees, actor.name
        );
        if let Some(reason) = non_empty(reason) {
            content.push_str(&format!(": {reason}"));
        }
        let comment = self.build_comment(&task.id, content, actor, now);

        let mut change = ChangeSet::new();
        change.expect_task_exists(&task.id);
        expect_open(&board, &task.stage_id, &mut change);
        change.patch_task(TaskPatch {
            assigned_to: Some(assignees.clone()),
            ..TaskPatch::new(&task.id)
        });
        change.comments.push(comment.clone());
        let receipt = self.commit(&change)?;

        let current = receipt.board.task(&task.id).cloned().unwrap_or(updated);
        let mut report = TaskReport::from_board(&receipt.board, current);
        report.comment = Some(comment);
        if !receipt.applied {
            return Ok(Outcome::Unchanged(report));
        }

        info!(task_id = %task.id, to = %assignees, actor = %actor.id, "task transferred");
        let newcomers: Vec<&str> = assignees
            .iter()
            .filter(|id| !task.assigned_to.contains(id))
            .collect();
        report.notifications = assignment_notifications(&report.task)
            .into_iter()
            .filter(|note| newcomers.contains(&note.recipient_user_id.as_str()))
            .collect();
        self.notify(&report.notifications);
        Ok(Outcome::Applied(report))
    }

    /// Set or clear the predecessor a task waits on.
    pub fn set_predecessor(
        &self,
        actor: &Actor,
        task_id: &str,
        predecessor_id: Option<&str>,
    ) -> Result<Outcome<TaskReport>> {
        let board = self.load_board()?;
        let task = board.resolve_task(task_id)?;

        if let Some(reason) = closed_project(&board, &task.stage_id) {
            return Ok(Outcome::Blocked(reason));
        }
        let predecessor = match non_empty(predecessor_id) {
            Some(input) => {
                let predecessor = board.resolve_task(input)?;
                if predecessor.id == task.id {
                    return Err(Error::InvalidArgument(
                        "a task cannot depend on itself".to_string(),
                    ));
                }
                if would_cycle(&task.id, &predecessor.id, &board) {
                    return Err(Error::InvalidArgument(format!(
                        "making {} a predecessor of {} would create a cycle",
                        predecessor.id, task.id
                    )));
                }
                Some(predecessor.id.clone())
            }
            None => None,
        };
        if task.predecessor_id() == predecessor.as_deref() {
            return Ok(Outcome::Unchanged(TaskReport::from_board(&board, task.clone())));
        }

        let mut change = ChangeSet::new();
        change.expect_task_exists(&task.id);
        expect_open(&board, &task.stage_id, &mut change);
        if let Some(predecessor_id) = &predecessor {
            change.expect_task_exists(predecessor_id);
            change.expect_acyclic(&task.id, predecessor_id);
        }
        change.patch_task(TaskPatch {
            parent_task_id: Some(predecessor.clone()),
            ..TaskPatch::new(&task.id)
        });
        let receipt = self.commit(&change)?;
        debug!(task_id = %task.id, actor = %actor.id, predecessor = ?predecessor, "predecessor updated");

        let updated = Task {
            parent_task_id: predecessor,
            ..task.clone()
        };
        let current = receipt.board.task(&task.id).cloned().unwrap_or(updated);
        let report = TaskReport::from_board(&receipt.board, current);
        Ok(applied_or_unchanged(receipt.applied, report))
    }

    /// Add a comment, optionally threaded under another comment of the same
    /// task, and notify a mentioned user.
    pub fn add_comment(&self, actor: &Actor, task_id: &str, new: NewComment) -> Result<CommentReport> {
        let content = non_empty(Some(new.content.as_str()))
            .ok_or_else(|| Error::InvalidArgument("comment cannot be empty".to_string()))?
            .to_string();
        let board = self.load_board()?;
        let task = board.resolve_task(task_id)?;

        let parent_id = match non_empty(new.parent_id.as_deref()) {
            Some(input) => {
                let parent = board.resolve_comment(input)?;
                if parent.task_id != task.id {
                    return Err(Error::InvalidArgument(format!(
                        "comment {} belongs to another task",
                        parent.id
                    )));
                }
                Some(parent.id.clone())
            }
            None => None,
        };

        let mut comment = self.build_comment(&task.id, content, actor, Utc::now());
        comment.parent_id = parent_id;
        comment.mentioned_user_id = non_empty(new.mentioned_user_id.as_deref()).map(str::to_string);
        comment.attachment_url = non_empty(new.attachment_url.as_deref()).map(str::to_string);

        let mut change = ChangeSet::new();
        change.expect_task_exists(&task.id);
        change.comments.push(comment.clone());
        let applied = self.commit(&change)?.applied;

        let notifications = match (&comment.mentioned_user_id, applied) {
            (Some(user_id), true) => vec![Notification {
                recipient_user_id: user_id.clone(),
                kind: NotificationKind::Mention,
                title: "You were mentioned".to_string(),
                message: format!("{} mentioned you on \"{}\"", actor.name, task.title),
                related_task_id: Some(task.id.clone()),
                priority: task.priority,
            }],
            _ => Vec::new(),
        };
        self.notify(&notifications);
        Ok(CommentReport {
            comment,
            notifications,
        })
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Create a project, optionally with an initial tree of stages and tasks.
    pub fn create_project(&self, actor: &Actor, new: NewProject) -> Result<Outcome<ProjectReport>> {
        if let Some(reason) = self.deny(actor, Permission::Manage) {
            return Ok(Outcome::Blocked(reason));
        }
        let name = required(&new.name, "project name")?;
        let board = self.load_board()?;
        let now = Utc::now();

        let project = Project {
            id: self.store.generate_id(IdKind::Project),
            name,
            description: new.description.trim().to_string(),
            status: ProjectStatus::Planning,
            priority: new.priority,
            created_at: now,
            created_by: actor.id.clone(),
        };
        let mut change = ChangeSet::new();
        change.projects.push(project.clone());

        let mut stage_ids = Vec::new();
        for (idx, stage) in new.stages.into_iter().enumerate() {
            let order = stage.order.unwrap_or(idx as i32);
            let stage = self.build_stage(&board, actor, &project.id, stage, order, now, &mut change)?;
            stage_ids.push(stage);
        }

        for stage_id in &stage_ids {
            change.recompute_stage(stage_id);
        }
        change.recompute_project(&project.id);
        let receipt = self.commit(&change)?;

        let project = receipt.board.project(&project.id).cloned().unwrap_or(project);
        info!(project_id = %project.id, actor = %actor.id, "project created");
        let report = ProjectReport::from_board(&receipt.board, project);
        if !receipt.applied {
            return Ok(Outcome::Unchanged(report));
        }
        let notifications: Vec<Notification> =
            report.tasks.iter().flat_map(assignment_notifications).collect();
        self.notify(&notifications);
        Ok(Outcome::Applied(report))
    }

    /// Append a stage (and its tasks) to a project.
    pub fn add_stage(&self, actor: &Actor, project_id: &str, new: NewStage) -> Result<Outcome<StageReport>> {
        if let Some(reason) = self.deny(actor, Permission::Manage) {
            return Ok(Outcome::Blocked(reason));
        }
        let board = self.load_board()?;
        let project = board.resolve_project(project_id)?;
        if let Some(reason) = closed(project) {
            return Ok(Outcome::Blocked(reason));
        }

        let order = match new.order {
            Some(order) => order,
            None => board
                .stages_of(&project.id)
                .iter()
                .map(|stage| stage.order + 1)
                .max()
                .unwrap_or(0),
        };
        let now = Utc::now();
        let mut change = ChangeSet::new();
        let stage_id = self.build_stage(&board, actor, &project.id, new, order, now, &mut change)?;
        change.expect_project_open(&project.id);
        change.recompute_stage(&stage_id);
        let receipt = self.commit(&change)?;

        let Some(stage) = receipt.board.stage(&stage_id).cloned() else {
            return Err(Error::not_found(EntityKind::Stage, stage_id));
        };
        info!(stage_id = %stage.id, project_id = %project.id, actor = %actor.id, "stage added");
        let report = StageReport::from_board(&receipt.board, stage);
        if !receipt.applied {
            return Ok(Outcome::Unchanged(report));
        }
        let notifications: Vec<Notification> =
            report.tasks.iter().flat_map(assignment_notifications).collect();
        self.notify(&notifications);
        Ok(Outcome::Applied(report))
    }

    /// Add a pending task to a stage.
    pub fn add_task(&self, actor: &Actor, stage_id: &str, new: NewTask) -> Result<Outcome<TaskReport>> {
        let board = self.load_board()?;
        let stage = board.resolve_stage(stage_id)?;
        if let Some(reason) = closed_project(&board, &stage.id) {
            return Ok(Outcome::Blocked(reason));
        }

        let task = self.build_task(&board, actor, &stage.id, new, Utc::now())?;
        let mut change = ChangeSet::new();
        change.expect_stage_exists(&stage.id);
        expect_open(&board, &stage.id, &mut change);
        change.tasks.push(task.clone());
        change.recompute_stage(&stage.id);
        let receipt = self.commit(&change)?;

        let mut report = TaskReport::from_board(&receipt.board, task);
        if !receipt.applied {
            return Ok(Outcome::Unchanged(report));
        }
        info!(task_id = %report.task.id, stage_id = %stage.id, actor = %actor.id, "task added");
        report.notifications = assignment_notifications(&report.task);
        self.notify(&report.notifications);
        Ok(Outcome::Applied(report))
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Delete a task and its comments, clearing links from dependent tasks.
    pub fn delete_task(&self, actor: &Actor, task_id: &str) -> Result<Outcome<DeleteReport>> {
        if let Some(reason) = self.deny(actor, Permission::Manage) {
            return Ok(Outcome::Blocked(reason));
        }
        let board = self.load_board()?;
        let task = board.resolve_task(task_id)?;

        let removed: BTreeSet<&str> = [task.id.as_str()].into_iter().collect();
        let mut change = ChangeSet::new();
        change.deleted_tasks.push(task.id.clone());
        let detached = detach_dependents(&board, &removed, &mut change);

        change.recompute_stage(&task.stage_id);
        let receipt = self.commit(&change)?;
        info!(task_id = %task.id, actor = %actor.id, "task deleted");

        let stage = receipt.board.stage(&task.stage_id).cloned();
        let project = stage
            .as_ref()
            .and_then(|stage| receipt.board.project(&stage.project_id))
            .cloned();
        let report = DeleteReport {
            kind: EntityKind::Task,
            id: task.id.clone(),
            removed_stages: 0,
            removed_tasks: 1,
            removed_comments: board.comments_of(&task.id).len(),
            detached_dependents: detached,
            stage,
            project,
        };
        Ok(applied_or_unchanged(receipt.applied, report))
    }

    /// Delete a stage with its tasks and comments.
    pub fn delete_stage(&self, actor: &Actor, stage_id: &str) -> Result<Outcome<DeleteReport>> {
        if let Some(reason) = self.deny(actor, Permission::Manage) {
            return Ok(Outcome::Blocked(reason));
        }
        let board = self.load_board()?;
        let stage = board.resolve_stage(stage_id)?;

        let tasks = board.tasks_of(&stage.id);
        let removed: BTreeSet<&str> = tasks.iter().map(|task| task.id.as_str()).collect();
        let mut change = ChangeSet::new();
        change.deleted_stages.push(stage.id.clone());
        let detached = detach_dependents(&board, &removed, &mut change);

        change.recompute_project(&stage.project_id);
        let receipt = self.commit(&change)?;
        info!(stage_id = %stage.id, actor = %actor.id, "stage deleted");

        let report = DeleteReport {
            kind: EntityKind::Stage,
            id: stage.id.clone(),
            removed_stages: 1,
            removed_tasks: removed.len(),
            removed_comments: count_comments(&board, &removed),
            detached_dependents: detached,
            stage: None,
            project: receipt.board.project(&stage.project_id).cloned(),
        };
        Ok(applied_or_unchanged(receipt.applied, report))
    }

    /// Delete a project and everything below it.
    pub fn delete_project(&self, actor: &Actor, project_id: &str) -> Result<Outcome<DeleteReport>> {
        if let Some(reason) = self.deny(actor, Permission::Manage) {
            return Ok(Outcome::Blocked(reason));
        }
        let board = self.load_board()?;
        let project = board.resolve_project(project_id)?;

        let stages = board.stages_of(&project.id);
        let tasks = board.project_tasks(&project.id);
        let removed: BTreeSet<&str> = tasks.iter().map(|task| task.id.as_str()).collect();
        let mut change = ChangeSet::new();
        change.deleted_projects.push(project.id.clone());
        let detached = detach_dependents(&board, &removed, &mut change);

        let applied = self.commit(&change)?.applied;
        info!(project_id = %project.id, actor = %actor.id, "project deleted");

        let report = DeleteReport {
            kind: EntityKind::Project,
            id: project.id.clone(),
            removed_stages: stages.len(),
            removed_tasks: removed.len(),
            removed_comments: count_comments(&board, &removed),
            detached_dependents: detached,
            stage: None,
            project: None,
        };
        Ok(applied_or_unchanged(applied, report))
    }

    // =========================================================================
    // Stage and project sign-off
    // =========================================================================

    /// Sign off a stage that requires approval.
    pub fn approve_stage(&self, actor: &Actor, stage_id: &str) -> Result<Outcome<StageReport>> {
        let board = self.load_board()?;
        let stage = board.resolve_stage(stage_id)?;
        if let Some(reason) = closed_project(&board, &stage.id) {
            return Ok(Outcome::Blocked(reason));
        }

        let tasks = board.tasks_of(&stage.id);
        let status = match crate::stage::approve_stage(stage, &tasks, actor, &self.capabilities) {
            Ok(status) => status,
            Err(reason) => {
                info!(stage_id = %stage.id, %reason, "stage approval blocked");
                return Ok(Outcome::Blocked(reason));
            }
        };

        let mut change = ChangeSet::new();
        change.expect_stage_status(&stage.id, stage.status);
        for task in &tasks {
            change.expect_task(task);
        }
        expect_open(&board, &stage.id, &mut change);
        change.stages.push(Stage {
            status,
            ..stage.clone()
        });
        change.recompute_stage(&stage.id);
        let receipt = self.commit(&change)?;
        info!(stage_id = %stage.id, %status, actor = %actor.id, "stage approved");

        let Some(updated) = receipt.board.stage(&stage.id).cloned() else {
            return Err(Error::not_found(EntityKind::Stage, stage.id.clone()));
        };
        let report = StageReport::from_board(&receipt.board, updated);
        Ok(applied_or_unchanged(receipt.applied, report))
    }

    /// Force-complete every task and stage and close the project for good.
    pub fn close_project(&self, actor: &Actor, project_id: &str) -> Result<Outcome<ProjectReport>> {
        let board = self.load_board()?;
        let project = board.resolve_project(project_id)?;
        let stages = board.stages_of(&project.id);
        let tasks = board.project_tasks(&project.id);

        let plan = match plan_close(project, &stages, &tasks, actor, &self.capabilities, Utc::now()) {
            Ok(plan) => plan,
            Err(reason) => {
                info!(project_id = %project.id, %reason, "project close blocked");
                return Ok(Outcome::Blocked(reason));
            }
        };

        let mut change = ChangeSet::new();
        change.expect_project_open(&project.id);
        change.expect_project_children(&project.id, &stages, &tasks);
        for task in &tasks {
            change.expect_task(task);
        }
        change.projects.push(plan.project.clone());
        change.stages.extend(plan.stages.iter().cloned());
        for task in &plan.tasks {
            change.patch_task(TaskPatch {
                status: StatusChange::of(task),
                ..TaskPatch::new(&task.id)
            });
        }
        let receipt = self.commit(&change)?;
        info!(
            project_id = %project.id,
            forced_tasks = plan.tasks.len(),
            actor = %actor.id,
            "project closed"
        );
        let closed = receipt
            .board
            .project(&project.id)
            .cloned()
            .unwrap_or(plan.project);
        let report = ProjectReport::from_board(&receipt.board, closed);
        if receipt.applied {
            let notifications: Vec<Notification> =
                plan.tasks.iter().flat_map(status_change_notifications).collect();
            self.notify(&notifications);
        }
        Ok(applied_or_unchanged(receipt.applied, report))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn pending_approvals(&self, actor: &Actor) -> Result<Vec<ApprovalItem>> {
        let board = self.load_board()?;
        Ok(approvals::list_pending_approvals(&board, actor, &self.capabilities))
    }

    /// Scan due dates and deliver the resulting notifications.
    pub fn scan_deadlines(&self, now: DateTime<Utc>, window: Duration) -> Result<Vec<Notification>> {
        let board = self.load_board()?;
        let notifications = deadlines::scan_deadlines(&board, now, window)?;
        debug!(count = notifications.len(), "deadline scan finished");
        self.notify(&notifications);
        Ok(notifications)
    }

    pub fn task_details(&self, task_id: &str) -> Result<TaskDetails> {
        let board = self.load_board()?;
        let task = board.resolve_task(task_id)?;
        let report = TaskReport::from_board(&board, task.clone());

        let start_blocked_by = if machine::check_edge(task, TaskStatus::InProgress).is_ok() {
            dependency::can_start(task, &board).err()
        } else {
            None
        };

        Ok(TaskDetails {
            task: task.clone(),
            stage: report.stage,
            project: report.project,
            comments: board.comments_of(&task.id).into_iter().cloned().collect(),
            dependents: board
                .dependents_of(&task.id)
                .into_iter()
                .map(|dependent| dependent.id.clone())
                .collect(),
            start_blocked_by,
        })
    }

    pub fn project_details(&self, project_id: &str) -> Result<ProjectReport> {
        let board = self.load_board()?;
        let project = board.resolve_project(project_id)?;
        Ok(ProjectReport::from_board(&board, project.clone()))
    }

    pub fn stage_details(&self, stage_id: &str) -> Result<StageReport> {
        let board = self.load_board()?;
        let stage = board.resolve_stage(stage_id)?;
        Ok(StageReport::from_board(&board, stage.clone()))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn deny(&self, actor: &Actor, permission: Permission) -> Option<BlockReason> {
        if self.capabilities.allows(actor, permission) {
            None
        } else {
            Some(BlockReason::NotPermitted {
                actor: actor.to_string(),
                permission,
            })
        }
    }

    fn commit(&self, change: &ChangeSet) -> Result<CommitReceipt> {
        let receipt = self.store.commit(change)?;
        if !receipt.applied {
            info!(op_id = %change.op_id, "operation already applied; notifications suppressed");
        }
        Ok(receipt)
    }

    fn notify(&self, notifications: &[Notification]) {
        for notification in notifications {
            if let Err(err) = self.sink.deliver(notification) {
                warn!(
                    recipient = %notification.recipient_user_id,
                    kind = %notification.kind,
                    error = %err,
                    "notification delivery failed"
                );
            }
        }
    }

    fn build_comment(&self, task_id: &str, content: String, actor: &Actor, now: DateTime<Utc>) -> Comment {
        Comment {
            id: self.store.generate_id(IdKind::Comment),
            task_id: task_id.to_string(),
            content,
            author_id: actor.id.clone(),
            created_at: now,
            parent_id: None,
            mentioned_user_id: None,
            attachment_url: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_stage(
        &self,
        board: &Board,
        actor: &Actor,
        project_id: &str,
        new: NewStage,
        order: i32,
        now: DateTime<Utc>,
        change: &mut ChangeSet,
    ) -> Result<String> {
        let stage = Stage {
            id: self.store.generate_id(IdKind::Stage),
            project_id: project_id.to_string(),
            name: required(&new.name, "stage name")?,
            description: new.description.trim().to_string(),
            order,
            requires_approval: new.requires_approval,
            status: StageStatus::Pending,
            created_at: now,
        };
        for task in new.tasks {
            let task = self.build_task(board, actor, &stage.id, task, now)?;
            change.tasks.push(task);
        }
        let stage_id = stage.id.clone();
        change.stages.push(stage);
        Ok(stage_id)
    }

    fn build_task(
        &self,
        board: &Board,
        actor: &Actor,
        stage_id: &str,
        new: NewTask,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let title = required(&new.title, "task title")?;
        let parent_task_id = match non_empty(new.parent_task_id.as_deref()) {
            Some(input) => Some(board.resolve_task(input)?.id.clone()),
            None => None,
        };
        if let (Some(start), Some(due)) = (new.start_date, new.due_date) {
            if due < start {
                return Err(Error::InvalidArgument(
                    "due date cannot be before start date".to_string(),
                ));
            }
        }

        Ok(Task {
            id: self.store.generate_id(IdKind::Task),
            stage_id: stage_id.to_string(),
            title,
            description: new.description.trim().to_string(),
            status: TaskStatus::Pending,
            priority: new.priority,
            assigned_to: new.assigned_to,
            created_by: actor.id.clone(),
            created_at: now,
            start_date: new.start_date,
            due_date: new.due_date,
            completed_at: None,
            approved_by: None,
            approved_at: None,
            requires_approval: new.requires_approval,
            parent_task_id,
            status_history: vec![StatusHistoryEntry {
                status: TaskStatus::Pending,
                user_id: actor.id.clone(),
                user_name: actor.name.clone(),
                timestamp: now,
            }],
        })
    }
}

/// Clear predecessor links that point into `removed` from tasks that stay.
fn detach_dependents(board: &Board, removed: &BTreeSet<&str>, change: &mut ChangeSet) -> Vec<String> {
    let mut detached = Vec::new();
    for task in &board.tasks {
        if removed.contains(task.id.as_str()) {
            continue;
        }
        let Some(predecessor) = task.predecessor_id() else {
            continue;
        };
        if removed.contains(predecessor) {
            detached.push(task.id.clone());
            change.patch_task(TaskPatch {
                parent_task_id: Some(None),
                ..TaskPatch::new(&task.id)
            });
        }
    }
    detached
}

fn count_comments(board: &Board, tasks: &BTreeSet<&str>) -> usize {
    board
        .comments
        .iter()
        .filter(|comment| tasks.contains(comment.task_id.as_str()))
        .count()
}

fn closed(project: &Project) -> Option<BlockReason> {
    (project.status == ProjectStatus::Closed).then(|| BlockReason::ProjectClosed {
        project_id: project.id.clone(),
        project_name: project.name.clone(),
    })
}

/// Refuse the commit if the stage's project was closed in the meantime.
fn expect_open(board: &Board, stage_id: &str, change: &mut ChangeSet) {
    if let Some(project) = board
        .stage(stage_id)
        .and_then(|stage| board.project(&stage.project_id))
    {
        change.expect_project_open(&project.id);
    }
}

fn closed_project(board: &Board, stage_id: &str) -> Option<BlockReason> {
    let stage = board.stage(stage_id)?;
    board.project(&stage.project_id).and_then(closed)
}

fn assignment_notifications(task: &Task) -> Vec<Notification> {
    Notification::for_assignees(
        task,
        NotificationKind::TaskAssigned,
        "Task assigned",
        &format!("You were assigned \"{}\"", task.title),
    )
}

fn applied_or_unchanged<T>(applied: bool, value: T) -> Outcome<T> {
    if applied {
        Outcome::Applied(value)
    } else {
        Outcome::Unchanged(value)
    }
}

fn required(value: &str, field: &str) -> Result<String> {
    non_empty(Some(value))
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidArgument(format!("{field} cannot be empty")))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::events::MemorySink;
    use crate::store::MemoryStore;

    fn manager() -> Actor {
        Actor::new("u-2", "Ana", ["manager"])
    }

    fn workflow() -> (Workflow<MemoryStore>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let workflow = Workflow::new(MemoryStore::new(), Capabilities::default())
            .with_sink(sink.clone())
            .with_read_retries(2, 0);
        (workflow, sink)
    }

    fn seed(workflow: &Workflow<MemoryStore>, requires_approval: bool) -> ProjectReport {
        let assignee = Assignees::single("u-1").expect("assignees");
        let mut stage = NewStage::new("Build");
        stage.requires_approval = requires_approval;
        stage.tasks = vec![
            NewTask::new("First", assignee.clone()),
            NewTask::new("Second", assignee),
        ];
        let new = NewProject {
            name: "Launch".to_string(),
            stages: vec![stage],
            ..NewProject::default()
        };
        workflow
            .create_project(&manager(), new)
            .expect("create project")
            .into_result()
            .expect("not blocked")
    }

    #[test]
    fn created_tasks_start_pending_with_history() {
        let (workflow, sink) = workflow();
        let report = seed(&workflow, false);
        assert_eq!(report.project.status, ProjectStatus::Planning);
        assert_eq!(report.stages.len(), 1);
        assert_eq!(report.tasks.len(), 2);
        for task in &report.tasks {
            assert_eq!(task.status, TaskStatus::Pending);
            assert_eq!(task.status_history.len(), 1);
        }
        assert_eq!(sink.delivered().len(), 2);
    }

    #[test]
    fn create_project_needs_manage() {
        let (workflow, _) = workflow();
        let outcome = workflow
            .create_project(&Actor::new("u-1", "Jon", ["user"]), NewProject::default())
            .expect("create");
        assert!(matches!(
            outcome.blocked(),
            Some(BlockReason::NotPermitted { permission: Permission::Manage, .. })
        ));
    }

    #[test]
    fn load_board_retries_transient_failures() {
        let (workflow, _) = workflow();
        workflow.store().fail_next_loads(2);
        assert!(workflow.load_board().is_ok());

        workflow.store().fail_next_loads(3);
        assert!(matches!(workflow.load_board(), Err(Error::StoreUnavailable(_))));
    }

    #[test]
    fn replayed_op_id_is_unchanged() {
        let (workflow, sink) = workflow();
        let report = seed(&workflow, false);
        let task_id = report.tasks[0].id.clone();
        let before = sink.delivered().len();

        let request = TransitionRequest::new(&task_id, TaskStatus::InProgress).with_op_id("op-42");
        assert!(workflow
            .transition(&manager(), request.clone())
            .expect("first")
            .is_applied());
        let replay = workflow.transition(&manager(), request).expect("replay");
        assert!(matches!(replay, Outcome::Unchanged(_)));

        let task = workflow.task_details(&task_id).expect("details").task;
        assert_eq!(task.status_history.len(), 2);
        assert_eq!(sink.delivered().len(), before + 1);
    }

    #[test]
    fn cascade_moves_stage_and_project() {
        let (workflow, _) = workflow();
        let report = seed(&workflow, false);
        let actor = manager();

        for task in &report.tasks {
            let started = workflow
                .start_task(&actor, &task.id)
                .expect("start")
                .into_result()
                .expect("started");
            assert_eq!(
                started.project.map(|p| p.status),
                Some(ProjectStatus::InProgress)
            );
        }
        let mut last = None;
        for task in &report.tasks {
            last = Some(
                workflow
                    .transition(&actor, TransitionRequest::new(&task.id, TaskStatus::Completed))
                    .expect("complete")
                    .into_result()
                    .expect("completed"),
            );
        }
        let last = last.expect("report");
        assert_eq!(last.stage.map(|s| s.status), Some(StageStatus::Completed));
        assert_eq!(last.project.map(|p| p.status), Some(ProjectStatus::Completed));
    }

    #[test]
    fn delete_task_detaches_dependents() {
        let (workflow, _) = workflow();
        let report = seed(&workflow, false);
        let (first, second) = (&report.tasks[0], &report.tasks[1]);
        workflow
            .set_predecessor(&manager(), &second.id, Some(first.id.as_str()))
            .expect("link")
            .into_result()
            .expect("linked");

        let deleted = workflow
            .delete_task(&manager(), &first.id)
            .expect("delete")
            .into_result()
            .expect("deleted");
        assert_eq!(deleted.detached_dependents, vec![second.id.clone()]);
        let remaining = workflow.task_details(&second.id).expect("details").task;
        assert_eq!(remaining.parent_task_id, None);
    }

    #[test]
    fn set_predecessor_rejects_cycles() {
        let (workflow, _) = workflow();
        let report = seed(&workflow, false);
        let (first, second) = (&report.tasks[0], &report.tasks[1]);
        workflow
            .set_predecessor(&manager(), &second.id, Some(first.id.as_str()))
            .expect("link");
        assert!(matches!(
            workflow.set_predecessor(&manager(), &first.id, Some(second.id.as_str())),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            workflow.set_predecessor(&manager(), &first.id, Some(first.id.as_str())),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn comment_threading_stays_within_task() {
        let (workflow, sink) = workflow();
        let report = seed(&workflow, false);
        let actor = manager();
        let root = workflow
            .add_comment(&actor, &report.tasks[0].id, NewComment::new("root"))
            .expect("root comment");

        let mut foreign = NewComment::new("reply");
        foreign.parent_id = Some(root.comment.id.clone());
        assert!(matches!(
            workflow.add_comment(&actor, &report.tasks[1].id, foreign),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            workflow.add_comment(&actor, &report.tasks[0].id, NewComment::new("  ")),
            Err(Error::InvalidArgument(_))
        ));

        let before = sink.delivered().len();
        let mut reply = NewComment::new("see this");
        reply.parent_id = Some(root.comment.id.clone());
        reply.mentioned_user_id = Some("u-7".to_string());
        let reply = workflow
            .add_comment(&actor, &report.tasks[0].id, reply)
            .expect("reply");
        assert_eq!(reply.comment.parent_id.as_deref(), Some(root.comment.id.as_str()));
        let delivered = sink.delivered();
        assert_eq!(delivered.len(), before + 1);
        assert_eq!(delivered[before].kind, NotificationKind::Mention);
        assert_eq!(delivered[before].recipient_user_id, "u-7");
    }
}
