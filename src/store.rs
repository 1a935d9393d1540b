//! Store collaborator.
//!
//! The workflow reads a [`Board`] snapshot and writes back a single
//! [`ChangeSet`] per operation. A commit is all-or-nothing and runs under
//! the store's lock against the board as it is at that moment:
//!
//! - expectations recorded from the snapshot are checked first, and a
//!   stale one fails the commit with [`Error::Conflict`]
//! - new rows are inserted, edits to existing tasks land as field-level
//!   [`TaskPatch`]es, and deletions cascade
//! - the stages and projects named in the change set are re-derived from
//!   their current children
//!
//! Every change set carries an operation id. A store that has already
//! applied an id reports `applied: false` and leaves the board alone, so a
//! retried mutation cannot append history twice.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;
use ulid::Ulid;
use uuid::Uuid;

use crate::board::Board;
use crate::config::Config;
use crate::dependency::would_cycle;
use crate::error::{Error, Result};
use crate::lock::FileLock;
use crate::model::{
    Assignees, Comment, Project, ProjectStatus, Stage, StageStatus, StatusHistoryEntry, Task,
    TaskStatus,
};
use crate::storage::{Storage, APPLIED_OPS_LIMIT};

/// Row kind for generated ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Project,
    Stage,
    Task,
    Comment,
}

impl IdKind {
    pub fn prefix(self) -> &'static str {
        match self {
            IdKind::Project => "prj",
            IdKind::Stage => "stg",
            IdKind::Task => "tsk",
            IdKind::Comment => "cmt",
        }
    }
}

/// Fresh `<prefix>-<ulid>` id.
pub fn new_id(kind: IdKind) -> String {
    let raw = Ulid::new().to_string().to_ascii_lowercase();
    format!("{}-{}", kind.prefix(), raw)
}

/// Status fields written by one accepted transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: TaskStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    /// Appended to the history, never replacing what is there.
    pub entry: StatusHistoryEntry,
}

impl StatusChange {
    /// Status fields of `task` together with its newest history entry.
    pub fn of(task: &Task) -> Option<Self> {
        let entry = task.status_history.last()?.clone();
        Some(Self {
            status: task.status,
            completed_at: task.completed_at,
            approved_by: task.approved_by.clone(),
            approved_at: task.approved_at,
            entry,
        })
    }
}

/// Edit of a task row, applied to whatever row is current at commit time.
///
/// Fields left `None` are not touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub task_id: String,
    pub status: Option<StatusChange>,
    pub assigned_to: Option<Assignees>,
    pub parent_task_id: Option<Option<String>>,
}

impl TaskPatch {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Self::default()
        }
    }

    pub fn apply_to(&self, task: &mut Task) {
        if let Some(change) = &self.status {
            task.status = change.status;
            task.completed_at = change.completed_at;
            task.approved_by = change.approved_by.clone();
            task.approved_at = change.approved_at;
            task.status_history.push(change.entry.clone());
        }
        if let Some(assignees) = &self.assigned_to {
            task.assigned_to = assignees.clone();
        }
        if let Some(parent) = &self.parent_task_id {
            task.parent_task_id = parent.clone();
        }
    }
}

/// State a change set was decided against.
#[derive(Debug, Clone, PartialEq)]
pub enum Expectation {
    /// Task still has this status and this many history entries.
    Task {
        task_id: String,
        status: TaskStatus,
        history_len: usize,
    },
    TaskExists { task_id: String },
    StageExists { stage_id: String },
    ProjectOpen { project_id: String },
    StageStatus { stage_id: String, status: StageStatus },
    /// Linking `task_id` after `predecessor_id` still closes no loop.
    Acyclic {
        task_id: String,
        predecessor_id: String,
    },
    /// Project still holds exactly these stages and tasks.
    ProjectChildren {
        project_id: String,
        stage_ids: BTreeSet<String>,
        task_ids: BTreeSet<String>,
    },
}

impl Expectation {
    fn check(&self, board: &Board) -> Result<()> {
        match self {
            Expectation::Task {
                task_id,
                status,
                history_len,
            } => {
                let task = board
                    .task(task_id)
                    .ok_or_else(|| Error::Conflict(format!("task {task_id} no longer exists")))?;
                if task.status != *status {
                    return Err(Error::Conflict(format!(
                        "task {task_id} is {} (expected {status})",
                        task.status
                    )));
                }
                if task.status_history.len() != *history_len {
                    return Err(Error::Conflict(format!(
                        "task {task_id} changed status since it was read"
                    )));
                }
            }
            Expectation::TaskExists { task_id } => {
                if board.task(task_id).is_none() {
                    return Err(Error::Conflict(format!("task {task_id} no longer exists")));
                }
            }
            Expectation::StageExists { stage_id } => {
                if board.stage(stage_id).is_none() {
                    return Err(Error::Conflict(format!("stage {stage_id} no longer exists")));
                }
            }
            Expectation::ProjectOpen { project_id } => match board.project(project_id) {
                Some(project) if project.status == ProjectStatus::Closed => {
                    return Err(Error::Conflict(format!("project {project_id} was closed")));
                }
                Some(_) => {}
                None => {
                    return Err(Error::Conflict(format!(
                        "project {project_id} no longer exists"
                    )));
                }
            },
            Expectation::StageStatus { stage_id, status } => {
                let stage = board
                    .stage(stage_id)
                    .ok_or_else(|| Error::Conflict(format!("stage {stage_id} no longer exists")))?;
                if stage.status != *status {
                    return Err(Error::Conflict(format!(
                        "stage {stage_id} is {} (expected {status})",
                        stage.status
                    )));
                }
            }
            Expectation::Acyclic {
                task_id,
                predecessor_id,
            } => {
                if would_cycle(task_id, predecessor_id, board) {
                    return Err(Error::Conflict(format!(
                        "linking {task_id} after {predecessor_id} now closes a cycle"
                    )));
                }
            }
            Expectation::ProjectChildren {
                project_id,
                stage_ids,
                task_ids,
            } => {
                let stages: BTreeSet<String> = board
                    .stages_of(project_id)
                    .into_iter()
                    .map(|stage| stage.id.clone())
                    .collect();
                let tasks: BTreeSet<String> = board
                    .project_tasks(project_id)
                    .into_iter()
                    .map(|task| task.id.clone())
                    .collect();
                if stages != *stage_ids || tasks != *task_ids {
                    return Err(Error::Conflict(format!(
                        "stages or tasks of project {project_id} changed since they were read"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Everything one operation writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub op_id: String,
    /// Rows inserted, or replaced whole.
    pub projects: Vec<Project>,
    pub stages: Vec<Stage>,
    pub tasks: Vec<Task>,
    pub comments: Vec<Comment>,
    pub task_patches: Vec<TaskPatch>,
    pub deleted_projects: Vec<String>,
    pub deleted_stages: Vec<String>,
    pub deleted_tasks: Vec<String>,
    /// Stages to re-derive once the rows above land. Their projects follow.
    pub recompute_stages: Vec<String>,
    pub recompute_projects: Vec<String>,
    pub expectations: Vec<Expectation>,
}

impl ChangeSet {
    /// Empty change set with a fresh operation id.
    pub fn new() -> Self {
        Self::with_op_id(Uuid::new_v4().to_string())
    }

    pub fn with_op_id(op_id: impl Into<String>) -> Self {
        Self {
            op_id: op_id.into(),
            ..Self::default()
        }
    }

    /// Refuse the commit if the task moved since `task` was read.
    pub fn expect_task(&mut self, task: &Task) {
        self.expectations.push(Expectation::Task {
            task_id: task.id.clone(),
            status: task.status,
            history_len: task.status_history.len(),
        });
    }

    pub fn expect_task_exists(&mut self, task_id: &str) {
        self.expectations.push(Expectation::TaskExists {
            task_id: task_id.to_string(),
        });
    }

    pub fn expect_stage_exists(&mut self, stage_id: &str) {
        self.expectations.push(Expectation::StageExists {
            stage_id: stage_id.to_string(),
        });
    }

    pub fn expect_acyclic(&mut self, task_id: &str, predecessor_id: &str) {
        self.expectations.push(Expectation::Acyclic {
            task_id: task_id.to_string(),
            predecessor_id: predecessor_id.to_string(),
        });
    }

    pub fn expect_project_open(&mut self, project_id: &str) {
        self.expectations.push(Expectation::ProjectOpen {
            project_id: project_id.to_string(),
        });
    }

    pub fn expect_stage_status(&mut self, stage_id: &str, status: StageStatus) {
        self.expectations.push(Expectation::StageStatus {
            stage_id: stage_id.to_string(),
            status,
        });
    }

    pub fn expect_project_children(&mut self, project_id: &str, stages: &[&Stage], tasks: &[&Task]) {
        self.expectations.push(Expectation::ProjectChildren {
            project_id: project_id.to_string(),
            stage_ids: stages.iter().map(|stage| stage.id.clone()).collect(),
            task_ids: tasks.iter().map(|task| task.id.clone()).collect(),
        });
    }

    pub fn patch_task(&mut self, patch: TaskPatch) {
        self.task_patches.push(patch);
    }

    /// Re-derive the stage, and then its project, at commit time.
    pub fn recompute_stage(&mut self, stage_id: &str) {
        self.recompute_stages.push(stage_id.to_string());
    }

    pub fn recompute_project(&mut self, project_id: &str) {
        self.recompute_projects.push(project_id.to_string());
    }

    /// Check recorded expectations against the current board.
    pub fn check_expectations(&self, board: &Board) -> Result<()> {
        self.expectations
            .iter()
            .try_for_each(|expectation| expectation.check(board))
    }
}

/// Result of a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReceipt {
    /// `false` when the operation id had already been applied.
    pub applied: bool,
    /// Board as it stands once the commit finished.
    pub board: Board,
}

/// Persistence collaborator used by the workflow.
pub trait Store: Send + Sync {
    /// Read a full snapshot.
    fn load(&self) -> Result<Board>;

    /// Apply a change set as one unit.
    fn commit(&self, change: &ChangeSet) -> Result<CommitReceipt>;

    /// Id for a row about to be inserted.
    fn generate_id(&self, kind: IdKind) -> String {
        new_id(kind)
    }
}

impl<S: Store + ?Sized> Store for Arc<S> {
    fn load(&self) -> Result<Board> {
        (**self).load()
    }

    fn commit(&self, change: &ChangeSet) -> Result<CommitReceipt> {
        (**self).commit(change)
    }

    fn generate_id(&self, kind: IdKind) -> String {
        (**self).generate_id(kind)
    }
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    board: Board,
    applied_ops: VecDeque<String>,
    applied_index: HashSet<String>,
}

/// Store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    failing_loads: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_board(board: Board) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                board,
                ..MemoryState::default()
            }),
            failing_loads: AtomicU32::new(0),
        }
    }

    /// Make the next `count` loads fail with `StoreUnavailable`.
    pub fn fail_next_loads(&self, count: u32) {
        self.failing_loads.store(count, Ordering::SeqCst);
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| Error::StoreUnavailable("memory store poisoned".to_string()))
    }
}

impl Store for MemoryStore {
    fn load(&self) -> Result<Board> {
        let remaining = self.failing_loads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_loads.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::StoreUnavailable("simulated outage".to_string()));
        }
        Ok(self.state()?.board.clone())
    }

    fn commit(&self, change: &ChangeSet) -> Result<CommitReceipt> {
        let mut state = self.state()?;
        if state.applied_index.contains(&change.op_id) {
            debug!(op_id = %change.op_id, "operation already applied");
            return Ok(CommitReceipt {
                applied: false,
                board: state.board.clone(),
            });
        }
        change.check_expectations(&state.board)?;

        state.board.apply(change);
        state.applied_ops.push_back(change.op_id.clone());
        state.applied_index.insert(change.op_id.clone());
        while state.applied_ops.len() > APPLIED_OPS_LIMIT {
            if let Some(oldest) = state.applied_ops.pop_front() {
                state.applied_index.remove(&oldest);
            }
        }
        Ok(CommitReceipt {
            applied: true,
            board: state.board.clone(),
        })
    }
}

// =============================================================================
// File store
// =============================================================================

/// Store backed by `board.json` in a data directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    storage: Storage,
    lock_timeout_ms: u64,
}

impl FileStore {
    pub fn new(storage: Storage, lock_timeout_ms: u64) -> Self {
        Self {
            storage,
            lock_timeout_ms,
        }
    }

    /// File store for a workspace root and its configuration.
    pub fn open(root: &Path, config: &Config) -> Self {
        Self::new(Storage::for_root(root, config), config.store.lock_timeout_ms)
    }

    /// Create the data directory and an empty board if missing.
    pub fn init(&self) -> Result<bool> {
        let _lock = FileLock::acquire(self.storage.lock_file(), self.lock_timeout_ms)?;
        self.storage.init()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

impl Store for FileStore {
    fn load(&self) -> Result<Board> {
        if !self.storage.is_initialized() {
            return Err(Error::NotInitialized(self.storage.data_dir().to_path_buf()));
        }
        let _lock = FileLock::acquire(self.storage.lock_file(), self.lock_timeout_ms)?;
        Ok(self.storage.read_board_file()?.board)
    }

    fn commit(&self, change: &ChangeSet) -> Result<CommitReceipt> {
        if !self.storage.is_initialized() {
            return Err(Error::NotInitialized(self.storage.data_dir().to_path_buf()));
        }
        let _lock = FileLock::acquire(self.storage.lock_file(), self.lock_timeout_ms)?;
        let mut file = self.storage.read_board_file()?;
        if file.has_applied(&change.op_id) {
            debug!(op_id = %change.op_id, "operation already applied");
            return Ok(CommitReceipt {
                applied: false,
                board: file.board,
            });
        }
        change.check_expectations(&file.board)?;

        file.board.apply(change);
        file.record_op(&change.op_id);
        self.storage.write_board_file(&file)?;
        debug!(op_id = %change.op_id, "change set committed");
        Ok(CommitReceipt {
            applied: true,
            board: file.board,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::model::{Assignees, Priority};

    fn task(status: TaskStatus) -> Task {
        Task {
            id: "tsk-1".to_string(),
            stage_id: "stg-1".to_string(),
            title: "Survey".to_string(),
            description: String::new(),
            status,
            priority: Priority::Low,
            assigned_to: Assignees::single("u-1").expect("assignees"),
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
    fn ids_carry_kind_prefix() {
        let id = new_id(IdKind::Task);
        assert!(id.starts_with("tsk-"));
        assert_eq!(id, id.to_ascii_lowercase());
        assert_ne!(new_id(IdKind::Task), id);
        assert!(MemoryStore::new().generate_id(IdKind::Comment).starts_with("cmt-"));
    }

    #[test]
    fn memory_store_ignores_replayed_operation() {
        let store = MemoryStore::new();
        let mut change = ChangeSet::with_op_id("op-1");
        change.tasks.push(task(TaskStatus::Pending));

        assert!(store.commit(&change).expect("first").applied);
        assert!(!store.commit(&change).expect("replay").applied);
        assert_eq!(store.load().expect("load").tasks.len(), 1);
    }

    #[test]
    fn stale_expectation_is_a_conflict() {
        let store = MemoryStore::with_board(Board {
            tasks: vec![task(TaskStatus::InProgress)],
            ..Board::default()
        });
        let mut change = ChangeSet::new();
        change.expect_task(&task(TaskStatus::Pending));
        change.tasks.push(task(TaskStatus::InProgress));

        assert!(matches!(store.commit(&change), Err(Error::Conflict(_))));
    }

    #[test]
    fn history_length_detects_a_round_trip() {
        // Same status as when read, but another writer moved it away and back.
        let read = task(TaskStatus::InProgress);
        let mut current = read.clone();
        for status in [TaskStatus::Completed, TaskStatus::InProgress] {
            current.status_history.push(StatusHistoryEntry {
                status,
                user_id: "u-2".to_string(),
                user_name: "Ana".to_string(),
                timestamp: Utc::now(),
            });
        }
        let store = MemoryStore::with_board(Board {
            tasks: vec![current],
            ..Board::default()
        });

        let mut change = ChangeSet::new();
        change.expect_task(&read);
        assert!(matches!(store.commit(&change), Err(Error::Conflict(_))));
    }

    #[test]
    fn patch_keeps_fields_it_does_not_name() {
        let mut current = task(TaskStatus::InProgress);
        current.status_history.push(StatusHistoryEntry {
            status: TaskStatus::InProgress,
            user_id: "u-1".to_string(),
            user_name: "Jon".to_string(),
            timestamp: Utc::now(),
        });
        let store = MemoryStore::with_board(Board {
            tasks: vec![current],
            ..Board::default()
        });

        let mut change = ChangeSet::new();
        change.patch_task(TaskPatch {
            assigned_to: Some(Assignees::single("u-9").expect("assignees")),
            ..TaskPatch::new("tsk-1")
        });
        let receipt = store.commit(&change).expect("commit");

        let task = receipt.board.task("tsk-1").expect("task");
        assert_eq!(task.assigned_to, Assignees::single("u-9").expect("assignees"));
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.status_history.len(), 1);
    }

    #[test]
    fn closed_project_refuses_commit() {
        let store = MemoryStore::with_board(Board {
            projects: vec![Project {
                id: "prj-1".to_string(),
                name: "Launch".to_string(),
                description: String::new(),
                status: ProjectStatus::Closed,
                priority: Priority::Low,
                created_at: Utc::now(),
                created_by: "u-1".to_string(),
            }],
            ..Board::default()
        });
        let mut change = ChangeSet::new();
        change.expect_project_open("prj-1");
        assert!(matches!(store.commit(&change), Err(Error::Conflict(_))));

        let mut missing = ChangeSet::new();
        missing.expect_project_open("prj-2");
        assert!(matches!(store.commit(&missing), Err(Error::Conflict(_))));
    }

    #[test]
    fn simulated_outage_is_retryable() {
        let store = MemoryStore::new();
        store.fail_next_loads(1);
        let err = store.load().expect_err("outage");
        assert!(err.is_retryable());
        assert!(store.load().is_ok());
    }

    #[test]
    fn file_store_round_trips_and_dedupes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::open(dir.path(), &Config::default());
        assert!(matches!(store.load(), Err(Error::NotInitialized(_))));

        assert!(store.init().expect("init"));
        let mut change = ChangeSet::new();
        change.tasks.push(task(TaskStatus::Pending));
        assert!(store.commit(&change).expect("commit").applied);
        assert!(!store.commit(&change).expect("replay").applied);

        let reopened = FileStore::open(dir.path(), &Config::default());
        let board = reopened.load().expect("load");
        assert_eq!(board.tasks.len(), 1);
        assert_eq!(board.tasks[0].status, TaskStatus::Pending);
    }
}
