#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use assert_cmd::Command;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use stagegate::actor::{Actor, Capabilities};
use stagegate::board::Board;
use stagegate::error::Result;
use stagegate::events::MemorySink;
use stagegate::model::{
    Assignees, Priority, Project, ProjectStatus, Stage, StageStatus, StatusHistoryEntry, Task,
    TaskStatus,
};
use stagegate::store::{ChangeSet, CommitReceipt, MemoryStore, Store};
use stagegate::workflow::Workflow;
use tempfile::TempDir;

/// `sg` with the caller's environment scrubbed of sg settings.
pub fn sg_cmd() -> Command {
    let mut cmd = Command::cargo_bin("sg").expect("binary");
    for var in [
        "SG_DIR",
        "SG_ACTOR_ID",
        "SG_ACTOR_NAME",
        "SG_ACTOR_ROLES",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

/// Temporary workspace root for CLI tests.
pub struct TestDir {
    dir: TempDir,
}

impl TestDir {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create tempdir"),
        }
    }

    /// New workspace with `sg init` already run.
    pub fn init() -> Self {
        let dir = Self::new();
        dir.cmd().arg("init").assert().success();
        dir
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn cmd(&self) -> Command {
        let mut cmd = sg_cmd();
        cmd.current_dir(self.path());
        cmd
    }

    pub fn write_config(&self, contents: &str) -> std::io::Result<PathBuf> {
        let path = self.path().join(".stagegate.toml");
        fs::write(&path, contents)?;
        Ok(path)
    }

    /// Run with `--json` as an admin, expect success and return `data`.
    pub fn json(&self, args: &[&str]) -> Value {
        let output = self
            .cmd()
            .args(args)
            .args(["--json", "--actor", "u-admin", "--role", "admin"])
            .output()
            .expect("run sg");
        assert!(
            output.status.success(),
            "sg {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stdout)
        );
        let envelope: Value = serde_json::from_slice(&output.stdout).expect("json envelope");
        assert_eq!(envelope["status"], "success");
        envelope["data"].clone()
    }
}

pub fn actor(id: &str, roles: &[&str]) -> Actor {
    Actor::new(id, id, roles.iter().copied())
}

pub fn approver() -> Actor {
    actor("u-approver", &["aprovador"])
}

pub fn manager() -> Actor {
    actor("u-manager", &["manager"])
}

pub fn member() -> Actor {
    actor("u-1", &["user"])
}

/// Engine over an in-memory board with a collecting sink.
pub fn workflow(board: Board) -> (Workflow<MemoryStore>, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let workflow = Workflow::new(MemoryStore::with_board(board), Capabilities::default())
        .with_sink(sink.clone())
        .with_read_retries(1, 0);
    (workflow, sink)
}

type Hook = Box<dyn FnOnce() + Send>;

/// In-memory store that runs a hook just before the next commit, so another
/// writer lands between an operation's read and its commit.
pub struct InterleavedStore {
    inner: Arc<MemoryStore>,
    before_commit: Mutex<Option<Hook>>,
}

impl InterleavedStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            before_commit: Mutex::new(None),
        }
    }

    pub fn before_next_commit(&self, hook: impl FnOnce() + Send + 'static) {
        *self.before_commit.lock().expect("hook slot") = Some(Box::new(hook));
    }
}

impl Store for InterleavedStore {
    fn load(&self) -> Result<Board> {
        self.inner.load()
    }

    fn commit(&self, change: &ChangeSet) -> Result<CommitReceipt> {
        let hook = self.before_commit.lock().expect("hook slot").take();
        if let Some(hook) = hook {
            hook();
        }
        self.inner.commit(change)
    }
}

/// Engine over `store` that writes straight through, skipping any hook.
pub fn writer(store: &Arc<MemoryStore>) -> Workflow<Arc<MemoryStore>> {
    Workflow::new(Arc::clone(store), Capabilities::default())
}

/// Board built row by row with a fixed clock.
pub struct BoardBuilder {
    board: Board,
    now: DateTime<Utc>,
}

impl BoardBuilder {
    pub fn new() -> Self {
        Self {
            board: Board::default(),
            now: Utc::now() - Duration::hours(1),
        }
    }

    pub fn project(mut self, id: &str) -> Self {
        self.board.projects.push(Project {
            id: id.to_string(),
            name: format!("Project {id}"),
            description: format!("About {id}"),
            status: ProjectStatus::Planning,
            priority: Priority::Medium,
            created_at: self.now,
            created_by: "u-manager".to_string(),
        });
        self
    }

    pub fn stage(mut self, id: &str, project_id: &str, requires_approval: bool) -> Self {
        let order = self
            .board
            .stages
            .iter()
            .filter(|stage| stage.project_id == project_id)
            .count() as i32;
        self.board.stages.push(Stage {
            id: id.to_string(),
            project_id: project_id.to_string(),
            name: format!("Stage {id}"),
            description: String::new(),
            order,
            requires_approval,
            status: StageStatus::Pending,
            created_at: self.now,
        });
        self
    }

    pub fn task(self, id: &str, stage_id: &str, status: TaskStatus) -> Self {
        self.task_with(id, stage_id, status, |_| {})
    }

    pub fn task_with<F>(mut self, id: &str, stage_id: &str, status: TaskStatus, edit: F) -> Self
    where
        F: FnOnce(&mut Task),
    {
        let offset = self.board.tasks.len() as i64;
        let created_at = self.now + Duration::seconds(offset);
        let mut task = Task {
            id: id.to_string(),
            stage_id: stage_id.to_string(),
            title: format!("Task {id}"),
            description: String::new(),
            status,
            priority: Priority::Medium,
            assigned_to: Assignees::single("u-1").expect("assignees"),
            created_by: "u-manager".to_string(),
            created_at,
            start_date: None,
            due_date: None,
            completed_at: (status == TaskStatus::Completed).then_some(created_at),
            approved_by: None,
            approved_at: None,
            requires_approval: false,
            parent_task_id: None,
            status_history: vec![StatusHistoryEntry {
                status,
                user_id: "u-manager".to_string(),
                user_name: "u-manager".to_string(),
                timestamp: created_at,
            }],
        };
        edit(&mut task);
        self.board.tasks.push(task);
        self
    }

    pub fn with_project_status(mut self, id: &str, status: ProjectStatus) -> Self {
        if let Some(project) = self.board.projects.iter_mut().find(|p| p.id == id) {
            project.status = status;
        }
        self
    }

    pub fn build(self) -> Board {
        self.board
    }
}
