//! stagegate - project, stage and task lifecycle engine
//!
//! This library provides the core functionality for the sg CLI tool.
//! A project is split into ordered stages, each holding tasks. Tasks move
//! through a fixed state machine, and stage and project statuses are
//! derived from their tasks in the same commit as every task change.
//!
//! # Core Concepts
//!
//! - **Task lifecycle**: pending, in-progress, waiting-approval, approved,
//!   completed and rejected, with approval gates and rejection comments
//! - **Dependencies**: a task may wait on a predecessor before starting
//! - **Aggregation**: stage and project statuses follow their tasks
//! - **Approval queue**: stages and tasks waiting for an approver
//! - **Notifications**: assignment, status, mention and deadline events
//!
//! # Module Organization
//!
//! - `workflow`: the engine every mutation goes through
//! - `machine`: task transition rules
//! - `dependency`: predecessor gate and cycle detection
//! - `stage` / `project`: status aggregation, stage sign-off, project close
//! - `approvals`: pending approval queue
//! - `deadlines`: due-date scan
//! - `events`: notifications and their sinks
//! - `store` / `storage` / `lock`: persistence with atomic commits
//! - `board` / `model`: in-memory snapshot and entity types
//! - `actor` / `config`: identity, roles and `.stagegate.toml`
//! - `cli` / `output`: command-line interface

pub mod actor;
pub mod approvals;
pub mod board;
pub mod cli;
pub mod config;
pub mod deadlines;
pub mod dependency;
pub mod error;
pub mod events;
pub mod lock;
pub mod machine;
pub mod model;
pub mod output;
pub mod project;
pub mod stage;
pub mod storage;
pub mod store;
pub mod workflow;

pub use error::{Error, Result};
