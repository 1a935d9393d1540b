//! Error types for stagegate
//!
//! Two families are kept apart:
//! - [`BlockReason`]: a business rule refused the request. Returned as a value
//!   inside an `Ok(..)` outcome, never thrown.
//! - [`Error`]: the request could not be carried out (bad input, store or IO
//!   failure).
//!
//! Exit codes:
//! - 0: Success
//! - 2: User error (bad args, unknown ids, bad config)
//! - 3: Blocked by a business rule
//! - 4: Operation failed (store unavailable, IO, lock timeout)

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::actor::Permission;
use crate::model::{StageStatus, TaskStatus};

/// Exit codes for the sg CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const POLICY_BLOCKED: i32 = 3;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Kind of entity named in a not-found error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Stage,
    Task,
    Comment,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            EntityKind::Project => "project",
            EntityKind::Stage => "stage",
            EntityKind::Task => "task",
            EntityKind::Comment => "comment",
        };
        f.write_str(label)
    }
}

/// A user-displayable explanation of why a request was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    #[error(
        "task \"{task_title}\" still depends on \"{predecessor_title}\" ({predecessor_id}), which is {predecessor_status}"
    )]
    DependencyPending {
        task_id: String,
        task_title: String,
        predecessor_id: String,
        predecessor_title: String,
        predecessor_status: TaskStatus,
    },

    #[error("cannot move task from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("task requires approval: send it to waiting-approval instead of completing it")]
    ApprovalRequired { task_id: String },

    #[error("task does not require approval: complete it directly")]
    ApprovalNotRequired { task_id: String },

    #[error("a non-empty comment is required to reject a task")]
    CommentRequired,

    #[error("{actor} is not allowed to {permission}")]
    NotPermitted {
        actor: String,
        permission: Permission,
    },

    #[error("project \"{project_name}\" is closed")]
    ProjectClosed {
        project_id: String,
        project_name: String,
    },

    #[error("stage \"{stage_name}\" does not require approval")]
    StageApprovalNotRequired {
        stage_id: String,
        stage_name: String,
    },

    #[error("stage \"{stage_name}\" is already {status}")]
    StageAlreadySignedOff {
        stage_id: String,
        stage_name: String,
        status: StageStatus,
    },
}

/// Main error type for stagegate operations
#[derive(Error, Debug)]
pub enum Error {
    // User errors (exit code 2)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("Store not initialized at {0}; run `sg init`")]
    NotInitialized(PathBuf),

    // Business-rule blocks surfaced at the CLI boundary (exit code 3)
    #[error("Blocked: {0}")]
    Blocked(BlockReason),

    // Operation failures (exit code 4)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Lock acquisition failed: {0}")]
    LockFailed(PathBuf),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store conflict: {0}")]
    Conflict(String),
}

impl Error {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            // User errors
            Error::InvalidArgument(_)
            | Error::InvalidConfig(_)
            | Error::NotFound { .. }
            | Error::NotInitialized(_) => exit_codes::USER_ERROR,

            // Policy blocks
            Error::Blocked(_) => exit_codes::POLICY_BLOCKED,

            // Operation failures
            Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::LockFailed(_)
            | Error::StoreUnavailable(_)
            | Error::Conflict(_) => exit_codes::OPERATION_FAILED,
        }
    }

    /// Whether a read may be retried after this error.
    ///
    /// Mutations are never retried regardless of this value.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockFailed(_) | Error::StoreUnavailable(_))
    }

    /// Structured details for JSON output
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::NotFound { kind, id } => Some(serde_json::json!({
                "kind": kind,
                "id": id,
            })),
            Error::Blocked(reason) => serde_json::to_value(reason).ok(),
            Error::InvalidConfig(message) | Error::InvalidArgument(message) => {
                Some(serde_json::json!({ "message": message }))
            }
            Error::LockFailed(path) | Error::NotInitialized(path) => Some(serde_json::json!({
                "path": path.to_string_lossy(),
            })),
            _ => None,
        }
    }
}

impl From<BlockReason> for Error {
    fn from(reason: BlockReason) -> Self {
        Error::Blocked(reason)
    }
}

/// Result type alias for stagegate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wrapper for displaying errors in JSON format
#[derive(serde::Serialize)]
pub struct JsonError {
    pub error: String,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&Error> for JsonError {
    fn from(err: &Error) -> Self {
        JsonError {
            error: err.to_string(),
            code: err.exit_code(),
            details: err.details(),
        }
    }
}
