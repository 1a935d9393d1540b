//! Command-line interface for sg
//!
//! This module defines the CLI structure using clap derive macros.
//! Each command group is implemented in its own submodule.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::actor::{resolve_actor, Actor};
use crate::config::Config;
use crate::error::Result;
use crate::events::EventDestination;
use crate::output::OutputOptions;
use crate::store::FileStore;
use crate::workflow::{Outcome, Workflow};

mod approvals;
mod deadlines;
mod init;
mod project;
mod stage;
mod task;

/// sg - stage-gated project tracking
///
/// Projects are split into ordered stages of tasks. Tasks move through a
/// fixed lifecycle, stages and projects derive their status from their
/// tasks, and approval gates hold work until an approver signs off.
#[derive(Parser, Debug)]
#[command(name = "sg")]
#[command(author, version, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Workspace root holding .stagegate.toml (defaults to current directory)
    #[arg(long, global = true, env = "SG_DIR")]
    pub dir: Option<PathBuf>,

    /// Acting user id
    #[arg(long, global = true)]
    pub actor: Option<String>,

    /// Acting user display name
    #[arg(long, global = true)]
    pub actor_name: Option<String>,

    /// Role held by the acting user (repeatable)
    #[arg(long = "role", global = true)]
    pub roles: Vec<String>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Write notification events as JSONL ("-" for stdout, or a file path)
    #[arg(long, global = true)]
    pub events: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create .stagegate.toml and an empty board
    Init,

    /// Project management
    #[command(subcommand)]
    Project(ProjectCommands),

    /// Stage management and sign-off
    #[command(subcommand)]
    Stage(StageCommands),

    /// Task lifecycle, assignment and comments
    #[command(subcommand)]
    Task(TaskCommands),

    /// List stages and tasks waiting for the actor's approval
    Approvals,

    /// Report approaching and overdue due dates
    Deadlines {
        /// How far ahead counts as approaching (e.g. "48h", "3d"); defaults to config
        #[arg(long)]
        window: Option<String>,
    },
}

/// Project subcommands
#[derive(Subcommand, Debug)]
pub enum ProjectCommands {
    /// Create a project, optionally with stages
    New {
        /// Project name
        name: String,

        /// Free-form description
        #[arg(long, default_value = "")]
        description: String,

        /// Priority: low, medium, high, critical
        #[arg(long, default_value = "medium")]
        priority: String,

        /// Stage to create, in order; append ":approval" to gate it (repeatable)
        #[arg(long = "stage")]
        stages: Vec<String>,
    },

    /// List projects, most recent first
    List {
        /// Only projects with this status
        #[arg(long)]
        status: Option<String>,
    },

    /// Show a project with its stages and tasks
    Show {
        /// Project id or unique prefix
        project: String,
    },

    /// Close a project, forcing open stages and tasks to completed
    Close {
        /// Project id or unique prefix
        project: String,
    },

    /// Delete a project with its stages, tasks and comments
    Delete {
        /// Project id or unique prefix
        project: String,
    },
}

/// Stage subcommands
#[derive(Subcommand, Debug)]
pub enum StageCommands {
    /// Add a stage to a project
    Add {
        /// Project id or unique prefix
        project: String,

        /// Stage name
        name: String,

        /// Free-form description
        #[arg(long, default_value = "")]
        description: String,

        /// Position among the project's stages (appended when omitted)
        #[arg(long)]
        order: Option<i32>,

        /// Require sign-off before the stage completes
        #[arg(long)]
        approval: bool,
    },

    /// Show a stage with its tasks
    Show {
        /// Stage id or unique prefix
        stage: String,
    },

    /// Sign off an approval stage
    Approve {
        /// Stage id or unique prefix
        stage: String,
    },

    /// Delete a stage with its tasks and comments
    Delete {
        /// Stage id or unique prefix
        stage: String,
    },
}

/// Task subcommands
#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Add a task to a stage
    Add {
        /// Stage id or unique prefix
        stage: String,

        /// Task title
        title: String,

        /// Assigned user id (repeatable)
        #[arg(long = "assign", required = true)]
        assignees: Vec<String>,

        /// Free-form description
        #[arg(long, default_value = "")]
        description: String,

        /// Priority: low, medium, high, critical
        #[arg(long, default_value = "medium")]
        priority: String,

        /// Start date (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        start: Option<String>,

        /// Due date (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        due: Option<String>,

        /// Require approval before the task completes
        #[arg(long)]
        approval: bool,

        /// Task that must complete before this one starts
        #[arg(long)]
        after: Option<String>,
    },

    /// Show a task with its comments and dependents
    Show {
        /// Task id or unique prefix
        task: String,
    },

    /// Move a task to a status
    Status {
        /// Task id or unique prefix
        task: String,

        /// Target status: pending, in-progress, waiting-approval, approved, completed, rejected
        status: String,

        /// Comment recorded with the change (required for rejected)
        #[arg(short, long)]
        comment: Option<String>,

        /// Operation id making a retried request safe to replay
        #[arg(long)]
        op_id: Option<String>,
    },

    /// Start a task
    Start {
        /// Task id or unique prefix
        task: String,
    },

    /// Approve a task waiting for approval
    Approve {
        /// Task id or unique prefix
        task: String,

        /// Optional approval note
        #[arg(short, long)]
        comment: Option<String>,
    },

    /// Reject a task waiting for approval
    Reject {
        /// Task id or unique prefix
        task: String,

        /// Why the task is rejected
        #[arg(long, required = true)]
        reason: String,
    },

    /// Reassign a task
    Transfer {
        /// Task id or unique prefix
        task: String,

        /// New assignee (repeatable)
        #[arg(long = "to", required = true)]
        assignees: Vec<String>,

        /// Why the task changes hands
        #[arg(long)]
        reason: Option<String>,
    },

    /// Set or clear the task this one waits on
    Depend {
        /// Task id or unique prefix
        task: String,

        /// Predecessor task; omit to clear
        #[arg(long)]
        on: Option<String>,
    },

    /// Comment on a task
    Comment {
        /// Task id or unique prefix
        task: String,

        /// Comment text
        content: String,

        /// Comment to reply to
        #[arg(long)]
        reply_to: Option<String>,

        /// User to notify
        #[arg(long)]
        mention: Option<String>,

        /// Attachment URL
        #[arg(long)]
        attachment: Option<String>,
    },

    /// Delete a task and its comments
    Delete {
        /// Task id or unique prefix
        task: String,
    },
}

/// Flags shared by every command
#[derive(Debug, Clone)]
pub(crate) struct Globals {
    pub dir: Option<PathBuf>,
    pub actor: Option<String>,
    pub actor_name: Option<String>,
    pub roles: Vec<String>,
    pub events: Option<String>,
    pub json: bool,
    pub quiet: bool,
}

/// Everything a board command needs once flags are resolved
pub(crate) struct Context {
    pub config: Config,
    pub actor: Actor,
    pub workflow: Workflow<FileStore>,
}

impl Globals {
    pub fn root(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }

    pub fn output(&self) -> OutputOptions {
        OutputOptions {
            json: self.json,
            quiet: self.quiet,
        }
    }

    /// Load config, resolve the actor and open the board store.
    pub fn context(&self) -> Result<Context> {
        let root = self.root()?;
        let config = Config::load_from_root(&root)?;
        let actor = resolve_actor(
            &config.actor,
            self.actor.as_deref(),
            self.actor_name.as_deref(),
            &self.roles,
        );
        let mut workflow = Workflow::from_config(FileStore::open(&root, &config), &config);
        if let Some(destination) = EventDestination::parse(self.events.as_deref()) {
            workflow = workflow.with_sink(Arc::new(destination.open()?));
        }
        tracing::debug!(root = %root.display(), actor = %actor.id, "context loaded");
        Ok(Context {
            config,
            actor,
            workflow,
        })
    }
}

/// Unwrap an outcome, turning a refusal into an error.
///
/// The flag is `true` when the change was committed.
pub(crate) fn settle<T>(outcome: Outcome<T>) -> Result<(T, bool)> {
    let applied = outcome.is_applied();
    Ok((outcome.into_result()?, applied))
}

pub(crate) fn outcome_header(command: &str, applied: bool) -> String {
    if applied {
        format!("sg {command}: applied")
    } else {
        format!("sg {command}: no change")
    }
}

impl Cli {
    /// Execute the CLI command
    pub fn run(self) -> Result<()> {
        let globals = Globals {
            dir: self.dir,
            actor: self.actor,
            actor_name: self.actor_name,
            roles: self.roles,
            events: self.events,
            json: self.json,
            quiet: self.quiet,
        };

        match self.command {
            Commands::Init => init::run(&globals),
            Commands::Project(cmd) => match cmd {
                ProjectCommands::New {
                    name,
                    description,
                    priority,
                    stages,
                } => project::run_new(project::NewOptions {
                    name,
                    description,
                    priority,
                    stages,
                    globals,
                }),
                ProjectCommands::List { status } => project::run_list(&globals, status),
                ProjectCommands::Show { project } => project::run_show(&globals, &project),
                ProjectCommands::Close { project } => project::run_close(&globals, &project),
                ProjectCommands::Delete { project } => project::run_delete(&globals, &project),
            },
            Commands::Stage(cmd) => match cmd {
                StageCommands::Add {
                    project,
                    name,
                    description,
                    order,
                    approval,
                } => stage::run_add(stage::AddOptions {
                    project,
                    name,
                    description,
                    order,
                    approval,
                    globals,
                }),
                StageCommands::Show { stage } => stage::run_show(&globals, &stage),
                StageCommands::Approve { stage } => stage::run_approve(&globals, &stage),
                StageCommands::Delete { stage } => stage::run_delete(&globals, &stage),
            },
            Commands::Task(cmd) => match cmd {
                TaskCommands::Add {
                    stage,
                    title,
                    assignees,
                    description,
                    priority,
                    start,
                    due,
                    approval,
                    after,
                } => task::run_add(task::AddOptions {
                    stage,
                    title,
                    assignees,
                    description,
                    priority,
                    start,
                    due,
                    approval,
                    after,
                    globals,
                }),
                TaskCommands::Show { task } => task::run_show(&globals, &task),
                TaskCommands::Status {
                    task,
                    status,
                    comment,
                    op_id,
                } => task::run_status(task::StatusOptions {
                    task,
                    status,
                    comment,
                    op_id,
                    globals,
                }),
                TaskCommands::Start { task } => task::run_start(&globals, &task),
                TaskCommands::Approve { task, comment } => {
                    task::run_approve(&globals, &task, comment.as_deref())
                }
                TaskCommands::Reject { task, reason } => {
                    task::run_reject(&globals, &task, &reason)
                }
                TaskCommands::Transfer {
                    task,
                    assignees,
                    reason,
                } => task::run_transfer(&globals, &task, assignees, reason.as_deref()),
                TaskCommands::Depend { task, on } => {
                    task::run_depend(&globals, &task, on.as_deref())
                }
                TaskCommands::Comment {
                    task,
                    content,
                    reply_to,
                    mention,
                    attachment,
                } => task::run_comment(task::CommentOptions {
                    task,
                    content,
                    reply_to,
                    mention,
                    attachment,
                    globals,
                }),
                TaskCommands::Delete { task } => task::run_delete(&globals, &task),
            },
            Commands::Approvals => approvals::run(&globals),
            Commands::Deadlines { window } => deadlines::run(&globals, window.as_deref()),
        }
    }
}
