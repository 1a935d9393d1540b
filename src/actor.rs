//! Actor identity and capability checks.
//!
//! Actor resolution order:
//! 1) CLI `--actor` / `--actor-name` / `--role`
//! 2) `SG_ACTOR_ID`, `SG_ACTOR_NAME`, `SG_ACTOR_ROLES` environment variables
//! 3) Config defaults (`[actor]`)
//!
//! Roles are an opaque set. Every permission check in the crate goes
//! through [`Capabilities::allows`].

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{ActorConfig, RolesConfig};
use crate::model::non_empty;

/// The user on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl Actor {
    pub fn new<I, S>(id: impl Into<String>, name: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            id: id.into(),
            name: name.into(),
            roles: roles
                .into_iter()
                .filter_map(|role| non_empty(Some(role.as_ref())).map(normalize_role))
                .collect(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(&normalize_role(role))
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name == self.id {
            f.write_str(&self.id)
        } else {
            write!(f, "{} ({})", self.name, self.id)
        }
    }
}

/// Named capabilities checked by the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    /// Approve or reject tasks and stages, and see the approval queue.
    Approve,
    /// Create and delete projects, stages and tasks.
    Manage,
    /// Close a project.
    Close,
    /// Reassign a task the actor is not assigned to.
    Transfer,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Permission::Approve => "approve or reject work",
            Permission::Manage => "manage projects",
            Permission::Close => "close projects",
            Permission::Transfer => "transfer tasks",
        };
        f.write_str(label)
    }
}

/// Role-to-permission mapping, built from `[roles]` config.
#[derive(Debug, Clone)]
pub struct Capabilities {
    roles: RolesConfig,
}

impl Capabilities {
    pub fn new(roles: RolesConfig) -> Self {
        Self { roles }
    }

    /// Whether `actor` holds any role granting `permission`.
    pub fn allows(&self, actor: &Actor, permission: Permission) -> bool {
        self.roles
            .for_permission(permission)
            .iter()
            .any(|role| actor.has_role(role))
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::new(RolesConfig::default())
    }
}

/// Resolve the acting user from CLI values, environment and config.
pub fn resolve_actor(
    config: &ActorConfig,
    cli_id: Option<&str>,
    cli_name: Option<&str>,
    cli_roles: &[String],
) -> Actor {
    let env_id = std::env::var("SG_ACTOR_ID").ok();
    let env_name = std::env::var("SG_ACTOR_NAME").ok();
    let env_roles = std::env::var("SG_ACTOR_ROLES").ok();

    let id = non_empty(cli_id)
        .or_else(|| non_empty(env_id.as_deref()))
        .unwrap_or(config.id.as_str())
        .to_string();

    // A name only defaults to the configured one when the id did too.
    let name = non_empty(cli_name)
        .or_else(|| non_empty(env_name.as_deref()))
        .map(str::to_string)
        .unwrap_or_else(|| {
            if id == config.id {
                config.name.clone()
            } else {
                id.clone()
            }
        });

    let roles: Vec<String> = if !cli_roles.is_empty() {
        cli_roles.to_vec()
    } else if let Some(raw) = non_empty(env_roles.as_deref()) {
        raw.split(',').map(str::to_string).collect()
    } else {
        config.roles.clone()
    };

    Actor::new(id, name, roles)
}

fn normalize_role(role: &str) -> String {
    role.trim().to_ascii_lowercase()
}
