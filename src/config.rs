//! Configuration loading and management
//!
//! Handles parsing of `.stagegate.toml` configuration files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::actor::Permission;
use crate::error::{Error, Result};

/// Name of the configuration file at the workspace root
pub const CONFIG_FILE: &str = ".stagegate.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Default actor identity
    #[serde(default)]
    pub actor: ActorConfig,

    /// Role lists granting each permission
    #[serde(default)]
    pub roles: RolesConfig,

    /// File store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Deadline scan settings
    #[serde(default)]
    pub deadlines: DeadlinesConfig,
}

/// Actor-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
    #[serde(default = "default_actor_id")]
    pub id: String,

    #[serde(default = "default_actor_id")]
    pub name: String,

    #[serde(default = "default_actor_roles")]
    pub roles: Vec<String>,
}

fn default_actor_id() -> String {
    "unknown".to_string()
}

fn default_actor_roles() -> Vec<String> {
    vec!["user".to_string()]
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            id: default_actor_id(),
            name: default_actor_id(),
            roles: default_actor_roles(),
        }
    }
}

/// Which roles grant which permission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolesConfig {
    /// Approve/reject tasks and stages, view the approval queue
    #[serde(default = "default_approve_roles")]
    pub approve: Vec<String>,

    /// Create and delete projects, stages and tasks
    #[serde(default = "default_manager_roles")]
    pub manage: Vec<String>,

    /// Close projects
    #[serde(default = "default_manager_roles")]
    pub close: Vec<String>,

    /// Transfer tasks the actor is not assigned to
    #[serde(default = "default_manager_roles")]
    pub transfer: Vec<String>,
}

fn default_approve_roles() -> Vec<String> {
    vec![
        "admin".to_string(),
        "aprovador".to_string(),
        "approver".to_string(),
    ]
}

fn default_manager_roles() -> Vec<String> {
    vec!["admin".to_string(), "manager".to_string()]
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            approve: default_approve_roles(),
            manage: default_manager_roles(),
            close: default_manager_roles(),
            transfer: default_manager_roles(),
        }
    }
}

impl RolesConfig {
    pub fn for_permission(&self, permission: Permission) -> &[String] {
        match permission {
            Permission::Approve => &self.approve,
            Permission::Manage => &self.manage,
            Permission::Close => &self.close,
            Permission::Transfer => &self.transfer,
        }
    }

    fn validate(&self) -> Result<()> {
        for (field, roles) in [
            ("roles.approve", &self.approve),
            ("roles.manage", &self.manage),
            ("roles.close", &self.close),
            ("roles.transfer", &self.transfer),
        ] {
            if roles.is_empty() {
                return Err(Error::InvalidConfig(format!("{field} cannot be empty")));
            }
            if roles.iter().any(|role| role.trim().is_empty()) {
                return Err(Error::InvalidConfig(format!(
                    "{field} cannot include empty entries"
                )));
            }
        }
        Ok(())
    }
}

/// File store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Data directory, relative to the workspace root
    #[serde(default = "default_store_dir")]
    pub dir: String,

    /// Extra attempts for a failed read
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,

    /// Pause between read attempts
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Maximum wait for the board lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_store_dir() -> String {
    ".stagegate".to_string()
}

fn default_read_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_lock_timeout_ms() -> u64 {
    crate::lock::DEFAULT_LOCK_TIMEOUT_MS
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
            read_retries: default_read_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

/// Deadline scan configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlinesConfig {
    /// How far ahead a due date counts as approaching (e.g. "48h")
    #[serde(default = "default_deadline_window")]
    pub window: String,
}

fn default_deadline_window() -> String {
    "48h".to_string()
}

impl Default for DeadlinesConfig {
    fn default() -> Self {
        Self {
            window: default_deadline_window(),
        }
    }
}

impl Config {
    /// Load configuration from a `.stagegate.toml` file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the workspace root, or return defaults
    pub fn load_from_root(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Absolute data directory for a workspace root
    pub fn store_dir(&self, root: &Path) -> PathBuf {
        root.join(self.store.dir.trim())
    }

    fn validate(&self) -> Result<()> {
        if self.actor.id.trim().is_empty() {
            return Err(Error::InvalidConfig("actor.id cannot be empty".to_string()));
        }
        self.roles.validate()?;
        if self.store.dir.trim().is_empty() {
            return Err(Error::InvalidConfig("store.dir cannot be empty".to_string()));
        }
        if self.store.lock_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "store.lock_timeout_ms must be > 0".to_string(),
            ));
        }
        crate::deadlines::parse_duration(&self.deadlines.window).map_err(|err| {
            Error::InvalidConfig(format!("deadlines.window: {err}"))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_are_expected() {
        let cfg = Config::default();
        assert_eq!(cfg.actor.id, "unknown");
        assert_eq!(cfg.actor.roles, vec!["user".to_string()]);
        assert_eq!(cfg.roles.approve, vec!["admin", "aprovador", "approver"]);
        assert_eq!(cfg.roles.manage, vec!["admin", "manager"]);
        assert_eq!(cfg.store.dir, ".stagegate");
        assert_eq!(cfg.store.read_retries, 3);
        assert_eq!(cfg.store.lock_timeout_ms, 5000);
        assert_eq!(cfg.deadlines.window, "48h");
    }

    #[test]
    fn load_parses_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        let content = r#"
[actor]
id = "u-7"
name = "Marta"
roles = ["manager"]

[roles]
approve = ["lead"]

[store]
dir = "data"
read_retries = 1
retry_backoff_ms = 5

[deadlines]
window = "3d"
"#;
        fs::write(&path, content.trim()).expect("write config");

        let cfg = Config::load(&path).expect("load config");
        assert_eq!(cfg.actor.id, "u-7");
        assert_eq!(cfg.actor.name, "Marta");
        assert_eq!(cfg.roles.approve, vec!["lead"]);
        assert_eq!(cfg.roles.close, vec!["admin", "manager"]);
        assert_eq!(cfg.store.dir, "data");
        assert_eq!(cfg.store.read_retries, 1);
        assert_eq!(cfg.store.lock_timeout_ms, 5000);
        assert_eq!(cfg.deadlines.window, "3d");
        assert_eq!(cfg.store_dir(dir.path()), dir.path().join("data"));
    }

    #[test]
    fn empty_role_list_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[roles]\napprove = []").expect("write config");

        let err = Config::load(&path).expect_err("invalid config");
        match err {
            Error::InvalidConfig(_) => {}
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn bad_deadline_window_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[deadlines]\nwindow = \"soon\"").expect("write config");

        assert!(matches!(
            Config::load(&path),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn load_from_root_defaults_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = Config::load_from_root(dir.path()).expect("defaults");
        assert_eq!(cfg.store.dir, ".stagegate");
    }

    #[test]
    fn save_writes_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.toml");
        Config::default().save(&path).expect("save config");

        let written = fs::read_to_string(&path).expect("read config");
        assert!(written.contains("dir = \".stagegate\""));
    }
}
