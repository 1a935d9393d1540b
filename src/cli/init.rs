//! sg init command implementation
//!
//! Creates `.stagegate.toml` and an empty board in the data directory.

use std::path::{Path, PathBuf};

use crate::config::{Config, CONFIG_FILE};
use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput};
use crate::store::FileStore;

use super::Globals;

#[derive(serde::Serialize)]
struct InitReport {
    root: PathBuf,
    data_dir: PathBuf,
    created: InitCreated,
}

#[derive(serde::Serialize)]
struct InitCreated {
    config: bool,
    board: bool,
}

pub fn run(globals: &Globals) -> Result<()> {
    let root = globals.root()?;
    if !root.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "not a directory: {}",
            root.display()
        )));
    }

    let created_config = ensure_config(&root)?;
    let config = Config::load_from_root(&root)?;
    let store = FileStore::open(&root, &config);
    let created_board = store.init()?;
    let data_dir = store.storage().data_dir().to_path_buf();

    let report = InitReport {
        root: root.clone(),
        data_dir: data_dir.clone(),
        created: InitCreated {
            config: created_config,
            board: created_board,
        },
    };

    let mut created_items = Vec::new();
    if created_config {
        created_items.push(CONFIG_FILE.to_string());
    }
    if created_board {
        created_items.push(format!("{}/board.json", config.store.dir.trim()));
    }

    let header = if created_items.is_empty() {
        "sg init: nothing to do"
    } else {
        "sg init: initialized board"
    };

    let mut human = HumanOutput::new(header);
    human.push_summary("root", root.display().to_string());
    human.push_summary("data", data_dir.display().to_string());
    human.push_summary(
        "created",
        if created_items.is_empty() {
            "none".to_string()
        } else {
            created_items.join(", ")
        },
    );
    human.push_next_step("sg project new <name> --stage <stage>");

    emit_success(globals.output(), "init", &report, Some(&human))
}

fn ensure_config(root: &Path) -> Result<bool> {
    let config_path = root.join(CONFIG_FILE);
    if config_path.exists() {
        if !config_path.is_file() {
            return Err(Error::InvalidConfig(format!(
                "{CONFIG_FILE} exists but is not a file: {}",
                config_path.display()
            )));
        }
        return Ok(false);
    }

    Config::default().save(&config_path)?;
    Ok(true)
}
