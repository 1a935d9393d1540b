//! On-disk layout for the file-backed store
//!
//! ```text
//! .stagegate/          # Data directory (configurable via [store] dir)
//!   board.json         # Every table plus recently applied operation ids
//!   board.lock         # Advisory lock held for each read-modify-write
//! ```

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::board::Board;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lock;

/// Current `board.json` layout version
pub const BOARD_FILE_VERSION: u32 = 1;

/// How many applied operation ids are remembered for de-duplication
pub const APPLIED_OPS_LIMIT: usize = 1024;

/// Contents of `board.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardFile {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(flatten)]
    pub board: Board,
    #[serde(default)]
    pub applied_ops: VecDeque<String>,
}

fn default_version() -> u32 {
    BOARD_FILE_VERSION
}

impl Default for BoardFile {
    fn default() -> Self {
        Self {
            version: BOARD_FILE_VERSION,
            board: Board::default(),
            applied_ops: VecDeque::new(),
        }
    }
}

impl BoardFile {
    pub fn has_applied(&self, op_id: &str) -> bool {
        self.applied_ops.iter().any(|id| id == op_id)
    }

    /// Remember an operation id, forgetting the oldest past the limit.
    pub fn record_op(&mut self, op_id: &str) {
        self.applied_ops.push_back(op_id.to_string());
        while self.applied_ops.len() > APPLIED_OPS_LIMIT {
            self.applied_ops.pop_front();
        }
    }
}

/// Paths and raw IO for one data directory
#[derive(Debug, Clone)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// Storage for a workspace root using the configured data directory
    pub fn for_root(root: &Path, config: &Config) -> Self {
        Self::new(config.store_dir(root))
    }

    // =========================================================================
    // Path accessors
    // =========================================================================

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn board_file(&self) -> PathBuf {
        self.data_dir.join("board.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.data_dir.join("board.lock")
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    /// Create the data directory and an empty board if missing.
    ///
    /// Returns `true` when a new board file was written.
    pub fn init(&self) -> Result<bool> {
        fs::create_dir_all(&self.data_dir)?;
        let board_file = self.board_file();
        if board_file.exists() {
            return Ok(false);
        }
        self.write_json(&board_file, &BoardFile::default())?;
        Ok(true)
    }

    pub fn is_initialized(&self) -> bool {
        self.board_file().exists()
    }

    // =========================================================================
    // Board file
    // =========================================================================

    pub fn read_board_file(&self) -> Result<BoardFile> {
        let path = self.board_file();
        if !path.exists() {
            return Err(Error::NotInitialized(self.data_dir.clone()));
        }
        let file: BoardFile = self.read_json(&path)?;
        if file.version > BOARD_FILE_VERSION {
            return Err(Error::StoreUnavailable(format!(
                "{} has layout version {}, newer than supported {}",
                path.display(),
                file.version,
                BOARD_FILE_VERSION
            )));
        }
        Ok(file)
    }

    pub fn write_board_file(&self, file: &BoardFile) -> Result<()> {
        self.write_json(&self.board_file(), file)
    }

    // =========================================================================
    // JSON helpers
    // =========================================================================

    /// Write JSON data to a file atomically
    pub fn write_json<T: Serialize>(&self, path: &Path, data: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(data)?;
        lock::write_atomic(path, json.as_bytes())
    }

    /// Read JSON data from a file
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let content = fs::read_to_string(path)?;
        let data: T = serde_json::from_str(&content)?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_empty_board_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(dir.path().join(".stagegate"));
        assert!(!storage.is_initialized());

        assert!(storage.init().expect("init"));
        assert!(storage.is_initialized());
        assert!(!storage.init().expect("second init"));

        let file = storage.read_board_file().expect("read board");
        assert_eq!(file.version, BOARD_FILE_VERSION);
        assert!(file.board.projects.is_empty());
    }

    #[test]
    fn missing_board_is_not_initialized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(dir.path().join("nowhere"));
        assert!(matches!(
            storage.read_board_file(),
            Err(Error::NotInitialized(_))
        ));
    }

    #[test]
    fn newer_layout_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(dir.path().to_path_buf());
        fs::write(storage.board_file(), r#"{"version": 99}"#).expect("write board");
        assert!(matches!(
            storage.read_board_file(),
            Err(Error::StoreUnavailable(_))
        ));
    }

    #[test]
    fn applied_ops_are_bounded() {
        let mut file = BoardFile::default();
        for idx in 0..(APPLIED_OPS_LIMIT + 10) {
            file.record_op(&format!("op-{idx}"));
        }
        assert_eq!(file.applied_ops.len(), APPLIED_OPS_LIMIT);
        assert!(!file.has_applied("op-0"));
        assert!(file.has_applied(&format!("op-{}", APPLIED_OPS_LIMIT + 9)));
    }
}
