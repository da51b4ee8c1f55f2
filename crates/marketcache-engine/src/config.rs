//! Engine configuration
//!
//! Handles the storage root, batch concurrency and transport timeout.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================================================
// Engine Configuration Constants
// ============================================================================

/// Environment variable selecting the storage root.
pub const DATA_PATH_ENV: &str = "MARKETCACHE_DATA_PATH";

/// Default number of batch items in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default timeout applied by the reference HTTP transport, in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

/// Folder holding the metadata store.
pub const META_FOLDER: &str = "meta";

/// Metadata store file name inside [`META_FOLDER`].
pub const META_DB_FILENAME: &str = "meta.db";

/// Folder holding content-addressed raw downloads.
pub const RAW_FOLDER: &str = "raw";

/// Folder holding materialized datasets.
pub const DATASETS_FOLDER: &str = "datasets";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Storage root; every stored path is relative to it
    pub root: PathBuf,

    /// Maximum batch items processed concurrently
    pub concurrency: usize,

    /// Timeout for the reference HTTP transport
    pub http_timeout_secs: u64,

    /// Draw progress bars during batch runs
    #[serde(default)]
    pub show_progress: bool,
}

impl EngineConfig {
    /// Create a config rooted at `root` with default settings
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            concurrency: DEFAULT_CONCURRENCY,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            show_progress: false,
        }
    }

    /// Load config from environment variables
    ///
    /// The storage root defaults to the current working directory.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let root = match std::env::var(DATA_PATH_ENV) {
            Ok(path) => PathBuf::from(path),
            Err(_) => std::env::current_dir()?,
        };

        let config = Self {
            root,
            concurrency: std::env::var("MARKETCACHE_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CONCURRENCY),
            http_timeout_secs: std::env::var("MARKETCACHE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
            show_progress: std::env::var("MARKETCACHE_SHOW_PROGRESS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(EngineError::config("Storage root cannot be empty"));
        }

        if self.concurrency == 0 {
            return Err(EngineError::config("Concurrency must be greater than 0"));
        }

        Ok(())
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }
}
