//! On-disk layout of the storage root
//!
//! ```text
//! <root>/meta/meta.db
//! <root>/raw/<artifact_type>/<content_checksum>/...
//! <root>/datasets/<artifact_type>[-<suboutput>]/<partition_file>
//! ```
//!
//! Paths recorded in metadata are relative to the root and always use `/`.

use crate::config::{DATASETS_FOLDER, META_DB_FILENAME, META_FOLDER, RAW_FOLDER};
use crate::error::Result;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the top-level folders if missing
    pub fn ensure(&self) -> Result<()> {
        for folder in [META_FOLDER, RAW_FOLDER, DATASETS_FOLDER] {
            std::fs::create_dir_all(self.root.join(folder))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta_db_path(&self) -> PathBuf {
        self.root.join(META_FOLDER).join(META_DB_FILENAME)
    }

    /// Relative folder of a raw entry
    pub fn raw_folder(&self, artifact_type_id: &str, checksum: &str) -> String {
        format!("{}/{}/{}", RAW_FOLDER, artifact_type_id, checksum)
    }

    /// Relative folder of a dataset; sub-outputs get a `-<suffix>` folder
    pub fn dataset_folder(&self, artifact_type_id: &str, suffix: Option<&str>) -> String {
        match suffix {
            Some(suffix) => format!("{}/{}-{}", DATASETS_FOLDER, artifact_type_id, suffix),
            None => format!("{}/{}", DATASETS_FOLDER, artifact_type_id),
        }
    }

    /// Absolute path of a root-relative location
    pub fn resolve(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}
