//! Database and resource layout on disk.
//!
//! A database directory holds `database.json` plus one directory per
//! resource under `resources/`. A resource directory holds its JSON
//! configuration, an exclusive lock file, the append-only data file and
//! transient commit markers:
//!
//! ```text
//! <db>/database.json
//! <db>/resources/<name>/resource.json
//! <db>/resources/<name>/resource.lock
//! <db>/resources/<name>/data/resource.adb
//! <db>/resources/<name>/commit-<rev>.tmp
//! ```

use crate::versioning::Versioning;
use crate::{DEFAULT_CACHE_PAGES, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const DATABASE_CONFIG: &str = "database.json";
pub const RESOURCE_CONFIG: &str = "resource.json";
pub const RESOURCE_LOCK: &str = "resource.lock";
pub const RESOURCES_DIR: &str = "resources";

/// Ancestor-hash maintenance mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashKind {
    Rolling,
    Postorder,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub versioning: Versioning,
    pub revs_to_restore: u32,
    pub hashing: HashKind,
    pub use_dewey_ids: bool,
    pub cache_pages: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            versioning: Versioning::SlidingSnapshot,
            revs_to_restore: 4,
            hashing: HashKind::Rolling,
            use_dewey_ids: false,
            cache_pages: DEFAULT_CACHE_PAGES,
        }
    }
}

impl ResourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.revs_to_restore == 0 {
            return Err(Error::Config(
                "revs_to_restore must be at least one".to_string(),
            ));
        }
        Ok(())
    }

    pub fn load(resource_dir: &Path) -> Result<Self> {
        let raw = fs::read_to_string(resource_dir.join(RESOURCE_CONFIG))?;
        let config: ResourceConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, resource_dir: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(resource_dir.join(RESOURCE_CONFIG), raw)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub id: Uuid,
    pub name: String,
    pub created: DateTime<Utc>,
}

impl DatabaseConfig {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created: Utc::now(),
        }
    }

    pub fn load(db_dir: &Path) -> Result<Self> {
        let raw = fs::read_to_string(db_dir.join(DATABASE_CONFIG))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save(&self, db_dir: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(db_dir.join(DATABASE_CONFIG), raw)?;
        Ok(())
    }
}

pub fn resources_dir(db_dir: &Path) -> PathBuf {
    db_dir.join(RESOURCES_DIR)
}

pub fn resource_dir(db_dir: &Path, name: &str) -> PathBuf {
    resources_dir(db_dir).join(name)
}

/// Exclusive per-resource lock, released on drop.
///
/// Creation with `create_new` is the mutual exclusion: a second holder,
/// in this process or another, fails with `ResourceLocked`.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(resource_dir: &Path) -> Result<Self> {
        let path = resource_dir.join(RESOURCE_LOCK);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                use std::io::Write as _;
                let _ = write!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(Error::ResourceLocked),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("failed to remove lock file {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_roundtrip() {
        let dir = tempdir().unwrap();
        let config = ResourceConfig {
            versioning: Versioning::Incremental,
            revs_to_restore: 8,
            hashing: HashKind::Postorder,
            use_dewey_ids: true,
            cache_pages: 32,
        };
        config.save(dir.path()).unwrap();
        let loaded = ResourceConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.versioning, Versioning::Incremental);
        assert_eq!(loaded.revs_to_restore, 8);
        assert_eq!(loaded.hashing, HashKind::Postorder);
        assert!(loaded.use_dewey_ids);
    }

    #[test]
    fn zero_revs_to_restore_is_rejected() {
        let config = ResourceConfig {
            revs_to_restore: 0,
            ..ResourceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn second_lock_acquisition_fails() {
        let dir = tempdir().unwrap();
        let lock = LockFile::acquire(dir.path()).unwrap();
        assert!(matches!(
            LockFile::acquire(dir.path()),
            Err(Error::ResourceLocked)
        ));
        drop(lock);
        let relock = LockFile::acquire(dir.path()).unwrap();
        drop(relock);
    }
}
