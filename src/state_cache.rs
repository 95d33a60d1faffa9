// src/state_cache.rs
//! Durable record of the structural state applied to each scale factor's data.
//!
//! Each cache is one JSON document mapping a string-encoded scale factor to a
//! state identifier (or `null` when nothing is applied):
//!
//! ```json
//! {
//!   "10": "lineitem_brinonly",
//!   "100": null
//! }
//! ```
//!
//! A missing file reads as an empty mapping. A present but malformed file is an
//! error: the record must match the live database, so guessing is not an option.
//! Writes go to a temporary file in the same directory which is then renamed over
//! the old one, so readers never observe a partial document.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::constants;
use crate::error::HarnessError;

pub type StateMap = BTreeMap<u32, Option<String>>;

#[derive(Debug, Clone)]
pub struct StateCache {
    path: PathBuf,
}

impl StateCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Index-set cache inside `state_dir`
    pub fn indexes(state_dir: &Path) -> Self {
        Self::new(state_dir.join(constants::LAST_INDEXES_FILE))
    }

    /// Clustering-script cache inside `state_dir`
    pub fn clustering(state_dir: &Path) -> Self {
        Self::new(state_dir.join(constants::LAST_CLUSTER_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full mapping. Missing file → empty.
    pub fn load(&self) -> Result<StateMap> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StateMap::new()),
            Err(e) => {
                return Err(self.corrupt(format!("unreadable: {}", e)).into());
            }
        };

        let raw: BTreeMap<String, Option<String>> =
            serde_json::from_str(&text).map_err(|e| self.corrupt(e))?;

        let mut map = StateMap::new();
        for (k, v) in raw {
            let sf: u32 = k
                .trim()
                .parse()
                .map_err(|_| self.corrupt(format!("key '{}' is not a scale factor", k)))?;
            map.insert(sf, v);
        }
        Ok(map)
    }

    /// State applied to scale factor `sf`; absent and `null` both mean "none".
    pub fn get(&self, sf: u32) -> Result<Option<String>> {
        Ok(self.load()?.remove(&sf).flatten())
    }

    /// Record `value` for `sf`, leaving every other entry untouched.
    pub fn set(&self, sf: u32, value: Option<&str>) -> Result<StateMap> {
        let mut map = self.load()?;
        map.insert(sf, value.map(str::to_string));
        self.store(&map)?;
        debug!("{}: sf {} -> {:?}", self.path.display(), sf, value);
        Ok(map)
    }

    fn store(&self, map: &StateMap) -> Result<()> {
        let raw: BTreeMap<String, &Option<String>> =
            map.iter().map(|(k, v)| (k.to_string(), v)).collect();
        let mut json = serde_json::to_string_pretty(&raw).context("serialize state cache")?;
        json.push('\n');

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("create state directory {}", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("create temporary file in {}", dir.display()))?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }

    fn corrupt(&self, message: impl std::fmt::Display) -> HarnessError {
        HarnessError::StateCache {
            path: self.path.display().to_string(),
            message: message.to_string(),
        }
    }
}

/// The index and clustering caches, read and written together.
#[derive(Debug, Clone)]
pub struct DbStateStore {
    pub indexes: StateCache,
    pub clustering: StateCache,
}

/// Structural state of a data set: installed index set and last clustering script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DbSetup {
    pub indexes: Option<String>,
    pub clustering: Option<String>,
}

impl DbSetup {
    pub fn new(indexes: Option<&str>, clustering: Option<&str>) -> Self {
        Self {
            indexes: indexes.map(str::to_string),
            clustering: clustering.map(str::to_string),
        }
    }
}

impl DbStateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            indexes: StateCache::indexes(state_dir),
            clustering: StateCache::clustering(state_dir),
        }
    }

    pub fn current(&self, sf: u32) -> Result<DbSetup> {
        Ok(DbSetup {
            indexes: self.indexes.get(sf)?,
            clustering: self.clustering.get(sf)?,
        })
    }

    /// Record a setup after it has been applied to every data set for `sf`.
    pub fn record(&self, sf: u32, setup: &DbSetup) -> Result<()> {
        self.clustering.set(sf, setup.clustering.as_deref())?;
        self.indexes.set(sf, setup.indexes.as_deref())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let cache = StateCache::indexes(dir.path());
        assert!(cache.load().unwrap().is_empty());
        assert_eq!(cache.get(10).unwrap(), None);
    }

    #[test]
    fn test_set_then_get_preserves_other_keys() {
        let dir = TempDir::new().unwrap();
        let cache = StateCache::indexes(dir.path());
        cache.set(1, Some("btree")).unwrap();
        cache.set(100, None).unwrap();
        cache.set(10, Some("lineitem_brinonly")).unwrap();

        let map = cache.load().unwrap();
        assert_eq!(map.get(&10), Some(&Some("lineitem_brinonly".to_string())));
        assert_eq!(map.get(&1), Some(&Some("btree".to_string())));
        assert_eq!(map.get(&100), Some(&None));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_file_format_uses_string_keys() {
        let dir = TempDir::new().unwrap();
        let cache = StateCache::clustering(dir.path());
        cache.set(10, Some("dates")).unwrap();
        let text = fs::read_to_string(cache.path()).unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["10"], "dates");
    }

    #[test]
    fn test_corrupt_file_fails_loudly() {
        let dir = TempDir::new().unwrap();
        let cache = StateCache::indexes(dir.path());
        fs::write(cache.path(), "{ \"10\": ").unwrap();
        let err = cache.get(10).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::StateCache { .. })
        ));

        fs::write(cache.path(), "{ \"ten\": \"btree\" }").unwrap();
        assert!(cache.load().is_err());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let cache = StateCache::indexes(dir.path());
        cache.set(10, Some("a")).unwrap();
        cache.set(10, Some("b")).unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(cache.get(10).unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_store_records_both() {
        let dir = TempDir::new().unwrap();
        let store = DbStateStore::new(dir.path());
        let setup = DbSetup::new(Some("lineitem_brinonly"), Some("dates"));
        store.record(10, &setup).unwrap();
        assert_eq!(store.current(10).unwrap(), setup);
        assert_eq!(store.current(1).unwrap(), DbSetup::default());
    }
}
