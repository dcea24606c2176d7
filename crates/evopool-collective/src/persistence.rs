//! Persistence of engine state.
//!
//! State is saved as a single snapshot: every pool, the graveyard, the
//! per-domain learning books and the budget ledger. A missing snapshot
//! means a fresh start; one that cannot be read or parsed is
//! [`EngineError::CorruptStore`].

use crate::budget::WindowState;
use crate::graveyard::{Graveyard, LearningBook};
use crate::pool::DomainPool;
use crate::types::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub pools: Vec<DomainPool>,
    pub graveyard: Graveyard,
    #[serde(default)]
    pub learnings: Vec<LearningBook>,
    #[serde(default)]
    pub budget: Vec<WindowState>,
}

impl EngineSnapshot {
    pub fn new(
        pools: Vec<DomainPool>,
        graveyard: Graveyard,
        learnings: Vec<LearningBook>,
        budget: Vec<WindowState>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            pools,
            graveyard,
            learnings,
            budget,
        }
    }
}

/// Storage backend for engine snapshots.
pub trait Persistence: Send + Sync {
    /// Load the last snapshot, or `None` if nothing was ever saved.
    fn load(&self) -> Result<Option<EngineSnapshot>>;

    fn save(&self, snapshot: &EngineSnapshot) -> Result<()>;
}

/// Keeps the last snapshot in memory.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    snapshot: Mutex<Option<EngineSnapshot>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryPersistence {
    fn load(&self) -> Result<Option<EngineSnapshot>> {
        Ok(self
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        Ok(())
    }
}

/// JSON snapshot file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Persistence for JsonFilePersistence {
    fn load(&self) -> Result<Option<EngineSnapshot>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(EngineError::CorruptStore(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        let snapshot: EngineSnapshot = serde_json::from_str(&content).map_err(|e| {
            EngineError::CorruptStore(format!("{}: {}", self.path.display(), e))
        })?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(EngineError::CorruptStore(format!(
                "{}: unsupported snapshot version {}",
                self.path.display(),
                snapshot.version
            )));
        }
        tracing::debug!(
            "Loaded snapshot from {} ({} pools, {} archived)",
            self.path.display(),
            snapshot.pools.len(),
            snapshot.graveyard.len()
        );
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &EngineSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Persistence(format!("{}: {}", parent.display(), e)))?;
        }
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        let tmp = self.temp_path();
        std::fs::write(&tmp, json)
            .map_err(|e| EngineError::Persistence(format!("{}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| EngineError::Persistence(format!("{}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::scored_specialist;
    use crate::specialist::SpecialistStatus;
    use tempfile::TempDir;

    fn snapshot() -> EngineSnapshot {
        let mut pool = DomainPool::new("support", 3, 8);
        pool.add(scored_specialist("support", SpecialistStatus::Active, &[0.7, 0.8]))
            .unwrap();
        pool.generation = 4;
        EngineSnapshot::new(
            vec![pool],
            Graveyard::new(),
            vec![LearningBook::new("support")],
            Vec::new(),
        )
    }

    #[test]
    fn test_missing_file_is_fresh_start() {
        let dir = TempDir::new().unwrap();
        let store = JsonFilePersistence::new(dir.path().join("state.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = JsonFilePersistence::new(dir.path().join("nested").join("state.json"));
        store.save(&snapshot()).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.pools.len(), 1);
        assert_eq!(loaded.pools[0].generation, 4);
        assert_eq!(loaded.pools[0].len(), 1);
        assert!((loaded.pools[0].best_score() - 0.75).abs() < 1e-9);
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_garbage_is_corrupt_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = JsonFilePersistence::new(&path).load().unwrap_err();
        assert!(matches!(err, EngineError::CorruptStore(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_memory_persistence() {
        let store = MemoryPersistence::new();
        assert!(store.load().unwrap().is_none());
        store.save(&snapshot()).unwrap();
        assert_eq!(store.load().unwrap().unwrap().pools[0].domain, "support");
    }
}
