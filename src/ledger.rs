//! Durable store of partial transfer progress, keyed by file identity.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::file::Hashes;
use crate::plan::BlockPlan;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub index: usize,
    pub id: String,
}

/// Resumable progress of one file.
///
/// A state without a plan is a marker left after a failed rapid upload: it
/// only carries the hashes so they are not computed twice.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransferState {
    pub length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<BlockPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<Hashes>,
    #[serde(default)]
    pub blocks: Vec<BlockRecord>,
}

impl TransferState {
    pub fn marker(length: u64, hashes: Option<Hashes>) -> Self {
        Self {
            length,
            plan: None,
            hashes,
            blocks: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
struct LedgerFile {
    #[serde(default)]
    entries: BTreeMap<String, TransferState>,
}

pub struct Ledger {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, TransferState>>,
    saves: AtomicUsize,
}

impl Ledger {
    /// A ledger that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::default(),
            saves: AtomicUsize::new(0),
        }
    }

    /// Loads the ledger at `path`; a missing file is an empty ledger.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str::<LedgerFile>(&content)?.entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        log::debug!("Ledger {} loaded, {} entries", path.display(), entries.len());

        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
            saves: AtomicUsize::new(0),
        })
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, TransferState>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<TransferState> {
        self.entries().get(key).cloned()
    }

    pub fn put(&self, key: &str, state: TransferState) {
        self.entries().insert(key.to_string(), state);
    }

    pub fn delete(&self, key: &str) -> Option<TransferState> {
        self.entries().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the current entries to disk, replacing the previous file.
    pub fn flush(&self) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let content = {
            let entries = self.entries();
            toml::to_string_pretty(&LedgerFile {
                entries: entries.clone(),
            })?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let staging = path.with_extension("tmp");
        std::fs::write(&staging, content)?;
        std::fs::rename(&staging, path)?;
        Ok(())
    }

    /// Same as [`put`](Self::put) followed by [`flush`](Self::flush); flush
    /// failures are logged, never returned.
    pub fn save(&self, key: &str, state: TransferState) {
        self.put(key, state);
        self.saves.fetch_add(1, Ordering::Relaxed);
        self.flush_or_warn();
    }

    /// Number of [`save`](Self::save) calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn remove(&self, key: &str) {
        if self.delete(key).is_some() {
            self.flush_or_warn();
        }
    }

    fn flush_or_warn(&self) {
        if let Err(err) = self.flush() {
            log::warn!("Failed to save transfer ledger: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn state() -> TransferState {
        TransferState {
            length: 10,
            plan: Some(BlockPlan {
                block_size: 4,
                block_count: 3,
            }),
            hashes: Some(Hashes {
                full_hash: "aa".into(),
                slice_hash: "bb".into(),
                integrity: "12".into(),
            }),
            blocks: vec![BlockRecord {
                index: 1,
                id: "cc".into(),
            }],
        }
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.toml");

        let ledger = Ledger::open(&path).unwrap();
        assert!(ledger.is_empty());
        ledger.put("k1", state());
        ledger.put("k2", TransferState::marker(7, None));
        ledger.flush().unwrap();

        let reopened = Ledger::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get("k1"), Some(state()));
        assert_eq!(reopened.get("k2"), Some(TransferState::marker(7, None)));
    }

    #[test]
    fn delete_then_flush_forgets_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.toml");

        let ledger = Ledger::open(&path).unwrap();
        ledger.save("k", state());
        ledger.remove("k");
        assert!(ledger.get("k").is_none());
        assert!(Ledger::open(&path).unwrap().is_empty());
    }

    #[test]
    fn corrupted_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        std::fs::write(&path, "entries = 5").unwrap();
        assert!(matches!(Ledger::open(&path), Err(LedgerError::Decode(_))));
    }

    #[test]
    fn in_memory_flush_is_a_noop() {
        let ledger = Ledger::in_memory();
        ledger.save("k", state());
        assert_eq!(ledger.get("k"), Some(state()));
    }
}
