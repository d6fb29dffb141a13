//! Whole-file JSON snapshots with atomic replacement.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use super::error::LedgerError;
use crate::error::Result;

/// A JSON file rewritten in full on every change.
///
/// Writes go to a sibling temp file and are renamed into place, so the file
/// on disk is always the last complete snapshot. One writer at a time.
#[derive(Debug)]
pub(crate) struct SnapshotFile {
    path: PathBuf,
    writer: Mutex<()>,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, or the default value if the file does not exist yet.
    pub async fn load<T: DeserializeOwned + Default>(&self) -> Result<T> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(self.read_failure(e.to_string()).into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| self.read_failure(e.to_string()).into())
    }

    /// Serialize the current state and replace the file with it.
    ///
    /// The state is read after the writer lock is taken, so the last write to
    /// finish always carries the newest state. A failed write is retried once.
    pub async fn write<T: Serialize>(&self, state: &RwLock<T>) -> Result<()> {
        let _writer = self.writer.lock().await;
        let bytes = {
            let guard = state.read().await;
            serde_json::to_vec_pretty(&*guard).map_err(|e| self.write_failure(e.to_string()))?
        };

        if let Err(first) = self.replace(&bytes).await {
            tracing::warn!(
                target: "tierwise::ledger",
                path = %self.path.display(),
                error = %first,
                "Snapshot write failed, retrying once"
            );
            if let Err(second) = self.replace(&bytes).await {
                tracing::error!(
                    target: "tierwise::ledger",
                    path = %self.path.display(),
                    error = %second,
                    "Snapshot write failed; in-memory state is ahead of disk"
                );
                return Err(self.write_failure(second.to_string()).into());
            }
        }
        Ok(())
    }

    async fn replace(&self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }

    fn read_failure(&self, message: String) -> LedgerError {
        LedgerError::PersistenceReadFailure {
            path: self.path.display().to_string(),
            message,
        }
    }

    fn write_failure(&self, message: String) -> LedgerError {
        LedgerError::PersistenceWriteFailure {
            path: self.path.display().to_string(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TierwiseError;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_missing_file_loads_default() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("nothing.json"));
        let loaded: BTreeMap<String, u32> = file.load().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("nested/state.json"));

        let state = RwLock::new(BTreeMap::from([("a".to_string(), 1u32)]));
        file.write(&state).await.unwrap();

        let loaded: BTreeMap<String, u32> = file.load().await.unwrap();
        assert_eq!(loaded.get("a"), Some(&1));
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_read_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let file = SnapshotFile::new(&path);
        let err = file.load::<BTreeMap<String, u32>>().await.unwrap_err();
        assert!(matches!(
            err,
            TierwiseError::Ledger(LedgerError::PersistenceReadFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_unwritable_path_fails_after_retry() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where a directory should be
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let file = SnapshotFile::new(blocker.join("state.json"));
        let state = RwLock::new(BTreeMap::from([("a".to_string(), 1u32)]));
        let err = file.write(&state).await.unwrap_err();
        assert!(matches!(
            err,
            TierwiseError::Ledger(LedgerError::PersistenceWriteFailure { .. })
        ));
    }
}
