use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{Result, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    pub version: u64,
    pub command: Bytes,
}

/// In-memory, append-only log of mutating commands.
///
/// The version counter is the node version stamped on replicated writes.
/// Records are kept for the life of the process.
#[derive(Debug, Default)]
pub struct Wal {
    version: AtomicU64,
    records: DashMap<u64, Bytes>,
}

impl Wal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `command` under the next version. Versions start at 1 and are
    /// never handed out twice.
    pub fn append(&self, command: Bytes) -> u64 {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.records.insert(version, command);
        tracing::trace!("WAL append at version {}", version);
        version
    }

    pub fn get(&self, version: u64) -> Result<WalRecord> {
        self.records
            .get(&version)
            .map(|command| WalRecord {
                version,
                command: command.value().clone(),
            })
            .ok_or(StorageError::VersionNotFound(version))
    }

    /// Last version handed out, 0 before the first append.
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn versions_start_at_one_and_increase() {
        let wal = Wal::new();
        assert_eq!(wal.current_version(), 0);
        assert_eq!(wal.append(Bytes::from_static(b"PUT a 1")), 1);
        assert_eq!(wal.append(Bytes::from_static(b"PUT b 2")), 2);
        assert_eq!(wal.current_version(), 2);
        assert_eq!(wal.get(1).unwrap().command, Bytes::from_static(b"PUT a 1"));
    }

    #[test]
    fn missing_version_is_an_error() {
        let wal = Wal::new();
        wal.append(Bytes::from_static(b"DELETE a"));
        assert!(matches!(wal.get(7), Err(StorageError::VersionNotFound(7))));
        assert!(matches!(wal.get(0), Err(StorageError::VersionNotFound(0))));
    }

    #[tokio::test]
    async fn concurrent_appends_get_unique_versions() {
        let wal = Arc::new(Wal::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let wal = wal.clone();
            handles.push(tokio::spawn(async move {
                (0..250)
                    .map(|_| wal.append(Bytes::from_static(b"PUT k v")))
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for version in handle.await.unwrap() {
                assert!(seen.insert(version), "duplicate version {}", version);
            }
        }
        assert_eq!(seen.len(), 2000);
        assert_eq!(wal.current_version(), 2000);
        assert_eq!(wal.len(), 2000);
    }
}
