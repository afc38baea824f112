//! Recovery file fallback and replay.
//!
//! Shares the store refused are appended to a plain-text file as JSON
//! lines. Lines starting with `#` are comments. Once the store is healthy
//! again, [`recover_shares`] replays the file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use super::{ShareFallback, ShareStore};
use crate::error::Result;
use crate::share::Share;
use crate::tracing::prelude::*;

const HEADER: &str = "\
# Shares in this file could not be written to the share store.
# Replay them with `mujina-poold --recover-shares <file>` once the store is healthy.
";

/// Appends shares to a recovery file, writing a header on first use.
pub struct RecoveryFile {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl RecoveryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self) -> std::io::Result<File> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        if file.metadata().await?.len() == 0 {
            file.write_all(HEADER.as_bytes()).await?;
        }
        Ok(file)
    }
}

#[async_trait]
impl ShareFallback for RecoveryFile {
    async fn handle(&self, share: &Share) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(share)?;
        line.push('\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
            warn!(path = %self.path.display(), "Writing shares to recovery file.");
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        }
        Ok(())
    }
}

/// Counts from a recovery run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub imported: usize,
    pub failed: usize,
}

/// Replay a recovery file into `store`.
///
/// Comments and blank lines are skipped. Lines that fail to parse or to
/// persist are counted and logged; the rest of the file is still processed.
pub async fn recover_shares(path: &Path, store: &dyn ShareStore) -> Result<RecoveryReport> {
    let file = File::open(path).await?;
    let mut lines = LinesStream::new(BufReader::new(file).lines());
    let mut report = RecoveryReport::default();
    let mut line_no = 0;

    info!(path = %path.display(), "Recovering shares.");

    while let Some(line) = lines.next().await {
        let line = line?;
        line_no += 1;

        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let share: Share = match serde_json::from_str(line) {
            Ok(share) => share,
            Err(e) => {
                warn!(line = line_no, error = %e, "Unparseable recovery line.");
                report.failed += 1;
                continue;
            }
        };

        match store.persist(&share).await {
            Ok(()) => report.imported += 1,
            Err(e) => {
                warn!(line = line_no, error = %e, "Failed to import share.");
                report.failed += 1;
            }
        }
    }

    info!(
        imported = report.imported,
        failed = report.failed,
        "Share recovery finished."
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::StoreError;
    use crate::share::test_support::share;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct MemoryStore {
        shares: SyncMutex<Vec<Share>>,
    }

    #[async_trait]
    impl ShareStore for MemoryStore {
        async fn persist(&self, share: &Share) -> std::result::Result<(), StoreError> {
            if share.miner == "reject" {
                return Err(StoreError::Permanent("rejected".into()));
            }
            self.shares.lock().push(share.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fallback_then_recover() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recovered-shares.txt");
        let recovery = RecoveryFile::new(&path);
        recovery.handle(&share("alice", 10)).await.unwrap();
        recovery.handle(&share("bob", 11)).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# "));
        assert_eq!(text.lines().filter(|l| !l.starts_with('#')).count(), 2);

        let store = MemoryStore::default();
        let report = recover_shares(&path, &store).await.unwrap();
        assert_eq!(report, RecoveryReport { imported: 2, failed: 0 });

        let shares = store.shares.lock();
        assert_eq!(shares[0], share("alice", 10));
        assert_eq!(shares[1].block_height, 11);
    }

    #[tokio::test]
    async fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recovered-shares.txt");
        RecoveryFile::new(&path).handle(&share("a", 1)).await.unwrap();
        RecoveryFile::new(&path).handle(&share("b", 1)).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("could not be written").count(), 1);
    }

    #[tokio::test]
    async fn test_recover_counts_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recovered-shares.txt");
        let good = serde_json::to_string(&share("alice", 1)).unwrap();
        let rejected = serde_json::to_string(&share("reject", 1)).unwrap();
        std::fs::write(&path, format!("# comment\n\n{}\nnot json\n{}\n", good, rejected)).unwrap();

        let store = MemoryStore::default();
        let report = recover_shares(&path, &store).await.unwrap();

        assert_eq!(report, RecoveryReport { imported: 1, failed: 2 });
    }

    #[tokio::test]
    async fn test_recover_missing_file() {
        let store = MemoryStore::default();
        assert!(recover_shares(Path::new("/nonexistent/mujina/shares.txt"), &store)
            .await
            .is_err());
    }
}
