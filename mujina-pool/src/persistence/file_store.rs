//! JSON-lines share store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{ShareStore, StoreError};
use crate::share::Share;

/// Appends each share as one JSON object per line.
pub struct JsonLinesStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesStore {
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ShareStore for JsonLinesStore {
    async fn persist(&self, share: &Share) -> Result<(), StoreError> {
        let mut line =
            serde_json::to_string(share).map_err(|e| StoreError::Permanent(e.to_string()))?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::test_support::share;

    #[tokio::test]
    async fn test_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shares.jsonl");

        let store = JsonLinesStore::open(&path).await.unwrap();
        store.persist(&share("alice", 1)).await.unwrap();
        store.persist(&share("bob", 2)).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let shares: Vec<Share> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(shares.len(), 2);
        assert_eq!(shares[1].miner, "bob");
    }
}
