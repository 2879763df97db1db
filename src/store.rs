//! FleetStore — atomic file persistence for the fleet registry.
//!
//! The whole fleet (nodes, desired/observed state, generation histories)
//! serializes to one JSON document wrapped with a SHA-256 checksum. Writes go
//! through a `.tmp` file and an atomic rename so the file on disk is always a
//! complete document; reads verify the checksum before the registry trusts
//! the contents.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::domain::node::Node;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("fleet store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fleet store serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("checksum verification failed for {path}")]
    ChecksumMismatch { path: PathBuf },
}

/// The persisted fleet document with integrity metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFleet {
    /// SHA-256 over the serialized node list: "sha256:<hex>"
    pub checksum: String,
    pub saved_at: DateTime<Utc>,
    /// Version of the daemon that wrote this document.
    pub writer_version: String,
    /// All registered nodes, in registration order.
    pub nodes: Vec<Node>,
}

impl StoredFleet {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            checksum: checksum_of(&nodes),
            saved_at: Utc::now(),
            writer_version: env!("CARGO_PKG_VERSION").to_string(),
            nodes,
        }
    }

    /// Verify the checksum matches the node list.
    pub fn verify(&self) -> bool {
        self.checksum == checksum_of(&self.nodes)
    }
}

fn checksum_of(nodes: &[Node]) -> String {
    let serialized = serde_json::to_string(nodes).unwrap_or_default();
    let hash = Sha256::digest(serialized.as_bytes());
    format!("sha256:{:x}", hash)
}

pub struct FleetStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FleetStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically write the fleet document: serialize to a `.tmp` file, then
    /// rename over the final path.
    pub async fn write(&self, stored: &StoredFleet) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let content = serde_json::to_string_pretty(stored)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &content)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp_path.clone(),
                source,
            })?;

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;

        Ok(())
    }

    /// Read the fleet document and verify its checksum.
    pub async fn read(&self) -> Result<StoredFleet, StoreError> {
        let content =
            tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|source| StoreError::Io {
                    path: self.path.clone(),
                    source,
                })?;

        let stored: StoredFleet = serde_json::from_str(&content)?;

        if !stored.verify() {
            return Err(StoreError::ChecksumMismatch {
                path: self.path.clone(),
            });
        }

        Ok(stored)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::{ConnectionMeta, NodeId};

    fn sample_node(id: &str) -> Node {
        Node::new(
            NodeId::new(id),
            ConnectionMeta {
                base_url: format!("http://{id}.internal:9100"),
                token: "node-token".to_string(),
                timeout_secs: 10,
            },
        )
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FleetStore::new(dir.path().join("fleet.json"));

        let stored = StoredFleet::new(vec![sample_node("acme"), sample_node("globex")]);
        store.write(&stored).await.unwrap();

        let loaded = store.read().await.unwrap();
        assert_eq!(loaded.nodes.len(), 2);
        assert_eq!(loaded.nodes[0].identity.as_str(), "acme");
        assert!(loaded.verify());
    }

    #[tokio::test]
    async fn corrupt_file_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.json");
        let store = FleetStore::new(path.clone());

        let stored = StoredFleet::new(vec![sample_node("acme")]);
        store.write(&stored).await.unwrap();

        let tampered = tokio::fs::read_to_string(&path)
            .await
            .unwrap()
            .replace("acme", "evil");
        tokio::fs::write(&path, tampered).await.unwrap();

        let err = store.read().await.unwrap_err();
        assert!(matches!(err, StoreError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FleetStore::new(dir.path().join("absent.json"));
        assert!(!store.exists());
        assert!(matches!(
            store.read().await.unwrap_err(),
            StoreError::Io { .. }
        ));
    }
}
