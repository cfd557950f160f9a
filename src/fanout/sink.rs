//! Payload sinks
//!
//! A [`PayloadSink`] receives every fetched leaf payload. The orchestrator
//! asks it first whether it already holds a payload, so re-runs skip work
//! that finished in an earlier process.

use crate::fault::Fault;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Destination for fetched leaf payloads
#[async_trait]
pub trait PayloadSink: Send + Sync {
    /// True if the payload for `leaf` in `group` is already held
    async fn contains(&self, group: &str, leaf: &str) -> bool;

    /// Hand over a fetched, non-empty payload
    async fn store(&self, group: &str, leaf: &str, payload: Bytes) -> Result<(), Fault>;
}

/// Writes payloads to `<root>/<group>/<leaf>`
#[derive(Clone, Debug)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    /// Create a sink rooted at `root` (created on first store)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where `leaf` of `group` is written
    ///
    /// Each id must be a single plain path component.
    pub fn path_for(&self, group: &str, leaf: &str) -> Result<PathBuf, Fault> {
        for name in [group, leaf] {
            let mut components = Path::new(name).components();
            let plain = matches!(
                (components.next(), components.next()),
                (Some(Component::Normal(_)), None)
            );
            if !plain {
                return Err(Fault::storage(
                    format!("{group}/{leaf}"),
                    format!("'{name}' is not a plain file name"),
                ));
            }
        }
        Ok(self.root.join(group).join(leaf))
    }
}

#[async_trait]
impl PayloadSink for DirectorySink {
    async fn contains(&self, group: &str, leaf: &str) -> bool {
        let Ok(path) = self.path_for(group, leaf) else {
            return false;
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.is_file() && meta.len() > 0,
            Err(_) => false,
        }
    }

    async fn store(&self, group: &str, leaf: &str, payload: Bytes) -> Result<(), Fault> {
        let path = self.path_for(group, leaf)?;
        let storage_fault = |e: std::io::Error| Fault::storage(path.display().to_string(), e);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(storage_fault)?;
        }

        // Write beside the target and rename so a crash never leaves a
        // truncated file that `contains` would accept
        let partial = path.with_file_name(format!(".{leaf}.{}.part", Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&partial, &payload).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(storage_fault(e));
        }
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(storage_fault)?;

        tracing::debug!(
            path = %path.display(),
            bytes = payload.len(),
            "Stored payload"
        );
        Ok(())
    }
}

/// Keeps only a tally of stored payloads
///
/// Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct DiscardSink {
    stored: Mutex<HashMap<(String, String), usize>>,
}

impl DiscardSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct payloads stored
    pub async fn stored_count(&self) -> usize {
        self.stored.lock().await.len()
    }

    /// Total payload bytes stored
    pub async fn total_bytes(&self) -> usize {
        self.stored.lock().await.values().sum()
    }
}

#[async_trait]
impl PayloadSink for DiscardSink {
    async fn contains(&self, group: &str, leaf: &str) -> bool {
        self.stored
            .lock()
            .await
            .contains_key(&(group.to_string(), leaf.to_string()))
    }

    async fn store(&self, group: &str, leaf: &str, payload: Bytes) -> Result<(), Fault> {
        self.stored
            .lock()
            .await
            .insert((group.to_string(), leaf.to_string()), payload.len());
        Ok(())
    }
}
