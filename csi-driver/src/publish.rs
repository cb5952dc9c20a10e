//! Controller Publish Tracker
//!
//! Records which nodes each volume is published to and enforces the
//! single-writer rule: a volume published in single-node mode admits at most
//! one node. All mutation goes through [`PublishTracker`]; the controller
//! holds the per-volume lock around every call.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::RwLock;

use crate::csi::volume_capability::access_mode::Mode;
use crate::error::{ConflictKind, DriverError, DriverResult};

/// How many nodes a publication admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// At most one node.
    SingleNode,
    /// Any number of nodes, read-only.
    MultiReader,
    /// Any number of nodes, read-write.
    MultiWriter,
}

impl PublishMode {
    pub fn from_access_mode(mode: Mode) -> Self {
        match mode {
            Mode::MultiNodeReaderOnly | Mode::MultiNodeSingleWriter => PublishMode::MultiReader,
            Mode::MultiNodeMultiWriter => PublishMode::MultiWriter,
            Mode::Unknown
            | Mode::SingleNodeWriter
            | Mode::SingleNodeReaderOnly
            | Mode::SingleNodeSingleWriter
            | Mode::SingleNodeMultiWriter => PublishMode::SingleNode,
        }
    }

    pub const fn is_single_node(self) -> bool {
        matches!(self, PublishMode::SingleNode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    pub mode: PublishMode,
    pub nodes: BTreeSet<String>,
}

/// Outcome of a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    /// The node was added.
    Added,
    /// The node was already published.
    AlreadyPublished,
}

#[derive(Debug, Default)]
pub struct PublishTracker {
    records: RwLock<HashMap<String, PublishRecord>>,
}

impl PublishTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `volume_id` to `node`.
    ///
    /// Fails with a `PublishedElsewhere` conflict if either the existing
    /// record or the request is single-node and another node holds the
    /// volume.
    pub async fn publish(&self, volume_id: &str, node: &str, mode: PublishMode) -> DriverResult<Published> {
        let mut records = self.records.write().await;
        let record = records
            .entry(volume_id.to_string())
            .or_insert_with(|| PublishRecord {
                mode,
                nodes: BTreeSet::new(),
            });

        if record.nodes.contains(node) {
            return Ok(Published::AlreadyPublished);
        }

        if !record.nodes.is_empty() && (record.mode.is_single_node() || mode.is_single_node()) {
            let holders: Vec<&str> = record.nodes.iter().map(String::as_str).collect();
            return Err(DriverError::conflict(
                ConflictKind::PublishedElsewhere,
                format!(
                    "volume {volume_id} is published to {} and does not allow another node",
                    holders.join(",")
                ),
            ));
        }

        if record.nodes.is_empty() {
            record.mode = mode;
        }
        record.nodes.insert(node.to_string());
        Ok(Published::Added)
    }

    /// Remove `node` from `volume_id`. Returns whether it was published.
    pub async fn unpublish(&self, volume_id: &str, node: &str) -> bool {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(volume_id) else {
            return false;
        };
        let removed = record.nodes.remove(node);
        if record.nodes.is_empty() {
            records.remove(volume_id);
        }
        removed
    }

    /// Nodes `volume_id` is published to.
    pub async fn nodes(&self, volume_id: &str) -> Vec<String> {
        self.records
            .read()
            .await
            .get(volume_id)
            .map(|r| r.nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn record(&self, volume_id: &str) -> Option<PublishRecord> {
        self.records.read().await.get(volume_id).cloned()
    }

    /// Drop every record of a deleted volume.
    pub async fn forget(&self, volume_id: &str) {
        self.records.write().await.remove(volume_id);
    }
}
