//! Driver configuration.
//!
//! Everything the driver needs to know is folded into one immutable
//! [`DriverConfig`] at startup and handed to each component as
//! `Arc<DriverConfig>`. Array credentials come from the client-info YAML
//! file and are kept apart in [`ArrayConfig`] values owned by the session
//! manager.

use std::path::Path;
use std::time::Duration;

use dsm_client::Credentials;
use serde::Deserialize;
use tracing::info;

use crate::error::{DriverError, DriverResult};
use crate::types::FsGroupChangePolicy;

pub const DEFAULT_DSM_PORT: u16 = 5000;

/// Connection settings for one storage array.
#[derive(Debug)]
pub struct ArrayConfig {
    pub host: String,
    pub port: u16,
    pub https: bool,
    pub credentials: Credentials,
    /// Extra iSCSI portal addresses for multipath. The array host itself is
    /// always the first portal.
    pub portals: Vec<String>,
}

impl ArrayConfig {
    /// All portal hosts of this array, the management address first.
    pub fn portal_hosts(&self) -> Vec<String> {
        let mut hosts = vec![self.host.clone()];
        for portal in &self.portals {
            if !hosts.contains(portal) {
                hosts.push(portal.clone());
            }
        }
        hosts
    }
}

#[derive(Debug, Deserialize)]
struct ClientInfoFile {
    #[serde(default)]
    clients: Vec<ClientEntry>,
}

#[derive(Debug, Deserialize)]
struct ClientEntry {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default, alias = "useHttps")]
    https: bool,
    #[serde(alias = "user")]
    username: String,
    password: String,
    #[serde(default)]
    portals: Vec<String>,
}

fn default_port() -> u16 {
    DEFAULT_DSM_PORT
}

/// Parse the client-info YAML document.
pub fn parse_client_info(yaml: &str) -> DriverResult<Vec<ArrayConfig>> {
    let file: ClientInfoFile = serde_yaml::from_str(yaml)
        .map_err(|e| DriverError::Config(format!("invalid client info: {e}")))?;

    let mut arrays: Vec<ArrayConfig> = Vec::with_capacity(file.clients.len());
    for entry in file.clients {
        if entry.host.trim().is_empty() {
            return Err(DriverError::Config("client entry with empty host".into()));
        }
        if arrays.iter().any(|a| a.host == entry.host) {
            return Err(DriverError::Config(format!(
                "array {} listed more than once",
                entry.host
            )));
        }
        arrays.push(ArrayConfig {
            host: entry.host,
            port: entry.port,
            https: entry.https,
            credentials: Credentials::new(entry.username, entry.password),
            portals: entry.portals,
        });
    }
    Ok(arrays)
}

/// Load the client-info YAML file.
pub async fn load_client_info(path: &Path) -> DriverResult<Vec<ArrayConfig>> {
    let yaml = tokio::fs::read_to_string(path).await.map_err(|e| {
        DriverError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let arrays = parse_client_info(&yaml)?;
    info!(path = %path.display(), arrays = arrays.len(), "Loaded client info");
    Ok(arrays)
}

/// Prefixes and templates used to derive backend object names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingConfig {
    pub target_prefix: String,
    pub iqn_prefix: String,
    pub lun_prefix: String,
    pub share_prefix: String,
    pub lun_name_template: String,
    pub share_name_template: String,
    pub lun_description_template: String,
    pub share_description_template: String,
    pub lun_snapshot_name_template: String,
    pub share_snapshot_name_template: String,
    pub snapshot_description_template: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            target_prefix: "k8s-csi".to_string(),
            iqn_prefix: "iqn.2000-01.com.synology:".to_string(),
            lun_prefix: "k8s-csi".to_string(),
            share_prefix: "k8s-csi".to_string(),
            lun_name_template: "{{.LunPrefix}}-{{.VolumeHandle}}".to_string(),
            share_name_template: "{{.SharePrefix}}-{{.VolumeHandle}}".to_string(),
            lun_description_template: "{{.PVCNamespace}}/{{.PVCName}}".to_string(),
            share_description_template: "{{.PVCNamespace}}/{{.PVCName}}".to_string(),
            lun_snapshot_name_template: "snapshot-{{.SnapshotHandle}}".to_string(),
            share_snapshot_name_template: "snapshot-{{.SnapshotHandle}}".to_string(),
            snapshot_description_template:
                "{{.VolumeSnapshotNamespace}}/{{.VolumeSnapshotName}}".to_string(),
        }
    }
}

/// Bounds on every blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Waiting for a per-volume lock.
    pub lock: Duration,
    /// One array WebAPI request.
    pub api: Duration,
    /// Block devices appearing after iSCSI login.
    pub device: Duration,
    /// Multipath convergence.
    pub multipath: Duration,
    /// One host command (iscsiadm, mkfs, mount, ...).
    pub command: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            lock: Duration::from_secs(15),
            api: Duration::from_secs(30),
            device: Duration::from_secs(60),
            multipath: Duration::from_secs(60),
            command: Duration::from_secs(120),
        }
    }
}

/// Immutable process-wide configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub driver_name: String,
    pub node_id: String,
    pub multipath_enabled: bool,
    pub fs_group_change_policy: FsGroupChangePolicy,
    pub naming: NamingConfig,
    pub timeouts: Timeouts,
    /// Log WebAPI request summaries.
    pub debug: bool,
}

impl DriverConfig {
    pub fn new(driver_name: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.into(),
            node_id: node_id.into(),
            multipath_enabled: true,
            fs_group_change_policy: FsGroupChangePolicy::default(),
            naming: NamingConfig::default(),
            timeouts: Timeouts::default(),
            debug: false,
        }
    }
}
