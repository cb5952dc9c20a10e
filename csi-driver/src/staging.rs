//! Node Staging Engine
//!
//! Drives each volume on this node through
//! `Unstaged → Staging → Staged → Publishing → Published → Unpublishing →
//! Staged → Unstaging → Unstaged`. Every transition runs under the
//! per-volume lock. A transition that was cancelled midway leaves its
//! transient state behind; the next Stage or Unstage tears the volume down
//! completely before doing its own work instead of resuming.
//!
//! Publications are counted per target path, so pods sharing a volume on
//! one node never unmount each other's view, and a volume with live
//! publications refuses to unstage.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::error::{ConflictKind, DriverError, DriverResult};
use crate::locks::LockTable;
use crate::multipath::MultipathReconciler;
use crate::naming::Naming;
use crate::platform::{FsStats, HostOps, PathKind};
use crate::types::{BackendKind, Endpoints, FsGroupChangePolicy, FsType, ISCSI_PORT, context};

const DEVICE_POLL: Duration = Duration::from_millis(200);

/// Secret keys carrying SMB credentials.
pub const SECRET_USERNAME: &str = "username";
pub const SECRET_PASSWORD: &str = "password";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Unstaged,
    Staging,
    Staged,
    Publishing,
    Published,
    Unpublishing,
    Unstaging,
}

impl VolumeState {
    /// Whether a call was cut off while the volume was in this state.
    fn is_transient(self) -> bool {
        matches!(
            self,
            VolumeState::Staging
                | VolumeState::Publishing
                | VolumeState::Unpublishing
                | VolumeState::Unstaging
        )
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Where a volume's data comes from, parsed from the volume and publish
/// contexts.
#[derive(Debug, Clone)]
pub enum VolumeBacking {
    Iscsi {
        target_iqn: String,
        portals: Endpoints,
    },
    Smb {
        source: String,
        username: Option<String>,
        password: Option<SecretString>,
    },
    Nfs {
        source: String,
    },
}

impl VolumeBacking {
    /// Parse the backing from the publish context (preferred) and the
    /// volume context.
    pub fn from_context(
        volume_context: &HashMap<String, String>,
        publish_context: &HashMap<String, String>,
        secrets: &HashMap<String, String>,
    ) -> DriverResult<Self> {
        let lookup = |key: &str| {
            publish_context
                .get(key)
                .or_else(|| volume_context.get(key))
                .filter(|v| !v.is_empty())
        };

        let protocol = lookup(context::PROTOCOL)
            .map(|p| p.parse::<BackendKind>())
            .transpose()
            .map_err(|e| DriverError::InvalidArgument(e.to_string()))?
            .unwrap_or_default();

        match protocol {
            BackendKind::Iscsi => {
                let target_iqn = lookup(context::TARGET_IQN).ok_or_else(|| {
                    DriverError::InvalidArgument(format!(
                        "{} is required in volume context",
                        context::TARGET_IQN
                    ))
                })?;
                let portals = lookup(context::PORTALS)
                    .or_else(|| lookup(context::DSM))
                    .ok_or_else(|| {
                        DriverError::InvalidArgument(format!(
                            "{} is required in volume context",
                            context::PORTALS
                        ))
                    })?;
                let portals = Endpoints::parse(portals, ISCSI_PORT)
                    .map_err(|e| DriverError::InvalidArgument(e.to_string()))?;
                Ok(VolumeBacking::Iscsi {
                    target_iqn: target_iqn.clone(),
                    portals,
                })
            }
            BackendKind::Smb | BackendKind::Nfs => {
                let source = lookup(context::SOURCE)
                    .ok_or_else(|| {
                        DriverError::InvalidArgument(format!(
                            "{} is required in volume context",
                            context::SOURCE
                        ))
                    })?
                    .clone();
                if protocol == BackendKind::Nfs {
                    return Ok(VolumeBacking::Nfs { source });
                }
                Ok(VolumeBacking::Smb {
                    source,
                    username: secrets.get(SECRET_USERNAME).cloned(),
                    password: secrets
                        .get(SECRET_PASSWORD)
                        .map(|p| SecretString::from(p.clone())),
                })
            }
        }
    }

    fn target_iqn(&self) -> Option<&str> {
        match self {
            VolumeBacking::Iscsi { target_iqn, .. } => Some(target_iqn),
            _ => None,
        }
    }
}

/// How the workload consumes the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessKind {
    Mount {
        fs_type: Option<FsType>,
        flags: Vec<String>,
        /// fsGroup of the pod, applied per the fsGroup change policy.
        mount_group: Option<u32>,
    },
    Block,
}

impl AccessKind {
    fn mount_group(&self) -> Option<u32> {
        match self {
            AccessKind::Mount { mount_group, .. } => *mount_group,
            AccessKind::Block => None,
        }
    }
}

#[derive(Debug)]
pub struct StageRequest {
    pub volume_id: String,
    pub staging_path: PathBuf,
    pub backing: VolumeBacking,
    pub access: AccessKind,
}

#[derive(Debug)]
pub struct PublishRequest {
    pub volume_id: String,
    pub staging_path: PathBuf,
    pub target_path: PathBuf,
    pub readonly: bool,
    pub access: AccessKind,
}

/// Node-local record of one volume.
#[derive(Debug, Clone)]
struct NodeVolume {
    state: VolumeState,
    staging_path: PathBuf,
    target_iqn: Option<String>,
    /// Aggregated block device, for iSCSI volumes.
    device: Option<PathBuf>,
    multipath: bool,
    smb: bool,
    block: bool,
    targets: BTreeSet<PathBuf>,
}

impl NodeVolume {
    fn state(&self) -> VolumeState {
        if self.state == VolumeState::Staged && !self.targets.is_empty() {
            VolumeState::Published
        } else {
            self.state
        }
    }
}

/// Usage figures for NodeGetVolumeStats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeStats {
    pub block: bool,
    pub stats: FsStats,
    /// Set when the volume path is not mounted.
    pub abnormal: Option<String>,
}

fn is_multipath_device(device: &str) -> bool {
    device.starts_with("/dev/mapper/") || device.starts_with("/dev/dm-")
}

fn is_share_source(source: &str) -> bool {
    source.starts_with("//") || source.contains(":/")
}

pub struct StagingEngine {
    host: Arc<dyn HostOps>,
    reconciler: MultipathReconciler,
    naming: Naming,
    locks: LockTable,
    multipath_enabled: bool,
    device_timeout: Duration,
    fs_group_policy: FsGroupChangePolicy,
    volumes: RwLock<HashMap<String, NodeVolume>>,
}

impl StagingEngine {
    pub fn new(config: &DriverConfig, host: Arc<dyn HostOps>, naming: Naming) -> Self {
        Self {
            reconciler: MultipathReconciler::new(Arc::clone(&host), config.timeouts.multipath),
            host,
            naming,
            locks: LockTable::new(config.timeouts.lock),
            multipath_enabled: config.multipath_enabled,
            device_timeout: config.timeouts.device,
            fs_group_policy: config.fs_group_change_policy,
            volumes: RwLock::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &Arc<dyn HostOps> {
        &self.host
    }

    pub async fn state(&self, volume_id: &str) -> VolumeState {
        self.volumes
            .read()
            .await
            .get(volume_id)
            .map(NodeVolume::state)
            .unwrap_or(VolumeState::Unstaged)
    }

    async fn entry(&self, volume_id: &str) -> Option<NodeVolume> {
        self.volumes.read().await.get(volume_id).cloned()
    }

    async fn store(&self, volume_id: &str, volume: NodeVolume) {
        self.volumes.write().await.insert(volume_id.to_string(), volume);
    }

    async fn set_state(&self, volume_id: &str, state: VolumeState) {
        if let Some(volume) = self.volumes.write().await.get_mut(volume_id) {
            volume.state = state;
        }
    }

    async fn forget(&self, volume_id: &str) {
        self.volumes.write().await.remove(volume_id);
    }

    // ========================================================================
    // Stage / Unstage
    // ========================================================================

    /// Stage a volume at its staging path.
    ///
    /// Returns the device (iSCSI) or share source the volume is staged from.
    /// Staging a volume that is already staged at the same path is a no-op.
    pub async fn stage(&self, request: &StageRequest) -> DriverResult<String> {
        let volume_id = request.volume_id.as_str();
        let _guard = self.locks.acquire(volume_id).await?;

        match self.entry(volume_id).await {
            Some(volume) if !volume.state.is_transient() => {
                if volume.staging_path != request.staging_path {
                    return Err(DriverError::conflict(
                        ConflictKind::InUse,
                        format!(
                            "volume {volume_id} is staged at {}",
                            volume.staging_path.display()
                        ),
                    ));
                }
                info!(volume_id, "Volume already staged");
                return Ok(Self::staged_from(&volume));
            }
            Some(volume) => {
                warn!(
                    volume_id,
                    state = %volume.state,
                    "Volume left in an intermediate state, tearing down before staging again"
                );
                let known_map = volume.device.as_deref().filter(|_| volume.multipath);
                self.teardown(&volume.staging_path, volume.target_iqn.as_deref(), known_map)
                    .await?;
                self.forget(volume_id).await;
            }
            None => {
                if let Some(adopted) = self.adopt(request).await? {
                    info!(volume_id, source = %adopted, "Adopted mounted staging path");
                    return Ok(adopted);
                }
            }
        }

        self.store(
            volume_id,
            NodeVolume {
                state: VolumeState::Staging,
                staging_path: request.staging_path.clone(),
                target_iqn: request.backing.target_iqn().map(str::to_string),
                device: None,
                multipath: false,
                smb: matches!(request.backing, VolumeBacking::Smb { .. }),
                block: request.access == AccessKind::Block,
                targets: BTreeSet::new(),
            },
        )
        .await;

        let result = match &request.backing {
            VolumeBacking::Iscsi {
                target_iqn,
                portals,
            } => self.stage_iscsi(request, target_iqn, portals).await,
            VolumeBacking::Smb { .. } | VolumeBacking::Nfs { .. } => self.stage_share(request).await,
        };

        match result {
            Ok((device, multipath)) => {
                let mut volumes = self.volumes.write().await;
                let staged_from = match volumes.get_mut(volume_id) {
                    Some(volume) => {
                        volume.state = VolumeState::Staged;
                        volume.multipath = multipath;
                        volume.device = device.clone();
                        Self::staged_from(volume)
                    }
                    None => String::new(),
                };
                info!(volume_id, source = %staged_from, "Volume staged");
                Ok(staged_from)
            }
            Err(e) => {
                warn!(volume_id, error = %e, "Staging failed, cleaning up");
                if let Err(cleanup) = self
                    .teardown(&request.staging_path, request.backing.target_iqn(), None)
                    .await
                {
                    warn!(volume_id, error = %cleanup, "Cleanup after failed staging failed");
                    // Keep the Staging entry so the next call tears down again
                    return Err(e);
                }
                self.forget(volume_id).await;
                Err(e)
            }
        }
    }

    fn staged_from(volume: &NodeVolume) -> String {
        volume
            .device
            .as_ref()
            .map(|d| d.to_string_lossy().into_owned())
            .unwrap_or_else(|| volume.staging_path.to_string_lossy().into_owned())
    }

    /// Take over a staging path mounted by an earlier plugin instance.
    async fn adopt(&self, request: &StageRequest) -> DriverResult<Option<String>> {
        let Some(source) = self.host.mount_source(&request.staging_path).await? else {
            return Ok(None);
        };
        let iscsi = request.backing.target_iqn().map(str::to_string);
        let device = iscsi.as_ref().map(|_| PathBuf::from(&source));

        self.store(
            &request.volume_id,
            NodeVolume {
                state: VolumeState::Staged,
                staging_path: request.staging_path.clone(),
                target_iqn: iscsi,
                multipath: device.is_some() && is_multipath_device(&source),
                device,
                smb: matches!(request.backing, VolumeBacking::Smb { .. }),
                block: false,
                targets: BTreeSet::new(),
            },
        )
        .await;
        Ok(Some(source))
    }

    async fn stage_iscsi(
        &self,
        request: &StageRequest,
        target_iqn: &str,
        portals: &Endpoints,
    ) -> DriverResult<(Option<PathBuf>, bool)> {
        // Without multipath only the first portal is used
        let portals: Vec<_> = if self.multipath_enabled {
            portals.as_slice().iter().collect()
        } else {
            portals.first().into_iter().collect()
        };

        let mut logged_in = 0;
        let mut last_error = None;
        for portal in &portals {
            match self.host.iscsi_login(target_iqn, portal).await {
                Ok(()) => logged_in += 1,
                Err(e) if portals.len() > 1 => {
                    warn!(portal = %portal, error = %e, "iSCSI login failed for portal, continuing with the others");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        if logged_in == 0 {
            return Err(last_error.unwrap_or_else(|| {
                DriverError::InvalidArgument(format!("no portals for {target_iqn}"))
            }));
        }

        let paths = self.wait_for_devices(target_iqn, logged_in).await?;
        let (device, multipath) = if self.multipath_enabled {
            let aggregated = self.reconciler.reconcile(&paths).await?;
            (aggregated.device, aggregated.multipath)
        } else {
            (paths[0].clone(), false)
        };

        if let AccessKind::Mount { fs_type, flags, .. } = &request.access {
            let fs_type = match self.host.filesystem_type(&device).await? {
                Some(existing) => {
                    if fs_type.is_some_and(|wanted| wanted.to_string() != existing) {
                        warn!(
                            device = %device.display(),
                            existing = %existing,
                            "Device already carries a different filesystem, keeping it"
                        );
                    }
                    existing
                }
                None => {
                    let fs_type = fs_type.unwrap_or_default();
                    self.host.format(&device, fs_type).await?;
                    fs_type.to_string()
                }
            };
            self.host.ensure_dir(&request.staging_path).await?;
            self.host
                .mount(&device.to_string_lossy(), &request.staging_path, &fs_type, flags)
                .await?;
        }

        Ok((Some(device), multipath))
    }

    /// Poll until `expected` session devices of `target_iqn` exist.
    async fn wait_for_devices(&self, target_iqn: &str, expected: usize) -> DriverResult<Vec<PathBuf>> {
        let deadline = Instant::now() + self.device_timeout;
        let mut delay = DEVICE_POLL;
        loop {
            let devices = self.host.iscsi_devices(target_iqn).await?;
            if devices.len() >= expected {
                debug!(target_iqn, devices = ?devices, "iSCSI devices present");
                return Ok(devices);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DriverError::DeviceTimeout(format!(
                    "{expected} block devices of {target_iqn}, found {}",
                    devices.len()
                )));
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(Duration::from_secs(2));
        }
    }

    async fn stage_share(&self, request: &StageRequest) -> DriverResult<(Option<PathBuf>, bool)> {
        let mut options = match &request.access {
            AccessKind::Mount { flags, .. } => flags.clone(),
            AccessKind::Block => {
                return Err(DriverError::InvalidArgument(
                    "block access is not supported for shares".to_string(),
                ));
            }
        };

        let (source, fs_type) = match &request.backing {
            VolumeBacking::Smb {
                source,
                username,
                password,
            } => {
                if let Some(username) = username {
                    options.push(format!("username={username}"));
                }
                if let Some(password) = password {
                    options.push(format!("password={}", password.expose_secret()));
                }
                // CIFS has no ownership of its own, the group comes from the mount
                if let Some(gid) = request.access.mount_group() {
                    options.push(format!("gid={gid}"));
                    options.push("file_mode=0770".to_string());
                    options.push("dir_mode=0770".to_string());
                }
                (source.as_str(), "cifs")
            }
            VolumeBacking::Nfs { source } => (source.as_str(), "nfs"),
            VolumeBacking::Iscsi { .. } => {
                return Err(DriverError::Internal("iSCSI volume staged as share".to_string()));
            }
        };

        self.host.ensure_dir(&request.staging_path).await?;
        self.host
            .mount(source, &request.staging_path, fs_type, &options)
            .await?;
        Ok((None, false))
    }

    /// Unmount the staging path, flush multipath maps and log out.
    async fn teardown(&self, staging_path: &Path, target_iqn: Option<&str>, known_map: Option<&Path>) -> DriverResult<()> {
        self.host.unmount(staging_path).await?;
        if let Some(target_iqn) = target_iqn {
            self.reconciler.teardown(target_iqn, known_map).await?;
            self.host.iscsi_logout(target_iqn).await?;
        }
        Ok(())
    }

    /// Unstage a volume. Unstaging an unstaged volume succeeds.
    pub async fn unstage(&self, volume_id: &str, staging_path: &Path) -> DriverResult<()> {
        let _guard = self.locks.acquire(volume_id).await?;

        let (target_iqn, known_map) = match self.entry(volume_id).await {
            Some(volume) => {
                if !volume.targets.is_empty() {
                    let targets: Vec<String> = volume
                        .targets
                        .iter()
                        .map(|t| t.display().to_string())
                        .collect();
                    return Err(DriverError::conflict(
                        ConflictKind::InUse,
                        format!(
                            "volume {volume_id} is still published at {}",
                            targets.join(", ")
                        ),
                    ));
                }
                self.set_state(volume_id, VolumeState::Unstaging).await;
                let map = if volume.multipath { volume.device } else { None };
                (volume.target_iqn, map)
            }
            None => {
                // No record after a restart: derive the target from the id
                // unless a share is mounted at the staging path
                let source = self.host.mount_source(staging_path).await?;
                if source.as_deref().is_some_and(is_share_source) {
                    (None, None)
                } else {
                    let map = source
                        .filter(|s| is_multipath_device(s))
                        .map(PathBuf::from);
                    (Some(self.naming.target_iqn(volume_id)), map)
                }
            }
        };

        self.teardown(staging_path, target_iqn.as_deref(), known_map.as_deref())
            .await?;
        self.forget(volume_id).await;

        info!(volume_id, staging_path = %staging_path.display(), "Volume unstaged");
        Ok(())
    }

    // ========================================================================
    // Publish / Unpublish
    // ========================================================================

    /// Bind the staged volume into a workload's target path.
    pub async fn publish(&self, request: &PublishRequest) -> DriverResult<()> {
        let volume_id = request.volume_id.as_str();
        let _guard = self.locks.acquire(volume_id).await?;

        let volume = match self.entry(volume_id).await {
            Some(volume) if matches!(volume.state, VolumeState::Staging | VolumeState::Unstaging) => {
                return Err(DriverError::conflict(
                    ConflictKind::NotStaged,
                    format!("volume {volume_id} is {}", volume.state),
                ));
            }
            Some(volume) => volume,
            None => {
                let Some(source) = self.host.mount_source(&request.staging_path).await? else {
                    return Err(DriverError::conflict(
                        ConflictKind::NotStaged,
                        format!(
                            "volume {volume_id} is not staged at {}",
                            request.staging_path.display()
                        ),
                    ));
                };
                let volume = NodeVolume {
                    state: VolumeState::Staged,
                    staging_path: request.staging_path.clone(),
                    target_iqn: (!is_share_source(&source)).then(|| self.naming.target_iqn(volume_id)),
                    multipath: is_multipath_device(&source),
                    device: (!is_share_source(&source)).then(|| PathBuf::from(&source)),
                    smb: source.starts_with("//"),
                    block: false,
                    targets: BTreeSet::new(),
                };
                self.store(volume_id, volume.clone()).await;
                volume
            }
        };

        if volume.targets.contains(&request.target_path)
            && self.host.is_mounted(&request.target_path).await?
        {
            info!(volume_id, target_path = %request.target_path.display(), "Volume already published");
            return Ok(());
        }

        self.set_state(volume_id, VolumeState::Publishing).await;
        let result = self.bind(&volume, request).await;
        self.set_state(volume_id, VolumeState::Staged).await;
        result?;

        if let Some(volume) = self.volumes.write().await.get_mut(volume_id) {
            volume.targets.insert(request.target_path.clone());
        }
        info!(
            volume_id,
            target_path = %request.target_path.display(),
            readonly = request.readonly,
            "Volume published"
        );
        Ok(())
    }

    async fn bind(&self, volume: &NodeVolume, request: &PublishRequest) -> DriverResult<()> {
        let target = &request.target_path;
        match &request.access {
            AccessKind::Block => {
                let device = volume.device.as_ref().ok_or_else(|| {
                    DriverError::InvalidArgument(format!(
                        "volume {} has no block device",
                        request.volume_id
                    ))
                })?;
                self.host.ensure_file(target).await?;
                self.host.bind_mount(device, target, request.readonly).await
            }
            AccessKind::Mount { mount_group, .. } => {
                self.host.ensure_dir(target).await?;
                self.host
                    .bind_mount(&volume.staging_path, target, request.readonly)
                    .await?;
                if let Some(gid) = mount_group
                    && !request.readonly
                    && !volume.smb
                {
                    self.apply_fs_group(target, *gid).await?;
                }
                Ok(())
            }
        }
    }

    async fn apply_fs_group(&self, path: &Path, gid: u32) -> DriverResult<()> {
        let change = match self.fs_group_policy {
            FsGroupChangePolicy::None => false,
            FsGroupChangePolicy::Always => true,
            FsGroupChangePolicy::OnRootMismatch => self.host.group_of(path).await? != gid,
        };
        if change {
            self.host.change_group(path, gid).await?;
        }
        Ok(())
    }

    /// Remove one target path. Other publications of the volume stay.
    pub async fn unpublish(&self, volume_id: &str, target_path: &Path) -> DriverResult<()> {
        let _guard = self.locks.acquire(volume_id).await?;

        // A half-staged or half-unstaged entry keeps its state so the next
        // stage still tears it down
        let staged = self.entry(volume_id).await.is_some_and(|volume| {
            matches!(
                volume.state,
                VolumeState::Staged | VolumeState::Publishing | VolumeState::Unpublishing
            )
        });
        if staged {
            self.set_state(volume_id, VolumeState::Unpublishing).await;
        }
        self.host.unmount(target_path).await?;
        self.host.remove_path(target_path).await?;

        let mut volumes = self.volumes.write().await;
        if let Some(volume) = volumes.get_mut(volume_id) {
            volume.targets.remove(target_path);
            if staged {
                volume.state = VolumeState::Staged;
            }
            debug!(volume_id, remaining = volume.targets.len(), "Publication removed");
        }
        info!(volume_id, target_path = %target_path.display(), "Volume unpublished");
        Ok(())
    }

    // ========================================================================
    // Expand / Stats
    // ========================================================================

    /// Grow the node side of a volume after the controller resized it.
    /// Returns the new size in bytes.
    pub async fn expand(&self, volume_id: &str, volume_path: &Path) -> DriverResult<u64> {
        let _guard = self.locks.acquire(volume_id).await?;

        let entry = self.entry(volume_id).await;
        let source = self.host.mount_source(volume_path).await?;
        let block = match &entry {
            Some(volume) => volume.block,
            None => self.host.path_kind(volume_path).await? == PathKind::File,
        };

        let target_iqn = match &entry {
            Some(volume) => volume.target_iqn.clone(),
            None if source.as_deref().is_some_and(is_share_source) => None,
            None => Some(self.naming.target_iqn(volume_id)),
        };
        let Some(target_iqn) = target_iqn else {
            // Share quotas grow on the array alone
            return Ok(self.host.filesystem_stats(volume_path).await?.total_bytes);
        };

        self.host.iscsi_rescan(&target_iqn).await?;

        let device = entry
            .as_ref()
            .and_then(|v| v.device.clone())
            .or_else(|| source.clone().filter(|s| s.starts_with("/dev/")).map(PathBuf::from));
        if let Some(device) = &device
            && is_multipath_device(&device.to_string_lossy())
        {
            self.host.multipath_resize(device).await?;
        }

        if block {
            let device = device.unwrap_or_else(|| volume_path.to_path_buf());
            return self.host.block_device_size(&device).await;
        }

        let device = device.ok_or_else(|| {
            DriverError::NotFound(format!("device of volume {volume_id} at {}", volume_path.display()))
        })?;
        let fs_type = self
            .host
            .filesystem_type(&device)
            .await?
            .unwrap_or_else(|| FsType::default().to_string());
        self.host
            .resize_filesystem(&device, volume_path, &fs_type)
            .await?;
        let size = self.host.filesystem_stats(volume_path).await?.total_bytes;
        info!(volume_id, size, "Volume filesystem expanded");
        Ok(size)
    }

    pub async fn stats(&self, volume_path: &Path) -> DriverResult<VolumeStats> {
        let kind = self.host.path_kind(volume_path).await?;
        if kind == PathKind::Missing {
            return Err(DriverError::NotFound(format!(
                "volume path {}",
                volume_path.display()
            )));
        }

        let abnormal = (!self.host.is_mounted(volume_path).await?)
            .then(|| format!("{} is not mounted", volume_path.display()));

        if kind == PathKind::File {
            let size = self.host.block_device_size(volume_path).await?;
            return Ok(VolumeStats {
                block: true,
                stats: FsStats {
                    total_bytes: size,
                    ..FsStats::default()
                },
                abnormal,
            });
        }

        Ok(VolumeStats {
            block: false,
            stats: self.host.filesystem_stats(volume_path).await?,
            abnormal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamingConfig;
    use crate::platform::testing::FakeHost;

    const VOLUME: &str = "k8s-csi-pvc-1";
    const IQN: &str = "iqn.2000-01.com.synology:k8s-csi-pvc-1";
    const STAGING: &str = "/var/lib/kubelet/plugins/staging/pv-1";
    const TARGET_A: &str = "/var/lib/kubelet/pods/a/volumes/pv-1";
    const TARGET_B: &str = "/var/lib/kubelet/pods/b/volumes/pv-1";

    fn engine(host: &Arc<FakeHost>, configure: impl FnOnce(&mut DriverConfig)) -> StagingEngine {
        let mut config = DriverConfig::new("csi.san.synology.com", "node-1");
        config.timeouts.device = Duration::from_secs(5);
        config.timeouts.multipath = Duration::from_secs(5);
        configure(&mut config);
        let naming = Naming::with_templates(NamingConfig::default()).unwrap();
        StagingEngine::new(&config, host.clone(), naming)
    }

    fn two_path_host(second_wwid: &str) -> Arc<FakeHost> {
        let host = Arc::new(FakeHost::new());
        host.add_lun(
            IQN,
            &[
                ("10.0.0.1:3260", "/dev/sdb", "36001405aaaa"),
                ("10.0.1.1:3260", "/dev/sdc", second_wwid),
            ],
        );
        host
    }

    fn iscsi_stage(access: AccessKind) -> StageRequest {
        StageRequest {
            volume_id: VOLUME.to_string(),
            staging_path: PathBuf::from(STAGING),
            backing: VolumeBacking::Iscsi {
                target_iqn: IQN.to_string(),
                portals: Endpoints::parse("10.0.0.1,10.0.1.1", ISCSI_PORT).unwrap(),
            },
            access,
        }
    }

    fn mount_access() -> AccessKind {
        AccessKind::Mount {
            fs_type: Some(FsType::Ext4),
            flags: vec![],
            mount_group: None,
        }
    }

    fn publish_request(target: &str, access: AccessKind) -> PublishRequest {
        PublishRequest {
            volume_id: VOLUME.to_string(),
            staging_path: PathBuf::from(STAGING),
            target_path: PathBuf::from(target),
            readonly: false,
            access,
        }
    }

    #[test]
    fn test_backing_from_context() {
        let mut volume_context = HashMap::new();
        volume_context.insert("targetIqn".to_string(), IQN.to_string());
        volume_context.insert("portals".to_string(), "10.0.0.1:3260,10.0.1.1:3260".to_string());
        let backing = VolumeBacking::from_context(&volume_context, &HashMap::new(), &HashMap::new()).unwrap();
        match backing {
            VolumeBacking::Iscsi { target_iqn, portals } => {
                assert_eq!(target_iqn, IQN);
                assert_eq!(portals.len(), 2);
            }
            other => panic!("unexpected backing {other:?}"),
        }

        let mut smb_context = HashMap::new();
        smb_context.insert("protocol".to_string(), "smb".to_string());
        smb_context.insert("source".to_string(), "//nas/k8s-csi-pvc-2".to_string());
        let mut secrets = HashMap::new();
        secrets.insert("username".to_string(), "csi".to_string());
        secrets.insert("password".to_string(), "pw".to_string());
        let backing = VolumeBacking::from_context(&smb_context, &HashMap::new(), &secrets).unwrap();
        assert!(matches!(
            backing,
            VolumeBacking::Smb { ref username, .. } if username.as_deref() == Some("csi")
        ));

        // iSCSI without a target IQN
        assert!(VolumeBacking::from_context(&HashMap::new(), &HashMap::new(), &HashMap::new()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_is_idempotent() {
        let host = two_path_host("36001405aaaa");
        let engine = engine(&host, |_| {});

        let device = engine.stage(&iscsi_stage(mount_access())).await.unwrap();
        assert_eq!(device, "/dev/mapper/36001405aaaa");
        assert_eq!(engine.state(VOLUME).await, VolumeState::Staged);
        assert_eq!(host.sessions().len(), 2);
        assert_eq!(host.filesystem("/dev/mapper/36001405aaaa").as_deref(), Some("ext4"));
        assert_eq!(
            host.mounts().get(Path::new(STAGING)).map(String::as_str),
            Some("/dev/mapper/36001405aaaa")
        );

        // Second stage returns the same device without touching the host
        let again = engine.stage(&iscsi_stage(mount_access())).await.unwrap();
        assert_eq!(again, device);
        assert_eq!(host.count("iscsi_login"), 2);
        assert_eq!(host.count("mount"), 1);
        assert_eq!(host.count("format"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_filesystem_is_not_reformatted() {
        let host = two_path_host("36001405aaaa");
        host.set_filesystem("/dev/mapper/36001405aaaa", "xfs");
        let engine = engine(&host, |_| {});

        engine.stage(&iscsi_stage(mount_access())).await.unwrap();
        assert_eq!(host.count("format"), 0);
        assert_eq!(host.filesystem("/dev/mapper/36001405aaaa").as_deref(), Some("xfs"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_diverged_paths_leave_nothing_staged() {
        let host = two_path_host("36001405bbbb");
        let engine = engine(&host, |_| {});

        let err = engine.stage(&iscsi_stage(mount_access())).await.unwrap_err();
        assert!(matches!(err, DriverError::MultipathDiverged(_)));
        assert_eq!(engine.state(VOLUME).await, VolumeState::Unstaged);
        assert!(host.sessions().is_empty());
        assert!(host.mounts().is_empty());
        assert_eq!(host.count("format"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_portal_without_multipath() {
        let host = two_path_host("36001405aaaa");
        let engine = engine(&host, |config| config.multipath_enabled = false);

        let device = engine.stage(&iscsi_stage(mount_access())).await.unwrap();
        assert_eq!(device, "/dev/sdb");
        assert_eq!(host.sessions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unstage_refused_while_published() {
        let host = two_path_host("36001405aaaa");
        let engine = engine(&host, |_| {});
        engine.stage(&iscsi_stage(mount_access())).await.unwrap();

        engine.publish(&publish_request(TARGET_A, mount_access())).await.unwrap();
        engine.publish(&publish_request(TARGET_B, mount_access())).await.unwrap();
        assert_eq!(engine.state(VOLUME).await, VolumeState::Published);

        // One pod goes away, the other keeps its view
        engine.unpublish(VOLUME, Path::new(TARGET_A)).await.unwrap();
        let mounts = host.mounts();
        assert!(!mounts.contains_key(Path::new(TARGET_A)));
        assert!(mounts.contains_key(Path::new(TARGET_B)));

        let err = engine.unstage(VOLUME, Path::new(STAGING)).await.unwrap_err();
        assert!(matches!(
            err,
            DriverError::Conflict {
                kind: ConflictKind::InUse,
                ..
            }
        ));
        assert!(host.mounts().contains_key(Path::new(STAGING)));

        engine.unpublish(VOLUME, Path::new(TARGET_B)).await.unwrap();
        engine.unstage(VOLUME, Path::new(STAGING)).await.unwrap();
        assert!(host.mounts().is_empty());
        assert!(host.sessions().is_empty());
        assert_eq!(engine.state(VOLUME).await, VolumeState::Unstaged);

        // Flush happens before logout
        let flush = host.position("multipath_flush").unwrap();
        let logout = host.position("iscsi_logout").unwrap();
        assert!(flush < logout);

        // Unstaging again is a no-op
        engine.unstage(VOLUME, Path::new(STAGING)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_twice_is_noop() {
        let host = two_path_host("36001405aaaa");
        let engine = engine(&host, |_| {});
        engine.stage(&iscsi_stage(mount_access())).await.unwrap();

        engine.publish(&publish_request(TARGET_A, mount_access())).await.unwrap();
        engine.publish(&publish_request(TARGET_A, mount_access())).await.unwrap();
        assert_eq!(host.count("bind_mount"), 1);
    }

    #[tokio::test]
    async fn test_publish_requires_staging() {
        let host = Arc::new(FakeHost::new());
        let engine = engine(&host, |_| {});
        let err = engine
            .publish(&publish_request(TARGET_A, mount_access()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::Conflict {
                kind: ConflictKind::NotStaged,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_adopts_mounted_staging_path_after_restart() {
        let host = two_path_host("36001405aaaa");
        host.preset_mount("/dev/mapper/36001405aaaa", STAGING);
        let engine = engine(&host, |_| {});

        let device = engine.stage(&iscsi_stage(mount_access())).await.unwrap();
        assert_eq!(device, "/dev/mapper/36001405aaaa");
        assert_eq!(host.count("iscsi_login"), 0);
        assert_eq!(engine.state(VOLUME).await, VolumeState::Staged);
    }

    #[tokio::test]
    async fn test_unstage_without_record_derives_target() {
        let host = two_path_host("36001405aaaa");
        for portal in ["10.0.0.1", "10.0.1.1"] {
            host.iscsi_login(IQN, &crate::types::Endpoint::new(portal, ISCSI_PORT))
                .await
                .unwrap();
        }
        host.preset_mount("/dev/mapper/36001405aaaa", STAGING);
        let engine = engine(&host, |_| {});

        engine.unstage(VOLUME, Path::new(STAGING)).await.unwrap();
        assert!(host.sessions().is_empty());
        assert!(host.mounts().is_empty());
        assert_eq!(host.count("multipath_flush"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_stage_is_torn_down() {
        let host = two_path_host("36001405bbbb");
        let engine = engine(&host, |config| {
            config.timeouts.multipath = Duration::from_secs(600);
        });

        // Cut the stage off while it waits for the paths to converge
        let cancelled = tokio::time::timeout(
            Duration::from_secs(1),
            engine.stage(&iscsi_stage(mount_access())),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(engine.state(VOLUME).await, VolumeState::Staging);
        assert_eq!(host.sessions().len(), 2);

        engine.unstage(VOLUME, Path::new(STAGING)).await.unwrap();
        assert!(host.sessions().is_empty());
        assert_eq!(engine.state(VOLUME).await, VolumeState::Unstaged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpublish_keeps_half_staged_volume_for_teardown() {
        let host = two_path_host("36001405bbbb");
        let engine = engine(&host, |config| {
            config.timeouts.multipath = Duration::from_secs(600);
        });

        let cancelled = tokio::time::timeout(
            Duration::from_secs(1),
            engine.stage(&iscsi_stage(mount_access())),
        )
        .await;
        assert!(cancelled.is_err());

        // A stray unpublish must not promote the entry to Staged
        engine.unpublish(VOLUME, Path::new(TARGET_A)).await.unwrap();
        assert_eq!(engine.state(VOLUME).await, VolumeState::Staging);

        // Paths converge now; the next stage tears down and starts over
        host.add_lun(
            IQN,
            &[
                ("10.0.0.1:3260", "/dev/sdb", "36001405aaaa"),
                ("10.0.1.1:3260", "/dev/sdc", "36001405aaaa"),
            ],
        );
        let device = engine.stage(&iscsi_stage(mount_access())).await.unwrap();
        assert_eq!(device, "/dev/mapper/36001405aaaa");
        assert_eq!(host.count("iscsi_logout"), 1);
        assert_eq!(host.count("iscsi_login"), 4);
        assert_eq!(host.sessions().len(), 2);
        assert_eq!(
            host.mounts().get(Path::new(STAGING)).map(String::as_str),
            Some("/dev/mapper/36001405aaaa")
        );
        assert_eq!(engine.state(VOLUME).await, VolumeState::Staged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_access() {
        let host = two_path_host("36001405aaaa");
        let engine = engine(&host, |_| {});

        engine.stage(&iscsi_stage(AccessKind::Block)).await.unwrap();
        assert_eq!(host.count("format"), 0);
        assert!(host.mounts().is_empty());

        engine.publish(&publish_request(TARGET_A, AccessKind::Block)).await.unwrap();
        assert_eq!(
            host.mounts().get(Path::new(TARGET_A)).map(String::as_str),
            Some("/dev/mapper/36001405aaaa")
        );
        assert_eq!(
            host.path_kind(Path::new(TARGET_A)).await.unwrap(),
            PathKind::File
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fs_group_on_root_mismatch() {
        let host = two_path_host("36001405aaaa");
        let engine = engine(&host, |_| {});
        engine.stage(&iscsi_stage(mount_access())).await.unwrap();

        let grouped = AccessKind::Mount {
            fs_type: None,
            flags: vec![],
            mount_group: Some(2000),
        };
        engine.publish(&publish_request(TARGET_A, grouped.clone())).await.unwrap();
        assert_eq!(host.group(TARGET_A), Some(2000));
        assert_eq!(host.count("change_group"), 1);

        // Root already carries the group
        host.set_group(TARGET_B, 2000);
        engine.publish(&publish_request(TARGET_B, grouped)).await.unwrap();
        assert_eq!(host.count("change_group"), 1);
    }

    #[tokio::test]
    async fn test_fs_group_policy_none() {
        let host = two_path_host("36001405aaaa");
        host.preset_mount("/dev/mapper/36001405aaaa", STAGING);
        let engine = engine(&host, |config| {
            config.fs_group_change_policy = FsGroupChangePolicy::None;
        });
        engine.stage(&iscsi_stage(mount_access())).await.unwrap();

        let grouped = AccessKind::Mount {
            fs_type: None,
            flags: vec![],
            mount_group: Some(2000),
        };
        engine.publish(&publish_request(TARGET_A, grouped)).await.unwrap();
        assert_eq!(host.count("change_group"), 0);
    }

    #[tokio::test]
    async fn test_smb_share_stage_and_unstage() {
        let host = Arc::new(FakeHost::new());
        let engine = engine(&host, |_| {});
        let request = StageRequest {
            volume_id: "k8s-csi-pvc-2".to_string(),
            staging_path: PathBuf::from(STAGING),
            backing: VolumeBacking::Smb {
                source: "//nas/k8s-csi-pvc-2".to_string(),
                username: Some("csi".to_string()),
                password: Some(SecretString::from("pw".to_string())),
            },
            access: mount_access(),
        };

        let source = engine.stage(&request).await.unwrap();
        assert_eq!(source, STAGING);
        assert_eq!(
            host.mounts().get(Path::new(STAGING)).map(String::as_str),
            Some("//nas/k8s-csi-pvc-2")
        );

        engine.unstage("k8s-csi-pvc-2", Path::new(STAGING)).await.unwrap();
        assert!(host.mounts().is_empty());
        assert_eq!(host.count("iscsi_logout"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expand_resizes_filesystem() {
        let host = two_path_host("36001405aaaa");
        let engine = engine(&host, |_| {});
        engine.stage(&iscsi_stage(mount_access())).await.unwrap();
        engine.publish(&publish_request(TARGET_A, mount_access())).await.unwrap();

        let size = engine.expand(VOLUME, Path::new(TARGET_A)).await.unwrap();
        assert_eq!(size, 1 << 30);
        assert_eq!(host.count("iscsi_rescan"), 1);
        assert_eq!(host.count("multipath_resize"), 1);
        assert_eq!(host.count("resize_filesystem"), 1);
    }

    #[tokio::test]
    async fn test_stats() {
        let host = Arc::new(FakeHost::new());
        host.preset_mount("/dev/sdb", TARGET_A);
        let engine = engine(&host, |_| {});

        let stats = engine.stats(Path::new(TARGET_A)).await.unwrap();
        assert!(!stats.block);
        assert!(stats.abnormal.is_none());
        assert_eq!(stats.stats.total_bytes, 1 << 30);

        host.unmount(Path::new(TARGET_A)).await.unwrap();
        let stats = engine.stats(Path::new(TARGET_A)).await.unwrap();
        assert!(stats.abnormal.is_some());

        assert!(engine.stats(Path::new("/missing")).await.unwrap_err().is_not_found());
    }
}
