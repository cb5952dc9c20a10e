//! Volume Provisioning Engine
//!
//! Creates, deletes, expands and snapshots volumes across the configured
//! arrays. Every operation runs under the per-volume (or per-snapshot) lock
//! and is idempotent: the array is the only source of truth, and each call
//! starts by looking up the object its deterministic name points at.
//!
//! Lock order is snapshot id before volume id. Volume operations never take
//! a snapshot lock, so the two can not deadlock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dsm_client::{
    ArrayCapabilities, CloneSource, IscsiTarget, LunSpec, LunType, ObjectKind, ShareSpec,
    SnapshotInfo, SnapshotSpec, StorageObject, StoragePool, TargetSpec,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::error::{ConflictKind, DriverError, DriverResult};
use crate::locks::LockTable;
use crate::naming::{NameInputs, Naming};
use crate::publish::{PublishMode, PublishTracker, Published};
use crate::session::{ArrayHandle, ArraySessionManager};
use crate::types::{BackendKind, Endpoints, ISCSI_PORT, NodeIdentity, ProvisioningMode, context};

const MIB: u64 = 1 << 20;

/// Round a size up to whole MiB, the granularity DSM allocates in.
pub fn round_up_mib(bytes: u64) -> u64 {
    bytes.div_ceil(MIB).saturating_mul(MIB)
}

/// Initial content of a new volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    Snapshot(String),
    Volume(String),
}

/// Everything CreateVolume needs after request validation.
#[derive(Debug, Clone)]
pub struct VolumeRequest {
    pub request_name: String,
    pub size_bytes: u64,
    pub kind: BackendKind,
    pub provisioning: ProvisioningMode,
    /// Only consider this array.
    pub array_hint: Option<String>,
    /// Only consider this storage volume, e.g. `/volume1`.
    pub location_hint: Option<String>,
    pub source: Option<VolumeSource>,
    pub inputs: NameInputs,
}

/// A provisioned volume as seen on its array.
#[derive(Debug, Clone)]
pub struct Volume {
    pub id: String,
    pub host: String,
    pub object: StorageObject,
    /// Known for volumes created or published through this process. Shares
    /// found by listing do not say whether they were made for SMB or NFS.
    pub protocol: Option<BackendKind>,
    pub target_iqn: Option<String>,
    pub portals: Vec<String>,
    pub source: Option<VolumeSource>,
}

impl Volume {
    pub fn capacity_bytes(&self) -> u64 {
        self.object.size_bytes
    }

    /// Volume context handed to the node plugin.
    pub fn context(&self) -> HashMap<String, String> {
        let mut ctx = HashMap::new();
        ctx.insert(context::DSM.to_string(), self.host.clone());

        match self.object.kind {
            ObjectKind::Lun => {
                ctx.insert(context::PROTOCOL.to_string(), BackendKind::Iscsi.to_string());
                if let Some(iqn) = &self.target_iqn {
                    ctx.insert(context::TARGET_IQN.to_string(), iqn.clone());
                }
                if !self.portals.is_empty() {
                    let portals = Endpoints::from_hosts(self.portals.iter().cloned(), ISCSI_PORT);
                    ctx.insert(context::PORTALS.to_string(), portals.to_portal_string());
                }
            }
            ObjectKind::Share => {
                if let Some(protocol) = self.protocol {
                    ctx.insert(context::PROTOCOL.to_string(), protocol.to_string());
                    let source = match protocol {
                        BackendKind::Nfs => format!("{}:{}", self.host, self.object.share_path()),
                        _ => format!("//{}/{}", self.host, self.object.name),
                    };
                    ctx.insert(context::SOURCE.to_string(), source);
                }
            }
        }
        ctx
    }
}

/// A snapshot as seen on its array.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub host: String,
    pub info: SnapshotInfo,
    /// The source volume was deleted while this snapshot was kept.
    pub orphaned: bool,
}

impl Snapshot {
    /// The snapshot id is its name.
    pub fn id(&self) -> &str {
        &self.info.name
    }

    /// Id of the volume the snapshot was taken from.
    pub fn source_volume_id(&self) -> &str {
        &self.info.parent_name
    }
}

fn supports(capabilities: ArrayCapabilities, kind: BackendKind) -> bool {
    match kind {
        BackendKind::Iscsi => capabilities.iscsi,
        BackendKind::Smb => capabilities.smb,
        BackendKind::Nfs => capabilities.nfs,
    }
}

async fn list_objects(handle: &ArrayHandle) -> DriverResult<Vec<StorageObject>> {
    handle
        .call("list_objects", |client, session| async move {
            client.list_objects(&session).await
        })
        .await
}

async fn list_snapshots(handle: &ArrayHandle) -> DriverResult<Vec<SnapshotInfo>> {
    handle
        .call("list_snapshots", |client, session| async move {
            client.list_snapshots(&session).await
        })
        .await
}

async fn list_targets(handle: &ArrayHandle) -> DriverResult<Vec<IscsiTarget>> {
    handle
        .call("list_iscsi_targets", |client, session| async move {
            client.list_iscsi_targets(&session).await
        })
        .await
}

async fn set_initiators(handle: &ArrayHandle, target_id: &str, initiators: &[String]) -> DriverResult<()> {
    handle
        .call("set_initiators", move |client, session| async move {
            client.set_initiators(&session, target_id, initiators).await
        })
        .await
}

/// The controller-side lifecycle engine.
pub struct Provisioner {
    arrays: Arc<ArraySessionManager>,
    naming: Naming,
    locks: LockTable,
    publications: PublishTracker,
    /// Snapshots whose source volume was deleted under them.
    orphans: RwLock<HashSet<String>>,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("arrays", &self.arrays)
            .field("locks", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    pub fn new(config: &DriverConfig, arrays: Arc<ArraySessionManager>, naming: Naming) -> Self {
        Self {
            arrays,
            naming,
            locks: LockTable::new(config.timeouts.lock),
            publications: PublishTracker::new(),
            orphans: RwLock::new(HashSet::new()),
        }
    }

    pub fn publications(&self) -> &PublishTracker {
        &self.publications
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Find the array object a volume id names.
    ///
    /// Every configured array is asked; an unreachable array is an error
    /// rather than a miss so that a retried delete never reports success for
    /// a volume it could not see.
    pub async fn find_volume(&self, volume_id: &str) -> DriverResult<Option<(ArrayHandle, StorageObject)>> {
        for host in self.arrays.hosts() {
            let handle = self.arrays.acquire(&host).await?;
            if let Some(object) = list_objects(&handle)
                .await?
                .into_iter()
                .find(|o| o.name == volume_id)
            {
                return Ok(Some((handle, object)));
            }
        }
        Ok(None)
    }

    pub async fn find_snapshot(&self, snapshot_id: &str) -> DriverResult<Option<(ArrayHandle, SnapshotInfo)>> {
        for host in self.arrays.hosts() {
            let handle = self.arrays.acquire(&host).await?;
            if let Some(snapshot) = list_snapshots(&handle)
                .await?
                .into_iter()
                .find(|s| s.name == snapshot_id)
            {
                return Ok(Some((handle, snapshot)));
            }
        }
        Ok(None)
    }

    /// Describe an existing volume.
    pub async fn get_volume(&self, volume_id: &str) -> DriverResult<Volume> {
        let (handle, object) = self
            .find_volume(volume_id)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("volume {volume_id}")))?;
        let target = match object.kind {
            ObjectKind::Lun => self.target_for(&handle, &object).await?,
            ObjectKind::Share => None,
        };
        Ok(self.describe(&handle, object, None, target.as_ref(), None))
    }

    fn describe(
        &self,
        handle: &ArrayHandle,
        object: StorageObject,
        protocol: Option<BackendKind>,
        target: Option<&IscsiTarget>,
        source: Option<VolumeSource>,
    ) -> Volume {
        let (protocol, target_iqn, portals) = match object.kind {
            ObjectKind::Lun => (
                Some(BackendKind::Iscsi),
                Some(
                    target
                        .map(|t| t.iqn.clone())
                        .unwrap_or_else(|| self.naming.target_iqn(&object.name)),
                ),
                handle.portal_hosts(),
            ),
            ObjectKind::Share => (protocol, None, Vec::new()),
        };
        Volume {
            id: object.name.clone(),
            host: handle.host().to_string(),
            object,
            protocol,
            target_iqn,
            portals,
            source,
        }
    }

    /// Target exporting `lun`, if any.
    async fn target_for(&self, handle: &ArrayHandle, lun: &StorageObject) -> DriverResult<Option<IscsiTarget>> {
        let name = self.naming.target_name(&lun.name);
        Ok(list_targets(handle)
            .await?
            .into_iter()
            .find(|t| t.mapped_luns.contains(&lun.id) || t.name == name))
    }

    /// Make sure `lun` is mapped into its target, creating the target if
    /// needed. Safe to repeat after a partial failure.
    async fn ensure_target(&self, handle: &ArrayHandle, lun: &StorageObject) -> DriverResult<IscsiTarget> {
        let mut target = match self.target_for(handle, lun).await? {
            Some(target) => target,
            None => {
                let spec = TargetSpec {
                    name: self.naming.target_name(&lun.name),
                    iqn: self.naming.target_iqn(&lun.name),
                };
                let spec = &spec;
                let id = handle
                    .call("create_iscsi_target", move |client, session| async move {
                        client.create_iscsi_target(&session, spec).await
                    })
                    .await?;
                info!(target = %spec.name, iqn = %spec.iqn, "Created iSCSI target");
                IscsiTarget {
                    id,
                    name: spec.name.clone(),
                    iqn: spec.iqn.clone(),
                    mapped_luns: Vec::new(),
                    initiators: Vec::new(),
                }
            }
        };

        if !target.mapped_luns.contains(&lun.id) {
            let (target_id, lun_id) = (target.id.as_str(), lun.id.as_str());
            handle
                .call("bind_lun", move |client, session| async move {
                    client.bind_lun(&session, target_id, lun_id).await
                })
                .await?;
            debug!(target = %target.name, lun = %lun.name, "Mapped LUN into target");
            target.mapped_luns.push(lun.id.clone());
        }
        Ok(target)
    }

    // ========================================================================
    // CreateVolume
    // ========================================================================

    pub async fn create_volume(&self, request: &VolumeRequest) -> DriverResult<Volume> {
        let volume_id = self.naming.volume_name(request.kind, &request.inputs)?;
        let size_bytes = round_up_mib(request.size_bytes);
        let _guard = self.locks.acquire(&volume_id).await?;

        if let Some((handle, object)) = self.find_volume(&volume_id).await? {
            return self
                .adopt_existing(&handle, object, request, size_bytes)
                .await;
        }

        let description = self.naming.volume_description(request.kind, &request.inputs);
        let (handle, object) = match &request.source {
            Some(source) => {
                self.create_clone(&volume_id, request, size_bytes, &description, source)
                    .await?
            }
            None => {
                let (handle, pool) = self.select_pool(request.kind, size_bytes, request).await?;
                let object = self
                    .create_object(&handle, &volume_id, request, size_bytes, &description, &pool, None)
                    .await?;
                (handle, object)
            }
        };

        let target = match object.kind {
            ObjectKind::Lun => Some(self.ensure_target(&handle, &object).await?),
            ObjectKind::Share => None,
        };

        info!(
            volume_id = %volume_id,
            host = %handle.host(),
            size_bytes = object.size_bytes,
            kind = %request.kind,
            "Volume created"
        );
        Ok(self.describe(
            &handle,
            object,
            Some(request.kind),
            target.as_ref(),
            request.source.clone(),
        ))
    }

    /// Idempotent path of CreateVolume: the name is already taken.
    async fn adopt_existing(
        &self,
        handle: &ArrayHandle,
        object: StorageObject,
        request: &VolumeRequest,
        size_bytes: u64,
    ) -> DriverResult<Volume> {
        if object.kind != request.kind.object_kind() {
            return Err(DriverError::conflict(
                ConflictKind::SpecMismatch,
                format!(
                    "volume {} exists as a {}, requested {}",
                    object.name,
                    object.kind,
                    request.kind.object_kind()
                ),
            ));
        }
        if object.size_bytes != size_bytes {
            return Err(DriverError::conflict(
                ConflictKind::SpecMismatch,
                format!(
                    "volume {} exists with {} bytes, requested {size_bytes}",
                    object.name, object.size_bytes
                ),
            ));
        }

        // A previous attempt may have stopped between creating the LUN and
        // its target
        let target = match object.kind {
            ObjectKind::Lun => Some(self.ensure_target(handle, &object).await?),
            ObjectKind::Share => None,
        };

        info!(volume_id = %object.name, host = %handle.host(), "Volume already exists");
        Ok(self.describe(
            handle,
            object,
            Some(request.kind),
            target.as_ref(),
            request.source.clone(),
        ))
    }

    /// Pick the pool with the most free space among arrays that support
    /// `kind`. Ties go to the lowest host name, then the lowest location.
    async fn select_pool(
        &self,
        kind: BackendKind,
        size_bytes: u64,
        request: &VolumeRequest,
    ) -> DriverResult<(ArrayHandle, StoragePool)> {
        if let Some(hint) = &request.array_hint
            && !self.arrays.hosts().contains(hint)
        {
            return Err(DriverError::InvalidArgument(format!(
                "array {hint} is not configured"
            )));
        }

        let mut best: Option<(ArrayHandle, StoragePool)> = None;
        for handle in self.arrays.acquire_all().await {
            if request
                .array_hint
                .as_deref()
                .is_some_and(|hint| hint != handle.host())
            {
                continue;
            }
            if !supports(handle.capabilities(), kind) {
                debug!(host = %handle.host(), kind = %kind, "Array does not support protocol");
                continue;
            }

            let mut pools = match handle
                .call("list_pools", |client, session| async move {
                    client.list_pools(&session).await
                })
                .await
            {
                Ok(pools) => pools,
                Err(e) => {
                    warn!(host = %handle.host(), error = %e, "Failed to list storage volumes");
                    continue;
                }
            };
            pools.sort_by(|a, b| a.location.cmp(&b.location));

            for pool in pools {
                if request
                    .location_hint
                    .as_deref()
                    .is_some_and(|location| location != pool.location)
                {
                    continue;
                }
                if pool.free_bytes < size_bytes {
                    continue;
                }
                let better = best
                    .as_ref()
                    .is_none_or(|(_, current)| pool.free_bytes > current.free_bytes);
                if better {
                    best = Some((handle.clone(), pool));
                }
            }
        }

        best.ok_or_else(|| {
            DriverError::ResourceExhausted(format!(
                "no array supporting {kind} has {size_bytes} bytes free"
            ))
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_object(
        &self,
        handle: &ArrayHandle,
        name: &str,
        request: &VolumeRequest,
        size_bytes: u64,
        description: &str,
        pool: &StoragePool,
        source: Option<CloneSource>,
    ) -> DriverResult<StorageObject> {
        let id = match request.kind.object_kind() {
            ObjectKind::Lun => {
                let spec = LunSpec {
                    name: name.to_string(),
                    location: pool.location.clone(),
                    size_bytes,
                    lun_type: LunType::for_pool(&pool.fs_type, request.provisioning.is_thin()),
                    description: description.to_string(),
                    source,
                };
                let spec = &spec;
                handle
                    .call("create_lun", move |client, session| async move {
                        client.create_lun(&session, spec).await
                    })
                    .await?
            }
            ObjectKind::Share => {
                let spec = ShareSpec {
                    name: name.to_string(),
                    location: pool.location.clone(),
                    size_bytes,
                    description: description.to_string(),
                    nfs: request.kind == BackendKind::Nfs,
                    source,
                };
                let spec = &spec;
                handle
                    .call("create_share", move |client, session| async move {
                        client.create_share(&session, spec).await
                    })
                    .await?
            }
        };

        Ok(StorageObject {
            id,
            name: name.to_string(),
            kind: request.kind.object_kind(),
            size_bytes,
            location: pool.location.clone(),
            description: description.to_string(),
        })
    }

    /// Clone onto the source's array and pool, then grow to the requested
    /// size.
    async fn create_clone(
        &self,
        volume_id: &str,
        request: &VolumeRequest,
        size_bytes: u64,
        description: &str,
        source: &VolumeSource,
    ) -> DriverResult<(ArrayHandle, StorageObject)> {
        let (handle, parent, clone_source, source_size) = match source {
            VolumeSource::Snapshot(snapshot_id) => {
                let (handle, snapshot) = self
                    .find_snapshot(snapshot_id)
                    .await?
                    .ok_or_else(|| DriverError::NotFound(format!("snapshot {snapshot_id}")))?;
                let parent = list_objects(&handle)
                    .await?
                    .into_iter()
                    .find(|o| o.id == snapshot.parent_id)
                    .ok_or_else(|| {
                        DriverError::NotFound(format!("parent volume of snapshot {snapshot_id}"))
                    })?;
                let clone_source = CloneSource::Snapshot {
                    parent_id: snapshot.parent_id.clone(),
                    snapshot_id: snapshot.id.clone(),
                };
                (handle, parent, clone_source, snapshot.size_bytes)
            }
            VolumeSource::Volume(source_id) => {
                let (handle, parent) = self
                    .find_volume(source_id)
                    .await?
                    .ok_or_else(|| DriverError::NotFound(format!("volume {source_id}")))?;
                let clone_source = CloneSource::Object {
                    id: parent.id.clone(),
                };
                let size = parent.size_bytes;
                (handle, parent, clone_source, size)
            }
        };

        if parent.kind != request.kind.object_kind() {
            return Err(DriverError::InvalidArgument(format!(
                "cannot create a {} volume from a {} source",
                request.kind.object_kind(),
                parent.kind
            )));
        }
        if size_bytes < source_size {
            return Err(DriverError::OutOfRange(format!(
                "requested {size_bytes} bytes is smaller than the source ({source_size} bytes)"
            )));
        }

        let pool = StoragePool {
            location: parent.location.clone(),
            fs_type: handle
                .call("list_pools", |client, session| async move {
                    client.list_pools(&session).await
                })
                .await?
                .into_iter()
                .find(|p| p.location == parent.location)
                .map(|p| p.fs_type)
                .unwrap_or_default(),
            total_bytes: 0,
            free_bytes: 0,
        };

        let mut object = self
            .create_object(
                &handle,
                volume_id,
                request,
                source_size,
                description,
                &pool,
                Some(clone_source),
            )
            .await?;
        debug!(volume_id = %volume_id, source = ?source, "Cloned volume");

        if size_bytes > object.size_bytes {
            self.resize(&handle, &object, size_bytes).await?;
            object.size_bytes = size_bytes;
        }
        Ok((handle, object))
    }

    async fn resize(&self, handle: &ArrayHandle, object: &StorageObject, size_bytes: u64) -> DriverResult<()> {
        handle
            .call("resize", move |client, session| async move {
                client.resize(&session, object, size_bytes).await
            })
            .await
    }

    // ========================================================================
    // DeleteVolume
    // ========================================================================

    /// Delete a volume. A volume that does not exist is already deleted.
    pub async fn delete_volume(&self, volume_id: &str) -> DriverResult<()> {
        let _guard = self.locks.acquire(volume_id).await?;

        let Some((handle, object)) = self.find_volume(volume_id).await? else {
            info!(volume_id = %volume_id, "Volume not found, treating as already deleted");
            return Ok(());
        };

        let capabilities = handle.capabilities();
        let snapshots: Vec<SnapshotInfo> = list_snapshots(&handle)
            .await?
            .into_iter()
            .filter(|s| s.parent_id == object.id)
            .collect();
        if !snapshots.is_empty() {
            if !capabilities.orphaned_snapshots {
                let names: Vec<&str> = snapshots.iter().map(|s| s.name.as_str()).collect();
                return Err(DriverError::conflict(
                    ConflictKind::HasSnapshots,
                    format!(
                        "volume {volume_id} still has snapshots: {}",
                        names.join(",")
                    ),
                ));
            }
            warn!(
                volume_id = %volume_id,
                count = snapshots.len(),
                "Deleting volume, its snapshots are left orphaned"
            );
        }

        let deleted = match object.kind {
            ObjectKind::Lun => {
                self.delete_targets_of(&handle, &object).await?;
                let id = object.id.as_str();
                handle
                    .call("delete_lun", move |client, session| async move {
                        client.delete_lun(&session, id).await
                    })
                    .await
            }
            ObjectKind::Share => {
                let id = object.id.as_str();
                handle
                    .call("delete_share", move |client, session| async move {
                        client.delete_share(&session, id).await
                    })
                    .await
            }
        };
        match deleted {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(volume_id = %volume_id, "Volume disappeared during delete");
            }
            Err(e) => return Err(e),
        }

        if !snapshots.is_empty() {
            self.orphans
                .write()
                .await
                .extend(snapshots.into_iter().map(|s| s.name));
        }
        self.publications.forget(volume_id).await;
        info!(volume_id = %volume_id, host = %handle.host(), "Volume deleted");
        Ok(())
    }

    /// Delete targets that export only `lun`.
    async fn delete_targets_of(&self, handle: &ArrayHandle, lun: &StorageObject) -> DriverResult<()> {
        let targets = list_targets(handle).await?;
        for target in targets
            .iter()
            .filter(|t| t.mapped_luns.iter().all(|id| *id == lun.id) && t.mapped_luns.contains(&lun.id))
        {
            let target_id = target.id.as_str();
            match handle
                .call("delete_iscsi_target", move |client, session| async move {
                    client.delete_iscsi_target(&session, target_id).await
                })
                .await
            {
                Ok(()) => debug!(target = %target.name, "Deleted iSCSI target"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ========================================================================
    // ControllerExpandVolume
    // ========================================================================

    /// Grow a volume to at least `required_bytes`. Returns the new size and
    /// the backend object kind.
    pub async fn expand_volume(&self, volume_id: &str, required_bytes: u64) -> DriverResult<(u64, ObjectKind)> {
        let _guard = self.locks.acquire(volume_id).await?;

        let (handle, object) = self
            .find_volume(volume_id)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("volume {volume_id}")))?;
        let new_size = round_up_mib(required_bytes);

        if new_size < object.size_bytes {
            return Err(DriverError::OutOfRange(format!(
                "volume {volume_id} has {} bytes, shrinking to {new_size} is not supported",
                object.size_bytes
            )));
        }
        if new_size == object.size_bytes {
            debug!(volume_id = %volume_id, "Volume already has the requested size");
            return Ok((new_size, object.kind));
        }

        self.resize(&handle, &object, new_size).await?;
        info!(
            volume_id = %volume_id,
            old_size = object.size_bytes,
            new_size,
            "Volume expanded"
        );
        Ok((new_size, object.kind))
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub async fn create_snapshot(
        &self,
        request_name: &str,
        source_volume_id: &str,
        parameters: &HashMap<String, String>,
    ) -> DriverResult<Snapshot> {
        let inputs = NameInputs::for_snapshot(request_name, parameters);

        // The snapshot name depends on the parent kind, which needs a lookup
        // before any lock is held
        let (_, parent) = self
            .find_volume(source_volume_id)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("volume {source_volume_id}")))?;
        let snapshot_id = self.naming.snapshot_name(parent.kind, &inputs)?;

        let _snapshot_guard = self.locks.acquire(&snapshot_id).await?;
        let _volume_guard = self.locks.acquire(source_volume_id).await?;

        if let Some((handle, existing)) = self.find_snapshot(&snapshot_id).await? {
            if existing.parent_name != source_volume_id {
                return Err(DriverError::conflict(
                    ConflictKind::SpecMismatch,
                    format!(
                        "snapshot {snapshot_id} already exists for volume {}",
                        existing.parent_name
                    ),
                ));
            }
            info!(snapshot_id = %snapshot_id, "Snapshot already exists");
            let orphaned = self.orphans.read().await.contains(&snapshot_id);
            return Ok(Snapshot {
                host: handle.host().to_string(),
                info: existing,
                orphaned,
            });
        }

        // Look again under the volume lock, the parent may have been deleted
        let (handle, parent) = self
            .find_volume(source_volume_id)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("volume {source_volume_id}")))?;
        if !handle.capabilities().snapshot {
            return Err(DriverError::InvalidArgument(format!(
                "array {} does not support snapshots",
                handle.host()
            )));
        }

        let spec = SnapshotSpec {
            name: snapshot_id.clone(),
            description: self.naming.snapshot_description(&inputs),
            parent_id: parent.id.clone(),
            parent_kind: parent.kind,
        };
        let spec = &spec;
        let info = handle
            .call("create_snapshot", move |client, session| async move {
                client.create_snapshot(&session, spec).await
            })
            .await?;

        info!(
            snapshot_id = %snapshot_id,
            source_volume_id = %source_volume_id,
            host = %handle.host(),
            "Snapshot created"
        );
        Ok(Snapshot {
            host: handle.host().to_string(),
            info,
            orphaned: false,
        })
    }

    /// Delete a snapshot. A snapshot that does not exist is already deleted.
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> DriverResult<()> {
        let _guard = self.locks.acquire(snapshot_id).await?;

        let Some((handle, snapshot)) = self.find_snapshot(snapshot_id).await? else {
            info!(snapshot_id = %snapshot_id, "Snapshot not found, treating as already deleted");
            self.orphans.write().await.remove(snapshot_id);
            return Ok(());
        };

        let snapshot = &snapshot;
        match handle
            .call("delete_snapshot", move |client, session| async move {
                client.delete_snapshot(&session, snapshot).await
            })
            .await
        {
            Ok(()) => {
                info!(snapshot_id = %snapshot_id, host = %handle.host(), "Snapshot deleted");
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.orphans.write().await.remove(snapshot_id);
        Ok(())
    }

    // ========================================================================
    // Listing and capacity
    // ========================================================================

    /// Every managed volume on every reachable array, ordered by id.
    pub async fn list_volumes(&self) -> DriverResult<Vec<Volume>> {
        let mut volumes = Vec::new();
        for handle in self.arrays.acquire_all().await {
            let listed = match list_objects(&handle).await {
                Ok(objects) if objects.iter().any(|o| o.kind == ObjectKind::Lun) => {
                    list_targets(&handle).await.map(|targets| (objects, targets))
                }
                Ok(objects) => Ok((objects, Vec::new())),
                Err(e) => Err(e),
            };
            let (objects, targets) = match listed {
                Ok(listed) => listed,
                Err(e) => {
                    warn!(host = %handle.host(), error = %e, "Failed to list volumes, skipping array");
                    continue;
                }
            };
            for object in objects
                .into_iter()
                .filter(|o| self.naming.is_managed(o.kind, &o.name))
            {
                let target = targets.iter().find(|t| t.mapped_luns.contains(&object.id));
                volumes.push(self.describe(&handle, object, None, target, None));
            }
        }
        volumes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(volumes)
    }

    /// Snapshots of managed volumes, optionally filtered, ordered by id.
    pub async fn list_snapshots(
        &self,
        source_volume_id: Option<&str>,
        snapshot_id: Option<&str>,
    ) -> DriverResult<Vec<Snapshot>> {
        let orphans = self.orphans.read().await.clone();
        let mut snapshots = Vec::new();
        for handle in self.arrays.acquire_all().await {
            let infos = match list_snapshots(&handle).await {
                Ok(infos) => infos,
                Err(e) => {
                    warn!(host = %handle.host(), error = %e, "Failed to list snapshots, skipping array");
                    continue;
                }
            };
            for info in infos {
                if !self.naming.is_managed(info.parent_kind, &info.parent_name) {
                    continue;
                }
                if source_volume_id.is_some_and(|id| id != info.parent_name) {
                    continue;
                }
                if snapshot_id.is_some_and(|id| id != info.name) {
                    continue;
                }
                snapshots.push(Snapshot {
                    host: handle.host().to_string(),
                    orphaned: orphans.contains(&info.name),
                    info,
                });
            }
        }
        snapshots.sort_by(|a, b| a.info.name.cmp(&b.info.name));
        Ok(snapshots)
    }

    /// Free bytes of the largest pool among arrays supporting `kind`.
    pub async fn capacity(&self, kind: BackendKind, array_hint: Option<&str>, location_hint: Option<&str>) -> DriverResult<u64> {
        let mut largest = 0;
        for handle in self.arrays.acquire_all().await {
            if array_hint.is_some_and(|hint| hint != handle.host()) || !supports(handle.capabilities(), kind) {
                continue;
            }
            let pools = match handle
                .call("list_pools", |client, session| async move {
                    client.list_pools(&session).await
                })
                .await
            {
                Ok(pools) => pools,
                Err(e) => {
                    warn!(host = %handle.host(), error = %e, "Failed to list storage volumes, skipping array");
                    continue;
                }
            };
            largest = pools
                .iter()
                .filter(|p| location_hint.is_none_or(|location| location == p.location))
                .map(|p| p.free_bytes)
                .fold(largest, u64::max);
        }
        Ok(largest)
    }

    // ========================================================================
    // ControllerPublish / ControllerUnpublish
    // ========================================================================

    /// Publish a volume to a node.
    ///
    /// For iSCSI volumes the node's initiator is added to the target ACL.
    /// A single-writer publish is refused when another node holds the
    /// volume, either in the publish record or, after a controller restart,
    /// through a foreign initiator left in the ACL.
    pub async fn publish(&self, volume_id: &str, node: &NodeIdentity, mode: PublishMode) -> DriverResult<Volume> {
        let _guard = self.locks.acquire(volume_id).await?;

        let (handle, object) = self
            .find_volume(volume_id)
            .await?
            .ok_or_else(|| DriverError::NotFound(format!("volume {volume_id}")))?;
        let node_id = node.to_string();

        if object.kind == ObjectKind::Share {
            self.publications.publish(volume_id, &node_id, mode).await?;
            info!(volume_id = %volume_id, node = %node_id, "Share published");
            return Ok(self.describe(&handle, object, None, None, None));
        }

        let iqn = node.iqn.as_deref().ok_or_else(|| {
            DriverError::InvalidArgument(format!(
                "node id {node_id} carries no initiator IQN, cannot grant iSCSI access"
            ))
        })?;
        let target = self.ensure_target(&handle, &object).await?;

        if self.publications.record(volume_id).await.is_none() {
            let foreign: Vec<&String> = target.initiators.iter().filter(|i| *i != iqn).collect();
            if !foreign.is_empty() && mode.is_single_node() {
                return Err(DriverError::conflict(
                    ConflictKind::PublishedElsewhere,
                    format!(
                        "volume {volume_id} is still granted to initiator {}",
                        foreign[0]
                    ),
                ));
            }
        }

        let published = self.publications.publish(volume_id, &node_id, mode).await?;

        if !target.initiators.iter().any(|i| i == iqn) {
            let mut initiators = target.initiators.clone();
            initiators.push(iqn.to_string());
            if let Err(e) = set_initiators(&handle, &target.id, &initiators).await {
                if published == Published::Added {
                    self.publications.unpublish(volume_id, &node_id).await;
                }
                return Err(e);
            }
            debug!(target = %target.name, initiator = %iqn, "Granted initiator access");
        }

        info!(volume_id = %volume_id, node = %node_id, "Volume published");
        Ok(self.describe(&handle, object, None, Some(&target), None))
    }

    /// Withdraw a volume from a node. Unknown volumes and nodes are
    /// already unpublished.
    pub async fn unpublish(&self, volume_id: &str, node: &NodeIdentity) -> DriverResult<()> {
        let _guard = self.locks.acquire(volume_id).await?;
        let node_id = node.to_string();

        let Some((handle, object)) = self.find_volume(volume_id).await? else {
            self.publications.forget(volume_id).await;
            info!(volume_id = %volume_id, "Volume not found, treating as unpublished");
            return Ok(());
        };

        if object.kind == ObjectKind::Lun
            && let Some(iqn) = node.iqn.as_deref()
            && let Some(target) = self.target_for(&handle, &object).await?
            && target.initiators.iter().any(|i| i == iqn)
        {
            let remaining: Vec<String> = target
                .initiators
                .iter()
                .filter(|i| *i != iqn)
                .cloned()
                .collect();
            match set_initiators(&handle, &target.id, &remaining).await {
                Ok(()) => debug!(target = %target.name, initiator = %iqn, "Revoked initiator access"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        self.publications.unpublish(volume_id, &node_id).await;
        info!(volume_id = %volume_id, node = %node_id, "Volume unpublished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArrayConfig;
    use crate::session::RetryPolicy;
    use dsm_client::{ArrayClient, Credentials, DsmError, InMemoryArray};
    use std::time::Duration;

    const GIB: u64 = 1 << 30;

    fn provisioner_for(arrays: &[Arc<InMemoryArray>]) -> Provisioner {
        let configs = arrays
            .iter()
            .map(|a| ArrayConfig {
                host: a.host().to_string(),
                port: 5000,
                https: false,
                credentials: Credentials::new("admin", "pw"),
                portals: vec![],
            })
            .collect();
        let arrays: Vec<Arc<InMemoryArray>> = arrays.to_vec();
        let manager = ArraySessionManager::new(
            configs,
            move |config| {
                arrays
                    .iter()
                    .find(|a| a.host() == config.host)
                    .map(|a| Arc::clone(a) as Arc<dyn ArrayClient>)
                    .ok_or_else(|| DriverError::Config(config.host.clone()))
            },
            RetryPolicy {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                ..RetryPolicy::default()
            },
        )
        .unwrap();

        let config = DriverConfig::new("csi.san.synology.com", "controller");
        let naming = Naming::with_templates(config.naming.clone()).unwrap();
        Provisioner::new(&config, Arc::new(manager), naming)
    }

    fn request(name: &str, size: u64, kind: BackendKind) -> VolumeRequest {
        VolumeRequest {
            request_name: name.to_string(),
            size_bytes: size,
            kind,
            provisioning: ProvisioningMode::Thin,
            array_hint: None,
            location_hint: None,
            source: None,
            inputs: NameInputs::for_volume(name, &HashMap::new()),
        }
    }

    fn pool(location: &str, free: u64) -> StoragePool {
        StoragePool {
            location: location.to_string(),
            fs_type: "btrfs".to_string(),
            total_bytes: free,
            free_bytes: free,
        }
    }

    fn node(name: &str) -> NodeIdentity {
        NodeIdentity::new(name, Some(format!("iqn.2005-03.org.open-iscsi:{name}")))
    }

    #[test]
    fn test_round_up_mib() {
        assert_eq!(round_up_mib(0), 0);
        assert_eq!(round_up_mib(1), MIB);
        assert_eq!(round_up_mib(MIB), MIB);
        assert_eq!(round_up_mib(10 * GIB), 10 * GIB);
    }

    #[tokio::test]
    async fn test_create_lun_maps_target() {
        let array = Arc::new(InMemoryArray::new("nas1"));
        let provisioner = provisioner_for(&[Arc::clone(&array)]);

        let volume = provisioner
            .create_volume(&request("pvc-1", GIB, BackendKind::Iscsi))
            .await
            .unwrap();
        assert_eq!(volume.id, "k8s-csi-pvc-1");
        assert_eq!(volume.host, "nas1");
        assert_eq!(
            volume.target_iqn.as_deref(),
            Some("iqn.2000-01.com.synology:k8s-csi-pvc-1")
        );

        let targets = array.targets().await;
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].mapped_luns, vec![volume.object.id.clone()]);
        assert!(targets[0].initiators.is_empty());

        let ctx = volume.context();
        assert_eq!(ctx.get(context::PROTOCOL).map(String::as_str), Some("iscsi"));
        assert_eq!(ctx.get(context::PORTALS).map(String::as_str), Some("nas1:3260"));
    }

    #[tokio::test]
    async fn test_retry_completes_missing_target() {
        let array = Arc::new(InMemoryArray::new("nas1"));
        let provisioner = provisioner_for(&[Arc::clone(&array)]);
        array
            .inject_fault("create_iscsi_target", DsmError::BadRequest("busy".into()))
            .await;

        let req = request("pvc-1", GIB, BackendKind::Iscsi);
        assert!(provisioner.create_volume(&req).await.is_err());
        assert_eq!(array.objects().await.len(), 1);
        assert!(array.targets().await.is_empty());

        provisioner.create_volume(&req).await.unwrap();
        assert_eq!(array.calls("create_lun").await, 1);
        assert_eq!(array.targets().await.len(), 1);
    }

    #[tokio::test]
    async fn test_select_array_with_most_free_space() {
        let small = Arc::new(InMemoryArray::new("nas-a"));
        let large = Arc::new(InMemoryArray::new("nas-b"));
        small.set_pools(vec![pool("/volume1", 20 * GIB)]).await;
        large
            .set_pools(vec![pool("/volume1", 30 * GIB), pool("/volume2", 50 * GIB)])
            .await;
        let provisioner = provisioner_for(&[small, large]);

        let volume = provisioner
            .create_volume(&request("pvc-1", GIB, BackendKind::Iscsi))
            .await
            .unwrap();
        assert_eq!(volume.host, "nas-b");
        assert_eq!(volume.object.location, "/volume2");
    }

    #[tokio::test]
    async fn test_select_array_tie_breaks_on_host() {
        let a = Arc::new(InMemoryArray::new("nas-a"));
        let b = Arc::new(InMemoryArray::new("nas-b"));
        let provisioner = provisioner_for(&[Arc::clone(&b), Arc::clone(&a)]);

        let volume = provisioner
            .create_volume(&request("pvc-1", GIB, BackendKind::Iscsi))
            .await
            .unwrap();
        assert_eq!(volume.host, "nas-a");
    }

    #[tokio::test]
    async fn test_select_array_honours_hints_and_capabilities() {
        let a = Arc::new(InMemoryArray::new("nas-a"));
        let b = Arc::new(InMemoryArray::new("nas-b"));
        a.set_pools(vec![pool("/volume1", 80 * GIB)]).await;
        b.set_pools(vec![pool("/volume1", 10 * GIB)]).await;
        a.set_capabilities(ArrayCapabilities::iscsi_only()).await;
        let provisioner = provisioner_for(&[a, b]);

        // Only nas-b serves SMB
        let share = provisioner
            .create_volume(&request("pvc-1", GIB, BackendKind::Smb))
            .await
            .unwrap();
        assert_eq!(share.host, "nas-b");
        assert!(share.context()[context::SOURCE].starts_with("//nas-b/"));

        let mut hinted = request("pvc-2", GIB, BackendKind::Iscsi);
        hinted.array_hint = Some("nas-b".to_string());
        assert_eq!(provisioner.create_volume(&hinted).await.unwrap().host, "nas-b");

        let mut unknown = request("pvc-3", GIB, BackendKind::Iscsi);
        unknown.array_hint = Some("nas-z".to_string());
        assert!(matches!(
            provisioner.create_volume(&unknown).await,
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_no_capacity_is_resource_exhausted() {
        let array = Arc::new(InMemoryArray::new("nas1"));
        array.set_pools(vec![pool("/volume1", GIB)]).await;
        let provisioner = provisioner_for(&[Arc::clone(&array)]);

        let err = provisioner
            .create_volume(&request("pvc-1", 2 * GIB, BackendKind::Iscsi))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::ResourceExhausted(_)));
        assert_eq!(array.calls("create_lun").await, 0);
    }

    #[tokio::test]
    async fn test_kind_mismatch_conflicts() {
        let array = Arc::new(InMemoryArray::new("nas1"));
        let provisioner = provisioner_for(&[array]);
        provisioner
            .create_volume(&request("pvc-1", GIB, BackendKind::Iscsi))
            .await
            .unwrap();

        let err = provisioner
            .create_volume(&request("pvc-1", GIB, BackendKind::Nfs))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::Conflict {
                kind: ConflictKind::SpecMismatch,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_clone_from_snapshot_grows_to_request() {
        let array = Arc::new(InMemoryArray::new("nas1"));
        let provisioner = provisioner_for(&[Arc::clone(&array)]);
        provisioner
            .create_volume(&request("pvc-1", GIB, BackendKind::Iscsi))
            .await
            .unwrap();
        let snapshot = provisioner
            .create_snapshot("snap-1", "k8s-csi-pvc-1", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(snapshot.id(), "snapshot-snap-1");

        let mut clone = request("pvc-2", 2 * GIB, BackendKind::Iscsi);
        clone.source = Some(VolumeSource::Snapshot(snapshot.id().to_string()));
        let volume = provisioner.create_volume(&clone).await.unwrap();
        assert_eq!(volume.capacity_bytes(), 2 * GIB);
        assert_eq!(array.calls("resize").await, 1);

        let mut too_small = request("pvc-3", GIB / 2, BackendKind::Iscsi);
        too_small.source = Some(VolumeSource::Volume("k8s-csi-pvc-1".to_string()));
        assert!(matches!(
            provisioner.create_volume(&too_small).await,
            Err(DriverError::OutOfRange(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_volume_removes_target() {
        let array = Arc::new(InMemoryArray::new("nas1"));
        let provisioner = provisioner_for(&[Arc::clone(&array)]);
        provisioner
            .create_volume(&request("pvc-1", GIB, BackendKind::Iscsi))
            .await
            .unwrap();

        provisioner.delete_volume("k8s-csi-pvc-1").await.unwrap();
        assert!(array.objects().await.is_empty());
        assert!(array.targets().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_with_orphan_capable_array() {
        let array = Arc::new(InMemoryArray::new("nas1"));
        array
            .set_capabilities(ArrayCapabilities {
                orphaned_snapshots: true,
                ..ArrayCapabilities::all()
            })
            .await;
        let provisioner = provisioner_for(&[Arc::clone(&array)]);
        provisioner
            .create_volume(&request("pvc-1", GIB, BackendKind::Iscsi))
            .await
            .unwrap();
        provisioner
            .create_snapshot("snap-1", "k8s-csi-pvc-1", &HashMap::new())
            .await
            .unwrap();

        provisioner.delete_volume("k8s-csi-pvc-1").await.unwrap();
        assert_eq!(array.snapshots().await.len(), 1);

        let listed = provisioner.list_snapshots(None, None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].orphaned);

        provisioner.delete_snapshot(listed[0].id()).await.unwrap();
        assert!(array.snapshots().await.is_empty());
        assert!(provisioner.orphans.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_expand_volume() {
        let array = Arc::new(InMemoryArray::new("nas1"));
        let provisioner = provisioner_for(&[array]);
        provisioner
            .create_volume(&request("pvc-1", 2 * GIB, BackendKind::Iscsi))
            .await
            .unwrap();

        let (size, kind) = provisioner.expand_volume("k8s-csi-pvc-1", 3 * GIB).await.unwrap();
        assert_eq!(size, 3 * GIB);
        assert_eq!(kind, ObjectKind::Lun);

        assert!(matches!(
            provisioner.expand_volume("k8s-csi-pvc-1", GIB).await,
            Err(DriverError::OutOfRange(_))
        ));
        assert!(provisioner.expand_volume("missing", GIB).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_publish_manages_target_acl() {
        let array = Arc::new(InMemoryArray::new("nas1"));
        let provisioner = provisioner_for(&[Arc::clone(&array)]);
        provisioner
            .create_volume(&request("pvc-1", GIB, BackendKind::Iscsi))
            .await
            .unwrap();

        let a = node("node-a");
        provisioner
            .publish("k8s-csi-pvc-1", &a, PublishMode::SingleNode)
            .await
            .unwrap();
        assert_eq!(array.targets().await[0].initiators, vec![a.iqn.clone().unwrap()]);

        provisioner.unpublish("k8s-csi-pvc-1", &a).await.unwrap();
        assert!(array.targets().await[0].initiators.is_empty());
        assert!(provisioner.publications().nodes("k8s-csi-pvc-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_initiator_blocks_single_writer_after_restart() {
        let array = Arc::new(InMemoryArray::new("nas1"));
        let provisioner = provisioner_for(&[Arc::clone(&array)]);
        provisioner
            .create_volume(&request("pvc-1", GIB, BackendKind::Iscsi))
            .await
            .unwrap();
        provisioner
            .publish("k8s-csi-pvc-1", &node("node-a"), PublishMode::SingleNode)
            .await
            .unwrap();

        // A fresh controller has no publish records, only the array's ACL
        let restarted = provisioner_for(&[Arc::clone(&array)]);
        let err = restarted
            .publish("k8s-csi-pvc-1", &node("node-b"), PublishMode::SingleNode)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::Conflict {
                kind: ConflictKind::PublishedElsewhere,
                ..
            }
        ));

        // The original node can still re-publish
        restarted
            .publish("k8s-csi-pvc-1", &node("node-a"), PublishMode::SingleNode)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_requires_initiator_iqn() {
        let array = Arc::new(InMemoryArray::new("nas1"));
        let provisioner = provisioner_for(&[array]);
        provisioner
            .create_volume(&request("pvc-1", GIB, BackendKind::Iscsi))
            .await
            .unwrap();

        let err = provisioner
            .publish(
                "k8s-csi-pvc-1",
                &NodeIdentity::new("node-a", None),
                PublishMode::SingleNode,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_list_volumes_skips_unmanaged_objects() {
        let array = Arc::new(InMemoryArray::new("nas1"));
        let provisioner = provisioner_for(&[Arc::clone(&array)]);
        provisioner
            .create_volume(&request("pvc-2", GIB, BackendKind::Iscsi))
            .await
            .unwrap();
        provisioner
            .create_volume(&request("pvc-1", GIB, BackendKind::Smb))
            .await
            .unwrap();

        let session = array.login(&Credentials::new("admin", "pw")).await.unwrap();
        array
            .create_share(
                &session,
                &ShareSpec {
                    name: "homes".to_string(),
                    location: "/volume1".to_string(),
                    size_bytes: GIB,
                    description: String::new(),
                    nfs: false,
                    source: None,
                },
            )
            .await
            .unwrap();

        let ids: Vec<String> = provisioner
            .list_volumes()
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.id)
            .collect();
        assert_eq!(ids, vec!["k8s-csi-pvc-1", "k8s-csi-pvc-2"]);
    }

    #[tokio::test]
    async fn test_capacity_reports_largest_pool() {
        let array = Arc::new(InMemoryArray::new("nas1"));
        array
            .set_pools(vec![pool("/volume1", 10 * GIB), pool("/volume2", 40 * GIB)])
            .await;
        let provisioner = provisioner_for(&[array]);

        assert_eq!(
            provisioner.capacity(BackendKind::Iscsi, None, None).await.unwrap(),
            40 * GIB
        );
        assert_eq!(
            provisioner
                .capacity(BackendKind::Iscsi, None, Some("/volume1"))
                .await
                .unwrap(),
            10 * GIB
        );
    }
}
