//! CSI Controller Service Implementation
//!
//! Thin gRPC layer over the [`Provisioner`]: validates requests, parses
//! StorageClass parameters and converts results to CSI messages.

use std::collections::HashMap;
use std::sync::Arc;

use dsm_client::ObjectKind;
use prost_types::Timestamp;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::csi;
use crate::csi::volume_capability::access_mode::Mode;
use crate::error::DriverError;
use crate::metrics::OperationTimer;
use crate::naming::NameInputs;
use crate::provisioner::{Provisioner, Snapshot, Volume, VolumeRequest, VolumeSource};
use crate::publish::PublishMode;
use crate::types::{BackendKind, FsType, NodeIdentity, ProvisioningMode, context, params};

/// Default volume size: 1GB
const DEFAULT_VOLUME_SIZE: i64 = 1024 * 1024 * 1024;

/// Report a failed RPC: log it, count it and turn it into a status.
pub(crate) fn fail(timer: OperationTimer, operation: &str, err: DriverError) -> Status {
    let status = Status::from(err);
    match status.code() {
        tonic::Code::NotFound
        | tonic::Code::AlreadyExists
        | tonic::Code::FailedPrecondition
        | tonic::Code::Aborted
        | tonic::Code::InvalidArgument
        | tonic::Code::OutOfRange => {
            warn!(operation, error = %status.message(), "Request rejected")
        }
        _ => error!(operation, error = %status.message(), "Request failed"),
    }
    timer.failure(&format!("{:?}", status.code()));
    status
}

fn to_i64(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

/// Slice one page out of a sorted listing.
///
/// The token is the index of the first entry of the page. CSI requires an
/// unusable token to fail with ABORTED.
fn paginate<T>(items: Vec<T>, max_entries: i32, starting_token: &str) -> Result<(Vec<T>, String), Status> {
    if max_entries < 0 {
        return Err(Status::invalid_argument("max_entries must not be negative"));
    }
    let max_entries = if max_entries > 0 {
        max_entries as usize
    } else {
        items.len()
    };

    let start_idx = if !starting_token.is_empty() {
        starting_token
            .parse::<usize>()
            .map_err(|_| Status::aborted(format!("invalid starting_token '{starting_token}'")))?
    } else {
        0
    };

    let total_len = items.len();
    if start_idx > total_len {
        return Err(Status::aborted(format!(
            "starting_token {start_idx} is past the end of the listing"
        )));
    }
    let end_idx = std::cmp::min(start_idx + max_entries, total_len);

    let page: Vec<T> = items
        .into_iter()
        .skip(start_idx)
        .take(end_idx - start_idx)
        .collect();

    let next_token = if end_idx < total_len {
        end_idx.to_string()
    } else {
        String::new()
    };

    Ok((page, next_token))
}

/// Parsed StorageClass parameters of a CreateVolume or GetCapacity call.
#[derive(Debug, Clone, PartialEq, Eq)]
struct VolumeParameters {
    kind: BackendKind,
    provisioning: ProvisioningMode,
    fs_type: Option<FsType>,
    array_hint: Option<String>,
    location_hint: Option<String>,
}

impl VolumeParameters {
    fn parse(parameters: &HashMap<String, String>) -> Result<Self, Status> {
        let non_empty = |key: &str| parameters.get(key).filter(|v| !v.is_empty()).cloned();

        let kind = non_empty(params::PROTOCOL)
            .map(|v| v.parse::<BackendKind>())
            .transpose()
            .map_err(|e| Status::invalid_argument(e.to_string()))?
            .unwrap_or_default();
        let provisioning = non_empty(ProvisioningMode::PARAM_NAME)
            .map(|v| v.parse::<ProvisioningMode>())
            .transpose()
            .map_err(|e| Status::invalid_argument(e.to_string()))?
            .unwrap_or_default();
        let fs_type = non_empty(params::FS_TYPE)
            .or_else(|| non_empty(params::CSI_FS_TYPE))
            .map(|v| v.parse::<FsType>())
            .transpose()
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        Ok(Self {
            kind,
            provisioning,
            fs_type,
            array_hint: non_empty(params::DSM),
            location_hint: non_empty(params::LOCATION),
        })
    }
}

/// Check volume capabilities against the object kind backing a volume.
///
/// - Mount access works for every kind; block access only for LUNs
/// - Multi-node writers need block access on LUNs (ext4/xfs are not
///   cluster filesystems), shares allow them with mount access
fn validate_volume_capabilities(kind: ObjectKind, capabilities: &[csi::VolumeCapability]) -> Result<(), String> {
    let mut unsupported_reasons: Vec<String> = Vec::new();

    for cap in capabilities {
        let is_block = matches!(
            &cap.access_type,
            Some(csi::volume_capability::AccessType::Block(_))
        );

        match &cap.access_type {
            Some(csi::volume_capability::AccessType::Mount(_)) => {}
            Some(csi::volume_capability::AccessType::Block(_)) => {
                if kind == ObjectKind::Share {
                    unsupported_reasons.push("block access is not supported for shares".to_string());
                }
            }
            None => {
                unsupported_reasons.push("Volume capability must specify access type".to_string());
            }
        }

        let Some(access_mode) = &cap.access_mode else {
            unsupported_reasons.push("Volume capability must specify access mode".to_string());
            continue;
        };
        match Mode::try_from(access_mode.mode) {
            Ok(Mode::SingleNodeWriter)
            | Ok(Mode::SingleNodeReaderOnly)
            | Ok(Mode::SingleNodeSingleWriter)
            | Ok(Mode::SingleNodeMultiWriter)
            | Ok(Mode::MultiNodeReaderOnly) => {}
            Ok(mode @ (Mode::MultiNodeSingleWriter | Mode::MultiNodeMultiWriter)) => {
                if kind == ObjectKind::Lun && !is_block {
                    unsupported_reasons.push(format!(
                        "{} not supported for mount volumes on iSCSI",
                        mode.as_str_name()
                    ));
                }
            }
            Ok(Mode::Unknown) | Err(_) => {
                unsupported_reasons.push(format!("Unknown access mode: {}", access_mode.mode));
            }
        }
    }

    if unsupported_reasons.is_empty() {
        Ok(())
    } else {
        Err(unsupported_reasons.join("; "))
    }
}

fn volume_to_csi(volume: &Volume, fs_type: Option<FsType>) -> csi::Volume {
    let mut volume_context = volume.context();
    if let Some(fs_type) = fs_type {
        volume_context.insert(context::FS_TYPE.to_string(), fs_type.to_string());
    }

    let content_source = volume.source.as_ref().map(|source| csi::VolumeContentSource {
        r#type: Some(match source {
            VolumeSource::Snapshot(id) => csi::volume_content_source::Type::Snapshot(
                csi::volume_content_source::SnapshotSource {
                    snapshot_id: id.clone(),
                },
            ),
            VolumeSource::Volume(id) => csi::volume_content_source::Type::Volume(
                csi::volume_content_source::VolumeSource {
                    volume_id: id.clone(),
                },
            ),
        }),
    });

    csi::Volume {
        capacity_bytes: to_i64(volume.capacity_bytes()),
        volume_id: volume.id.clone(),
        volume_context,
        content_source,
        accessible_topology: vec![],
    }
}

fn snapshot_to_csi(snapshot: &Snapshot) -> csi::Snapshot {
    csi::Snapshot {
        size_bytes: to_i64(snapshot.info.size_bytes),
        snapshot_id: snapshot.id().to_string(),
        source_volume_id: snapshot.source_volume_id().to_string(),
        creation_time: Some(Timestamp {
            seconds: snapshot.info.created_at,
            nanos: 0,
        }),
        ready_to_use: snapshot.info.ready,
        group_snapshot_id: String::new(),
    }
}

fn rpc_capability(rpc: csi::controller_service_capability::rpc::Type) -> csi::ControllerServiceCapability {
    csi::ControllerServiceCapability {
        r#type: Some(csi::controller_service_capability::Type::Rpc(
            csi::controller_service_capability::Rpc { r#type: rpc as i32 },
        )),
    }
}

/// CSI Controller Service
///
/// Implements the CSI Controller service which handles:
/// - Volume creation, deletion, expansion and cloning
/// - Publishing volumes to nodes (iSCSI target ACLs)
/// - Snapshot creation and deletion
/// - Listing, capacity and capability reporting
pub struct ControllerService {
    provisioner: Arc<Provisioner>,
}

impl ControllerService {
    pub fn new(provisioner: Arc<Provisioner>) -> Self {
        Self { provisioner }
    }

    /// Get required volume size from capacity range.
    fn get_volume_size(capacity_range: Option<&csi::CapacityRange>) -> Result<i64, Status> {
        let Some(range) = capacity_range else {
            return Ok(DEFAULT_VOLUME_SIZE);
        };
        if range.required_bytes < 0 || range.limit_bytes < 0 {
            return Err(Status::invalid_argument("capacity range must not be negative"));
        }
        if range.limit_bytes > 0 && range.required_bytes > range.limit_bytes {
            return Err(Status::out_of_range(format!(
                "required_bytes {} exceeds limit_bytes {}",
                range.required_bytes, range.limit_bytes
            )));
        }
        Ok(if range.required_bytes > 0 {
            range.required_bytes
        } else if range.limit_bytes > 0 {
            range.limit_bytes
        } else {
            DEFAULT_VOLUME_SIZE
        })
    }

    fn content_source(source: Option<&csi::VolumeContentSource>) -> Result<Option<VolumeSource>, Status> {
        match source.and_then(|s| s.r#type.as_ref()) {
            None => Ok(None),
            Some(csi::volume_content_source::Type::Snapshot(s)) if !s.snapshot_id.is_empty() => {
                Ok(Some(VolumeSource::Snapshot(s.snapshot_id.clone())))
            }
            Some(csi::volume_content_source::Type::Volume(v)) if !v.volume_id.is_empty() => {
                Ok(Some(VolumeSource::Volume(v.volume_id.clone())))
            }
            Some(_) => Err(Status::invalid_argument("Volume content source id is required")),
        }
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    /// Create a new volume.
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let timer = OperationTimer::new("create_volume");
        let req = request.into_inner();
        let name = &req.name;

        if name.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Volume name is required"));
        }
        if req.volume_capabilities.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Volume capabilities are required"));
        }

        let validated = Self::get_volume_size(req.capacity_range.as_ref()).and_then(|size| {
            let parameters = VolumeParameters::parse(&req.parameters)?;
            let source = Self::content_source(req.volume_content_source.as_ref())?;
            validate_volume_capabilities(parameters.kind.object_kind(), &req.volume_capabilities)
                .map_err(Status::invalid_argument)?;
            Ok((size, parameters, source))
        });
        let (size_bytes, parameters, source) = match validated {
            Ok(v) => v,
            Err(status) => {
                timer.failure("invalid_argument");
                return Err(status);
            }
        };

        info!(name = %name, size_bytes, kind = %parameters.kind, "CreateVolume request");
        debug!(parameters = ?parameters, source = ?source, "Creating volume");

        let volume_request = VolumeRequest {
            request_name: name.clone(),
            size_bytes: size_bytes as u64,
            kind: parameters.kind,
            provisioning: parameters.provisioning,
            array_hint: parameters.array_hint.clone(),
            location_hint: parameters.location_hint.clone(),
            source,
            inputs: NameInputs::for_volume(name, &req.parameters),
        };

        let volume = match self.provisioner.create_volume(&volume_request).await {
            Ok(v) => v,
            Err(e) => return Err(fail(timer, "create_volume", e)),
        };

        info!(
            volume_id = %volume.id,
            host = %volume.host,
            size_bytes = volume.capacity_bytes(),
            "Volume created successfully"
        );

        timer.success();
        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(volume_to_csi(&volume, parameters.fs_type)),
        }))
    }

    /// Delete a volume.
    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let timer = OperationTimer::new("delete_volume");
        let req = request.into_inner();
        let volume_id = &req.volume_id;

        if volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        info!(volume_id = %volume_id, "DeleteVolume request");

        if let Err(e) = self.provisioner.delete_volume(volume_id).await {
            return Err(fail(timer, "delete_volume", e));
        }

        timer.success();
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    /// Grant a node access to a volume.
    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("controller_publish_volume");
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if req.node_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Node ID is required"));
        }
        let Some(capability) = req.volume_capability.as_ref() else {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Volume capability is required"));
        };
        let node: NodeIdentity = match req.node_id.parse() {
            Ok(node) => node,
            Err(e) => {
                timer.failure("invalid_argument");
                return Err(Status::invalid_argument(format!("{e}")));
            }
        };

        let mode = capability
            .access_mode
            .as_ref()
            .and_then(|m| Mode::try_from(m.mode).ok())
            .unwrap_or(Mode::Unknown);
        let mode = PublishMode::from_access_mode(mode);

        info!(
            volume_id = %req.volume_id,
            node_id = %req.node_id,
            mode = ?mode,
            readonly = req.readonly,
            "ControllerPublishVolume request"
        );

        let volume = match self.provisioner.publish(&req.volume_id, &node, mode).await {
            Ok(v) => v,
            Err(e) => return Err(fail(timer, "controller_publish_volume", e)),
        };

        let publish_context: HashMap<String, String> = volume
            .context()
            .into_iter()
            .filter(|(k, _)| k == context::TARGET_IQN || k == context::PORTALS)
            .collect();

        timer.success();
        Ok(Response::new(csi::ControllerPublishVolumeResponse { publish_context }))
    }

    /// Withdraw a node's access to a volume.
    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("controller_unpublish_volume");
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        info!(volume_id = %req.volume_id, node_id = %req.node_id, "ControllerUnpublishVolume request");

        // An empty node id means every node
        let node_ids = if req.node_id.is_empty() {
            self.provisioner.publications().nodes(&req.volume_id).await
        } else {
            vec![req.node_id.clone()]
        };

        for node_id in node_ids {
            let node: NodeIdentity = match node_id.parse() {
                Ok(node) => node,
                Err(e) => {
                    timer.failure("invalid_argument");
                    return Err(Status::invalid_argument(format!("{e}")));
                }
            };
            if let Err(e) = self.provisioner.unpublish(&req.volume_id, &node).await {
                return Err(fail(timer, "controller_unpublish_volume", e));
            }
        }

        timer.success();
        Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
    }

    /// Expand a volume.
    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let timer = OperationTimer::new("expand_volume");
        let req = request.into_inner();
        let volume_id = &req.volume_id;

        if volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        let capacity_range = match req.capacity_range.as_ref() {
            Some(r) => r,
            None => {
                timer.failure("invalid_argument");
                return Err(Status::invalid_argument(
                    "Capacity range is required for volume expansion",
                ));
            }
        };

        let new_size_bytes = if capacity_range.required_bytes > 0 {
            capacity_range.required_bytes
        } else {
            capacity_range.limit_bytes
        };

        if new_size_bytes <= 0 {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument(
                "Required or limit bytes must be positive",
            ));
        }

        info!(
            volume_id = %volume_id,
            new_size_bytes = new_size_bytes,
            "ControllerExpandVolume request"
        );

        let (actual_size, kind) = match self
            .provisioner
            .expand_volume(volume_id, new_size_bytes as u64)
            .await
        {
            Ok(v) => v,
            Err(e) => return Err(fail(timer, "expand_volume", e)),
        };

        // Block LUNs and shares need nothing on the node; filesystems on a
        // LUN have to be grown by NodeExpandVolume
        let is_block = matches!(
            req.volume_capability
                .as_ref()
                .and_then(|c| c.access_type.as_ref()),
            Some(csi::volume_capability::AccessType::Block(_))
        );
        let node_expansion_required = kind == ObjectKind::Lun && !is_block;

        info!(
            volume_id = %volume_id,
            actual_size,
            node_expansion_required,
            "Volume expanded successfully"
        );

        timer.success();
        Ok(Response::new(csi::ControllerExpandVolumeResponse {
            capacity_bytes: to_i64(actual_size),
            node_expansion_required,
        }))
    }

    /// Report controller capabilities.
    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let capabilities = [
            Type::CreateDeleteVolume,
            Type::PublishUnpublishVolume,
            Type::ListVolumes,
            Type::GetCapacity,
            Type::CreateDeleteSnapshot,
            Type::ListSnapshots,
            Type::CloneVolume,
            Type::ExpandVolume,
            Type::ListVolumesPublishedNodes,
            Type::GetVolume,
            Type::SingleNodeMultiWriter,
        ]
        .into_iter()
        .map(rpc_capability)
        .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Create a snapshot.
    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        let timer = OperationTimer::new("create_snapshot");
        let req = request.into_inner();
        let source_volume_id = &req.source_volume_id;
        let name = &req.name;

        if source_volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Source volume ID is required"));
        }

        if name.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Snapshot name is required"));
        }

        info!(
            source_volume_id = %source_volume_id,
            name = %name,
            "CreateSnapshot request"
        );

        let snapshot = match self
            .provisioner
            .create_snapshot(name, source_volume_id, &req.parameters)
            .await
        {
            Ok(s) => s,
            Err(e) => return Err(fail(timer, "create_snapshot", e)),
        };

        info!(
            snapshot_id = %snapshot.id(),
            source_volume_id = %snapshot.source_volume_id(),
            host = %snapshot.host,
            "Snapshot created successfully"
        );

        timer.success();
        Ok(Response::new(csi::CreateSnapshotResponse {
            snapshot: Some(snapshot_to_csi(&snapshot)),
        }))
    }

    /// Delete a snapshot.
    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let timer = OperationTimer::new("delete_snapshot");
        let req = request.into_inner();
        let snapshot_id = &req.snapshot_id;

        if snapshot_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("Snapshot ID is required"));
        }

        info!(snapshot_id = %snapshot_id, "DeleteSnapshot request");

        if let Err(e) = self.provisioner.delete_snapshot(snapshot_id).await {
            return Err(fail(timer, "delete_snapshot", e));
        }

        timer.success();
        Ok(Response::new(csi::DeleteSnapshotResponse {}))
    }

    /// Validate volume capabilities.
    ///
    /// Returns "confirmed" only if ALL requested capabilities are supported
    /// by the object backing the volume.
    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;

        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("Volume capabilities are required"));
        }

        info!(volume_id = %volume_id, "ValidateVolumeCapabilities request");

        // Verify the volume exists
        let volume = self.provisioner.get_volume(volume_id).await?;

        if let Err(message) = validate_volume_capabilities(volume.object.kind, &req.volume_capabilities) {
            warn!(volume_id = %volume_id, message = %message, "Volume capabilities not supported");
            return Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message,
            }));
        }

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
                mutable_parameters: req.mutable_parameters,
            }),
            message: String::new(),
        }))
    }

    /// List all volumes.
    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        let req = request.into_inner();

        info!(
            max_entries = req.max_entries,
            starting_token = %req.starting_token,
            "ListVolumes request"
        );

        let volumes = self.provisioner.list_volumes().await?;
        let (page, next_token) = paginate(volumes, req.max_entries, &req.starting_token)?;

        let mut entries = Vec::with_capacity(page.len());
        for volume in &page {
            let published_node_ids = self.provisioner.publications().nodes(&volume.id).await;
            entries.push(csi::list_volumes_response::Entry {
                volume: Some(volume_to_csi(volume, None)),
                status: Some(csi::list_volumes_response::VolumeStatus {
                    published_node_ids,
                    volume_condition: None,
                }),
            });
        }

        info!(count = entries.len(), "ListVolumes completed");

        Ok(Response::new(csi::ListVolumesResponse {
            entries,
            next_token,
        }))
    }

    /// Get storage capacity.
    ///
    /// Returns the free space of the largest storage volume among arrays
    /// that serve the requested protocol.
    async fn get_capacity(
        &self,
        request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        let req = request.into_inner();

        info!(parameters = ?req.parameters, "GetCapacity request");

        let parameters = VolumeParameters::parse(&req.parameters)?;
        let available = self
            .provisioner
            .capacity(
                parameters.kind,
                parameters.array_hint.as_deref(),
                parameters.location_hint.as_deref(),
            )
            .await?;

        info!(available_capacity = available, "GetCapacity completed");

        Ok(Response::new(csi::GetCapacityResponse {
            available_capacity: to_i64(available),
            maximum_volume_size: None,
            minimum_volume_size: None,
        }))
    }

    /// List snapshots.
    ///
    /// Returns snapshots with optional filtering by source volume or id,
    /// and pagination.
    async fn list_snapshots(
        &self,
        request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        let req = request.into_inner();

        info!(
            source_volume_id = %req.source_volume_id,
            snapshot_id = %req.snapshot_id,
            max_entries = req.max_entries,
            starting_token = %req.starting_token,
            "ListSnapshots request"
        );

        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        let source_filter = non_empty(&req.source_volume_id);
        let id_filter = non_empty(&req.snapshot_id);

        let snapshots = self
            .provisioner
            .list_snapshots(source_filter.as_deref(), id_filter.as_deref())
            .await?;
        let (page, next_token) = paginate(snapshots, req.max_entries, &req.starting_token)?;

        let entries: Vec<csi::list_snapshots_response::Entry> = page
            .iter()
            .map(|s| csi::list_snapshots_response::Entry {
                snapshot: Some(snapshot_to_csi(s)),
            })
            .collect();

        info!(count = entries.len(), "ListSnapshots completed");

        Ok(Response::new(csi::ListSnapshotsResponse {
            entries,
            next_token,
        }))
    }

    /// Describe one volume and the nodes it is published to.
    async fn controller_get_volume(
        &self,
        request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }

        debug!(volume_id = %req.volume_id, "ControllerGetVolume request");

        let volume = self.provisioner.get_volume(&req.volume_id).await?;
        let published_node_ids = self.provisioner.publications().nodes(&volume.id).await;

        Ok(Response::new(csi::ControllerGetVolumeResponse {
            volume: Some(volume_to_csi(&volume, None)),
            status: Some(csi::controller_get_volume_response::VolumeStatus {
                published_node_ids,
                volume_condition: Some(csi::VolumeCondition {
                    abnormal: false,
                    message: String::new(),
                }),
            }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capability(mode: Mode, block: bool) -> csi::VolumeCapability {
        let access_type = if block {
            csi::volume_capability::AccessType::Block(csi::volume_capability::BlockVolume {})
        } else {
            csi::volume_capability::AccessType::Mount(csi::volume_capability::MountVolume {
                fs_type: "ext4".to_string(),
                mount_flags: vec![],
                volume_mount_group: String::new(),
            })
        };
        csi::VolumeCapability {
            access_type: Some(access_type),
            access_mode: Some(csi::volume_capability::AccessMode { mode: mode as i32 }),
        }
    }

    #[test]
    fn test_get_volume_size() {
        // No capacity range
        assert_eq!(
            ControllerService::get_volume_size(None).unwrap(),
            DEFAULT_VOLUME_SIZE
        );

        // Required bytes takes precedence
        let range = csi::CapacityRange {
            required_bytes: 2 * 1024 * 1024 * 1024,
            limit_bytes: 5 * 1024 * 1024 * 1024,
        };
        assert_eq!(
            ControllerService::get_volume_size(Some(&range)).unwrap(),
            2 * 1024 * 1024 * 1024
        );

        // Fall back to limit_bytes if required_bytes is 0
        let range = csi::CapacityRange {
            required_bytes: 0,
            limit_bytes: 5 * 1024 * 1024 * 1024,
        };
        assert_eq!(
            ControllerService::get_volume_size(Some(&range)).unwrap(),
            5 * 1024 * 1024 * 1024
        );

        // Required above the limit
        let range = csi::CapacityRange {
            required_bytes: 6,
            limit_bytes: 5,
        };
        assert_eq!(
            ControllerService::get_volume_size(Some(&range))
                .unwrap_err()
                .code(),
            tonic::Code::OutOfRange
        );
    }

    #[test]
    fn test_parse_parameters() {
        let mut parameters = HashMap::new();
        let parsed = VolumeParameters::parse(&parameters).unwrap();
        assert_eq!(parsed.kind, BackendKind::Iscsi);
        assert_eq!(parsed.provisioning, ProvisioningMode::Thin);
        assert_eq!(parsed.fs_type, None);

        parameters.insert("protocol".to_string(), "nfs".to_string());
        parameters.insert("provisioningMode".to_string(), "thick".to_string());
        parameters.insert("csi.storage.k8s.io/fstype".to_string(), "xfs".to_string());
        parameters.insert("dsm".to_string(), "10.0.0.1".to_string());
        parameters.insert("location".to_string(), "/volume2".to_string());
        let parsed = VolumeParameters::parse(&parameters).unwrap();
        assert_eq!(parsed.kind, BackendKind::Nfs);
        assert_eq!(parsed.provisioning, ProvisioningMode::Thick);
        assert_eq!(parsed.fs_type, Some(FsType::Xfs));
        assert_eq!(parsed.array_hint.as_deref(), Some("10.0.0.1"));
        assert_eq!(parsed.location_hint.as_deref(), Some("/volume2"));

        parameters.insert("protocol".to_string(), "fc".to_string());
        assert_eq!(
            VolumeParameters::parse(&parameters).unwrap_err().code(),
            tonic::Code::InvalidArgument
        );
    }

    #[test]
    fn test_validate_volume_capabilities() {
        assert!(
            validate_volume_capabilities(ObjectKind::Lun, &[capability(Mode::SingleNodeWriter, false)])
                .is_ok()
        );
        assert!(
            validate_volume_capabilities(ObjectKind::Lun, &[capability(Mode::MultiNodeMultiWriter, true)])
                .is_ok()
        );
        assert!(
            validate_volume_capabilities(ObjectKind::Lun, &[capability(Mode::MultiNodeMultiWriter, false)])
                .is_err()
        );
        assert!(
            validate_volume_capabilities(ObjectKind::Share, &[capability(Mode::MultiNodeMultiWriter, false)])
                .is_ok()
        );
        assert!(
            validate_volume_capabilities(ObjectKind::Share, &[capability(Mode::SingleNodeWriter, true)])
                .is_err()
        );
        let no_mode = csi::VolumeCapability {
            access_type: capability(Mode::SingleNodeWriter, false).access_type,
            access_mode: None,
        };
        assert!(validate_volume_capabilities(ObjectKind::Lun, &[no_mode]).is_err());
    }

    #[test]
    fn test_paginate() {
        let items: Vec<u32> = (0..5).collect();

        let (page, token) = paginate(items.clone(), 2, "").unwrap();
        assert_eq!(page, vec![0, 1]);
        assert_eq!(token, "2");

        let (page, token) = paginate(items.clone(), 2, "4").unwrap();
        assert_eq!(page, vec![4]);
        assert!(token.is_empty());

        let (page, token) = paginate(items.clone(), 0, "").unwrap();
        assert_eq!(page.len(), 5);
        assert!(token.is_empty());

        assert_eq!(
            paginate(items.clone(), 2, "bogus").unwrap_err().code(),
            tonic::Code::Aborted
        );
        assert_eq!(
            paginate(items, 2, "9").unwrap_err().code(),
            tonic::Code::Aborted
        );
    }
}
