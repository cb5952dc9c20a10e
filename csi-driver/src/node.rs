//! CSI Node Service Implementation
//!
//! Validates requests and hands them to the [`StagingEngine`], which owns
//! the per-volume state machine and every host operation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::controller::fail;
use crate::csi;
use crate::metrics::OperationTimer;
use crate::staging::{AccessKind, PublishRequest, StageRequest, StagingEngine, VolumeBacking};
use crate::types::{BackendKind, FsType, NodeIdentity, context};

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// CSI Node Service
///
/// Implements the CSI Node service which handles:
/// - Volume staging (iSCSI login, multipath, format if needed, mount; or share mount)
/// - Volume unstaging (unmount, flush multipath maps, iSCSI logout)
/// - Volume publishing (bind mount from staging to target path)
/// - Volume unpublishing (unmount from target path)
/// - Volume stats and node-side expansion
pub struct NodeService {
    engine: Arc<StagingEngine>,
    /// Node name, combined with the initiator IQN in NodeGetInfo
    node_name: String,
}

impl NodeService {
    pub fn new(engine: Arc<StagingEngine>, node_name: String) -> Self {
        Self { engine, node_name }
    }

    /// Validate that a path is safe to hand to host commands.
    fn validate_path(path: &str) -> Result<(), Status> {
        if path.is_empty() {
            return Err(Status::invalid_argument("Path cannot be empty"));
        }

        if !path.starts_with('/') {
            return Err(Status::invalid_argument("Path must be absolute"));
        }

        let dangerous_chars = [
            ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r',
        ];
        for c in dangerous_chars {
            if path.contains(c) {
                return Err(Status::invalid_argument(format!(
                    "Path contains dangerous character: '{}'",
                    c
                )));
            }
        }

        if path.contains("..") {
            return Err(Status::invalid_argument(
                "Path cannot contain '..' (path traversal)",
            ));
        }

        Ok(())
    }

    /// Validate that a target IQN is safe to pass to iscsiadm.
    fn validate_target_name(target: &str) -> Result<(), Status> {
        if target.is_empty() {
            return Err(Status::invalid_argument("Target name cannot be empty"));
        }

        let valid = target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == ':' || c == '-' || c == '_');

        if !valid {
            return Err(Status::invalid_argument(
                "Target name contains invalid characters",
            ));
        }

        Ok(())
    }

    fn required<'a>(value: &'a str, what: &str) -> Result<&'a str, Status> {
        if value.is_empty() {
            return Err(Status::invalid_argument(format!("{what} is required")));
        }
        Ok(value)
    }

    /// Translate a CSI volume capability into how the workload consumes the
    /// volume. Shares ignore the filesystem type.
    fn access_kind(
        capability: Option<&csi::VolumeCapability>,
        volume_context: &HashMap<String, String>,
        share: bool,
    ) -> Result<AccessKind, Status> {
        use csi::volume_capability::AccessType;

        let capability =
            capability.ok_or_else(|| Status::invalid_argument("Volume capability is required"))?;

        match &capability.access_type {
            Some(AccessType::Block(_)) if share => Err(Status::invalid_argument(
                "Block access is not supported for shares",
            )),
            Some(AccessType::Block(_)) => Ok(AccessKind::Block),
            Some(AccessType::Mount(mount)) => {
                let fs_type = if share {
                    None
                } else {
                    let requested = Some(mount.fs_type.as_str())
                        .filter(|f| !f.is_empty())
                        .or_else(|| volume_context.get(context::FS_TYPE).map(String::as_str))
                        .filter(|f| !f.is_empty());
                    requested
                        .map(|f| f.parse::<FsType>())
                        .transpose()
                        .map_err(|e| Status::invalid_argument(e.to_string()))?
                };

                let mount_group = if mount.volume_mount_group.is_empty() {
                    None
                } else {
                    Some(mount.volume_mount_group.parse::<u32>().map_err(|_| {
                        Status::invalid_argument(format!(
                            "volume_mount_group '{}' is not a numeric group id",
                            mount.volume_mount_group
                        ))
                    })?)
                };

                Ok(AccessKind::Mount {
                    fs_type,
                    flags: mount.mount_flags.clone(),
                    mount_group,
                })
            }
            None => Err(Status::invalid_argument("Volume access type is required")),
        }
    }

    fn rpc_capability(rpc: csi::node_service_capability::rpc::Type) -> csi::NodeServiceCapability {
        csi::NodeServiceCapability {
            r#type: Some(csi::node_service_capability::Type::Rpc(
                csi::node_service_capability::Rpc { r#type: rpc as i32 },
            )),
        }
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    /// Stage a volume to a staging path.
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_stage_volume");
        let req = request.into_inner();

        let volume_id = Self::required(&req.volume_id, "Volume ID")?;
        let staging_target_path = Self::required(&req.staging_target_path, "Staging target path")?;
        Self::validate_path(staging_target_path)?;

        let backing = VolumeBacking::from_context(&req.volume_context, &req.publish_context, &req.secrets)
            .map_err(Status::from)?;
        if let VolumeBacking::Iscsi { target_iqn, .. } = &backing {
            Self::validate_target_name(target_iqn)?;
        }
        let share = !matches!(backing, VolumeBacking::Iscsi { .. });
        let access = Self::access_kind(req.volume_capability.as_ref(), &req.volume_context, share)?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            "NodeStageVolume request"
        );

        let stage = StageRequest {
            volume_id: volume_id.to_string(),
            staging_path: staging_target_path.into(),
            backing,
            access,
        };
        match self.engine.stage(&stage).await {
            Ok(source) => {
                debug!(volume_id = %volume_id, source = %source, "Stage complete");
                timer.success();
                Ok(Response::new(csi::NodeStageVolumeResponse {}))
            }
            Err(e) => Err(fail(timer, "node_stage_volume", e)),
        }
    }

    /// Unstage a volume from the staging path.
    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unstage_volume");
        let req = request.into_inner();

        let volume_id = Self::required(&req.volume_id, "Volume ID")?;
        let staging_target_path = Self::required(&req.staging_target_path, "Staging target path")?;
        Self::validate_path(staging_target_path)?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            "NodeUnstageVolume request"
        );

        match self
            .engine
            .unstage(volume_id, Path::new(staging_target_path))
            .await
        {
            Ok(()) => {
                timer.success();
                Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
            }
            Err(e) => Err(fail(timer, "node_unstage_volume", e)),
        }
    }

    /// Publish a volume to a target path (bind mount from staging).
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_publish_volume");
        let req = request.into_inner();

        let volume_id = Self::required(&req.volume_id, "Volume ID")?;
        let target_path = Self::required(&req.target_path, "Target path")?;
        Self::validate_path(target_path)?;
        let staging_target_path = Self::required(
            &req.staging_target_path,
            "Staging target path (STAGE_UNSTAGE_VOLUME capability is enabled)",
        )?;
        Self::validate_path(staging_target_path)?;

        let share = req
            .volume_context
            .get(context::PROTOCOL)
            .is_some_and(|p| p.parse::<BackendKind>().is_ok_and(|k| k.is_share()));
        let access = Self::access_kind(req.volume_capability.as_ref(), &req.volume_context, share)?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            target_path = %target_path,
            readonly = %req.readonly,
            "NodePublishVolume request"
        );

        let publish = PublishRequest {
            volume_id: volume_id.to_string(),
            staging_path: staging_target_path.into(),
            target_path: target_path.into(),
            readonly: req.readonly,
            access,
        };
        match self.engine.publish(&publish).await {
            Ok(()) => {
                timer.success();
                Ok(Response::new(csi::NodePublishVolumeResponse {}))
            }
            Err(e) => Err(fail(timer, "node_publish_volume", e)),
        }
    }

    /// Unpublish a volume from the target path.
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_unpublish_volume");
        let req = request.into_inner();

        let volume_id = Self::required(&req.volume_id, "Volume ID")?;
        let target_path = Self::required(&req.target_path, "Target path")?;
        Self::validate_path(target_path)?;

        info!(
            volume_id = %volume_id,
            target_path = %target_path,
            "NodeUnpublishVolume request"
        );

        match self.engine.unpublish(volume_id, Path::new(target_path)).await {
            Ok(()) => {
                timer.success();
                Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
            }
            Err(e) => Err(fail(timer, "node_unpublish_volume", e)),
        }
    }

    /// Get information about this node.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        let iqn = self.engine.host().initiator_name().await.map_err(Status::from)?;
        let identity = NodeIdentity::new(self.node_name.clone(), iqn);
        info!(node_id = %identity, "NodeGetInfo request");

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: identity.to_string(),
            max_volumes_per_node: 0, // No limit
            accessible_topology: None,
        }))
    }

    /// Report node capabilities.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        use csi::node_service_capability::rpc::Type;

        let capabilities = [
            Type::StageUnstageVolume,
            Type::GetVolumeStats,
            Type::ExpandVolume,
            Type::VolumeCondition,
            Type::SingleNodeMultiWriter,
            Type::VolumeMountGroup,
        ]
        .into_iter()
        .map(Self::rpc_capability)
        .collect();

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Grow the filesystem (or report the block size) after the controller
    /// expanded the volume.
    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let timer = OperationTimer::new("node_expand_volume");
        let req = request.into_inner();

        let volume_id = Self::required(&req.volume_id, "Volume ID")?;
        let volume_path = Self::required(&req.volume_path, "Volume path")?;
        Self::validate_path(volume_path)?;

        info!(
            volume_id = %volume_id,
            volume_path = %volume_path,
            "NodeExpandVolume request"
        );

        match self.engine.expand(volume_id, Path::new(volume_path)).await {
            Ok(capacity) => {
                info!(
                    volume_id = %volume_id,
                    capacity_bytes = capacity,
                    "Volume expansion completed"
                );
                timer.success();
                Ok(Response::new(csi::NodeExpandVolumeResponse {
                    capacity_bytes: to_i64(capacity),
                }))
            }
            Err(e) => Err(fail(timer, "node_expand_volume", e)),
        }
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        use csi::volume_usage::Unit;

        let req = request.into_inner();
        Self::required(&req.volume_id, "Volume ID")?;
        let volume_path = Self::required(&req.volume_path, "Volume path")?;
        Self::validate_path(volume_path)?;

        let stats = self
            .engine
            .stats(Path::new(volume_path))
            .await
            .map_err(Status::from)?;

        let mut usage = vec![csi::VolumeUsage {
            available: to_i64(stats.stats.available_bytes),
            total: to_i64(stats.stats.total_bytes),
            used: to_i64(stats.stats.used_bytes),
            unit: Unit::Bytes as i32,
        }];
        if !stats.block {
            usage.push(csi::VolumeUsage {
                available: to_i64(stats.stats.free_inodes),
                total: to_i64(stats.stats.total_inodes),
                used: to_i64(stats.stats.used_inodes),
                unit: Unit::Inodes as i32,
            });
        }

        Ok(Response::new(csi::NodeGetVolumeStatsResponse {
            usage,
            volume_condition: Some(csi::VolumeCondition {
                abnormal: stats.abnormal.is_some(),
                message: stats.abnormal.unwrap_or_else(|| "volume is healthy".to_string()),
            }),
        }))
    }
}
