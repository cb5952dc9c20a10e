//! `SYNO.Core.ISCSI.*` calls: LUNs, targets, ACLs and LUN snapshots.

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{DsmError, Result};
use crate::types::{
    CloneSource, IscsiTarget, LunSpec, ObjectKind, Session, SnapshotInfo, SnapshotSpec,
    StorageObject, TargetSpec,
};
use crate::webapi::{API_LUN, API_TARGET, DsmClient, lenient_u64, quote};

/// ACL entry DSM applies to initiators without an explicit entry.
pub(crate) const DEFAULT_ACL_IQN: &str = "iqn.2000-01.com.synology:default.acl";

/// Snapshot status DSM reports once a LUN snapshot is usable.
const SNAPSHOT_HEALTHY: &str = "Healthy";

#[derive(Debug, Deserialize)]
struct LunList {
    #[serde(default)]
    luns: Vec<LunEntry>,
}

#[derive(Debug, Deserialize)]
struct LunEntry {
    uuid: String,
    name: String,
    #[serde(default)]
    location: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    size: u64,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct CreatedLun {
    uuid: String,
}

#[derive(Debug, Deserialize)]
struct ClonedLun {
    #[serde(alias = "cloned_lun_id", alias = "dst_lun_uuid")]
    cloned_lun_uuid: String,
}

#[derive(Debug, Deserialize)]
struct TargetList {
    #[serde(default)]
    targets: Vec<TargetEntry>,
}

#[derive(Debug, Deserialize)]
struct TargetEntry {
    target_id: i64,
    name: String,
    iqn: String,
    #[serde(default)]
    mapped_luns: Vec<MappedLun>,
    #[serde(default)]
    acls: Vec<AclEntry>,
}

#[derive(Debug, Deserialize)]
struct MappedLun {
    lun_uuid: String,
}

#[derive(Debug, Deserialize)]
struct AclEntry {
    iqn: String,
    permission: String,
}

#[derive(Debug, Deserialize)]
struct CreatedTarget {
    target_id: i64,
}

#[derive(Debug, Deserialize)]
struct TakenSnapshot {
    snapshot_uuid: String,
}

#[derive(Debug, Deserialize)]
struct LunSnapshotList {
    #[serde(default)]
    snapshots: Vec<LunSnapshotEntry>,
}

#[derive(Debug, Deserialize)]
struct LunSnapshotEntry {
    uuid: String,
    name: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    total_size: u64,
    #[serde(default)]
    create_time: i64,
    #[serde(default)]
    status: String,
}

impl TargetEntry {
    fn into_target(self) -> IscsiTarget {
        IscsiTarget {
            id: self.target_id.to_string(),
            name: self.name,
            iqn: self.iqn,
            mapped_luns: self.mapped_luns.into_iter().map(|m| m.lun_uuid).collect(),
            initiators: self
                .acls
                .into_iter()
                .filter(|acl| acl.iqn != DEFAULT_ACL_IQN && acl.permission != "none")
                .map(|acl| acl.iqn)
                .collect(),
        }
    }
}

/// ACL payload for a target: the default entry is always denied, each
/// listed initiator gets read-write access.
pub(crate) fn acl_payload(initiators: &[String]) -> serde_json::Value {
    let mut acls = vec![serde_json::json!({
        "iqn": DEFAULT_ACL_IQN,
        "permission": "none",
    })];
    acls.extend(initiators.iter().map(|iqn| {
        serde_json::json!({
            "iqn": iqn,
            "permission": "rw",
        })
    }));
    serde_json::Value::Array(acls)
}

impl DsmClient {
    pub(crate) async fn list_luns(&self, session: &Session) -> Result<Vec<StorageObject>> {
        let params = [(
            "additional",
            serde_json::json!(["allocated_size", "status"]).to_string(),
        )];
        let list: LunList = self.request(Some(session), API_LUN, 1, "list", &params).await?;

        Ok(list
            .luns
            .into_iter()
            .map(|lun| StorageObject {
                id: lun.uuid,
                name: lun.name,
                kind: ObjectKind::Lun,
                size_bytes: lun.size,
                location: lun.location,
                description: lun.description,
            })
            .collect())
    }

    pub(crate) async fn create_empty_lun(&self, session: &Session, spec: &LunSpec) -> Result<String> {
        let params = [
            ("name", quote(&spec.name)),
            ("location", quote(&spec.location)),
            ("size", spec.size_bytes.to_string()),
            ("type", quote(spec.lun_type.as_str())),
            ("description", quote(&spec.description)),
        ];
        let created: CreatedLun = self
            .request(Some(session), API_LUN, 1, "create", &params)
            .await?;
        info!(
            name = %spec.name,
            uuid = %created.uuid,
            location = %spec.location,
            size_bytes = spec.size_bytes,
            lun_type = spec.lun_type.as_str(),
            "Created LUN"
        );
        Ok(created.uuid)
    }

    pub(crate) async fn clone_lun(
        &self,
        session: &Session,
        spec: &LunSpec,
        source: &CloneSource,
    ) -> Result<String> {
        let cloned: ClonedLun = match source {
            CloneSource::Snapshot {
                parent_id,
                snapshot_id,
            } => {
                let params = [
                    ("src_lun_uuid", quote(parent_id)),
                    ("snapshot_uuid", quote(snapshot_id)),
                    ("cloned_lun_name", quote(&spec.name)),
                    ("clone_type", quote("CoW")),
                ];
                self.request(Some(session), API_LUN, 1, "clone_snapshot", &params)
                    .await?
            }
            CloneSource::Object { id } => {
                let params = [
                    ("src_lun_uuid", quote(id)),
                    ("dst_lun_name", quote(&spec.name)),
                    ("dst_location", quote(&spec.location)),
                    ("is_same_pool", "true".to_string()),
                    ("clone_type", quote("CoW")),
                ];
                self.request(Some(session), API_LUN, 1, "clone", &params)
                    .await?
            }
        };
        info!(name = %spec.name, uuid = %cloned.cloned_lun_uuid, ?source, "Cloned LUN");
        Ok(cloned.cloned_lun_uuid)
    }

    pub(crate) async fn resize_lun(&self, session: &Session, uuid: &str, new_size: u64) -> Result<()> {
        let params = [("uuid", quote(uuid)), ("new_size", new_size.to_string())];
        self.request_unit(Some(session), API_LUN, 1, "set", &params)
            .await?;
        info!(uuid, new_size, "Resized LUN");
        Ok(())
    }

    pub(crate) async fn list_targets(&self, session: &Session) -> Result<Vec<IscsiTarget>> {
        let params = [(
            "additional",
            serde_json::json!(["mapped_lun", "acls"]).to_string(),
        )];
        let list: TargetList = self
            .request(Some(session), API_TARGET, 1, "list", &params)
            .await?;
        Ok(list.targets.into_iter().map(TargetEntry::into_target).collect())
    }

    pub(crate) async fn create_target(&self, session: &Session, spec: &TargetSpec) -> Result<String> {
        let params = [
            ("name", quote(&spec.name)),
            ("iqn", quote(&spec.iqn)),
            ("auth_type", "0".to_string()),
        ];
        let created: CreatedTarget = self
            .request(Some(session), API_TARGET, 1, "create", &params)
            .await?;
        info!(name = %spec.name, iqn = %spec.iqn, target_id = created.target_id, "Created iSCSI target");
        Ok(created.target_id.to_string())
    }

    pub(crate) async fn map_lun(&self, session: &Session, target_id: &str, lun_uuid: &str) -> Result<()> {
        let id: i64 = target_id
            .parse()
            .map_err(|_| DsmError::BadRequest(format!("invalid target id {target_id}")))?;
        let params = [
            ("uuid", quote(lun_uuid)),
            ("target_ids", serde_json::json!([id]).to_string()),
        ];
        self.request_unit(Some(session), API_LUN, 1, "map_target", &params)
            .await?;
        debug!(target_id, lun_uuid, "Mapped LUN to target");
        Ok(())
    }

    pub(crate) async fn set_target_acls(
        &self,
        session: &Session,
        target_id: &str,
        initiators: &[String],
    ) -> Result<()> {
        let params = [
            ("target_id", quote(target_id)),
            ("acls", acl_payload(initiators).to_string()),
        ];
        self.request_unit(Some(session), API_TARGET, 1, "set", &params)
            .await?;
        info!(target_id, ?initiators, "Updated target ACL");
        Ok(())
    }

    pub(crate) async fn take_lun_snapshot(
        &self,
        session: &Session,
        spec: &SnapshotSpec,
    ) -> Result<SnapshotInfo> {
        let params = [
            ("src_lun_uuid", quote(&spec.parent_id)),
            ("snapshot_name", quote(&spec.name)),
            ("description", quote(&spec.description)),
            ("taken_by", quote("synology-csi")),
            ("is_locked", "true".to_string()),
            ("is_app_consistent", "false".to_string()),
        ];
        let taken: TakenSnapshot = self
            .request(Some(session), API_LUN, 1, "take_snapshot", &params)
            .await?;
        info!(name = %spec.name, uuid = %taken.snapshot_uuid, parent = %spec.parent_id, "Took LUN snapshot");

        let parent = self
            .list_luns(session)
            .await?
            .into_iter()
            .find(|lun| lun.id == spec.parent_id)
            .ok_or_else(|| DsmError::NotFound(format!("LUN {}", spec.parent_id)))?;

        self.list_lun_snapshots(session, &parent)
            .await?
            .into_iter()
            .find(|snap| snap.id == taken.snapshot_uuid)
            .ok_or_else(|| DsmError::NotFound(format!("snapshot {}", taken.snapshot_uuid)))
    }

    pub(crate) async fn delete_lun_snapshot(&self, session: &Session, uuid: &str) -> Result<()> {
        let params = [("snapshot_uuid", quote(uuid))];
        self.request_unit(Some(session), API_LUN, 1, "delete_snapshot", &params)
            .await?;
        info!(uuid, "Deleted LUN snapshot");
        Ok(())
    }

    pub(crate) async fn list_lun_snapshots(
        &self,
        session: &Session,
        parent: &StorageObject,
    ) -> Result<Vec<SnapshotInfo>> {
        let params = [("src_lun_uuid", quote(&parent.id))];
        let list: LunSnapshotList = self
            .request(Some(session), API_LUN, 1, "list_snapshot", &params)
            .await?;

        Ok(list
            .snapshots
            .into_iter()
            .map(|snap| SnapshotInfo {
                id: snap.uuid,
                name: snap.name,
                parent_id: parent.id.clone(),
                parent_name: parent.name.clone(),
                parent_kind: ObjectKind::Lun,
                size_bytes: if snap.total_size > 0 {
                    snap.total_size
                } else {
                    parent.size_bytes
                },
                created_at: snap.create_time,
                ready: snap.status.is_empty() || snap.status == SNAPSHOT_HEALTHY,
            })
            .collect())
    }
}
