//! `SYNO.Core.Share*` calls: shares, share snapshots and NFS export rules.

use chrono::NaiveDateTime;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{DsmError, Result};
use crate::types::{
    CloneSource, ObjectKind, Session, ShareSpec, SnapshotInfo, SnapshotSpec, StorageObject,
};
use crate::webapi::{API_NFS_PRIVILEGE, API_SHARE, API_SHARE_SNAPSHOT, DsmClient, quote};

/// Share quotas are expressed in MiB.
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct ShareList {
    #[serde(default)]
    shares: Vec<ShareEntry>,
}

#[derive(Debug, Deserialize)]
struct ShareEntry {
    name: String,
    #[serde(default)]
    vol_path: String,
    #[serde(default)]
    desc: String,
    /// Quota in MiB, 0 when unlimited.
    #[serde(default)]
    quota_value: u64,
}

#[derive(Debug, Deserialize)]
struct ShareSnapshotList {
    #[serde(default)]
    snapshots: Vec<ShareSnapshotEntry>,
}

#[derive(Debug, Deserialize)]
struct ShareSnapshotEntry {
    /// DSM names share snapshots after their creation time.
    time: String,
    #[serde(default)]
    desc: String,
}

fn quota_mib(size_bytes: u64) -> u64 {
    size_bytes.div_ceil(MIB)
}

fn share_info(spec: &ShareSpec) -> serde_json::Value {
    serde_json::json!({
        "name": spec.name,
        "vol_path": spec.location,
        "desc": spec.description,
        "enable_share_cow": true,
        "enable_share_compress": false,
        "enable_recycle_bin": false,
        "recycle_bin_admin_only": false,
        "encryption": 0,
        "enable_share_quota": true,
        "share_quota": quota_mib(spec.size_bytes),
    })
}

/// Parse a share snapshot name such as `GMT+08-2022.01.14-19.18.29` into
/// seconds since the epoch.
pub(crate) fn parse_snapshot_time(name: &str) -> Option<i64> {
    const STAMP_LEN: usize = "2022.01.14-19.18.29".len();
    if name.len() < STAMP_LEN {
        return None;
    }
    let (zone, stamp) = name.split_at(name.len() - STAMP_LEN);
    let local = NaiveDateTime::parse_from_str(stamp, "%Y.%m.%d-%H.%M.%S").ok()?;

    let zone = zone.trim_end_matches('-').trim_start_matches("GMT");
    let offset_hours: i64 = if zone.is_empty() {
        0
    } else {
        zone.parse().ok()?
    };
    Some(local.and_utc().timestamp() - offset_hours * 3600)
}

impl DsmClient {
    pub(crate) async fn list_shares(&self, session: &Session) -> Result<Vec<StorageObject>> {
        let params = [
            ("shareType", quote("all")),
            (
                "additional",
                serde_json::json!(["vol_path", "share_quota", "desc"]).to_string(),
            ),
        ];
        let list: ShareList = self
            .request(Some(session), API_SHARE, 1, "list", &params)
            .await?;

        Ok(list
            .shares
            .into_iter()
            .map(|share| StorageObject {
                id: share.name.clone(),
                name: share.name,
                kind: ObjectKind::Share,
                size_bytes: share.quota_value * MIB,
                location: share.vol_path,
                description: share.desc,
            })
            .collect())
    }

    pub(crate) async fn create_empty_share(&self, session: &Session, spec: &ShareSpec) -> Result<()> {
        let params = [
            ("name", quote(&spec.name)),
            ("shareinfo", share_info(spec).to_string()),
        ];
        self.request_unit(Some(session), API_SHARE, 1, "create", &params)
            .await?;
        info!(
            name = %spec.name,
            location = %spec.location,
            quota_mib = quota_mib(spec.size_bytes),
            "Created share"
        );
        Ok(())
    }

    pub(crate) async fn clone_share(
        &self,
        session: &Session,
        spec: &ShareSpec,
        source: &CloneSource,
    ) -> Result<()> {
        let mut params = vec![
            ("name", quote(&spec.name)),
            ("shareinfo", share_info(spec).to_string()),
        ];
        match source {
            CloneSource::Snapshot {
                parent_id,
                snapshot_id,
            } => {
                params.push(("clone_from", quote(parent_id)));
                params.push(("snapshot", quote(snapshot_id)));
            }
            CloneSource::Object { id } => {
                params.push(("clone_from", quote(id)));
            }
        }
        self.request_unit(Some(session), API_SHARE, 1, "clone", &params)
            .await?;
        info!(name = %spec.name, ?source, "Cloned share");
        Ok(())
    }

    pub(crate) async fn resize_share(
        &self,
        session: &Session,
        share: &StorageObject,
        new_size: u64,
    ) -> Result<()> {
        let info = serde_json::json!({
            "name": share.name,
            "vol_path": share.location,
            "enable_share_quota": true,
            "share_quota": quota_mib(new_size),
        });
        let params = [("name", quote(&share.name)), ("shareinfo", info.to_string())];
        self.request_unit(Some(session), API_SHARE, 1, "set", &params)
            .await?;
        info!(name = %share.name, new_size, "Resized share quota");
        Ok(())
    }

    /// Open an NFS export rule for every client on a share.
    pub(crate) async fn allow_nfs_clients(&self, session: &Session, share_name: &str) -> Result<()> {
        let rules = serde_json::json!([{
            "host": "*",
            "privilege": "rw",
            "root_squash": "root",
            "async": true,
            "crossmnt": true,
            "insecure": true,
            "security_flavor": { "sys": true },
        }]);
        let params = [
            ("share_name", quote(share_name)),
            ("rule", rules.to_string()),
        ];
        self.request_unit(Some(session), API_NFS_PRIVILEGE, 1, "save", &params)
            .await?;
        debug!(share = share_name, "Saved NFS export rule");
        Ok(())
    }

    pub(crate) async fn take_share_snapshot(
        &self,
        session: &Session,
        spec: &SnapshotSpec,
    ) -> Result<SnapshotInfo> {
        // The snapshot description carries our name: DSM names share
        // snapshots after their timestamp.
        let snapinfo = serde_json::json!({ "desc": spec.name, "lock": true });
        let params = [
            ("name", quote(&spec.parent_id)),
            ("snapinfo", snapinfo.to_string()),
        ];
        let time: String = self
            .request(Some(session), API_SHARE_SNAPSHOT, 1, "create", &params)
            .await?;
        info!(name = %spec.name, share = %spec.parent_id, time = %time, "Took share snapshot");

        let size_bytes = self
            .list_shares(session)
            .await?
            .into_iter()
            .find(|share| share.id == spec.parent_id)
            .map(|share| share.size_bytes)
            .ok_or_else(|| DsmError::NotFound(format!("share {}", spec.parent_id)))?;

        Ok(SnapshotInfo {
            created_at: parse_snapshot_time(&time)
                .unwrap_or_else(|| chrono::Utc::now().timestamp()),
            id: time,
            name: spec.name.clone(),
            parent_id: spec.parent_id.clone(),
            parent_name: spec.parent_id.clone(),
            parent_kind: ObjectKind::Share,
            size_bytes,
            ready: true,
        })
    }

    pub(crate) async fn delete_share_snapshot(
        &self,
        session: &Session,
        share_name: &str,
        time: &str,
    ) -> Result<()> {
        let params = [
            ("name", quote(share_name)),
            ("snapshots", serde_json::json!([time]).to_string()),
        ];
        self.request_unit(Some(session), API_SHARE_SNAPSHOT, 1, "delete", &params)
            .await?;
        info!(share = share_name, time, "Deleted share snapshot");
        Ok(())
    }

    pub(crate) async fn list_share_snapshots(
        &self,
        session: &Session,
        share: &StorageObject,
    ) -> Result<Vec<SnapshotInfo>> {
        let params = [
            ("name", quote(&share.name)),
            ("additional", serde_json::json!(["desc", "lock"]).to_string()),
        ];
        let list: ShareSnapshotList = self
            .request(Some(session), API_SHARE_SNAPSHOT, 1, "list", &params)
            .await?;

        Ok(list
            .snapshots
            .into_iter()
            .map(|snap| SnapshotInfo {
                created_at: parse_snapshot_time(&snap.time).unwrap_or_default(),
                name: if snap.desc.is_empty() {
                    snap.time.clone()
                } else {
                    snap.desc
                },
                id: snap.time,
                parent_id: share.id.clone(),
                parent_name: share.name.clone(),
                parent_kind: ObjectKind::Share,
                size_bytes: share.size_bytes,
                ready: true,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_rounds_up_to_mib() {
        assert_eq!(quota_mib(0), 0);
        assert_eq!(quota_mib(1), 1);
        assert_eq!(quota_mib(MIB), 1);
        assert_eq!(quota_mib(10 * 1024 * MIB + 1), 10 * 1024 + 1);
    }

    #[test]
    fn test_parse_snapshot_time() {
        // 2022-01-14 19:18:29 at UTC+8 is 11:18:29 UTC
        assert_eq!(
            parse_snapshot_time("GMT+08-2022.01.14-19.18.29"),
            Some(1_642_159_109)
        );
        assert_eq!(
            parse_snapshot_time("GMT-05-2022.01.14-06.18.29"),
            Some(1_642_159_109)
        );
        assert_eq!(
            parse_snapshot_time("GMT-2022.01.14-11.18.29"),
            Some(1_642_159_109)
        );
        assert_eq!(parse_snapshot_time("garbage"), None);
    }

    #[test]
    fn test_share_info_payload() {
        let spec = ShareSpec {
            name: "k8s-csi-pvc-1".to_string(),
            location: "/volume1".to_string(),
            size_bytes: 2 * 1024 * MIB,
            description: "pvc-1".to_string(),
            nfs: false,
            source: None,
        };
        let info = share_info(&spec);
        assert_eq!(info["vol_path"], "/volume1");
        assert_eq!(info["share_quota"], 2048);
        assert_eq!(info["enable_share_quota"], true);
    }
}
