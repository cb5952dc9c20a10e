//! Multipath Reconciler
//!
//! Turns the per-session block devices of one LUN into a single device.
//! All paths must report the same wwid and be held by one dm-multipath map
//! before staging continues; paths that never agree are a target
//! misconfiguration and fail the stage instead of picking one of them.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DriverError, DriverResult};
use crate::platform::HostOps;

const INITIAL_POLL: Duration = Duration::from_millis(250);
const MAX_POLL: Duration = Duration::from_secs(2);

/// The device a LUN is staged through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedDevice {
    pub device: PathBuf,
    pub wwid: Option<String>,
    /// Whether `device` is a dm-multipath map.
    pub multipath: bool,
}

pub struct MultipathReconciler {
    host: Arc<dyn HostOps>,
    timeout: Duration,
}

impl MultipathReconciler {
    pub fn new(host: Arc<dyn HostOps>, timeout: Duration) -> Self {
        Self { host, timeout }
    }

    /// Wait until every device in `paths` reports one wwid and sits under
    /// one multipath map, then return that map.
    ///
    /// A single path is used as is (or through its map if multipathd
    /// already built one). Fails with `MultipathDiverged` when the paths
    /// still disagree on their wwid at the deadline, and `DeviceTimeout`
    /// when they agree but no map shows up.
    pub async fn reconcile(&self, paths: &[PathBuf]) -> DriverResult<AggregatedDevice> {
        match paths {
            [] => Err(DriverError::Internal("no device paths to reconcile".to_string())),
            [single] => {
                let wwid = self.host.device_wwid(single).await?;
                let holder = self.host.multipath_holder(single).await?;
                Ok(AggregatedDevice {
                    multipath: holder.is_some(),
                    device: holder.unwrap_or_else(|| single.clone()),
                    wwid,
                })
            }
            _ => self.converge(paths).await,
        }
    }

    async fn converge(&self, paths: &[PathBuf]) -> DriverResult<AggregatedDevice> {
        let deadline = Instant::now() + self.timeout;
        let mut delay = INITIAL_POLL;

        loop {
            let mut wwids = BTreeSet::new();
            let mut unknown = 0;
            for path in paths {
                match self.host.device_wwid(path).await? {
                    Some(wwid) => {
                        wwids.insert(wwid);
                    }
                    None => unknown += 1,
                }
            }

            if unknown == 0 && wwids.len() == 1 {
                let mut holders = BTreeSet::new();
                for path in paths {
                    if let Some(holder) = self.host.multipath_holder(path).await? {
                        holders.insert(holder);
                    }
                }
                if holders.len() == 1 {
                    let wwid = wwids.into_iter().next();
                    let device = holders.into_iter().next().unwrap_or_default();
                    info!(
                        device = %device.display(),
                        paths = paths.len(),
                        wwid = ?wwid,
                        "Multipath device converged"
                    );
                    return Ok(AggregatedDevice {
                        device,
                        wwid,
                        multipath: true,
                    });
                }
                debug!(holders = holders.len(), "Waiting for one multipath map");
            } else {
                debug!(wwids = ?wwids, unknown, "Waiting for paths to agree on a wwid");
            }

            let now = Instant::now();
            if now >= deadline {
                if wwids.len() > 1 {
                    warn!(wwids = ?wwids, "Paths report different wwids");
                    return Err(DriverError::MultipathDiverged(format!(
                        "{} paths report wwids {}",
                        paths.len(),
                        wwids.into_iter().collect::<Vec<_>>().join(", ")
                    )));
                }
                return Err(DriverError::DeviceTimeout(format!(
                    "a multipath map over {} paths",
                    paths.len()
                )));
            }

            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(MAX_POLL);
        }
    }

    /// Flush every multipath map over the sessions of `target_iqn`.
    ///
    /// Runs before logout so no map is left without paths.
    pub async fn teardown(&self, target_iqn: &str, known: Option<&Path>) -> DriverResult<()> {
        let mut maps = BTreeSet::new();
        if let Some(device) = known {
            maps.insert(device.to_path_buf());
        }
        for path in self.host.iscsi_devices(target_iqn).await? {
            if let Some(holder) = self.host.multipath_holder(&path).await? {
                maps.insert(holder);
            }
        }

        for map in maps {
            self.host.multipath_flush(&map).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::FakeHost;
    use crate::types::Endpoint;

    const IQN: &str = "iqn.2000-01.com.synology:k8s-csi-pvc-1";

    async fn logged_in(host: &FakeHost, portals: &[&str]) {
        for portal in portals {
            let (h, p) = portal.split_once(':').unwrap();
            host.iscsi_login(IQN, &Endpoint::new(h, p.parse().unwrap()))
                .await
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_paths_one_wwid_converge() {
        let host = Arc::new(FakeHost::new());
        host.add_lun(
            IQN,
            &[
                ("10.0.0.1:3260", "/dev/sdb", "36001405aaaa"),
                ("10.0.1.1:3260", "/dev/sdc", "36001405aaaa"),
            ],
        );
        logged_in(&host, &["10.0.0.1:3260", "10.0.1.1:3260"]).await;

        let reconciler = MultipathReconciler::new(host.clone(), Duration::from_secs(10));
        let devices = host.iscsi_devices(IQN).await.unwrap();
        let aggregated = reconciler.reconcile(&devices).await.unwrap();

        assert_eq!(aggregated.device, PathBuf::from("/dev/mapper/36001405aaaa"));
        assert_eq!(aggregated.wwid.as_deref(), Some("36001405aaaa"));
        assert!(aggregated.multipath);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_wwids_diverge() {
        let host = Arc::new(FakeHost::new());
        host.add_lun(
            IQN,
            &[
                ("10.0.0.1:3260", "/dev/sdb", "36001405aaaa"),
                ("10.0.1.1:3260", "/dev/sdc", "36001405bbbb"),
            ],
        );
        logged_in(&host, &["10.0.0.1:3260", "10.0.1.1:3260"]).await;

        let reconciler = MultipathReconciler::new(host.clone(), Duration::from_secs(5));
        let devices = host.iscsi_devices(IQN).await.unwrap();
        let err = reconciler.reconcile(&devices).await.unwrap_err();
        assert!(matches!(err, DriverError::MultipathDiverged(_)));
    }

    #[tokio::test]
    async fn test_single_path_used_directly() {
        let host = Arc::new(FakeHost::new());
        host.add_lun(IQN, &[("10.0.0.1:3260", "/dev/sdb", "36001405aaaa")]);
        logged_in(&host, &["10.0.0.1:3260"]).await;

        let reconciler = MultipathReconciler::new(host.clone(), Duration::from_secs(5));
        let aggregated = reconciler
            .reconcile(&[PathBuf::from("/dev/sdb")])
            .await
            .unwrap();
        assert_eq!(aggregated.device, PathBuf::from("/dev/sdb"));
        assert!(!aggregated.multipath);
    }

    #[tokio::test]
    async fn test_teardown_flushes_maps() {
        let host = Arc::new(FakeHost::new());
        host.add_lun(
            IQN,
            &[
                ("10.0.0.1:3260", "/dev/sdb", "36001405aaaa"),
                ("10.0.1.1:3260", "/dev/sdc", "36001405aaaa"),
            ],
        );
        logged_in(&host, &["10.0.0.1:3260", "10.0.1.1:3260"]).await;

        let reconciler = MultipathReconciler::new(host.clone(), Duration::from_secs(5));
        reconciler.teardown(IQN, None).await.unwrap();
        // Both paths share one map, flushed once
        assert_eq!(host.count("multipath_flush"), 1);
    }
}
