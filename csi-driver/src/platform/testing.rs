//! In-memory host for node tests.
//!
//! Models iSCSI sessions per (target, portal), the block device each session
//! attaches, dm-multipath maps over paths that share a wwid, filesystems and
//! mounts. Every operation is appended to a call log.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{FsStats, HostOps, PathKind, PlatformResult};
use crate::error::DriverError;
use crate::types::{Endpoint, FsType};

const GIB: u64 = 1 << 30;

#[derive(Debug, Clone)]
struct FakePath {
    portal: String,
    device: PathBuf,
    wwid: String,
}

#[derive(Debug, Default)]
struct State {
    initiator: Option<String>,
    luns: HashMap<String, Vec<FakePath>>,
    sessions: BTreeSet<(String, String)>,
    failing_portals: HashSet<String>,
    filesystems: HashMap<PathBuf, String>,
    device_sizes: HashMap<PathBuf, u64>,
    mounts: BTreeMap<PathBuf, String>,
    paths: BTreeMap<PathBuf, PathKind>,
    groups: HashMap<PathBuf, u32>,
    calls: Vec<String>,
}

impl State {
    fn path_of(&self, device: &Path) -> Option<(&str, &FakePath)> {
        self.luns.iter().find_map(|(iqn, paths)| {
            paths
                .iter()
                .find(|p| p.device == device)
                .map(|p| (iqn.as_str(), p))
        })
    }

    fn logged_in(&self, iqn: &str, portal: &str) -> bool {
        self.sessions.contains(&(iqn.to_string(), portal.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<State>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: &str) {
        self.state().calls.push(call.to_string());
    }

    pub fn with_initiator(self, iqn: &str) -> Self {
        self.state().initiator = Some(iqn.to_string());
        self
    }

    /// Expose a LUN of `target_iqn` through `(portal, device, wwid)` paths.
    /// A path's device appears once its portal is logged in.
    pub fn add_lun(&self, target_iqn: &str, paths: &[(&str, &str, &str)]) {
        self.state().luns.insert(
            target_iqn.to_string(),
            paths
                .iter()
                .map(|(portal, device, wwid)| FakePath {
                    portal: portal.to_string(),
                    device: PathBuf::from(device),
                    wwid: wwid.to_string(),
                })
                .collect(),
        );
    }

    pub fn fail_portal(&self, portal: &str) {
        self.state().failing_portals.insert(portal.to_string());
    }

    pub fn set_filesystem(&self, device: &str, fs_type: &str) {
        self.state()
            .filesystems
            .insert(PathBuf::from(device), fs_type.to_string());
    }

    pub fn set_device_size(&self, device: &str, bytes: u64) {
        self.state().device_sizes.insert(PathBuf::from(device), bytes);
    }

    /// Pretend `source` is already mounted at `target`.
    pub fn preset_mount(&self, source: &str, target: &str) {
        let mut state = self.state();
        state.mounts.insert(PathBuf::from(target), source.to_string());
        state.paths.insert(PathBuf::from(target), PathKind::Directory);
    }

    pub fn set_group(&self, path: &str, gid: u32) {
        self.state().groups.insert(PathBuf::from(path), gid);
    }

    pub fn sessions(&self) -> Vec<(String, String)> {
        self.state().sessions.iter().cloned().collect()
    }

    pub fn mounts(&self) -> BTreeMap<PathBuf, String> {
        self.state().mounts.clone()
    }

    pub fn filesystem(&self, device: &str) -> Option<String> {
        self.state().filesystems.get(Path::new(device)).cloned()
    }

    pub fn group(&self, path: &str) -> Option<u32> {
        self.state().groups.get(Path::new(path)).copied()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.state().calls.iter().filter(|c| *c == call).count()
    }

    /// Position of the first `call` in the call log.
    pub fn position(&self, call: &str) -> Option<usize> {
        self.state().calls.iter().position(|c| c == call)
    }
}

#[async_trait]
impl HostOps for FakeHost {
    async fn initiator_name(&self) -> PlatformResult<Option<String>> {
        Ok(self.state().initiator.clone())
    }

    async fn iscsi_login(&self, target_iqn: &str, portal: &Endpoint) -> PlatformResult<()> {
        self.record("iscsi_login");
        let portal = portal.to_portal_string();
        let mut state = self.state();
        if state.failing_portals.contains(&portal) {
            return Err(DriverError::Host(format!("iscsiadm login to {portal} failed")));
        }
        let known = state
            .luns
            .get(target_iqn)
            .is_some_and(|paths| paths.iter().any(|p| p.portal == portal));
        if !known {
            return Err(DriverError::Host(format!(
                "no target {target_iqn} behind {portal}"
            )));
        }
        state.sessions.insert((target_iqn.to_string(), portal));
        Ok(())
    }

    async fn iscsi_logout(&self, target_iqn: &str) -> PlatformResult<()> {
        self.record("iscsi_logout");
        self.state().sessions.retain(|(iqn, _)| iqn != target_iqn);
        Ok(())
    }

    async fn iscsi_rescan(&self, _target_iqn: &str) -> PlatformResult<()> {
        self.record("iscsi_rescan");
        Ok(())
    }

    async fn iscsi_devices(&self, target_iqn: &str) -> PlatformResult<Vec<PathBuf>> {
        let state = self.state();
        let mut devices: Vec<PathBuf> = state
            .luns
            .get(target_iqn)
            .map(|paths| {
                paths
                    .iter()
                    .filter(|p| state.logged_in(target_iqn, &p.portal))
                    .map(|p| p.device.clone())
                    .collect()
            })
            .unwrap_or_default();
        devices.sort();
        Ok(devices)
    }

    async fn device_wwid(&self, device: &Path) -> PlatformResult<Option<String>> {
        Ok(self.state().path_of(device).map(|(_, p)| p.wwid.clone()))
    }

    async fn multipath_holder(&self, device: &Path) -> PlatformResult<Option<PathBuf>> {
        let state = self.state();
        let Some((iqn, path)) = state.path_of(device) else {
            return Ok(None);
        };
        let live_paths = state.luns[iqn]
            .iter()
            .filter(|p| p.wwid == path.wwid && state.logged_in(iqn, &p.portal))
            .count();
        Ok((live_paths > 1).then(|| PathBuf::from(format!("/dev/mapper/{}", path.wwid))))
    }

    async fn multipath_flush(&self, _device: &Path) -> PlatformResult<()> {
        self.record("multipath_flush");
        Ok(())
    }

    async fn multipath_resize(&self, _device: &Path) -> PlatformResult<()> {
        self.record("multipath_resize");
        Ok(())
    }

    async fn filesystem_type(&self, device: &Path) -> PlatformResult<Option<String>> {
        Ok(self.state().filesystems.get(device).cloned())
    }

    async fn format(&self, device: &Path, fs_type: FsType) -> PlatformResult<()> {
        self.record("format");
        self.state()
            .filesystems
            .insert(device.to_path_buf(), fs_type.to_string());
        Ok(())
    }

    async fn mount(&self, source: &str, target: &Path, _fs_type: &str, _options: &[String]) -> PlatformResult<()> {
        self.record("mount");
        let mut state = self.state();
        state.mounts.insert(target.to_path_buf(), source.to_string());
        state.paths.insert(target.to_path_buf(), PathKind::Directory);
        Ok(())
    }

    async fn bind_mount(&self, source: &Path, target: &Path, _readonly: bool) -> PlatformResult<()> {
        self.record("bind_mount");
        let mut state = self.state();
        if !state.paths.contains_key(target) {
            return Err(DriverError::Host(format!(
                "mount point {} does not exist",
                target.display()
            )));
        }
        state
            .mounts
            .insert(target.to_path_buf(), source.to_string_lossy().into_owned());
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> PlatformResult<()> {
        if self.state().mounts.remove(target).is_some() {
            self.record("unmount");
        }
        Ok(())
    }

    async fn mount_source(&self, target: &Path) -> PlatformResult<Option<String>> {
        Ok(self.state().mounts.get(target).cloned())
    }

    async fn resize_filesystem(&self, _device: &Path, _mount_path: &Path, _fs_type: &str) -> PlatformResult<()> {
        self.record("resize_filesystem");
        Ok(())
    }

    async fn filesystem_stats(&self, _path: &Path) -> PlatformResult<FsStats> {
        Ok(FsStats {
            total_bytes: GIB,
            used_bytes: GIB / 4,
            available_bytes: GIB - GIB / 4,
            total_inodes: 65536,
            used_inodes: 11,
            free_inodes: 65525,
        })
    }

    async fn block_device_size(&self, device: &Path) -> PlatformResult<u64> {
        Ok(self
            .state()
            .device_sizes
            .get(device)
            .copied()
            .unwrap_or(GIB))
    }

    async fn path_kind(&self, path: &Path) -> PlatformResult<PathKind> {
        Ok(self
            .state()
            .paths
            .get(path)
            .copied()
            .unwrap_or(PathKind::Missing))
    }

    async fn ensure_dir(&self, path: &Path) -> PlatformResult<()> {
        self.state()
            .paths
            .entry(path.to_path_buf())
            .or_insert(PathKind::Directory);
        Ok(())
    }

    async fn ensure_file(&self, path: &Path) -> PlatformResult<()> {
        self.state()
            .paths
            .entry(path.to_path_buf())
            .or_insert(PathKind::File);
        Ok(())
    }

    async fn remove_path(&self, path: &Path) -> PlatformResult<()> {
        let mut state = self.state();
        if state.mounts.contains_key(path) {
            return Err(DriverError::Host(format!("{} is busy", path.display())));
        }
        state.paths.remove(path);
        Ok(())
    }

    async fn group_of(&self, path: &Path) -> PlatformResult<u32> {
        Ok(self.state().groups.get(path).copied().unwrap_or(0))
    }

    async fn change_group(&self, path: &Path, gid: u32) -> PlatformResult<()> {
        self.record("change_group");
        self.state().groups.insert(path.to_path_buf(), gid);
        Ok(())
    }
}
