//! Host operations for the CSI Node service
//!
//! Everything the node plugin does to the host goes through [`HostOps`]:
//! iSCSI initiator control, multipath, filesystems and mounts.
//! [`LinuxHost`] drives the real tools (iscsiadm, multipath, blkid, mkfs,
//! mount); tests use the in-memory `testing::FakeHost`.
//!
//! # Usage
//!
//! ```ignore
//! use crate::platform::{HostOps, LinuxHost};
//! use crate::types::Endpoints;
//!
//! let host = LinuxHost::new(timeouts.command);
//! for portal in &Endpoints::parse("10.0.0.1:3260,10.0.0.2:3260", 3260)? {
//!     host.iscsi_login(target_iqn, portal).await?;
//! }
//! let devices = host.iscsi_devices(target_iqn).await?;
//! ```

mod linux;
#[cfg(test)]
pub mod testing;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::DriverResult;
use crate::types::{Endpoint, FsType};

pub use linux::LinuxHost;

/// Result type for platform operations
pub type PlatformResult<T> = DriverResult<T>;

/// What lives at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Missing,
    Directory,
    File,
}

/// Capacity figures of a mounted filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FsStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub total_inodes: u64,
    pub used_inodes: u64,
    pub free_inodes: u64,
}

#[async_trait]
pub trait HostOps: Send + Sync {
    /// The initiator IQN from `/etc/iscsi/initiatorname.iscsi`, if configured.
    async fn initiator_name(&self) -> PlatformResult<Option<String>>;

    /// Discover and log in to `target_iqn` through one portal. Logging in
    /// to an existing session succeeds.
    async fn iscsi_login(&self, target_iqn: &str, portal: &Endpoint) -> PlatformResult<()>;

    /// Log out of every session to `target_iqn`. No sessions is success.
    async fn iscsi_logout(&self, target_iqn: &str) -> PlatformResult<()>;

    /// Rescan the sessions of `target_iqn` so LUN size changes show up.
    async fn iscsi_rescan(&self, target_iqn: &str) -> PlatformResult<()>;

    /// Raw SCSI block devices (one per session) attached for `target_iqn`.
    async fn iscsi_devices(&self, target_iqn: &str) -> PlatformResult<Vec<PathBuf>>;

    /// World-wide id of a SCSI block device, `None` if not yet known.
    async fn device_wwid(&self, device: &Path) -> PlatformResult<Option<String>>;

    /// The multipath map holding `device`, if any.
    async fn multipath_holder(&self, device: &Path) -> PlatformResult<Option<PathBuf>>;

    /// Flush a multipath map. A map that is already gone is success.
    async fn multipath_flush(&self, device: &Path) -> PlatformResult<()>;

    /// Resize a multipath map after its paths grew.
    async fn multipath_resize(&self, device: &Path) -> PlatformResult<()>;

    /// Filesystem signature on a device, `None` if blank.
    async fn filesystem_type(&self, device: &Path) -> PlatformResult<Option<String>>;

    async fn format(&self, device: &Path, fs_type: FsType) -> PlatformResult<()>;

    async fn mount(&self, source: &str, target: &Path, fs_type: &str, options: &[String]) -> PlatformResult<()>;

    async fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> PlatformResult<()>;

    /// Unmount `target`. A path that is not mounted is success.
    async fn unmount(&self, target: &Path) -> PlatformResult<()>;

    /// Source of the mount at `target`, `None` if nothing is mounted there.
    async fn mount_source(&self, target: &Path) -> PlatformResult<Option<String>>;

    async fn is_mounted(&self, target: &Path) -> PlatformResult<bool> {
        Ok(self.mount_source(target).await?.is_some())
    }

    /// Grow the filesystem on `device` (mounted at `mount_path`) to the
    /// device size.
    async fn resize_filesystem(&self, device: &Path, mount_path: &Path, fs_type: &str) -> PlatformResult<()>;

    async fn filesystem_stats(&self, path: &Path) -> PlatformResult<FsStats>;

    async fn block_device_size(&self, device: &Path) -> PlatformResult<u64>;

    async fn path_kind(&self, path: &Path) -> PlatformResult<PathKind>;

    async fn ensure_dir(&self, path: &Path) -> PlatformResult<()>;

    /// Create an empty file (and its parent directory) as a bind target for
    /// block volumes.
    async fn ensure_file(&self, path: &Path) -> PlatformResult<()>;

    /// Remove a mount point. A missing path is success.
    async fn remove_path(&self, path: &Path) -> PlatformResult<()>;

    async fn group_of(&self, path: &Path) -> PlatformResult<u32>;

    /// Recursively hand `path` to group `gid`.
    async fn change_group(&self, path: &Path, gid: u32) -> PlatformResult<()>;
}
