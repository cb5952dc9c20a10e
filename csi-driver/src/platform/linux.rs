//! Linux host implementation for CSI Node operations
//!
//! Uses Linux-specific tools:
//! - iscsiadm for iSCSI (open-iscsi)
//! - multipath/multipathd for dm-multipath
//! - blkid, mkfs.ext4/mkfs.xfs, resize2fs/xfs_growfs for filesystems
//! - mount/umount for device, share and bind mounts
//!
//! Every command runs with `kill_on_drop` under the command timeout, so a
//! cancelled request also stops the tool it was waiting on.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::{FsStats, HostOps, PathKind, PlatformResult};
use crate::error::DriverError;
use crate::types::{Endpoint, FsType};

const INITIATOR_NAME_FILE: &str = "/etc/iscsi/initiatorname.iscsi";
const DISK_BY_PATH: &str = "/dev/disk/by-path";

static PASSWORD_OPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"password=[^,]*").expect("Invalid regex pattern"));

/// Mask credentials in command arguments before they are logged.
fn redact(arg: &str) -> String {
    PASSWORD_OPTION.replace_all(arg, "password=***").into_owned()
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Parse `InitiatorName=` out of the open-iscsi initiator file.
fn parse_initiator_name(contents: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| line.strip_prefix("InitiatorName="))
        .map(|iqn| iqn.trim().to_string())
        .filter(|iqn| !iqn.is_empty())
}

/// Whether a `/dev/disk/by-path` entry is a LUN of `target_iqn`.
///
/// Entries look like `ip-10.0.0.1:3260-iscsi-<iqn>-lun-1`.
fn is_target_path_entry(entry: &str, target_iqn: &str) -> bool {
    entry
        .split_once("-iscsi-")
        .and_then(|(_, rest)| rest.rsplit_once("-lun-"))
        .is_some_and(|(iqn, lun)| iqn == target_iqn && !lun.contains("-part"))
}

/// Parse `df --output=size,used,avail,itotal,iused,iavail -B1` output.
fn parse_df(stdout: &str) -> Option<FsStats> {
    let values: Vec<u64> = stdout
        .lines()
        .nth(1)?
        .split_whitespace()
        .map(|v| v.parse::<u64>())
        .collect::<Result<_, _>>()
        .ok()?;
    match values.as_slice() {
        [total, used, available, inodes, used_inodes, free_inodes] => Some(FsStats {
            total_bytes: *total,
            used_bytes: *used,
            available_bytes: *available,
            total_inodes: *inodes,
            used_inodes: *used_inodes,
            free_inodes: *free_inodes,
        }),
        _ => None,
    }
}

/// Find the mount source of `target` in `/proc/mounts` content.
fn parse_mount_source(mounts: &str, target: &Path) -> Option<String> {
    let target = target.to_string_lossy();
    mounts.lines().rev().find_map(|line| {
        let mut fields = line.split_whitespace();
        let source = fields.next()?;
        let mount_point = fields.next()?;
        (mount_point == target).then(|| source.to_string())
    })
}

fn device_name(device: &Path) -> String {
    device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Host operations backed by the Linux userland.
#[derive(Debug, Clone)]
pub struct LinuxHost {
    command_timeout: Duration,
}

impl LinuxHost {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    async fn run(&self, program: &str, args: &[&str]) -> PlatformResult<Output> {
        debug!(
            program,
            args = ?args.iter().map(|a| redact(a)).collect::<Vec<_>>(),
            "Running host command"
        );
        let child = Command::new(program).args(args).kill_on_drop(true).output();
        match tokio::time::timeout(self.command_timeout, child).await {
            Err(_) => {
                error!(program, timeout = ?self.command_timeout, "Host command timed out");
                Err(DriverError::DeviceTimeout(format!(
                    "{program} to finish within {:?}",
                    self.command_timeout
                )))
            }
            Ok(Err(e)) => {
                error!(error = %e, program, "Failed to execute host command");
                Err(DriverError::Host(format!("failed to execute {program}: {e}")))
            }
            Ok(Ok(output)) => Ok(output),
        }
    }

    /// Run a command and fail on a non-zero exit.
    async fn run_checked(&self, program: &str, args: &[&str]) -> PlatformResult<String> {
        let output = self.run(program, args).await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            error!(program, stderr = %stderr, "Host command failed");
            return Err(DriverError::Host(format!("{program} failed: {stderr}")));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Map a dm device (`dm-3`) to its `/dev/mapper` name if it is a
    /// multipath map.
    async fn multipath_map(&self, holder: &str) -> Option<PathBuf> {
        let sys = Path::new("/sys/block").join(holder).join("dm");
        let uuid = fs::read_to_string(sys.join("uuid")).await.ok()?;
        if !uuid.trim().starts_with("mpath-") {
            return None;
        }
        match fs::read_to_string(sys.join("name")).await {
            Ok(name) => Some(Path::new("/dev/mapper").join(name.trim())),
            Err(_) => Some(Path::new("/dev").join(holder)),
        }
    }
}

#[async_trait]
impl HostOps for LinuxHost {
    async fn initiator_name(&self) -> PlatformResult<Option<String>> {
        match fs::read_to_string(INITIATOR_NAME_FILE).await {
            Ok(contents) => Ok(parse_initiator_name(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = INITIATOR_NAME_FILE, "No iSCSI initiator name configured");
                Ok(None)
            }
            Err(e) => Err(DriverError::Host(format!(
                "failed to read {INITIATOR_NAME_FILE}: {e}"
            ))),
        }
    }

    async fn iscsi_login(&self, target_iqn: &str, portal: &Endpoint) -> PlatformResult<()> {
        let portal = portal.to_portal_string();

        // Run sendtargets discovery to populate the node database
        let discover = self
            .run("iscsiadm", &["-m", "discovery", "-t", "sendtargets", "-p", &portal])
            .await?;
        if !discover.status.success() {
            warn!(
                stderr = %stderr_of(&discover),
                portal = %portal,
                "iscsiadm discovery returned error (may be expected if target already known)"
            );
        }

        let login = self
            .run("iscsiadm", &["-m", "node", "-T", target_iqn, "-p", &portal, "--login"])
            .await?;
        if !login.status.success() {
            let stderr = stderr_of(&login);
            if stderr.contains("already present") || stderr.contains("session already exists") {
                info!(target_iqn = %target_iqn, portal = %portal, "iSCSI session already exists");
                return Ok(());
            }
            error!(stderr = %stderr, portal = %portal, "iscsiadm login failed");
            return Err(DriverError::Host(format!(
                "iscsiadm login to {portal} failed: {stderr}"
            )));
        }

        info!(target_iqn = %target_iqn, portal = %portal, "iSCSI login successful");
        Ok(())
    }

    async fn iscsi_logout(&self, target_iqn: &str) -> PlatformResult<()> {
        info!(target_iqn = %target_iqn, "Logging out of iSCSI target");

        let output = self
            .run("iscsiadm", &["-m", "node", "-T", target_iqn, "--logout"])
            .await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if !(stderr.contains("No matching sessions") || stderr.contains("not logged in")) {
                error!(stderr = %stderr, "iscsiadm logout failed");
                return Err(DriverError::Host(format!("iscsiadm logout failed: {stderr}")));
            }
            debug!(target_iqn = %target_iqn, "iSCSI target was not logged in");
        }

        // Drop the node records so the target is not logged in again at boot
        let delete = self
            .run("iscsiadm", &["-m", "node", "-T", target_iqn, "-o", "delete"])
            .await?;
        if !delete.status.success() {
            debug!(stderr = %stderr_of(&delete), "iscsiadm node record cleanup failed");
        }
        Ok(())
    }

    async fn iscsi_rescan(&self, target_iqn: &str) -> PlatformResult<()> {
        self.run_checked("iscsiadm", &["-m", "node", "-T", target_iqn, "-R"])
            .await
            .map(|_| ())
    }

    async fn iscsi_devices(&self, target_iqn: &str) -> PlatformResult<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(DISK_BY_PATH).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DriverError::Host(format!("failed to read {DISK_BY_PATH}: {e}"))),
        };

        let mut devices = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if !is_target_path_entry(&name.to_string_lossy(), target_iqn) {
                continue;
            }
            if let Ok(device) = fs::canonicalize(entry.path()).await {
                devices.push(device);
            }
        }
        devices.sort();
        devices.dedup();
        Ok(devices)
    }

    async fn device_wwid(&self, device: &Path) -> PlatformResult<Option<String>> {
        let sysfs = Path::new("/sys/block")
            .join(device_name(device))
            .join("device/wwid");
        if let Ok(wwid) = fs::read_to_string(&sysfs).await {
            let wwid = wwid.trim();
            if !wwid.is_empty() {
                return Ok(Some(wwid.to_string()));
            }
        }

        let device = device.to_string_lossy();
        let output = self
            .run("/lib/udev/scsi_id", &["-g", "-u", "-d", &device])
            .await?;
        let wwid = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((output.status.success() && !wwid.is_empty()).then_some(wwid))
    }

    async fn multipath_holder(&self, device: &Path) -> PlatformResult<Option<PathBuf>> {
        let holders = Path::new("/sys/block")
            .join(device_name(device))
            .join("holders");
        let Ok(mut entries) = fs::read_dir(&holders).await else {
            return Ok(None);
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let holder = entry.file_name().to_string_lossy().into_owned();
            if holder.starts_with("dm-")
                && let Some(map) = self.multipath_map(&holder).await
            {
                debug!(device = %device.display(), multipath = %map.display(), "Device is multipathed");
                return Ok(Some(map));
            }
        }
        Ok(None)
    }

    async fn multipath_flush(&self, device: &Path) -> PlatformResult<()> {
        info!(device = %device.display(), "Flushing multipath map");
        let device = device.to_string_lossy();
        let output = self.run("multipath", &["-f", &device]).await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if stderr.contains("not a multipath device") || stderr.contains("No such") {
                return Ok(());
            }
            return Err(DriverError::Host(format!("multipath -f {device} failed: {stderr}")));
        }
        Ok(())
    }

    async fn multipath_resize(&self, device: &Path) -> PlatformResult<()> {
        let name = device_name(device);
        self.run_checked("multipathd", &["resize", "map", &name])
            .await
            .map(|_| ())
    }

    async fn filesystem_type(&self, device: &Path) -> PlatformResult<Option<String>> {
        let device = device.to_string_lossy();
        let output = self
            .run("blkid", &["-p", "-s", "TYPE", "-o", "value", &device])
            .await?;
        // blkid exits 2 when it finds no signature
        match output.status.code() {
            Some(0) => {
                let fs_type = String::from_utf8_lossy(&output.stdout).trim().to_string();
                Ok((!fs_type.is_empty()).then_some(fs_type))
            }
            Some(2) => Ok(None),
            _ => Err(DriverError::Host(format!(
                "blkid {device} failed: {}",
                stderr_of(&output)
            ))),
        }
    }

    async fn format(&self, device: &Path, fs_type: FsType) -> PlatformResult<()> {
        info!(device = %device.display(), fs_type = %fs_type, "Formatting device");
        let device = device.to_string_lossy();
        match fs_type {
            FsType::Ext4 => self.run_checked("mkfs.ext4", &["-F", &device]).await?,
            FsType::Xfs => self.run_checked("mkfs.xfs", &["-f", &device]).await?,
        };
        Ok(())
    }

    async fn mount(&self, source: &str, target: &Path, fs_type: &str, options: &[String]) -> PlatformResult<()> {
        info!(source = %source, target = %target.display(), fs_type = %fs_type, "Mounting");
        self.ensure_dir(target).await?;

        let target = target.to_string_lossy();
        let joined = options.join(",");
        let mut args = vec!["-t", fs_type];
        if !joined.is_empty() {
            args.extend(["-o", joined.as_str()]);
        }
        args.extend([source, &*target]);
        self.run_checked("mount", &args).await.map(|_| ())
    }

    async fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> PlatformResult<()> {
        info!(
            source = %source.display(),
            target = %target.display(),
            readonly,
            "Creating bind mount"
        );
        let source = source.to_string_lossy();
        let target = target.to_string_lossy();
        self.run_checked("mount", &["--bind", &source, &target]).await?;
        if readonly {
            self.run_checked("mount", &["-o", "remount,bind,ro", &target])
                .await?;
        }
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> PlatformResult<()> {
        if !self.is_mounted(target).await? {
            debug!(target = %target.display(), "Path is not mounted, skipping unmount");
            return Ok(());
        }

        info!(target = %target.display(), "Unmounting");
        let target_str = target.to_string_lossy();
        let output = self.run("umount", &[&target_str]).await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if stderr.contains("not mounted") || stderr.contains("no mount point") {
                warn!(target = %target_str, "Path was not mounted");
                return Ok(());
            }
            error!(stderr = %stderr, "umount failed");
            return Err(DriverError::Host(format!("umount {target_str} failed: {stderr}")));
        }
        Ok(())
    }

    async fn mount_source(&self, target: &Path) -> PlatformResult<Option<String>> {
        let mounts = fs::read_to_string("/proc/mounts")
            .await
            .map_err(|e| DriverError::Host(format!("failed to read /proc/mounts: {e}")))?;
        Ok(parse_mount_source(&mounts, target))
    }

    async fn resize_filesystem(&self, device: &Path, mount_path: &Path, fs_type: &str) -> PlatformResult<()> {
        info!(device = %device.display(), fs_type = %fs_type, "Resizing filesystem");
        match fs_type {
            "ext4" | "ext3" | "ext2" => {
                let device = device.to_string_lossy();
                self.run_checked("resize2fs", &[&device]).await?;
            }
            "xfs" => {
                let mount_path = mount_path.to_string_lossy();
                self.run_checked("xfs_growfs", &[&mount_path]).await?;
            }
            other => {
                return Err(DriverError::InvalidArgument(format!(
                    "can not resize filesystem {other}"
                )));
            }
        }
        Ok(())
    }

    async fn filesystem_stats(&self, path: &Path) -> PlatformResult<FsStats> {
        let path = path.to_string_lossy();
        let stdout = self
            .run_checked(
                "df",
                &["--output=size,used,avail,itotal,iused,iavail", "-B1", &path],
            )
            .await?;
        parse_df(&stdout).ok_or_else(|| DriverError::Host(format!("could not parse df output for {path}")))
    }

    async fn block_device_size(&self, device: &Path) -> PlatformResult<u64> {
        let device = device.to_string_lossy();
        let stdout = self
            .run_checked("blockdev", &["--getsize64", &device])
            .await?;
        stdout
            .trim()
            .parse::<u64>()
            .map_err(|e| DriverError::Host(format!("could not parse size of {device}: {e}")))
    }

    async fn path_kind(&self, path: &Path) -> PlatformResult<PathKind> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(PathKind::Directory),
            Ok(_) => Ok(PathKind::File),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PathKind::Missing),
            Err(e) => Err(DriverError::Host(format!("failed to stat {}: {e}", path.display()))),
        }
    }

    async fn ensure_dir(&self, path: &Path) -> PlatformResult<()> {
        fs::create_dir_all(path).await.map_err(|e| {
            error!(error = %e, path = %path.display(), "Failed to create directory");
            DriverError::Host(format!("failed to create {}: {e}", path.display()))
        })
    }

    async fn ensure_file(&self, path: &Path) -> PlatformResult<()> {
        if let Some(parent) = path.parent() {
            self.ensure_dir(parent).await?;
        }
        fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .await
            .map(|_| ())
            .map_err(|e| DriverError::Host(format!("failed to create {}: {e}", path.display())))
    }

    async fn remove_path(&self, path: &Path) -> PlatformResult<()> {
        let result = match self.path_kind(path).await? {
            PathKind::Missing => return Ok(()),
            PathKind::Directory => fs::remove_dir(path).await,
            PathKind::File => fs::remove_file(path).await,
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DriverError::Host(format!("failed to remove {}: {e}", path.display()))),
        }
    }

    async fn group_of(&self, path: &Path) -> PlatformResult<u32> {
        fs::metadata(path)
            .await
            .map(|meta| meta.gid())
            .map_err(|e| DriverError::Host(format!("failed to stat {}: {e}", path.display())))
    }

    async fn change_group(&self, path: &Path, gid: u32) -> PlatformResult<()> {
        info!(path = %path.display(), gid, "Changing volume group ownership");
        let path = path.to_string_lossy();
        let gid = gid.to_string();
        self.run_checked("chgrp", &["-R", &gid, &path]).await?;
        self.run_checked("chmod", &["-R", "g+rwX", &path]).await?;
        Ok(())
    }
}
