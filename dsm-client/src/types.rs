//! Typed model of the objects an array exposes.
//!
//! These types are the contract between the driver and any `ArrayClient`
//! implementation. Nothing here is tied to the DSM wire format; the
//! WebAPI client converts its JSON payloads into these types.

use std::fmt::{self, Display};
use std::time::SystemTime;

use secrecy::SecretString;

// ============================================================================
// Credentials and sessions
// ============================================================================

/// Login credentials for one array.
#[derive(Debug)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }
}

/// An authenticated session token.
///
/// Sessions are explicit values: every client call takes the session it
/// should run under instead of looking one up by host.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub host: String,
    pub sid: String,
    pub established_at: SystemTime,
}

impl Session {
    pub fn new(host: impl Into<String>, sid: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            sid: sid.into(),
            established_at: SystemTime::now(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("sid", &"[REDACTED]")
            .field("established_at", &self.established_at)
            .finish()
    }
}

/// Features an array advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayCapabilities {
    pub iscsi: bool,
    pub smb: bool,
    pub nfs: bool,
    pub snapshot: bool,
    /// Whether a parent object can be deleted while snapshots of it exist
    /// without destroying them.
    pub orphaned_snapshots: bool,
}

impl ArrayCapabilities {
    /// Assumed when capability discovery fails.
    pub const fn iscsi_only() -> Self {
        Self {
            iscsi: true,
            smb: false,
            nfs: false,
            snapshot: false,
            orphaned_snapshots: false,
        }
    }

    pub const fn all() -> Self {
        Self {
            iscsi: true,
            smb: true,
            nfs: true,
            snapshot: true,
            orphaned_snapshots: false,
        }
    }
}

impl Default for ArrayCapabilities {
    fn default() -> Self {
        Self::iscsi_only()
    }
}

// ============================================================================
// Storage pools and objects
// ============================================================================

/// A storage volume on the array (DSM calls these "volumes", e.g. `/volume1`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePool {
    pub location: String,
    pub fs_type: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Kind of a backend object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Lun,
    Share,
}

impl Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Lun => write!(f, "lun"),
            ObjectKind::Share => write!(f, "share"),
        }
    }
}

/// A LUN or share as listed by the array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageObject {
    /// LUN uuid, or the share name for shares.
    pub id: String,
    pub name: String,
    pub kind: ObjectKind,
    pub size_bytes: u64,
    pub location: String,
    pub description: String,
}

impl StorageObject {
    /// Filesystem path of a share on the array (`/volume1/name`).
    pub fn share_path(&self) -> String {
        format!("{}/{}", self.location.trim_end_matches('/'), self.name)
    }
}

/// LUN allocation type as understood by DSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LunType {
    /// Thin LUN on an ext4 volume
    Thin,
    /// Thick (file-backed) LUN on an ext4 volume
    File,
    /// Thin block LUN on a btrfs volume
    Blun,
    /// Thick block LUN on a btrfs volume
    BlunThick,
}

impl LunType {
    /// Pick the LUN type for a pool filesystem and allocation mode.
    pub fn for_pool(fs_type: &str, thin: bool) -> Self {
        match (fs_type.eq_ignore_ascii_case("btrfs"), thin) {
            (true, true) => LunType::Blun,
            (true, false) => LunType::BlunThick,
            (false, true) => LunType::Thin,
            (false, false) => LunType::File,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            LunType::Thin => "THIN",
            LunType::File => "FILE",
            LunType::Blun => "BLUN",
            LunType::BlunThick => "BLUN_THICK",
        }
    }
}

/// Where a new object's initial content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneSource {
    /// Clone from a snapshot of `parent_id`.
    Snapshot {
        parent_id: String,
        snapshot_id: String,
    },
    /// Clone a live object.
    Object { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LunSpec {
    pub name: String,
    pub location: String,
    pub size_bytes: u64,
    pub lun_type: LunType,
    pub description: String,
    pub source: Option<CloneSource>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareSpec {
    pub name: String,
    pub location: String,
    pub size_bytes: u64,
    pub description: String,
    /// Open an NFS export rule for the share.
    pub nfs: bool,
    pub source: Option<CloneSource>,
}

// ============================================================================
// iSCSI targets
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub name: String,
    pub iqn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiTarget {
    pub id: String,
    pub name: String,
    pub iqn: String,
    /// Uuids of the LUNs mapped to this target.
    pub mapped_luns: Vec<String>,
    /// Initiator IQNs granted access. Empty means nobody may log in.
    pub initiators: Vec<String>,
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSpec {
    pub name: String,
    pub description: String,
    pub parent_id: String,
    pub parent_kind: ObjectKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Backend snapshot id (uuid for LUN snapshots, timestamp name for share
    /// snapshots).
    pub id: String,
    pub name: String,
    pub parent_id: String,
    pub parent_name: String,
    pub parent_kind: ObjectKind,
    pub size_bytes: u64,
    /// Seconds since the Unix epoch.
    pub created_at: i64,
    pub ready: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lun_type_for_pool() {
        assert_eq!(LunType::for_pool("btrfs", true), LunType::Blun);
        assert_eq!(LunType::for_pool("BTRFS", false), LunType::BlunThick);
        assert_eq!(LunType::for_pool("ext4", true), LunType::Thin);
        assert_eq!(LunType::for_pool("ext4", false), LunType::File);
        assert_eq!(LunType::BlunThick.as_str(), "BLUN_THICK");
    }

    #[test]
    fn test_session_debug_redacts_sid() {
        let session = Session::new("10.0.0.1", "very-secret-sid");
        let printed = format!("{:?}", session);
        assert!(printed.contains("10.0.0.1"));
        assert!(!printed.contains("very-secret-sid"));
    }

    #[test]
    fn test_share_path() {
        let share = StorageObject {
            id: "k8s-csi-pvc-1".to_string(),
            name: "k8s-csi-pvc-1".to_string(),
            kind: ObjectKind::Share,
            size_bytes: 0,
            location: "/volume1/".to_string(),
            description: String::new(),
        };
        assert_eq!(share.share_path(), "/volume1/k8s-csi-pvc-1");
    }
}
