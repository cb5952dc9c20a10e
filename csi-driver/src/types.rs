//! Type-safe wrappers for CSI parameters.
//!
//! These types provide compile-time safety for parameters that are parsed
//! from StorageClass parameters, volume contexts and node ids. Each type
//! implements `FromStr` for parsing at API boundaries.

use std::fmt::{self, Display};
use std::str::FromStr;

use dsm_client::ObjectKind;

/// StorageClass parameter keys.
pub mod params {
    pub const PROTOCOL: &str = "protocol";
    pub const FS_TYPE: &str = "fsType";
    pub const CSI_FS_TYPE: &str = "csi.storage.k8s.io/fstype";
    pub const DSM: &str = "dsm";
    pub const LOCATION: &str = "location";
    pub const PVC_NAME: &str = "csi.storage.k8s.io/pvc/name";
    pub const PVC_NAMESPACE: &str = "csi.storage.k8s.io/pvc/namespace";
    pub const PV_NAME: &str = "csi.storage.k8s.io/pv/name";
    pub const SNAPSHOT_NAME: &str = "csi.storage.k8s.io/volumesnapshot/name";
    pub const SNAPSHOT_NAMESPACE: &str = "csi.storage.k8s.io/volumesnapshot/namespace";
    pub const SNAPSHOT_CONTENT_NAME: &str = "csi.storage.k8s.io/volumesnapshotcontent/name";
}

/// Volume context keys handed from the controller to the node plugin.
pub mod context {
    pub const DSM: &str = "dsm";
    pub const PROTOCOL: &str = "protocol";
    pub const TARGET_IQN: &str = "targetIqn";
    pub const PORTALS: &str = "portals";
    pub const SOURCE: &str = "source";
    pub const FS_TYPE: &str = "fsType";
}

// ============================================================================
// BackendKind
// ============================================================================

/// How a volume is backed on the array and exposed to nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    /// iSCSI LUN (default)
    #[default]
    Iscsi,
    /// SMB/CIFS share
    Smb,
    /// NFS share
    Nfs,
}

impl BackendKind {
    pub const PARAM_NAME: &'static str = params::PROTOCOL;

    /// Kind of array object backing this volume.
    pub const fn object_kind(self) -> ObjectKind {
        match self {
            BackendKind::Iscsi => ObjectKind::Lun,
            BackendKind::Smb | BackendKind::Nfs => ObjectKind::Share,
        }
    }

    pub const fn is_share(self) -> bool {
        matches!(self, BackendKind::Smb | BackendKind::Nfs)
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Iscsi => write!(f, "iscsi"),
            BackendKind::Smb => write!(f, "smb"),
            BackendKind::Nfs => write!(f, "nfs"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = BackendKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "iscsi" | "" => Ok(BackendKind::Iscsi),
            "smb" | "cifs" => Ok(BackendKind::Smb),
            "nfs" => Ok(BackendKind::Nfs),
            _ => Err(BackendKindParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid backend kind.
#[derive(Debug, Clone)]
pub struct BackendKindParseError(String);

impl Display for BackendKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown protocol '{}': expected 'iscsi', 'smb' or 'nfs'",
            self.0
        )
    }
}

impl std::error::Error for BackendKindParseError {}

// ============================================================================
// ProvisioningMode
// ============================================================================

/// Volume provisioning mode for space allocation.
///
/// Selects between thin and thick LUN types on the array. Shares are always
/// quota-bound and ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProvisioningMode {
    /// Thin provisioning (default): space allocated on write
    #[default]
    Thin,
    /// Thick provisioning: space reserved upfront
    Thick,
}

impl ProvisioningMode {
    /// Parameter name in StorageClass parameters
    pub const PARAM_NAME: &'static str = "provisioningMode";

    pub const fn is_thin(self) -> bool {
        matches!(self, ProvisioningMode::Thin)
    }
}

impl Display for ProvisioningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningMode::Thin => write!(f, "thin"),
            ProvisioningMode::Thick => write!(f, "thick"),
        }
    }
}

impl FromStr for ProvisioningMode {
    type Err = ProvisioningModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "thin" | "" => Ok(ProvisioningMode::Thin),
            "thick" => Ok(ProvisioningMode::Thick),
            _ => Err(ProvisioningModeParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid provisioning mode.
#[derive(Debug, Clone)]
pub struct ProvisioningModeParseError(String);

impl Display for ProvisioningModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown provisioning mode '{}': expected 'thin' or 'thick'",
            self.0
        )
    }
}

impl std::error::Error for ProvisioningModeParseError {}

// ============================================================================
// FsType
// ============================================================================

/// Filesystem created on iSCSI volumes with mount access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsType {
    #[default]
    Ext4,
    Xfs,
}

impl Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsType::Ext4 => write!(f, "ext4"),
            FsType::Xfs => write!(f, "xfs"),
        }
    }
}

impl FromStr for FsType {
    type Err = FsTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ext4" | "" => Ok(FsType::Ext4),
            "xfs" => Ok(FsType::Xfs),
            _ => Err(FsTypeParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unsupported filesystem type.
#[derive(Debug, Clone)]
pub struct FsTypeParseError(String);

impl Display for FsTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unsupported filesystem '{}': expected 'ext4' or 'xfs'",
            self.0
        )
    }
}

impl std::error::Error for FsTypeParseError {}

// ============================================================================
// FsGroupChangePolicy
// ============================================================================

/// When to re-apply the pod's fsGroup to a published volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsGroupChangePolicy {
    /// Change ownership only when the volume root has a different group
    #[default]
    OnRootMismatch,
    /// Change ownership recursively on every publish
    Always,
    /// Never change ownership
    None,
}

impl Display for FsGroupChangePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsGroupChangePolicy::OnRootMismatch => write!(f, "OnRootMismatch"),
            FsGroupChangePolicy::Always => write!(f, "Always"),
            FsGroupChangePolicy::None => write!(f, "None"),
        }
    }
}

impl FromStr for FsGroupChangePolicy {
    type Err = FsGroupChangePolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "onrootmismatch" => Ok(FsGroupChangePolicy::OnRootMismatch),
            "always" => Ok(FsGroupChangePolicy::Always),
            "none" => Ok(FsGroupChangePolicy::None),
            _ => Err(FsGroupChangePolicyParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid fsGroup change policy.
#[derive(Debug, Clone)]
pub struct FsGroupChangePolicyParseError(String);

impl Display for FsGroupChangePolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown fsGroup change policy '{}': expected 'OnRootMismatch', 'Always' or 'None'",
            self.0
        )
    }
}

impl std::error::Error for FsGroupChangePolicyParseError {}

// ============================================================================
// NodeIdentity
// ============================================================================

/// A node id as reported by NodeGetInfo: `<name>` or `<name>:<initiator iqn>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub name: String,
    pub iqn: Option<String>,
}

impl NodeIdentity {
    pub fn new(name: impl Into<String>, iqn: Option<String>) -> Self {
        Self {
            name: name.into(),
            iqn,
        }
    }
}

impl Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.iqn {
            Some(iqn) => write!(f, "{}:{}", self.name, iqn),
            None => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for NodeIdentity {
    type Err = NodeIdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // IQNs contain colons, node names never do
        let (name, iqn) = match s.split_once(':') {
            Some((name, iqn)) => (name, Some(iqn)),
            None => (s, None),
        };
        if name.is_empty() {
            return Err(NodeIdentityParseError(s.to_string()));
        }
        match iqn {
            Some(iqn) if !iqn.starts_with("iqn.") && !iqn.starts_with("eui.") => {
                Err(NodeIdentityParseError(s.to_string()))
            }
            Some(iqn) => Ok(NodeIdentity::new(name, Some(iqn.to_string()))),
            None => Ok(NodeIdentity::new(name, None)),
        }
    }
}

/// Error returned when parsing an invalid node id.
#[derive(Debug, Clone)]
pub struct NodeIdentityParseError(String);

impl Display for NodeIdentityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid node id '{}': expected '<name>' or '<name>:<initiator iqn>'",
            self.0
        )
    }
}

impl std::error::Error for NodeIdentityParseError {}

// ============================================================================
// Endpoint
// ============================================================================

/// Default iSCSI portal port.
pub const ISCSI_PORT: u16 = 3260;

/// An iSCSI portal (host:port).
///
/// The host can be an IP address (v4 or v6) or a hostname - no resolution is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Format as the "host:port" portal string iscsiadm expects.
    pub fn to_portal_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_portal_string())
    }
}

/// Error returned when parsing an invalid endpoint.
#[derive(Debug, Clone)]
pub struct EndpointParseError(String);

impl Display for EndpointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid endpoint '{}': expected 'host:port' or 'host'", self.0)
    }
}

impl std::error::Error for EndpointParseError {}

/// The portals of one target, for multipath logins.
///
/// Carried in the volume context as a comma-separated list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    endpoints: Vec<Endpoint>,
}

impl Endpoints {
    /// Parse endpoints from a comma-separated string with a default port.
    ///
    /// Format: "host1:port1,host2:port2,..." or "host1,host2,..." (uses default_port).
    /// IPv6 hosts need brackets to carry a port: "[::1]:3260".
    pub fn parse(s: &str, default_port: u16) -> Result<Self, EndpointParseError> {
        let endpoints = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| Self::parse_single(part, default_port))
            .collect::<Result<Vec<_>, _>>()?;

        if endpoints.is_empty() {
            return Err(EndpointParseError(s.to_string()));
        }
        Ok(Self { endpoints })
    }

    fn parse_single(s: &str, default_port: u16) -> Result<Endpoint, EndpointParseError> {
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| EndpointParseError(s.to_string()))?;
            return match tail.strip_prefix(':') {
                None if tail.is_empty() => Ok(Endpoint::new(host, default_port)),
                Some(port) => port
                    .parse::<u16>()
                    .map(|port| Endpoint::new(host, port))
                    .map_err(|_| EndpointParseError(s.to_string())),
                None => Err(EndpointParseError(s.to_string())),
            };
        }

        // A bare IPv6 address has several colons and no port
        if s.matches(':').count() == 1
            && let Some((host, port)) = s.split_once(':')
        {
            let port = port
                .parse::<u16>()
                .map_err(|_| EndpointParseError(s.to_string()))?;
            if host.is_empty() {
                return Err(EndpointParseError(s.to_string()));
            }
            return Ok(Endpoint::new(host, port));
        }

        Ok(Endpoint::new(s, default_port))
    }

    pub fn from_hosts<I, S>(hosts: I, port: u16) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: hosts.into_iter().map(|h| Endpoint::new(h, port)).collect(),
        }
    }

    pub fn as_slice(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn is_multipath(&self) -> bool {
        self.endpoints.len() > 1
    }

    /// Format all endpoints as comma-separated "host:port" strings.
    pub fn to_portal_string(&self) -> String {
        self.endpoints
            .iter()
            .map(Endpoint::to_portal_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn first(&self) -> Option<&Endpoint> {
        self.endpoints.first()
    }
}

impl<'a> IntoIterator for &'a Endpoints {
    type Item = &'a Endpoint;
    type IntoIter = std::slice::Iter<'a, Endpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.endpoints.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("iscsi".parse::<BackendKind>().unwrap(), BackendKind::Iscsi);
        assert_eq!("ISCSI".parse::<BackendKind>().unwrap(), BackendKind::Iscsi);
        assert_eq!("".parse::<BackendKind>().unwrap(), BackendKind::Iscsi);
        assert_eq!("smb".parse::<BackendKind>().unwrap(), BackendKind::Smb);
        assert_eq!("CIFS".parse::<BackendKind>().unwrap(), BackendKind::Smb);
        assert_eq!("nfs".parse::<BackendKind>().unwrap(), BackendKind::Nfs);
        assert!("nvmeof".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_backend_kind_object_kind() {
        assert_eq!(BackendKind::Iscsi.object_kind(), ObjectKind::Lun);
        assert_eq!(BackendKind::Smb.object_kind(), ObjectKind::Share);
        assert_eq!(BackendKind::Nfs.object_kind(), ObjectKind::Share);
        assert!(!BackendKind::Iscsi.is_share());
        assert_eq!(BackendKind::Nfs.to_string(), "nfs");
    }

    #[test]
    fn test_provisioning_mode_from_str() {
        assert_eq!(
            "thin".parse::<ProvisioningMode>().unwrap(),
            ProvisioningMode::Thin
        );
        assert_eq!(
            "".parse::<ProvisioningMode>().unwrap(),
            ProvisioningMode::Thin
        );
        assert_eq!(
            "THICK".parse::<ProvisioningMode>().unwrap(),
            ProvisioningMode::Thick
        );
        assert!("unknown".parse::<ProvisioningMode>().is_err());
        assert!(ProvisioningMode::Thin.is_thin());
        assert!(!ProvisioningMode::Thick.is_thin());
    }

    #[test]
    fn test_fs_type_from_str() {
        assert_eq!("".parse::<FsType>().unwrap(), FsType::Ext4);
        assert_eq!("XFS".parse::<FsType>().unwrap(), FsType::Xfs);
        assert!("zfs".parse::<FsType>().is_err());
    }

    #[test]
    fn test_fs_group_change_policy_from_str() {
        assert_eq!(
            "OnRootMismatch".parse::<FsGroupChangePolicy>().unwrap(),
            FsGroupChangePolicy::OnRootMismatch
        );
        assert_eq!(
            "always".parse::<FsGroupChangePolicy>().unwrap(),
            FsGroupChangePolicy::Always
        );
        assert_eq!(
            "None".parse::<FsGroupChangePolicy>().unwrap(),
            FsGroupChangePolicy::None
        );
        assert!("sometimes".parse::<FsGroupChangePolicy>().is_err());
    }

    #[test]
    fn test_node_identity_parse() {
        let plain: NodeIdentity = "worker-1".parse().unwrap();
        assert_eq!(plain, NodeIdentity::new("worker-1", None));

        let with_iqn: NodeIdentity = "worker-1:iqn.1993-08.org.debian:01:abcdef"
            .parse()
            .unwrap();
        assert_eq!(with_iqn.name, "worker-1");
        assert_eq!(
            with_iqn.iqn.as_deref(),
            Some("iqn.1993-08.org.debian:01:abcdef")
        );
        assert_eq!(
            with_iqn.to_string(),
            "worker-1:iqn.1993-08.org.debian:01:abcdef"
        );

        assert!("".parse::<NodeIdentity>().is_err());
        assert!(":iqn.x".parse::<NodeIdentity>().is_err());
        assert!("worker-1:garbage".parse::<NodeIdentity>().is_err());
    }

    #[test]
    fn test_endpoints_parse_single_default_port() {
        let eps = Endpoints::parse("10.0.0.1", ISCSI_PORT).unwrap();
        assert_eq!(eps.len(), 1);
        assert!(!eps.is_multipath());
        assert_eq!(eps.first().unwrap().port, 3260);
    }

    #[test]
    fn test_endpoints_parse_multipath_mixed_ports() {
        let eps = Endpoints::parse(" 10.0.0.1:3261 , 10.0.0.2 ", ISCSI_PORT).unwrap();
        assert_eq!(eps.len(), 2);
        assert!(eps.is_multipath());
        assert_eq!(eps.to_portal_string(), "10.0.0.1:3261,10.0.0.2:3260");
    }

    #[test]
    fn test_endpoints_parse_ipv6() {
        let eps = Endpoints::parse("[2001:db8::1]:3260,[::1],fe80::2", 3260).unwrap();
        let hosts: Vec<_> = eps.as_slice().iter().map(|e| e.host.as_str()).collect();
        assert_eq!(hosts, vec!["2001:db8::1", "::1", "fe80::2"]);
        assert_eq!(eps.first().unwrap().to_portal_string(), "[2001:db8::1]:3260");
    }

    #[test]
    fn test_endpoints_parse_errors() {
        assert!(Endpoints::parse("", 3260).is_err());
        assert!(Endpoints::parse(" , ", 3260).is_err());
        assert!(Endpoints::parse("10.0.0.1:notaport", 3260).is_err());
        assert!(Endpoints::parse("[::1", 3260).is_err());
    }

    #[test]
    fn test_endpoints_from_hosts() {
        let eps = Endpoints::from_hosts(["10.0.0.1", "10.0.0.2"], ISCSI_PORT);
        assert_eq!(eps.to_portal_string(), "10.0.0.1:3260,10.0.0.2:3260");
    }
}
