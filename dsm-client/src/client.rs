//! The Array Storage Client contract.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    ArrayCapabilities, Credentials, IscsiTarget, LunSpec, Session, ShareSpec, SnapshotInfo,
    SnapshotSpec, StorageObject, StoragePool, TargetSpec,
};

/// Typed operations against a single storage array.
///
/// Implementations never cache sessions: every call takes the session it
/// runs under, and session lifetime is owned by the caller. Errors are
/// reported through the closed `DsmError` set so callers can decide between
/// retry, re-login and surfacing.
#[async_trait]
pub trait ArrayClient: Send + Sync {
    /// Host this client talks to.
    fn host(&self) -> &str;

    async fn login(&self, credentials: &Credentials) -> Result<Session>;

    async fn logout(&self, session: &Session) -> Result<()>;

    async fn capabilities(&self, session: &Session) -> Result<ArrayCapabilities>;

    async fn list_pools(&self, session: &Session) -> Result<Vec<StoragePool>>;

    /// All LUNs and shares on the array.
    async fn list_objects(&self, session: &Session) -> Result<Vec<StorageObject>>;

    /// Create a LUN, returning its id.
    async fn create_lun(&self, session: &Session, spec: &LunSpec) -> Result<String>;

    async fn delete_lun(&self, session: &Session, id: &str) -> Result<()>;

    /// Create a share, returning its id.
    async fn create_share(&self, session: &Session, spec: &ShareSpec) -> Result<String>;

    async fn delete_share(&self, session: &Session, id: &str) -> Result<()>;

    /// Grow a LUN or share to `new_size` bytes.
    async fn resize(&self, session: &Session, object: &StorageObject, new_size: u64)
    -> Result<()>;

    async fn list_iscsi_targets(&self, session: &Session) -> Result<Vec<IscsiTarget>>;

    /// Create an iSCSI target, returning its id.
    async fn create_iscsi_target(&self, session: &Session, spec: &TargetSpec) -> Result<String>;

    async fn delete_iscsi_target(&self, session: &Session, target_id: &str) -> Result<()>;

    /// Map a LUN into a target.
    async fn bind_lun(&self, session: &Session, target_id: &str, lun_id: &str) -> Result<()>;

    /// Replace the set of initiator IQNs allowed to log in to a target.
    async fn set_initiators(
        &self,
        session: &Session,
        target_id: &str,
        initiators: &[String],
    ) -> Result<()>;

    async fn create_snapshot(&self, session: &Session, spec: &SnapshotSpec)
    -> Result<SnapshotInfo>;

    async fn delete_snapshot(&self, session: &Session, snapshot: &SnapshotInfo) -> Result<()>;

    /// Snapshots of every LUN and share on the array.
    async fn list_snapshots(&self, session: &Session) -> Result<Vec<SnapshotInfo>>;
}
