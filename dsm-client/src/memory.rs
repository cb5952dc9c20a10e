//! In-memory array for tests.
//!
//! Behaves like a single DSM array closely enough to drive the controller
//! end to end: names are unique per kind, pools run out of space, sessions
//! expire on demand and every call is counted. Faults can be queued per
//! operation to exercise retry and re-login paths.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::client::ArrayClient;
use crate::error::{DsmError, Result};
use crate::types::{
    ArrayCapabilities, CloneSource, Credentials, IscsiTarget, LunSpec, ObjectKind, Session,
    ShareSpec, SnapshotInfo, SnapshotSpec, StorageObject, StoragePool, TargetSpec,
};

/// Error code returned for calls made with an unknown session.
const SID_NOT_FOUND: i64 = 119;

#[derive(Default)]
struct State {
    pools: Vec<StoragePool>,
    capabilities: ArrayCapabilities,
    objects: BTreeMap<String, StorageObject>,
    targets: BTreeMap<String, IscsiTarget>,
    snapshots: BTreeMap<String, SnapshotInfo>,
    sessions: HashSet<String>,
    calls: HashMap<String, usize>,
    faults: HashMap<String, VecDeque<DsmError>>,
    create_delay: Option<Duration>,
    reject_logins: bool,
    next_id: u64,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }

    fn pool_mut(&mut self, location: &str) -> Result<&mut StoragePool> {
        self.pools
            .iter_mut()
            .find(|p| p.location == location)
            .ok_or_else(|| DsmError::BadRequest(format!("no storage volume {location}")))
    }

    fn reserve(&mut self, location: &str, size: u64) -> Result<()> {
        let pool = self.pool_mut(location)?;
        if pool.free_bytes < size {
            return Err(DsmError::OutOfSpace(format!(
                "{location} has {} bytes free, {size} requested",
                pool.free_bytes
            )));
        }
        pool.free_bytes -= size;
        Ok(())
    }

    fn release(&mut self, location: &str, size: u64) {
        if let Ok(pool) = self.pool_mut(location) {
            pool.free_bytes = (pool.free_bytes + size).min(pool.total_bytes);
        }
    }

    fn check_source(&self, source: &Option<CloneSource>) -> Result<()> {
        match source {
            None => Ok(()),
            Some(CloneSource::Object { id }) => self
                .objects
                .get(id)
                .map(|_| ())
                .ok_or_else(|| DsmError::NotFound(format!("clone source {id}"))),
            Some(CloneSource::Snapshot { snapshot_id, .. }) => self
                .snapshots
                .get(snapshot_id)
                .map(|_| ())
                .ok_or_else(|| DsmError::NotFound(format!("clone source {snapshot_id}"))),
        }
    }

    fn name_taken(&self, kind: ObjectKind, name: &str) -> bool {
        self.objects
            .values()
            .any(|o| o.kind == kind && o.name == name)
    }

    fn remove_object(&mut self, kind: ObjectKind, id: &str) -> Result<()> {
        let object = match self.objects.get(id) {
            Some(o) if o.kind == kind => o.clone(),
            _ => return Err(DsmError::NotFound(format!("{kind} {id}"))),
        };
        self.objects.remove(id);
        self.release(&object.location, object.size_bytes);
        if !self.capabilities.orphaned_snapshots {
            self.snapshots.retain(|_, s| s.parent_id != id);
        }
        for target in self.targets.values_mut() {
            target.mapped_luns.retain(|lun| lun != id);
        }
        Ok(())
    }
}

/// A fake array held entirely in memory.
pub struct InMemoryArray {
    host: String,
    state: Mutex<State>,
}

impl InMemoryArray {
    /// An array with every capability and one 100 GiB btrfs pool at
    /// `/volume1`.
    pub fn new(host: impl Into<String>) -> Self {
        let state = State {
            pools: vec![StoragePool {
                location: "/volume1".to_string(),
                fs_type: "btrfs".to_string(),
                total_bytes: 100 << 30,
                free_bytes: 100 << 30,
            }],
            capabilities: ArrayCapabilities::all(),
            ..State::default()
        };
        Self {
            host: host.into(),
            state: Mutex::new(state),
        }
    }

    pub async fn set_pools(&self, pools: Vec<StoragePool>) {
        self.state.lock().await.pools = pools;
    }

    pub async fn set_capabilities(&self, capabilities: ArrayCapabilities) {
        self.state.lock().await.capabilities = capabilities;
    }

    /// Delay every create call, widening race windows in concurrency tests.
    pub async fn set_create_delay(&self, delay: Duration) {
        self.state.lock().await.create_delay = Some(delay);
    }

    pub async fn reject_logins(&self, reject: bool) {
        self.state.lock().await.reject_logins = reject;
    }

    /// Fail the next call of `operation` with `error`. Faults queue up.
    pub async fn inject_fault(&self, operation: &str, error: DsmError) {
        self.state
            .lock()
            .await
            .faults
            .entry(operation.to_string())
            .or_default()
            .push_back(error);
    }

    /// Invalidate every session, as a DSM restart would.
    pub async fn expire_sessions(&self) {
        self.state.lock().await.sessions.clear();
    }

    /// Number of times `operation` was called, failed calls included.
    pub async fn calls(&self, operation: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    pub async fn objects(&self) -> Vec<StorageObject> {
        self.state.lock().await.objects.values().cloned().collect()
    }

    pub async fn targets(&self) -> Vec<IscsiTarget> {
        self.state.lock().await.targets.values().cloned().collect()
    }

    pub async fn snapshots(&self) -> Vec<SnapshotInfo> {
        self.state.lock().await.snapshots.values().cloned().collect()
    }

    pub async fn pools(&self) -> Vec<StoragePool> {
        self.state.lock().await.pools.clone()
    }

    /// Count the call, apply any queued fault and validate the session.
    async fn enter(&self, operation: &str, session: Option<&Session>) -> Result<()> {
        let mut state = self.state.lock().await;
        *state.calls.entry(operation.to_string()).or_default() += 1;

        if let Some(err) = state
            .faults
            .get_mut(operation)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }

        if let Some(session) = session
            && !state.sessions.contains(&session.sid)
        {
            return Err(DsmError::Authentication {
                code: SID_NOT_FOUND,
            });
        }
        Ok(())
    }

    async fn create_delay(&self) {
        let delay = self.state.lock().await.create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ArrayClient for InMemoryArray {
    fn host(&self) -> &str {
        &self.host
    }

    async fn login(&self, credentials: &Credentials) -> Result<Session> {
        self.enter("login", None).await?;
        let mut state = self.state.lock().await;
        if state.reject_logins {
            return Err(DsmError::Authentication { code: 400 });
        }
        let sid = state.next_id(&format!("sid-{}", credentials.username));
        state.sessions.insert(sid.clone());
        Ok(Session::new(&self.host, sid))
    }

    async fn logout(&self, session: &Session) -> Result<()> {
        self.enter("logout", Some(session)).await?;
        self.state.lock().await.sessions.remove(&session.sid);
        Ok(())
    }

    async fn capabilities(&self, session: &Session) -> Result<ArrayCapabilities> {
        self.enter("capabilities", Some(session)).await?;
        Ok(self.state.lock().await.capabilities)
    }

    async fn list_pools(&self, session: &Session) -> Result<Vec<StoragePool>> {
        self.enter("list_pools", Some(session)).await?;
        Ok(self.state.lock().await.pools.clone())
    }

    async fn list_objects(&self, session: &Session) -> Result<Vec<StorageObject>> {
        self.enter("list_objects", Some(session)).await?;
        Ok(self.state.lock().await.objects.values().cloned().collect())
    }

    async fn create_lun(&self, session: &Session, spec: &LunSpec) -> Result<String> {
        self.enter("create_lun", Some(session)).await?;
        self.create_delay().await;

        let mut state = self.state.lock().await;
        if state.name_taken(ObjectKind::Lun, &spec.name) {
            return Err(DsmError::AlreadyExists(format!("LUN {}", spec.name)));
        }
        state.check_source(&spec.source)?;
        state.reserve(&spec.location, spec.size_bytes)?;

        let id = state.next_id("lun-uuid");
        state.objects.insert(
            id.clone(),
            StorageObject {
                id: id.clone(),
                name: spec.name.clone(),
                kind: ObjectKind::Lun,
                size_bytes: spec.size_bytes,
                location: spec.location.clone(),
                description: spec.description.clone(),
            },
        );
        Ok(id)
    }

    async fn delete_lun(&self, session: &Session, id: &str) -> Result<()> {
        self.enter("delete_lun", Some(session)).await?;
        self.state.lock().await.remove_object(ObjectKind::Lun, id)
    }

    async fn create_share(&self, session: &Session, spec: &ShareSpec) -> Result<String> {
        self.enter("create_share", Some(session)).await?;
        self.create_delay().await;

        let mut state = self.state.lock().await;
        if state.name_taken(ObjectKind::Share, &spec.name) {
            return Err(DsmError::AlreadyExists(format!("share {}", spec.name)));
        }
        state.check_source(&spec.source)?;
        state.reserve(&spec.location, spec.size_bytes)?;

        state.objects.insert(
            spec.name.clone(),
            StorageObject {
                id: spec.name.clone(),
                name: spec.name.clone(),
                kind: ObjectKind::Share,
                size_bytes: spec.size_bytes,
                location: spec.location.clone(),
                description: spec.description.clone(),
            },
        );
        Ok(spec.name.clone())
    }

    async fn delete_share(&self, session: &Session, id: &str) -> Result<()> {
        self.enter("delete_share", Some(session)).await?;
        self.state.lock().await.remove_object(ObjectKind::Share, id)
    }

    async fn resize(
        &self,
        session: &Session,
        object: &StorageObject,
        new_size: u64,
    ) -> Result<()> {
        self.enter("resize", Some(session)).await?;
        let mut state = self.state.lock().await;
        let current = state
            .objects
            .get(&object.id)
            .map(|o| (o.size_bytes, o.location.clone()))
            .ok_or_else(|| DsmError::NotFound(format!("{} {}", object.kind, object.id)))?;

        let (size, location) = current;
        if new_size < size {
            return Err(DsmError::BadRequest("cannot shrink".to_string()));
        }
        state.reserve(&location, new_size - size)?;
        if let Some(o) = state.objects.get_mut(&object.id) {
            o.size_bytes = new_size;
        }
        Ok(())
    }

    async fn list_iscsi_targets(&self, session: &Session) -> Result<Vec<IscsiTarget>> {
        self.enter("list_iscsi_targets", Some(session)).await?;
        Ok(self.state.lock().await.targets.values().cloned().collect())
    }

    async fn create_iscsi_target(&self, session: &Session, spec: &TargetSpec) -> Result<String> {
        self.enter("create_iscsi_target", Some(session)).await?;
        let mut state = self.state.lock().await;
        if state
            .targets
            .values()
            .any(|t| t.name == spec.name || t.iqn == spec.iqn)
        {
            return Err(DsmError::AlreadyExists(format!("target {}", spec.name)));
        }
        let id = state.next_id("target");
        state.targets.insert(
            id.clone(),
            IscsiTarget {
                id: id.clone(),
                name: spec.name.clone(),
                iqn: spec.iqn.clone(),
                mapped_luns: Vec::new(),
                initiators: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn delete_iscsi_target(&self, session: &Session, target_id: &str) -> Result<()> {
        self.enter("delete_iscsi_target", Some(session)).await?;
        self.state
            .lock()
            .await
            .targets
            .remove(target_id)
            .map(|_| ())
            .ok_or_else(|| DsmError::NotFound(format!("target {target_id}")))
    }

    async fn bind_lun(&self, session: &Session, target_id: &str, lun_id: &str) -> Result<()> {
        self.enter("bind_lun", Some(session)).await?;
        let mut state = self.state.lock().await;
        if !state.objects.contains_key(lun_id) {
            return Err(DsmError::NotFound(format!("LUN {lun_id}")));
        }
        let target = state
            .targets
            .get_mut(target_id)
            .ok_or_else(|| DsmError::NotFound(format!("target {target_id}")))?;
        if !target.mapped_luns.iter().any(|l| l == lun_id) {
            target.mapped_luns.push(lun_id.to_string());
        }
        Ok(())
    }

    async fn set_initiators(
        &self,
        session: &Session,
        target_id: &str,
        initiators: &[String],
    ) -> Result<()> {
        self.enter("set_initiators", Some(session)).await?;
        let mut state = self.state.lock().await;
        let target = state
            .targets
            .get_mut(target_id)
            .ok_or_else(|| DsmError::NotFound(format!("target {target_id}")))?;
        target.initiators = initiators.to_vec();
        Ok(())
    }

    async fn create_snapshot(
        &self,
        session: &Session,
        spec: &SnapshotSpec,
    ) -> Result<SnapshotInfo> {
        self.enter("create_snapshot", Some(session)).await?;
        let mut state = self.state.lock().await;
        let parent = state
            .objects
            .get(&spec.parent_id)
            .cloned()
            .ok_or_else(|| DsmError::NotFound(format!("{} {}", spec.parent_kind, spec.parent_id)))?;
        if state
            .snapshots
            .values()
            .any(|s| s.parent_id == spec.parent_id && s.name == spec.name)
        {
            return Err(DsmError::AlreadyExists(format!("snapshot {}", spec.name)));
        }

        let id = state.next_id("snap-uuid");
        let created_at = 1_700_000_000 + state.next_id as i64;
        let info = SnapshotInfo {
            id: id.clone(),
            name: spec.name.clone(),
            parent_id: parent.id,
            parent_name: parent.name,
            parent_kind: parent.kind,
            size_bytes: parent.size_bytes,
            created_at,
            ready: true,
        };
        state.snapshots.insert(id, info.clone());
        Ok(info)
    }

    async fn delete_snapshot(&self, session: &Session, snapshot: &SnapshotInfo) -> Result<()> {
        self.enter("delete_snapshot", Some(session)).await?;
        self.state
            .lock()
            .await
            .snapshots
            .remove(&snapshot.id)
            .map(|_| ())
            .ok_or_else(|| DsmError::NotFound(format!("snapshot {}", snapshot.id)))
    }

    async fn list_snapshots(&self, session: &Session) -> Result<Vec<SnapshotInfo>> {
        self.enter("list_snapshots", Some(session)).await?;
        Ok(self.state.lock().await.snapshots.values().cloned().collect())
    }
}
