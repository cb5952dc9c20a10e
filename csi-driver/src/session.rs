//! Array Session Manager
//!
//! Owns one authenticated session per configured array. Sessions are
//! established lazily on first use and refreshed only when a call fails with
//! an authentication error; there is no keep-alive timer. Logins are
//! serialized per array, while ordinary calls share the current session and
//! run concurrently.
//!
//! Callers obtain an [`ArrayHandle`] through [`ArraySessionManager::acquire`]
//! and route every array call through [`ArrayHandle::call`], which applies
//! the retry policy:
//! - transient errors are retried with exponential backoff and jitter
//! - an authentication error triggers exactly one re-login, then one retry
//! - anything else is surfaced unchanged

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dsm_client::{ArrayCapabilities, ArrayClient, DsmClient, DsmError, Session};
use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{ArrayConfig, Timeouts};
use crate::error::{DriverError, DriverResult};
use crate::metrics;

/// Maximum number of retry attempts for transient failures
const MAX_RETRIES: u32 = 3;
/// Initial backoff delay in milliseconds
const INITIAL_BACKOFF_MS: u64 = 100;
/// Maximum backoff delay in milliseconds
const MAX_BACKOFF_MS: u64 = 5000;
/// Backoff multiplier (exponential factor)
const BACKOFF_MULTIPLIER: u64 = 2;

/// Backoff schedule for transient array errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            multiplier: BACKOFF_MULTIPLIER,
        }
    }
}

/// Execute an array call with exponential backoff retry.
///
/// Only transient errors are retried; everything else returns immediately.
async fn with_retry<T, F, Fut>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, DsmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DsmError>>,
{
    let mut attempt = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                attempt += 1;

                if !err.is_transient() || attempt > policy.max_retries {
                    if attempt > 1 {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %err,
                            "Array call failed after retries"
                        );
                    }
                    return Err(err);
                }

                let jitter_ms = rand::rng().random_range(0..=backoff.as_millis() as u64 / 4);
                let delay = backoff + Duration::from_millis(jitter_ms);
                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_retries = policy.max_retries,
                    error = %err,
                    backoff_ms = delay.as_millis() as u64,
                    "Transient array error, backing off"
                );

                metrics::record_retry(operation_name);

                tokio::time::sleep(delay).await;

                backoff = (backoff * policy.multiplier as u32).min(policy.max_backoff);
            }
        }
    }
}

#[derive(Debug, Default)]
struct ArrayState {
    session: Option<Session>,
    capabilities: ArrayCapabilities,
}

/// One configured array and its session.
struct ManagedArray {
    config: ArrayConfig,
    client: Arc<dyn ArrayClient>,
    state: RwLock<ArrayState>,
    /// Serializes logins so concurrent callers never race for a session.
    login_lock: Mutex<()>,
    retry: RetryPolicy,
}

impl ManagedArray {
    fn host(&self) -> &str {
        &self.config.host
    }

    async fn current(&self) -> Option<(Session, ArrayCapabilities)> {
        let state = self.state.read().await;
        state
            .session
            .as_ref()
            .map(|session| (session.clone(), state.capabilities))
    }

    /// Return the live session, logging in if there is none.
    async fn ensure_session(&self) -> DriverResult<(Session, ArrayCapabilities)> {
        if let Some(current) = self.current().await {
            return Ok(current);
        }

        let _login = self.login_lock.lock().await;
        // Another task may have logged in while we waited
        if let Some(current) = self.current().await {
            return Ok(current);
        }
        self.login().await
    }

    /// Replace `stale` with a fresh session, unless another task already did.
    async fn relogin(&self, stale: &Session) -> DriverResult<Session> {
        let _login = self.login_lock.lock().await;
        if let Some((session, _)) = self.current().await
            && session.sid != stale.sid
        {
            debug!(host = %self.host(), "Session already refreshed by another caller");
            return Ok(session);
        }

        {
            let mut state = self.state.write().await;
            state.session = None;
        }
        metrics::set_session_up(self.host(), false);
        self.login().await.map(|(session, _)| session)
    }

    /// Log in and discover capabilities. Caller holds `login_lock`.
    async fn login(&self) -> DriverResult<(Session, ArrayCapabilities)> {
        let credentials = &self.config.credentials;
        let result = with_retry("login", &self.retry, || self.client.login(credentials)).await;

        let session = match result {
            Ok(session) => {
                metrics::record_login(self.host(), true);
                session
            }
            Err(e) => {
                metrics::record_login(self.host(), false);
                warn!(host = %self.host(), error = %e, "Array login failed");
                return Err(e.into());
            }
        };

        let capabilities = match self.client.capabilities(&session).await {
            Ok(caps) => caps,
            Err(e) => {
                warn!(
                    host = %self.host(),
                    error = %e,
                    "Capability discovery failed, assuming iSCSI only"
                );
                ArrayCapabilities::iscsi_only()
            }
        };

        let mut state = self.state.write().await;
        state.session = Some(session.clone());
        state.capabilities = capabilities;
        metrics::set_session_up(self.host(), true);
        info!(host = %self.host(), ?capabilities, "Array session established");

        Ok((session, capabilities))
    }

    async fn logout(&self) -> DriverResult<()> {
        let _login = self.login_lock.lock().await;
        let session = self.state.write().await.session.take();
        metrics::set_session_up(self.host(), false);

        match session {
            Some(session) => self.client.logout(&session).await.map_err(Into::into),
            None => Ok(()),
        }
    }
}

/// Explicit handle to one array's session, passed to every array call.
#[derive(Clone)]
pub struct ArrayHandle {
    array: Arc<ManagedArray>,
    session: Session,
    capabilities: ArrayCapabilities,
}

impl std::fmt::Debug for ArrayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayHandle")
            .field("host", &self.host())
            .field("session", &self.session)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl ArrayHandle {
    pub fn host(&self) -> &str {
        self.array.host()
    }

    /// Session the handle was acquired with. Calls always use the array's
    /// current session, which may be newer after a re-login.
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn capabilities(&self) -> ArrayCapabilities {
        self.capabilities
    }

    /// iSCSI portal hosts of the array.
    pub fn portal_hosts(&self) -> Vec<String> {
        self.array.config.portal_hosts()
    }

    /// Run one array call under the retry and re-login policy.
    ///
    /// The closure receives the client and the session to use; it may be
    /// invoked several times.
    pub async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> DriverResult<T>
    where
        F: Fn(Arc<dyn ArrayClient>, Session) -> Fut,
        Fut: Future<Output = Result<T, DsmError>>,
    {
        let (mut session, _) = self.array.ensure_session().await?;
        let mut relogged = false;

        loop {
            let client = &self.array.client;
            let attempt = with_retry(operation, &self.array.retry, || {
                f(Arc::clone(client), session.clone())
            })
            .await;

            match attempt {
                Ok(value) => return Ok(value),
                Err(err) if err.is_auth() && !relogged => {
                    relogged = true;
                    warn!(
                        host = %self.host(),
                        operation,
                        error = %err,
                        "Session rejected, logging in again"
                    );
                    session = self.array.relogin(&session).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Owns the sessions of every configured array.
pub struct ArraySessionManager {
    arrays: BTreeMap<String, Arc<ManagedArray>>,
}

impl std::fmt::Debug for ArraySessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArraySessionManager")
            .field("hosts", &self.arrays.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ArraySessionManager {
    /// Build a manager, creating one client per array with `client_factory`.
    pub fn new<F>(arrays: Vec<ArrayConfig>, client_factory: F, retry: RetryPolicy) -> DriverResult<Self>
    where
        F: Fn(&ArrayConfig) -> DriverResult<Arc<dyn ArrayClient>>,
    {
        let mut managed = BTreeMap::new();
        for config in arrays {
            let client = client_factory(&config)?;
            let host = config.host.clone();
            managed.insert(
                host,
                Arc::new(ManagedArray {
                    config,
                    client,
                    state: RwLock::new(ArrayState::default()),
                    login_lock: Mutex::new(()),
                    retry,
                }),
            );
        }
        Ok(Self { arrays: managed })
    }

    /// Build a manager talking to real arrays over the DSM WebAPI.
    pub fn with_dsm_clients(
        arrays: Vec<ArrayConfig>,
        timeouts: &Timeouts,
        debug: bool,
    ) -> DriverResult<Self> {
        let api_timeout = timeouts.api;
        Self::new(
            arrays,
            |config| {
                let client = DsmClient::new(&config.host, config.port, config.https, api_timeout, debug)?;
                Ok(Arc::new(client) as Arc<dyn ArrayClient>)
            },
            RetryPolicy::default(),
        )
    }

    /// Configured array hosts, in ascending order.
    pub fn hosts(&self) -> Vec<String> {
        self.arrays.keys().cloned().collect()
    }

    /// Handle to `host`, logging in first if needed.
    pub async fn acquire(&self, host: &str) -> DriverResult<ArrayHandle> {
        let array = self
            .arrays
            .get(host)
            .ok_or_else(|| DriverError::NotFound(format!("array {host}")))?;
        let (session, capabilities) = array.ensure_session().await?;
        Ok(ArrayHandle {
            array: Arc::clone(array),
            session,
            capabilities,
        })
    }

    /// Handles to every array that can be reached, in host order. Arrays
    /// that fail to log in are skipped with a warning.
    pub async fn acquire_all(&self) -> Vec<ArrayHandle> {
        let mut handles = Vec::with_capacity(self.arrays.len());
        for host in self.arrays.keys() {
            match self.acquire(host).await {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!(host = %host, error = %e, "Skipping unreachable array"),
            }
        }
        handles
    }

    /// Log in to every array up front. Failures are logged, not fatal.
    pub async fn login_all(&self) -> usize {
        self.acquire_all().await.len()
    }

    /// Log out of every array. Per-array failures are logged and skipped.
    pub async fn release_all(&self) {
        for (host, array) in &self.arrays {
            match array.logout().await {
                Ok(()) => info!(host = %host, "Released array session"),
                Err(e) => warn!(host = %host, error = %e, "Failed to log out of array"),
            }
        }
    }
}
