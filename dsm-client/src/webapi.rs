//! DSM WebAPI client
//!
//! Every call is a form-encoded POST to `/webapi/entry.cgi` carrying
//! `api`, `version`, `method`, the method parameters and the session id
//! (`_sid`). Responses share one envelope:
//!
//! ```json
//! { "success": true, "data": { ... } }
//! { "success": false, "error": { "code": 18990538 } }
//! ```
//!
//! The envelope is decoded into typed payloads here and error codes are
//! folded into [`DsmError`]. String parameters of the `SYNO.Core.*` APIs are
//! JSON-encoded (`name="pvc-1"`), numbers and booleans are sent bare.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use url::Url;

use crate::client::ArrayClient;
use crate::error::{DsmError, Result};
use crate::types::{
    ArrayCapabilities, Credentials, IscsiTarget, LunSpec, ObjectKind, Session, ShareSpec,
    SnapshotInfo, SnapshotSpec, StorageObject, StoragePool, TargetSpec,
};

/// Path of the single WebAPI entry point.
const ENTRY_PATH: &str = "/webapi/entry.cgi";

pub(crate) const API_AUTH: &str = "SYNO.API.Auth";
pub(crate) const API_INFO: &str = "SYNO.API.Info";
pub(crate) const API_VOLUME: &str = "SYNO.Core.Storage.Volume";
pub(crate) const API_LUN: &str = "SYNO.Core.ISCSI.LUN";
pub(crate) const API_TARGET: &str = "SYNO.Core.ISCSI.Target";
pub(crate) const API_SHARE: &str = "SYNO.Core.Share";
pub(crate) const API_SHARE_SNAPSHOT: &str = "SYNO.Core.Share.Snapshot";
pub(crate) const API_SMB: &str = "SYNO.Core.FileServ.SMB";
pub(crate) const API_NFS: &str = "SYNO.Core.FileServ.NFS";
pub(crate) const API_NFS_PRIVILEGE: &str = "SYNO.Core.FileServ.NFS.SharePrivilege";

/// Session name used for logins made by the driver.
const SESSION_NAME: &str = "webui";

/// Common WebAPI error codes.
mod codes {
    pub const NO_PERMISSION: i64 = 105;
    pub const SESSION_TIMEOUT: i64 = 106;
    pub const SESSION_INTERRUPTED: i64 = 107;
    pub const SID_NOT_FOUND: i64 = 119;

    pub const UNKNOWN_ERROR: i64 = 100;
    pub const INVALID_PARAMETER: i64 = 101;
    pub const API_NOT_FOUND: i64 = 102;
    pub const METHOD_NOT_FOUND: i64 = 103;
    pub const VERSION_NOT_SUPPORTED: i64 = 104;
    pub const PARAMETER_INVALID: i64 = 120;

    pub const AUTH_FIRST: i64 = 400;
    pub const AUTH_LAST: i64 = 410;

    pub const ISCSI_NO_SPACE: i64 = 18990002;
    pub const ISCSI_LUN_NOT_FOUND: i64 = 18990505;
    pub const ISCSI_TARGET_NOT_FOUND: i64 = 18990532;
    pub const ISCSI_LUN_EXISTS: i64 = 18990538;
    pub const ISCSI_LUN_LIMIT: i64 = 18990541;
    pub const ISCSI_TARGET_LIMIT: i64 = 18990542;
    pub const ISCSI_SNAPSHOT_LIMIT: i64 = 18990543;
    pub const ISCSI_TARGET_EXISTS: i64 = 18990744;
}

/// Map a WebAPI error code into the client error taxonomy.
pub(crate) fn map_error_code(api: &str, method: &str, code: i64) -> DsmError {
    let what = format!("{api}.{method}");
    match code {
        codes::NO_PERMISSION
        | codes::SESSION_TIMEOUT
        | codes::SESSION_INTERRUPTED
        | codes::SID_NOT_FOUND => DsmError::Authentication { code },
        codes::AUTH_FIRST..=codes::AUTH_LAST if api == API_AUTH => {
            DsmError::Authentication { code }
        }
        codes::ISCSI_NO_SPACE => DsmError::OutOfSpace(what),
        codes::ISCSI_LUN_EXISTS | codes::ISCSI_TARGET_EXISTS => DsmError::AlreadyExists(what),
        codes::ISCSI_LUN_LIMIT | codes::ISCSI_TARGET_LIMIT | codes::ISCSI_SNAPSHOT_LIMIT => {
            DsmError::LimitReached(what)
        }
        codes::ISCSI_LUN_NOT_FOUND | codes::ISCSI_TARGET_NOT_FOUND => DsmError::NotFound(what),
        codes::INVALID_PARAMETER
        | codes::API_NOT_FOUND
        | codes::METHOD_NOT_FOUND
        | codes::VERSION_NOT_SUPPORTED
        | codes::PARAMETER_INVALID => DsmError::BadRequest(format!("{what} (code {code})")),
        // 100 is what DSM returns while a service restarts
        codes::UNKNOWN_ERROR => DsmError::Transient(format!("{what} returned code {code}")),
        _ => DsmError::Api {
            api: api.to_string(),
            method: method.to_string(),
            code,
        },
    }
}

/// JSON-encode a string parameter the way `SYNO.Core.*` APIs expect it.
pub(crate) fn quote(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

// ============================================================================
// Envelope and lenient decoding helpers
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<EnvelopeError>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeError {
    code: i64,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct VolumeList {
    #[serde(default)]
    volumes: Vec<VolumeEntry>,
}

#[derive(Debug, Deserialize)]
struct VolumeEntry {
    volume_path: String,
    #[serde(default)]
    fs_type: String,
    #[serde(default, deserialize_with = "lenient_u64")]
    size_free_byte: u64,
    #[serde(default, deserialize_with = "lenient_u64")]
    size_total_byte: u64,
}

/// DSM reports sizes either as numbers or as decimal strings.
pub(crate) fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        Float(f64),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::Float(f) if f >= 0.0 => Ok(f as u64),
        NumberOrString::Float(f) => Err(serde::de::Error::custom(format!(
            "negative size {f}"
        ))),
        NumberOrString::String(s) if s.is_empty() => Ok(0),
        NumberOrString::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

// ============================================================================
// Client
// ============================================================================

/// HTTP(S) client for one DSM array.
///
/// The client holds no session state. Callers pass the session to use on
/// every call, so one `DsmClient` can be shared freely between tasks.
#[derive(Debug, Clone)]
pub struct DsmClient {
    host: String,
    entry_url: Url,
    http: reqwest::Client,
    debug: bool,
}

impl DsmClient {
    /// Build a client for `host:port`.
    ///
    /// `timeout` bounds every request end to end. With `debug` set, a summary
    /// of each request and response is logged at debug level. Parameter
    /// values are never logged.
    pub fn new(host: &str, port: u16, https: bool, timeout: Duration, debug: bool) -> Result<Self> {
        let scheme = if https { "https" } else { "http" };
        let entry_url = Url::parse(&format!("{scheme}://{host}:{port}{ENTRY_PATH}"))
            .map_err(|e| DsmError::BadRequest(format!("invalid array address {host}: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            // Arrays ship with self-signed certificates
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| DsmError::BadRequest(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            host: host.to_string(),
            entry_url,
            http,
            debug,
        })
    }

    /// Issue one WebAPI call and decode its `data` payload.
    pub(crate) async fn request<T: DeserializeOwned>(
        &self,
        session: Option<&Session>,
        api: &str,
        version: u32,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let envelope: Envelope<T> = self.send(session, api, version, method, params).await?;
        envelope
            .data
            .ok_or_else(|| DsmError::Decode(format!("{api}.{method} returned no data")))
    }

    /// Issue one WebAPI call whose payload is irrelevant.
    pub(crate) async fn request_unit(
        &self,
        session: Option<&Session>,
        api: &str,
        version: u32,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<()> {
        let _: Envelope<serde::de::IgnoredAny> =
            self.send(session, api, version, method, params).await?;
        Ok(())
    }

    async fn send<T: DeserializeOwned>(
        &self,
        session: Option<&Session>,
        api: &str,
        version: u32,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<Envelope<T>> {
        let body = {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            form.append_pair("api", api)
                .append_pair("version", &version.to_string())
                .append_pair("method", method);
            for (key, value) in params {
                form.append_pair(key, value);
            }
            if let Some(session) = session {
                form.append_pair("_sid", &session.sid);
            }
            form.finish()
        };

        if self.debug {
            let keys: Vec<&str> = params.iter().map(|(k, _)| *k).collect();
            debug!(host = %self.host, api, method, version, params = ?keys, "DSM request");
        }

        let response = self
            .http
            .post(self.entry_url.clone())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(DsmError::Transient(format!(
                "{api}.{method} returned HTTP {status}"
            )));
        }
        if !status.is_success() {
            return Err(DsmError::BadRequest(format!(
                "{api}.{method} returned HTTP {status}"
            )));
        }

        let text = response.text().await?;
        let envelope: Envelope<T> = serde_json::from_str(&text)
            .map_err(|e| DsmError::Decode(format!("{api}.{method}: {e}")))?;

        if self.debug {
            debug!(
                host = %self.host,
                api,
                method,
                success = envelope.success,
                code = envelope.error.as_ref().map(|e| e.code),
                "DSM response"
            );
        }

        if envelope.success {
            Ok(envelope)
        } else {
            let code = envelope.error.as_ref().map_or(codes::UNKNOWN_ERROR, |e| e.code);
            Err(map_error_code(api, method, code))
        }
    }
}

#[async_trait]
impl ArrayClient for DsmClient {
    fn host(&self) -> &str {
        &self.host
    }

    async fn login(&self, credentials: &Credentials) -> Result<Session> {
        let params = [
            ("account", credentials.username.clone()),
            ("passwd", credentials.password.expose_secret().to_string()),
            ("session", SESSION_NAME.to_string()),
            ("format", "sid".to_string()),
        ];
        let data: LoginData = self.request(None, API_AUTH, 3, "login", &params).await?;
        info!(host = %self.host, user = %credentials.username, "Logged in to DSM");
        Ok(Session::new(&self.host, data.sid))
    }

    async fn logout(&self, session: &Session) -> Result<()> {
        let params = [("session", SESSION_NAME.to_string())];
        self.request_unit(Some(session), API_AUTH, 3, "logout", &params)
            .await?;
        info!(host = %self.host, "Logged out of DSM");
        Ok(())
    }

    async fn capabilities(&self, session: &Session) -> Result<ArrayCapabilities> {
        let params = [("query", "ALL".to_string())];
        let apis: HashMap<String, serde_json::Value> = self
            .request(Some(session), API_INFO, 1, "query", &params)
            .await?;

        let caps = ArrayCapabilities {
            iscsi: apis.contains_key(API_LUN),
            smb: apis.contains_key(API_SMB),
            nfs: apis.contains_key(API_NFS),
            snapshot: apis.contains_key(API_SHARE_SNAPSHOT),
            // Deleting a LUN or share on DSM destroys its snapshots
            orphaned_snapshots: false,
        };
        debug!(host = %self.host, ?caps, "Discovered array capabilities");
        Ok(caps)
    }

    async fn list_pools(&self, session: &Session) -> Result<Vec<StoragePool>> {
        let params = [
            ("offset", "0".to_string()),
            ("limit", "-1".to_string()),
            ("location", quote("internal")),
        ];
        let list: VolumeList = self
            .request(Some(session), API_VOLUME, 1, "list", &params)
            .await?;

        Ok(list
            .volumes
            .into_iter()
            .map(|v| StoragePool {
                location: v.volume_path,
                fs_type: v.fs_type,
                total_bytes: v.size_total_byte,
                free_bytes: v.size_free_byte,
            })
            .collect())
    }

    async fn list_objects(&self, session: &Session) -> Result<Vec<StorageObject>> {
        let mut objects = self.list_luns(session).await?;
        objects.extend(self.list_shares(session).await?);
        Ok(objects)
    }

    async fn create_lun(&self, session: &Session, spec: &LunSpec) -> Result<String> {
        match &spec.source {
            None => self.create_empty_lun(session, spec).await,
            Some(source) => self.clone_lun(session, spec, source).await,
        }
    }

    async fn delete_lun(&self, session: &Session, id: &str) -> Result<()> {
        let params = [("uuid", quote(id))];
        self.request_unit(Some(session), API_LUN, 1, "delete", &params)
            .await
    }

    async fn create_share(&self, session: &Session, spec: &ShareSpec) -> Result<String> {
        match &spec.source {
            None => self.create_empty_share(session, spec).await?,
            Some(source) => self.clone_share(session, spec, source).await?,
        }
        if spec.nfs {
            self.allow_nfs_clients(session, &spec.name).await?;
        }
        Ok(spec.name.clone())
    }

    async fn delete_share(&self, session: &Session, id: &str) -> Result<()> {
        let names = serde_json::json!([id]).to_string();
        self.request_unit(Some(session), API_SHARE, 1, "delete", &[("name", names)])
            .await
    }

    async fn resize(
        &self,
        session: &Session,
        object: &StorageObject,
        new_size: u64,
    ) -> Result<()> {
        match object.kind {
            ObjectKind::Lun => self.resize_lun(session, &object.id, new_size).await,
            ObjectKind::Share => self.resize_share(session, object, new_size).await,
        }
    }

    async fn list_iscsi_targets(&self, session: &Session) -> Result<Vec<IscsiTarget>> {
        self.list_targets(session).await
    }

    async fn create_iscsi_target(&self, session: &Session, spec: &TargetSpec) -> Result<String> {
        self.create_target(session, spec).await
    }

    async fn delete_iscsi_target(&self, session: &Session, target_id: &str) -> Result<()> {
        let params = [("target_id", quote(target_id))];
        self.request_unit(Some(session), API_TARGET, 1, "delete", &params)
            .await
    }

    async fn bind_lun(&self, session: &Session, target_id: &str, lun_id: &str) -> Result<()> {
        self.map_lun(session, target_id, lun_id).await
    }

    async fn set_initiators(
        &self,
        session: &Session,
        target_id: &str,
        initiators: &[String],
    ) -> Result<()> {
        self.set_target_acls(session, target_id, initiators).await
    }

    async fn create_snapshot(
        &self,
        session: &Session,
        spec: &SnapshotSpec,
    ) -> Result<SnapshotInfo> {
        match spec.parent_kind {
            ObjectKind::Lun => self.take_lun_snapshot(session, spec).await,
            ObjectKind::Share => self.take_share_snapshot(session, spec).await,
        }
    }

    async fn delete_snapshot(&self, session: &Session, snapshot: &SnapshotInfo) -> Result<()> {
        match snapshot.parent_kind {
            ObjectKind::Lun => self.delete_lun_snapshot(session, &snapshot.id).await,
            ObjectKind::Share => {
                self.delete_share_snapshot(session, &snapshot.parent_name, &snapshot.id)
                    .await
            }
        }
    }

    async fn list_snapshots(&self, session: &Session) -> Result<Vec<SnapshotInfo>> {
        let mut snapshots = Vec::new();
        for object in self.list_objects(session).await? {
            let found = match object.kind {
                ObjectKind::Lun => self.list_lun_snapshots(session, &object).await,
                ObjectKind::Share => self.list_share_snapshots(session, &object).await,
            };
            match found {
                Ok(found) => snapshots.extend(found),
                // The object vanished between the two listings
                Err(e) if e.is_not_found() => {
                    warn!(host = %self.host, object = %object.name, "Object disappeared while listing snapshots");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_error_code_auth() {
        assert!(map_error_code(API_LUN, "list", 119).is_auth());
        assert!(map_error_code(API_LUN, "list", 106).is_auth());
        assert!(map_error_code(API_AUTH, "login", 400).is_auth());
        // 400-410 only mean bad credentials on the auth API
        assert!(!map_error_code(API_LUN, "list", 402).is_auth());
    }

    #[test]
    fn test_map_error_code_iscsi() {
        assert!(matches!(
            map_error_code(API_LUN, "create", 18990538),
            DsmError::AlreadyExists(_)
        ));
        assert!(matches!(
            map_error_code(API_LUN, "create", 18990002),
            DsmError::OutOfSpace(_)
        ));
        assert!(matches!(
            map_error_code(API_TARGET, "create", 18990542),
            DsmError::LimitReached(_)
        ));
        assert!(map_error_code(API_LUN, "delete", 18990505).is_not_found());
        assert_eq!(
            map_error_code(API_LUN, "create", 18990999),
            DsmError::Api {
                api: API_LUN.to_string(),
                method: "create".to_string(),
                code: 18990999
            }
        );
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("pvc-1"), "\"pvc-1\"");
        assert_eq!(quote("a\"b"), "\"a\\\"b\"");
    }

    #[test]
    fn test_envelope_decoding() {
        let ok: Envelope<LoginData> =
            serde_json::from_str(r#"{"success":true,"data":{"sid":"abc"}}"#).unwrap();
        assert!(ok.success);
        assert_eq!(ok.data.unwrap().sid, "abc");

        let err: Envelope<LoginData> =
            serde_json::from_str(r#"{"success":false,"error":{"code":119}}"#).unwrap();
        assert!(!err.success);
        assert_eq!(err.error.unwrap().code, 119);
    }

    #[test]
    fn test_volume_sizes_are_lenient() {
        let list: VolumeList = serde_json::from_str(
            r#"{"volumes":[
                {"volume_path":"/volume1","fs_type":"btrfs","size_free_byte":"1073741824","size_total_byte":2147483648},
                {"volume_path":"/volume2","size_free_byte":""}
            ]}"#,
        )
        .unwrap();
        assert_eq!(list.volumes[0].size_free_byte, 1 << 30);
        assert_eq!(list.volumes[0].size_total_byte, 2 << 30);
        assert_eq!(list.volumes[1].size_free_byte, 0);
        assert_eq!(list.volumes[1].fs_type, "");
    }

    #[test]
    fn test_new_builds_entry_url() {
        let client = DsmClient::new("10.0.0.5", 5001, true, Duration::from_secs(5), false).unwrap();
        assert_eq!(client.host(), "10.0.0.5");
        assert_eq!(
            client.entry_url.as_str(),
            "https://10.0.0.5:5001/webapi/entry.cgi"
        );
    }
}
