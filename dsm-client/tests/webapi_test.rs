//! DsmClient against a mock DSM endpoint.
//!
//! Each test mounts canned `/webapi/entry.cgi` responses on a wiremock server
//! and checks both the decoded result and the form body the client sent.

use std::time::Duration;

use dsm_client::{ArrayClient, Credentials, DsmClient, DsmError, LunSpec, LunType, Session};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ENTRY: &str = "/webapi/entry.cgi";

fn client_for(server: &MockServer) -> DsmClient {
    let addr = server.address();
    DsmClient::new(
        &addr.ip().to_string(),
        addr.port(),
        false,
        Duration::from_secs(5),
        true,
    )
    .unwrap()
}

fn session_for(server: &MockServer) -> Session {
    Session::new(server.address().ip().to_string(), "sid-1")
}

/// Form bodies of every request the server received.
async fn bodies(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|request| String::from_utf8_lossy(&request.body).into_owned())
        .collect()
}

#[tokio::test]
async fn test_login_returns_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENTRY))
        .and(body_string_contains("method=login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": { "sid": "sid-1" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let session = client
        .login(&Credentials::new("admin", "s3cret"))
        .await
        .unwrap();
    assert_eq!(session.sid, "sid-1");

    let sent = bodies(&server).await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("api=SYNO.API.Auth"));
    assert!(sent[0].contains("account=admin"));
    assert!(sent[0].contains("passwd=s3cret"));
    assert!(sent[0].contains("format=sid"));
    // No session exists yet
    assert!(!sent[0].contains("_sid="));
}

#[tokio::test]
async fn test_logout_carries_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENTRY))
        .and(body_string_contains("method=logout"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.logout(&session_for(&server)).await.unwrap();

    let sent = bodies(&server).await;
    assert!(sent[0].contains("api=SYNO.API.Auth"));
    assert!(sent[0].contains("_sid=sid-1"));
}

#[tokio::test]
async fn test_create_lun() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENTRY))
        .and(body_string_contains("method=create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": { "uuid": "5c1f3a2e-0001" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let spec = LunSpec {
        name: "k8s-csi-pvc-1".to_string(),
        location: "/volume1".to_string(),
        size_bytes: 1 << 30,
        lun_type: LunType::Blun,
        description: "default/data".to_string(),
        source: None,
    };
    let uuid = client
        .create_lun(&session_for(&server), &spec)
        .await
        .unwrap();
    assert_eq!(uuid, "5c1f3a2e-0001");

    let sent = bodies(&server).await;
    assert!(sent[0].contains("api=SYNO.Core.ISCSI.LUN"));
    assert!(sent[0].contains("_sid=sid-1"));
    // String parameters travel JSON-quoted
    assert!(sent[0].contains("name=%22k8s-csi-pvc-1%22"));
    assert!(sent[0].contains("location=%22%2Fvolume1%22"));
    assert!(sent[0].contains("size=1073741824"));
    assert!(sent[0].contains("type=%22BLUN%22"));
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENTRY))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.list_pools(&session_for(&server)).await.unwrap_err();
    assert!(matches!(err, DsmError::Transient(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_client_error_is_bad_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENTRY))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.list_pools(&session_for(&server)).await.unwrap_err();
    assert!(matches!(err, DsmError::BadRequest(_)));
}

#[tokio::test]
async fn test_expired_session_is_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENTRY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "error": { "code": 119 }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.list_pools(&session_for(&server)).await.unwrap_err();
    assert_eq!(err, DsmError::Authentication { code: 119 });
    assert!(err.is_auth());
}

#[tokio::test]
async fn test_wrong_password_is_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENTRY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "error": { "code": 400 }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .login(&Credentials::new("admin", "wrong"))
        .await
        .unwrap_err();
    assert_eq!(err, DsmError::Authentication { code: 400 });
}

#[tokio::test]
async fn test_lun_exists_maps_to_already_exists() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENTRY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "error": { "code": 18990538 }
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let spec = LunSpec {
        name: "k8s-csi-pvc-1".to_string(),
        location: "/volume1".to_string(),
        size_bytes: 1 << 30,
        lun_type: LunType::Thin,
        description: String::new(),
        source: None,
    };
    let err = client
        .create_lun(&session_for(&server), &spec)
        .await
        .unwrap_err();
    assert!(matches!(err, DsmError::AlreadyExists(_)));
}
