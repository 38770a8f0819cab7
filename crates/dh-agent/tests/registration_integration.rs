//! Registration against a fake control plane
//!
//! Each test serves the node resource from an axum router on an ephemeral
//! port and drives the registration engine against it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

use dh_agent::backoff::RetryPolicy;
use dh_agent::client::{http_client, ControlPlaneClient};
use dh_agent::registration::{
    verify, FileIdentityStore, RegistrationEngine, RegistrationError, VerificationOutcome,
};
use dh_agent::SharedConfig;
use dh_core::config::load_config;
use dh_core::{AgentConfig, AgentPaths, BackoffConfig};

const TOKEN: &str = "secret-token";

/// Behavior and bookkeeping of the fake control plane
#[derive(Default)]
struct FakeControlPlane {
    /// UUIDs the control plane knows about
    known: Mutex<Vec<String>>,
    /// Answer every PATCH with 404
    reject_patches: bool,
    /// POSTs answered with 500 before the first success
    failing_posts: AtomicUsize,
    /// Node state returned by GET
    state: Mutex<String>,
    posts: AtomicUsize,
    patches: AtomicUsize,
    certificates: Mutex<Vec<String>>,
}

impl FakeControlPlane {
    fn record(uuid: &str) -> Value {
        json!({
            "uuid": uuid,
            "external_fqdn": format!("{}.node.example.com", uuid),
            "user_ca_cert": "-----BEGIN CERTIFICATE-----\nCA\n-----END CERTIFICATE-----\n",
            "docker_url": "http://files.example.com/docker.json",
            "ngrok_url": "",
            "public_ip": "203.0.113.7",
        })
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("TutumAgentToken {}", TOKEN))
        .unwrap_or(false)
}

async fn create_node(State(cp): State<Arc<FakeControlPlane>>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let n = cp.posts.fetch_add(1, Ordering::SeqCst);
    if cp.failing_posts.load(Ordering::SeqCst) > n {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let uuid = format!("node-{}", n + 1);
    cp.known.lock().unwrap().push(uuid.clone());
    (StatusCode::CREATED, Json(FakeControlPlane::record(&uuid))).into_response()
}

async fn patch_node(
    State(cp): State<Arc<FakeControlPlane>>,
    Path(uuid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    cp.patches.fetch_add(1, Ordering::SeqCst);
    if cp.reject_patches || !cp.known.lock().unwrap().contains(&uuid) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if let Some(cert) = body["public_cert"].as_str() {
        cp.certificates.lock().unwrap().push(cert.to_string());
    }
    Json(FakeControlPlane::record(&uuid)).into_response()
}

async fn get_node(State(cp): State<Arc<FakeControlPlane>>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let state = cp.state.lock().unwrap().clone();
    Json(json!({ "state": state })).into_response()
}

/// Serve the fake control plane and return its base URL
async fn serve(cp: Arc<FakeControlPlane>) -> String {
    let app = Router::new()
        .route("/api/agent/node/", post(create_node))
        .route("/api/agent/node/:uuid/", get(get_node).patch(patch_node))
        .with_state(cp);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/", addr)
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(BackoffConfig {
        initial: Duration::from_millis(10),
        cap: Duration::from_millis(100),
    })
}

struct Fixture {
    _dir: TempDir,
    paths: AgentPaths,
    config: SharedConfig,
    engine: RegistrationEngine,
}

fn fixture(base_url: &str, config: AgentConfig) -> Fixture {
    let dir = TempDir::new().unwrap();
    let paths = AgentPaths::under(dir.path());
    paths.create_dirs().unwrap();

    let client = ControlPlaneClient::new(http_client().unwrap(), base_url, config.tutum_token.clone());
    let shared = SharedConfig::new(config);
    let store = Arc::new(FileIdentityStore::new(paths.config_file()));
    let engine = RegistrationEngine::new(client, shared.clone(), store, paths.clone(), fast_retry());
    Fixture {
        _dir: dir,
        paths,
        config: shared,
        engine,
    }
}

fn config_with(token: &str, uuid: &str, common_name: &str) -> AgentConfig {
    AgentConfig {
        tutum_token: token.to_string(),
        tutum_uuid: uuid.to_string(),
        cert_common_name: common_name.to_string(),
        ..AgentConfig::default()
    }
}

#[tokio::test]
async fn test_fresh_node_enrolls_and_confirms() {
    let cp = Arc::new(FakeControlPlane::default());
    let base = serve(cp.clone()).await;
    let mut fx = fixture(&base, config_with(TOKEN, "", ""));

    fx.engine.register().await.unwrap();

    let config = fx.config.snapshot();
    assert_eq!(config.tutum_uuid, "node-1");
    assert_eq!(config.cert_common_name, "node-1.node.example.com");

    let saved: AgentConfig = load_config(&fx.paths.config_file()).unwrap();
    assert_eq!(saved.tutum_uuid, "node-1");

    assert!(fx.paths.key_file().exists());
    let cert = std::fs::read_to_string(fx.paths.cert_file()).unwrap();
    assert_eq!(cp.certificates.lock().unwrap().as_slice(), [cert]);
    assert!(std::fs::read_to_string(fx.paths.ca_file())
        .unwrap()
        .contains("CA"));

    let endpoints = fx.engine.endpoints();
    assert_eq!(endpoints.docker_binary_url, "http://files.example.com/docker.json");
    assert_eq!(endpoints.public_ip, "203.0.113.7");
    assert!(endpoints.ngrok_binary_url.is_empty());

    assert_eq!(cp.posts.load(Ordering::SeqCst), 1);
    assert_eq!(cp.patches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_registered_node_only_confirms() {
    let cp = Arc::new(FakeControlPlane::default());
    cp.known.lock().unwrap().push("node-9".into());
    let base = serve(cp.clone()).await;
    let mut fx = fixture(&base, config_with(TOKEN, "node-9", "node-9.node.example.com"));

    fx.engine.register().await.unwrap();

    assert_eq!(fx.config.snapshot().tutum_uuid, "node-9");
    assert_eq!(cp.posts.load(Ordering::SeqCst), 0);
    assert_eq!(cp.patches.load(Ordering::SeqCst), 1);
    // Nothing changed, so the config file was never written
    assert!(!fx.paths.config_file().exists());
}

#[tokio::test]
async fn test_stale_uuid_triggers_one_re_enrollment() {
    let cp = Arc::new(FakeControlPlane::default());
    let base = serve(cp.clone()).await;
    let mut fx = fixture(&base, config_with(TOKEN, "stale", "stale.node.example.com"));

    fx.engine.register().await.unwrap();

    let config = fx.config.snapshot();
    assert_eq!(config.tutum_uuid, "node-1");
    assert_eq!(config.cert_common_name, "node-1.node.example.com");
    assert_eq!(cp.posts.load(Ordering::SeqCst), 1);
    assert_eq!(cp.patches.load(Ordering::SeqCst), 2);

    let saved: AgentConfig = load_config(&fx.paths.config_file()).unwrap();
    assert_eq!(saved.tutum_uuid, "node-1");
}

#[tokio::test]
async fn test_second_rejection_is_fatal() {
    let cp = Arc::new(FakeControlPlane {
        reject_patches: true,
        ..FakeControlPlane::default()
    });
    let base = serve(cp.clone()).await;
    let mut fx = fixture(&base, config_with(TOKEN, "stale", "stale.node.example.com"));

    match fx.engine.register().await {
        Err(RegistrationError::ReEnrollmentFailed { uuid, .. }) => assert_eq!(uuid, "node-1"),
        other => panic!("expected re-enrollment failure, got {:?}", other),
    }
    assert_eq!(cp.posts.load(Ordering::SeqCst), 1);
    assert_eq!(cp.patches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rejected_token_is_fatal() {
    let cp = Arc::new(FakeControlPlane::default());
    let base = serve(cp.clone()).await;
    let mut fx = fixture(&base, config_with("wrong-token", "", ""));

    assert!(matches!(
        fx.engine.register().await,
        Err(RegistrationError::Unauthorized)
    ));
    assert_eq!(cp.posts.load(Ordering::SeqCst), 0);
    assert_eq!(fx.config.snapshot().tutum_uuid, "");
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let cp = Arc::new(FakeControlPlane {
        failing_posts: AtomicUsize::new(2),
        ..FakeControlPlane::default()
    });
    let base = serve(cp.clone()).await;
    let mut fx = fixture(&base, config_with(TOKEN, "", ""));

    fx.engine.register().await.unwrap();

    assert_eq!(cp.posts.load(Ordering::SeqCst), 3);
    assert_eq!(fx.config.snapshot().tutum_uuid, "node-3");
}

#[tokio::test]
async fn test_verification_outcomes() {
    let cp = Arc::new(FakeControlPlane::default());
    *cp.state.lock().unwrap() = "Deployed".into();
    let base = serve(cp.clone()).await;
    let client = ControlPlaneClient::new(http_client().unwrap(), &base, TOKEN);

    assert_eq!(
        verify(&client, "node-1", Duration::from_millis(10)).await,
        VerificationOutcome::Verified
    );

    *cp.state.lock().unwrap() = "Deploying".into();
    assert_eq!(
        verify(&client, "node-1", Duration::from_millis(10)).await,
        VerificationOutcome::TimedOut
    );
}
