//! Tunnel endpoint discovery and reporting
//!
//! The manager tests stand in for the tunnel binary with small shell
//! scripts and for the daemon with a local listener.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use dh_agent::backoff::RetryPolicy;
use dh_agent::client::ControlPlaneClient;
use dh_agent::tunnel::{render_service_config, run_reporter, TunnelConfig, TunnelEvent, TunnelManager};
use dh_agent::SharedConfig;
use dh_core::{AgentConfig, BackoffConfig};

#[derive(Default)]
struct Recorder {
    patches: Mutex<Vec<(String, Value)>>,
    lookups: AtomicUsize,
}

type Patches = Arc<Recorder>;

async fn record_patch(
    State(recorder): State<Patches>,
    Path(uuid): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    recorder.patches.lock().unwrap().push((uuid, body));
    StatusCode::OK
}

async fn node_status(State(recorder): State<Patches>) -> Json<Value> {
    recorder.lookups.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "state": "Deployed", "ngrok_server_addr": "tunnel.example.com:4443" }))
}

async fn serve() -> (String, Patches) {
    let patches = Patches::default();
    let app = Router::new()
        .route("/api/agent/node/:uuid/", get(node_status).patch(record_patch))
        .with_state(patches.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/", addr), patches)
}

fn reporter_parts(base: &str) -> (ControlPlaneClient, SharedConfig, RetryPolicy) {
    let client = ControlPlaneClient::new(reqwest::Client::new(), base, "token");
    let config = SharedConfig::new(AgentConfig {
        tutum_uuid: "node-1".into(),
        ..AgentConfig::default()
    });
    let retry = RetryPolicy::new(BackoffConfig {
        initial: Duration::from_millis(10),
        cap: Duration::from_millis(100),
    });
    (client, config, retry)
}

fn reported(patches: &Patches) -> Vec<String> {
    patches
        .patches
        .lock()
        .unwrap()
        .iter()
        .map(|(_, body)| body["tunnel"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_endpoint_is_patched_once_per_session() {
    let (base, patches) = serve().await;
    let (client, config, retry) = reporter_parts(&base);
    let (tx, rx) = mpsc::channel(16);
    let reporter = tokio::spawn(run_reporter(rx, client, config, retry));

    let marker = "[client] Tunnel established at tcp://ngrok.example.com:41234";
    for event in [
        TunnelEvent::Started { pid: 10 },
        TunnelEvent::Line("[client] Session started".into()),
        TunnelEvent::Line(marker.into()),
        TunnelEvent::Line(marker.into()),
        TunnelEvent::Started { pid: 11 },
        TunnelEvent::Line(marker.into()),
        TunnelEvent::Line("[client] Tunnel established at tcp://ngrok.example.com:50000".into()),
    ] {
        tx.send(event).await.unwrap();
    }
    drop(tx);
    reporter.await.unwrap();

    assert_eq!(
        reported(&patches),
        ["tcp://ngrok.example.com:41234", "tcp://ngrok.example.com:41234"]
    );
    let patches = patches.patches.lock().unwrap();
    assert_eq!(patches[0].0, "node-1");
    assert!(patches[0].1["agent_version"].is_string());
}

#[tokio::test]
async fn test_restarted_tunnel_reports_new_endpoint() {
    let (base, patches) = serve().await;
    let (client, config, retry) = reporter_parts(&base);
    let (tx, rx) = mpsc::channel(16);
    let reporter = tokio::spawn(run_reporter(rx, client, config, retry));

    for event in [
        TunnelEvent::Started { pid: 10 },
        TunnelEvent::Line("Tunnel established at tcp://a.example.com:1".into()),
        TunnelEvent::Started { pid: 11 },
        TunnelEvent::Line("Tunnel established at tcp://b.example.com:2".into()),
        TunnelEvent::Started { pid: 12 },
        TunnelEvent::Line("Tunnel established at tcp://a.example.com:1".into()),
    ] {
        tx.send(event).await.unwrap();
    }
    drop(tx);
    reporter.await.unwrap();

    assert_eq!(
        reported(&patches),
        ["tcp://a.example.com:1", "tcp://b.example.com:2", "tcp://a.example.com:1"]
    );
}

/// Files of one tunnel manager run
struct TunnelFixture {
    dir: TempDir,
    tunnel: TunnelConfig,
    /// One line per start of the tunnel script
    runs: PathBuf,
    /// Holds the daemon port open
    _daemon: TcpListener,
}

/// Stand-in tunnel binary
///
/// Every start records its arguments, announces an endpoint numbered after
/// the start count and exits.
fn tunnel_script(path: &FsPath, runs: &FsPath) {
    let script = format!(
        "#!/bin/sh\n\
         echo \"$*\" >> {runs}\n\
         n=$(wc -l < {runs} | tr -d ' ')\n\
         echo \"[client] Session started\"\n\
         echo \"[client] Tunnel established at tcp://tunnel.example.com:$((41000 + n))\"\n\
         exit 0\n",
        runs = runs.display()
    );
    std::fs::write(path, script).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

async fn tunnel_fixture(public_ip: &str) -> TunnelFixture {
    let dir = TempDir::new().unwrap();
    let daemon = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let runs = dir.path().join("runs");
    let binary = dir.path().join("ngrok");
    tunnel_script(&binary, &runs);

    let tunnel = TunnelConfig {
        binary,
        log_path: dir.path().join("log").join("ngrok.log"),
        config_path: dir.path().join("ngrok.conf"),
        public_ip: public_ip.to_string(),
        common_name: String::new(),
        port: daemon.local_addr().unwrap().port(),
        auth_token: None,
    };
    std::fs::create_dir_all(dir.path().join("log")).unwrap();
    TunnelFixture {
        dir,
        tunnel,
        runs,
        _daemon: daemon,
    }
}

fn manager(base: &str) -> TunnelManager {
    let (client, config, retry) = reporter_parts(base);
    TunnelManager::new(client, config, retry).with_intervals(
        Duration::from_millis(10),
        Duration::from_millis(500),
        Duration::from_millis(50),
    )
}

#[tokio::test]
async fn test_missing_binary_is_skipped() {
    let (base, patches) = serve().await;
    let fx = tunnel_fixture("").await;
    let mut tunnel = fx.tunnel.clone();
    tunnel.binary = fx.dir.path().join("absent");

    tokio::time::timeout(Duration::from_secs(5), manager(&base).run(tunnel))
        .await
        .expect("manager kept running without a binary");
    assert!(!fx.tunnel.log_path.exists());
    assert_eq!(patches.lookups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_reachable_port_needs_no_tunnel() {
    let (base, patches) = serve().await;
    let fx = tunnel_fixture("127.0.0.1").await;

    tokio::time::timeout(Duration::from_secs(5), manager(&base).run(fx.tunnel.clone()))
        .await
        .expect("manager kept running for a reachable port");
    assert!(!fx.runs.exists());
    assert!(!fx.tunnel.config_path.exists());
    assert_eq!(patches.lookups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_exited_tunnel_is_restarted_and_reported() {
    let (base, patches) = serve().await;
    let fx = tunnel_fixture("").await;
    let run = tokio::spawn(manager(&base).run(fx.tunnel.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while reported(&patches).len() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "endpoints were never reported");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    run.abort();

    // Each session announces its own endpoint, in start order
    let tunnels = reported(&patches);
    assert_eq!(tunnels[..2], ["tcp://tunnel.example.com:41001", "tcp://tunnel.example.com:41002"]);

    // The service address is looked up once and written for every session
    assert_eq!(patches.lookups.load(Ordering::SeqCst), 1);
    assert_eq!(
        std::fs::read_to_string(&fx.tunnel.config_path).unwrap(),
        render_service_config("tunnel.example.com:4443")
    );
    let runs = std::fs::read_to_string(&fx.runs).unwrap();
    let first = runs.lines().next().unwrap();
    assert_eq!(
        first,
        format!(
            "-log stdout -config {} -proto tcp {}",
            fx.tunnel.config_path.display(),
            fx.tunnel.port
        )
    );
}
