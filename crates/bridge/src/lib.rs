//! Loopback HTTP bridge: collaborating tools POST code for sandboxed
//! execution.
//!
//! Security gates, in order: the peer must be loopback (403), the shared
//! secret header must match (401), and the code must clear the denylist
//! (400) — all before any child process is spawned.  Execution happens in a
//! dedicated runtime directory under a hard wall-clock timeout.  The audit
//! log records sizes and an output preview, never full code bodies.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Json;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{info, warn};

use meridian_store::DocumentStore;

const BRIDGE_LOG: &str = "logs/bridge.jsonl";

const KEY_HEADER: &str = "x-bridge-key";

/// Operations the bridge refuses to execute.  The list is compiled in and
/// closed; a match aborts before any process is spawned.
const DENYLIST: &[&str] = &[
    "import socket",
    "import requests",
    "import urllib",
    "import http.client",
    "os.system(",
    "subprocess.Popen",
    "eval(",
    "exec(",
    "__import__",
    "open(\"/etc",
    "open(\"/sys",
    "open(\"/proc",
    "open('/etc",
    "open('/sys",
    "open('/proc",
];

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub host: String,
    pub port: u16,
    pub api_key: String,
    pub runtime_dir: PathBuf,
    pub exec_timeout: Duration,
    /// Interpreter invoked on the submitted code file.
    pub interpreter: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5050,
            api_key: "localonly".to_string(),
            runtime_dir: PathBuf::from("runtime"),
            exec_timeout: Duration::from_secs(20),
            interpreter: "python3".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    code: Option<String>,
}

#[derive(Serialize)]
struct BridgeLogRecord {
    ts: String,
    ok: bool,
    code_len: usize,
    output_len: usize,
    /// First 200 characters of the captured output.
    preview: String,
}

struct BridgeState {
    settings: BridgeSettings,
    store: Arc<DocumentStore>,
}

pub struct LocalBridge {
    state: Arc<BridgeState>,
}

impl LocalBridge {
    pub fn new(settings: BridgeSettings, store: Arc<DocumentStore>) -> Self {
        Self {
            state: Arc::new(BridgeState { settings, store }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/run", post(run_code))
            .route("/health", get(health))
            .route("/status", get(status))
            .with_state(Arc::clone(&self.state))
    }

    /// Bind and serve until the task is aborted.  Returns the bound address
    /// (useful when port 0 was requested).
    pub async fn spawn(&self) -> Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
        let addr = format!("{}:{}", self.state.settings.host, self.state.settings.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("bind bridge listener on {addr}"))?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "bridge listening");

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!(%err, "bridge server stopped");
            }
        });
        Ok((local_addr, handle))
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "healthy": true }))
}

async fn status(State(state): State<Arc<BridgeState>>) -> Json<Value> {
    Json(json!({
        "status": "running",
        "host": state.settings.host,
        "port": state.settings.port,
    }))
}

async fn run_code(
    State(state): State<Arc<BridgeState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Option<Json<RunRequest>>,
) -> (StatusCode, Json<Value>) {
    let provided_key = headers
        .get(KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    handle_run(&state, peer, provided_key, body.and_then(|Json(r)| r.code)).await
}

/// The full request pipeline, separated from the axum plumbing so the
/// security gates are directly testable.
async fn handle_run(
    state: &BridgeState,
    peer: SocketAddr,
    provided_key: &str,
    code: Option<String>,
) -> (StatusCode, Json<Value>) {
    if !peer.ip().is_loopback() {
        warn!(%peer, "rejected non-loopback bridge request");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "requests must come from localhost" })),
        );
    }

    if provided_key != state.settings.api_key {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid or missing key" })),
        );
    }

    let Some(code) = code else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing required field: code" })),
        );
    };

    if let Some(pattern) = denylist_match(&code) {
        log_request(state, false, code.len(), "");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("code rejected: unsafe operation ({pattern})"), "output": "" })),
        );
    }

    match execute(state, &code).await {
        Ok((ok, output, return_code)) => {
            log_request(state, ok, code.len(), &output);
            (
                StatusCode::OK,
                Json(json!({ "ok": ok, "output": output, "return_code": return_code })),
            )
        }
        Err(err) => {
            log_request(state, false, code.len(), &err.to_string());
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string(), "output": "" })),
            )
        }
    }
}

fn denylist_match(code: &str) -> Option<&'static str> {
    DENYLIST.iter().copied().find(|pattern| code.contains(pattern))
}

/// Run the code file in a child process rooted in the runtime directory,
/// under the wall-clock timeout.  stdout and stderr are both captured.
async fn execute(state: &BridgeState, code: &str) -> Result<(bool, String, i32)> {
    let runtime_dir = &state.settings.runtime_dir;
    std::fs::create_dir_all(runtime_dir)
        .with_context(|| format!("create runtime dir {}", runtime_dir.display()))?;
    let code_file = runtime_dir.join("bridge_exec.py");
    std::fs::write(&code_file, code).context("write code file")?;

    let child = Command::new(&state.settings.interpreter)
        .arg(&code_file)
        .current_dir(runtime_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawn {}", state.settings.interpreter))?;

    let timeout = state.settings.exec_timeout;
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.context("wait for child")?,
        Err(_) => {
            return Ok((
                false,
                format!("execution timeout ({}s exceeded)", timeout.as_secs()),
                -1,
            ));
        }
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        text.push_str("\nSTDERR:\n");
        text.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    Ok((
        output.status.success(),
        text.trim().to_string(),
        output.status.code().unwrap_or(-1),
    ))
}

fn log_request(state: &BridgeState, ok: bool, code_len: usize, output: &str) {
    let record = BridgeLogRecord {
        ts: Utc::now().to_rfc3339(),
        ok,
        code_len,
        output_len: output.len(),
        preview: output.chars().take(200).collect(),
    };
    if let Err(err) = state.store.append_jsonl(BRIDGE_LOG, &record) {
        warn!(%err, "could not append bridge log");
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &tempfile::TempDir) -> BridgeSettings {
        BridgeSettings {
            host: "127.0.0.1".to_string(),
            port: 0,
            api_key: "test-secret".to_string(),
            runtime_dir: dir.path().join("runtime"),
            exec_timeout: Duration::from_secs(5),
            // `sh` keeps the tests hermetic on machines without python3.
            interpreter: "sh".to_string(),
        }
    }

    fn state(dir: &tempfile::TempDir) -> BridgeState {
        BridgeState {
            settings: settings(dir),
            store: Arc::new(DocumentStore::open(dir.path()).unwrap()),
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn remote() -> SocketAddr {
        "192.168.1.50:40000".parse().unwrap()
    }

    #[test]
    fn denylist_catches_dangerous_patterns() {
        assert!(denylist_match("import socket\nsend()").is_some());
        assert!(denylist_match("os.system('rm -rf /')").is_some());
        assert!(denylist_match("data = open(\"/etc/passwd\").read()").is_some());
        assert!(denylist_match("open('/proc/self/environ')").is_some());
        assert!(denylist_match("print('hello world')").is_none());
    }

    #[tokio::test]
    async fn non_loopback_peer_is_rejected_before_execution() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let (status, _) = handle_run(
            &state,
            remote(),
            "test-secret",
            Some("echo should-not-run".to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        // Short-circuited before spawn: no code file was ever written.
        assert!(!state.settings.runtime_dir.join("bridge_exec.py").exists());
    }

    #[tokio::test]
    async fn bad_key_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let (status, _) =
            handle_run(&state, loopback(), "wrong-key", Some("echo hi".to_string())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn missing_code_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let (status, _) = handle_run(&state, loopback(), "test-secret", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn denylisted_code_is_rejected_without_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let (status, body) = handle_run(
            &state,
            loopback(),
            "test-secret",
            Some("import socket".to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.0["error"].as_str().unwrap().contains("rejected"));
        assert!(!state.settings.runtime_dir.join("bridge_exec.py").exists());
    }

    #[tokio::test]
    async fn accepted_code_executes_and_returns_output() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let (status, body) = handle_run(
            &state,
            loopback(),
            "test-secret",
            Some("echo hello from the bridge".to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["ok"], true);
        assert_eq!(body.0["output"], "hello from the bridge");
        assert_eq!(body.0["return_code"], 0);
    }

    #[tokio::test]
    async fn audit_log_has_sizes_but_not_code() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let code = "echo marker_output_4711";
        handle_run(&state, loopback(), "test-secret", Some(code.to_string())).await;

        let records: Vec<serde_json::Value> = state.store.read_jsonl(BRIDGE_LOG);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["code_len"], code.len());
        assert!(records[0]["preview"].as_str().unwrap().contains("marker_output_4711"));
        // The code body itself is never logged.
        let raw = std::fs::read_to_string(state.store.path(BRIDGE_LOG)).unwrap();
        assert!(!raw.contains("echo marker_output_4711"));
    }

    #[tokio::test]
    async fn slow_code_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state(&dir);
        state.settings.exec_timeout = Duration::from_millis(100);
        let (status, body) = handle_run(
            &state,
            loopback(),
            "test-secret",
            Some("sleep 10".to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.0["ok"], false);
        assert!(body.0["output"].as_str().unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn end_to_end_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::open(dir.path()).unwrap());
        let bridge = LocalBridge::new(settings(&dir), store);
        let (addr, handle) = bridge.spawn().await.unwrap();

        let client = reqwest::Client::new();
        let health: serde_json::Value = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["healthy"], true);

        let unauthorized = client
            .post(format!("http://{addr}/run"))
            .json(&json!({ "code": "echo hi" }))
            .send()
            .await
            .unwrap();
        assert_eq!(unauthorized.status(), 401);

        let run: serde_json::Value = client
            .post(format!("http://{addr}/run"))
            .header("X-Bridge-Key", "test-secret")
            .json(&json!({ "code": "echo over http" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(run["ok"], true);
        assert_eq!(run["output"], "over http");

        handle.abort();
    }
}
