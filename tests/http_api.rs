//! End-to-end tests over a real listener

#![cfg(unix)]

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::{json, Value};
use tapedeck::config::Config;
use tapedeck::network::Server;
use tapedeck::recording::{SessionManager, SessionState};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use common::test_config;

struct TestServer {
    addr: SocketAddr,
    manager: Arc<SessionManager>,
    client: Client<HttpConnector, Full<Bytes>>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<tapedeck::Result<()>>,
    _dir: TempDir,
}

impl TestServer {
    async fn start(program: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), program);
        Self::with_config(config, dir).await
    }

    async fn with_config(config: Config, dir: TempDir) -> Self {
        let server = Server::new(config).unwrap();
        let manager = Arc::clone(server.manager());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(server.serve(listener, async {
            rx.await.ok();
        }));

        Self {
            addr,
            manager,
            client: Client::builder(TokioExecutor::new()).build_http(),
            shutdown: Some(tx),
            handle,
            _dir: dir,
        }
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = body.map(|v| v.to_string()).unwrap_or_default();
        let request = Request::builder()
            .method(method)
            .uri(format!("http://{}{}", self.addr, path))
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap();

        let response = self.client.request(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn stop_server(mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.send(()).ok();
        }
        let result = tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .unwrap();
        result.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_device_busy_flow() {
    let server = TestServer::start("graceful").await;
    let start = json!({ "device_spec": "cam0" });

    let (status, first) = server.call(Method::POST, "/sessions", Some(start.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["state"], "running");
    let id = first["id"].as_str().unwrap().to_string();

    let (status, busy) = server.call(Method::POST, "/sessions", Some(start.clone())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(busy["error"]["kind"], "DeviceBusy");

    let (status, stopped) = server
        .call(Method::POST, &format!("/sessions/{id}/stop"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["state"], "stopped");

    let (status, again) = server
        .call(Method::POST, &format!("/sessions/{id}/stop"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(again["error"]["kind"], "InvalidState");

    let (status, second) = server.call(Method::POST, "/sessions", Some(start)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(second["state"], "running");
    assert_ne!(second["id"], first["id"]);

    let (status, list) = server.call(Method::GET, "/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 2);

    server.stop_server().await;
}

#[tokio::test]
async fn test_error_statuses() {
    let server = TestServer::start("crashing").await;

    let (status, body) = server
        .call(Method::POST, "/sessions", Some(json!({ "device_spec": "cam0" })))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["kind"], "LaunchFailure");

    let (status, body) = server
        .call(Method::POST, "/sessions", Some(json!({ "device_spec": "/nonexistent/video7" })))
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["kind"], "DeviceError");

    let (status, body) = server
        .call(
            Method::POST,
            "/sessions",
            Some(json!({ "device_spec": "cam0", "options": { "codec": "vp9000" } })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "InvalidOptions");

    let (status, _) = server
        .call(Method::GET, "/sessions/00000000-0000-4000-8000-000000000000", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server.call(Method::DELETE, "/health", None).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    server.stop_server().await;
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), "graceful");
    config.server.max_request_size = 64;
    let server = TestServer::with_config(config, dir).await;

    let padding = "x".repeat(1024);
    let (status, body) = server
        .call(
            Method::POST,
            "/sessions",
            Some(json!({ "device_spec": "cam0", "output_path": padding })),
        )
        .await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"]["kind"], "DataTooLarge");

    server.stop_server().await;
}

#[tokio::test]
async fn test_health_and_options() {
    let server = TestServer::start("graceful").await;

    let (status, health) = server.call(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health, json!({ "status": "ok", "live_sessions": 0 }));

    let (status, options) = server.call(Method::GET, "/options", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(options["codecs"].as_array().unwrap().contains(&json!("libx264")));
    assert!(options["devices"]["cam0"]["video"].is_string());

    server.stop_server().await;
}

#[tokio::test]
async fn test_logs_and_files() {
    let server = TestServer::start("graceful").await;

    let (_, session) = server
        .call(
            Method::POST,
            "/sessions",
            Some(json!({ "device_spec": "cam0", "options": { "container": "mkv" } })),
        )
        .await;
    let id = session["id"].as_str().unwrap().to_string();
    let output = session["output_path"].as_str().unwrap().to_string();
    assert!(output.ends_with(".mkv"));
    let name = output.rsplit('/').next().unwrap().to_string();

    let (status, logs) = server
        .call(Method::GET, &format!("/sessions/{id}/logs"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(logs["lines"].is_array());

    let (status, body) = server
        .call(Method::DELETE, &format!("/files/{name}"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "OutputInUse");

    server
        .call(Method::POST, &format!("/sessions/{id}/stop"), None)
        .await;

    let (status, files) = server.call(Method::GET, "/files", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(files["files"][0]["name"], name.as_str());

    let (status, _) = server
        .call(Method::DELETE, &format!("/files/{name}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = server
        .call(Method::DELETE, &format!("/sessions/{id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "stopped");

    server.stop_server().await;
}

#[tokio::test]
async fn test_log_stream_over_websocket() {
    let server = TestServer::start("graceful").await;

    let (_, session) = server
        .call(Method::POST, "/sessions", Some(json!({ "device_spec": "cam0" })))
        .await;
    let id = session["id"].as_str().unwrap().to_string();

    let url = format!("ws://{}/sessions/{id}/logs/ws", server.addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(first.to_text().unwrap().starts_with("Input #0"));

    server
        .call(Method::POST, &format!("/sessions/{id}/stop"), None)
        .await;

    let mut closed = false;
    let mut saw_exit = false;
    while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_secs(3), ws.next()).await {
        match msg {
            Ok(msg) if msg.is_close() => {
                closed = true;
                break;
            }
            Ok(msg) => saw_exit |= msg.to_text().unwrap_or("").contains("received signal 2"),
            Err(_) => break,
        }
    }
    assert!(saw_exit);
    assert!(closed);

    server.stop_server().await;
}

#[tokio::test]
async fn test_shutdown_stops_live_sessions() {
    let server = TestServer::start("graceful").await;
    let manager = Arc::clone(&server.manager);

    let (_, session) = server
        .call(Method::POST, "/sessions", Some(json!({ "device_spec": "cam0" })))
        .await;
    let id = session["id"].as_str().unwrap().parse().unwrap();

    server.stop_server().await;

    let session = manager.status(id).await.unwrap();
    assert_eq!(session.state, SessionState::Stopped);
    assert_eq!(session.exit_code, Some(0));
}
