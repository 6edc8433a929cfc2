//! Request routing for the control API

use std::path::PathBuf;
use std::sync::Arc;

use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_DISPOSITION};
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::capture::{
    CaptureOptions, ALLOWED_CONTAINERS, ALLOWED_SAMPLE_RATES, MAX_DURATION_SECS, MAX_FRAME_RATE,
};
use crate::library::RecordingLibrary;
use crate::recording::{SessionId, SessionManager};
use crate::{Result, TapedeckError};

use super::http::{
    create_response, error_response, json_response, method_not_allowed, read_json, route_not_found,
    status_for, validate_request, HttpBody,
};
use super::websocket;

/// Body of `POST /sessions`
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Device alias or raw V4L2/ALSA descriptor
    pub device_spec: String,
    /// Destination file; generated when absent
    pub output_path: Option<PathBuf>,
    /// Capture options, defaults from configuration
    pub options: CaptureOptions,
}

/// `POST /sessions` as sent, with `options` decoded separately so a bad
/// option is reported as `InvalidOptions` rather than a malformed body
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StartBody {
    device_spec: String,
    #[serde(default)]
    output_path: Option<PathBuf>,
    #[serde(default)]
    options: Option<serde_json::Value>,
}

impl TryFrom<StartBody> for StartRequest {
    type Error = TapedeckError;

    fn try_from(body: StartBody) -> Result<Self> {
        let options = match body.options {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| TapedeckError::InvalidOptions(e.to_string()))?,
            None => CaptureOptions::default(),
        };
        Ok(Self {
            device_spec: body.device_spec,
            output_path: body.output_path,
            options,
        })
    }
}

/// A matched path, independent of method
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Health,
    Options,
    Sessions,
    Session(String),
    SessionStop(String),
    SessionLogs(String),
    SessionLogStream(String),
    Files,
    File(String),
}

impl Route {
    fn parse(path: &str) -> Option<Self> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let route = match segments.as_slice() {
            ["health"] => Self::Health,
            ["options"] => Self::Options,
            ["sessions"] => Self::Sessions,
            ["sessions", id] => Self::Session((*id).to_string()),
            ["sessions", id, "stop"] => Self::SessionStop((*id).to_string()),
            ["sessions", id, "logs"] => Self::SessionLogs((*id).to_string()),
            ["sessions", id, "logs", "ws"] => Self::SessionLogStream((*id).to_string()),
            ["files"] => Self::Files,
            ["files", name] => Self::File((*name).to_string()),
            _ => return None,
        };
        Some(route)
    }
}

/// Dispatches API requests to the session manager and recordings library
#[derive(Debug, Clone)]
pub struct Router {
    manager: Arc<SessionManager>,
    library: RecordingLibrary,
    max_request_size: usize,
}

impl Router {
    /// Create a router over `manager`
    #[must_use]
    pub fn new(manager: Arc<SessionManager>) -> Self {
        let config = manager.config();
        let library = RecordingLibrary::new(config.capture.recordings_dir.clone());
        let max_request_size = config.server.max_request_size;

        Self {
            manager,
            library,
            max_request_size,
        }
    }

    /// Handle one request; errors become structured error responses
    pub async fn handle<B>(&self, request: Request<B>) -> Response<HttpBody>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        debug!("{} {}", method, path);

        let Some(route) = Route::parse(&path) else {
            return route_not_found(&path);
        };

        let result = match (route, &method) {
            (Route::Health, &Method::GET) => self.health().await,
            (Route::Options, &Method::GET) => Ok(self.options()),
            (Route::Sessions, &Method::GET) => {
                Ok(json_response(StatusCode::OK, &self.manager.list().await))
            }
            (Route::Sessions, &Method::POST) => self.start(request).await,
            (Route::Session(id), &Method::GET) => self.status(&id).await,
            (Route::Session(id), &Method::DELETE) => self.forget(&id).await,
            (Route::SessionStop(id), &Method::POST) => self.stop(&id).await,
            (Route::SessionLogs(id), &Method::GET) => self.logs(&id),
            (Route::SessionLogStream(id), &Method::GET) => self.log_stream(&id, request),
            (Route::Files, &Method::GET) => self.files().await,
            (Route::File(name), &Method::GET) => self.download(&name).await,
            (Route::File(name), &Method::DELETE) => self.delete_file(&name).await,
            _ => return method_not_allowed(&method, &path),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                if status_for(&e).is_server_error() {
                    warn!("{} {} failed: {}", method, path, e);
                } else {
                    debug!("{} {} rejected: {}", method, path, e);
                }
                error_response(&e)
            }
        }
    }

    async fn health(&self) -> Result<Response<HttpBody>> {
        let live = self.manager.live_count().await;
        Ok(json_response(
            StatusCode::OK,
            &json!({ "status": "ok", "live_sessions": live }),
        ))
    }

    fn options(&self) -> Response<HttpBody> {
        let config = self.manager.config();
        json_response(
            StatusCode::OK,
            &json!({
                "codecs": config.capture.allowed_codecs,
                "video_bitrates": config.capture.allowed_bitrates,
                "sample_rates": ALLOWED_SAMPLE_RATES,
                "containers": ALLOWED_CONTAINERS,
                "max_frame_rate": MAX_FRAME_RATE,
                "max_duration_limit": MAX_DURATION_SECS,
                "devices": config.devices,
                "defaults": config.defaults,
            }),
        )
    }

    async fn start<B>(&self, request: Request<B>) -> Result<Response<HttpBody>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        validate_request(&request, self.max_request_size)?;
        let body: StartBody = read_json(request.into_body(), self.max_request_size).await?;
        let body = StartRequest::try_from(body)?;

        let session = self
            .manager
            .start(&body.device_spec, body.output_path, &body.options)
            .await?;
        Ok(json_response(StatusCode::CREATED, &session))
    }

    async fn status(&self, id: &str) -> Result<Response<HttpBody>> {
        let session = self.manager.status(id.parse::<SessionId>()?).await?;
        Ok(json_response(StatusCode::OK, &session))
    }

    async fn stop(&self, id: &str) -> Result<Response<HttpBody>> {
        let session = self.manager.stop(id.parse::<SessionId>()?).await?;
        Ok(json_response(StatusCode::OK, &session))
    }

    async fn forget(&self, id: &str) -> Result<Response<HttpBody>> {
        let session = self.manager.remove(id.parse::<SessionId>()?).await?;
        Ok(json_response(StatusCode::OK, &session))
    }

    fn logs(&self, id: &str) -> Result<Response<HttpBody>> {
        let logs = self.manager.logs(id.parse::<SessionId>()?)?;
        Ok(json_response(
            StatusCode::OK,
            &json!({ "lines": logs.snapshot(), "closed": logs.is_closed() }),
        ))
    }

    fn log_stream<B>(&self, id: &str, request: Request<B>) -> Result<Response<HttpBody>>
    where
        B: Send + 'static,
    {
        let id = id.parse::<SessionId>()?;
        let logs = self.manager.logs(id)?;
        websocket::upgrade_log_stream(request, logs, id)
    }

    async fn files(&self) -> Result<Response<HttpBody>> {
        let files = self.library.list().await?;
        Ok(json_response(StatusCode::OK, &json!({ "files": files })))
    }

    async fn download(&self, raw_name: &str) -> Result<Response<HttpBody>> {
        let name = decode_name(raw_name)?;
        let contents = self.library.read(&name).await?;

        let mut response = create_response(StatusCode::OK, content_type_for(&name), contents);
        if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{name}\"")) {
            response.headers_mut().insert(CONTENT_DISPOSITION, value);
        }
        Ok(response)
    }

    async fn delete_file(&self, raw_name: &str) -> Result<Response<HttpBody>> {
        let name = decode_name(raw_name)?;
        let path = self.library.path_of(&name)?;

        if let Some(session) = self.manager.is_output_claimed(&path).await {
            return Err(TapedeckError::OutputInUse {
                path: path.display().to_string(),
                session,
            });
        }

        self.library.delete(&name).await?;
        Ok(json_response(StatusCode::OK, &json!({ "deleted": name })))
    }
}

fn decode_name(raw: &str) -> Result<String> {
    urlencoding::decode(raw)
        .map(std::borrow::Cow::into_owned)
        .map_err(|_| TapedeckError::InvalidRequest(format!("Malformed file name: {raw}")))
}

fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "mp4" => "video/mp4",
        Some(ext) if ext == "mkv" => "video/x-matroska",
        Some(ext) if ext == "mov" => "video/quicktime",
        Some(ext) if ext == "ts" => "video/mp2t",
        _ => "application/octet-stream",
    }
}
