//! Live stderr streaming over WebSocket

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::capture::LogTail;
use crate::recording::SessionId;
use crate::{Result, TapedeckError};

use super::http::HttpBody;

/// Accept a WebSocket upgrade and stream `logs` over it
///
/// Sends the retained backlog, then every new line, and closes once the
/// process's stderr has closed.
///
/// # Errors
///
/// Returns `InvalidRequest` if the request is not a WebSocket handshake
pub fn upgrade_log_stream<B>(
    request: Request<B>,
    logs: Arc<LogTail>,
    session: SessionId,
) -> Result<Response<HttpBody>>
where
    B: Send + 'static,
{
    let accept = accept_key(request.headers())?;

    tokio::spawn(async move {
        match hyper::upgrade::on(request).await {
            Ok(upgraded) => {
                let ws =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                debug!("Session {} log stream opened", session);
                if let Err(e) = stream_logs(ws, logs).await {
                    debug!("Session {} log stream ended: {}", session, e);
                }
            }
            Err(e) => warn!("Session {} log stream upgrade failed: {}", session, e),
        }
    });

    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(
        SEC_WEBSOCKET_ACCEPT,
        HeaderValue::from_str(&accept)
            .map_err(|e| TapedeckError::Other(format!("bad accept key: {e}")))?,
    );
    Ok(response)
}

/// Check the handshake headers and derive `Sec-WebSocket-Accept`
fn accept_key(headers: &HeaderMap) -> Result<String> {
    let has_token = |name: HeaderName, token: &str| {
        headers.get_all(name).iter().any(|value| {
            value
                .to_str()
                .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
                .unwrap_or(false)
        })
    };

    if !has_token(CONNECTION, "upgrade") || !has_token(UPGRADE, "websocket") {
        return Err(TapedeckError::InvalidRequest(
            "Expected a WebSocket upgrade request".to_string(),
        ));
    }

    if headers.get(SEC_WEBSOCKET_VERSION).map(HeaderValue::as_bytes) != Some(&b"13"[..]) {
        return Err(TapedeckError::InvalidRequest(
            "Unsupported WebSocket version".to_string(),
        ));
    }

    let key = headers
        .get(SEC_WEBSOCKET_KEY)
        .ok_or_else(|| TapedeckError::InvalidRequest("Missing Sec-WebSocket-Key".to_string()))?;

    Ok(derive_accept_key(key.as_bytes()))
}

/// Forward a log tail to one WebSocket client until either side ends
///
/// # Errors
///
/// Returns error if a frame cannot be sent or the client stream fails
pub async fn stream_logs<S>(mut ws: WebSocketStream<S>, logs: Arc<LogTail>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (backlog, mut live) = logs.subscribe();

    for line in backlog {
        ws.send(Message::Text(line)).await.map_err(ws_error)?;
    }

    loop {
        tokio::select! {
            line = live.recv() => match line {
                Ok(line) => ws.send(Message::Text(line)).await.map_err(ws_error)?,
                Err(RecvError::Lagged(skipped)) => {
                    ws.send(Message::Text(format!("[{skipped} lines skipped]")))
                        .await
                        .map_err(ws_error)?;
                }
                Err(RecvError::Closed) => {
                    ws.close(None).await.map_err(ws_error)?;
                    break;
                }
            },
            incoming = ws.next() => match incoming {
                Some(Ok(msg)) if msg.is_close() => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(ws_error(e)),
                None => break,
            },
        }
    }

    Ok(())
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> TapedeckError {
    TapedeckError::Other(format!("WebSocket error: {e}"))
}
