//! HTTP response helpers and body handling

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::error;

use crate::{Result, TapedeckError};

/// Body type of every response the server produces
pub type HttpBody = Full<Bytes>;

/// Status code for an error
#[must_use]
pub fn status_for(error: &TapedeckError) -> StatusCode {
    match error {
        TapedeckError::NotFound(_) | TapedeckError::FileNotFound(_) => StatusCode::NOT_FOUND,
        TapedeckError::DeviceBusy { .. }
        | TapedeckError::OutputInUse { .. }
        | TapedeckError::InvalidState { .. } => StatusCode::CONFLICT,
        TapedeckError::DeviceError(_) | TapedeckError::TooManySessions { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        TapedeckError::InvalidOptions(_) | TapedeckError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        TapedeckError::DataTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        TapedeckError::LaunchFailure(_)
        | TapedeckError::ConfigError(_)
        | TapedeckError::Io(_)
        | TapedeckError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Create a response with a raw body
#[must_use]
pub fn create_response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<HttpBody> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Serialize `value` as a JSON response
#[must_use]
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<HttpBody> {
    match serde_json::to_vec(value) {
        Ok(body) => create_response(status, "application/json", Bytes::from(body)),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            error_response(&TapedeckError::Other(format!("serialization failed: {e}")))
        }
    }
}

/// Structured error response: `{"error": {"kind", "message"}}`
#[must_use]
pub fn error_response(error: &TapedeckError) -> Response<HttpBody> {
    let body = json!({
        "error": {
            "kind": error.kind(),
            "message": error.to_string(),
        }
    });
    create_response(
        status_for(error),
        "application/json",
        Bytes::from(body.to_string()),
    )
}

/// 404 for a path no route matches
#[must_use]
pub fn route_not_found(path: &str) -> Response<HttpBody> {
    json_response(
        StatusCode::NOT_FOUND,
        &json!({
            "error": {
                "kind": "NotFound",
                "message": format!("No route for {path}"),
            }
        }),
    )
}

/// 405 with the error envelope
#[must_use]
pub fn method_not_allowed(method: &hyper::Method, path: &str) -> Response<HttpBody> {
    let mut response = error_response(&TapedeckError::InvalidRequest(format!(
        "{method} not allowed on {path}"
    )));
    *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
    response
}

/// Reject requests whose declared length exceeds `max_size`
///
/// # Errors
///
/// Returns `DataTooLarge` if the request is too large
pub fn validate_request<B>(request: &Request<B>, max_size: usize) -> Result<()> {
    if let Some(content_length) = request.headers().get(hyper::header::CONTENT_LENGTH) {
        if let Ok(length_str) = content_length.to_str() {
            if let Ok(length) = length_str.parse::<usize>() {
                if length > max_size {
                    return Err(TapedeckError::DataTooLarge {
                        size: length,
                        limit: max_size,
                    });
                }
            }
        }
    }

    Ok(())
}

/// Read a JSON request body with a size limit
///
/// # Errors
///
/// Returns error if the body is too large, unreadable, or not valid JSON
/// for `T`
pub async fn read_json<T, B>(body: B, max_size: usize) -> Result<T>
where
    T: DeserializeOwned,
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let collected = http_body_util::Limited::new(body, max_size)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                TapedeckError::DataTooLarge {
                    size: max_size + 1,
                    limit: max_size,
                }
            } else {
                TapedeckError::InvalidRequest(format!("Failed to read body: {e}"))
            }
        })?;

    let bytes = collected.to_bytes();
    serde_json::from_slice(&bytes)
        .map_err(|e| TapedeckError::InvalidRequest(format!("Invalid JSON body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::SessionId;
    use http_body_util::Empty;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (TapedeckError::NotFound("x".to_string()), StatusCode::NOT_FOUND),
            (
                TapedeckError::DeviceBusy {
                    device: "alsa:hw:0".to_string(),
                    session: SessionId::new(),
                },
                StatusCode::CONFLICT,
            ),
            (TapedeckError::LaunchFailure("x".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
            (TapedeckError::DeviceError("x".to_string()), StatusCode::SERVICE_UNAVAILABLE),
            (TapedeckError::InvalidOptions("x".to_string()), StatusCode::BAD_REQUEST),
        ];

        for (error, status) in cases {
            assert_eq!(status_for(&error), status, "{error}");
        }
    }

    #[tokio::test]
    async fn test_error_response_body() {
        let response = error_response(&TapedeckError::NotFound("abc".to_string()));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["kind"], "NotFound");
        assert_eq!(value["error"]["message"], "Session not found: abc");
    }

    #[test]
    fn test_validate_request_too_large() {
        let request = Request::builder()
            .method("POST")
            .uri("/sessions")
            .header(hyper::header::CONTENT_LENGTH, "10000")
            .body(Empty::<Bytes>::new())
            .unwrap();

        assert!(validate_request(&request, 1024).is_err());
        assert!(validate_request(&request, 10000).is_ok());
    }

    #[tokio::test]
    async fn test_read_json() {
        let body = Full::new(Bytes::from(r#"{"a": 1}"#));
        let value: serde_json::Value = read_json(body, 1024).await.unwrap();
        assert_eq!(value["a"], 1);
    }

    #[tokio::test]
    async fn test_read_json_too_large() {
        let body = Full::new(Bytes::from(r#"{"a": "a long string value"}"#));
        let err = read_json::<serde_json::Value, _>(body, 5).await.unwrap_err();
        assert_eq!(err.kind(), "DataTooLarge");
    }

    #[tokio::test]
    async fn test_read_json_malformed() {
        let body = Full::new(Bytes::from("{nope"));
        let err = read_json::<serde_json::Value, _>(body, 1024).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");
    }
}
