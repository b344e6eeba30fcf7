//! Error taxonomy (§7).
//!
//! Every error that can surface from request handling is classified into
//! one of six kinds. The classification drives both the HTTP response (if
//! any) and how the error is logged — some kinds log at `warn` with no
//! stack, some log at `error` with an alert dispatched via the webhook
//! channel, and cancellation logs nothing but a short note.

use crate::http::{Body, IntoResponse, Json, Response, StatusCode};

/// Helper to create a JSON error response with a standard `{ "error": message }` body.
fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "error": message.into() });
    (status, Json(body)).into_response()
}

/// A classified application error (§7 taxonomy).
///
/// Variant order mirrors the spec's numbered list so a reviewer can check
/// one against the other directly.
pub enum AppError {
    /// 1. Malformed header, body-schema violation, unsupported encoding,
    /// unacceptable media type. Surfaces as 4xx with a small JSON body.
    /// `header` carries the optional `(name, value)` pair 406/415 responses
    /// must echo back (`Accept`/`Accept-Encoding` enumerating the offers).
    RequestFraming {
        status: StatusCode,
        message: String,
        header: Option<(crate::http::HeaderName, String)>,
    },
    /// 2. Schema not yet generated, transient integration failure. Surfaces
    /// as 503 with `Retry-After`.
    UpstreamUnavailable { retry_after_secs: u64, message: String },
    /// 3. Client disconnect or shutdown. No response body; the connection
    /// is simply closed. Logged as CANCELED, not as a failure.
    Cancelled,
    /// 4. Read/write/content/decompress timeout. Logged tersely; never
    /// surfaced as a response body because the pipe is already gone or the
    /// caller is expected to treat a truncated body as failure.
    PipeTimeout { stage: &'static str },
    /// 5. The key-value store (or another long-lived integration)
    /// disconnected mid-request and signalled the holder's error channel.
    /// The operation cancels itself; the request gets a 503.
    OutOfBandInfra { source: String },
    /// 6. Programmer error or a genuinely unexpected failure. Logged with
    /// full detail and alerted; the process keeps serving other requests.
    Unhandled(String),
    /// An explicitly constructed response with a caller-chosen status and
    /// JSON body, used for cases the other variants don't fit (e.g. the
    /// canonical-slug redirect isn't an error but reuses this plumbing).
    Custom {
        status: StatusCode,
        body: serde_json::Value,
    },
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        AppError::RequestFraming {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            header: None,
        }
    }

    /// 406 Not Acceptable. `offers` lists the media types the caller could
    /// have produced, echoed back in an `Accept` header (§4.4).
    pub fn unacceptable(message: impl Into<String>, offers: impl Into<String>) -> Self {
        AppError::RequestFraming {
            status: StatusCode::NOT_ACCEPTABLE,
            message: message.into(),
            header: Some((crate::http::header::ACCEPT, offers.into())),
        }
    }

    /// 415 Unsupported Media Type. `supported` lists the codings the server
    /// can produce, echoed back in an `Accept-Encoding` header (§4.4).
    pub fn unsupported_encoding(message: impl Into<String>, supported: impl Into<String>) -> Self {
        AppError::RequestFraming {
            status: StatusCode::UNSUPPORTED_MEDIA_TYPE,
            message: message.into(),
            header: Some((crate::http::header::ACCEPT_ENCODING, supported.into())),
        }
    }

    pub fn upstream_unavailable(retry_after_secs: u64, message: impl Into<String>) -> Self {
        AppError::UpstreamUnavailable {
            retry_after_secs,
            message: message.into(),
        }
    }

    /// Log this error at the appropriate level. `RequestFraming` is not
    /// logged by default — it's routine client behavior, not a server
    /// condition worth a log line on every request.
    pub fn log(&self) {
        match self {
            AppError::RequestFraming { .. } => {}
            AppError::UpstreamUnavailable { message, .. } => {
                tracing::warn!(message, "upstream unavailable");
            }
            AppError::Cancelled => {
                tracing::info!("request cancelled");
            }
            AppError::PipeTimeout { stage } => {
                tracing::warn!(stage, "pipe timeout");
            }
            AppError::OutOfBandInfra { source } => {
                tracing::warn!(source, "out-of-band infrastructure error");
            }
            AppError::Unhandled(message) => {
                tracing::error!(message, "unhandled infrastructure error");
            }
            AppError::Custom { status, body } => {
                tracing::debug!(%status, %body, "custom error response");
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.log();
        match self {
            AppError::RequestFraming {
                status,
                message,
                header,
            } => {
                let mut response = error_response(status, message);
                if let Some((name, value)) = header {
                    if let Ok(value) = crate::http::HeaderValue::from_str(&value) {
                        response.headers_mut().insert(name, value);
                    }
                }
                response
            }
            AppError::UpstreamUnavailable {
                retry_after_secs,
                message,
            } => {
                let mut response = error_response(StatusCode::SERVICE_UNAVAILABLE, message);
                if let Ok(value) = crate::http::HeaderValue::from_str(&retry_after_secs.to_string())
                {
                    response
                        .headers_mut()
                        .insert(crate::http::header::RETRY_AFTER, value);
                }
                response
            }
            AppError::Cancelled => {
                // No body: the caller is expected to have already closed (or
                // never opened) the connection. This exists to satisfy
                // IntoResponse in generic handler signatures.
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
            AppError::PipeTimeout { .. } => {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
            AppError::OutOfBandInfra { .. } => {
                error_response(StatusCode::SERVICE_UNAVAILABLE, "upstream unavailable")
            }
            AppError::Unhandled(_) => {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
            AppError::Custom { status, body } => (status, Json(body)).into_response(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::RequestFraming { status, message, .. } => {
                write!(f, "request framing error ({status}): {message}")
            }
            AppError::UpstreamUnavailable { message, .. } => {
                write!(f, "upstream unavailable: {message}")
            }
            AppError::Cancelled => write!(f, "cancelled"),
            AppError::PipeTimeout { stage } => write!(f, "pipe timeout during {stage}"),
            AppError::OutOfBandInfra { source } => write!(f, "out-of-band infra error: {source}"),
            AppError::Unhandled(msg) => write!(f, "unhandled error: {msg}"),
            AppError::Custom { status, body } => write!(f, "custom error ({status}): {body}"),
        }
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Unhandled(err.to_string())
    }
}

/// Generate `From<E> for AppError` implementations that map error types to
/// a specific `AppError::Unhandled`-shaped constructor.
///
/// # Example
///
/// ```ignore
/// ssr_core::map_error! {
///     serde_json::Error => Unhandled,
/// }
/// ```
#[macro_export]
macro_rules! map_error {
    ( $( $err_ty:ty => $variant:ident ),* $(,)? ) => {
        $(
            impl From<$err_ty> for $crate::error::AppError {
                fn from(err: $err_ty) -> Self {
                    $crate::error::AppError::$variant(err.to_string())
                }
            }
        )*
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn error_parts(err: AppError) -> (StatusCode, serde_json::Value) {
        let resp = err.into_response();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn request_framing_uses_given_status() {
        let (status, body) = error_parts(AppError::bad_request("bad body")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad body");
    }

    #[tokio::test]
    async fn unacceptable_media_type_is_406() {
        let err = AppError::unacceptable("no matching type", "text/html, application/json");
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_ACCEPTABLE);
        assert_eq!(resp.headers().get("accept").unwrap(), "text/html, application/json");
    }

    #[tokio::test]
    async fn unsupported_encoding_is_415() {
        let err = AppError::unsupported_encoding("no matching coding", "gzip, deflate, br, identity");
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(
            resp.headers().get("accept-encoding").unwrap(),
            "gzip, deflate, br, identity"
        );
    }

    #[tokio::test]
    async fn upstream_unavailable_sets_retry_after() {
        let err = AppError::upstream_unavailable(5, "schema not ready");
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "5");
    }

    #[tokio::test]
    async fn out_of_band_infra_surfaces_as_503() {
        let (status, _) = error_parts(AppError::OutOfBandInfra {
            source: "kv store disconnected".into(),
        })
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unhandled_surfaces_as_500_without_leaking_detail() {
        let (status, body) = error_parts(AppError::Unhandled("panic in handler".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "internal server error");
    }

    #[tokio::test]
    async fn custom_status_and_body_round_trip() {
        let custom_body = serde_json::json!({"detail": "teapot"});
        let (status, body) = error_parts(AppError::Custom {
            status: StatusCode::IM_A_TEAPOT,
            body: custom_body.clone(),
        })
        .await;
        assert_eq!(status, StatusCode::IM_A_TEAPOT);
        assert_eq!(body, custom_body);
    }

    #[test]
    fn app_error_from_io_error_is_unhandled() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let app_err: AppError = io_err.into();
        match app_err {
            AppError::Unhandled(msg) => assert!(msg.contains("file missing")),
            other => panic!("expected Unhandled, got {other}"),
        }
    }
}
