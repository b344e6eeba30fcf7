//! OpenAPI schema snapshot service (§4.9).
//!
//! The schema itself is assembled once by a sibling process and cached to
//! disk per content encoding; this crate owns that file lifecycle and the
//! `/openapi.json` route that serves whichever cached file matches the
//! request's negotiated encoding. It never regenerates the schema inline
//! with a request — absence of a cached file is a 503, not a trigger to
//! build one on the spot.

pub mod schema;
mod snapshot;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;

use ssr_core::error::AppError;
use ssr_core::http::{header, IntoResponse, Response, StatusCode};

pub use schema::{build_spec, schema_of, SchemaProvider, SchemaRegistry};
pub use snapshot::{cleanup_stale, read_cached, regenerate, SUPPORTED_ENCODINGS};

/// Shared state behind the `/openapi.json` route: just the directory the
/// sibling regeneration process publishes snapshots into.
#[derive(Clone)]
pub struct SchemaCache {
    tmp_dir: Arc<PathBuf>,
}

impl SchemaCache {
    pub fn new(tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            tmp_dir: Arc::new(tmp_dir.into()),
        }
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }
}

/// Build the `/openapi.json` route. Mount under whatever prefix the caller
/// uses for machine-readable artifacts.
pub fn routes() -> axum::Router<SchemaCache> {
    axum::Router::new().route("/openapi.json", get(serve_schema))
}

async fn serve_schema(
    State(cache): State<SchemaCache>,
    request: ssr_core::http::Request,
) -> Response {
    let accept_encoding = request
        .headers()
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok());

    let Some(encoding) = ssr_negotiate::negotiate_encoding(accept_encoding, SUPPORTED_ENCODINGS) else {
        return AppError::unsupported_encoding(
            "no acceptable content-encoding",
            SUPPORTED_ENCODINGS.join(", "),
        )
        .into_response();
    };

    match read_cached(cache.tmp_dir(), encoding).await {
        Ok(Some(bytes)) => {
            let mut response = bytes.into_response();
            *response.status_mut() = StatusCode::OK;
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
            if encoding != "identity" {
                if let Ok(value) = header::HeaderValue::from_str(encoding) {
                    response.headers_mut().insert(header::CONTENT_ENCODING, value);
                }
            }
            // Vary: the uniform `Accept, Accept-Encoding, User-Agent` triple is
            // applied once, at the composition root, to every successful
            // response (§6) — not per route.
            response
        }
        Ok(None) => AppError::upstream_unavailable(5, "schema not yet generated").into_response(),
        Err(err) => AppError::Unhandled(err.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn request(path: &str, accept_encoding: Option<&str>) -> ssr_core::http::Request {
        let mut builder = ssr_core::http::HttpRequest::builder().uri(path);
        if let Some(ae) = accept_encoding {
            builder = builder.header("accept-encoding", ae);
        }
        builder.body(ssr_core::http::Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn returns_503_before_any_snapshot_exists() {
        let dir = tempdir().unwrap();
        let cache = SchemaCache::new(dir.path());
        let router = routes().with_state(cache);

        let resp = router.oneshot(request("/openapi.json", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "5");
    }

    #[tokio::test]
    async fn serves_cached_identity_snapshot() {
        let dir = tempdir().unwrap();
        regenerate(dir.path(), br#"{"openapi":"3.1.0"}"#).await.unwrap();
        let cache = SchemaCache::new(dir.path());
        let router = routes().with_state(cache);

        let resp = router
            .oneshot(request("/openapi.json", Some("identity")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get("content-encoding").is_none());
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"openapi":"3.1.0"}"#);
    }

    #[tokio::test]
    async fn serves_gzip_when_negotiated() {
        let dir = tempdir().unwrap();
        regenerate(dir.path(), br#"{"openapi":"3.1.0"}"#).await.unwrap();
        let cache = SchemaCache::new(dir.path());
        let router = routes().with_state(cache);

        let resp = router
            .oneshot(request("/openapi.json", Some("gzip")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("content-encoding").unwrap(), "gzip");
    }

    #[tokio::test]
    async fn unsupported_encoding_is_415_with_accept_encoding_header() {
        let dir = tempdir().unwrap();
        regenerate(dir.path(), br#"{"openapi":"3.1.0"}"#).await.unwrap();
        let cache = SchemaCache::new(dir.path());
        let router = routes().with_state(cache);

        let resp = router
            .oneshot(request("/openapi.json", Some("xz")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(
            resp.headers().get("accept-encoding").unwrap(),
            "gzip, deflate, br, identity"
        );
    }
}
