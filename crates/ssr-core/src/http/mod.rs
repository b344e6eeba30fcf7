//! Thin facade over the HTTP types the rest of the server builds on.
//!
//! Mirrors the convention of owning the underlying HTTP crate (`axum`/`http`)
//! behind a single module so the router, streaming, and lifecycle code never
//! import it directly.

pub mod header;

pub use axum::body::Body;
pub use axum::response::{Html, IntoResponse, Response};
pub use axum::Json;
pub use header::{
    HeaderMap, HeaderName, HeaderValue, HttpRequest, Method, Parts, StatusCode, ACCEPT,
    ACCEPT_ENCODING, AUTHORIZATION, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
    COOKIE, HOST, LOCATION, ORIGIN, REFERER, RETRY_AFTER, SET_COOKIE, USER_AGENT, VARY,
};

/// Request type used throughout the router and handlers.
pub type Request = HttpRequest<Body>;

/// Split the path component out of a request-target, per the rule that the
/// query string begins at the first `?`.
pub fn path_only(raw: &str) -> &str {
    match raw.find('?') {
        Some(idx) => &raw[..idx],
        None => raw,
    }
}
