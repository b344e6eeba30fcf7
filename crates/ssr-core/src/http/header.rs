pub use axum::http::header::{
    HeaderName, HeaderValue,
    // Common header constants
    ACCEPT, ACCEPT_ENCODING, AUTHORIZATION, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH,
    CONTENT_TYPE, COOKIE, HOST, LOCATION, ORIGIN, REFERER, RETRY_AFTER, SET_COOKIE, USER_AGENT,
    VARY,
};
pub use axum::http::request::Parts;
pub use axum::http::{HeaderMap, Method, Request as HttpRequest, StatusCode};
