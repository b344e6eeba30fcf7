//! Library surface for `frontend-ssr-web`, split out from the binary so
//! integration tests can exercise route wiring without re-parsing CLI
//! flags or binding a socket.

pub mod alerts;
pub mod config;
pub mod routes;
