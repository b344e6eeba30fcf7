//! Router core, cancellation primitives, and request lifecycle plumbing for
//! the SSR web server.
//!
//! This crate owns the parts of the server that are not specific to any one
//! route family: the two-phase router (static lookup, then an ordered race
//! of async path matchers), cooperative cancellation, the error taxonomy,
//! configuration loading, security headers, health checks, and the request
//! lifecycle (timing, in-flight tracking, graceful shutdown).

pub mod cancel;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod router;
pub mod secure_headers;

pub use cancel::{CancelGroup, CancelHandle, Operation};
pub use config::{
    ConfigError, ConfigValidationError, DefaultSecretResolver, FromConfigValue, MissingKeyError,
    SecretResolver, SsrConfig,
};
pub use error::AppError;
pub use health::{HealthBuilder, HealthIndicator, HealthState, HealthStatus};
pub use lifecycle::{InFlightGuard, InFlightTracker, ShutdownCoordinator};
pub use router::{AsyncPathMatcher, BuiltRoute, Lookup, Router, RouteConflict};
pub use secure_headers::SecureHeaders;
