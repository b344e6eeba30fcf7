//! Trait contracts for the key-value store and database collaborators.
//!
//! This crate deliberately carries no wire-protocol client: no TCP, no
//! RESP/SQL framing, no connection pool. It exists so the rest of the
//! server — the integrations holder, the update coordinator, the sitemap
//! stream's encoder stage — can be written and tested against an
//! in-memory fake, with a real client wired in at the edge of the process
//! by whoever assembles it.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};

/// A future boxed for object safety: every trait in this crate is held as
/// `Arc<dyn Trait>` somewhere (the integrations holder, the update
/// coordinator), so the methods can't use return-position `impl Trait`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An error from the key-value store or database. Kept deliberately thin —
/// callers fold this into [`ssr_core::error::AppError::OutOfBandInfra`] or
/// `UpstreamUnavailable` at the point they decide what it means for the
/// current request.
#[derive(Debug, Clone)]
pub struct StoreError {
    pub message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "store error: {}", self.message)
    }
}

impl std::error::Error for StoreError {}

/// The subset of key-value operations the server actually needs: plain
/// get/set, the atomic set-and-return-old-value used by the update
/// coordinator's revision check (§4.10 step 3), the `SET NX EX` used by
/// its distributed lock, and a compare-and-delete used to release that
/// lock only if it still holds the identifier it set.
pub trait KvStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>>;

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Atomically set `key` to `value` and return whatever it held before
    /// (`None` if it was unset).
    fn set_get<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, StoreError>>;

    /// `SET key value NX EX ttl_secs`. Returns `true` if the key was
    /// previously unset and this call claimed it.
    fn set_nx_ex<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl_secs: u64,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Delete `key` only if it currently holds `expected` (a Lua-script
    /// compare-and-delete, matching the distributed-lock release protocol
    /// in §4.10). Returns `true` if the delete happened.
    fn compare_delete<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Subscribe to a pub/sub channel, returning a handle whose `recv`
    /// resolves once per published message. Used for the "update
    /// available" signal in §4.10's steady-state loop.
    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn Subscription>, StoreError>>;

    /// Release the underlying connection. Default is a no-op for fakes and
    /// in-memory implementations that own nothing to close.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// An open subscription to a key-value-store channel.
pub trait Subscription: Send + Sync {
    /// Wait for the next published message. Resolves to `Ok(())` per
    /// message received — the update coordinator only cares that *a*
    /// message arrived, not its payload.
    fn recv(&mut self) -> BoxFuture<'_, Result<(), StoreError>>;
}

/// A single row of the sitemap persistence table (§3, "Sitemap persistence
/// row"): `path` is the primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct SitemapRow {
    pub path: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The database operations the sitemap stream's encoder stage needs:
/// batched lookups by path, inserts for unseen paths, and fingerprint
/// updates for paths whose content changed.
pub trait DbClient: Send + Sync {
    fn lookup_by_paths<'a>(
        &'a self,
        paths: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<SitemapRow>, StoreError>>;

    fn insert_row<'a>(
        &'a self,
        path: &'a str,
        fingerprint: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<SitemapRow, StoreError>>;

    fn update_fingerprint<'a>(
        &'a self,
        path: &'a str,
        fingerprint: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_includes_message() {
        let err = StoreError::new("connection reset");
        assert_eq!(err.to_string(), "store error: connection reset");
    }

    #[test]
    fn sitemap_row_equality_is_field_wise() {
        let now = Utc::now();
        let a = SitemapRow {
            path: "/a".into(),
            fingerprint: "abc".into(),
            created_at: now,
            updated_at: now,
        };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
