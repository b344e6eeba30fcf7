//! Request lifecycle: timing, in-flight tracking, and graceful shutdown
//! (§4.11).
//!
//! Every accepted connection is wrapped so that (a) its start time, method,
//! URL, and eventual status/duration get one log line; (b) it is registered
//! in an in-flight map so shutdown can cancel it; (c) cancellation is logged
//! as `CANCELED` rather than as an error; and (d) handler errors whose
//! message matches the known-benign pipe-timeout alphabet are logged
//! tersely instead of as an exception.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Substrings that mark a log message as a benign pipe timeout (§7.4):
/// logged as a concise indicator, never surfaced as an unhandled error.
const BENIGN_TIMEOUT_ALPHABET: &[&str] =
    &["write timeout", "read timeout", "content timeout", "decompress timeout"];

/// Whether `message` describes a benign pipe timeout.
pub fn is_benign_timeout(message: &str) -> bool {
    BENIGN_TIMEOUT_ALPHABET
        .iter()
        .any(|needle| message.contains(needle))
}

/// A single in-flight request's cancellation handle, keyed by a monotonic id.
struct InFlightEntry {
    token: CancellationToken,
    method: String,
    path: String,
    started_at: Instant,
}

/// Tracks every in-flight request so a shutdown can cancel them all at once.
pub struct InFlightTracker {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, InFlightEntry>>,
}

impl InFlightTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Register a new in-flight request, returning a guard that deregisters
    /// on drop and a child cancellation token scoped to this request.
    pub async fn register(
        self: &Arc<Self>,
        parent: &CancellationToken,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> (InFlightGuard, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = parent.child_token();
        self.entries.lock().await.insert(
            id,
            InFlightEntry {
                token: token.clone(),
                method: method.into(),
                path: path.into(),
                started_at: Instant::now(),
            },
        );
        (
            InFlightGuard {
                tracker: self.clone(),
                id,
            },
            token,
        )
    }

    /// Cancel every currently tracked request. Called once, at the start of
    /// the shutdown protocol's step 2.
    pub async fn cancel_all(&self) {
        let entries = self.entries.lock().await;
        tracing::info!(count = entries.len(), "cancelling in-flight requests");
        for entry in entries.values() {
            entry.token.cancel();
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn deregister(&self, id: u64) {
        self.entries.lock().await.remove(&id);
    }
}

/// RAII guard returned by [`InFlightTracker::register`]. Deregisters the
/// request when dropped, regardless of whether it completed or was
/// cancelled.
pub struct InFlightGuard {
    tracker: Arc<InFlightTracker>,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let tracker = self.tracker.clone();
        let id = self.id;
        tokio::spawn(async move {
            tracker.deregister(id).await;
        });
    }
}

/// Logs one line per completed request: method, URL, status, and elapsed
/// duration — or `CANCELED` if the handler was cancelled instead of
/// returning normally.
pub fn log_completion(method: &str, path: &str, outcome: &RequestOutcome, elapsed: Duration) {
    match outcome {
        RequestOutcome::Completed(status) => {
            tracing::info!(
                method,
                path,
                status,
                elapsed_ms = elapsed.as_millis() as u64,
                "request completed"
            );
        }
        RequestOutcome::Cancelled => {
            tracing::info!(
                method,
                path,
                elapsed_ms = elapsed.as_millis() as u64,
                "CANCELED"
            );
        }
        RequestOutcome::BenignTimeout(stage) => {
            tracing::warn!(
                method,
                path,
                stage,
                elapsed_ms = elapsed.as_millis() as u64,
                "pipe timeout"
            );
        }
    }
}

/// How a request's handling concluded, for logging purposes.
pub enum RequestOutcome {
    Completed(u16),
    Cancelled,
    BenignTimeout(&'static str),
}

/// Runs the shutdown protocol (§4.11):
/// 1. caller stops accepting new connections before calling this;
/// 2. cancel all in-flight requests;
/// 3. invoke registered shutdown hooks, in registration order;
/// 4. wait up to `pending_alerts_timeout` for deferred reporting work.
type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

pub struct ShutdownCoordinator {
    in_flight: Arc<InFlightTracker>,
    hooks: Mutex<Vec<Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>>>,
    pending_alerts_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(in_flight: Arc<InFlightTracker>) -> Self {
        Self {
            in_flight,
            hooks: Mutex::new(Vec::new()),
            pending_alerts_timeout: Duration::from_secs(2),
        }
    }

    /// Register a hook to run during step 3. Hooks run in registration order.
    pub async fn on_shutdown<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.hooks
            .lock()
            .await
            .push(Box::new(move || Box::pin(hook())));
    }

    /// Run the shutdown protocol's steps 2-4. Step 1 (stop accepting) is the
    /// caller's responsibility since it owns the listener.
    pub async fn shutdown(&self, pending_alerts: impl std::future::Future<Output = ()>) {
        self.in_flight.cancel_all().await;

        let hooks = std::mem::take(&mut *self.hooks.lock().await);
        for hook in hooks {
            hook().await;
        }

        if tokio::time::timeout(self.pending_alerts_timeout, pending_alerts)
            .await
            .is_err()
        {
            tracing::warn!("timed out waiting for pending alert delivery during shutdown");
        }
    }

    /// Waits for Ctrl+C or SIGTERM, whichever arrives first.
    pub async fn wait_for_signal() {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };

        #[cfg(unix)]
        let terminate = async {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            sigterm.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
    }
}
