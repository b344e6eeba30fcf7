//! Sentinel-quorum primary discovery (§4.2).
//!
//! Asks a set of sentinel endpoints which node currently holds the primary
//! role in the replicated key-value store, tolerating individual sentinels
//! being slow, unreachable, or insufficiently informed (too few peers in
//! its view to trust). No wire protocol lives here — [`SentinelClient`] is
//! the seam a real RESP client plugs into; this crate only owns the
//! retry/backoff/quorum/race logic.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A host/port pair, used both for sentinel endpoints and the discovered
/// primary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What a sentinel reported about the current primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelReply {
    pub primary: Endpoint,
    pub other_sentinels_seen: usize,
}

#[derive(Debug, Clone)]
pub struct SentinelError {
    pub message: String,
}

impl SentinelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SentinelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sentinel error: {}", self.message)
    }
}

impl std::error::Error for SentinelError {}

/// The wire-protocol seam: issue one query against `endpoint`, honoring
/// `connect_timeout`/`command_timeout` internally, and cooperatively abort
/// if `cancel` fires.
pub trait SentinelClient: Send + Sync {
    fn query<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        connect_timeout: Duration,
        command_timeout: Duration,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<SentinelReply, SentinelError>>;
}

/// Tunables for [`discover_primary`] (§4.2).
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Minimum number of *other* sentinels a candidate must claim to see.
    pub quorum: usize,
    /// Cap on attempts per sentinel. `None` means unbounded.
    pub max_retries_per_sentinel: Option<u32>,
    /// At most this many sentinels are attempted in parallel.
    pub max_parallel: usize,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            quorum: 1,
            max_retries_per_sentinel: None,
            max_parallel: 2,
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Every sentinel exhausted its retry budget without a quorum-meeting
    /// success.
    Exhausted,
    /// The caller's cancellation token fired before a winner was found.
    Cancelled,
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryError::Exhausted => write!(f, "all sentinels exhausted"),
            DiscoveryError::Cancelled => write!(f, "discovery cancelled"),
        }
    }
}

impl std::error::Error for DiscoveryError {}

struct SentinelState {
    endpoint: Endpoint,
    attempts: u32,
    next_attempt_at: Instant,
}

fn has_budget(config: &DiscoveryConfig, attempts: u32) -> bool {
    config.max_retries_per_sentinel.map_or(true, |max| attempts < max)
}

/// Run the sentinel-quorum discovery algorithm (§4.2) to completion.
///
/// First success meeting the quorum wins; later successes are discarded
/// (this is the source system's documented behavior, not a bug we're
/// introducing — see the design notes' open question about race-dependent
/// winner selection under a transient partition).
pub async fn discover_primary(
    client: Arc<dyn SentinelClient>,
    sentinels: &[Endpoint],
    config: &DiscoveryConfig,
    cancel: CancellationToken,
) -> Result<Endpoint, DiscoveryError> {
    let mut order: Vec<usize> = (0..sentinels.len()).collect();
    order.shuffle(&mut rand::thread_rng());

    let now = Instant::now();
    let mut states: Vec<SentinelState> = order
        .into_iter()
        .map(|i| SentinelState {
            endpoint: sentinels[i].clone(),
            attempts: 0,
            next_attempt_at: now,
        })
        .collect();

    let (tx, mut rx) = mpsc::unbounded_channel::<Result<SentinelReply, SentinelError>>();
    let mut in_flight = 0usize;
    // Child tokens of this group are cancelled the instant a winner is
    // found (or the caller cancels us), stopping every other in-flight
    // attempt's connection/command.
    let attempt_group = CancellationToken::new();

    loop {
        if cancel.is_cancelled() {
            attempt_group.cancel();
            return Err(DiscoveryError::Cancelled);
        }

        // Dispatch as many eligible sentinels as the parallelism budget and
        // backoff clock allow.
        loop {
            if in_flight >= config.max_parallel {
                break;
            }
            let now = Instant::now();
            let Some(state) = states
                .iter_mut()
                .filter(|s| s.next_attempt_at <= now && has_budget(config, s.attempts))
                .min_by_key(|s| s.next_attempt_at)
            else {
                break;
            };

            state.attempts += 1;
            let backoff = 2u64.saturating_pow(state.attempts).min(64);
            state.next_attempt_at = now + Duration::from_secs(backoff);

            let endpoint = state.endpoint.clone();
            let connect_timeout = config.connect_timeout;
            let command_timeout = config.command_timeout;
            let child = attempt_group.child_token();
            let tx = tx.clone();
            let client = client.clone();

            in_flight += 1;
            tokio::spawn(async move {
                let result = client.query(&endpoint, connect_timeout, command_timeout, child).await;
                let _ = tx.send(result);
            });
        }

        let any_pending = states.iter().any(|s| has_budget(config, s.attempts));
        if in_flight == 0 && !any_pending {
            return Err(DiscoveryError::Exhausted);
        }

        if in_flight == 0 {
            // Nothing dispatchable right now, but some sentinel is still
            // serving its backoff; wait for the earliest one to come due.
            let wait_until = states
                .iter()
                .filter(|s| has_budget(config, s.attempts))
                .map(|s| s.next_attempt_at)
                .min()
                .expect("any_pending implies a minimum exists");
            tokio::select! {
                _ = cancel.cancelled() => {
                    attempt_group.cancel();
                    return Err(DiscoveryError::Cancelled);
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wait_until)) => {}
            }
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                attempt_group.cancel();
                return Err(DiscoveryError::Cancelled);
            }
            maybe_result = rx.recv() => {
                in_flight -= 1;
                if let Some(Ok(reply)) = maybe_result {
                    if reply.other_sentinels_seen >= config.quorum {
                        attempt_group.cancel();
                        return Ok(reply.primary);
                    }
                }
            }
        }
    }
}
