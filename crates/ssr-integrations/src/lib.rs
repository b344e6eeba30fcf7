//! The per-request integrations holder (§4.3).
//!
//! A scoped container owning two lazy collaborators — a database client
//! and a key-value-store client. Nothing is connected until first access;
//! first access is guarded by a mutex so concurrent first-accesses within
//! the same scope share one initialization instead of racing to connect
//! twice. The holder is built fresh per request scope, never as a
//! process-wide singleton: a failed or closed holder simply fails its
//! whole request, which is cheaper than trying to heal a shared one.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use ssr_kvstore::{DbClient, KvStore};
use ssr_sentinel::{discover_primary, DiscoveryConfig, Endpoint, SentinelClient};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error from acquiring or using a resource through the holder.
#[derive(Debug, Clone)]
pub enum HolderError {
    /// The holder was closed; no further access is permitted.
    Closed,
    /// Initialization of the resource failed.
    Init(String),
}

impl std::fmt::Display for HolderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HolderError::Closed => write!(f, "integrations holder is closed"),
            HolderError::Init(msg) => write!(f, "integration initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for HolderError {}

impl From<HolderError> for ssr_core::error::AppError {
    fn from(err: HolderError) -> Self {
        ssr_core::error::AppError::OutOfBandInfra {
            source: err.to_string(),
        }
    }
}

type DbFactory = Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn DbClient>, HolderError>> + Send + Sync>;
type KvFactory = Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn KvStore>, HolderError>> + Send + Sync>;

/// Connects to a discovered primary. The wire protocol itself is out of
/// scope here (§4.3's Non-goals) — this is the seam a real client plugs
/// into once §4.2 has named an endpoint.
pub type Connector =
    Box<dyn Fn(Endpoint, Duration) -> BoxFuture<'static, Result<Arc<dyn KvStore>, HolderError>> + Send + Sync>;

/// Build a [`KvFactory`] that runs sentinel-quorum discovery (§4.2) and
/// then connects to whatever endpoint it names, with a 2s connect timeout
/// and reconnect disabled (the holder is scoped to one request; a dead
/// connection just fails that request rather than being repaired in
/// place).
pub fn kv_factory(
    client: Arc<dyn SentinelClient>,
    sentinels: Vec<Endpoint>,
    discovery: DiscoveryConfig,
    connect_timeout: Duration,
    connector: Connector,
) -> KvFactory {
    let connector = Arc::new(connector);
    Box::new(move || {
        let client = client.clone();
        let sentinels = sentinels.clone();
        let discovery = discovery.clone();
        let connector = connector.clone();
        Box::pin(async move {
            let primary = discover_primary(client, &sentinels, &discovery, CancellationToken::new())
                .await
                .map_err(|e| HolderError::Init(e.to_string()))?;
            connector(primary, connect_timeout).await
        })
    })
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Resource {
    Db,
    Kv,
}

struct Inner {
    db: Option<Arc<dyn DbClient>>,
    kv: Option<Arc<dyn KvStore>>,
    /// Order resources were first acquired in, so `close` can release them
    /// in reverse.
    acquired: Vec<Resource>,
    closed: bool,
}

/// The request-scoped integrations holder.
///
/// Construct one per request (or per request-equivalent scope), call
/// [`IntegrationsHolder::db`]/[`IntegrationsHolder::kv`] as handlers need
/// them, and [`IntegrationsHolder::close`] it when the scope ends.
pub struct IntegrationsHolder {
    inner: Mutex<Inner>,
    db_factory: DbFactory,
    kv_factory: KvFactory,
    error_tx: broadcast::Sender<String>,
}

impl IntegrationsHolder {
    pub fn new(db_factory: DbFactory, kv_factory: KvFactory) -> Self {
        let (error_tx, _) = broadcast::channel(16);
        Self {
            inner: Mutex::new(Inner {
                db: None,
                kv: None,
                acquired: Vec::new(),
                closed: false,
            }),
            db_factory,
            kv_factory,
            error_tx,
        }
    }

    /// Subscribe to out-of-band errors: published when the key-value-store
    /// connection errors after having been established (connection drop,
    /// sentinel failover). A higher-level operation holding this receiver
    /// treats any message as fatal for the current request.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.error_tx.subscribe()
    }

    /// Report that the previously-acquired key-value-store connection has
    /// failed out of band. Whoever owns the real connection (a health-check
    /// task, a read loop observing EOF) calls this; the holder itself never
    /// detects connection failures on its own, since it holds no wire
    /// client.
    pub fn report_error(&self, message: impl Into<String>) {
        let _ = self.error_tx.send(message.into());
    }

    pub async fn db(&self) -> Result<Arc<dyn DbClient>, HolderError> {
        let mut guard = self.inner.lock().await;
        if guard.closed {
            return Err(HolderError::Closed);
        }
        if let Some(db) = &guard.db {
            return Ok(db.clone());
        }
        let db = (self.db_factory)().await?;
        guard.db = Some(db.clone());
        guard.acquired.push(Resource::Db);
        Ok(db)
    }

    pub async fn kv(&self) -> Result<Arc<dyn KvStore>, HolderError> {
        let mut guard = self.inner.lock().await;
        if guard.closed {
            return Err(HolderError::Closed);
        }
        if let Some(kv) = &guard.kv {
            return Ok(kv.clone());
        }
        let kv = (self.kv_factory)().await?;
        guard.kv = Some(kv.clone());
        guard.acquired.push(Resource::Kv);
        Ok(kv)
    }

    /// Release whatever was acquired, in reverse order, exactly once.
    /// Subsequent calls are a no-op; all accessors fail with
    /// [`HolderError::Closed`] from this point on.
    pub async fn close(&self) {
        let mut guard = self.inner.lock().await;
        if guard.closed {
            return;
        }
        guard.closed = true;
        let order = std::mem::take(&mut guard.acquired);
        for resource in order.into_iter().rev() {
            match resource {
                Resource::Kv => {
                    if let Some(kv) = guard.kv.take() {
                        kv.close().await;
                    }
                }
                Resource::Db => {
                    guard.db.take();
                }
            }
        }
    }
}
