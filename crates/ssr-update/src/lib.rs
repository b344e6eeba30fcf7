//! The update coordinator (§4.10).
//!
//! One instance runs per process. At startup it checks whether the
//! working tree's source revision has drifted from what the store last
//! recorded as built; if so, it rebuilds and restarts itself before ever
//! serving traffic. Once past startup it holds a local singleton lock for
//! its own process lifetime and waits in steady state for an "update
//! available" signal, at which point it races the rest of the fleet for a
//! distributed lock and, win or lose that race, restarts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use tokio_util::sync::CancellationToken;

use ssr_kvstore::KvStore;
use ssr_sentinel::{discover_primary, DiscoveryConfig, Endpoint, SentinelClient};

pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Errors from any phase of the update coordinator.
#[derive(Debug, Clone)]
pub enum UpdateError {
    /// `updater.lock` already exists: another instance is starting.
    AlreadyRunning,
    Io(String),
    Store(String),
    Script(String),
    Cancelled,
}

impl std::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateError::AlreadyRunning => write!(f, "updater.lock already held by another instance"),
            UpdateError::Io(msg) => write!(f, "update coordinator io error: {msg}"),
            UpdateError::Store(msg) => write!(f, "update coordinator store error: {msg}"),
            UpdateError::Script(msg) => write!(f, "update coordinator script error: {msg}"),
            UpdateError::Cancelled => write!(f, "update coordinator cancelled"),
        }
    }
}

impl std::error::Error for UpdateError {}

impl From<ssr_kvstore::StoreError> for UpdateError {
    fn from(err: ssr_kvstore::StoreError) -> Self {
        UpdateError::Store(err.to_string())
    }
}

/// Queries the working tree for its current source revision (§4.10 step 2:
/// "running the version-control query on the working tree").
pub trait RevisionSource: Send + Sync {
    fn current_revision(&self) -> BoxFuture<'_, Result<String, UpdateError>>;
}

/// A concrete [`RevisionSource`] backed by `git rev-parse HEAD`.
pub struct GitRevisionSource {
    pub working_dir: PathBuf,
}

impl RevisionSource for GitRevisionSource {
    fn current_revision(&self) -> BoxFuture<'_, Result<String, UpdateError>> {
        Box::pin(async move {
            let output = tokio::process::Command::new("git")
                .arg("rev-parse")
                .arg("HEAD")
                .current_dir(&self.working_dir)
                .output()
                .await
                .map_err(|e| UpdateError::Io(e.to_string()))?;
            if !output.status.success() {
                return Err(UpdateError::Io(format!(
                    "git rev-parse HEAD exited with {}",
                    output.status
                )));
            }
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        })
    }
}

/// A named, no-input child process the coordinator can invoke and wait on
/// (the rebuild script, the self-restart script).
pub trait ScriptRunner: Send + Sync {
    fn run(&self) -> BoxFuture<'_, Result<(), UpdateError>>;
}

/// A [`ScriptRunner`] backed by a literal program and argument list.
pub struct CommandScript {
    pub program: String,
    pub args: Vec<String>,
}

impl ScriptRunner for CommandScript {
    fn run(&self) -> BoxFuture<'_, Result<(), UpdateError>> {
        Box::pin(async move {
            let status = tokio::process::Command::new(&self.program)
                .args(&self.args)
                .status()
                .await
                .map_err(|e| UpdateError::Script(e.to_string()))?;
            if status.success() {
                Ok(())
            } else {
                Err(UpdateError::Script(format!(
                    "{} exited with {status}",
                    self.program
                )))
            }
        })
    }
}

/// `updater.lock`: created with exclusive-create at startup, holding the
/// PID, and removed on clean shutdown. Held for the lifetime of the
/// process — only one instance may run against a given working directory
/// at a time.
pub struct LocalLock {
    path: PathBuf,
}

impl LocalLock {
    /// Exclusive-create `path`, writing the current PID into it. Fails
    /// with [`UpdateError::AlreadyRunning`] if the file already exists.
    pub fn acquire(path: PathBuf) -> Result<Self, UpdateError> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => UpdateError::AlreadyRunning,
                _ => UpdateError::Io(e.to_string()),
            })?;
        write!(file, "{}", std::process::id()).map_err(|e| UpdateError::Io(e.to_string()))?;
        Ok(Self { path })
    }
}

impl Drop for LocalLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Tunables for the distributed update lock (§3's key glossary entry and
/// §4.10's acquisition protocol).
#[derive(Debug, Clone)]
pub struct UpdateLockConfig {
    /// `updates:frontend-ssr-web:lock`.
    pub key: String,
    pub ttl_secs: u64,
    pub retry_interval: Duration,
}

impl Default for UpdateLockConfig {
    fn default() -> Self {
        Self {
            key: "updates:frontend-ssr-web:lock".into(),
            ttl_secs: 300,
            retry_interval: Duration::from_secs(1),
        }
    }
}

fn generate_identifier() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

async fn write_lock_key_file(path: &Path, identifier: &str) -> Result<(), UpdateError> {
    tokio::fs::write(path, identifier)
        .await
        .map_err(|e| UpdateError::Io(e.to_string()))
}

/// Attempt to acquire the distributed update lock, retrying every
/// `retry_interval` until it succeeds, the caller cancels, or a store
/// error occurs (in which case §4.10 says to proceed anyway rather than
/// block the restart indefinitely on a flaky store).
///
/// The identifier is written to `lock_key_file` *before* the `SET NX EX`
/// attempt on every iteration, preserving the only ordering guarantee the
/// design calls out (§4.11).
pub async fn acquire_distributed_lock(
    kv: &dyn KvStore,
    config: &UpdateLockConfig,
    lock_key_file: &Path,
    cancel: &CancellationToken,
) -> Result<String, UpdateError> {
    loop {
        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        let identifier = generate_identifier();
        write_lock_key_file(lock_key_file, &identifier).await?;

        match kv.set_nx_ex(&config.key, &identifier, config.ttl_secs).await {
            Ok(true) => return Ok(identifier),
            Ok(false) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
                    _ = tokio::time::sleep(config.retry_interval) => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "distributed lock acquisition failed; proceeding anyway");
                return Ok(identifier);
            }
        }
    }
}

/// Release the distributed update lock if `lock_key_file` exists, via a
/// compare-and-delete against the identifier it names. The local file is
/// removed either way (§4.10 step 5: "delete the local file either way").
pub async fn release_distributed_lock_if_present(
    kv: &dyn KvStore,
    config: &UpdateLockConfig,
    lock_key_file: &Path,
) -> Result<(), UpdateError> {
    let identifier = match tokio::fs::read_to_string(lock_key_file).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(UpdateError::Io(e.to_string())),
    };

    let result = kv.compare_delete(&config.key, identifier.trim()).await;
    let _ = tokio::fs::remove_file(lock_key_file).await;
    result.map(|_| ()).map_err(UpdateError::from)
}

/// What startup decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupOutcome {
    /// No rebuild needed; the process should proceed to steady state.
    Ready,
    /// The source had drifted; rebuild ran and the restart script has
    /// already been invoked. The caller should exit without serving.
    RebuiltAndRestarting,
}

/// Configuration for [`run_startup`].
pub struct StartupConfig {
    pub lock_file: PathBuf,
    pub lock_key_file: PathBuf,
    /// `builds:frontend-ssr-web:hash`.
    pub hash_key: String,
    pub update_lock: UpdateLockConfig,
}

/// Run the startup phase (§4.10). Returns the held [`LocalLock`] alongside
/// the outcome — the caller keeps it alive for the rest of the process so
/// a concurrent instance can't start, and lets it drop (removing
/// `updater.lock`) on clean shutdown.
pub async fn run_startup(
    config: &StartupConfig,
    kv: &dyn KvStore,
    revision_source: &dyn RevisionSource,
    rebuild: &dyn ScriptRunner,
    restart: &dyn ScriptRunner,
) -> Result<(StartupOutcome, LocalLock), UpdateError> {
    let lock = LocalLock::acquire(config.lock_file.clone())?;

    let current = revision_source.current_revision().await?;
    let previous = kv.set_get(&config.hash_key, &current).await?;
    let rebuild_required = previous.as_deref() != Some(current.as_str());

    if rebuild_required {
        rebuild.run().await?;
        restart.run().await?;
        return Ok((StartupOutcome::RebuiltAndRestarting, lock));
    }

    release_distributed_lock_if_present(kv, &config.update_lock, &config.lock_key_file).await?;
    Ok((StartupOutcome::Ready, lock))
}

/// Connects to a discovered primary. Mirrors
/// [`ssr_integrations::Connector`] but lives here too since the update
/// coordinator reconnects independently of the request-scoped holder.
pub type Connector =
    Box<dyn Fn(Endpoint, Duration) -> BoxFuture<'static, Result<Arc<dyn KvStore>, UpdateError>> + Send + Sync>;

/// Configuration for the steady-state loop.
pub struct SteadyStateConfig {
    pub sentinels: Vec<Endpoint>,
    pub discovery: DiscoveryConfig,
    pub connect_timeout: Duration,
    /// `updates:frontend-ssr-web`.
    pub updates_channel: String,
    pub update_lock: UpdateLockConfig,
    pub lock_key_file: PathBuf,
    /// Pause after receiving an update signal, before racing for the lock
    /// (§4.10 step 2: "allow upstream artifact cache to settle").
    pub post_message_pause: Duration,
    /// Backoff before reconnecting after any non-cancellation error
    /// (§4.10 step 4).
    pub reconnect_backoff: Duration,
}

impl SteadyStateConfig {
    pub fn new(sentinels: Vec<Endpoint>) -> Self {
        Self {
            sentinels,
            discovery: DiscoveryConfig::default(),
            connect_timeout: Duration::from_secs(2),
            updates_channel: "updates:frontend-ssr-web".into(),
            update_lock: UpdateLockConfig::default(),
            lock_key_file: PathBuf::from("updater-lock-key.txt"),
            post_message_pause: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(4),
        }
    }
}

/// What the steady-state loop decided to do. It only ever ends one way —
/// by restarting — or by observing cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteadyStateOutcome {
    Restarting,
}

/// Run the steady-state loop (§4.10) until it restarts the process or the
/// caller cancels. Any error other than cancellation is treated as primary
/// failover or a transient disconnect: log it, wait
/// `reconnect_backoff`, and reconnect from scratch.
pub async fn run_steady_state(
    config: &SteadyStateConfig,
    sentinel_client: Arc<dyn SentinelClient>,
    connector: &Connector,
    restart: &dyn ScriptRunner,
    cancel: CancellationToken,
) -> Result<SteadyStateOutcome, UpdateError> {
    loop {
        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        match run_steady_state_once(config, &sentinel_client, connector, restart, &cancel).await {
            Ok(outcome) => return Ok(outcome),
            Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
            Err(err) => {
                tracing::warn!(error = %err, "update coordinator lost its connection; reconnecting");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
                    _ = tokio::time::sleep(config.reconnect_backoff) => {}
                }
            }
        }
    }
}

async fn run_steady_state_once(
    config: &SteadyStateConfig,
    sentinel_client: &Arc<dyn SentinelClient>,
    connector: &Connector,
    restart: &dyn ScriptRunner,
    cancel: &CancellationToken,
) -> Result<SteadyStateOutcome, UpdateError> {
    let primary = discover_primary(
        sentinel_client.clone(),
        &config.sentinels,
        &config.discovery,
        cancel.clone(),
    )
    .await
    .map_err(|e| UpdateError::Store(e.to_string()))?;

    let kv = connector(primary, config.connect_timeout).await?;
    let mut subscription = kv
        .subscribe(&config.updates_channel)
        .await
        .map_err(UpdateError::from)?;

    tokio::select! {
        _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
        result = subscription.recv() => result.map_err(UpdateError::from)?,
    }

    tokio::select! {
        _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
        _ = tokio::time::sleep(config.post_message_pause) => {}
    }

    match acquire_distributed_lock(kv.as_ref(), &config.update_lock, &config.lock_key_file, cancel).await {
        Ok(_) => {}
        Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
        Err(err) => tracing::warn!(error = %err, "proceeding to restart without the distributed lock"),
    }

    restart.run().await?;
    Ok(SteadyStateOutcome::Restarting)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssr_kvstore::{Subscription, StoreError};
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct FakeKv {
        values: StdMutex<std::collections::HashMap<String, String>>,
    }

    impl FakeKv {
        fn new() -> Self {
            Self {
                values: StdMutex::new(std::collections::HashMap::new()),
            }
        }
    }

    impl KvStore for FakeKv {
        fn get<'a>(&'a self, key: &'a str) -> ssr_kvstore::BoxFuture<'a, Result<Option<String>, StoreError>> {
            let value = self.values.lock().unwrap().get(key).cloned();
            Box::pin(async move { Ok(value) })
        }
        fn set<'a>(&'a self, key: &'a str, value: &'a str) -> ssr_kvstore::BoxFuture<'a, Result<(), StoreError>> {
            self.values.lock().unwrap().insert(key.to_string(), value.to_string());
            Box::pin(async { Ok(()) })
        }
        fn set_get<'a>(
            &'a self,
            key: &'a str,
            value: &'a str,
        ) -> ssr_kvstore::BoxFuture<'a, Result<Option<String>, StoreError>> {
            let old = self
                .values
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Box::pin(async move { Ok(old) })
        }
        fn set_nx_ex<'a>(
            &'a self,
            key: &'a str,
            value: &'a str,
            _ttl_secs: u64,
        ) -> ssr_kvstore::BoxFuture<'a, Result<bool, StoreError>> {
            let mut values = self.values.lock().unwrap();
            let acquired = if values.contains_key(key) {
                false
            } else {
                values.insert(key.to_string(), value.to_string());
                true
            };
            Box::pin(async move { Ok(acquired) })
        }
        fn compare_delete<'a>(
            &'a self,
            key: &'a str,
            expected: &'a str,
        ) -> ssr_kvstore::BoxFuture<'a, Result<bool, StoreError>> {
            let mut values = self.values.lock().unwrap();
            let deleted = if values.get(key).map(|v| v.as_str()) == Some(expected) {
                values.remove(key);
                true
            } else {
                false
            };
            Box::pin(async move { Ok(deleted) })
        }
        fn subscribe<'a>(
            &'a self,
            _channel: &'a str,
        ) -> ssr_kvstore::BoxFuture<'a, Result<Box<dyn Subscription>, StoreError>> {
            Box::pin(async { Err(StoreError::new("not implemented in fake")) })
        }
    }

    struct FixedRevision(&'static str);
    impl RevisionSource for FixedRevision {
        fn current_revision(&self) -> BoxFuture<'_, Result<String, UpdateError>> {
            Box::pin(async { Ok(self.0.to_string()) })
        }
    }

    struct CountingScript {
        calls: std::sync::atomic::AtomicUsize,
    }
    impl CountingScript {
        fn new() -> Self {
            Self {
                calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }
    impl ScriptRunner for CountingScript {
        fn run(&self) -> BoxFuture<'_, Result<(), UpdateError>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn local_lock_collision_is_already_running() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("updater.lock");
        let _first = LocalLock::acquire(path.clone()).unwrap();
        let second = LocalLock::acquire(path);
        assert!(matches!(second, Err(UpdateError::AlreadyRunning)));
    }

    #[test]
    fn local_lock_is_removed_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("updater.lock");
        {
            let _lock = LocalLock::acquire(path.clone()).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn startup_rebuilds_when_revision_differs_from_stored_hash() {
        let dir = tempdir().unwrap();
        let kv = FakeKv::new();
        kv.set("builds:frontend-ssr-web:hash", "old-rev").await.unwrap();

        let config = StartupConfig {
            lock_file: dir.path().join("updater.lock"),
            lock_key_file: dir.path().join("updater-lock-key.txt"),
            hash_key: "builds:frontend-ssr-web:hash".into(),
            update_lock: UpdateLockConfig::default(),
        };
        let rebuild = CountingScript::new();
        let restart = CountingScript::new();

        let (outcome, _lock) = run_startup(&config, &kv, &FixedRevision("new-rev"), &rebuild, &restart)
            .await
            .unwrap();

        assert_eq!(outcome, StartupOutcome::RebuiltAndRestarting);
        assert_eq!(rebuild.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(restart.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn startup_releases_distributed_lock_when_revision_unchanged() {
        let dir = tempdir().unwrap();
        let kv = FakeKv::new();
        kv.set("builds:frontend-ssr-web:hash", "same-rev").await.unwrap();
        kv.set("updates:frontend-ssr-web:lock", "stale-id").await.unwrap();

        let lock_key_file = dir.path().join("updater-lock-key.txt");
        tokio::fs::write(&lock_key_file, "stale-id").await.unwrap();

        let config = StartupConfig {
            lock_file: dir.path().join("updater.lock"),
            lock_key_file: lock_key_file.clone(),
            hash_key: "builds:frontend-ssr-web:hash".into(),
            update_lock: UpdateLockConfig::default(),
        };
        let rebuild = CountingScript::new();
        let restart = CountingScript::new();

        let (outcome, _lock) = run_startup(&config, &kv, &FixedRevision("same-rev"), &rebuild, &restart)
            .await
            .unwrap();

        assert_eq!(outcome, StartupOutcome::Ready);
        assert_eq!(rebuild.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(!lock_key_file.exists());
        assert!(kv.get("updates:frontend-ssr-web:lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn acquire_distributed_lock_persists_the_same_identifier_the_store_holds() {
        let dir = tempdir().unwrap();
        let kv = FakeKv::new();
        let lock_key_file = dir.path().join("updater-lock-key.txt");
        let config = UpdateLockConfig::default();

        let identifier = acquire_distributed_lock(&kv, &config, &lock_key_file, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(identifier.len(), 22);
        let file_contents = tokio::fs::read_to_string(&lock_key_file).await.unwrap();
        assert_eq!(file_contents, identifier);
        let stored = kv.get(&config.key).await.unwrap().unwrap();
        assert_eq!(stored, identifier);
    }

    #[tokio::test]
    async fn second_acquisition_retries_until_first_releases() {
        let dir = tempdir().unwrap();
        let kv = Arc::new(FakeKv::new());
        let config = Arc::new(UpdateLockConfig {
            retry_interval: Duration::from_millis(5),
            ..UpdateLockConfig::default()
        });
        let lock_key_file_a = dir.path().join("a.txt");
        let lock_key_file_b = dir.path().join("b.txt");

        let held = acquire_distributed_lock(kv.as_ref(), &config, &lock_key_file_a, &CancellationToken::new())
            .await
            .unwrap();

        let kv2 = kv.clone();
        let config2 = config.clone();
        let second_handle = tokio::spawn(async move {
            acquire_distributed_lock(kv2.as_ref(), &config2, &lock_key_file_b, &CancellationToken::new()).await
        });

        tokio::time::sleep(Duration::from_millis(15)).await;
        kv.compare_delete(&config.key, &held).await.unwrap();

        let second = second_handle.await.unwrap().unwrap();
        assert_eq!(second.len(), 22);
    }

    #[tokio::test]
    async fn release_is_a_noop_when_no_lock_key_file_exists() {
        let dir = tempdir().unwrap();
        let kv = FakeKv::new();
        let missing = dir.path().join("updater-lock-key.txt");
        release_distributed_lock_if_present(&kv, &UpdateLockConfig::default(), &missing)
            .await
            .unwrap();
    }
}
