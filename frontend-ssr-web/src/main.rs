//! Entry point: parses CLI flags and environment, realizes the route
//! graph, and serves it — TLS enabled only when both `--ssl-certfile` and
//! `--ssl-keyfile` are supplied.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use clap::Parser;
use tokio::sync::Mutex;

use frontend_ssr_web::alerts::AlertDispatcher;
use frontend_ssr_web::config::{Cli, EnvConfig};
use frontend_ssr_web::routes::{self, build_app, queued_descriptors, AppState, SlugRecord, SlugRegistry};
use ssr_build::BuildScheduler;
use ssr_core::health::{HealthBuilder, HealthIndicator, HealthStatus};
use ssr_core::lifecycle::{InFlightTracker, ShutdownCoordinator};
use ssr_core::router::Router;
use ssr_openapi::SchemaCache;

/// Resolving a real canonical-slug record requires a database client, which
/// this workspace deliberately never implements — only the trait contract
/// in `ssr-kvstore` does. Until one is wired in, every slug resolves to
/// itself.
struct NullSlugRegistry;

impl SlugRegistry for NullSlugRegistry {
    fn resolve<'a>(&'a self, _slug: &'a str) -> routes::BoxFuture<'a, Option<SlugRecord>> {
        Box::pin(async { None })
    }
}

struct AlwaysUp(&'static str);

impl HealthIndicator for AlwaysUp {
    fn name(&self) -> &str {
        self.0
    }

    async fn check(&self) -> HealthStatus {
        HealthStatus::Up
    }
}

/// The sibling process §4.9 describes: re-exec of this same binary with
/// `--regenerate-schema`. Builds the one demonstration route's path item,
/// publishes it under every supported encoding, and exits — never serves
/// traffic.
async fn regenerate_schema_and_exit(schema_dir: &std::path::Path) -> ! {
    let mut paths = serde_json::Map::new();
    paths.insert(
        "/shared/management/hello_world".into(),
        serde_json::json!({
            "get": {
                "summary": "Static greeting",
                "responses": {"200": {"description": "OK"}},
            },
            "post": {
                "summary": "Echoes the posted message as pong",
                "responses": {"200": {"description": "OK"}},
            },
        }),
    );
    let spec = ssr_openapi::build_spec(
        "frontend-ssr-web",
        env!("CARGO_PKG_VERSION"),
        paths,
        Default::default(),
    );
    let bytes = serde_json::to_vec(&spec).unwrap_or_default();

    match ssr_openapi::regenerate(schema_dir, &bytes).await {
        Ok(()) => {
            tracing::info!("schema regeneration complete");
            std::process::exit(0);
        }
        Err(err) => {
            tracing::error!(error = %err, "schema regeneration failed");
            std::process::exit(1);
        }
    }
}

/// Fork the sibling regeneration process (§4.9 step 2) without blocking
/// startup; the serving process only ever reads the files it publishes.
fn spawn_schema_regeneration() {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            tracing::warn!(error = %err, "could not locate current executable; schema will stay 503");
            return;
        }
    };
    match tokio::process::Command::new(exe).arg("--regenerate-schema").spawn() {
        Ok(mut child) => {
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) if status.success() => tracing::info!("schema regeneration process exited cleanly"),
                    Ok(status) => tracing::warn!(%status, "schema regeneration process exited with an error"),
                    Err(err) => tracing::warn!(error = %err, "failed to wait on schema regeneration process"),
                }
            });
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to spawn schema regeneration process");
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let env = EnvConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let schema_dir = std::env::temp_dir().join("frontend-ssr-web-openapi");

    if cli.regenerate_schema {
        regenerate_schema_and_exit(&schema_dir).await;
    }

    tracing::info!(
        environment = %env.environment,
        host = %cli.host,
        port = cli.port,
        "starting frontend-ssr-web"
    );

    if let Err(err) = ssr_openapi::cleanup_stale(&schema_dir).await {
        tracing::warn!(error = %err, "failed to clean up stale schema snapshots");
    }
    spawn_schema_regeneration();

    if !env.redis_sentinels.is_empty() && !env.is_dev() {
        tracing::warn!(
            "redis sentinels configured but no key-value wire client is built into this binary; \
             the failover-aware update coordinator will not run"
        );
    }

    let router_mutex = Arc::new(Mutex::new(Router::<AppState>::with_async_concurrency(
        cli.path_resolve_parallelism,
    )));
    let scheduler = BuildScheduler::new(router_mutex.clone(), cli.build_parallelism);
    let slug_registry: Arc<dyn SlugRegistry> = Arc::new(NullSlugRegistry);

    if let Err(err) = scheduler.run(queued_descriptors(slug_registry.clone())).await {
        tracing::error!(error = %err, "route build failed");
        std::process::exit(1);
    }
    drop(scheduler);

    if cli.no_serve {
        tracing::info!("--no-serve set; build completed, exiting without binding a listener");
        return;
    }

    let router = Arc::try_unwrap(router_mutex)
        .unwrap_or_else(|_| panic!("router still shared after build completed"))
        .into_inner();
    let state = AppState {
        router: Arc::new(router),
        slug_registry,
    };

    let schema_cache = SchemaCache::new(schema_dir);
    let health = HealthBuilder::new().check(AlwaysUp("router")).build();
    let app = build_app(state, schema_cache, health);

    let addr: SocketAddr = match format!("{}:{}", cli.host, cli.port).parse() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(error = %err, "invalid --host/--port");
            std::process::exit(1);
        }
    };

    let in_flight = InFlightTracker::new();
    let shutdown = Arc::new(ShutdownCoordinator::new(in_flight));
    let alerts = Arc::new(AlertDispatcher::new(env.webhook_urls.clone()));
    let handle = Handle::new();

    {
        let handle = handle.clone();
        let shutdown = shutdown.clone();
        let alerts = alerts.clone();
        tokio::spawn(async move {
            ShutdownCoordinator::wait_for_signal().await;
            tracing::info!("shutdown signal received");
            handle.graceful_shutdown(Some(Duration::from_secs(10)));
            shutdown.shutdown(async move { alerts.drain().await }).await;
        });
    }

    let serve_result = match (&cli.ssl_certfile, &cli.ssl_keyfile) {
        (Some(cert), Some(key)) => {
            let tls_config = match axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await {
                Ok(config) => config,
                Err(err) => {
                    tracing::error!(error = %err, "failed to load TLS certificate/key");
                    std::process::exit(1);
                }
            };
            tracing::info!(%addr, "serving with TLS");
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
        _ => {
            tracing::info!(%addr, "serving without TLS");
            axum_server::bind(addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
    };

    if let Err(err) = serve_result {
        tracing::error!(error = %err, "server exited with an error");
        std::process::exit(1);
    }
}
