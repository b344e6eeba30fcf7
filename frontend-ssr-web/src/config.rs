//! CLI flags and recognized environment variables (§6).

use std::path::PathBuf;

use clap::Parser;
use ssr_sentinel::Endpoint;

/// frontend-ssr-web: server-side rendering router, build pipeline, and
/// update coordinator.
#[derive(Parser, Debug, Clone)]
#[command(name = "frontend-ssr-web", version)]
pub struct Cli {
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    #[arg(long)]
    pub ssl_certfile: Option<PathBuf>,

    #[arg(long)]
    pub ssl_keyfile: Option<PathBuf>,

    /// Reuse whatever is already under `build/routes/...` instead of
    /// deleting and rebuilding it.
    #[arg(long)]
    pub reuse_artifacts: bool,

    /// Run the build pipeline and exit without binding a listener.
    #[arg(long)]
    pub no_serve: bool,

    #[arg(long, default_value_t = ssr_build::DEFAULT_BUILD_PARALLELISM)]
    pub build_parallelism: usize,

    #[arg(long, default_value_t = ssr_core::router::DEFAULT_ASYNC_CONCURRENCY)]
    pub path_resolve_parallelism: usize,

    /// Internal: re-exec target for the sibling schema-regeneration process
    /// forked at startup (§4.9). Not meant to be passed by an operator.
    #[arg(long, hide = true)]
    pub regenerate_schema: bool,
}

/// Environment variables recognized by the server (§6). Parsed once at
/// startup; absence of an optional one just narrows what the server can
/// do (no database routes, no store-backed routes, no sitemap).
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub rqlite_ips: Vec<String>,
    pub redis_sentinels: Vec<Endpoint>,
    pub root_frontend_url: Option<String>,
    pub environment: String,
    pub webhook_urls: Vec<(String, String)>,
}

fn parse_endpoint(raw: &str) -> Option<Endpoint> {
    let (host, port) = raw.trim().rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some(Endpoint::new(host, port))
}

impl EnvConfig {
    /// Read the recognized environment variables from the process
    /// environment. `WEBHOOK_*` variables are collected generically so new
    /// alert channels don't need code changes here.
    pub fn from_env() -> Self {
        let rqlite_ips = std::env::var("RQLITE_IPS")
            .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let redis_sentinels = std::env::var("REDIS_IPS")
            .map(|raw| raw.split(',').filter_map(parse_endpoint).collect())
            .unwrap_or_default();

        let root_frontend_url = std::env::var("ROOT_FRONTEND_URL").ok();
        let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "production".into());

        let webhook_urls = std::env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix("WEBHOOK_")
                    .map(|name| (name.to_lowercase(), value))
            })
            .collect();

        Self {
            rqlite_ips,
            redis_sentinels,
            root_frontend_url,
            environment,
            webhook_urls,
        }
    }

    pub fn is_dev(&self) -> bool {
        self.environment == "dev"
    }
}
