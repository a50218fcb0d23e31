//! nbexpd - NetBackup metrics exporter daemon.
//!
//! Connects to a NetBackup master server, negotiates the REST API version
//! and serves storage and job metrics on `/metrics` in Prometheus format.

mod access_log;
mod handlers;
mod render;
mod state;

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use nbexp_core::config::{HttpTuning, TlsPolicy};
use nbexp_core::{ApiVersion, ConfigSnapshot, Credential, Exporter, Instrumentation, TlsFloor, TracingSink};

use access_log::AccessLogLayer;
use state::AppState;

// ============================================================
// CLI
// ============================================================

/// NetBackup metrics exporter.
#[derive(Parser)]
#[command(name = "nbexpd", about = "NetBackup metrics exporter", version)]
struct Args {
    /// Listen address for /metrics and /health.
    #[arg(long, default_value = "0.0.0.0:2112", env = "NBU_LISTEN")]
    listen: String,

    /// Master server REST base URL, e.g. https://master:1556/netbackup.
    #[arg(long, env = "NBU_URL")]
    url: String,

    /// API key sent in the Authorization header.
    #[arg(long, env = "NBU_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Pin the API version (e.g. "12.0") instead of negotiating it.
    #[arg(long, env = "NBU_API_VERSION")]
    api_version: Option<ApiVersion>,

    /// How far back to look for finished jobs (e.g. "5m", "1h").
    #[arg(long, default_value = "5m", env = "NBU_SCRAPE_WINDOW", value_parser = parse_duration)]
    scrape_window: Duration,

    /// Lifetime of cached storage metrics; "0s" disables the cache.
    #[arg(long, default_value = "5m", env = "NBU_CACHE_TTL", value_parser = parse_duration)]
    cache_ttl: Duration,

    /// Timeout of one HTTP request to the master server.
    #[arg(long, default_value = "30s", env = "NBU_REQUEST_TIMEOUT", value_parser = parse_duration)]
    request_timeout: Duration,

    /// Upper bound for serving one /metrics or /health request.
    #[arg(long, default_value = "60s", env = "NBU_SCRAPE_TIMEOUT", value_parser = parse_duration)]
    scrape_timeout: Duration,

    /// Retries after the first attempt for transient failures.
    #[arg(long, default_value = "3", env = "NBU_MAX_RETRIES")]
    max_retries: u32,

    /// How long shutdown waits for in-flight requests.
    #[arg(long, default_value = "10s", env = "NBU_DRAIN_TIMEOUT", value_parser = parse_duration)]
    drain_timeout: Duration,

    /// Minimum TLS version ("1.2" or "1.3").
    #[arg(long, default_value = "1.2", env = "NBU_TLS_MIN")]
    tls_min: TlsFloor,

    /// Skip server certificate verification (self-signed lab masters only).
    #[arg(long, env = "NBU_INSECURE_SKIP_VERIFY")]
    insecure_skip_verify: bool,

    /// Report internal operations (version probes, page fetches) as log events.
    #[arg(long, env = "NBU_TRACE_OPERATIONS")]
    trace_operations: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Parses a human-readable duration ("500ms", "30s", "5m", "1h", bare seconds).
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num_str, unit_ms) = if let Some(num) = s.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = s.strip_suffix('s') {
        (num, 1000)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, 60 * 1000)
    } else if let Some(num) = s.strip_suffix('h') {
        (num, 60 * 60 * 1000)
    } else {
        (s, 1000)
    };

    num_str
        .trim()
        .parse::<u64>()
        .map(|n| Duration::from_millis(n.saturating_mul(unit_ms)))
        .map_err(|e| format!("invalid duration '{}': {}", s, e))
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["nbexpd", "nbexp_core", "nbexp"] {
        match format!("{}={}", target, level).parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("invalid log directive for {}: {}", target, e),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_config(args: &Args) -> Result<ConfigSnapshot, nbexp_core::ConfigError> {
    ConfigSnapshot::builder(args.url.clone(), Credential::new(args.api_key.clone()))
        .api_version(args.api_version.clone())
        .scrape_window(args.scrape_window)
        .cache_ttl(args.cache_ttl)
        .http(HttpTuning {
            request_timeout: args.request_timeout,
            max_retries: args.max_retries,
            drain_timeout: args.drain_timeout,
            ..HttpTuning::default()
        })
        .tls(TlsPolicy {
            min_version: args.tls_min,
            insecure_skip_verify: args.insecure_skip_verify,
        })
        .build()
}

// ============================================================
// Main
// ============================================================

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(async_main(args)) {
        error!("{}", e);
        process::exit(1);
    }
}

async fn async_main(args: Args) -> Result<(), String> {
    let config = build_config(&args).map_err(|e| format!("invalid configuration: {}", e))?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        url = %config.base_url(),
        scrape_window_s = config.scrape_window().as_secs(),
        cache_ttl_s = config.cache_ttl().as_secs(),
        "nbexpd starting"
    );

    let instrumentation = if args.trace_operations {
        Instrumentation::new(Arc::new(TracingSink))
    } else {
        Instrumentation::disabled()
    };

    let startup = CancellationToken::new();
    let exporter = tokio::select! {
        r = Exporter::start(&startup, Arc::new(config), instrumentation) => {
            r.map_err(|e| format!("failed to connect to master server: {}", e))?
        }
        _ = shutdown_signal() => {
            info!("interrupted during startup");
            return Ok(());
        }
    };
    let exporter = Arc::new(exporter);
    let state = AppState::new(exporter.clone(), args.scrape_timeout);
    let shutdown = state.shutdown.clone();

    // (axum layers: last .layer() = outermost; request flows outside-in)
    let app = Router::new()
        .route("/metrics", get(handlers::handle_metrics))
        .route("/health", get(handlers::handle_health))
        .with_state(state)
        .layer(AccessLogLayer)
        .layer(CompressionLayer::new())
        .into_make_service_with_connect_info::<SocketAddr>();

    let addr: SocketAddr = args
        .listen
        .parse()
        .map_err(|e| format!("invalid listen address '{}': {}", args.listen, e))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind {}: {}", addr, e))?;
    info!(%addr, "listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        shutdown.cancel();
    });
    let served = server.await;

    // Requests are already cancelled; give the exporter its own budget.
    if let Err(e) = exporter.shutdown(&CancellationToken::new()).await {
        warn!(error = %e, "exporter shutdown incomplete");
    }
    served.map_err(|e| format!("server error: {}", e))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
