use std::{path::PathBuf, time::Duration};

use clap::{Parser, builder::BoolishValueParser};
use eyre::Result;
use tracegate_config::{LoggingConfig, ReadinessMode, TracegateConfig};
use tracegate_node::TracegateNode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Forced exit deadline once shutdown has begun
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// tracegate: serves trace_block and trace_transaction from an indexer
/// database and proxies every other JSON-RPC method to the upstream node
#[derive(Parser, Debug)]
#[command(name = "tracegate")]
#[command(about = "Parity-style trace JSON-RPC adapter over an indexer database")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Interface to listen on
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Timeout for proxied and upstream requests, in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,

    /// Database connection URL; takes precedence over the individual DB_* settings
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    #[arg(long, env = "DB_HOST")]
    db_host: Option<String>,

    #[arg(long, env = "DB_PORT")]
    db_port: Option<u16>,

    #[arg(long, env = "DB_NAME")]
    db_name: Option<String>,

    #[arg(long, env = "DB_USER")]
    db_user: Option<String>,

    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    db_password: Option<String>,

    /// Maximum number of pooled database connections
    #[arg(long, env = "DB_POOL_SIZE")]
    db_pool_size: Option<u32>,

    #[arg(long, env = "DB_IDLE_TIMEOUT_MS")]
    db_idle_timeout_ms: Option<u64>,

    #[arg(long, env = "DB_CONNECTION_TIMEOUT_MS")]
    db_connection_timeout_ms: Option<u64>,

    /// Connect to the database over TLS
    #[arg(long, env = "DB_SSL", value_parser = BoolishValueParser::new())]
    db_ssl: Option<bool>,

    /// Verify the database server certificate when TLS is enabled
    #[arg(long, env = "DB_SSL_REJECT_UNAUTHORIZED", value_parser = BoolishValueParser::new())]
    db_ssl_reject_unauthorized: Option<bool>,

    /// Timeout for the primary trace query, in milliseconds
    #[arg(long, env = "DB_QUERY_TIMEOUT_MS")]
    db_query_timeout_ms: Option<u64>,

    /// Upstream node JSON-RPC URL
    #[arg(long, env = "EVMOS_RPC_URL")]
    upstream_url: Option<String>,

    /// Readiness mode: none, height or counts (alias per_block)
    #[arg(long, env = "TRACE_READY_MODE")]
    trace_ready_mode: Option<String>,

    /// Highest block considered fully traced
    #[arg(long, env = "TRACE_READY_HEIGHT")]
    trace_ready_height: Option<u64>,

    /// Blocks behind the upstream head considered fully traced
    #[arg(long, env = "TRACE_READY_LAG")]
    trace_ready_lag: Option<u64>,

    /// Log every not-ready decision at info level
    #[arg(long, env = "TRACE_READY_DEBUG", value_parser = BoolishValueParser::new())]
    trace_ready_debug: Option<bool>,

    /// Log level, overridden by RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_parser = ["human", "json"])]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = load_config(&cli).await?;
    let ignored_mode = apply_overrides(&cli, &mut config);

    // Initialize logging
    init_logging(&config.logging)?;

    tracing::info!("========================================");
    tracing::info!("Starting tracegate v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("========================================");
    match &cli.config {
        Some(path) => tracing::info!("Configuration loaded from: {:?}", path),
        None => tracing::info!("Using default configuration"),
    }
    if let Some(selector) = ignored_mode {
        tracing::warn!(selector, "Ignoring unrecognised TRACE_READY_MODE");
    }
    log_config_summary(&config);

    let mut node = TracegateNode::new(config)?;
    node.start().await?;
    tracing::info!("Press Ctrl+C to shutdown gracefully");

    let signal = shutdown_signal().await?;
    tracing::info!("Received {signal}, shutting down");

    match tokio::time::timeout(SHUTDOWN_GRACE, node.stop()).await {
        Ok(result) => result?,
        Err(_) => {
            tracing::error!("Shutdown did not finish within {SHUTDOWN_GRACE:?}; exiting");
            std::process::exit(1);
        }
    }
    node.wait_for_shutdown().await?;

    tracing::info!("tracegate stopped");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let json = logging.format == "json";

    tracing_subscriber::registry()
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_target(false)))
        .with((!json).then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_ansi(true)
        }))
        .with(filter)
        .try_init()?;

    Ok(())
}

async fn load_config(cli: &Cli) -> Result<TracegateConfig> {
    match &cli.config {
        Some(config_path) => TracegateConfig::load_from_file(config_path).await,
        None => Ok(TracegateConfig::default()),
    }
}

/// Layer CLI flags and environment variables over `config`.
///
/// Returns the readiness selector when it was not recognised and ignored.
fn apply_overrides(cli: &Cli, config: &mut TracegateConfig) -> Option<String> {
    let server = &mut config.server;
    if let Some(host) = &cli.host {
        server.host = host.clone();
    }
    if let Some(port) = cli.port {
        server.port = port;
    }
    if let Some(timeout) = cli.request_timeout_ms {
        server.request_timeout_ms = timeout;
        config.upstream.timeout_ms = timeout;
    }

    let db = &mut config.database;
    if cli.database_url.is_some() {
        db.url = cli.database_url.clone();
    }
    if let Some(host) = &cli.db_host {
        db.host = host.clone();
    }
    if let Some(port) = cli.db_port {
        db.port = port;
    }
    if let Some(name) = &cli.db_name {
        db.name = name.clone();
    }
    if cli.db_user.is_some() {
        db.user = cli.db_user.clone();
    }
    if cli.db_password.is_some() {
        db.password = cli.db_password.clone();
    }
    if let Some(size) = cli.db_pool_size {
        db.pool_size = size;
    }
    if let Some(timeout) = cli.db_idle_timeout_ms {
        db.idle_timeout_ms = timeout;
    }
    if let Some(timeout) = cli.db_connection_timeout_ms {
        db.connect_timeout_ms = timeout;
    }
    if let Some(ssl) = cli.db_ssl {
        db.ssl = ssl;
    }
    if let Some(verify) = cli.db_ssl_reject_unauthorized {
        db.ssl_reject_unauthorized = verify;
    }
    if let Some(timeout) = cli.db_query_timeout_ms {
        db.query_timeout_ms = timeout;
    }

    if let Some(url) = &cli.upstream_url {
        config.upstream.url = url.clone();
    }

    let readiness = &mut config.readiness;
    let mut ignored_mode = None;
    if let Some(selector) = &cli.trace_ready_mode {
        match ReadinessMode::from_selector(selector) {
            Some(mode) => readiness.mode = Some(mode),
            None => ignored_mode = Some(selector.clone()),
        }
    }
    if cli.trace_ready_height.is_some() {
        readiness.ready_height = cli.trace_ready_height;
    }
    if cli.trace_ready_lag.is_some() {
        readiness.lag = cli.trace_ready_lag;
    }
    if let Some(debug) = cli.trace_ready_debug {
        readiness.debug = debug;
    }

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }

    ignored_mode
}

fn log_config_summary(config: &TracegateConfig) {
    tracing::info!("Configuration summary:");
    tracing::info!("  - Listen address: {}", config.listen_addr());
    match &config.database.url {
        Some(_) => tracing::info!("  - Database: from DATABASE_URL"),
        None => tracing::info!(
            "  - Database: {}:{}/{}",
            config.database.host,
            config.database.port,
            config.database.name
        ),
    }
    tracing::info!("  - Database pool size: {}", config.database.pool_size);
    tracing::info!("  - Query timeout: {:?}", config.database.query_timeout());
    tracing::info!("  - Upstream: {}", config.upstream.url);
    tracing::info!("  - Upstream timeout: {:?}", config.upstream.timeout());
    tracing::info!(
        "  - Trace readiness: {}",
        config.readiness.effective_mode().as_str()
    );
}

async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("Ctrl+C")
    }
}
