use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use receiveit::config::ConfigStore;
use receiveit::msd::MsdController;
use receiveit::state::AppState;
use receiveit::web;

/// Default configuration file
const DEFAULT_CONFIG_PATH: &str = "/etc/receiveit/config.json";

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// ReceiveIt command line arguments
#[derive(Parser, Debug)]
#[command(name = "receiveit")]
#[command(version, about = "USB gadget file drop box", long_about = None)]
struct CliArgs {
    /// Configuration file (written with defaults if missing)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// Backing image path (overrides config)
    #[arg(short = 'i', long, value_name = "FILE")]
    image: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting ReceiveIt v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args
        .config
        .or_else(|| std::env::var_os("RECEIVEIT_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    tracing::info!("Configuration file: {}", config_path.display());

    let config_store = ConfigStore::new(&config_path).await?;
    let mut config = (*config_store.get()).clone();

    // CLI overrides apply to this run only
    if let Some(addr) = args.address {
        config.web.bind_address = addr;
    }
    if let Some(port) = args.http_port {
        config.web.http_port = port;
    }
    if let Some(image) = args.image {
        config.storage.image_path = image.to_string_lossy().to_string();
    }

    let ip = config
        .web
        .bind_address
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", config.web.bind_address))?;
    let addr = SocketAddr::new(ip, config.web.http_port);

    let msd = Arc::new(MsdController::from_config(&config));
    tracing::info!("Backing image: {}", msd.image().image_path().display());

    // A failed gadget setup leaves the control plane usable
    if let Err(e) = msd.startup().await {
        tracing::error!("Startup sequence failed: {}", e);
    }

    let state = AppState::new(config_store, msd);
    let app = web::create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Server listening on http://{}", listener.local_addr()?);

    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    // The gadget stays bound so the device keeps working as a USB stick
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "receiveit=error,tower_http=error",
        LogLevel::Warn => "receiveit=warn,tower_http=warn",
        LogLevel::Info => "receiveit=info,tower_http=info",
        LogLevel::Verbose => "receiveit=debug,tower_http=info",
        LogLevel::Debug => "receiveit=debug,tower_http=debug",
        LogLevel::Trace => "receiveit=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
