use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use farcast::config::AppConfig;
use farcast::StreamingServer;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// farcast command line arguments
#[derive(Parser, Debug)]
#[command(name = "farcast")]
#[command(version, about = "Low-latency remote desktop streaming server", long_about = None)]
struct CliArgs {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// Listen port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Encryption passphrase (overrides config)
    #[arg(long, value_name = "PASSPHRASE")]
    passphrase: Option<String>,

    /// Maximum concurrent clients (overrides config)
    #[arg(long, value_name = "COUNT")]
    max_clients: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,
}

fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("farcast={}", level.as_str())));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level);

    tracing::info!("starting farcast v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(address) = args.address {
        config.network.bind_address = address;
    }
    if let Some(port) = args.port {
        config.network.port = port;
    }
    if let Some(passphrase) = args.passphrase {
        config.network.passphrase = Some(passphrase);
    }
    if let Some(max_clients) = args.max_clients {
        config.network.max_subscribers = max_clients;
    }

    // Synthetic sources and loopback codecs; display capture and hardware
    // encoder integrations plug in through StreamingServer::with_components
    let server = StreamingServer::new(config)?;
    server.start()?;

    if let Some(addr) = server.transport().local_addr() {
        tracing::info!(%addr, "accepting clients");
    }
    server.wait();
    Ok(())
}
