//! # Policy Proxy
//!
//! A rule-driven HTTP/HTTPS forward proxy.
//!
//! ## Features
//!
//! - **Rules**: DOMAIN-SUFFIX, WILDCARD, REGEXP and GEOIP matching, with `!` negation
//! - **HTTPS Support**: CONNECT tunneling, direct or through an upstream proxy
//! - **Upstream Proxies**: Named proxies chained per rule
//! - **Localhost Gating**: DIRECT traffic to loopback is refused unless allowed
//! - **Flexible Logging**: Configurable log levels and output destinations
//!
//! ## Usage
//!
//! ```bash
//! # Run with config.yaml next to the executable (created on first run)
//! policy-proxy
//!
//! # Run with custom config
//! policy-proxy -c /path/to/config.yaml
//!
//! # Increase verbosity
//! policy-proxy -vvvv  # trace level
//! ```

use clap::Parser;
use policy_proxy::config::AppConfig;
use policy_proxy::logging;
use policy_proxy::proxy::ProxyServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// A rule-driven HTTP/HTTPS forward proxy.
#[derive(Parser, Debug)]
#[command(name = "policy-proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Listen address as host:port (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace, -vvvv trace+deps)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    /// Converts verbosity count to log level string
    fn log_level(&self) -> Option<&'static str> {
        if self.quiet {
            return Some("error");
        }
        match self.verbose {
            0 => None, // Use config default
            1 => Some("info"),
            2 => Some("debug"),
            _ => Some("trace"),
        }
    }

    /// Whether to include verbose dependency logging
    fn trace_deps(&self) -> bool {
        self.verbose >= 4
    }
}

/// Application entry point.
#[tokio::main]
async fn main() {
    let args = Args::parse();

    let loaded = match AppConfig::load_or_init(args.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    let mut config = loaded.config;

    let _log_guard = match logging::init_logging(&config.logging, args.log_level(), args.trace_deps()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };

    if loaded.created {
        info!(path = %loaded.path.display(), "config.yaml not found, created an example config file");
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path = %loaded.path.display(),
        rules = config.rules.len(),
        proxies = config.proxies.len(),
        "Starting policy-proxy"
    );

    if let Some(ref listen) = args.listen {
        match parse_listen(listen) {
            Some((host, port)) => {
                config.host = host;
                config.port = port;
                info!(listen = %listen, "Listen address overridden via CLI");
            }
            None => {
                error!(listen = %listen, "Invalid listen address, expected host:port");
                std::process::exit(1);
            }
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        }
    });

    let server = Arc::new(ProxyServer::new(config));
    if let Err(e) = server.run(shutdown_rx).await {
        error!(error = %e, "Proxy server error");
        std::process::exit(1);
    }
}

/// Splits a `host:port` listen address.
fn parse_listen(listen: &str) -> Option<(String, u16)> {
    let (host, port) = listen.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok().filter(|p| *p != 0)?))
}
