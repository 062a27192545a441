//! wgbridge binary
//!
//! Parses flags and the tunnel configuration, wires process signals to the
//! gateway's cancellation token, and runs until shutdown.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use tracing::{debug, info};
use wgbridge::proxy::socks5::Credentials;
use wgbridge::{Configuration, Gateway};

/// Userspace WireGuard-to-proxy gateway
#[derive(Parser, Debug)]
#[command(name = "wgbridge", disable_help_flag = true, disable_version_flag = true)]
struct Args {
    /// Path to the tunnel configuration file
    #[arg(short = 'c', default_value = "./config.conf", value_name = "path")]
    config: String,

    /// SOCKS proxy bind address; empty disables
    #[arg(short = 's', default_value = "127.0.0.1:1080", value_name = "ip:port")]
    socks: String,

    /// HTTP proxy bind address; empty disables
    #[arg(short = 'h', default_value = "", value_name = "ip:port")]
    http: String,

    /// SOCKS5 username:password credentials
    #[arg(short = 'a', value_name = "user:pass")]
    auth: Option<String>,

    /// Connectivity test URL override
    #[arg(short = 't', value_name = "url", hide = true)]
    test_url: Option<String>,

    /// Enable verbose logging
    #[arg(short = 'v')]
    verbose: bool,

    /// Show version information and exit
    #[arg(long = "version")]
    version: bool,

    /// Print help
    #[arg(long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        println!("wgbridge {}", wgbridge::VERSION);
        return Ok(());
    }

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    debug!(config = %args.config, "loading configuration");
    let conf = Configuration::load(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config))?;

    let mut gateway = Gateway::new(conf);

    if !args.socks.is_empty() {
        let addr: SocketAddr = args
            .socks
            .parse()
            .with_context(|| format!("invalid SOCKS bind address {:?}", args.socks))?;
        gateway = gateway.with_socks_bind(addr);
        debug!(%addr, "SOCKS proxy enabled");
    }

    if !args.http.is_empty() {
        let addr: SocketAddr = args
            .http
            .parse()
            .with_context(|| format!("invalid HTTP bind address {:?}", args.http))?;
        gateway = gateway.with_http_bind(addr);
        debug!(%addr, "HTTP proxy enabled");
    }

    if let Some(auth) = &args.auth {
        let (username, password) = auth
            .split_once(':')
            .context("credentials must be in user:pass form")?;
        gateway = gateway.with_credentials(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
    }

    if let Some(url) = &args.test_url {
        gateway = gateway.with_test_url(url.clone());
    }

    let token = gateway.cancel_token();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(err) => {
                    tracing::warn!("failed to install SIGTERM handler: {}", err);
                    let _ = ctrl_c.await;
                    token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("signal received, shutting down");
        token.cancel();
    });

    info!(version = wgbridge::VERSION, "wgbridge starting");
    gateway.run().await?;
    info!("wgbridge shut down cleanly");
    Ok(())
}
