//! grocery-mcp - MCP server for Greek grocery sites
//!
//! Serves one site per process over stdio (or HTTP with the `http`
//! feature). Logs go to stderr or a file; stdout carries the protocol.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use grocery_mcp::server::{SERVER_NAME, SERVER_VERSION};
use grocery_mcp::{Language, McpServer, SiteConfig, SiteKind, Storefront};

/// MCP server for Sklavenitis, Skroutz and E-Fresh.
#[derive(Parser, Debug)]
#[command(name = "grocery-mcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Site to serve.
    #[arg(long, value_enum)]
    site: SiteKind,

    /// Session file (default: ~/.<site>_session.json).
    #[arg(long)]
    session_file: Option<PathBuf>,

    /// Manually exported cookie file (default: ~/.<site>_cookies.json).
    #[arg(long)]
    cookie_file: Option<PathBuf>,

    /// Site base URL override.
    #[arg(long)]
    base_url: Option<String>,

    /// Interface language for sites that have one.
    #[arg(long, value_enum, default_value_t = Language::El)]
    language: Language,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Log file, written as JSON lines (default: stderr).
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Serve JSON-RPC over HTTP on this address instead of stdio.
    #[cfg(feature = "http")]
    #[arg(long)]
    http: Option<std::net::SocketAddr>,
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let default = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // Never stdout: it carries the protocol.
    match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_target(true).with_writer(Arc::new(file)))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}

fn site_config(args: &Args) -> anyhow::Result<SiteConfig> {
    let mut config = SiteConfig::from_env(args.site)?;
    if let Some(path) = &args.session_file {
        config.session_file = path.clone();
    }
    if let Some(path) = &args.cookie_file {
        config.cookie_file = Some(path.clone());
    }
    if let Some(url) = &args.base_url {
        config.base_url = url.clone();
    }
    config.language = args.language;
    Ok(config)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = site_config(&args)?;
    if config.credentials.is_none() {
        tracing::warn!(
            "{} / {} not set; login needs explicit credentials or a cookie file",
            args.site.env_var("EMAIL"),
            args.site.env_var("PASSWORD")
        );
    }

    let storefront = Storefront::from_config(&config).context("creating HTTP client")?;
    let server = McpServer::new(storefront);

    #[cfg(feature = "http")]
    if let Some(addr) = args.http {
        grocery_mcp::http_server::serve(Arc::new(server), addr).await?;
        return Ok(());
    }

    server.run_stdio().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("{:#}", e);
        return ExitCode::FAILURE;
    }

    tracing::info!(site = %args.site, "Starting {} v{}", SERVER_NAME, SERVER_VERSION);

    match run(args).await {
        Ok(()) => {
            tracing::info!("Server exited cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Server error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
