use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use sqlgate_proxy::config::ProxyConfig;
use sqlgate_proxy::server::ProxyServer;

#[derive(Parser, Debug)]
#[clap(author, version, about = "sqlgate MySQL access proxy")]
struct Args {
    /// Config file path
    #[clap(short, long, env = "SQLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[clap(short, long, env = "SQLGATE_LISTEN")]
    listen: Option<String>,

    /// Log filter used when RUST_LOG is not set
    #[clap(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Initialize logging
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, &args.log_level),
    );

    // Load configuration
    let mut config = ProxyConfig::load(args.config.as_deref())?;

    // Override config with command-line arguments
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
        config.validate()?;
    }

    // Create proxy server
    let server = Arc::new(ProxyServer::new(config)?);

    // Start server
    let addr = server.start().await?;
    info!("sqlgate proxy for {} ready on {}", server.config().database.name, addr);

    // Wait for Ctrl+C
    tokio::signal::ctrl_c().await?;

    // Stop server
    server.stop();

    info!("Server stopped");

    Ok(())
}
