//! Murmur broker binary

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use murmur::{Broker, Config, Server};

#[derive(Parser, Debug)]
#[command(name = "murmur", version, about = "Single-node message broker")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "MURMUR_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured listen port
    #[arg(short, long, env = "MURMUR_PORT")]
    port: Option<u16>,

    /// Override the configured bind address
    #[arg(short, long, env = "MURMUR_BIND")]
    bind: Option<String>,

    /// Log filter directive (e.g. "info" or "murmur=debug")
    #[arg(long, env = "MURMUR_LOG", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log))
        .init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    // Recovery must finish before the listener binds; a failure here
    // means the durable state is unusable and the process must not serve.
    let broker = match Broker::open(config) {
        Ok(broker) => Arc::new(broker),
        Err(e) => {
            error!(error = %e, "broker startup failed");
            return ExitCode::FAILURE;
        }
    };
    broker.start_offset_flush();

    let server = match Server::bind(broker).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to bind listener");
            return ExitCode::FAILURE;
        }
    };

    info!("murmur broker started");
    if let Err(e) = server.run().await {
        error!(error = %e, "server terminated");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn load_config(cli: &Cli) -> murmur::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(bind) = &cli.bind {
        config.server.host = bind.clone();
    }
    config.validate()?;
    Ok(config)
}
