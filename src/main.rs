use anyhow::Result;
use clap::Parser;
use mysql_wire_server::config::AppConfig;
use mysql_wire_server::dispatcher::BasicDispatcher;
use mysql_wire_server::state::AppState;
use mysql_wire_server::{api, metrics, server, telemetry};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on for MySQL clients (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to configuration file
    #[arg(long, default_value = "mysql-wire.yaml")]
    config: String,

    /// Management API port
    #[arg(long, default_value_t = 3001)]
    api_port: u16,

    /// Do not start the management API
    #[arg(long)]
    no_api: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_found = Path::new(&args.config).exists();
    let mut config = if config_found {
        AppConfig::load(&args.config)?
    } else {
        AppConfig::default()
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let _telemetry = telemetry::init_telemetry(config.telemetry.as_ref())?;
    if config_found {
        info!("Loaded {} accounts from {}", config.accounts.len(), args.config);
    } else {
        warn!("Config file {} not found, using defaults", args.config);
    }
    if config.accounts.is_empty() {
        warn!("No accounts configured; every login will be refused");
    }

    let metrics_handle = metrics::init_metrics()?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::new(config).with_metrics(metrics_handle);

    if !args.no_api {
        let api_port = args.api_port;
        let api_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = api::start_api_server(api_port, api_state).await {
                tracing::error!("Management API failed: {}", e);
            }
        });
    }

    info!("Starting MySQL wire server on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    tokio::select! {
        res = server::serve(listener, state, Arc::new(BasicDispatcher)) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    }
}
