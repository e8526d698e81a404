use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use carrot_core::{Broadcaster, DropEmpty, Hub, MiddlewarePipeline, PipelineContext};
use carrot_gateway::GatewayServer;

mod config;

use config::CarrotConfig;

#[derive(Parser)]
#[command(name = "carrot")]
#[command(version)]
#[command(about = "carrot: session-resumable WebSocket broadcast hub")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Listen address, overriding the config file
    #[arg(short, long, global = true)]
    addr: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub and its gateway (default)
    Serve,

    /// Write the default config to ~/.carrot/config.toml
    Init,

    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config, cli.addr).await,
        Commands::Serve => cmd_serve(&cli.config, cli.addr).await,
    }
}

fn resolve_config(config_path: &Option<PathBuf>, addr: Option<String>) -> Result<CarrotConfig> {
    let mut cfg = CarrotConfig::load(config_path)?;
    if let Some(addr) = addr {
        cfg.server.bind = addr;
    }
    Ok(cfg)
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("carrot initialized at {}", config_dir.display());
    println!("Set CARROT_SECRET or edit {} to configure the gateway.", config_path.display());
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>, addr: Option<String>) -> Result<()> {
    let cfg = resolve_config(config_path, addr)?;
    println!("{:#?}", cfg);
    Ok(())
}

async fn cmd_serve(config_path: &Option<PathBuf>, addr: Option<String>) -> Result<()> {
    let cfg = resolve_config(config_path, addr)?;
    info!("Starting carrot...");

    let cancel = CancellationToken::new();
    let hub_config = Arc::new(cfg.hub.clone());

    let (hub, handle) = Hub::new(hub_config.clone());
    let hub_task = hub.spawn(cancel.clone());

    let mut pipeline = MiddlewarePipeline::new(hub_config.pipeline_buffer);
    pipeline.register(Arc::new(DropEmpty));
    pipeline.register(Arc::new(Broadcaster));
    let ingress = pipeline.sender();
    let pipeline_task = pipeline.spawn(PipelineContext::new(handle.clone()), cancel.clone());

    let server = GatewayServer::new(cfg.server.clone(), handle, ingress, hub_config);
    let mut server_task = server.spawn(cancel.clone());

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal, shutting down...");
        }
        result = &mut server_task => {
            // The gateway only returns early on failure
            match result {
                Ok(Err(e)) => error!("Gateway failed: {:#}", e),
                Err(e) => error!("Gateway task panicked: {}", e),
                Ok(Ok(())) => warn!("Gateway stopped unexpectedly"),
            }
        }
    }
    cancel.cancel();

    let _ = hub_task.await;
    let _ = pipeline_task.await;
    if !server_task.is_finished() {
        let _ = server_task.await;
    }

    println!("carrot stopped.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
