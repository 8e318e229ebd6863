use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use arch_config::ArchConfig;
use arch_engine::Orchestrator;
use arch_studio::logging::setup_logging;
use arch_types::ModelKind;
use arch_web::{bind, AppState, Endpoint};
use clap::Parser;
use log::info;

#[derive(Parser, Debug)]
#[command(name = "arch_web", about = "Streaming text-to-3D pipeline server")]
struct Args {
    /// JSON configuration file
    #[arg(long, env = "ARCH_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Inference worker threads
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> anyhow::Result<ArchConfig> {
    let mut config = ArchConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(workers) = args.workers {
        config.worker_threads = workers;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    match setup_logging(&config.log_dir, &config.log_level, "arch_web") {
        Ok(path) => info!("Logging to {}", path.display()),
        Err(e) => eprintln!("Failed to set up logging: {e}"),
    }

    for kind in [
        ModelKind::TextToImage,
        ModelKind::BackgroundRemoval,
        ModelKind::Reconstruction,
        ModelKind::MeshDecoding,
    ] {
        let names: Vec<&str> = config.models_of(kind).map(|m| m.name.as_str()).collect();
        info!("{kind}: {}", names.join(", "));
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))?;
    let state = AppState::new(Orchestrator::from_config(config)?);
    state.orchestrator.warm_up().await;

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
    };
    let (bound, server) = bind(addr, state.clone(), shutdown)
        .with_context(|| format!("failed to bind {addr}"))?;

    println!("Arch pipeline server listening on http://{bound}");
    println!("Available endpoints:");
    println!("  GET  /health                - Health check");
    println!("  GET  /api/status            - Model slots, cache and channels");
    for endpoint in Endpoint::ALL {
        println!("  WS   {}", endpoint.path());
    }
    info!("Listening on {bound}");

    server.await.context("server error")?;
    state.orchestrator.shutdown().await;
    Ok(())
}
