use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arch_config::ArchConfig;
use arch_import::{bind, port_in_use, CommandImporter};
use arch_studio::logging::setup_logging;
use clap::Parser;
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "arch_import", about = "Receives finished 3D assets and imports them into the host tool")]
struct Args {
    /// JSON configuration file (the `import` section is used)
    #[arg(long, env = "ARCH_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    port: Option<u16>,

    /// Import command; the uploaded file path is appended as the last argument
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    command: Option<Vec<String>>,

    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ArchConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let mut import = config.import.clone();
    if let Some(port) = args.port {
        import.port = port;
    }
    if let Some(command) = args.command {
        import.command = command;
    }
    let level = args.log_level.unwrap_or(config.log_level);

    match setup_logging(&config.log_dir, &level, "arch_import") {
        Ok(path) => info!("Logging to {}", path.display()),
        Err(e) => eprintln!("Failed to set up logging: {e}"),
    }

    if port_in_use(&import.host, import.port) {
        warn!(
            "Port {} is already in use; another instance is already running",
            import.port
        );
        eprintln!("Another import listener is already running on port {}", import.port);
        return Ok(());
    }
    if import.command.is_empty() {
        anyhow::bail!("no import command configured");
    }

    let addr: SocketAddr = format!("{}:{}", import.host, import.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", import.host, import.port))?;
    let importer = Arc::new(CommandImporter::new(import.command.clone()));
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let (bound, server) = bind(addr, importer, shutdown)
        .with_context(|| format!("failed to bind {addr}"))?;

    println!("Import listener on http://{bound}/upload -> {}", import.command.join(" "));
    info!("Import listener on {bound}");
    server.await.context("server error")?;
    Ok(())
}
