use clap::Parser;
use pinokiod_host::{HostConfig, boot, run as run_host};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "pinokiod", about = "Headless orchestrator for scripted AI apps")]
struct Cli {
    /// Port to serve the HTTP command surface on (default 8000, or $PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Override the platform root (same as $PINOKIO_ROOT)
    #[arg(long, value_name = "PATH")]
    root: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    boot::init_tracing();
    if let Err(err) = run().await {
        tracing::error!(error = %err, "host failed");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = HostConfig::from_env()?;
    if let Some(port) = cli.port {
        cfg = cfg.with_port(port);
    }
    if let Some(root) = cli.root {
        cfg.root_override = Some(root);
    }
    run_host(cfg).await
}
