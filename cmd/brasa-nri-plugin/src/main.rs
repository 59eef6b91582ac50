use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use nri::NRI;
use tokio::net::UnixStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pkg_plugin::isolator::{DEFAULT_PLUGIN_IDX, DEFAULT_PLUGIN_NAME};
use pkg_plugin::{IsolatorPlugin, QuotaCache};

/// Socket the container runtime listens on for external NRI plugins.
const NRI_SOCKET: &str = "/var/run/nri/nri.sock";

const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "brasa-nri-plugin",
    about = "NRI plugin routing containers into namespace slices"
)]
struct Cli {
    /// NRI plugin name
    #[arg(long, default_value = DEFAULT_PLUGIN_NAME)]
    name: String,

    /// NRI plugin index (determines invocation order)
    #[arg(long, default_value = DEFAULT_PLUGIN_IDX)]
    idx: String,

    /// Path to kubeconfig file (uses in-cluster config if empty)
    #[arg(long, default_value = "")]
    kubeconfig: String,

    /// Log level (debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json, text)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (filter, level_ok) = match EnvFilter::try_new(&cli.log_level) {
        Ok(f) => (f, true),
        Err(_) => (EnvFilter::new("info"), false),
    };
    if cli.log_format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    if !level_ok {
        warn!("Invalid log level '{}', defaulting to info", cli.log_level);
    }

    info!("Starting brasa-nri-plugin (name={}, idx={})", cli.name, cli.idx);

    // Populate the cache before accepting runtime callbacks so the first
    // CreateContainer already sees the known quotas.
    let cache = QuotaCache::new();
    cache
        .start(&cli.kubeconfig)
        .await
        .context("failed to start quota cache")?;
    if !cache.wait_ready(CACHE_SYNC_TIMEOUT).await {
        warn!("Quota cache sync timed out, starting with an empty cache");
    }
    info!("Namespaces with quotas: {:?}", cache.namespaces());

    let socket = UnixStream::connect(NRI_SOCKET)
        .await
        .with_context(|| format!("failed to connect to NRI socket {}", NRI_SOCKET))?;

    let plugin = IsolatorPlugin::new(cache);
    let (nri, mut join) = NRI::new(socket, plugin, &cli.name, &cli.idx)
        .await
        .context("failed to establish NRI connection")?;
    nri.register()
        .await
        .context("failed to register with the container runtime")?;
    info!("Registered with container runtime");

    tokio::select! {
        _ = &mut join => {
            // Exit non-zero so the supervisor restarts us; Synchronize on
            // reconnect rebuilds the runtime's view.
            error!("NRI connection closed by the runtime");
            std::process::exit(1);
        }
        res = shutdown_signal() => {
            res?;
            info!("Received shutdown signal");
        }
    }

    info!("Plugin shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    Ok(())
}
