use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pkg_agent::{Controller, SliceManager, k8s, metrics};

#[derive(Parser, Debug)]
#[command(
    name = "brasa-agent",
    about = "Node agent reconciling NamespaceQuotas into systemd slices"
)]
struct Cli {
    /// Path to kubeconfig file (uses in-cluster config if empty)
    #[arg(long, default_value = "")]
    kubeconfig: String,

    /// Root path for the cgroup v2 filesystem
    #[arg(long, default_value = "/sys/fs/cgroup")]
    cgroup_root: String,

    /// Parent slice that namespace slices nest under
    #[arg(long, default_value = "brasa.slice")]
    slice_prefix: String,

    /// Port for the Prometheus metrics server
    #[arg(long, default_value_t = 9090)]
    metrics_port: u16,

    /// Log level (debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (filter, level_ok) = match EnvFilter::try_new(&cli.log_level) {
        Ok(f) => (f, true),
        Err(_) => (EnvFilter::new("info"), false),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    if !level_ok {
        warn!("Invalid log level '{}', defaulting to info", cli.log_level);
    }

    info!(
        "Starting brasa-agent (cgroup_root={}, slice_prefix={}, metrics_port={})",
        cli.cgroup_root, cli.slice_prefix, cli.metrics_port
    );

    metrics::start_server(cli.metrics_port);

    let client = k8s::build_client(&cli.kubeconfig).await?;
    let slices = SliceManager::new(&cli.cgroup_root, &cli.slice_prefix);
    let controller = Controller::new(client, slices);

    let run = tokio::spawn(controller.clone().run());

    shutdown_signal().await?;
    info!("Received shutdown signal");
    controller.shutdown();
    run.await??;

    info!("Agent shutdown complete");
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
