use anyhow::{Context, Result};
use axum::{Router, routing::get};
use lazy_static::lazy_static;
use prometheus::{GaugeVec, TextEncoder, register_gauge_vec};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::cgroup::CgroupStats;

lazy_static! {
    static ref CPU_USAGE: GaugeVec = register_gauge_vec!(
        "namespace_quota_cpu_usage_usec",
        "Current CPU usage in microseconds for the namespace",
        &["namespace"]
    )
    .expect("failed to register namespace_quota_cpu_usage_usec");
    static ref CPU_LIMIT: GaugeVec = register_gauge_vec!(
        "namespace_quota_cpu_limit_usec",
        "CPU limit in microseconds for the namespace",
        &["namespace"]
    )
    .expect("failed to register namespace_quota_cpu_limit_usec");
    static ref CPU_THROTTLED: GaugeVec = register_gauge_vec!(
        "namespace_quota_cpu_throttled_periods",
        "Number of CPU throttled periods for the namespace",
        &["namespace"]
    )
    .expect("failed to register namespace_quota_cpu_throttled_periods");
    static ref MEMORY_USAGE: GaugeVec = register_gauge_vec!(
        "namespace_quota_memory_usage_bytes",
        "Current memory usage in bytes for the namespace",
        &["namespace"]
    )
    .expect("failed to register namespace_quota_memory_usage_bytes");
    static ref MEMORY_LIMIT: GaugeVec = register_gauge_vec!(
        "namespace_quota_memory_limit_bytes",
        "Memory limit in bytes for the namespace",
        &["namespace"]
    )
    .expect("failed to register namespace_quota_memory_limit_bytes");
    static ref OOM_KILLS: GaugeVec = register_gauge_vec!(
        "namespace_quota_oom_kills_total",
        "Total number of OOM kills for the namespace",
        &["namespace"]
    )
    .expect("failed to register namespace_quota_oom_kills_total");
}

/// Refresh every gauge for one namespace. Called at the end of each
/// successful reconcile; series for deleted namespaces are left behind
/// until restart.
pub fn update_namespace_metrics(
    namespace: &str,
    stats: &CgroupStats,
    cpu_limit_usec: u64,
    memory_limit_bytes: u64,
) {
    CPU_USAGE
        .with_label_values(&[namespace])
        .set(stats.cpu_usage_usec as f64);
    CPU_LIMIT
        .with_label_values(&[namespace])
        .set(cpu_limit_usec as f64);
    CPU_THROTTLED
        .with_label_values(&[namespace])
        .set(stats.cpu_throttled as f64);
    MEMORY_USAGE
        .with_label_values(&[namespace])
        .set(stats.memory_usage_bytes as f64);
    MEMORY_LIMIT
        .with_label_values(&[namespace])
        .set(memory_limit_bytes as f64);
    OOM_KILLS
        .with_label_values(&[namespace])
        .set(stats.oom_kills as f64);
}

/// Spawn the Prometheus scrape endpoint as a background task.
pub fn start_server(port: u16) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = serve(port).await {
            error!("Metrics server error: {:#}", e);
        }
    })
}

async fn serve(port: u16) -> Result<()> {
    let app = Router::new().route("/metrics", get(render_metrics));
    let addr = format!("0.0.0.0:{}", port);

    info!("Starting metrics server on {}", addr);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn render_metrics() -> String {
    TextEncoder::new()
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_track_latest_values() {
        let stats = CgroupStats {
            cpu_usage_usec: 123,
            cpu_throttled: 4,
            memory_usage_bytes: 5678,
            oom_kills: 2,
        };
        update_namespace_metrics("tenant-a", &stats, 400_000, 8_589_934_592);

        assert_eq!(CPU_USAGE.with_label_values(&["tenant-a"]).get(), 123.0);
        assert_eq!(CPU_LIMIT.with_label_values(&["tenant-a"]).get(), 400_000.0);
        assert_eq!(CPU_THROTTLED.with_label_values(&["tenant-a"]).get(), 4.0);
        assert_eq!(MEMORY_USAGE.with_label_values(&["tenant-a"]).get(), 5678.0);
        assert_eq!(
            MEMORY_LIMIT.with_label_values(&["tenant-a"]).get(),
            8_589_934_592.0
        );
        assert_eq!(OOM_KILLS.with_label_values(&["tenant-a"]).get(), 2.0);

        // A later reconcile overwrites, not accumulates
        update_namespace_metrics("tenant-a", &CgroupStats::default(), 0, 0);
        assert_eq!(CPU_USAGE.with_label_values(&["tenant-a"]).get(), 0.0);
    }

    #[tokio::test]
    async fn exposition_includes_namespace_series() {
        update_namespace_metrics("tenant-b", &CgroupStats::default(), 200_000, 1024);

        let body = render_metrics().await;
        assert!(body.contains("# TYPE namespace_quota_cpu_limit_usec gauge"));
        assert!(body.contains("namespace_quota_cpu_limit_usec{namespace=\"tenant-b\"} 200000"));
    }
}
