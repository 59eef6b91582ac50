use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::limits::{self, CPU_PERIOD_USEC};

/// Controllers that must be delegated down the slice hierarchy.
pub const REQUIRED_CONTROLLERS: &str = "+cpu +memory +pids";

/// Accounting counters read back from a slice's cgroup files.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CgroupStats {
    pub cpu_usage_usec: u64,
    pub cpu_throttled: u64,
    pub memory_usage_bytes: u64,
    pub oom_kills: u64,
}

/// Applies a property to a systemd unit. Split out as a trait so tests can
/// record invocations instead of shelling out.
#[async_trait]
pub trait PropertySetter: Send + Sync {
    async fn set_property(&self, unit: &str, property: &str) -> Result<()>;
}

/// Runs `systemctl set-property` through nsenter in PID 1's namespaces.
/// systemd owns the slice cgroups and silently ignores direct writes to
/// cpu.max / memory.max, so limits must go through the unit database.
/// `--runtime` keeps the change volatile: the declaration stream is the
/// source of truth, not systemd's persistent config.
pub struct NsenterSystemd;

#[async_trait]
impl PropertySetter for NsenterSystemd {
    async fn set_property(&self, unit: &str, property: &str) -> Result<()> {
        let output = Command::new("nsenter")
            .args(["-t", "1", "-m", "-u", "-n", "--"])
            .args(["systemctl", "set-property", unit, property, "--runtime"])
            .output()
            .await
            .context("failed to spawn nsenter")?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "systemctl set-property {} {} failed ({}): {}{}",
                unit,
                property,
                output.status,
                stdout.trim(),
                stderr.trim()
            );
        }
        Ok(())
    }
}

/// Manages the per-namespace slice lifecycle under a parent slice:
/// directory creation, controller delegation, limit application via systemd,
/// removal, and counter reads.
pub struct SliceManager {
    cgroup_root: PathBuf,
    slice_prefix: String,
    systemd: Box<dyn PropertySetter>,
}

impl SliceManager {
    pub fn new(cgroup_root: impl Into<PathBuf>, slice_prefix: impl Into<String>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            slice_prefix: slice_prefix.into(),
            systemd: Box::new(NsenterSystemd),
        }
    }

    /// Replace the systemd backend, for tests.
    pub fn with_setter(mut self, setter: Box<dyn PropertySetter>) -> Self {
        self.systemd = setter;
        self
    }

    /// Prefix with the ".slice" suffix stripped, used to build child names.
    fn prefix_base(&self) -> &str {
        self.slice_prefix
            .strip_suffix(".slice")
            .unwrap_or(&self.slice_prefix)
    }

    /// Unit name for a namespace slice: `<prefix>-<namespace>.slice`.
    pub fn slice_name(&self, namespace: &str) -> String {
        format!("{}-{}.slice", self.prefix_base(), namespace)
    }

    pub fn parent_path(&self) -> PathBuf {
        self.cgroup_root.join(&self.slice_prefix)
    }

    /// Filesystem path of a namespace slice, nested under the parent:
    /// `<root>/<prefix>.slice/<prefix>-<namespace>.slice`.
    pub fn slice_path(&self, namespace: &str) -> PathBuf {
        self.parent_path().join(self.slice_name(namespace))
    }

    pub fn slice_exists(&self, namespace: &str) -> bool {
        self.slice_path(namespace).exists()
    }

    /// Create the slice for a namespace and apply its limits. Idempotent:
    /// re-running with the same limits issues the same mkdir/set-property
    /// sequence and succeeds.
    pub async fn ensure_slice(
        &self,
        namespace: &str,
        cpu_limit: &str,
        memory_limit: &str,
    ) -> Result<()> {
        let slice_path = self.slice_path(namespace);
        debug!(
            "Ensuring slice {} (cpu={:?}, memory={:?})",
            slice_path.display(),
            cpu_limit,
            memory_limit
        );

        self.ensure_parent_slice()
            .with_context(|| format!("failed to ensure parent slice for {}", namespace))?;

        fs::create_dir_all(&slice_path)
            .with_context(|| format!("failed to create slice directory for {}", namespace))?;

        // An empty slice has no descendants, so this write may fail with
        // EINVAL until the first task lands. systemd enables the needed
        // controllers on placement either way.
        if let Err(e) = enable_controllers(&slice_path) {
            warn!("Failed to enable controllers in {}: {:#}", slice_path.display(), e);
        }

        if !cpu_limit.is_empty() {
            let quota_usec = limits::parse_cpu(cpu_limit)
                .with_context(|| format!("failed to parse CPU limit for {}", namespace))?;
            self.set_cpu_limit(namespace, quota_usec)
                .await
                .with_context(|| format!("failed to set CPU limit for {}", namespace))?;
        }

        if !memory_limit.is_empty() {
            let memory_bytes = limits::parse_memory(memory_limit)
                .with_context(|| format!("failed to parse memory limit for {}", namespace))?;
            self.set_memory_limit(namespace, memory_bytes)
                .await
                .with_context(|| format!("failed to set memory limit for {}", namespace))?;
        }

        info!("Slice {} configured", self.slice_name(namespace));
        Ok(())
    }

    /// Remove a namespace slice directory. A slice that does not exist is
    /// success: the desired state is "no slice".
    pub fn remove_slice(&self, namespace: &str) -> Result<()> {
        let slice_path = self.slice_path(namespace);

        if !slice_path.exists() {
            debug!("Slice {} does not exist, nothing to remove", slice_path.display());
            return Ok(());
        }

        fs::remove_dir(&slice_path)
            .with_context(|| format!("failed to remove slice for {}", namespace))?;

        info!("Slice {} removed", self.slice_name(namespace));
        Ok(())
    }

    /// Express the quota as a CPUQuota percentage: 100000 µs/period == 100%.
    async fn set_cpu_limit(&self, namespace: &str, quota_usec: u64) -> Result<()> {
        let unit = self.slice_name(namespace);
        let cpu_percent = quota_usec * 100 / CPU_PERIOD_USEC;

        self.systemd
            .set_property(&unit, &format!("CPUQuota={}%", cpu_percent))
            .await?;

        info!("CPU limit set for {}: {}%", unit, cpu_percent);
        Ok(())
    }

    async fn set_memory_limit(&self, namespace: &str, memory_bytes: u64) -> Result<()> {
        let unit = self.slice_name(namespace);
        let memory = limits::format_memory_for_systemd(memory_bytes);

        self.systemd
            .set_property(&unit, &format!("MemoryMax={}", memory))
            .await?;

        info!("Memory limit set for {}: {}", unit, memory);
        Ok(())
    }

    /// Read usage counters for a namespace slice. Missing or malformed
    /// counters read as zero; metrics collection never fails a reconcile.
    pub fn read_stats(&self, namespace: &str) -> CgroupStats {
        let slice_path = self.slice_path(namespace);
        let mut stats = CgroupStats::default();

        if let Ok(content) = fs::read_to_string(slice_path.join("cpu.stat")) {
            for line in content.lines() {
                let mut fields = line.split_whitespace();
                match (fields.next(), fields.next()) {
                    (Some("usage_usec"), Some(v)) => {
                        stats.cpu_usage_usec = v.parse().unwrap_or(0);
                    }
                    (Some("nr_throttled"), Some(v)) => {
                        stats.cpu_throttled = v.parse().unwrap_or(0);
                    }
                    _ => {}
                }
            }
        }

        if let Ok(content) = fs::read_to_string(slice_path.join("memory.current")) {
            stats.memory_usage_bytes = content.trim().parse().unwrap_or(0);
        }

        if let Ok(content) = fs::read_to_string(slice_path.join("memory.events")) {
            for line in content.lines() {
                let mut fields = line.split_whitespace();
                if let (Some("oom_kill"), Some(v)) = (fields.next(), fields.next()) {
                    stats.oom_kills = v.parse().unwrap_or(0);
                    break;
                }
            }
        }

        stats
    }

    /// Read back the limits the kernel currently enforces for a slice.
    /// `max` (unlimited) reads as None, as does an absent slice.
    pub fn current_limits(&self, namespace: &str) -> (Option<u64>, Option<u64>) {
        let slice_path = self.slice_path(namespace);

        let cpu_quota = fs::read_to_string(slice_path.join("cpu.max"))
            .ok()
            .and_then(|content| {
                let first = content.split_whitespace().next()?.to_string();
                if first == "max" { None } else { first.parse().ok() }
            });

        let memory_bytes = fs::read_to_string(slice_path.join("memory.max"))
            .ok()
            .and_then(|content| {
                let trimmed = content.trim();
                if trimmed == "max" { None } else { trimmed.parse().ok() }
            });

        (cpu_quota, memory_bytes)
    }

    fn ensure_parent_slice(&self) -> Result<()> {
        let parent = self.parent_path();
        fs::create_dir_all(&parent)
            .with_context(|| format!("failed to create parent slice {}", parent.display()))?;
        enable_controllers(&parent)
            .with_context(|| format!("failed to enable controllers in {}", parent.display()))
    }
}

fn enable_controllers(path: &Path) -> Result<()> {
    let subtree_control = path.join("cgroup.subtree_control");
    fs::write(&subtree_control, REQUIRED_CONTROLLERS)?;
    Ok(())
}
