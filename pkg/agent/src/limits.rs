use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::Regex;

/// cgroup v2 CPU accounting period in microseconds.
pub const CPU_PERIOD_USEC: u64 = 100_000;

static MEMORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\d+(?:\.\d+)?)\s*(Ki|Mi|Gi|Ti|K|M|G|T)?$").unwrap()
});

/// Convert a CPU limit in cores (e.g. "4", "0.5") into a microseconds quota
/// per 100 ms period (e.g. 400000, 50000).
pub fn parse_cpu(cpu: &str) -> Result<u64> {
    let cpu = cpu.trim();
    if cpu.is_empty() {
        bail!("empty CPU value");
    }

    let cores: f64 = cpu
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid CPU value '{}'", cpu))?;

    if !cores.is_finite() || cores <= 0.0 {
        bail!("CPU value must be positive: {}", cpu);
    }

    Ok((cores * CPU_PERIOD_USEC as f64).round() as u64)
}

/// Convert a memory limit string into bytes. Suffixes K/M/G/T and their
/// Ki/Mi/Gi/Ti forms are all binary multiples of 1024; no suffix means bytes.
pub fn parse_memory(memory: &str) -> Result<u64> {
    let memory = memory.trim();
    if memory.is_empty() {
        bail!("empty memory value");
    }

    let caps = MEMORY_RE
        .captures(memory)
        .ok_or_else(|| anyhow::anyhow!("invalid memory format: {}", memory))?;

    let value: f64 = caps[1]
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid memory value: {}", memory))?;

    let multiplier: u64 = match caps.get(2).map(|m| m.as_str().to_ascii_uppercase()) {
        None => 1,
        Some(s) => match s.as_str() {
            "K" | "KI" => 1 << 10,
            "M" | "MI" => 1 << 20,
            "G" | "GI" => 1 << 30,
            "T" | "TI" => 1 << 40,
            other => bail!("unknown memory suffix: {}", other),
        },
    };

    Ok((value * multiplier as f64) as u64)
}

/// Render a byte count in the form systemd's MemoryMax accepts, using the
/// largest suffix that divides it exactly: "8G", "1536M", "512K", else bytes.
pub fn format_memory_for_systemd(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB && bytes % GB == 0 {
        format!("{}G", bytes / GB)
    } else if bytes >= MB && bytes % MB == 0 {
        format!("{}M", bytes / MB)
    } else if bytes >= KB && bytes % KB == 0 {
        format!("{}K", bytes / KB)
    } else {
        bytes.to_string()
    }
}
