use chrono::Utc;
use std::collections::BTreeSet;

use super::ResourceMonitor;
use crate::error::MonitorError;
use crate::types::ResourceSample;

/// Counters from the aggregate `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Stateful CPU sampler. Usage is the busy share of jiffies since the last call.
#[derive(Debug, Default)]
pub struct CpuSampler {
    prev: Option<CpuTimes>,
}

impl CpuSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// CPU busy percentage since the previous call. The first call primes the
    /// sampler and reports 0.
    pub fn sample_percent(&mut self) -> Result<f32, MonitorError> {
        let now = read_proc_stat()?;
        Ok(self.advance(now))
    }

    fn advance(&mut self, now: CpuTimes) -> f32 {
        let Some(prev) = self.prev.replace(now) else {
            return 0.0;
        };
        let d_idle = now.idle.saturating_sub(prev.idle);
        let d_total = now.total.saturating_sub(prev.total);
        if d_total == 0 {
            return 0.0;
        }
        let busy = 1.0 - (d_idle as f64 / d_total as f64);
        (busy * 100.0).clamp(0.0, 100.0) as f32
    }
}

fn parse_proc_stat(s: &str) -> Result<CpuTimes, MonitorError> {
    // cpu user nice system idle iowait irq softirq ...
    let line = s
        .lines()
        .next()
        .ok_or_else(|| MonitorError::Parse("empty /proc/stat".into()))?;
    let vals: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if vals.len() < 4 {
        return Err(MonitorError::Parse(format!("short cpu line: {line}")));
    }
    Ok(CpuTimes { idle: vals[3], total: vals.iter().sum() })
}

#[cfg(target_os = "linux")]
fn read_proc_stat() -> Result<CpuTimes, MonitorError> {
    parse_proc_stat(&std::fs::read_to_string("/proc/stat")?)
}

#[cfg(not(target_os = "linux"))]
fn read_proc_stat() -> Result<CpuTimes, MonitorError> {
    Err(MonitorError::Unsupported)
}

/// Lowercased names of running processes, from `/proc/<pid>/comm`.
#[cfg(target_os = "linux")]
async fn running_processes() -> Result<BTreeSet<String>, MonitorError> {
    let mut names = BTreeSet::new();
    let mut dir = tokio::fs::read_dir("/proc").await?;
    while let Some(entry) = dir.next_entry().await? {
        let file_name = entry.file_name();
        let Some(pid) = file_name.to_str() else { continue };
        if !pid.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        // Processes can exit between listing and reading.
        if let Ok(comm) = tokio::fs::read_to_string(entry.path().join("comm")).await {
            let name = comm.trim().to_lowercase();
            if !name.is_empty() {
                names.insert(name);
            }
        }
    }
    Ok(names)
}

#[cfg(not(target_os = "linux"))]
async fn running_processes() -> Result<BTreeSet<String>, MonitorError> {
    Err(MonitorError::Unsupported)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct GpuUsage {
    percent: f32,
    vram_used_mb: f32,
}

/// Busiest device reported by `nvidia-smi`: the highest utilization and the
/// highest memory use, each taken across all GPUs.
fn parse_gpu_usage(stdout: &str) -> Result<GpuUsage, MonitorError> {
    let field = |raw: &str, what: &str, line: &str| -> Result<f32, MonitorError> {
        raw.trim()
            .trim_end_matches(['%', 'B', 'i', 'M'])
            .trim()
            .parse()
            .map_err(|_| MonitorError::Parse(format!("gpu {what} `{line}`")))
    };

    let mut usage = GpuUsage::default();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (util, mem) = line.split_once(',').unwrap_or((line, "0"));
        usage.percent = usage.percent.max(field(util, "utilization", line)?);
        usage.vram_used_mb = usage.vram_used_mb.max(field(mem, "memory", line)?);
    }
    Ok(usage)
}

/// Samples the local host: CPU from `/proc/stat`, processes from `/proc`, and
/// GPU utilization and memory from `nvidia-smi`. Hosts without `nvidia-smi`
/// report an idle GPU.
#[derive(Debug, Default)]
pub struct HostMonitor {
    cpu: CpuSampler,
    gpu_tool_missing: bool,
}

impl HostMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    async fn gpu_usage(&mut self) -> Result<GpuUsage, MonitorError> {
        if self.gpu_tool_missing {
            return Ok(GpuUsage::default());
        }
        let output = tokio::process::Command::new("nvidia-smi")
            .args(["--query-gpu=utilization.gpu,memory.used", "--format=csv,noheader,nounits"])
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => parse_gpu_usage(&String::from_utf8_lossy(&out.stdout)),
            Ok(out) => Err(MonitorError::Parse(format!("nvidia-smi exited with {}", out.status))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("nvidia-smi not found, GPU usage reported as idle");
                self.gpu_tool_missing = true;
                Ok(GpuUsage::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl ResourceMonitor for HostMonitor {
    async fn sample(&mut self) -> Result<ResourceSample, MonitorError> {
        let cpu_percent = self.cpu.sample_percent()?;
        let gpu = self.gpu_usage().await?;
        let running_process_names = running_processes().await?;
        Ok(ResourceSample {
            gpu_percent: gpu.percent.clamp(0.0, 100.0),
            cpu_percent,
            vram_used_mb: gpu.vram_used_mb,
            running_process_names,
            sampled_at: Utc::now(),
        })
    }
}
