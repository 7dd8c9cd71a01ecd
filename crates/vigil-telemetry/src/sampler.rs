//! The metrics-sampling seam and its procfs implementation.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use vigil_protocol::{CpuStats, DiskStats, LoadAverage, MemoryStats, SystemSnapshot};

/// Raised by a [`MetricsSampler`]. Always swallowed by the publisher.
#[derive(Debug, thiserror::Error)]
pub enum SamplingError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse {0}")]
    Parse(&'static str),

    #[error("sample took longer than {0:?}")]
    Timeout(std::time::Duration),

    #[error("sampler unavailable: {0}")]
    Unavailable(String),
}

/// Produces one snapshot of host metrics.
///
/// Injected into the [`TelemetryPublisher`](crate::TelemetryPublisher);
/// tests supply scripted samplers.
pub trait MetricsSampler: Send + Sync + 'static {
    fn sample(&self) -> impl Future<Output = Result<SystemSnapshot, SamplingError>> + Send;
}

// ---------------------------------------------------------------------------
// ProcfsSampler
// ---------------------------------------------------------------------------

/// Aggregate CPU jiffies from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Reads Linux procfs and `statvfs`.
///
/// CPU usage is the busy share since the previous sample; the very first
/// sample reports the average since boot.
pub struct ProcfsSampler {
    proc_root: PathBuf,
    mount_points: Vec<PathBuf>,
    previous_cpu: Mutex<Option<CpuTimes>>,
}

impl Default for ProcfsSampler {
    fn default() -> Self {
        Self::new(vec![PathBuf::from("/")])
    }
}

impl ProcfsSampler {
    pub fn new(mount_points: Vec<PathBuf>) -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            mount_points,
            previous_cpu: Mutex::new(None),
        }
    }

    /// Reads procfs files from `root` instead of `/proc`.
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    async fn read(&self, relative: &str) -> Result<String, SamplingError> {
        let path = self.proc_root.join(relative);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| SamplingError::Io {
                path: path.display().to_string(),
                source,
            })
    }

    fn cpu_usage(&self, now: CpuTimes) -> f64 {
        let mut previous = self
            .previous_cpu
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let (idle, total) = match *previous {
            Some(prev) if now.total > prev.total => {
                (now.idle.saturating_sub(prev.idle), now.total - prev.total)
            }
            _ => (now.idle, now.total),
        };
        *previous = Some(now);
        if total == 0 {
            return 0.0;
        }
        round2(100.0 * (1.0 - idle as f64 / total as f64))
    }
}

impl MetricsSampler for ProcfsSampler {
    async fn sample(&self) -> Result<SystemSnapshot, SamplingError> {
        let stat = self.read("stat").await?;
        let meminfo = self.read("meminfo").await?;
        let loadavg = self.read("loadavg").await?;
        let uptime = self.read("uptime").await?;
        let hostname = self
            .read("sys/kernel/hostname")
            .await
            .map(|h| h.trim().to_string())
            .unwrap_or_default();

        let (times, cores) = parse_cpu(&stat)?;
        let cpu = CpuStats {
            usage_percent: self.cpu_usage(times),
            cores,
        };

        let disk = self
            .mount_points
            .iter()
            .filter_map(|mount| match disk_stats(mount) {
                Ok(stats) => Some(stats),
                Err(e) => {
                    tracing::debug!(mount = %mount.display(), error = %e, "statvfs failed");
                    None
                }
            })
            .collect();

        Ok(SystemSnapshot {
            hostname,
            uptime_secs: parse_uptime(&uptime)?,
            cpu,
            memory: parse_meminfo(&meminfo)?,
            disk,
            load: parse_loadavg(&loadavg)?,
        })
    }
}

fn parse_cpu(stat: &str) -> Result<(CpuTimes, u32), SamplingError> {
    let mut lines = stat.lines();
    let aggregate = lines
        .next()
        .filter(|l| l.starts_with("cpu "))
        .ok_or(SamplingError::Parse("/proc/stat"))?;

    let fields: Vec<u64> = aggregate
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|_| SamplingError::Parse("/proc/stat"))?;
    if fields.len() < 4 {
        return Err(SamplingError::Parse("/proc/stat"));
    }

    // user nice system idle iowait irq softirq steal ...; guest time is
    // already counted in user/nice.
    let counted = &fields[..fields.len().min(8)];
    let total: u64 = counted.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);

    let cores = lines
        .filter(|l| {
            l.strip_prefix("cpu")
                .and_then(|rest| rest.chars().next())
                .is_some_and(|c| c.is_ascii_digit())
        })
        .count() as u32;

    Ok((CpuTimes { idle, total }, cores.max(1)))
}

fn parse_meminfo(meminfo: &str) -> Result<MemoryStats, SamplingError> {
    let field = |name: &str| -> Option<u64> {
        meminfo.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            rest.split_whitespace().next()?.parse::<u64>().ok()
        })
    };

    let total_kb = field("MemTotal").ok_or(SamplingError::Parse("MemTotal"))?;
    let available_kb = field("MemAvailable")
        .or_else(|| field("MemFree"))
        .ok_or(SamplingError::Parse("MemAvailable"))?;

    let total_bytes = total_kb * 1024;
    let available_bytes = available_kb.min(total_kb) * 1024;
    let used_bytes = total_bytes - available_bytes;
    Ok(MemoryStats {
        total_bytes,
        used_bytes,
        available_bytes,
        usage_percent: percent(used_bytes, total_bytes),
    })
}

fn parse_loadavg(loadavg: &str) -> Result<LoadAverage, SamplingError> {
    let mut parts = loadavg.split_whitespace().map(|p| p.parse::<f64>());
    let mut next = || {
        parts
            .next()
            .and_then(Result::ok)
            .ok_or(SamplingError::Parse("/proc/loadavg"))
    };
    Ok(LoadAverage {
        one: next()?,
        five: next()?,
        fifteen: next()?,
    })
}

fn parse_uptime(uptime: &str) -> Result<u64, SamplingError> {
    uptime
        .split_whitespace()
        .next()
        .and_then(|s| s.parse::<f64>().ok())
        .map(|secs| secs as u64)
        .ok_or(SamplingError::Parse("/proc/uptime"))
}

fn disk_stats(mount: &Path) -> Result<DiskStats, SamplingError> {
    let vfs = rustix::fs::statvfs(mount).map_err(|errno| SamplingError::Io {
        path: mount.display().to_string(),
        source: errno.into(),
    })?;

    let block = vfs.f_frsize.max(1);
    let total_bytes = vfs.f_blocks * block;
    let free_bytes = vfs.f_bavail * block;
    let used_bytes = vfs.f_blocks.saturating_sub(vfs.f_bfree) * block;

    Ok(DiskStats {
        mount_point: mount.display().to_string(),
        total_bytes,
        used_bytes,
        free_bytes,
        // Same as df: share of the space available to unprivileged users.
        usage_percent: percent(used_bytes, used_bytes + free_bytes),
    })
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round2(part as f64 * 100.0 / whole as f64)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
