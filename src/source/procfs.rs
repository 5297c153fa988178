use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::sample::RawMetricsSample;

use super::{SampleSource, SourceError};

const BYTES_PER_MB: f64 = 1_000_000.0;

/// Linux source backed by procfs and `statvfs`.
///
/// CPU and network figures are deltas between consecutive calls; the first
/// call reports CPU since boot and zero network throughput. Disk usage is
/// the used share of the filesystem holding `disk_path`. GPU is reported as
/// zero.
pub struct ProcSource {
    proc_root: PathBuf,
    disk_path: PathBuf,
    prev_cpu: Option<CpuTimes>,
    prev_net: Option<(NetTotals, Instant)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct NetTotals {
    rx_bytes: u64,
    tx_bytes: u64,
}

impl ProcSource {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self::with_root("/proc", disk_path)
    }

    /// Reads procfs files from `proc_root` instead of `/proc`.
    pub fn with_root(proc_root: impl Into<PathBuf>, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            disk_path: disk_path.into(),
            prev_cpu: None,
            prev_net: None,
        }
    }

    fn read(&self, name: &str) -> Result<(String, String), SourceError> {
        let path = self.proc_root.join(name);
        let display = path.display().to_string();
        match fs::read_to_string(&path) {
            Ok(text) => Ok((text, display)),
            Err(source) => Err(SourceError::Io {
                path: display,
                source,
            }),
        }
    }

    fn cpu_usage(&mut self) -> Result<f64, SourceError> {
        let (text, path) = self.read("stat")?;
        let now = parse_cpu_times(&text).ok_or_else(|| SourceError::Parse {
            path,
            detail: "missing aggregate cpu line".to_string(),
        })?;

        let (busy, total) = match self.prev_cpu {
            Some(prev) if now.total > prev.total => (
                now.busy.saturating_sub(prev.busy),
                now.total - prev.total,
            ),
            _ => (now.busy, now.total),
        };
        self.prev_cpu = Some(now);

        Ok(percent(busy as f64, total as f64))
    }

    fn ram_usage(&self) -> Result<f64, SourceError> {
        let (text, path) = self.read("meminfo")?;
        parse_mem_usage(&text).ok_or_else(|| SourceError::Parse {
            path,
            detail: "missing MemTotal or MemAvailable".to_string(),
        })
    }

    fn network(&mut self) -> Result<(f64, f64), SourceError> {
        let (text, _) = self.read("net/dev")?;
        let totals = parse_net_dev(&text);
        let now = Instant::now();

        let rates = match self.prev_net {
            Some((prev, at)) => {
                let secs = now.duration_since(at).as_secs_f64();
                if secs > 0.0 {
                    (
                        totals.rx_bytes.saturating_sub(prev.rx_bytes) as f64 / secs / BYTES_PER_MB,
                        totals.tx_bytes.saturating_sub(prev.tx_bytes) as f64 / secs / BYTES_PER_MB,
                    )
                } else {
                    (0.0, 0.0)
                }
            }
            None => (0.0, 0.0),
        };
        self.prev_net = Some((totals, now));

        Ok(rates)
    }
}

impl SampleSource for ProcSource {
    fn name(&self) -> &str {
        "proc"
    }

    fn sample(&mut self) -> Result<RawMetricsSample, SourceError> {
        let cpu_usage = self.cpu_usage()?;
        let ram_usage = self.ram_usage()?;
        let disk_usage = filesystem_usage(&self.disk_path)?;
        let (network_download, network_upload) = self.network()?;

        Ok(RawMetricsSample {
            cpu_usage,
            ram_usage,
            gpu_usage: 0.0,
            disk_usage,
            network_download,
            network_upload,
        })
    }
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole <= 0.0 {
        return 0.0;
    }
    (part / whole * 100.0).clamp(0.0, 100.0)
}

/// Parses the aggregate `cpu` line of /proc/stat.
///
/// Busy time excludes idle and iowait. Guest time is already folded into
/// user and nice, so only the first eight columns are summed.
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .filter_map(|v| v.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }

    let total: u64 = values.iter().sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Used memory percentage from /proc/meminfo.
fn parse_mem_usage(meminfo: &str) -> Option<f64> {
    let mut total = None;
    let mut available = None;

    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total = parts.next().and_then(|v| v.parse::<u64>().ok()),
            Some("MemAvailable:") => {
                available = parts.next().and_then(|v| v.parse::<u64>().ok());
            }
            _ => {}
        }
        if total.is_some() && available.is_some() {
            break;
        }
    }

    let total = total? as f64;
    let available = available? as f64;
    Some(percent(total - available, total))
}

/// Sums received and transmitted bytes over all non-loopback interfaces.
fn parse_net_dev(text: &str) -> NetTotals {
    let mut totals = NetTotals::default();

    // Two header lines, then `iface: rx_bytes rx_packets ... tx_bytes ...`.
    for line in text.lines().skip(2) {
        let Some((iface, counters)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = counters.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        totals.rx_bytes += fields[0].parse::<u64>().unwrap_or(0);
        totals.tx_bytes += fields[8].parse::<u64>().unwrap_or(0);
    }

    totals
}

/// Used share of the filesystem containing `path`, as `df` reports it.
#[allow(clippy::unnecessary_cast)]
fn filesystem_usage(path: &Path) -> Result<f64, SourceError> {
    let display = path.display().to_string();
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| SourceError::Parse {
        path: display.clone(),
        detail: "path contains a NUL byte".to_string(),
    })?;

    let mut st = std::mem::MaybeUninit::<libc::statvfs>::zeroed();
    // SAFETY: c_path is NUL-terminated and st points to writable storage
    // of the right size.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), st.as_mut_ptr()) };
    if rc != 0 {
        return Err(SourceError::Io {
            path: display,
            source: io::Error::last_os_error(),
        });
    }
    // SAFETY: statvfs returned success, so the struct is initialized.
    let st = unsafe { st.assume_init() };

    let frsize = st.f_frsize as u64;
    let used = (st.f_blocks as u64).saturating_sub(st.f_bfree as u64) * frsize;
    let available = st.f_bavail as u64 * frsize;

    Ok(percent(used as f64, (used + available) as f64))
}
