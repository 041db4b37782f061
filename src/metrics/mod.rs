use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use procfs::Current;
use serde::Serialize;

/// Directories skipped by the workspace-size walk. Heavyweight build and
/// dependency trees dominate disk usage without being user content.
const WALK_SKIP_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "target",
    "dist",
    "build",
    ".next",
    ".venv",
    "__pycache__",
];

/// Point-in-time metrics for one agent process. Network and disk values
/// are deltas against the first sample taken for the pid.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessMetrics {
    pub pid: i32,
    pub cpu_percent: f64,
    pub rss_bytes: u64,
    pub elapsed_ms: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub disk_read_ops: u64,
    pub disk_write_ops: u64,
}

/// Cumulative token accounting for one session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost: f64,
}

/// Result of a workspace-size walk.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageUsage {
    pub total_bytes: u64,
    pub file_count: u64,
    pub largest_file: Option<LargestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LargestFile {
    pub path: String,
    pub size: u64,
}

/// Fleet-wide snapshot broadcast on the metrics channel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemMetrics {
    pub active_sessions: usize,
    pub total_cpu_percent: f64,
    pub total_rss_bytes: u64,
    pub total_net_rx_bytes: u64,
    pub total_net_tx_bytes: u64,
    pub total_disk_read_bytes: u64,
    pub total_disk_write_bytes: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    cpu_ticks: u64,
    net_rx: u64,
    net_tx: u64,
    disk_read: u64,
    disk_write: u64,
    disk_read_ops: u64,
    disk_write_ops: u64,
}

struct Baseline {
    first: Counters,
    prev_cpu_ticks: u64,
    prev_sampled_at: Instant,
}

/// Per-pid sampling with first-sample baselines, plus per-session token
/// accounting. Baselines are dropped when the session ends or the pid
/// disappears.
pub struct MetricsCollector {
    baselines: Mutex<HashMap<i32, Baseline>>,
    tokens: Mutex<HashMap<String, TokenUsage>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            baselines: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Sample one pid. Returns `None` when the process no longer exists;
    /// the stale baseline is discarded in that case.
    pub fn sample_pid(&self, pid: i32) -> Option<ProcessMetrics> {
        let current = match read_counters(pid) {
            Some(c) => c,
            None => {
                self.clear_pid(pid);
                return None;
            }
        };

        let process = procfs::process::Process::new(pid).ok()?;
        let stat = process.stat().ok()?;
        let page_size = procfs::page_size();
        let ticks_per_sec = procfs::ticks_per_second();

        let uptime = procfs::Uptime::current().ok()?.uptime;
        let started_secs = stat.starttime as f64 / ticks_per_sec as f64;
        let elapsed_ms = ((uptime - started_secs).max(0.0) * 1000.0) as u64;

        let now = Instant::now();
        let mut baselines = self.baselines.lock().unwrap_or_else(|e| e.into_inner());
        let metrics = match baselines.get_mut(&pid) {
            Some(baseline) => {
                let wall = now
                    .duration_since(baseline.prev_sampled_at)
                    .as_secs_f64()
                    .max(0.001);
                let cpu_delta_ticks =
                    current.cpu_ticks.saturating_sub(baseline.prev_cpu_ticks) as f64;
                let cpu_percent = (cpu_delta_ticks / ticks_per_sec as f64) / wall * 100.0;
                baseline.prev_cpu_ticks = current.cpu_ticks;
                baseline.prev_sampled_at = now;

                ProcessMetrics {
                    pid,
                    cpu_percent,
                    rss_bytes: stat.rss * page_size,
                    elapsed_ms,
                    net_rx_bytes: current.net_rx.saturating_sub(baseline.first.net_rx),
                    net_tx_bytes: current.net_tx.saturating_sub(baseline.first.net_tx),
                    disk_read_bytes: current.disk_read.saturating_sub(baseline.first.disk_read),
                    disk_write_bytes: current.disk_write.saturating_sub(baseline.first.disk_write),
                    disk_read_ops: current
                        .disk_read_ops
                        .saturating_sub(baseline.first.disk_read_ops),
                    disk_write_ops: current
                        .disk_write_ops
                        .saturating_sub(baseline.first.disk_write_ops),
                }
            }
            None => {
                baselines.insert(
                    pid,
                    Baseline {
                        first: current,
                        prev_cpu_ticks: current.cpu_ticks,
                        prev_sampled_at: now,
                    },
                );
                ProcessMetrics {
                    pid,
                    rss_bytes: stat.rss * page_size,
                    elapsed_ms,
                    ..Default::default()
                }
            }
        };

        Some(metrics)
    }

    pub fn clear_pid(&self, pid: i32) {
        self.baselines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pid);
    }

    /// Accumulate token usage reported for a session.
    pub fn record_tokens(
        &self,
        session_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        model: Option<&str>,
    ) -> TokenUsage {
        let (input_rate, output_rate) = model_pricing(model.unwrap_or(""));
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        let usage = tokens.entry(session_id.to_string()).or_default();
        usage.input_tokens += input_tokens;
        usage.output_tokens += output_tokens;
        usage.total_tokens = usage.input_tokens + usage.output_tokens;
        usage.estimated_cost += input_tokens as f64 / 1_000_000.0 * input_rate
            + output_tokens as f64 / 1_000_000.0 * output_rate;
        usage.clone()
    }

    pub fn token_usage(&self, session_id: &str) -> TokenUsage {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_session(&self, session_id: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
    }

    /// Sum live-process metrics across sessions. Sessions with no live pid
    /// count toward `active_sessions` but contribute zero to the totals.
    pub fn aggregate(&self, pids: &[Option<i32>]) -> SystemMetrics {
        let mut snapshot = SystemMetrics {
            active_sessions: pids.len(),
            timestamp: chrono::Utc::now(),
            ..Default::default()
        };
        for pid in pids.iter().flatten() {
            if let Some(m) = self.sample_pid(*pid) {
                snapshot.total_cpu_percent += m.cpu_percent;
                snapshot.total_rss_bytes += m.rss_bytes;
                snapshot.total_net_rx_bytes += m.net_rx_bytes;
                snapshot.total_net_tx_bytes += m.net_tx_bytes;
                snapshot.total_disk_read_bytes += m.disk_read_bytes;
                snapshot.total_disk_write_bytes += m.disk_write_bytes;
            }
        }
        snapshot
    }
}

fn read_counters(pid: i32) -> Option<Counters> {
    let process = procfs::process::Process::new(pid).ok()?;
    let stat = process.stat().ok()?;
    let cpu_ticks = stat.utime + stat.stime;

    // /proc/<pid>/io needs ptrace-level access; degrade to zeros rather
    // than failing the whole sample.
    let (disk_read, disk_write, disk_read_ops, disk_write_ops) = match process.io() {
        Ok(io) => (io.read_bytes, io.write_bytes, io.syscr, io.syscw),
        Err(_) => (0, 0, 0, 0),
    };

    let (net_rx, net_tx) = read_net_dev(pid).unwrap_or((0, 0));

    Some(Counters {
        cpu_ticks,
        net_rx,
        net_tx,
        disk_read,
        disk_write,
        disk_read_ops,
        disk_write_ops,
    })
}

/// Sum rx/tx byte counters over the pid's network namespace, excluding
/// loopback.
fn read_net_dev(pid: i32) -> Option<(u64, u64)> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/net/dev")).ok()?;
    let mut rx = 0u64;
    let mut tx = 0u64;
    for line in contents.lines().skip(2) {
        let Some((iface, rest)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() >= 9 {
            rx += fields[0].parse::<u64>().unwrap_or(0);
            tx += fields[8].parse::<u64>().unwrap_or(0);
        }
    }
    Some((rx, tx))
}

/// (input $/1M tokens, output $/1M tokens). Local ollama models cost
/// nothing; unknown remote models get the default row.
fn model_pricing(model: &str) -> (f64, f64) {
    let lower = model.to_ascii_lowercase();
    if lower.contains("qwen") || lower.contains("llama") || lower.contains("ollama") {
        return (0.0, 0.0);
    }
    if lower.contains("haiku") {
        return (0.8, 4.0);
    }
    if lower.contains("sonnet") {
        return (3.0, 15.0);
    }
    if lower.contains("opus") {
        return (15.0, 75.0);
    }
    if lower.contains("gpt-4o-mini") {
        return (0.15, 0.6);
    }
    if lower.contains("gpt-4o") {
        return (2.5, 10.0);
    }
    (1.0, 3.0)
}

/// Best-effort recursive walk of a workspace, skipping heavyweight
/// subdirectories. Unreadable entries are ignored.
pub fn workspace_usage(root: &Path) -> StorageUsage {
    let mut usage = StorageUsage::default();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                if WALK_SKIP_DIRS
                    .iter()
                    .any(|skip| name.to_string_lossy() == *skip)
                {
                    continue;
                }
                pending.push(path);
            } else if file_type.is_file() {
                let Ok(meta) = entry.metadata() else { continue };
                let size = meta.len();
                usage.total_bytes += size;
                usage.file_count += 1;
                let is_larger = usage
                    .largest_file
                    .as_ref()
                    .map(|l| size > l.size)
                    .unwrap_or(true);
                if is_larger {
                    usage.largest_file = Some(LargestFile {
                        path: path.to_string_lossy().into_owned(),
                        size,
                    });
                }
            }
        }
    }
    usage
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_accounting_accumulates_and_prices() {
        let collector = MetricsCollector::new();
        collector.record_tokens("s1", 1_000_000, 0, Some("claude-sonnet-4"));
        let usage = collector.record_tokens("s1", 0, 1_000_000, Some("claude-sonnet-4"));
        assert_eq!(usage.input_tokens, 1_000_000);
        assert_eq!(usage.output_tokens, 1_000_000);
        assert_eq!(usage.total_tokens, 2_000_000);
        assert!((usage.estimated_cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn local_models_cost_nothing() {
        let collector = MetricsCollector::new();
        let usage = collector.record_tokens("s1", 5_000, 5_000, Some("qwen2.5-coder:7b"));
        assert_eq!(usage.estimated_cost, 0.0);
    }

    #[test]
    fn unknown_model_uses_default_pricing() {
        let (input, output) = model_pricing("mystery-model-9000");
        assert_eq!((input, output), (1.0, 3.0));
    }

    #[test]
    fn cleared_session_resets_usage() {
        let collector = MetricsCollector::new();
        collector.record_tokens("s1", 10, 10, None);
        collector.clear_session("s1");
        assert_eq!(collector.token_usage("s1").total_tokens, 0);
    }

    #[test]
    fn sample_own_pid_reports_rss_and_baseline_deltas() {
        let collector = MetricsCollector::new();
        let pid = std::process::id() as i32;
        let first = collector.sample_pid(pid).unwrap();
        assert!(first.rss_bytes > 0);
        // First sample is the baseline: deltas are zero.
        assert_eq!(first.net_rx_bytes, 0);
        assert_eq!(first.disk_read_bytes, 0);
        let second = collector.sample_pid(pid).unwrap();
        assert!(second.cpu_percent >= 0.0);
    }

    #[test]
    fn missing_pid_clears_baseline_and_returns_none() {
        let collector = MetricsCollector::new();
        assert!(collector.sample_pid(-1).is_none());
    }

    #[test]
    fn workspace_walk_skips_heavy_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), vec![0u8; 10]).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/big.js"), vec![0u8; 1000]).unwrap();

        let usage = workspace_usage(dir.path());
        assert_eq!(usage.file_count, 1);
        assert_eq!(usage.total_bytes, 10);
        assert!(usage.largest_file.unwrap().path.ends_with("a.txt"));
    }

    #[test]
    fn aggregate_counts_pidless_sessions() {
        let collector = MetricsCollector::new();
        let snapshot = collector.aggregate(&[None, None]);
        assert_eq!(snapshot.active_sessions, 2);
        assert_eq!(snapshot.total_rss_bytes, 0);
    }
}
