/// Resource Monitor - Per-Process Usage Sampling and Enforcement
///
/// **Responsibility:**
/// Observe and cap the resource consumption of one sandboxed process group.
/// A sample covers the leader and every process in the group it leads, so
/// children spawned by an interpreter or a build tool count against the limit.
///
/// **Platform Boundary:**
/// Sampling is behind the `ResourceSampler` trait. Linux reads `/proc`;
/// other platforms get a sampler that reports nothing, which the monitor
/// treats the same as a process that has already exited.
///
/// A process that disappears between polls is a normal exit, never an error.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Recommended polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One observation of a live process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSample {
    pub rss_bytes: u64,
    /// Cumulative user + system CPU time.
    pub cpu_time: Duration,
}

impl ProcessSample {
    pub fn rss_mb(&self) -> f64 {
        self.rss_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Aggregated usage over the life of a monitored process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageStats {
    pub peak_memory_mb: f64,
    pub cpu_percent: f64,
    pub samples: u32,
    pub killed_for_memory: bool,
}

/// Platform-specific source of process samples.
pub trait ResourceSampler: Send + Sync {
    /// `None` when the process is gone (or cannot be observed on this platform).
    fn sample(&self, pid: u32) -> Option<ProcessSample>;
}

/// Sums `/proc/<pid>/stat` (rss, utime + stime) over the process `pid` and
/// every live process whose process group is `pid`.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone)]
pub struct ProcfsSampler {
    clock_ticks_per_sec: u64,
    page_size: u64,
}

#[cfg(target_os = "linux")]
impl ProcfsSampler {
    pub fn new() -> Self {
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            clock_ticks_per_sec: if ticks > 0 { ticks as u64 } else { 100 },
            page_size: if page_size > 0 { page_size as u64 } else { 4096 },
        }
    }
}

#[cfg(target_os = "linux")]
impl Default for ProcfsSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl ResourceSampler for ProcfsSampler {
    fn sample(&self, pid: u32) -> Option<ProcessSample> {
        let entries = std::fs::read_dir("/proc").ok()?;
        let mut members = 0u32;
        let mut rss_pages = 0u64;
        let mut ticks = 0u64;

        for entry in entries.flatten() {
            let Some(entry_pid) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) else {
                continue;
            };
            // Processes exit between listing and reading; skip them.
            let Ok(raw) = std::fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            let Some(stat) = parse_stat(&raw) else {
                continue;
            };
            if entry_pid != pid && stat.pgrp != pid {
                continue;
            }
            // Zombies hold no memory and are about to be reaped.
            if stat.state == 'Z' || stat.state == 'X' {
                continue;
            }
            members += 1;
            rss_pages += stat.rss_pages;
            ticks += stat.cpu_ticks;
        }

        if members == 0 {
            return None;
        }
        Some(ProcessSample {
            rss_bytes: rss_pages * self.page_size,
            cpu_time: Duration::from_secs_f64(ticks as f64 / self.clock_ticks_per_sec as f64),
        })
    }
}

/// Sampler for platforms without a supported sampling mechanism.
#[derive(Debug, Clone, Default)]
pub struct UnsupportedSampler;

impl ResourceSampler for UnsupportedSampler {
    fn sample(&self, _pid: u32) -> Option<ProcessSample> {
        None
    }
}

/// The best sampler available on this platform.
pub fn platform_sampler() -> Arc<dyn ResourceSampler> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcfsSampler::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(UnsupportedSampler)
    }
}

/// Fields of `/proc/<pid>/stat` the sampler needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StatFields {
    pub state: char,
    pub pgrp: u32,
    /// utime + stime in clock ticks.
    pub cpu_ticks: u64,
    pub rss_pages: u64,
}

/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
pub(crate) fn parse_stat(stat: &str) -> Option<StatFields> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state) in proc(5) numbering.
    let state = fields.first()?.chars().next()?;
    let pgrp = fields.get(2)?.parse().ok()?;
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let rss_pages = fields.get(21)?.parse::<i64>().ok()?.max(0) as u64;
    Some(StatFields {
        state,
        pgrp,
        cpu_ticks: utime + stime,
        rss_pages,
    })
}

/// SIGKILL the process group led by `pid`, falling back to the single process.
/// Only for a child that has not been reaped yet; use `kill_process_group` after `wait`.
/// Returns `false` if nothing was signalled (already gone).
pub fn kill_process_tree(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let pid = pid as libc::pid_t;
        if pid <= 0 {
            return false;
        }
        unsafe {
            if libc::killpg(pid, libc::SIGKILL) == 0 {
                return true;
            }
            libc::kill(pid, libc::SIGKILL) == 0
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// SIGKILL the process group led by `pid`, with no single-process fallback.
/// Safe after the leader has been reaped: an empty group is simply not found,
/// and a recycled pid is never signalled on its own.
pub fn kill_process_group(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let pid = pid as libc::pid_t;
        pid > 0 && unsafe { libc::killpg(pid, libc::SIGKILL) } == 0
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Whether `pid` still exists (zombies included).
pub fn is_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let pid = pid as libc::pid_t;
        pid > 0 && unsafe { libc::kill(pid, 0) } == 0
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[derive(Clone)]
pub struct ResourceMonitor {
    sampler: Arc<dyn ResourceSampler>,
    interval: Duration,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new(platform_sampler(), DEFAULT_POLL_INTERVAL)
    }
}

impl ResourceMonitor {
    pub fn new(sampler: Arc<dyn ResourceSampler>, interval: Duration) -> Self {
        Self { sampler, interval }
    }

    /// Poll `pid` until it exits or disappears; report peak memory and final CPU reading.
    pub async fn monitor_execution(&self, pid: u32) -> UsageStats {
        self.watch(pid, None, std::future::pending::<()>()).await
    }

    /// Poll `pid` until it disappears or `stop` resolves, killing the process
    /// group as soon as resident memory exceeds `memory_limit_mb`.
    /// `pid` must lead its own process group.
    pub async fn watch<S>(&self, pid: u32, memory_limit_mb: Option<u64>, stop: S) -> UsageStats
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(stop);
        let mut stats = UsageStats::default();
        let mut previous: Option<(Instant, Duration)> = None;

        loop {
            let Some(sample) = self.sampler.sample(pid) else {
                debug!(pid, samples = stats.samples, "Monitored process gone");
                break;
            };
            let now = Instant::now();
            stats.samples += 1;
            stats.peak_memory_mb = stats.peak_memory_mb.max(sample.rss_mb());
            if let Some((at, cpu)) = previous {
                let wall = now.duration_since(at).as_secs_f64();
                if wall > 0.0 {
                    stats.cpu_percent = sample.cpu_time.saturating_sub(cpu).as_secs_f64() / wall * 100.0;
                }
            }
            previous = Some((now, sample.cpu_time));

            if let Some(limit) = memory_limit_mb {
                if sample.rss_mb() > limit as f64 {
                    warn!(
                        pid,
                        rss_mb = sample.rss_mb(),
                        limit_mb = limit,
                        "Memory limit exceeded - killing process group"
                    );
                    kill_process_group(pid);
                    stats.killed_for_memory = true;
                    break;
                }
            }

            tokio::select! {
                _ = &mut stop => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        stats
    }

    /// Single-shot check: kill the process tree if resident memory exceeds `limit_mb`.
    pub fn check_memory_limit(&self, pid: u32, limit_mb: u64) -> bool {
        match self.sampler.sample(pid) {
            Some(sample) if sample.rss_mb() > limit_mb as f64 => {
                warn!(pid, rss_mb = sample.rss_mb(), limit_mb, "Memory limit exceeded - killing process tree");
                kill_process_tree(pid)
            }
            _ => false,
        }
    }

    /// Hard backstop: after `timeout`, kill the process tree if it is still alive.
    pub async fn check_timeout(&self, pid: u32, timeout: Duration) -> bool {
        tokio::time::sleep(timeout).await;
        if is_alive(pid) {
            warn!(pid, timeout_ms = timeout.as_millis() as u64, "Process outlived its timeout - killing process tree");
            kill_process_tree(pid)
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reports a fixed RSS for a given number of polls, then reports the process gone.
    struct ScriptedSampler {
        rss_mb: Vec<u64>,
        calls: AtomicU32,
    }

    impl ResourceSampler for ScriptedSampler {
        fn sample(&self, _pid: u32) -> Option<ProcessSample> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.rss_mb.get(n).map(|mb| ProcessSample {
                rss_bytes: mb * 1024 * 1024,
                cpu_time: Duration::from_millis(10 * n as u64),
            })
        }
    }

    fn scripted(rss_mb: Vec<u64>) -> ResourceMonitor {
        ResourceMonitor::new(
            Arc::new(ScriptedSampler { rss_mb, calls: AtomicU32::new(0) }),
            Duration::from_millis(1),
        )
    }

    #[test]
    fn test_parse_stat_with_spaces_in_name() {
        let stat = "4242 (my (weird) proc) S 1 4200 4200 0 -1 4194304 100 0 0 0 37 5 0 0 20 0 1 0 100 1000 200 18446744073709551615";
        let fields = parse_stat(stat).unwrap();
        assert_eq!(fields.state, 'S');
        assert_eq!(fields.pgrp, 4200);
        assert_eq!(fields.cpu_ticks, 42);
        assert_eq!(fields.rss_pages, 200);
        assert_eq!(parse_stat("garbage"), None);
    }

    #[tokio::test]
    async fn test_monitor_tracks_peak_until_process_gone() {
        let monitor = scripted(vec![10, 50, 20]);
        let stats = monitor.monitor_execution(999_999).await;
        assert_eq!(stats.samples, 3);
        assert!((stats.peak_memory_mb - 50.0).abs() < f64::EPSILON);
        assert!(!stats.killed_for_memory);
    }

    #[tokio::test]
    async fn test_vanished_process_is_not_an_error() {
        let monitor = scripted(vec![]);
        let stats = monitor.monitor_execution(999_999).await;
        assert_eq!(stats, UsageStats::default());
    }

    #[tokio::test]
    async fn test_watch_stops_on_signal() {
        let monitor = scripted(vec![1; 10_000]);
        let stats = monitor.watch(999_999, None, async {}).await;
        assert_eq!(stats.samples, 1);
    }

    #[tokio::test]
    async fn test_watch_flags_memory_breach() {
        let monitor = scripted(vec![10, 700, 10]);
        // pid 0 is never signalled
        let stats = monitor.watch(0, Some(512), std::future::pending::<()>()).await;
        assert!(stats.killed_for_memory);
        assert_eq!(stats.samples, 2);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_procfs_samples_current_process() {
        let sampler = ProcfsSampler::new();
        let sample = sampler.sample(std::process::id()).expect("own process is observable");
        assert!(sample.rss_bytes > 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_procfs_sums_memory_across_process_group() {
        use std::os::unix::process::CommandExt as _;

        // The leader stays small; a forked subshell holds ~150 MB.
        let mut child = std::process::Command::new("bash")
            .arg("-c")
            .arg("( x=$(head -c 150000000 /dev/zero | tr '\\0' a); sleep 10; echo ${#x} ) & wait")
            .stdout(std::process::Stdio::null())
            .process_group(0)
            .spawn()
            .expect("spawn bash");
        let pid = child.id();
        let sampler = ProcfsSampler::new();

        let mut peak_mb = 0.0f64;
        let started = Instant::now();
        while started.elapsed() < Duration::from_secs(8) && peak_mb < 100.0 {
            if let Some(sample) = sampler.sample(pid) {
                peak_mb = peak_mb.max(sample.rss_mb());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(kill_process_group(pid));
        child.wait().ok();

        assert!(peak_mb >= 100.0, "group peak was {:.1} MB", peak_mb);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_group_kill_never_signals_a_lone_pid() {
        // Spawned without its own group, so no process group has this id.
        let mut child = std::process::Command::new("sleep").arg("5").spawn().expect("spawn sleep");
        assert!(!kill_process_group(child.id()));
        assert!(child.try_wait().unwrap().is_none(), "process outside the group was killed");
        child.kill().ok();
        child.wait().ok();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_check_timeout_kills_lingering_process() {
        let child = std::process::Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let pid = child.id();
        let monitor = ResourceMonitor::default();
        assert!(monitor.check_timeout(pid, Duration::from_millis(50)).await);
        let status = tokio::task::spawn_blocking(move || {
            let mut child = child;
            child.wait()
        })
        .await
        .unwrap()
        .unwrap();
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_check_memory_limit_leaves_small_process_alone() {
        let mut child = std::process::Command::new("sleep").arg("5").spawn().expect("spawn sleep");
        let monitor = ResourceMonitor::default();
        assert!(!monitor.check_memory_limit(child.id(), 4096));
        child.kill().ok();
        child.wait().ok();
    }
}
