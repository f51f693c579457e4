use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use lodestone_process::{ServerEvent, SystemUsage};
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};

const KIB: f64 = 1024.0;
const GIB_IN_KIB: f64 = 1024.0 * 1024.0;

/// Aggregate `(idle, total)` jiffies from the first `cpu ` line of `/proc/stat`.
pub fn parse_cpu_times(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .filter_map(|v| v.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total = fields.iter().sum();
    Some((idle, total))
}

/// `(total_kib, available_kib)` from `/proc/meminfo`.
pub fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let field = |name: &str| {
        meminfo
            .lines()
            .find_map(|l| l.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|v| v.parse::<u64>().ok())
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable").or_else(|| field("MemFree"))?;
    Some((total, available))
}

/// Summed `(rx_bytes, tx_bytes)` over every interface except loopback.
pub fn parse_net_dev(net_dev: &str) -> (u64, u64) {
    let mut rx = 0u64;
    let mut tx = 0u64;
    for line in net_dev.lines() {
        let Some((iface, counters)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let nums: Vec<u64> = counters
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        if nums.len() < 9 {
            continue;
        }
        rx = rx.saturating_add(nums[0]);
        tx = tx.saturating_add(nums[8]);
    }
    (rx, tx)
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    cpu: Option<(u64, u64)>,
    net: (u64, u64),
    at: Instant,
}

/// Reads host counters from a procfs root and turns successive reads into rates.
#[derive(Debug)]
pub struct ProcSampler {
    root: PathBuf,
    prev: Option<Counters>,
}

impl ProcSampler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            prev: None,
        }
    }

    async fn read(&self, name: &str) -> String {
        tokio::fs::read_to_string(self.root.join(name))
            .await
            .unwrap_or_default()
    }

    pub async fn sample(&mut self) -> SystemUsage {
        let cpu = parse_cpu_times(&self.read("stat").await);
        let mem = parse_meminfo(&self.read("meminfo").await);
        let net = parse_net_dev(&self.read("net/dev").await);
        let now = Counters {
            cpu,
            net,
            at: Instant::now(),
        };

        let cpu_percent = match (self.prev.and_then(|p| p.cpu), cpu) {
            (Some((idle0, total0)), Some((idle1, total1))) if total1 > total0 => {
                let busy = (total1 - total0).saturating_sub(idle1.saturating_sub(idle0));
                busy as f64 * 100.0 / (total1 - total0) as f64
            }
            (None, Some((idle, total))) if total > 0 => {
                total.saturating_sub(idle) as f64 * 100.0 / total as f64
            }
            _ => 0.0,
        };

        let (rx_rate, tx_rate) = match self.prev {
            Some(prev) => {
                let secs = now.at.duration_since(prev.at).as_secs_f64();
                if secs > 0.0 {
                    (
                        net.0.saturating_sub(prev.net.0) as f64 / KIB / secs,
                        net.1.saturating_sub(prev.net.1) as f64 / KIB / secs,
                    )
                } else {
                    (0.0, 0.0)
                }
            }
            None => (0.0, 0.0),
        };
        self.prev = Some(now);

        let (mem_total, mem_available) = mem.unwrap_or((0, 0));
        SystemUsage {
            cpu_percent: round2(cpu_percent),
            mem_used_gb: round2(mem_total.saturating_sub(mem_available) as f64 / GIB_IN_KIB),
            mem_total_gb: round2(mem_total as f64 / GIB_IN_KIB),
            rx_kib_per_sec: round2(rx_rate),
            tx_kib_per_sec: round2(tx_rate),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Default)]
struct MonitorInner {
    observers: usize,
    task: Option<JoinHandle<()>>,
}

/// Samples host usage while at least one observer is connected.
#[derive(Clone)]
pub struct UsageMonitor {
    inner: Arc<Mutex<MonitorInner>>,
    interval: Duration,
    proc_root: PathBuf,
    events: broadcast::Sender<ServerEvent>,
}

impl UsageMonitor {
    pub fn new(interval: Duration, events: broadcast::Sender<ServerEvent>) -> Self {
        Self::with_proc_root(interval, events, "/proc")
    }

    pub fn with_proc_root(
        interval: Duration,
        events: broadcast::Sender<ServerEvent>,
        proc_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MonitorInner::default())),
            interval,
            proc_root: proc_root.into(),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn observers(&self) -> usize {
        self.lock().observers
    }

    pub fn is_active(&self) -> bool {
        self.lock().task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn observer_connected(&self) {
        let mut inner = self.lock();
        inner.observers += 1;
        if inner.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        tracing::debug!("usage monitor started");
        inner.task = Some(tokio::spawn(self.clone().run()));
    }

    pub fn observer_disconnected(&self) {
        let mut inner = self.lock();
        inner.observers = inner.observers.saturating_sub(1);
    }

    async fn run(self) {
        let mut sampler = ProcSampler::new(self.proc_root.clone());
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if self.observers() == 0 {
                tracing::debug!("usage monitor stopped: no observers");
                return;
            }
            let usage = sampler.sample().await;
            let _ = self.events.send(ServerEvent::Usage { usage });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\n";
    const MEMINFO: &str = "MemTotal:       16384000 kB\nMemFree:         1000000 kB\nMemAvailable:    8192000 kB\n";
    const NET_DEV: &str = "Inter-|   Receive                                                |  Transmit\n face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n    lo: 5000 10 0 0 0 0 0 0 5000 10 0 0 0 0 0 0\n  eth0: 2048 4 0 0 0 0 0 0 1024 2 0 0 0 0 0 0\n wlan0: 1024 1 0 0 0 0 0 0 1024 1 0 0 0 0 0 0\n";

    #[test]
    fn cpu_times_include_iowait_as_idle() {
        assert_eq!(parse_cpu_times(STAT), Some((800, 1000)));
        assert_eq!(parse_cpu_times("intr 1 2 3"), None);
    }

    #[test]
    fn meminfo_prefers_available() {
        assert_eq!(parse_meminfo(MEMINFO), Some((16_384_000, 8_192_000)));
        assert_eq!(
            parse_meminfo("MemTotal: 100 kB\nMemFree: 40 kB\n"),
            Some((100, 40))
        );
        assert_eq!(parse_meminfo(""), None);
    }

    #[test]
    fn net_dev_skips_loopback() {
        assert_eq!(parse_net_dev(NET_DEV), (3072, 2048));
    }

    fn fake_proc() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("net")).unwrap();
        std::fs::write(dir.path().join("stat"), STAT).unwrap();
        std::fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();
        std::fs::write(dir.path().join("net/dev"), NET_DEV).unwrap();
        dir
    }

    #[tokio::test]
    async fn first_sample_uses_totals_since_boot() {
        let proc = fake_proc();
        let mut sampler = ProcSampler::new(proc.path());
        let usage = sampler.sample().await;
        assert_eq!(usage.cpu_percent, 20.0);
        assert_eq!(usage.mem_total_gb, 15.63);
        assert_eq!(usage.rx_kib_per_sec, 0.0);
    }

    #[tokio::test]
    async fn monitor_runs_only_while_observed() {
        let proc = fake_proc();
        let (tx, mut rx) = broadcast::channel(16);
        let monitor = UsageMonitor::with_proc_root(Duration::from_millis(20), tx, proc.path());
        assert!(!monitor.is_active());

        monitor.observer_connected();
        let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(ev, ServerEvent::Usage { .. }));

        monitor.observer_disconnected();
        tokio::time::timeout(Duration::from_secs(5), async {
            while monitor.is_active() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        monitor.observer_connected();
        assert!(monitor.is_active());
        assert_eq!(monitor.observers(), 1);
    }
}
