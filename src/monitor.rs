//! Memory-pressure monitoring for long chunked runs.
//!
//! The monitor samples process memory on a fixed interval through a [`MemoryProbe`]. When the
//! used/limit ratio rises above the pressure threshold, every registered cleanup callback runs
//! once, in registration order. Hosts without memory introspection get a monitor that simply
//! never records samples.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::progress::format_bytes;

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Ratio above which cleanup is forced.
    pub pressure_threshold: f64,
    /// Ratio above which usage is reported as elevated.
    pub elevated_threshold: f64,
    /// Number of most recent samples retained.
    pub history_len: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            pressure_threshold: 0.8,
            elevated_threshold: 0.6,
            history_len: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemorySample {
    pub used: u64,
    pub allocated: u64,
    pub limit: u64,
    pub taken_at: DateTime<Utc>,
}

impl MemorySample {
    pub fn new(used: u64, allocated: u64, limit: u64) -> Self {
        Self {
            used,
            allocated,
            limit,
            taken_at: Utc::now(),
        }
    }

    pub fn ratio(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            self.used as f64 / self.limit as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Normal,
    Elevated,
    Critical,
}

/// Host memory introspection.
pub trait MemoryProbe: Send + Sync {
    /// `None` when the host cannot report memory usage.
    fn sample(&self) -> Option<MemorySample>;

    /// Best-effort request to return freed memory to the host.
    fn reclaim(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Reads `/proc/self/status` for resident and data-segment sizes. The limit is the cgroup v2
/// `memory.max` when set, else `MemTotal` from `/proc/meminfo`. Yields no samples off Linux.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcMemoryProbe;

impl ProcMemoryProbe {
    fn status_kib(status: &str, key: &str) -> Option<u64> {
        status
            .lines()
            .find_map(|line| line.strip_prefix(key))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|kib| kib * 1024)
    }

    fn limit() -> Option<u64> {
        let cgroup = std::fs::read_to_string("/sys/fs/cgroup/memory.max")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok());
        cgroup.or_else(|| {
            let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
            Self::status_kib(&meminfo, "MemTotal")
        })
    }
}

impl MemoryProbe for ProcMemoryProbe {
    fn sample(&self) -> Option<MemorySample> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let used = Self::status_kib(&status, "VmRSS")?;
        let allocated = Self::status_kib(&status, "VmData").unwrap_or(used);
        Some(MemorySample::new(used, allocated, Self::limit()?))
    }
}

/// Aggregates over the retained samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryStats {
    pub current: u64,
    /// Highest usage seen over the monitor's lifetime.
    pub peak: u64,
    pub average: u64,
    pub limit: u64,
    pub usage_percent: f64,
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "current={} peak={} average={} limit={} usage={:.1}%",
            format_bytes(self.current),
            format_bytes(self.peak),
            format_bytes(self.average),
            format_bytes(self.limit),
            self.usage_percent
        )
    }
}

pub type CleanupCallback = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CleanupId(u64);

#[derive(Default)]
struct State {
    history: VecDeque<MemorySample>,
    peak: u64,
    session_peak: u64,
    above_threshold: bool,
    task: Option<JoinHandle<()>>,
    leases: usize,
    /// Sampling was started by a lease rather than by the caller.
    lease_owned: bool,
    lease_epoch: u64,
}

#[derive(Default)]
struct Callbacks {
    next_id: u64,
    entries: Vec<(CleanupId, CleanupCallback)>,
}

struct Shared {
    config: MonitorConfig,
    probe: Arc<dyn MemoryProbe>,
    state: Mutex<State>,
    callbacks: Mutex<Callbacks>,
}

/// Cheap to clone; clones observe the same samples and callbacks.
#[derive(Clone)]
pub struct MemoryPressureMonitor {
    shared: Arc<Shared>,
}

impl fmt::Debug for MemoryPressureMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPressureMonitor")
            .field("config", &self.shared.config)
            .field("monitoring", &self.is_monitoring())
            .finish()
    }
}

impl Default for MemoryPressureMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default(), Arc::new(ProcMemoryProbe))
    }
}

impl MemoryPressureMonitor {
    pub fn new(config: MonitorConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                probe,
                state: Mutex::new(State::default()),
                callbacks: Mutex::new(Callbacks::default()),
            }),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.shared.config
    }

    pub fn is_monitoring(&self) -> bool {
        self.shared.state().task.is_some()
    }

    /// Begin periodic sampling on the current Tokio runtime. No-op while already monitoring or
    /// when called outside a runtime.
    pub fn start_monitoring(&self) {
        let mut state = self.shared.state();
        if state.task.is_some() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("memory monitor needs a tokio runtime; sampling disabled");
            return;
        };

        state.session_peak = 0;
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let interval = self.shared.config.interval;
        state.task = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                if let Some(sample) = shared.probe.sample() {
                    shared.record(sample);
                }
            }
        }));
        tracing::info!(interval_ms = interval.as_millis() as u64, "memory monitoring started");
    }

    /// Halt sampling. Returns the peak usage seen since the last start, or `None` when the
    /// monitor was idle.
    pub fn stop_monitoring(&self) -> Option<u64> {
        Shared::stop(&mut self.shared.state())
    }

    /// Keep sampling while the returned lease is alive. Sampling started by a lease stops
    /// `grace` after the last outstanding lease is dropped; sampling the caller started is
    /// left running.
    pub fn acquire(&self, grace: Duration) -> MonitorLease {
        let start = {
            let mut state = self.shared.state();
            state.leases += 1;
            state.lease_epoch += 1;
            if state.task.is_none() {
                state.lease_owned = true;
            }
            state.task.is_none()
        };
        if start {
            self.start_monitoring();
        }
        MonitorLease {
            shared: Arc::clone(&self.shared),
            grace,
        }
    }

    pub fn register_cleanup_callback<F>(&self, callback: F) -> CleanupId
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut callbacks = self.shared.callbacks();
        let id = CleanupId(callbacks.next_id);
        callbacks.next_id += 1;
        callbacks.entries.push((id, Arc::new(callback)));
        id
    }

    pub fn unregister_cleanup_callback(&self, id: CleanupId) -> bool {
        let mut callbacks = self.shared.callbacks();
        let before = callbacks.entries.len();
        callbacks.entries.retain(|(entry, _)| *entry != id);
        callbacks.entries.len() != before
    }

    /// Record one sample and return its pressure level. Crossing the pressure threshold from
    /// below forces a cleanup; staying above it does not repeat the cleanup.
    pub fn record_sample(&self, sample: MemorySample) -> PressureLevel {
        self.shared.record(sample)
    }

    /// Run every cleanup callback, then ask the probe to reclaim. Failures are logged and
    /// never propagated.
    pub fn force_cleanup(&self) {
        self.shared.force_cleanup();
    }

    pub fn get_memory_stats(&self) -> Option<MemoryStats> {
        let state = self.shared.state();
        let latest = state.history.back()?;
        let total: u128 = state.history.iter().map(|s| u128::from(s.used)).sum();
        Some(MemoryStats {
            current: latest.used,
            peak: state.peak,
            average: (total / state.history.len() as u128) as u64,
            limit: latest.limit,
            usage_percent: latest.ratio() * 100.0,
        })
    }

    pub fn pressure_level(&self) -> Option<PressureLevel> {
        let state = self.shared.state();
        state.history.back().map(|s| self.shared.classify(s.ratio()))
    }

    /// Retained samples, oldest first.
    pub fn samples(&self) -> Vec<MemorySample> {
        self.shared.state().history.iter().cloned().collect()
    }
}

/// Holds a [`MemoryPressureMonitor`] active. See [`MemoryPressureMonitor::acquire`].
#[must_use = "the monitor may stop as soon as the lease is dropped"]
pub struct MonitorLease {
    shared: Arc<Shared>,
    grace: Duration,
}

impl fmt::Debug for MonitorLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorLease")
            .field("grace", &self.grace)
            .finish()
    }
}

impl Drop for MonitorLease {
    fn drop(&mut self) {
        let epoch = {
            let mut state = self.shared.state();
            state.leases = state.leases.saturating_sub(1);
            if state.leases > 0 || !state.lease_owned {
                return;
            }
            state.lease_epoch
        };

        let shared = Arc::clone(&self.shared);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if !self.grace.is_zero() => {
                let grace = self.grace;
                // one more sample lands before the monitor goes idle
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    shared.release(epoch);
                });
            }
            _ => shared.release(epoch),
        }
    }
}

impl Shared {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn callbacks(&self) -> std::sync::MutexGuard<'_, Callbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop(state: &mut State) -> Option<u64> {
        let task = state.task.take()?;
        task.abort();
        let peak = state.session_peak;
        tracing::info!(peak = %format_bytes(peak), "memory monitoring stopped");
        Some(peak)
    }

    /// Stop lease-owned sampling unless a lease was taken after `epoch`.
    fn release(&self, epoch: u64) {
        let mut state = self.state();
        if state.leases == 0 && state.lease_owned && state.lease_epoch == epoch {
            state.lease_owned = false;
            Self::stop(&mut state);
        }
    }

    fn classify(&self, ratio: f64) -> PressureLevel {
        if ratio > self.config.pressure_threshold {
            PressureLevel::Critical
        } else if ratio > self.config.elevated_threshold {
            PressureLevel::Elevated
        } else {
            PressureLevel::Normal
        }
    }

    fn record(&self, sample: MemorySample) -> PressureLevel {
        let level = self.classify(sample.ratio());
        let crossed = {
            let mut state = self.state();
            state.peak = state.peak.max(sample.used);
            state.session_peak = state.session_peak.max(sample.used);
            let was_above = state.above_threshold;
            state.above_threshold = level == PressureLevel::Critical;

            if level == PressureLevel::Critical && !was_above {
                tracing::warn!(
                    used = %format_bytes(sample.used),
                    limit = %format_bytes(sample.limit),
                    percent = %format!("{:.1}", sample.ratio() * 100.0),
                    "memory pressure threshold exceeded"
                );
            }

            state.history.push_back(sample);
            while state.history.len() > self.config.history_len.max(1) {
                state.history.pop_front();
            }
            state.above_threshold && !was_above
        };

        // state lock released: callbacks may call back into the monitor
        if crossed {
            self.force_cleanup();
        }
        level
    }

    fn force_cleanup(&self) {
        let callbacks: Vec<(CleanupId, CleanupCallback)> = self.callbacks().entries.clone();
        tracing::info!(callbacks = callbacks.len(), "running memory cleanup");

        for (id, callback) in callbacks {
            match panic::catch_unwind(AssertUnwindSafe(|| callback())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(callback = id.0, error = %e, "cleanup callback failed"),
                Err(_) => tracing::warn!(callback = id.0, "cleanup callback panicked"),
            }
        }

        if let Err(e) = self.probe.reclaim() {
            tracing::debug!(error = %e, "memory reclaim request failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ProcMemoryProbe;

    #[test]
    fn parses_kib_fields() {
        let status = "Name:\tx\nVmData:\t  2048 kB\nVmRSS:\t   1024 kB\n";
        assert_eq!(ProcMemoryProbe::status_kib(status, "VmRSS"), Some(1024 * 1024));
        assert_eq!(ProcMemoryProbe::status_kib(status, "VmData"), Some(2048 * 1024));
        assert_eq!(ProcMemoryProbe::status_kib(status, "VmSwap"), None);
    }
}
