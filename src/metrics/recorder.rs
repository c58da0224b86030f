//! Per-operation timing counters with periodic flush to the log.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::MetricsSettings;
use crate::dispatch::{HostScheduler, RepeatingTask};

#[derive(Debug, Default)]
struct MetricAccumulator {
    total_nanos: AtomicU64,
    invocations: AtomicU64,
}

/// Totals for one metric since the previous flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSnapshot {
    pub name: String,
    pub total_nanos: u64,
    pub invocations: u64,
}

impl MetricSnapshot {
    pub fn average_millis(&self) -> f64 {
        if self.invocations == 0 {
            return 0.0;
        }
        self.total_nanos as f64 / self.invocations as f64 / 1_000_000.0
    }
}

/// Accumulates durations per operation name.
///
/// Recording is lock-free; a repeating host task drains the counters and
/// logs one line per metric.
pub struct MetricsRecorder {
    metrics: DashMap<String, MetricAccumulator>,
    enabled: AtomicBool,
    flush_interval_ticks: AtomicU64,
    flush_task: Mutex<Option<RepeatingTask>>,
    scheduler: Arc<dyn HostScheduler>,
    self_ref: Weak<MetricsRecorder>,
}

impl MetricsRecorder {
    /// Create the recorder and start its flush timer (when enabled).
    pub fn new(scheduler: Arc<dyn HostScheduler>, settings: MetricsSettings) -> Arc<Self> {
        let recorder = Arc::new_cyclic(|self_ref| Self {
            metrics: DashMap::new(),
            enabled: AtomicBool::new(settings.enabled),
            flush_interval_ticks: AtomicU64::new(settings.flush_interval_ticks),
            flush_task: Mutex::new(None),
            scheduler,
            self_ref: self_ref.clone(),
        });

        if settings.enabled {
            recorder.restart_flush_task();
        }
        recorder
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Add one invocation of `name` taking `elapsed`.
    pub fn record(&self, name: &str, elapsed: Duration) {
        if !self.is_enabled() {
            return;
        }

        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        // Fast path avoids allocating the key for metrics that already exist.
        if let Some(acc) = self.metrics.get(name) {
            acc.total_nanos.fetch_add(nanos, Ordering::Relaxed);
            acc.invocations.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let acc = self.metrics.entry(name.to_string()).or_default();
        acc.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        acc.invocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Time `f` and record it under `name`, even if it fails or panics.
    pub fn measure<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let _timer = Timer {
            recorder: self,
            name,
            start: Instant::now(),
        };
        f()
    }

    /// Drain all counters, returning metrics that saw at least one call.
    pub fn snapshot_and_reset(&self) -> Vec<MetricSnapshot> {
        let mut snapshots: Vec<_> = self
            .metrics
            .iter()
            .filter_map(|entry| {
                let total_nanos = entry.total_nanos.swap(0, Ordering::AcqRel);
                let invocations = entry.invocations.swap(0, Ordering::AcqRel);
                (invocations > 0).then(|| MetricSnapshot {
                    name: entry.key().clone(),
                    total_nanos,
                    invocations,
                })
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Log and reset everything accumulated since the last flush.
    pub fn flush(&self) {
        if !self.is_enabled() {
            return;
        }

        for snapshot in self.snapshot_and_reset() {
            debug!(
                "[performance] {} avg={:.3}ms calls={}",
                snapshot.name,
                snapshot.average_millis(),
                snapshot.invocations
            );
        }
    }

    /// Apply new settings.
    ///
    /// Disabling stops the timer and drops pending counts; a changed interval
    /// restarts the timer.
    pub fn refresh_configuration(&self, settings: MetricsSettings) {
        self.enabled.store(settings.enabled, Ordering::Release);
        let previous = self
            .flush_interval_ticks
            .swap(settings.flush_interval_ticks, Ordering::AcqRel);

        if !settings.enabled {
            self.cancel_flush_task();
            self.clear_accumulators();
            return;
        }

        let running = self.flush_task.lock().as_ref().is_some_and(RepeatingTask::is_active);
        if previous != settings.flush_interval_ticks || !running {
            self.restart_flush_task();
        }
    }

    /// Stop flushing and forget all counters.
    pub fn close(&self) {
        self.cancel_flush_task();
        self.metrics.clear();
    }

    fn restart_flush_task(&self) {
        let interval = self.flush_interval_ticks.load(Ordering::Acquire);
        let recorder = self.self_ref.clone();
        let task = self.scheduler.schedule_at_fixed_rate(
            interval,
            Arc::new(move || {
                if let Some(recorder) = recorder.upgrade() {
                    recorder.flush();
                }
            }),
        );
        // Replacing the old handle cancels it.
        *self.flush_task.lock() = Some(task);
    }

    fn cancel_flush_task(&self) {
        self.flush_task.lock().take();
    }

    fn clear_accumulators(&self) {
        for entry in self.metrics.iter() {
            entry.total_nanos.store(0, Ordering::Release);
            entry.invocations.store(0, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for MetricsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRecorder")
            .field("enabled", &self.is_enabled())
            .field("metric_count", &self.metrics.len())
            .finish()
    }
}

/// Records on drop, so unwinding still counts.
struct Timer<'a> {
    recorder: &'a MetricsRecorder,
    name: &'a str,
    start: Instant,
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.recorder.record(self.name, self.start.elapsed());
    }
}

/// Time `f` against an optional recorder.
pub fn measure<T>(metrics: Option<&MetricsRecorder>, name: &str, f: impl FnOnce() -> T) -> T {
    match metrics {
        Some(recorder) => recorder.measure(name, f),
        None => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{RepeatingFn, SchedulerFlavor};
    use std::sync::atomic::AtomicUsize;

    /// Scheduler that records requests without running anything.
    #[derive(Default)]
    struct RecordingScheduler {
        scheduled: AtomicUsize,
    }

    impl HostScheduler for RecordingScheduler {
        fn schedule_at_fixed_rate(&self, _interval_ticks: u64, _task: RepeatingFn) -> RepeatingTask {
            self.scheduled.fetch_add(1, Ordering::SeqCst);
            RepeatingTask::inert()
        }

        fn flavor(&self) -> SchedulerFlavor {
            SchedulerFlavor::SimpleAsync
        }
    }

    fn recorder(enabled: bool) -> (Arc<MetricsRecorder>, Arc<RecordingScheduler>) {
        let scheduler = Arc::new(RecordingScheduler::default());
        let settings = MetricsSettings {
            enabled,
            flush_interval_ticks: 20,
        };
        (MetricsRecorder::new(scheduler.clone(), settings), scheduler)
    }

    #[test]
    fn snapshot_aggregates_and_resets() {
        let (metrics, _) = recorder(true);
        metrics.record("punishments.active.fetch", Duration::from_millis(2));
        metrics.record("punishments.active.fetch", Duration::from_millis(4));
        metrics.record("identity.flush", Duration::from_millis(1));

        let snapshot = metrics.snapshot_and_reset();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].name, "punishments.active.fetch");
        assert_eq!(snapshot[1].invocations, 2);
        assert!((snapshot[1].average_millis() - 3.0).abs() < 1e-9);

        assert!(metrics.snapshot_and_reset().is_empty());
    }

    #[test]
    fn measure_returns_value_and_records() {
        let (metrics, _) = recorder(true);
        let value = metrics.measure("op", || 41 + 1);
        assert_eq!(value, 42);
        assert_eq!(metrics.snapshot_and_reset()[0].invocations, 1);

        assert_eq!(measure(None, "op", || "untimed"), "untimed");
    }

    #[test]
    fn panicking_operation_is_still_timed() {
        let (metrics, _) = recorder(true);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            metrics.measure("identity.flush", || -> u32 { panic!("storage exploded") })
        }));
        assert!(outcome.is_err());

        let snapshot = metrics.snapshot_and_reset();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, "identity.flush");
        assert_eq!(snapshot[0].invocations, 1);
    }

    #[test]
    fn disabled_recorder_ignores_samples() {
        let (metrics, scheduler) = recorder(false);
        metrics.record("op", Duration::from_millis(1));
        assert!(metrics.snapshot_and_reset().is_empty());
        assert_eq!(scheduler.scheduled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn refresh_restarts_timer_on_interval_change_and_clears_on_disable() {
        let (metrics, scheduler) = recorder(true);
        assert_eq!(scheduler.scheduled.load(Ordering::SeqCst), 1);

        metrics.refresh_configuration(MetricsSettings {
            enabled: true,
            flush_interval_ticks: 40,
        });
        assert_eq!(scheduler.scheduled.load(Ordering::SeqCst), 2);

        metrics.record("op", Duration::from_millis(1));
        metrics.refresh_configuration(MetricsSettings {
            enabled: false,
            flush_interval_ticks: 40,
        });
        assert!(!metrics.is_enabled());
        assert!(metrics.snapshot_and_reset().is_empty());
    }
}
