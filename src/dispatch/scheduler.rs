//! Host scheduler strategies for fixed-rate repeating work.
//!
//! The host either offers a region-global scheduler (ticks land on the
//! confined thread) or a simple async timer (ticks land on the worker pool).
//! Which one applies is decided once at startup.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::debug;

use super::TaskDispatcher;

/// Duration of one host scheduler tick.
pub const TICK: Duration = Duration::from_millis(50);

/// Convert host ticks into wall-clock time.
pub fn ticks_to_duration(ticks: u64) -> Duration {
    TICK.saturating_mul(u32::try_from(ticks).unwrap_or(u32::MAX))
}

/// Body of a repeating task.
pub type RepeatingFn = Arc<dyn Fn() + Send + Sync + 'static>;

/// Host scheduler topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerFlavor {
    /// Multi-region host: repeating work runs on the global region (confined) thread.
    GlobalRegion,
    /// Single-region host: repeating work runs asynchronously on the worker pool.
    SimpleAsync,
}

impl SchedulerFlavor {
    /// Pick the flavor from the host's self-reported name.
    pub fn detect(server_name: &str) -> Self {
        if server_name.to_lowercase().contains("folia") {
            Self::GlobalRegion
        } else {
            Self::SimpleAsync
        }
    }

    /// Build the scheduler strategy for this flavor.
    pub fn scheduler(self, dispatcher: TaskDispatcher) -> Arc<dyn HostScheduler> {
        match self {
            Self::GlobalRegion => Arc::new(GlobalRegionScheduler { dispatcher }),
            Self::SimpleAsync => Arc::new(AsyncTimerScheduler { dispatcher }),
        }
    }
}

/// Fixed-rate repeating task scheduling.
pub trait HostScheduler: Send + Sync {
    /// Run `task` every `interval_ticks`, first run one interval from now.
    fn schedule_at_fixed_rate(&self, interval_ticks: u64, task: RepeatingFn) -> RepeatingTask;

    fn flavor(&self) -> SchedulerFlavor;
}

/// Handle to a scheduled repeating task. Cancelled on `cancel()` or drop.
#[derive(Debug)]
pub struct RepeatingTask {
    abort: Option<AbortHandle>,
}

impl RepeatingTask {
    /// A handle that is not attached to any timer.
    pub fn inert() -> Self {
        Self { abort: None }
    }

    pub fn cancel(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.abort.as_ref().is_some_and(|a| !a.is_finished())
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Ticks are marshalled onto the confined thread.
pub struct GlobalRegionScheduler {
    dispatcher: TaskDispatcher,
}

/// Ticks run on the worker pool.
pub struct AsyncTimerScheduler {
    dispatcher: TaskDispatcher,
}

impl HostScheduler for GlobalRegionScheduler {
    fn schedule_at_fixed_rate(&self, interval_ticks: u64, task: RepeatingFn) -> RepeatingTask {
        let dispatcher = self.dispatcher.clone();
        spawn_timer(&self.dispatcher, interval_ticks, move || {
            let task = Arc::clone(&task);
            dispatcher.run_on_confined(move || task());
        })
    }

    fn flavor(&self) -> SchedulerFlavor {
        SchedulerFlavor::GlobalRegion
    }
}

impl HostScheduler for AsyncTimerScheduler {
    fn schedule_at_fixed_rate(&self, interval_ticks: u64, task: RepeatingFn) -> RepeatingTask {
        let dispatcher = self.dispatcher.clone();
        spawn_timer(&self.dispatcher, interval_ticks, move || {
            let task = Arc::clone(&task);
            let handle = dispatcher.run_async(move || {
                task();
                Ok(())
            });
            dispatcher.detach(handle, "repeating task");
        })
    }

    fn flavor(&self) -> SchedulerFlavor {
        SchedulerFlavor::SimpleAsync
    }
}

fn spawn_timer<F>(dispatcher: &TaskDispatcher, interval_ticks: u64, on_tick: F) -> RepeatingTask
where
    F: Fn() + Send + Sync + 'static,
{
    if interval_ticks == 0 {
        return RepeatingTask::inert();
    }

    let period = ticks_to_duration(interval_ticks);
    let owner = dispatcher.clone();
    let handle = dispatcher.spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !owner.is_closed() {
            ticker.tick().await;
            on_tick();
        }
        Ok(())
    });

    debug!("Scheduled repeating task every {:?}", period);
    RepeatingTask {
        abort: handle.abort_handle(),
    }
}
