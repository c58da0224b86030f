//! Dispatch module - where work runs.
//!
//! Two execution contexts exist:
//! - the confined thread, which alone may touch host-visible state
//! - a bounded pool of worker threads for storage, file, crypto and network work
//!
//! `TaskDispatcher` hides the difference behind awaitable `TaskHandle`s, and
//! `HostScheduler` provides fixed-rate timers in whichever flavor the host
//! supports.

mod confined;
mod dispatcher;
mod handle;
mod scheduler;

pub use confined::{ConfinedExecutor, ConfinedThread, Job};
pub use dispatcher::{TaskDispatcher, pool_size};
pub use handle::{TaskError, TaskHandle};
pub use scheduler::{
    AsyncTimerScheduler, GlobalRegionScheduler, HostScheduler, RepeatingFn, RepeatingTask,
    SchedulerFlavor, TICK, ticks_to_duration,
};
