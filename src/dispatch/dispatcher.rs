//! Task dispatcher - bridges the confined thread and the worker pool.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::confined::ConfinedExecutor;
use super::handle::{TaskError, TaskHandle};

/// How long `close()` waits for in-flight blocking tasks before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

const WORKER_THREAD_NAME: &str = "warden-async";

/// Worker pool size for the given processor count.
///
/// Small machines still get two workers; big machines leave half the
/// cores to the host.
pub fn pool_size(processors: usize) -> usize {
    match processors {
        0..=2 => 2,
        8.. => processors / 2,
        _ => processors - 1,
    }
}

/// Uniform async contract over a bounded worker pool and the confined thread.
///
/// Cloning is cheap; all clones share the same pool.
#[derive(Clone)]
pub struct TaskDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    confined: Arc<dyn ConfinedExecutor>,
    closed: AtomicBool,
    pool_size: usize,
}

impl TaskDispatcher {
    /// Create a dispatcher sized for this machine.
    pub fn new(confined: Arc<dyn ConfinedExecutor>) -> std::io::Result<Self> {
        Self::with_pool_size(confined, pool_size(num_cpus::get()))
    }

    /// Create a dispatcher with an explicit worker count.
    pub fn with_pool_size(
        confined: Arc<dyn ConfinedExecutor>,
        pool_size: usize,
    ) -> std::io::Result<Self> {
        let pool_size = pool_size.max(1);

        // One async worker drives timers and continuations; blocking work
        // goes to a blocking pool capped at `pool_size`.
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(pool_size)
            .thread_name(WORKER_THREAD_NAME)
            .enable_all()
            .build()?;

        info!("Task dispatcher started with {} workers", pool_size);

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                handle: runtime.handle().clone(),
                runtime: Mutex::new(Some(runtime)),
                confined,
                closed: AtomicBool::new(false),
                pool_size,
            }),
        })
    }

    /// Number of blocking workers.
    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether the caller is on the confined thread.
    pub fn is_confined_thread(&self) -> bool {
        self.inner.confined.is_confined_thread()
    }

    /// Run blocking work on the pool, discarding its value.
    pub fn run_async<F>(&self, task: F) -> TaskHandle<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.supply_async(task)
    }

    /// Run blocking work on the pool and hand back its value.
    pub fn supply_async<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        if self.is_closed() {
            return TaskHandle::rejected();
        }
        TaskHandle::spawned(self.inner.handle.spawn_blocking(task))
    }

    /// Run async coordination work (timers, joins) on the pool's runtime.
    pub fn spawn<T, F>(&self, future: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if self.is_closed() {
            return TaskHandle::rejected();
        }
        TaskHandle::spawned(self.inner.handle.spawn(future))
    }

    /// Marshal work onto the confined thread.
    ///
    /// Runs inline when already on it, otherwise queues behind earlier submissions.
    pub fn run_on_confined<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.confined.is_confined_thread() {
            task();
        } else {
            self.inner.confined.execute(Box::new(task));
        }
    }

    /// Feed the result of `upstream` into a continuation on the confined thread.
    ///
    /// If `upstream` fails the continuation never runs and the failure
    /// comes back through the returned handle.
    pub fn then_on_confined<T, F>(&self, upstream: TaskHandle<T>, continuation: F) -> TaskHandle<()>
    where
        T: Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        let dispatcher = self.clone();
        self.spawn(async move {
            let value = upstream.await?;
            let (done_tx, done_rx) = oneshot::channel();
            dispatcher.run_on_confined(move || {
                continuation(value);
                let _ = done_tx.send(());
            });
            done_rx.await.map_err(|_| TaskError::Cancelled)?;
            Ok(())
        })
    }

    /// Log-and-discard: watch a fire-and-forget task and log if it fails.
    pub fn detach<T>(&self, handle: TaskHandle<T>, context: &'static str)
    where
        T: Send + 'static,
    {
        if self.is_closed() {
            return;
        }
        drop(self.inner.handle.spawn(async move {
            if let Err(error) = handle.await {
                warn!("{} failed: {}", context, error);
            }
        }));
    }

    /// Stop accepting work, wait briefly for in-flight tasks, then abandon the rest.
    ///
    /// Idempotent and safe to call from the confined thread or from inside
    /// an async context.
    pub fn close(&self) {
        self.inner.shutdown();
    }
}

impl DispatcherInner {
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        // A runtime cannot be torn down from inside another runtime's worker,
        // so the wait happens on a short-lived helper thread.
        let shutdown = std::thread::Builder::new()
            .name("warden-shutdown".to_string())
            .spawn(move || runtime.shutdown_timeout(SHUTDOWN_GRACE));

        match shutdown {
            Ok(join) => {
                if join.join().is_err() {
                    warn!("Worker pool shutdown panicked");
                } else {
                    debug!("Worker pool shut down");
                }
            }
            Err(e) => warn!("Could not spawn shutdown thread: {}", e),
        }
    }
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("pool_size", &self.inner.pool_size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ConfinedThread;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;

    fn dispatcher() -> (TaskDispatcher, Arc<ConfinedThread>) {
        let confined = Arc::new(ConfinedThread::spawn("test-main").unwrap());
        let dispatcher = TaskDispatcher::with_pool_size(confined.clone(), 2).unwrap();
        (dispatcher, confined)
    }

    #[test]
    fn pool_sizing_follows_processor_count() {
        assert_eq!(pool_size(1), 2);
        assert_eq!(pool_size(2), 2);
        assert_eq!(pool_size(3), 2);
        assert_eq!(pool_size(4), 3);
        assert_eq!(pool_size(7), 6);
        assert_eq!(pool_size(8), 4);
        assert_eq!(pool_size(16), 8);
    }

    #[tokio::test]
    async fn supply_async_runs_on_worker_thread() {
        let (dispatcher, _confined) = dispatcher();
        let name = dispatcher
            .supply_async(|| Ok(std::thread::current().name().map(str::to_string)))
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some(WORKER_THREAD_NAME));
        dispatcher.close();
    }

    #[tokio::test]
    async fn task_error_becomes_failed_handle() {
        let (dispatcher, _confined) = dispatcher();
        let result = dispatcher
            .supply_async(|| -> anyhow::Result<u32> { anyhow::bail!("storage unavailable") })
            .await;
        match result {
            Err(TaskError::Failed(error)) => assert!(error.to_string().contains("storage unavailable")),
            other => panic!("unexpected result: {other:?}"),
        }
        dispatcher.close();
    }

    #[tokio::test]
    async fn then_on_confined_delivers_on_confined_thread() {
        let (dispatcher, confined) = dispatcher();
        let (tx, rx) = std_mpsc::channel();
        let probe = confined.clone();

        let upstream = dispatcher.supply_async(|| Ok("payload".to_string()));
        dispatcher
            .then_on_confined(upstream, move |value| {
                tx.send((value, probe.is_confined_thread())).unwrap();
            })
            .await
            .unwrap();

        assert_eq!(rx.try_recv().unwrap(), ("payload".to_string(), true));
        dispatcher.close();
    }

    #[tokio::test]
    async fn then_on_confined_skips_continuation_on_failure() {
        let (dispatcher, _confined) = dispatcher();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let upstream = dispatcher.supply_async(|| -> anyhow::Result<u8> { anyhow::bail!("lookup failed") });
        let result = dispatcher
            .then_on_confined(upstream, move |_| flag.store(true, Ordering::SeqCst))
            .await;

        match result {
            Err(TaskError::Failed(error)) => assert!(error.to_string().contains("lookup failed")),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!ran.load(Ordering::SeqCst));
        dispatcher.close();
    }

    #[test]
    fn run_on_confined_is_reentrant() {
        let (dispatcher, _confined) = dispatcher();
        let (tx, rx) = std_mpsc::channel();
        let inner = dispatcher.clone();

        dispatcher.run_on_confined(move || {
            let tx_inner = tx.clone();
            tx.send("outer-start").unwrap();
            // Already on the confined thread, so this must run before we return.
            inner.run_on_confined(move || tx_inner.send("nested").unwrap());
            tx.send("outer-end").unwrap();
        });

        let order: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(order, vec!["outer-start", "nested", "outer-end"]);
        dispatcher.close();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_new_work() {
        let (dispatcher, _confined) = dispatcher();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        dispatcher
            .run_async(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        dispatcher.close();
        dispatcher.close();

        assert!(dispatcher.is_closed());
        assert!(matches!(dispatcher.run_async(|| Ok(())).await, Err(TaskError::Rejected)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_from_confined_thread_does_not_deadlock() {
        let (dispatcher, _confined) = dispatcher();
        let (tx, rx) = std_mpsc::channel();
        let d = dispatcher.clone();
        dispatcher.run_on_confined(move || {
            d.close();
            tx.send(d.is_closed()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }
}
