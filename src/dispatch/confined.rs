//! The confined thread: the one thread that owns host-visible state.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// A unit of work marshalled onto the confined thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Host integration point for the confined thread.
///
/// A game server supplies its own implementation that forwards jobs to its
/// main/region thread; [`ConfinedThread`] is the standalone one.
pub trait ConfinedExecutor: Send + Sync {
    /// Whether the calling thread is the confined thread.
    fn is_confined_thread(&self) -> bool;

    /// Queue a job. Jobs from one caller run in submission order.
    fn execute(&self, job: Job);
}

/// A dedicated, named OS thread draining a FIFO job queue.
pub struct ConfinedThread {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ConfinedThread {
    /// Spawn the confined thread.
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                        let message = payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_default();
                        error!("Confined job panicked: {}", message);
                    }
                }
                debug!("Confined thread queue closed");
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread_id: join.thread().id(),
            join: Mutex::new(Some(join)),
        })
    }

    /// Stop accepting jobs, let queued jobs finish, and join the thread.
    ///
    /// Idempotent. Called from the confined thread itself it only closes the queue.
    pub fn stop(&self) {
        self.sender.lock().take();

        if thread::current().id() == self.thread_id {
            return;
        }

        if let Some(join) = self.join.lock().take()
            && join.join().is_err()
        {
            warn!("Confined thread terminated abnormally");
        }
    }
}

impl ConfinedExecutor for ConfinedThread {
    fn is_confined_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn execute(&self, job: Job) {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(job).is_err() {
                    warn!("Confined thread is gone; dropping job");
                }
            }
            None => warn!("Confined thread stopped; dropping job"),
        }
    }
}

impl Drop for ConfinedThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ConfinedThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfinedThread")
            .field("thread_id", &self.thread_id)
            .field("running", &self.sender.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[test]
    fn jobs_run_in_submission_order_on_the_named_thread() {
        let confined = ConfinedThread::spawn("test-confined").unwrap();
        let (tx, rx) = std_mpsc::channel();

        for i in 0..50 {
            let tx = tx.clone();
            confined.execute(Box::new(move || {
                let name = thread::current().name().map(str::to_string);
                tx.send((i, name)).unwrap();
            }));
        }

        let seen: Vec<_> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(seen.iter().map(|(i, _)| *i).collect::<Vec<_>>(), (0..50).collect::<Vec<_>>());
        assert!(seen.iter().all(|(_, name)| name.as_deref() == Some("test-confined")));
    }

    #[test]
    fn panicking_job_does_not_kill_the_thread() {
        let confined = ConfinedThread::spawn("test-confined-panic").unwrap();
        let (tx, rx) = std_mpsc::channel();

        confined.execute(Box::new(|| panic!("job failure")));
        confined.execute(Box::new(move || tx.send(()).unwrap()));

        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn stop_drains_queue_and_is_idempotent() {
        let confined = Arc::new(ConfinedThread::spawn("test-confined-stop").unwrap());
        let (tx, rx) = std_mpsc::channel();
        confined.execute(Box::new(move || tx.send(7).unwrap()));

        confined.stop();
        confined.stop();

        assert_eq!(rx.try_recv().unwrap(), 7);
        assert!(!confined.is_confined_thread());
    }
}
