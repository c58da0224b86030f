//! Awaitable handles for work submitted to the dispatcher.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::task::{AbortHandle, JoinError, JoinHandle};

/// Failure channel of a [`TaskHandle`].
///
/// Whatever goes wrong inside a task ends up here; nothing escapes the
/// worker pool uncaptured.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The task body returned an error.
    #[error("task failed: {0:#}")]
    Failed(Arc<anyhow::Error>),

    /// The task body panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was cancelled before it produced a value (pool shutdown or abort).
    #[error("task cancelled")]
    Cancelled,

    /// The dispatcher was already closed when the task was submitted.
    #[error("dispatcher is closed")]
    Rejected,
}

impl TaskError {
    fn from_task_error(error: anyhow::Error) -> Self {
        // A TaskError that travelled through an anyhow chain keeps its identity.
        match error.downcast::<TaskError>() {
            Ok(task_error) => task_error,
            Err(other) => Self::Failed(Arc::new(other)),
        }
    }
}

impl From<JoinError> for TaskError {
    fn from(error: JoinError) -> Self {
        if error.is_cancelled() {
            return Self::Cancelled;
        }

        match error.try_into_panic() {
            Ok(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                Self::Panicked(message)
            }
            Err(_) => Self::Cancelled,
        }
    }
}

/// Future resolving to the result of a dispatched task.
///
/// Dropping the handle does not cancel the task.
#[must_use = "dropping a TaskHandle detaches the task; use TaskDispatcher::detach to log its failure"]
pub struct TaskHandle<T> {
    join: Option<JoinHandle<anyhow::Result<T>>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn spawned(join: JoinHandle<anyhow::Result<T>>) -> Self {
        Self { join: Some(join) }
    }

    pub(crate) fn rejected() -> Self {
        Self { join: None }
    }

    /// Abort handle for the underlying task, if it was accepted.
    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.join.as_ref().map(JoinHandle::abort_handle)
    }

    /// Whether the task has finished (or was never accepted).
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(join) = self.join.as_mut() else {
            return Poll::Ready(Err(TaskError::Rejected));
        };

        match Pin::new(join).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Ok(value))) => Poll::Ready(Ok(value)),
            Poll::Ready(Ok(Err(error))) => Poll::Ready(Err(TaskError::from_task_error(error))),
            Poll::Ready(Err(join_error)) => Poll::Ready(Err(TaskError::from(join_error))),
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("accepted", &self.join.is_some())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejected_handle_resolves_to_rejected() {
        let handle: TaskHandle<u32> = TaskHandle::rejected();
        assert!(handle.is_finished());
        assert!(matches!(handle.await, Err(TaskError::Rejected)));
    }

    #[tokio::test]
    async fn task_error_survives_anyhow_round_trip() {
        let join = tokio::spawn(async { Err::<(), _>(anyhow::Error::from(TaskError::Cancelled)) });
        let result = TaskHandle::spawned(join).await;
        assert!(matches!(result, Err(TaskError::Cancelled)));
    }

    #[tokio::test]
    async fn panic_message_is_captured() {
        let join = tokio::spawn(async {
            if true {
                panic!("boom");
            }
            Ok::<(), anyhow::Error>(())
        });
        match TaskHandle::spawned(join).await {
            Err(TaskError::Panicked(message)) => assert_eq!(message, "boom"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
