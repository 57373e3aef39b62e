//! The single sequential queue every state mutation runs on.

use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tracing_futures::Instrument;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the event-processing task.
///
/// Jobs run one at a time, in submission order, on a dedicated tokio task.
/// A job that panics is logged and does not stop the queue. The task exits
/// once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct PropertyEventExecutor {
    sender: mpsc::UnboundedSender<Job>,
}

impl PropertyEventExecutor {
    /// Spawn the event-processing task on the current tokio runtime.
    pub fn spawn() -> Result<Self, tokio::runtime::TryCurrentError> {
        let handle = tokio::runtime::Handle::try_current()?;
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        handle.spawn(
            async move {
                while let Some(job) = receiver.recv().await {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                        tracing::error!(panic = %panic_message(&panic), "property event job panicked");
                    }
                }
                tracing::debug!("property event queue closed");
            }
            .instrument(tracing::debug_span!("property_events")),
        );
        Ok(Self { sender })
    }

    /// Queue `job`. Returns `false` if the event task is gone.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let queued = self.sender.send(Box::new(job)).is_ok();
        if !queued {
            tracing::warn!("property event queue is closed, dropping job");
        }
        queued
    }

    /// Queue `job` once `delay` has elapsed.
    pub fn schedule<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let executor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            executor.execute(job);
        });
    }

    /// Resolves once every job queued before this call has run.
    pub async fn barrier(&self) {
        let (tx, rx) = oneshot::channel();
        if self.execute(move || {
            let _ = tx.send(());
        }) {
            let _ = rx.await;
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `f`, turning a panic into an error message.
pub(crate) fn catch<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|panic| panic_message(&panic))
}
