//! Fire-and-forget work that shutdown waits for.
//!
//! [`BackgroundTasks::run`] bumps an outstanding counter before it returns and
//! the matching decrement lives in a drop guard owned by the spawned task, so
//! the count drops exactly once whether the task succeeds, fails or panics.
use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures_util::FutureExt;
use tokio::sync::Notify;
use tracing::Instrument;

#[derive(Debug, Default)]
struct Inner {
    outstanding: AtomicUsize,
    idle: Notify,
}

/// Cloneable handle to the shared task tracker.
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    inner: Arc<Inner>,
}

struct TaskGuard {
    inner: Arc<Inner>,
}

impl TaskGuard {
    fn new(inner: Arc<Inner>) -> Self {
        inner.outstanding.fetch_add(1, Ordering::AcqRel);
        Self { inner }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.inner.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` on the runtime and track it until it finishes.
    ///
    /// Errors and panics are logged and go no further.
    pub fn run<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        let guard = TaskGuard::new(self.inner.clone());
        let span = tracing::info_span!("background", task = name);

        tokio::spawn(
            async move {
                let _guard = guard;
                match AssertUnwindSafe(task).catch_unwind().await {
                    Ok(Ok(())) => tracing::debug!("Background task finished"),
                    Ok(Err(e)) => tracing::error!(error = ?e, "Background task failed"),
                    Err(panic) => tracing::error!(
                        panic = %panic_message(panic.as_ref()),
                        "Background task panicked"
                    ),
                }
            }
            .instrument(span),
        );
    }

    /// Number of tasks started but not yet finished.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Resolve once no task is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before reading the counter so a concurrent last decrement
            // cannot slip between the check and the await.
            notified.as_mut().enable();

            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Like [`wait_idle`](Self::wait_idle) but gives up after `limit`.
    /// Returns `true` if the tracker drained in time.
    pub async fn wait_idle_timeout(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.wait_idle()).await.is_ok()
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
