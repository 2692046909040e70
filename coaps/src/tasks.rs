//! Cooperative runner for delayed and periodic background work
//!
//! Tasks never touch the socket. They report back to the engine through flags and the wake
//! signal only.

use std::{future::Future, time::Duration};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, Instrument};

#[derive(Debug, Clone)]
pub(crate) struct TaskQueue {
    handle: Handle,
    shutdown: CancellationToken,
}

impl TaskQueue {
    /// Must be called from within a tokio runtime
    pub(crate) fn new(shutdown: CancellationToken) -> Self {
        Self {
            handle: Handle::current(),
            shutdown,
        }
    }

    /// Run `work` after `delay` unless the returned token is canceled first
    pub(crate) fn schedule<F>(&self, name: &'static str, delay: Duration, work: F) -> CancellationToken
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(name, delay, async move { work() })
    }

    /// Like `schedule`, for work that blocks, such as erasing flash
    pub(crate) fn schedule_blocking<F>(
        &self,
        name: &'static str,
        delay: Duration,
        work: F,
    ) -> CancellationToken
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.handle.clone();
        self.spawn(name, delay, async move {
            if let Err(e) = handle.spawn_blocking(work).await {
                tracing::error!("blocking task panicked: {}", e);
            }
        })
    }

    /// Run `work` every `period()`, re-evaluating the period after each run
    pub(crate) fn periodic<P, F>(&self, name: &'static str, period: P, mut work: F) -> CancellationToken
    where
        P: Fn() -> Duration + Send + 'static,
        F: FnMut() + Send + 'static,
    {
        let token = self.shutdown.child_token();
        let cancel = token.clone();
        self.handle.spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(period()) => work(),
                    }
                }
                trace!("stopped");
            }
            .instrument(tracing::trace_span!("task", name)),
        );
        token
    }

    fn spawn<T>(&self, name: &'static str, delay: Duration, task: T) -> CancellationToken
    where
        T: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.child_token();
        let cancel = token.clone();
        self.handle.spawn(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => trace!("canceled"),
                    _ = tokio::time::sleep(delay) => task.await,
                }
            }
            .instrument(tracing::trace_span!("task", name)),
        );
        token
    }
}
