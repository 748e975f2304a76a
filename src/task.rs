//! Handle for a cancellable background task

use crate::error::{Result, StorageError};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// A spawned loop plus the token that stops it.
///
/// Stopping is drain-and-join: the token is cancelled, then the join is
/// awaited up to the caller's deadline.
#[derive(Default)]
pub struct BackgroundTask {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token the task body should watch
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawn `body` inside `span`. Fails if a task was already spawned.
    pub fn spawn<F>(&self, span: tracing::Span, body: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut handle = self.lock();
        if handle.is_some() {
            return Err(StorageError::Internal("background task already started".into()));
        }
        *handle = Some(tokio::spawn(body.instrument(span)));
        Ok(())
    }

    /// Cancel the task and wait for it to finish, up to `deadline`.
    pub async fn stop(&self, deadline: Duration, what: &'static str) -> Result<()> {
        self.cancel.cancel();
        let handle = self.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(StorageError::Internal(format!("{what} task failed: {e}"))),
            Err(_) => Err(StorageError::DeadlineExceeded(what)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
