//! Local cache cleanup
//!
//! Periodically evicts staged blobs whose replication is confirmed. The
//! decision is delegated to a [`CleanupPredicate`]; the scheduler only
//! lists, asks, and removes. A sweep evaluates the whole listing before
//! removing anything, and at most one sweep runs at a time.

use crate::blob::BlobId;
use crate::error::Result;
use crate::local_store::LocalStore;
use crate::task::BackgroundTask;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument, Span};

/// Decides whether a staged blob can be dropped from the local cache
#[async_trait]
pub trait CleanupPredicate: Send + Sync {
    async fn is_cleanup_ready(&self, id: &BlobId) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
        }
    }
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub examined: usize,
    pub removed: Vec<BlobId>,
    /// Blobs whose predicate or removal failed this cycle
    pub skipped: usize,
}

pub struct CleanupScheduler {
    inner: Arc<Inner>,
    task: BackgroundTask,
    span: Span,
}

struct Inner {
    config: CleanupConfig,
    store: Arc<LocalStore>,
    predicate: Arc<dyn CleanupPredicate>,
    sweeping: AtomicBool,
}

/// Clears the single-flight flag when a sweep ends, however it ends
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CleanupScheduler {
    pub fn new(
        config: CleanupConfig,
        store: Arc<LocalStore>,
        predicate: Arc<dyn CleanupPredicate>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                predicate,
                sweeping: AtomicBool::new(false),
            }),
            task: BackgroundTask::new(),
            span: info_span!("cleanup_scheduler"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Start ticking. The first sweep runs immediately.
    pub fn start(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let cancel = self.task.token();

        self.task.spawn(self.span.clone(), async move {
            let mut ticker = interval(inner.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = inner.config.interval.as_secs(), "Cleanup scheduler started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Cleanup scheduler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match inner.sweep().await {
                            Ok(Some(_)) => {}
                            Ok(None) => debug!("Previous sweep still running, skipping tick"),
                            Err(e) => warn!(error = %e, "Cleanup sweep failed"),
                        }
                    }
                }
            }
        })
    }

    /// Sweep now. `None` when another sweep is already running.
    pub async fn sweep_now(&self) -> Result<Option<SweepReport>> {
        self.inner.sweep().instrument(self.span.clone()).await
    }

    /// Stop ticking, waiting for an in-flight sweep up to `deadline`
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.task.stop(deadline, "stopping cleanup scheduler").await
    }
}

impl Inner {
    async fn sweep(&self) -> Result<Option<SweepReport>> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Ok(None);
        }
        let _guard = SweepGuard(&self.sweeping);

        let ids = self.store.list().await?;
        let mut report = SweepReport {
            examined: ids.len(),
            ..Default::default()
        };

        let mut ready = Vec::new();
        for id in ids {
            match self.predicate.is_cleanup_ready(&id).await {
                Ok(true) => ready.push(id),
                Ok(false) => {}
                Err(e) => {
                    warn!(id = %id, error = %e, "Cleanup check failed, skipping blob this cycle");
                    report.skipped += 1;
                }
            }
        }

        for id in ready {
            match self.store.remove(&id).await {
                Ok(()) => report.removed.push(id),
                Err(e) => {
                    warn!(id = %id, error = %e, "Failed to remove replicated blob");
                    report.skipped += 1;
                }
            }
        }

        if report.removed.is_empty() {
            debug!(examined = report.examined, skipped = report.skipped, "Cleanup sweep finished");
        } else {
            info!(
                examined = report.examined,
                removed = report.removed.len(),
                skipped = report.skipped,
                "Evicted replicated blobs from local cache"
            );
        }
        Ok(Some(report))
    }
}
