//! Packing pipeline
//!
//! A single worker drains a bounded queue of remote file IDs. Each file is
//! marked pack-ready with the aggregator, which answers with the source's
//! outstanding unpacked bytes. Crossing `pack_threshold` signals the source
//! ready-to-pack at once; otherwise the force-pack timer guarantees a
//! signal at least every `force_pack_after`.
//!
//! `enqueue` returns only once the worker has handled the file, so a Put
//! that crosses the threshold completes after its ready-to-pack signal.
//!
//! Aggregator failures are logged and dropped. The next arrival or the next
//! timer firing is the retry.

use crate::aggregator::Aggregator;
use crate::error::{Result, StorageError};
use crate::task::BackgroundTask;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Span};

#[derive(Debug, Clone)]
pub struct PackPipelineConfig {
    /// Outstanding bytes above which the source is packed immediately
    pub pack_threshold: u64,
    /// Longest gap between ready-to-pack signals
    pub force_pack_after: Duration,
    pub queue_capacity: usize,
}

impl Default for PackPipelineConfig {
    fn default() -> Self {
        Self {
            pack_threshold: 16 << 30,
            force_pack_after: Duration::from_secs(24 * 60 * 60),
            queue_capacity: 1,
        }
    }
}

/// A file awaiting its pack-readiness decision
struct PackJob {
    file_id: u64,
    done: oneshot::Sender<()>,
}

pub struct PackPipeline {
    config: PackPipelineConfig,
    source_id: u64,
    aggregator: Arc<dyn Aggregator>,
    sender: mpsc::Sender<PackJob>,
    receiver: Mutex<Option<mpsc::Receiver<PackJob>>>,
    task: BackgroundTask,
    span: Span,
}

impl PackPipeline {
    pub fn new(config: PackPipelineConfig, source_id: u64, aggregator: Arc<dyn Aggregator>) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            span: info_span!("pack_pipeline", source_id),
            config,
            source_id,
            aggregator,
            sender,
            receiver: Mutex::new(Some(receiver)),
            task: BackgroundTask::new(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Spawn the worker
    pub fn start(&self) -> Result<()> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| StorageError::Internal("pack pipeline already started".into()))?;

        let worker = Worker {
            config: self.config.clone(),
            source_id: self.source_id,
            aggregator: Arc::clone(&self.aggregator),
        };
        self.task
            .spawn(self.span.clone(), worker.run(receiver, self.task.token()))
    }

    /// Queue a file for pack-readiness and wait until the worker handled it.
    ///
    /// Waits while the queue is full. A cancelled `cancel` wins over a slot
    /// becoming free and over the worker's acknowledgement; a file already
    /// queued is still handled.
    pub async fn enqueue(&self, file_id: u64, cancel: &CancellationToken) -> Result<()> {
        let (done, handled) = oneshot::channel();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            sent = self.sender.send(PackJob { file_id, done }) => sent
                .map_err(|_| StorageError::Internal("pack pipeline has stopped".into()))?,
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StorageError::Cancelled),
            ack = handled => ack
                .map_err(|_| StorageError::Internal("pack pipeline stopped before handling file".into())),
        }
    }

    /// Stop the worker after its current item
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        let result = self.task.stop(deadline, "stopping pack pipeline").await;
        if result.is_ok() {
            debug!(parent: &self.span, "Pack pipeline stopped");
        }
        result
    }
}

struct Worker {
    config: PackPipelineConfig,
    source_id: u64,
    aggregator: Arc<dyn Aggregator>,
}

impl Worker {
    async fn run(self, mut receiver: mpsc::Receiver<PackJob>, cancel: CancellationToken) {
        let force_pack = tokio::time::sleep(self.config.force_pack_after);
        tokio::pin!(force_pack);

        info!(
            threshold = self.config.pack_threshold,
            force_pack_after_secs = self.config.force_pack_after.as_secs(),
            "Pack pipeline started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Pack pipeline shutting down");
                    break;
                }
                _ = &mut force_pack => {
                    debug!("Force-pack deadline reached");
                    self.signal_ready("timeout").await;
                    force_pack.as_mut().reset(Instant::now() + self.config.force_pack_after);
                }
                received = receiver.recv() => {
                    let Some(job) = received else {
                        debug!("Pack queue closed");
                        break;
                    };
                    if self.prepare(job.file_id).await {
                        self.signal_ready("threshold").await;
                        force_pack.as_mut().reset(Instant::now() + self.config.force_pack_after);
                    }
                    // The caller may have given up waiting
                    let _ = job.done.send(());
                }
            }
        }
    }

    /// Returns whether the source crossed the pack threshold
    async fn prepare(&self, file_id: u64) -> bool {
        match self.aggregator.prepare_to_pack_file(file_id).await {
            Ok(outstanding) => {
                debug!(file_id, outstanding, "File marked pack-ready");
                outstanding > self.config.pack_threshold
            }
            Err(e) => {
                warn!(file_id, error = %e, "Failed to mark file pack-ready");
                false
            }
        }
    }

    async fn signal_ready(&self, trigger: &'static str) {
        match self.aggregator.pack_source(self.source_id).await {
            Ok(()) => info!(trigger, "Signalled source ready to pack"),
            Err(e) => warn!(trigger, error = %e, "Failed to signal source ready to pack"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{MemoryAggregator, Operation};

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn pipeline(agg: &Arc<MemoryAggregator>, threshold: u64, force: Duration) -> PackPipeline {
        PackPipeline::new(
            PackPipelineConfig {
                pack_threshold: threshold,
                force_pack_after: force,
                queue_capacity: 1,
            },
            1,
            agg.clone(),
        )
    }

    #[tokio::test]
    async fn test_threshold_triggers_pack() {
        let agg = Arc::new(MemoryAggregator::new());
        let pipeline = pipeline(&agg, 10, Duration::from_secs(3600));
        pipeline.start().unwrap();

        let cancel = CancellationToken::new();
        let a = agg.insert_file(1, "a", vec![0u8; 6]);
        pipeline.enqueue(a, &cancel).await.unwrap();
        assert_eq!(agg.outstanding_bytes(1), 6);
        assert_eq!(agg.pack_signal_count(1), 0);

        // The signal lands before the crossing enqueue returns
        let b = agg.insert_file(1, "b", vec![0u8; 6]);
        pipeline.enqueue(b, &cancel).await.unwrap();
        assert_eq!(agg.pack_signal_count(1), 1);
        assert_eq!(agg.outstanding_bytes(1), 0);

        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_timer_forces_pack_without_data() {
        let agg = Arc::new(MemoryAggregator::new());
        let pipeline = pipeline(&agg, u64::MAX, Duration::from_millis(50));
        pipeline.start().unwrap();

        assert!(wait_for(|| agg.pack_signal_count(1) >= 2).await);
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_worker() {
        let agg = Arc::new(MemoryAggregator::new());
        let pipeline = pipeline(&agg, 4, Duration::from_secs(3600));
        pipeline.start().unwrap();
        let cancel = CancellationToken::new();

        agg.set_failing(Operation::PrepareToPackFile, true);
        let a = agg.insert_file(1, "a", vec![0u8; 5]);
        pipeline.enqueue(a, &cancel).await.unwrap();
        // The failed item is dropped, the queue keeps flowing
        let b = agg.insert_file(1, "b", vec![0u8; 5]);
        pipeline.enqueue(b, &cancel).await.unwrap();

        assert_eq!(agg.outstanding_bytes(1), 0);

        agg.set_failing(Operation::PrepareToPackFile, false);
        let c = agg.insert_file(1, "c", vec![0u8; 5]);
        pipeline.enqueue(c, &cancel).await.unwrap();
        assert_eq!(agg.pack_signal_count(1), 1);

        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_respects_cancellation() {
        let agg = Arc::new(MemoryAggregator::new());
        // Not started, so nothing drains the queue
        let pipeline = pipeline(&agg, 10, Duration::from_secs(3600));

        // The first file takes the only slot, then waits for an ack
        let queued = CancellationToken::new();
        let canceller = queued.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = pipeline.enqueue(1, &queued).await.unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));

        // The queue is full now
        let blocked = CancellationToken::new();
        let canceller = blocked.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = pipeline.enqueue(2, &blocked).await.unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));
    }

    #[tokio::test]
    async fn test_queued_file_handled_after_caller_gives_up() {
        let agg = Arc::new(MemoryAggregator::new());
        let pipeline = pipeline(&agg, 100, Duration::from_secs(3600));
        let a = agg.insert_file(1, "a", vec![0u8; 7]);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        assert!(pipeline.enqueue(a, &cancel).await.is_err());

        pipeline.start().unwrap();
        assert!(wait_for(|| agg.outstanding_bytes(1) == 7).await);
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_fails_once_stopped() {
        let agg = Arc::new(MemoryAggregator::new());
        let pipeline = pipeline(&agg, 10, Duration::from_secs(3600));
        pipeline.start().unwrap();
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();

        let err = pipeline.enqueue(1, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::Internal(_)));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let agg = Arc::new(MemoryAggregator::new());
        let pipeline = pipeline(&agg, 10, Duration::from_secs(3600));
        pipeline.start().unwrap();
        assert!(pipeline.start().is_err());
        pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
