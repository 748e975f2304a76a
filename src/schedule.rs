//! Replication schedule reconciliation
//!
//! Keeps exactly one schedule per configured provider on the dataset.
//! Existing schedules are updated in place, never deleted and recreated,
//! because the aggregator tracks in-flight deals per schedule. Schedules of
//! providers no longer configured are deleted. A failure for one provider
//! is recorded and the rest are still reconciled.

use crate::aggregator::{Aggregator, CreateScheduleRequest, Schedule, ScheduleTerms};
use crate::error::Result;
use crate::task::BackgroundTask;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument, Span};

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    /// Dataset the schedules belong to
    pub dataset: String,
    pub providers: Vec<String>,
    pub terms: ScheduleTerms,
}

/// Outcome of one reconciliation pass, by provider address
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
    /// `(provider, error)` pairs
    pub failed: Vec<(String, String)>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ScheduleReconciler {
    inner: Arc<Inner>,
    task: BackgroundTask,
    span: Span,
}

struct Inner {
    config: ScheduleConfig,
    aggregator: Arc<dyn Aggregator>,
}

impl ScheduleReconciler {
    pub fn new(config: ScheduleConfig, aggregator: Arc<dyn Aggregator>) -> Self {
        Self {
            span: info_span!("schedule_reconciler", dataset = %config.dataset),
            inner: Arc::new(Inner { config, aggregator }),
            task: BackgroundTask::new(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Run one reconciliation pass.
    ///
    /// Only a failure to list the existing schedules fails the whole pass.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.inner.reconcile().instrument(self.span.clone()).await
    }

    /// Re-run reconciliation every `every`, starting one interval from now.
    pub fn start_polling(&self, every: Duration) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let cancel = self.task.token();

        self.task.spawn(self.span.clone(), async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = every.as_secs(), "Schedule reconciliation polling started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Schedule reconciliation polling shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = inner.reconcile().await {
                            warn!(error = %e, "Schedule reconciliation failed");
                        }
                    }
                }
            }
        })
    }

    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.task.stop(deadline, "stopping schedule reconciler").await
    }
}

impl Inner {
    async fn reconcile(&self) -> Result<ReconcileReport> {
        let existing = match self.aggregator.list_schedules(&self.config.dataset).await {
            Ok(schedules) => schedules,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };

        // Lowest id wins when a provider somehow has several schedules.
        let mut by_provider: HashMap<&str, Vec<&Schedule>> = HashMap::new();
        for schedule in &existing {
            by_provider.entry(&schedule.provider).or_default().push(schedule);
        }
        for schedules in by_provider.values_mut() {
            schedules.sort_by_key(|s| s.id);
        }

        let mut report = ReconcileReport::default();

        for provider in &self.config.providers {
            let outcome = match by_provider.get(provider.as_str()).and_then(|s| s.first()) {
                Some(current) if current.terms == self.config.terms => {
                    report.unchanged.push(provider.clone());
                    continue;
                }
                Some(current) => self
                    .aggregator
                    .update_schedule(current.id, &self.config.terms)
                    .await
                    .map(|s| {
                        info!(provider = %provider, schedule_id = s.id, "Updated replication schedule");
                        report.updated.push(provider.clone());
                    }),
                None => {
                    let request = CreateScheduleRequest {
                        dataset: self.config.dataset.clone(),
                        provider: provider.clone(),
                        terms: self.config.terms.clone(),
                    };
                    self.aggregator.create_schedule(&request).await.map(|s| {
                        info!(provider = %provider, schedule_id = s.id, "Created replication schedule");
                        report.created.push(provider.clone());
                    })
                }
            };
            if let Err(e) = outcome {
                warn!(provider = %provider, error = %e, "Failed to reconcile replication schedule");
                report.failed.push((provider.clone(), e.to_string()));
            }
        }

        let stale = existing.iter().filter(|s| {
            let configured = self.config.providers.iter().any(|p| *p == s.provider);
            let duplicate = by_provider
                .get(s.provider.as_str())
                .and_then(|list| list.first())
                .is_some_and(|keep| keep.id != s.id);
            !configured || duplicate
        });
        for schedule in stale {
            match self.aggregator.delete_schedule(schedule.id).await {
                Ok(()) => {
                    info!(
                        provider = %schedule.provider,
                        schedule_id = schedule.id,
                        "Deleted replication schedule"
                    );
                    report.deleted.push(schedule.provider.clone());
                }
                Err(e) => {
                    warn!(
                        provider = %schedule.provider,
                        schedule_id = schedule.id,
                        error = %e,
                        "Failed to delete replication schedule"
                    );
                    report.failed.push((schedule.provider.clone(), e.to_string()));
                }
            }
        }

        debug!(
            created = report.created.len(),
            updated = report.updated.len(),
            unchanged = report.unchanged.len(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Schedule reconciliation finished"
        );
        Ok(report)
    }
}
