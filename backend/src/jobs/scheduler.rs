// Execution Scheduler - Polls for due workflow executions and runs them
//
// Every instance claims through the store's conditional claim, so any number
// of schedulers may poll the same tenant. Losing a claim race is silent.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::maintenance::MaintenanceJobs;
use crate::error::AutomationResult;
use crate::store::AutomationStore;
use crate::workflows::{ExecutionReport, LeadAutomation};
use leadflow_shared::ExecutionStatus;

/// Tally of one polling tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Results that could not be recorded because the lease was gone
    pub lost: usize,
    pub errors: usize,
}

impl TickReport {
    fn record(&mut self, outcome: AutomationResult<ExecutionReport>) {
        match outcome {
            Ok(report) if !report.recorded => self.lost += 1,
            Ok(report) => match report.status {
                ExecutionStatus::Completed => self.completed += 1,
                ExecutionStatus::Pending => self.retried += 1,
                _ => self.failed += 1,
            },
            Err(e) => {
                error!(error = %e, "Could not record execution result");
                self.errors += 1;
            }
        }
    }
}

pub struct ExecutionScheduler<S> {
    automation: Arc<LeadAutomation<S>>,
    label: String,
}

impl<S: AutomationStore> ExecutionScheduler<S> {
    pub fn new(automation: Arc<LeadAutomation<S>>, label: impl Into<String>) -> Self {
        Self { automation, label: label.into() }
    }

    /// Claim what is due and run it with bounded concurrency
    pub async fn tick(&self, now: DateTime<Utc>) -> AutomationResult<TickReport> {
        let executor = self.automation.executor();
        let claimed = executor.claim_due(now).await?;
        let mut report = TickReport { claimed: claimed.len(), ..TickReport::default() };
        if claimed.is_empty() {
            return Ok(report);
        }

        let concurrency = self.automation.scheduler_config().max_concurrency.max(1);
        let runs: Vec<_> = claimed.iter().map(|execution| executor.run_claimed(execution)).collect();
        let outcomes: Vec<_> = stream::iter(runs)
            .buffer_unordered(concurrency)
            .collect()
            .await;
        for outcome in outcomes {
            report.record(outcome);
        }

        debug!(
            tenant = %self.label,
            claimed = report.claimed,
            completed = report.completed,
            retried = report.retried,
            failed = report.failed,
            "Scheduler tick finished"
        );
        Ok(report)
    }

    /// Poll and sweep until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        let config = self.automation.scheduler_config().clone();
        if !config.enabled {
            info!(tenant = %self.label, "Execution scheduler disabled by configuration");
            return;
        }

        let mut poll = interval(config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = interval(config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tenant = %self.label,
            worker = %config.worker_id,
            poll_interval_secs = config.poll_interval_secs,
            sweep_interval_secs = config.sweep_interval_secs,
            "Execution scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        warn!(tenant = %self.label, error = %e, "Polling for due executions failed");
                    }
                }
                _ = sweep.tick() => {
                    MaintenanceJobs::sweep(&*self.automation, Utc::now()).await;
                }
            }
        }

        info!(tenant = %self.label, "Execution scheduler stopped");
    }
}
