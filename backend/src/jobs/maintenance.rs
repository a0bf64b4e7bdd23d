// Maintenance Jobs - Lease reclamation, time-elapsed triggers, score refresh and lead archival

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::store::{AutomationStore, ReclaimReport};
use crate::workflows::{LeadAutomation, ScoreRefreshReport};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    PartialFailure,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub status: JobStatus,
    pub reclaimed: ReclaimReport,
    pub time_triggers_scheduled: usize,
    pub scores: ScoreRefreshReport,
    pub archived: u64,
    pub errors: Vec<String>,
    pub duration_ms: i64,
}

pub struct MaintenanceJobs;

impl MaintenanceJobs {
    /// One pass over every periodic task. A failing step is recorded and the
    /// remaining steps still run.
    pub async fn sweep<S: AutomationStore>(automation: &LeadAutomation<S>, now: DateTime<Utc>) -> SweepReport {
        let started_at = Utc::now();
        let mut errors = Vec::new();

        // Reclaim first so executions freed here can be claimed on the next poll
        let reclaimed = automation.reclaim_expired_leases(now).await.unwrap_or_else(|e| {
            errors.push(format!("lease reclamation: {}", e));
            ReclaimReport::default()
        });

        let time_triggers_scheduled = match automation.scan_time_elapsed(now).await {
            Ok(scheduled) => scheduled.len(),
            Err(e) => {
                errors.push(format!("time-elapsed scan: {}", e));
                0
            }
        };

        let scores = automation.refresh_scores(now).await.unwrap_or_else(|e| {
            errors.push(format!("score refresh: {}", e));
            ScoreRefreshReport::default()
        });

        let archived = automation.archive_stale(now).await.unwrap_or_else(|e| {
            errors.push(format!("auto-archive: {}", e));
            0
        });

        for e in &errors {
            error!("Maintenance step failed: {}", e);
        }

        let report = SweepReport {
            started_at,
            status: if errors.is_empty() { JobStatus::Completed } else { JobStatus::PartialFailure },
            reclaimed,
            time_triggers_scheduled,
            scores,
            archived,
            errors,
            duration_ms: (Utc::now() - started_at).num_milliseconds(),
        };

        info!(
            reclaimed = report.reclaimed.returned_to_pending,
            reclaim_failed = report.reclaimed.failed,
            time_triggers = report.time_triggers_scheduled,
            rescored = report.scores.changed,
            archived = report.archived,
            duration_ms = report.duration_ms,
            "Maintenance sweep finished"
        );
        report
    }
}
