// Workflow Executor - Drives claimed executions to a terminal state

use chrono::{DateTime, Duration, Utc};
use leadflow_shared::{ExecutionStatus, WorkflowExecution};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::actions::{ActionExecutor, ActionResult};
use crate::config::SchedulerConfig;
use crate::error::AutomationResult;
use crate::store::{AssignmentStore, ExecutionStore, LeadStore, RuleStore};

/// How one claimed execution ended
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionReport {
    pub execution_id: Uuid,
    pub rule_id: Uuid,
    pub status: ExecutionStatus,
    pub attempts: i32,
    pub result: ActionResult,
    /// Set when a failed attempt was put back for another try
    pub retry_at: Option<DateTime<Utc>>,
    /// `false` when our lease was gone before we could record the result
    pub recorded: bool,
}

/// Claiming is a race; losing it is a normal outcome
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "claim", rename_all = "snake_case")]
pub enum ClaimOutcome {
    Ran(ExecutionReport),
    /// Another worker claimed it first, or it was cancelled
    Conflict,
}

pub struct WorkflowExecutor<S> {
    store: Arc<S>,
    actions: ActionExecutor<S>,
    config: SchedulerConfig,
}

impl<S> WorkflowExecutor<S>
where
    S: RuleStore + LeadStore + AssignmentStore + ExecutionStore,
{
    pub fn new(store: Arc<S>, actions: ActionExecutor<S>, config: SchedulerConfig) -> Self {
        Self { store, actions, config }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.config.lease_secs.max(1))
    }

    /// Claim every due execution this worker has room for
    pub async fn claim_due(&self, now: DateTime<Utc>) -> AutomationResult<Vec<WorkflowExecution>> {
        let claimed = self
            .store
            .claim_due(self.worker_id(), now, self.lease_until(now), self.config.batch_size.max(1))
            .await?;
        if !claimed.is_empty() {
            debug!(worker = self.worker_id(), count = claimed.len(), "Claimed due executions");
        }
        Ok(claimed)
    }

    /// Claim one execution and run it inline
    pub async fn run_now(&self, id: Uuid) -> AutomationResult<ClaimOutcome> {
        let claimed = self.store.claim(id, self.worker_id(), self.lease_until(Utc::now())).await?;
        match claimed {
            Some(execution) => Ok(ClaimOutcome::Ran(self.run_claimed(&execution).await?)),
            None => {
                debug!(execution_id = %id, "Execution already claimed elsewhere");
                Ok(ClaimOutcome::Conflict)
            }
        }
    }

    /// Run an execution this worker holds the claim on and record the result
    pub async fn run_claimed(&self, execution: &WorkflowExecution) -> AutomationResult<ExecutionReport> {
        let rule = self.store.workflow_rule(execution.rule_id).await?;

        let result = match &rule {
            Some(rule) if rule.is_active => self.actions.execute(rule, execution).await,
            Some(_) => {
                info!(execution_id = %execution.id, rule_id = %execution.rule_id, "Rule deactivated; skipping");
                ActionResult::skipped("rule inactive")
            }
            None => {
                warn!(execution_id = %execution.id, rule_id = %execution.rule_id, "Rule no longer exists; skipping");
                ActionResult::skipped("rule deleted")
            }
        };

        if result.success {
            let recorded = self
                .store
                .complete(execution.id, self.worker_id(), result.output.clone())
                .await?;
            if recorded {
                info!(
                    execution_id = %execution.id,
                    rule_id = %execution.rule_id,
                    duration_ms = result.duration_ms,
                    "Workflow execution completed"
                );
            } else {
                warn!(execution_id = %execution.id, "Lease lost before completion was recorded");
            }
            return Ok(self.report(execution, ExecutionStatus::Completed, result, None, recorded));
        }

        let reason = result.error.clone().unwrap_or_else(|| "action failed".to_string());
        let retry_at = (execution.attempts < self.config.max_attempts)
            .then(|| Utc::now() + self.config.backoff_for(execution.attempts));
        let recorded = self
            .store
            .fail(execution.id, self.worker_id(), &reason, retry_at)
            .await?;

        let status = match retry_at {
            Some(at) => {
                warn!(
                    execution_id = %execution.id,
                    attempt = execution.attempts,
                    max_attempts = self.config.max_attempts,
                    retry_at = %at,
                    error = %reason,
                    "Workflow execution failed; will retry"
                );
                ExecutionStatus::Pending
            }
            None => {
                error!(
                    execution_id = %execution.id,
                    rule_id = %execution.rule_id,
                    attempts = execution.attempts,
                    error = %reason,
                    "Workflow execution failed permanently"
                );
                ExecutionStatus::Failed
            }
        };
        if !recorded {
            warn!(execution_id = %execution.id, "Lease lost before failure was recorded");
        }
        Ok(self.report(execution, status, result, retry_at, recorded))
    }

    fn report(
        &self,
        execution: &WorkflowExecution,
        status: ExecutionStatus,
        result: ActionResult,
        retry_at: Option<DateTime<Utc>>,
        recorded: bool,
    ) -> ExecutionReport {
        ExecutionReport {
            execution_id: execution.id,
            rule_id: execution.rule_id,
            status,
            attempts: execution.attempts,
            result,
            retry_at,
            recorded,
        }
    }
}
