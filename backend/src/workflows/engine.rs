// Workflow Engine - Entry point of the lead automation core
//
// One `LeadAutomation` serves one tenant. Domain events flow through scoring,
// then trigger evaluation, then inline execution of anything due now. Every
// step after the event's own lead lookup is isolated: a failure in duplicate
// detection, assignment or a single execution is logged and the rest runs.

use chrono::{DateTime, Duration, Utc};
use leadflow_shared::{
    DuplicateCandidate, Engagement, EngagementKind, ExecutionStatus, Field, MergeHistoryRecord, ScoreHistoryEntry,
    WorkflowExecution,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::actions::ActionExecutor;
use super::executor::{ClaimOutcome, ExecutionReport, WorkflowExecutor};
use super::triggers::{DomainEvent, EventKind, WorkflowTriggerEvaluator};
use crate::config::{AutomationConfig, SchedulerConfig};
use crate::error::{AutomationError, AutomationResult};
use crate::leads::{
    AssignmentEngine, AssignmentOutcome, DuplicateDetector, MergeExecutor, MergeRequest, ScoreChange, ScoringEngine,
};
use crate::notifications::Notifier;
use crate::store::{AutomationStore, MergeOutcome, ReclaimReport, StoreError};

/// Everything one domain event caused
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventReport {
    pub score: Option<ScoreChange>,
    pub assignment: Option<AssignmentOutcome>,
    pub duplicates: Vec<DuplicateCandidate>,
    pub scheduled: Vec<WorkflowExecution>,
    pub executed: Vec<ExecutionReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    #[serde(flatten)]
    pub outcome: MergeOutcome,
    pub survivor_score: Option<ScoreChange>,
    pub scheduled: Vec<WorkflowExecution>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScoreRefreshReport {
    pub scanned: u64,
    pub changed: usize,
    pub failed: u64,
    pub scheduled: usize,
}

/// Page of executions for the operational view
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPage {
    pub executions: Vec<WorkflowExecution>,
    pub total: i64,
}

pub struct LeadAutomation<S> {
    store: Arc<S>,
    scoring: ScoringEngine<S>,
    assignment: AssignmentEngine<S>,
    duplicates: DuplicateDetector<S>,
    merges: MergeExecutor<S>,
    triggers: WorkflowTriggerEvaluator<S>,
    executor: WorkflowExecutor<S>,
    automation: AutomationConfig,
    scheduler: SchedulerConfig,
}

impl<S: AutomationStore> LeadAutomation<S> {
    pub fn new(
        store: Arc<S>,
        notifier: Arc<dyn Notifier>,
        automation: AutomationConfig,
        scheduler: SchedulerConfig,
    ) -> Self {
        let actions = ActionExecutor::new(
            store.clone(),
            notifier,
            std::time::Duration::from_secs(automation.webhook_timeout_secs.max(1)),
            automation.webhook_signing_secret.clone(),
        );

        Self {
            scoring: ScoringEngine::new(store.clone(), automation.score_ceiling),
            assignment: AssignmentEngine::new(store.clone()),
            duplicates: DuplicateDetector::new(
                store.clone(),
                automation.duplicate_fuzzy_threshold,
                automation.duplicate_fuzzy_pool_limit,
            ),
            merges: MergeExecutor::new(store.clone()),
            triggers: WorkflowTriggerEvaluator::new(store.clone()),
            executor: WorkflowExecutor::new(store.clone(), actions, scheduler.clone()),
            store,
            automation,
            scheduler,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn executor(&self) -> &WorkflowExecutor<S> {
        &self.executor
    }

    pub fn scheduler_config(&self) -> &SchedulerConfig {
        &self.scheduler
    }

    /// Process one domain event from the CRUD layer
    pub async fn handle_event(&self, event: &DomainEvent) -> AutomationResult<EventReport> {
        let lead_id = event.entity_id;
        let lead = self
            .store
            .get_lead(lead_id)
            .await?
            .ok_or(AutomationError::LeadNotFound(lead_id))?;

        let mut report = EventReport::default();
        if !lead.is_active || lead.merged_into_id.is_some() {
            debug!(lead_id = %lead_id, event = event.name(), "Ignoring event for inactive lead");
            return Ok(report);
        }

        if event.kind == EventKind::Created {
            match self.duplicates.detect(lead_id).await {
                Ok(found) => report.duplicates = found,
                Err(e) => warn!(lead_id = %lead_id, error = %e, "Duplicate detection failed; continuing"),
            }

            if self.automation.auto_assign_on_create && lead.owner_id.is_none() {
                match self.assignment.assign(lead_id).await {
                    Ok(outcome) => report.assignment = Some(outcome),
                    Err(e) => warn!(lead_id = %lead_id, error = %e, "Auto-assignment failed; continuing"),
                }
            }
        }

        let change = self.scoring.rescore(lead_id).await?;
        report.scheduled = self.schedule_for(event, Some(&change)).await?;
        report.score = Some(change);
        report.executed = self.run_due(&report.scheduled).await;

        info!(
            lead_id = %lead_id,
            event = event.name(),
            scheduled = report.scheduled.len(),
            executed = report.executed.len(),
            "Domain event processed"
        );
        Ok(report)
    }

    /// Evaluate the event itself and, when the score moved, the derived
    /// score-change event against the lead as it is now
    async fn schedule_for(&self, event: &DomainEvent, change: Option<&ScoreChange>) -> AutomationResult<Vec<WorkflowExecution>> {
        let lead = self
            .store
            .get_lead(event.entity_id)
            .await?
            .ok_or(AutomationError::LeadNotFound(event.entity_id))?;
        let engagements = self.store.engagement_tallies(lead.id).await?;

        let mut scheduled = self.triggers.handle(event, &lead, &engagements).await?;
        if let Some(change) = change.filter(|c| c.changed()) {
            let score_event = event.derive(
                "score",
                EventKind::ScoreChanged { previous: change.previous_score, current: change.score },
            );
            scheduled.extend(self.triggers.handle(&score_event, &lead, &engagements).await?);
        }
        Ok(scheduled)
    }

    /// Run the executions that are already due, each on its own
    async fn run_due(&self, scheduled: &[WorkflowExecution]) -> Vec<ExecutionReport> {
        let now = Utc::now();
        let mut executed = Vec::new();
        for execution in scheduled.iter().filter(|e| e.scheduled_at <= now) {
            match self.executor.run_now(execution.id).await {
                Ok(ClaimOutcome::Ran(report)) => executed.push(report),
                Ok(ClaimOutcome::Conflict) => {}
                Err(e) => warn!(execution_id = %execution.id, error = %e, "Inline execution failed"),
            }
        }
        executed
    }

    pub async fn record_engagement(
        &self,
        lead_id: Uuid,
        kind: EngagementKind,
        occurred_at: Option<DateTime<Utc>>,
    ) -> AutomationResult<EventReport> {
        let engagement = Engagement {
            id: Uuid::new_v4(),
            lead_id,
            kind,
            occurred_at: occurred_at.unwrap_or_else(Utc::now),
        };
        self.store.record_engagement(&engagement).await.map_err(|e| match e {
            StoreError::NotFound(_) => AutomationError::LeadNotFound(lead_id),
            other => other.into(),
        })?;
        info!(lead_id = %lead_id, kind = kind.as_str(), "Engagement recorded");

        let event = DomainEvent::lead_updated(lead_id, vec![Field::Engagement(kind)])
            .with_token(format!("engagement:{}", engagement.id));
        self.handle_event(&event).await
    }

    pub async fn adjust_score(&self, lead_id: Uuid, delta: i32, reason: Option<String>) -> AutomationResult<EventReport> {
        let change = self.scoring.adjust(lead_id, delta, reason).await?;
        let event = DomainEvent::score_changed(lead_id, change.previous_score, change.score);
        let mut report = EventReport {
            scheduled: if change.changed() { self.schedule_for(&event, None).await? } else { Vec::new() },
            score: Some(change),
            ..EventReport::default()
        };
        report.executed = self.run_due(&report.scheduled).await;
        Ok(report)
    }

    pub async fn score_history(&self, lead_id: Uuid) -> AutomationResult<Vec<ScoreHistoryEntry>> {
        if self.store.get_lead(lead_id).await?.is_none() {
            return Err(AutomationError::LeadNotFound(lead_id));
        }
        Ok(self.store.score_history(lead_id).await?)
    }

    pub async fn assign_lead(&self, lead_id: Uuid) -> AutomationResult<AssignmentOutcome> {
        self.assignment.assign(lead_id).await
    }

    pub async fn check_duplicates(&self, lead_id: Uuid) -> AutomationResult<Vec<DuplicateCandidate>> {
        self.duplicates.detect(lead_id).await?;
        self.duplicates.candidates_for(lead_id).await
    }

    pub async fn dismiss_duplicate(&self, candidate_id: Uuid) -> AutomationResult<DuplicateCandidate> {
        self.duplicates.dismiss(candidate_id).await
    }

    /// Merge, then rescore the survivor since it inherited the loser's
    /// engagements
    pub async fn merge_leads(&self, request: &MergeRequest) -> AutomationResult<MergeReport> {
        let outcome = self.merges.merge(request).await?;
        let survivor_id = outcome.survivor.id;

        let (survivor_score, scheduled) = match self.scoring.rescore(survivor_id).await {
            Ok(change) => {
                let event = DomainEvent::lead_updated(survivor_id, Vec::new())
                    .with_token(format!("merge:{}", outcome.record.id));
                let scheduled = self
                    .schedule_for(&event, Some(&change))
                    .await
                    .unwrap_or_else(|e| {
                        warn!(lead_id = %survivor_id, error = %e, "Post-merge trigger evaluation failed");
                        Vec::new()
                    });
                (Some(change), scheduled)
            }
            Err(e) => {
                warn!(lead_id = %survivor_id, error = %e, "Post-merge rescore failed");
                (None, Vec::new())
            }
        };
        self.run_due(&scheduled).await;

        Ok(MergeReport { outcome, survivor_score, scheduled })
    }

    pub async fn merge_history(&self, lead_id: Uuid) -> AutomationResult<Vec<MergeHistoryRecord>> {
        self.merges.history(lead_id).await
    }

    pub async fn cancel_execution(&self, id: Uuid) -> AutomationResult<WorkflowExecution> {
        let cancelled = self.store.cancel(id).await.map_err(|e| match e {
            StoreError::NotFound(_) => AutomationError::ExecutionNotFound(id),
            other => other.into(),
        })?;
        if !cancelled {
            return Err(AutomationError::NotCancellable(id));
        }
        info!(execution_id = %id, "Workflow execution cancelled");
        self.store
            .get_execution(id)
            .await?
            .ok_or(AutomationError::ExecutionNotFound(id))
    }

    pub async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
        limit: i64,
        offset: i64,
    ) -> AutomationResult<ExecutionPage> {
        let (executions, total) = self.store.list_executions(status, limit, offset).await?;
        Ok(ExecutionPage { executions, total })
    }

    // ===== Sweeps =====

    pub async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> AutomationResult<ReclaimReport> {
        let report = self.store.reclaim_expired(now, self.scheduler.max_attempts).await?;
        if report.returned_to_pending > 0 || report.failed > 0 {
            warn!(
                returned = report.returned_to_pending,
                failed = report.failed,
                "Reclaimed executions with expired leases"
            );
        }
        Ok(report)
    }

    pub async fn scan_time_elapsed(&self, now: DateTime<Utc>) -> AutomationResult<Vec<WorkflowExecution>> {
        let lookback = Duration::hours(self.scheduler.time_trigger_lookback_hours.max(1));
        self.triggers.scan_time_elapsed(now, lookback).await
    }

    /// Rescore every lead and fire threshold triggers for scores that decay
    /// moved across a band
    pub async fn refresh_scores(&self, now: DateTime<Utc>) -> AutomationResult<ScoreRefreshReport> {
        let recalculation = self.scoring.recalculate_all(self.scheduler.batch_size).await?;
        let mut report = ScoreRefreshReport {
            scanned: recalculation.scanned,
            changed: recalculation.changes.len(),
            failed: recalculation.failed,
            scheduled: 0,
        };

        for change in &recalculation.changes {
            let event = DomainEvent::score_changed(change.lead_id, change.previous_score, change.score)
                .with_token(format!("recalc:{}", now.timestamp_millis()));
            match self.schedule_for(&event, None).await {
                Ok(scheduled) => report.scheduled += scheduled.len(),
                Err(e) => warn!(lead_id = %change.lead_id, error = %e, "Score trigger evaluation failed"),
            }
        }
        Ok(report)
    }

    /// Archive open leads untouched for the configured number of days
    pub async fn archive_stale(&self, now: DateTime<Utc>) -> AutomationResult<u64> {
        let Some(days) = self.automation.archive_after_days.filter(|d| *d > 0) else {
            return Ok(0);
        };

        let mut archived = 0;
        for lead_id in self.store.stale_open_lead_ids(now - Duration::days(days)).await? {
            match self.store.archive_lead(lead_id).await {
                Ok(()) => archived += 1,
                Err(e) => warn!(lead_id = %lead_id, error = %e, "Auto-archive failed"),
            }
        }
        if archived > 0 {
            info!(archived, days, "Archived stale leads");
        }
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::{MockNotifier, Notifier};
    use crate::store::{LeadStore, MemoryStore};
    use leadflow_shared::{
        AssignmentMember, AssignmentRule, AssignmentStrategy, Condition, ConditionGroup, CrossingDirection,
        EntityType, Lead, NotificationRecipient, ScoreCategory, ScoringRule, WorkflowAction, WorkflowRule,
        WorkflowTrigger,
    };

    fn lead() -> Lead {
        let now = Utc::now();
        Lead {
            id: Uuid::new_v4(),
            first_name: "Annie".into(),
            last_name: "Easley".into(),
            email: Some("annie@example.com".into()),
            phone: None,
            company_name: None,
            job_title: None,
            source: Some("Website".into()),
            status: "new".into(),
            previous_status: None,
            city: None,
            state: None,
            country: None,
            score: 0,
            owner_id: None,
            is_active: true,
            merged_into_id: None,
            created_at: now,
            updated_at: now,
            status_changed_at: None,
            last_engagement_at: None,
            archived_at: None,
        }
    }

    fn automation(store: Arc<MemoryStore>, notifier: MockNotifier) -> LeadAutomation<MemoryStore> {
        let notifier: Arc<dyn Notifier> = Arc::new(notifier);
        LeadAutomation::new(
            store,
            notifier,
            AutomationConfig::default(),
            SchedulerConfig { worker_id: "inline".into(), ..SchedulerConfig::default() },
        )
    }

    fn scoring_rule(condition: Condition, points: i32) -> ScoringRule {
        ScoringRule {
            id: Uuid::new_v4(),
            name: "rule".into(),
            category: ScoreCategory::Behavioral,
            condition,
            points,
            decay_window_days: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    fn workflow(trigger: WorkflowTrigger, action: WorkflowAction, delay_minutes: i32) -> WorkflowRule {
        WorkflowRule {
            id: Uuid::new_v4(),
            name: "workflow".into(),
            entity_type: EntityType::Lead,
            trigger,
            condition: ConditionGroup::default(),
            action,
            delay_minutes,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn test_created_event_assigns_scores_and_runs_immediate_rules() {
        let store = Arc::new(MemoryStore::new());
        let rep = Uuid::new_v4();
        store
            .add_assignment_rule(AssignmentRule {
                id: Uuid::new_v4(),
                name: "everyone".into(),
                priority: 1,
                criteria: ConditionGroup::default(),
                strategy: AssignmentStrategy::Direct,
                members: vec![AssignmentMember {
                    rule_id: Uuid::nil(),
                    user_id: rep,
                    position: 0,
                    is_active: true,
                    max_capacity: None,
                }],
                rotation_cursor: 0,
                is_active: true,
            })
            .await;
        store
            .add_scoring_rule(scoring_rule(Condition::equals(Field::Source, "website"), 15))
            .await;
        store
            .add_workflow_rule(workflow(
                WorkflowTrigger::EntityCreated,
                WorkflowAction::CreateFollowUpActivity {
                    subject: "Intro call".into(),
                    activity_type: "call".into(),
                    due_in_days: 1,
                },
                0,
            ))
            .await;
        store
            .add_workflow_rule(workflow(WorkflowTrigger::EntityCreated, WorkflowAction::Archive, 60))
            .await;

        let lead = lead();
        store.insert_lead(lead.clone()).await;
        let automation = automation(store.clone(), MockNotifier::new());

        let report = automation.handle_event(&DomainEvent::lead_created(lead.id)).await.unwrap();
        assert_eq!(report.assignment.and_then(|a| a.owner_id()), Some(rep));
        assert_eq!(report.score.unwrap().score, 15);
        assert_eq!(report.scheduled.len(), 2);
        assert_eq!(report.executed.len(), 1);

        let activities = store.activities_for(lead.id).await;
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].owner_id, Some(rep));

        let pending: Vec<_> = store
            .all_executions()
            .await
            .into_iter()
            .filter(|e| e.status == ExecutionStatus::Pending)
            .collect();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_threshold_crossing_fires_once() {
        let store = Arc::new(MemoryStore::new());
        let owner = Uuid::new_v4();
        store
            .add_workflow_rule(workflow(
                WorkflowTrigger::ScoreThresholdCrossed { min: 50, max: 100, direction: CrossingDirection::Into },
                WorkflowAction::SendNotification {
                    recipient: NotificationRecipient::Owner,
                    title: "{{full_name}} is hot".into(),
                    body: "Score {{score}}".into(),
                },
                0,
            ))
            .await;
        let mut lead = lead();
        lead.owner_id = Some(owner);
        store.insert_lead(lead.clone()).await;

        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(move |n| n.user_id == owner && n.body == "Score 60")
            .times(1)
            .returning(|_| Ok(()));
        let automation = automation(store.clone(), notifier);

        let first = automation.adjust_score(lead.id, 60, Some("demo".into())).await.unwrap();
        assert_eq!(first.executed.len(), 1);

        // Moving within the band does not fire again
        let second = automation.adjust_score(lead.id, 10, None).await.unwrap();
        assert!(second.scheduled.is_empty());
    }

    #[tokio::test]
    async fn test_engagement_rescores_lead() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_scoring_rule(scoring_rule(
                Condition::greater_than(Field::Engagement(EngagementKind::MeetingBooked), 0.0),
                25,
            ))
            .await;
        let lead = lead();
        store.insert_lead(lead.clone()).await;
        let automation = automation(store.clone(), MockNotifier::new());

        let report = automation
            .record_engagement(lead.id, EngagementKind::MeetingBooked, None)
            .await
            .unwrap();
        assert_eq!(report.score.unwrap().score, 25);
        assert_eq!(store.get_lead(lead.id).await.unwrap().unwrap().score, 25);

        let missing = automation.record_engagement(Uuid::new_v4(), EngagementKind::CallLogged, None).await;
        assert!(matches!(missing, Err(AutomationError::LeadNotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_only_while_pending() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_workflow_rule(workflow(WorkflowTrigger::EntityCreated, WorkflowAction::Archive, 30))
            .await;
        let lead = lead();
        store.insert_lead(lead.clone()).await;
        let automation = automation(store.clone(), MockNotifier::new());

        let report = automation.handle_event(&DomainEvent::lead_created(lead.id)).await.unwrap();
        let id = report.scheduled[0].id;

        let cancelled = automation.cancel_execution(id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert!(matches!(automation.cancel_execution(id).await, Err(AutomationError::NotCancellable(_))));
        assert!(matches!(
            automation.cancel_execution(Uuid::new_v4()).await,
            Err(AutomationError::ExecutionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_merge_rescores_survivor_with_inherited_engagements() {
        let store = Arc::new(MemoryStore::new());
        store
            .add_scoring_rule(scoring_rule(
                Condition::greater_than(Field::Engagement(EngagementKind::FormSubmitted), 0.0),
                30,
            ))
            .await;
        let survivor = lead();
        let loser = lead();
        store.insert_lead(survivor.clone()).await;
        store.insert_lead(loser.clone()).await;
        let automation = automation(store.clone(), MockNotifier::new());
        automation
            .record_engagement(loser.id, EngagementKind::FormSubmitted, None)
            .await
            .unwrap();

        let report = automation
            .merge_leads(&MergeRequest {
                survivor_id: survivor.id,
                loser_id: loser.id,
                resolutions: vec![],
                actor_id: None,
            })
            .await
            .unwrap();
        assert_eq!(report.survivor_score.unwrap().score, 30);
        assert_eq!(report.outcome.record.loser_id, loser.id);
    }

    #[tokio::test]
    async fn test_archive_stale_is_off_by_default() {
        let store = Arc::new(MemoryStore::new());
        let mut old = lead();
        old.updated_at = Utc::now() - Duration::days(400);
        store.insert_lead(old).await;
        let automation = automation(store, MockNotifier::new());
        assert_eq!(automation.archive_stale(Utc::now()).await.unwrap(), 0);
    }
}
