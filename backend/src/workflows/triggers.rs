// Workflow Triggers - Domain events and the rules they schedule

use chrono::{DateTime, Duration, Utc};
use leadflow_shared::{
    CrossingDirection, EntityType, ExecutionStatus, Field, Lead, WorkflowExecution, WorkflowRule,
    WorkflowTrigger,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::conditions::{evaluate_group, LeadFacts};
use crate::error::{AutomationError, AutomationResult};
use crate::store::{EngagementTally, ExecutionStore, LeadStore, RuleStore};

/// What happened to the entity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated {
        #[serde(default)]
        changed_fields: Vec<Field>,
    },
    StatusChanged {
        #[serde(default)]
        from: Option<String>,
        to: String,
    },
    ScoreChanged {
        previous: i32,
        current: i32,
    },
}

/// A change to an entity, as delivered by the CRUD layer. Deliveries are
/// at-least-once; `token` identifies the delivery so a redelivered event
/// schedules nothing new.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainEvent {
    pub token: String,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    #[serde(flatten)]
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(entity_id: Uuid, kind: EventKind) -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            entity_type: EntityType::Lead,
            entity_id,
            kind,
            occurred_at: Utc::now(),
        }
    }

    pub fn lead_created(lead_id: Uuid) -> Self {
        Self::new(lead_id, EventKind::Created)
    }

    pub fn lead_updated(lead_id: Uuid, changed_fields: Vec<Field>) -> Self {
        Self::new(lead_id, EventKind::Updated { changed_fields })
    }

    pub fn status_changed(lead_id: Uuid, from: Option<String>, to: &str) -> Self {
        Self::new(lead_id, EventKind::StatusChanged { from, to: to.to_string() })
    }

    pub fn score_changed(lead_id: Uuid, previous: i32, current: i32) -> Self {
        Self::new(lead_id, EventKind::ScoreChanged { previous, current })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// A follow-on event caused by this one, with a token derived from it so
    /// a redelivery produces the same follow-on token
    pub fn derive(&self, suffix: &str, kind: EventKind) -> Self {
        Self {
            token: format!("{}/{}", self.token, suffix),
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            kind,
            occurred_at: self.occurred_at,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            EventKind::Created => "created",
            EventKind::Updated { .. } => "updated",
            EventKind::StatusChanged { .. } => "status_changed",
            EventKind::ScoreChanged { .. } => "score_changed",
        }
    }
}

fn same_status(expected: &Option<String>, actual: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(expected) => actual.is_some_and(|a| a.trim().eq_ignore_ascii_case(expected.trim())),
    }
}

/// Whether the band `[min, max]` was entered or left in the requested
/// direction. Staying inside or outside never fires.
pub fn crossed_band(min: i32, max: i32, direction: CrossingDirection, previous: i32, current: i32) -> bool {
    let inside = |score: i32| min <= score && score <= max;
    let (was, is) = (inside(previous), inside(current));
    match direction {
        CrossingDirection::Into => !was && is,
        CrossingDirection::OutOf => was && !is,
        CrossingDirection::Either => was != is,
    }
}

/// Push-style trigger matching. Time-elapsed triggers are never pushed.
pub fn trigger_matches(trigger: &WorkflowTrigger, event: &DomainEvent) -> bool {
    match (trigger, &event.kind) {
        (WorkflowTrigger::EntityCreated, EventKind::Created) => true,
        (WorkflowTrigger::EntityUpdated { fields }, EventKind::Updated { changed_fields }) => {
            fields.is_empty() || fields.iter().any(|f| changed_fields.contains(f))
        }
        (WorkflowTrigger::StatusChanged { from, to }, EventKind::StatusChanged { from: old, to: new }) => {
            same_status(from, old.as_deref()) && same_status(to, Some(new))
        }
        (
            WorkflowTrigger::ScoreThresholdCrossed { min, max, direction },
            EventKind::ScoreChanged { previous, current },
        ) => crossed_band(*min, *max, *direction, *previous, *current),
        _ => false,
    }
}

/// A pending execution of `rule` for `entity_id`
pub fn pending_execution(rule: &WorkflowRule, entity_id: Uuid, token: &str, now: DateTime<Utc>) -> WorkflowExecution {
    WorkflowExecution {
        id: Uuid::new_v4(),
        rule_id: rule.id,
        entity_type: rule.entity_type,
        entity_id,
        scheduled_at: now + Duration::minutes(rule.delay_minutes.max(0) as i64),
        status: ExecutionStatus::Pending,
        attempts: 0,
        last_error: None,
        idempotency_key: WorkflowExecution::idempotency_key_for(rule.id, entity_id, token),
        claimed_by: None,
        lease_expires_at: None,
        outcome: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    }
}

fn condition_holds(rule: &WorkflowRule, facts: &LeadFacts<'_>) -> bool {
    match evaluate_group(&rule.condition, facts) {
        Ok(matched) => matched,
        Err(e) => {
            let error = AutomationError::RuleEvaluation { rule_id: rule.id, reason: e.to_string() };
            warn!(lead_id = %facts.lead.id, error = %error, "Skipping workflow rule");
            false
        }
    }
}

/// Executions `event` asks for. Pure: nothing is stored.
pub fn evaluate(
    event: &DomainEvent,
    lead: &Lead,
    engagements: &[EngagementTally],
    rules: &[WorkflowRule],
    now: DateTime<Utc>,
) -> Vec<WorkflowExecution> {
    let facts = LeadFacts::new(lead, engagements);
    rules
        .iter()
        .filter(|rule| rule.is_active && rule.entity_type == event.entity_type)
        .filter(|rule| trigger_matches(&rule.trigger, event))
        .filter(|rule| condition_holds(rule, &facts))
        .map(|rule| pending_execution(rule, event.entity_id, &event.token, now))
        .collect()
}

/// Token for a time-elapsed firing. One per reference instant, so a lead
/// fires again only after the reference timestamp moves.
pub fn elapsed_token(rule: &WorkflowRule, reference_at: DateTime<Utc>) -> String {
    let since = match &rule.trigger {
        WorkflowTrigger::TimeElapsed { since, .. } => since.as_str(),
        _ => "event",
    };
    format!("elapsed:{}:{}", since, reference_at.timestamp_millis())
}

pub struct WorkflowTriggerEvaluator<S> {
    store: Arc<S>,
}

impl<S> WorkflowTriggerEvaluator<S>
where
    S: RuleStore + LeadStore + ExecutionStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn schedule_all(&self, candidates: Vec<WorkflowExecution>) -> AutomationResult<Vec<WorkflowExecution>> {
        let mut scheduled = Vec::with_capacity(candidates.len());
        for execution in candidates {
            if self.store.schedule(&execution).await? {
                info!(
                    execution_id = %execution.id,
                    rule_id = %execution.rule_id,
                    entity_id = %execution.entity_id,
                    scheduled_at = %execution.scheduled_at,
                    "Workflow execution scheduled"
                );
                scheduled.push(execution);
            } else {
                debug!(key = %execution.idempotency_key, "Execution already scheduled for this event");
            }
        }
        Ok(scheduled)
    }

    /// Evaluate `event` against the active rules and store the new
    /// executions. Returns only the executions that were actually created.
    pub async fn handle(
        &self,
        event: &DomainEvent,
        lead: &Lead,
        engagements: &[EngagementTally],
    ) -> AutomationResult<Vec<WorkflowExecution>> {
        let rules = self.store.active_workflow_rules().await?;
        let candidates = evaluate(event, lead, engagements, &rules, Utc::now());
        self.schedule_all(candidates).await
    }

    /// Scan for leads whose reference timestamp passed a time-elapsed rule's
    /// threshold within the last `lookback`
    pub async fn scan_time_elapsed(
        &self,
        now: DateTime<Utc>,
        lookback: Duration,
    ) -> AutomationResult<Vec<WorkflowExecution>> {
        let rules = self.store.active_workflow_rules().await?;
        let mut scheduled = Vec::new();

        for rule in &rules {
            let WorkflowTrigger::TimeElapsed { since, minutes } = &rule.trigger else {
                continue;
            };
            let window = Duration::try_minutes((*minutes).max(0))
                .and_then(|elapsed| now.checked_sub_signed(elapsed))
                .and_then(|threshold| Some((threshold.checked_sub_signed(lookback)?, threshold)));
            let Some((window_start, threshold)) = window else {
                warn!(rule_id = %rule.id, minutes, "Time-elapsed threshold out of range, skipping rule");
                continue;
            };
            let leads = self
                .store
                .leads_with_reference_between(*since, window_start, threshold)
                .await?;

            let mut candidates = Vec::new();
            for lead in &leads {
                let Some(reference_at) = since.timestamp_of(lead) else {
                    continue;
                };
                let engagements = self.store.engagement_tallies(lead.id).await?;
                if condition_holds(rule, &LeadFacts::new(lead, &engagements)) {
                    candidates.push(pending_execution(rule, lead.id, &elapsed_token(rule, reference_at), now));
                }
            }
            scheduled.extend(self.schedule_all(candidates).await?);
        }

        if !scheduled.is_empty() {
            info!(count = scheduled.len(), "Time-elapsed executions scheduled");
        }
        Ok(scheduled)
    }
}
