//! In-process store used by tests and local tooling
//!
//! All state sits behind one async mutex, so every trait method is atomic the
//! same way a single SQL statement or transaction is. Merges run against a
//! copy of the state and only replace it when every step succeeded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadflow_shared::{
    AssignmentRule, CandidateStatus, DuplicateCandidate, Engagement, ExecutionStatus, Field,
    FollowUpActivity, Lead, MergeHistoryRecord, ScoreHistoryEntry, ScoringRule, TimeReference,
    WorkflowExecution, WorkflowRule,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AssignmentStore, DependentTable, DuplicateStore, EngagementTally, ExecutionStore, FieldSource,
    LeadStore, MergeOutcome, MergePlan, MergeStore, ReclaimReport, RuleStore, StoreError,
    StoreResult, normalize_email, normalize_phone,
};

#[derive(Debug, Clone)]
struct DependentRecord {
    id: Uuid,
    table: DependentTable,
    lead_id: Uuid,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    leads: HashMap<Uuid, Lead>,
    inactive_users: HashSet<Uuid>,
    scoring_rules: Vec<ScoringRule>,
    assignment_rules: Vec<AssignmentRule>,
    workflow_rules: Vec<WorkflowRule>,
    history: Vec<ScoreHistoryEntry>,
    engagements: Vec<Engagement>,
    activities: Vec<FollowUpActivity>,
    records: Vec<DependentRecord>,
    candidates: Vec<DuplicateCandidate>,
    merges: Vec<MergeHistoryRecord>,
    executions: Vec<WorkflowExecution>,
    fail_merge_at: Option<DependentTable>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_lead(&self, lead: Lead) {
        self.state.lock().await.leads.insert(lead.id, lead);
    }

    pub async fn add_scoring_rule(&self, rule: ScoringRule) {
        self.state.lock().await.scoring_rules.push(rule);
    }

    pub async fn add_assignment_rule(&self, rule: AssignmentRule) {
        self.state.lock().await.assignment_rules.push(rule);
    }

    pub async fn add_workflow_rule(&self, rule: WorkflowRule) {
        self.state.lock().await.workflow_rules.push(rule);
    }

    pub async fn set_workflow_rule_active(&self, rule_id: Uuid, active: bool) {
        let mut state = self.state.lock().await;
        if let Some(rule) = state.workflow_rules.iter_mut().find(|r| r.id == rule_id) {
            rule.is_active = active;
        }
    }

    pub async fn set_scoring_rule_active(&self, rule_id: Uuid, active: bool) {
        let mut state = self.state.lock().await;
        if let Some(rule) = state.scoring_rules.iter_mut().find(|r| r.id == rule_id) {
            rule.is_active = active;
        }
    }

    pub async fn deactivate_user(&self, user_id: Uuid) {
        self.state.lock().await.inactive_users.insert(user_id);
    }

    /// Attach a communication, opportunity or note row to a lead
    pub async fn insert_dependent(&self, table: DependentTable, lead_id: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().await.records.push(DependentRecord { id, table, lead_id });
        id
    }

    pub async fn dependent_count(&self, table: DependentTable, lead_id: Uuid) -> usize {
        let state = self.state.lock().await;
        match table {
            DependentTable::Activities => state.activities.iter().filter(|a| a.lead_id == lead_id).count(),
            DependentTable::Engagements => state.engagements.iter().filter(|e| e.lead_id == lead_id).count(),
            _ => state
                .records
                .iter()
                .filter(|r| r.table == table && r.lead_id == lead_id)
                .count(),
        }
    }

    pub async fn activities_for(&self, lead_id: Uuid) -> Vec<FollowUpActivity> {
        let state = self.state.lock().await;
        state.activities.iter().filter(|a| a.lead_id == lead_id).cloned().collect()
    }

    pub async fn all_candidates(&self) -> Vec<DuplicateCandidate> {
        self.state.lock().await.candidates.clone()
    }

    pub async fn all_executions(&self) -> Vec<WorkflowExecution> {
        self.state.lock().await.executions.clone()
    }

    pub async fn rotation_cursor(&self, rule_id: Uuid) -> Option<i64> {
        let state = self.state.lock().await;
        state
            .assignment_rules
            .iter()
            .find(|r| r.id == rule_id)
            .map(|r| r.rotation_cursor)
    }

    /// Overwrite an execution row, e.g. to age a lease in a test
    pub async fn put_execution(&self, execution: WorkflowExecution) {
        let mut state = self.state.lock().await;
        state.executions.retain(|e| e.id != execution.id);
        state.executions.push(execution);
    }

    /// Make the next merge fail while moving rows of `table`
    pub async fn fail_merge_on(&self, table: Option<DependentTable>) {
        self.state.lock().await.fail_merge_at = table;
    }
}

fn is_live(lead: &Lead) -> bool {
    lead.is_active && lead.merged_into_id.is_none()
}

fn read_text(lead: &Lead, field: Field) -> StoreResult<Option<String>> {
    if !field.is_writable() {
        return Err(StoreError::Conflict(format!("field {} is not writable", field)));
    }
    Ok(lead.text_value(field).map(str::to_string))
}

fn write_text(lead: &mut Lead, field: Field, value: Option<String>, now: DateTime<Utc>) -> StoreResult<()> {
    match field {
        Field::FirstName => lead.first_name = value.unwrap_or_default(),
        Field::LastName => lead.last_name = value.unwrap_or_default(),
        Field::Email => lead.email = value,
        Field::Phone => lead.phone = value,
        Field::CompanyName => lead.company_name = value,
        Field::JobTitle => lead.job_title = value,
        Field::Source => lead.source = value,
        Field::Status => {
            let next = value.unwrap_or_default();
            if next != lead.status {
                lead.previous_status = Some(std::mem::replace(&mut lead.status, next));
                lead.status_changed_at = Some(now);
            }
        }
        Field::City => lead.city = value,
        Field::State => lead.state = value,
        Field::Country => lead.country = value,
        other => return Err(StoreError::Conflict(format!("field {} is not writable", other))),
    }
    lead.updated_at = now;
    Ok(())
}

fn lead_mut(state: &mut MemoryState, id: Uuid) -> StoreResult<&mut Lead> {
    state
        .leads
        .get_mut(&id)
        .ok_or_else(|| StoreError::NotFound(format!("Lead {}", id)))
}

fn execution_mut(state: &mut MemoryState, id: Uuid) -> Option<&mut WorkflowExecution> {
    state.executions.iter_mut().find(|e| e.id == id)
}

fn claim_in_place(execution: &mut WorkflowExecution, worker: &str, lease_until: DateTime<Utc>, now: DateTime<Utc>) {
    execution.status = ExecutionStatus::Executing;
    execution.claimed_by = Some(worker.to_string());
    execution.lease_expires_at = Some(lease_until);
    execution.attempts += 1;
    execution.updated_at = now;
}

fn held_by(execution: &WorkflowExecution, worker: &str) -> bool {
    execution.status == ExecutionStatus::Executing && execution.claimed_by.as_deref() == Some(worker)
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn active_scoring_rules(&self) -> StoreResult<Vec<ScoringRule>> {
        let state = self.state.lock().await;
        Ok(state.scoring_rules.iter().filter(|r| r.is_active).cloned().collect())
    }

    async fn active_assignment_rules(&self) -> StoreResult<Vec<AssignmentRule>> {
        let state = self.state.lock().await;
        let mut rules: Vec<AssignmentRule> = state
            .assignment_rules
            .iter()
            .filter(|r| r.is_active)
            .cloned()
            .collect();
        // stable sort keeps insertion order for equal priorities
        rules.sort_by_key(|r| r.priority);
        for rule in &mut rules {
            rule.members.sort_by_key(|m| m.position);
        }
        Ok(rules)
    }

    async fn active_workflow_rules(&self) -> StoreResult<Vec<WorkflowRule>> {
        let state = self.state.lock().await;
        Ok(state.workflow_rules.iter().filter(|r| r.is_active).cloned().collect())
    }

    async fn workflow_rule(&self, id: Uuid) -> StoreResult<Option<WorkflowRule>> {
        let state = self.state.lock().await;
        Ok(state.workflow_rules.iter().find(|r| r.id == id).cloned())
    }
}

#[async_trait]
impl LeadStore for MemoryStore {
    async fn get_lead(&self, id: Uuid) -> StoreResult<Option<Lead>> {
        Ok(self.state.lock().await.leads.get(&id).cloned())
    }

    async fn active_leads_by_email(&self, email: &str, exclude: Uuid) -> StoreResult<Vec<Lead>> {
        let state = self.state.lock().await;
        Ok(state
            .leads
            .values()
            .filter(|l| l.id != exclude && is_live(l))
            .filter(|l| normalize_email(l.email.as_deref()).as_deref() == Some(email))
            .cloned()
            .collect())
    }

    async fn active_leads_by_phone(&self, digits: &str, exclude: Uuid) -> StoreResult<Vec<Lead>> {
        let state = self.state.lock().await;
        Ok(state
            .leads
            .values()
            .filter(|l| l.id != exclude && is_live(l))
            .filter(|l| normalize_phone(l.phone.as_deref()).as_deref() == Some(digits))
            .cloned()
            .collect())
    }

    async fn fuzzy_match_pool(&self, exclude: Uuid, limit: i64) -> StoreResult<Vec<Lead>> {
        let state = self.state.lock().await;
        let mut pool: Vec<Lead> = state
            .leads
            .values()
            .filter(|l| l.id != exclude && is_live(l))
            .filter(|l| l.company_name.as_deref().is_some_and(|c| !c.trim().is_empty()))
            .cloned()
            .collect();
        pool.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        pool.truncate(limit.max(0) as usize);
        Ok(pool)
    }

    async fn active_lead_ids(&self, after: Option<Uuid>, limit: i64) -> StoreResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        let mut ids: Vec<Uuid> = state
            .leads
            .values()
            .filter(|l| is_live(l))
            .map(|l| l.id)
            .filter(|id| after.is_none_or(|a| *id > a))
            .collect();
        ids.sort();
        ids.truncate(limit.max(0) as usize);
        Ok(ids)
    }

    async fn leads_with_reference_between(
        &self,
        reference: TimeReference,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Lead>> {
        let state = self.state.lock().await;
        Ok(state
            .leads
            .values()
            .filter(|l| is_live(l))
            .filter(|l| {
                reference
                    .timestamp_of(l)
                    .is_some_and(|at| at >= from && at < to)
            })
            .cloned()
            .collect())
    }

    async fn stale_open_lead_ids(&self, before: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        Ok(state
            .leads
            .values()
            .filter(|l| is_live(l) && l.archived_at.is_none() && l.updated_at < before)
            .map(|l| l.id)
            .collect())
    }

    async fn score_history(&self, lead_id: Uuid) -> StoreResult<Vec<ScoreHistoryEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<ScoreHistoryEntry> = state
            .history
            .iter()
            .filter(|e| e.lead_id == lead_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    async fn engagement_tallies(&self, lead_id: Uuid) -> StoreResult<Vec<EngagementTally>> {
        let state = self.state.lock().await;
        let mut tallies: BTreeMap<_, EngagementTally> = BTreeMap::new();
        for engagement in state.engagements.iter().filter(|e| e.lead_id == lead_id) {
            tallies
                .entry(engagement.kind)
                .and_modify(|t| {
                    t.count += 1;
                    t.latest_at = t.latest_at.max(engagement.occurred_at);
                })
                .or_insert(EngagementTally {
                    kind: engagement.kind,
                    count: 1,
                    latest_at: engagement.occurred_at,
                });
        }
        Ok(tallies.into_values().collect())
    }

    async fn record_engagement(&self, engagement: &Engagement) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let lead = lead_mut(&mut state, engagement.lead_id)?;
        lead.last_engagement_at = Some(
            lead.last_engagement_at
                .map_or(engagement.occurred_at, |at| at.max(engagement.occurred_at)),
        );
        state.engagements.push(engagement.clone());
        Ok(())
    }

    async fn apply_score(
        &self,
        lead_id: Uuid,
        seen: usize,
        score: i32,
        entries: &[ScoreHistoryEntry],
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        lead_mut(&mut state, lead_id)?;
        if state.history.iter().filter(|e| e.lead_id == lead_id).count() != seen {
            return Ok(false);
        }
        lead_mut(&mut state, lead_id)?.score = score;
        state.history.extend_from_slice(entries);
        Ok(true)
    }

    async fn set_owner(&self, lead_id: Uuid, owner_id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let lead = lead_mut(&mut state, lead_id)?;
        lead.owner_id = Some(owner_id);
        lead.updated_at = Utc::now();
        Ok(())
    }

    async fn set_field(&self, lead_id: Uuid, field: Field, value: Option<String>) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        write_text(lead_mut(&mut state, lead_id)?, field, value, Utc::now())
    }

    async fn archive_lead(&self, lead_id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let lead = lead_mut(&mut state, lead_id)?;
        if lead.archived_at.is_none() {
            lead.archived_at = Some(now);
            write_text(lead, Field::Status, Some("archived".to_string()), now)?;
        }
        Ok(())
    }

    async fn create_activity(&self, activity: &FollowUpActivity) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        lead_mut(&mut state, activity.lead_id)?;
        state.activities.push(activity.clone());
        Ok(())
    }
}

#[async_trait]
impl AssignmentStore for MemoryStore {
    async fn advance_cursor(&self, rule_id: Uuid) -> StoreResult<i64> {
        let mut state = self.state.lock().await;
        let rule = state
            .assignment_rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| StoreError::NotFound(format!("Assignment rule {}", rule_id)))?;
        let before = rule.rotation_cursor;
        rule.rotation_cursor += 1;
        Ok(before)
    }

    async fn open_lead_counts(&self, user_ids: &[Uuid]) -> StoreResult<HashMap<Uuid, i64>> {
        let state = self.state.lock().await;
        let mut counts: HashMap<Uuid, i64> = user_ids.iter().map(|id| (*id, 0)).collect();
        for lead in state.leads.values().filter(|l| l.is_open() && l.merged_into_id.is_none()) {
            if let Some(count) = lead.owner_id.and_then(|owner| counts.get_mut(&owner)) {
                *count += 1;
            }
        }
        Ok(counts)
    }

    async fn active_user_ids(&self, user_ids: &[Uuid]) -> StoreResult<HashSet<Uuid>> {
        let state = self.state.lock().await;
        Ok(user_ids
            .iter()
            .filter(|id| !state.inactive_users.contains(id))
            .copied()
            .collect())
    }
}

#[async_trait]
impl DuplicateStore for MemoryStore {
    async fn upsert_candidates(&self, candidates: &[DuplicateCandidate]) -> StoreResult<Vec<DuplicateCandidate>> {
        let mut state = self.state.lock().await;
        let mut stored = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match state.candidates.iter_mut().find(|c| c.pair() == candidate.pair()) {
                Some(existing) => {
                    if existing.status == CandidateStatus::Open && candidate.confidence > existing.confidence {
                        existing.confidence = candidate.confidence;
                        existing.basis = candidate.basis;
                        existing.detected_at = candidate.detected_at;
                    }
                    stored.push(existing.clone());
                }
                None => {
                    state.candidates.push(candidate.clone());
                    stored.push(candidate.clone());
                }
            }
        }
        Ok(stored)
    }

    async fn candidates_for(&self, lead_id: Uuid) -> StoreResult<Vec<DuplicateCandidate>> {
        let state = self.state.lock().await;
        Ok(state
            .candidates
            .iter()
            .filter(|c| c.involves(lead_id))
            .cloned()
            .collect())
    }

    async fn dismiss_candidate(&self, id: Uuid) -> StoreResult<Option<DuplicateCandidate>> {
        let mut state = self.state.lock().await;
        Ok(state.candidates.iter_mut().find(|c| c.id == id).map(|c| {
            if c.status == CandidateStatus::Open {
                c.status = CandidateStatus::Dismissed;
                c.resolved_at = Some(Utc::now());
            }
            c.clone()
        }))
    }
}

fn apply_merge(state: &mut MemoryState, plan: &MergePlan) -> StoreResult<MergeOutcome> {
    let now = Utc::now();
    let (survivor_id, loser_id) = (plan.survivor_id, plan.loser_id);

    for id in [survivor_id, loser_id] {
        let lead = state
            .leads
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("Lead {}", id)))?;
        if !is_live(lead) {
            return Err(StoreError::Conflict(format!("lead {} is no longer active", id)));
        }
    }

    let mut reassigned = BTreeMap::new();
    for table in DependentTable::ALL {
        if state.fail_merge_at == Some(table) {
            return Err(StoreError::Conflict(format!("failed moving {}", table.table_name())));
        }
        let moved = match table {
            DependentTable::Activities => state
                .activities
                .iter_mut()
                .filter(|a| a.lead_id == loser_id)
                .map(|a| a.lead_id = survivor_id)
                .count(),
            DependentTable::Engagements => state
                .engagements
                .iter_mut()
                .filter(|e| e.lead_id == loser_id)
                .map(|e| e.lead_id = survivor_id)
                .count(),
            _ => state
                .records
                .iter_mut()
                .filter(|r| r.table == table && r.lead_id == loser_id)
                .map(|r| r.lead_id = survivor_id)
                .count(),
        };
        reassigned.insert(table, moved as u64);
    }

    // The merged pair closes; the loser's other pairs follow the survivor
    // unless the survivor already has a row for that counterpart.
    let survivor_pairs: HashSet<(Uuid, Uuid)> = state
        .candidates
        .iter()
        .filter(|c| c.involves(survivor_id))
        .map(|c| c.pair())
        .collect();
    for candidate in state.candidates.iter_mut().filter(|c| c.involves(loser_id)) {
        let other = candidate.counterpart(loser_id);
        let repointed = DuplicateCandidate::new(survivor_id, other, candidate.basis, candidate.confidence);
        if other == survivor_id || survivor_pairs.contains(&repointed.pair()) {
            if candidate.status == CandidateStatus::Open {
                candidate.status = CandidateStatus::Merged;
                candidate.resolved_at = Some(now);
            }
        } else {
            candidate.lead_a_id = repointed.lead_a_id;
            candidate.lead_b_id = repointed.lead_b_id;
        }
    }

    let loser = state
        .leads
        .get(&loser_id)
        .cloned()
        .ok_or_else(|| StoreError::NotFound(format!("Lead {}", loser_id)))?;
    let mut applied = Vec::with_capacity(plan.updates.len());
    let survivor = lead_mut(state, survivor_id)?;
    for (field, source) in &plan.updates {
        let value = match source {
            FieldSource::Loser => read_text(&loser, *field)?,
            FieldSource::Literal(value) => value.clone(),
        };
        write_text(survivor, *field, value.clone(), now)?;
        applied.push(serde_json::json!({ "field": field, "value": value }));
    }
    let survivor = survivor.clone();

    let loser = lead_mut(state, loser_id)?;
    loser.is_active = false;
    loser.merged_into_id = Some(survivor_id);
    loser.updated_at = now;

    let record = MergeHistoryRecord {
        id: Uuid::new_v4(),
        survivor_id,
        loser_id,
        resolutions: serde_json::json!({
            "requested": plan.resolutions,
            "applied": applied,
        }),
        reassigned: serde_json::to_value(&reassigned)?,
        actor_id: plan.actor_id,
        merged_at: now,
    };
    state.merges.push(record.clone());

    Ok(MergeOutcome { record, survivor, reassigned })
}

#[async_trait]
impl MergeStore for MemoryStore {
    async fn merge_leads(&self, plan: &MergePlan) -> StoreResult<MergeOutcome> {
        let mut state = self.state.lock().await;
        let mut working = state.clone();
        let outcome = apply_merge(&mut working, plan)?;
        *state = working;
        Ok(outcome)
    }

    async fn merge_history(&self, lead_id: Uuid) -> StoreResult<Vec<MergeHistoryRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .merges
            .iter()
            .filter(|m| m.survivor_id == lead_id || m.loser_id == lead_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn schedule(&self, execution: &WorkflowExecution) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let taken = state.executions.iter().any(|e| {
            e.idempotency_key == execution.idempotency_key && e.status.holds_idempotency_key()
        });
        if taken {
            return Ok(false);
        }
        state.executions.push(execution.clone());
        Ok(true)
    }

    async fn claim_due(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowExecution>> {
        let mut state = self.state.lock().await;
        let mut due: Vec<&mut WorkflowExecution> = state
            .executions
            .iter_mut()
            .filter(|e| e.status == ExecutionStatus::Pending && e.scheduled_at <= now)
            .collect();
        due.sort_by_key(|e| e.scheduled_at);
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|e| {
                claim_in_place(e, worker, lease_until, now);
                e.clone()
            })
            .collect())
    }

    async fn claim(
        &self,
        id: Uuid,
        worker: &str,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<WorkflowExecution>> {
        let mut state = self.state.lock().await;
        Ok(execution_mut(&mut state, id)
            .filter(|e| e.status == ExecutionStatus::Pending)
            .map(|e| {
                claim_in_place(e, worker, lease_until, Utc::now());
                e.clone()
            }))
    }

    async fn complete(&self, id: Uuid, worker: &str, outcome: Option<serde_json::Value>) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let Some(execution) = execution_mut(&mut state, id).filter(|e| held_by(e, worker)) else {
            return Ok(false);
        };
        let now = Utc::now();
        execution.status = ExecutionStatus::Completed;
        execution.outcome = outcome;
        execution.lease_expires_at = None;
        execution.completed_at = Some(now);
        execution.updated_at = now;
        Ok(true)
    }

    async fn fail(
        &self,
        id: Uuid,
        worker: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let Some(execution) = execution_mut(&mut state, id).filter(|e| held_by(e, worker)) else {
            return Ok(false);
        };
        let now = Utc::now();
        execution.last_error = Some(error.to_string());
        execution.lease_expires_at = None;
        execution.updated_at = now;
        match retry_at {
            Some(at) => {
                execution.status = ExecutionStatus::Pending;
                execution.scheduled_at = at;
                execution.claimed_by = None;
            }
            None => {
                execution.status = ExecutionStatus::Failed;
                execution.completed_at = Some(now);
            }
        }
        Ok(true)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>, max_attempts: i32) -> StoreResult<ReclaimReport> {
        let mut state = self.state.lock().await;
        let mut report = ReclaimReport::default();
        for execution in state.executions.iter_mut().filter(|e| {
            e.status == ExecutionStatus::Executing && e.lease_expires_at.is_some_and(|at| at < now)
        }) {
            execution.lease_expires_at = None;
            execution.updated_at = now;
            execution.last_error = Some(format!(
                "lease held by {} expired",
                execution.claimed_by.as_deref().unwrap_or("unknown worker")
            ));
            execution.claimed_by = None;
            if execution.attempts >= max_attempts {
                execution.status = ExecutionStatus::Failed;
                execution.completed_at = Some(now);
                report.failed += 1;
            } else {
                execution.status = ExecutionStatus::Pending;
                execution.scheduled_at = now;
                report.returned_to_pending += 1;
            }
        }
        Ok(report)
    }

    async fn cancel(&self, id: Uuid) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let execution = execution_mut(&mut state, id)
            .ok_or_else(|| StoreError::NotFound(format!("Workflow execution {}", id)))?;
        if execution.status != ExecutionStatus::Pending {
            return Ok(false);
        }
        let now = Utc::now();
        execution.status = ExecutionStatus::Cancelled;
        execution.completed_at = Some(now);
        execution.updated_at = now;
        Ok(true)
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<WorkflowExecution>> {
        let state = self.state.lock().await;
        Ok(state.executions.iter().find(|e| e.id == id).cloned())
    }

    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<(Vec<WorkflowExecution>, i64)> {
        let state = self.state.lock().await;
        let mut matching: Vec<WorkflowExecution> = state
            .executions
            .iter()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }
}
