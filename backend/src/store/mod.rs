//! Tenant-bound persistence for the automation core
//!
//! Every trait here is implemented by [`PgStore`] (one instance per tenant)
//! and by [`MemoryStore`] for tests. Each method is a single atomic unit;
//! anything that must be all-or-nothing (merges, score application) is one
//! method rather than a sequence of calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadflow_shared::{
    AssignmentRule, DuplicateCandidate, Engagement, EngagementKind, ExecutionStatus, Field,
    FieldResolution, FollowUpActivity, Lead, MergeHistoryRecord, ScoreHistoryEntry, ScoringRule,
    TimeReference, WorkflowExecution, WorkflowRule,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid stored value: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Per-kind engagement counts for one lead
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementTally {
    pub kind: EngagementKind,
    pub count: i64,
    pub latest_at: DateTime<Utc>,
}

/// Tables whose rows belong to a lead and move to the survivor on merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependentTable {
    Activities,
    Communications,
    Opportunities,
    Notes,
    Engagements,
}

impl DependentTable {
    pub const ALL: [DependentTable; 5] = [
        DependentTable::Activities,
        DependentTable::Communications,
        DependentTable::Opportunities,
        DependentTable::Notes,
        DependentTable::Engagements,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            DependentTable::Activities => "activities",
            DependentTable::Communications => "communications",
            DependentTable::Opportunities => "opportunities",
            DependentTable::Notes => "notes",
            DependentTable::Engagements => "lead_engagements",
        }
    }
}

/// Where a merged field's final value comes from
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSource {
    Loser,
    Literal(Option<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub survivor_id: Uuid,
    pub loser_id: Uuid,
    /// Only fields that change on the survivor
    pub updates: Vec<(Field, FieldSource)>,
    /// The caller's resolutions, recorded verbatim in the merge history
    pub resolutions: Vec<FieldResolution>,
    pub actor_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeOutcome {
    pub record: MergeHistoryRecord,
    pub survivor: Lead,
    pub reassigned: BTreeMap<DependentTable, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ReclaimReport {
    pub returned_to_pending: u64,
    pub failed: u64,
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn active_scoring_rules(&self) -> StoreResult<Vec<ScoringRule>>;

    /// Ascending priority; ties keep creation order
    async fn active_assignment_rules(&self) -> StoreResult<Vec<AssignmentRule>>;

    async fn active_workflow_rules(&self) -> StoreResult<Vec<WorkflowRule>>;

    /// Includes inactive rules so a due execution can tell it was disabled
    async fn workflow_rule(&self, id: Uuid) -> StoreResult<Option<WorkflowRule>>;
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn get_lead(&self, id: Uuid) -> StoreResult<Option<Lead>>;

    /// Active, unmerged leads with the same normalized email, excluding `exclude`
    async fn active_leads_by_email(&self, email: &str, exclude: Uuid) -> StoreResult<Vec<Lead>>;

    /// Active, unmerged leads whose phone reduces to the same digits
    async fn active_leads_by_phone(&self, digits: &str, exclude: Uuid) -> StoreResult<Vec<Lead>>;

    /// Active leads with a company name, most recently updated first
    async fn fuzzy_match_pool(&self, exclude: Uuid, limit: i64) -> StoreResult<Vec<Lead>>;

    async fn active_lead_ids(&self, after: Option<Uuid>, limit: i64) -> StoreResult<Vec<Uuid>>;

    /// Active leads whose `reference` timestamp falls in `[from, to)`
    async fn leads_with_reference_between(
        &self,
        reference: TimeReference,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Lead>>;

    /// Open leads untouched since `before`
    async fn stale_open_lead_ids(&self, before: DateTime<Utc>) -> StoreResult<Vec<Uuid>>;

    async fn score_history(&self, lead_id: Uuid) -> StoreResult<Vec<ScoreHistoryEntry>>;

    async fn engagement_tallies(&self, lead_id: Uuid) -> StoreResult<Vec<EngagementTally>>;

    async fn record_engagement(&self, engagement: &Engagement) -> StoreResult<()>;

    /// Append `entries` and set the lead's score in one transaction, but only
    /// if the lead still has exactly `seen` history entries. `false` means
    /// another writer got there first and nothing was written.
    async fn apply_score(
        &self,
        lead_id: Uuid,
        seen: usize,
        score: i32,
        entries: &[ScoreHistoryEntry],
    ) -> StoreResult<bool>;

    async fn set_owner(&self, lead_id: Uuid, owner_id: Uuid) -> StoreResult<()>;

    /// Writes a text column. Status writes also shift `previous_status`.
    async fn set_field(&self, lead_id: Uuid, field: Field, value: Option<String>) -> StoreResult<()>;

    async fn archive_lead(&self, lead_id: Uuid) -> StoreResult<()>;

    async fn create_activity(&self, activity: &FollowUpActivity) -> StoreResult<()>;
}

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Increment the rule's rotation cursor and return the value it held
    /// before the increment. One statement against the rule row.
    async fn advance_cursor(&self, rule_id: Uuid) -> StoreResult<i64>;

    async fn open_lead_counts(&self, user_ids: &[Uuid]) -> StoreResult<HashMap<Uuid, i64>>;

    async fn active_user_ids(&self, user_ids: &[Uuid]) -> StoreResult<HashSet<Uuid>>;
}

#[async_trait]
pub trait DuplicateStore: Send + Sync {
    /// Insert new pairs, raise confidence on known ones, never reopen
    /// dismissed or merged pairs. Returns the stored rows.
    async fn upsert_candidates(&self, candidates: &[DuplicateCandidate]) -> StoreResult<Vec<DuplicateCandidate>>;

    async fn candidates_for(&self, lead_id: Uuid) -> StoreResult<Vec<DuplicateCandidate>>;

    async fn dismiss_candidate(&self, id: Uuid) -> StoreResult<Option<DuplicateCandidate>>;
}

#[async_trait]
pub trait MergeStore: Send + Sync {
    /// Runs the whole merge in one transaction, locking both leads in id
    /// order. `NotFound` when either lead is missing, `Conflict` when either
    /// is no longer active.
    async fn merge_leads(&self, plan: &MergePlan) -> StoreResult<MergeOutcome>;

    async fn merge_history(&self, lead_id: Uuid) -> StoreResult<Vec<MergeHistoryRecord>>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// `false` when a live execution already holds the idempotency key
    async fn schedule(&self, execution: &WorkflowExecution) -> StoreResult<bool>;

    /// Claim up to `limit` due executions for `worker`. Each claim counts as
    /// an attempt.
    async fn claim_due(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowExecution>>;

    /// Claim one execution if it is still pending. `None` means someone
    /// else got it first or it was cancelled.
    async fn claim(
        &self,
        id: Uuid,
        worker: &str,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<WorkflowExecution>>;

    /// Only applies while `worker` still holds the claim
    async fn complete(&self, id: Uuid, worker: &str, outcome: Option<serde_json::Value>) -> StoreResult<bool>;

    /// `retry_at = Some` puts the execution back to pending, `None` fails it
    async fn fail(
        &self,
        id: Uuid,
        worker: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> StoreResult<bool>;

    /// Executions whose lease ran out go back to pending, or fail once
    /// `max_attempts` is spent
    async fn reclaim_expired(&self, now: DateTime<Utc>, max_attempts: i32) -> StoreResult<ReclaimReport>;

    /// Pending only. `false` when the execution has already moved on.
    async fn cancel(&self, id: Uuid) -> StoreResult<bool>;

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<WorkflowExecution>>;

    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<(Vec<WorkflowExecution>, i64)>;
}

/// Everything the automation core needs from one tenant's data
pub trait AutomationStore:
    RuleStore + LeadStore + AssignmentStore + DuplicateStore + MergeStore + ExecutionStore + 'static
{
}

impl<T> AutomationStore for T where
    T: RuleStore + LeadStore + AssignmentStore + DuplicateStore + MergeStore + ExecutionStore + 'static
{
}

/// Lower-cased, trimmed email; `None` when blank
pub fn normalize_email(email: Option<&str>) -> Option<String> {
    email
        .map(|e| e.trim().to_lowercase())
        .filter(|e| !e.is_empty())
}

/// Digits only; `None` when fewer than seven remain
pub fn normalize_phone(phone: Option<&str>) -> Option<String> {
    let digits: String = phone?.chars().filter(|c| c.is_ascii_digit()).collect();
    (digits.len() >= 7).then_some(digits)
}
