//! PostgreSQL store bound to a single tenant
//!
//! Every statement filters on `tenant_id`. Rule payloads (conditions,
//! triggers, actions) live in JSONB columns and are decoded here; a row that
//! no longer decodes is skipped with a warning instead of failing the load.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadflow_shared::{
    AssignmentMember, AssignmentRule, DuplicateCandidate, Engagement, EngagementKind,
    ExecutionStatus, Field, FollowUpActivity, Lead, MergeHistoryRecord, ScoreHistoryEntry,
    ScoringRule, TimeReference, WorkflowExecution, WorkflowRule,
};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;
use uuid::Uuid;

use super::{
    AssignmentStore, DependentTable, DuplicateStore, EngagementTally, ExecutionStore, FieldSource,
    LeadStore, MergeOutcome, MergePlan, MergeStore, ReclaimReport, RuleStore, StoreError,
    StoreResult,
};

const LEAD_COLUMNS: &str = "id, first_name, last_name, email, phone, company_name, job_title, \
     source, status, previous_status, city, state, country, score, owner_id, is_active, \
     merged_into_id, created_at, updated_at, status_changed_at, last_engagement_at, archived_at";

const EXECUTION_COLUMNS: &str = "id, rule_id, entity_type, entity_id, scheduled_at, status, \
     attempts, last_error, idempotency_key, claimed_by, lease_expires_at, outcome, created_at, \
     updated_at, completed_at";

const CANDIDATE_COLUMNS: &str =
    "id, lead_a_id, lead_b_id, basis, confidence, status, detected_at, resolved_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    tenant_id: Uuid,
}

impl PgStore {
    pub fn new(pool: PgPool, tenant_id: Uuid) -> Self {
        Self { pool, tenant_id }
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    async fn lead_exists(&self, id: Uuid) -> StoreResult<bool> {
        let found = sqlx::query_scalar::<_, i32>("SELECT 1 FROM leads WHERE tenant_id = $1 AND id = $2")
            .bind(self.tenant_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn require_lead(&self, id: Uuid, rows_affected: u64) -> StoreResult<()> {
        if rows_affected == 0 && !self.lead_exists(id).await? {
            return Err(StoreError::NotFound(format!("Lead {}", id)));
        }
        Ok(())
    }
}

fn parse_enum<T: serde::de::DeserializeOwned>(value: String) -> StoreResult<T> {
    Ok(serde_json::from_value(serde_json::Value::String(value))?)
}

fn text_column(field: Field) -> StoreResult<&'static str> {
    Ok(match field {
        Field::FirstName => "first_name",
        Field::LastName => "last_name",
        Field::Email => "email",
        Field::Phone => "phone",
        Field::CompanyName => "company_name",
        Field::JobTitle => "job_title",
        Field::Source => "source",
        Field::Status => "status",
        Field::City => "city",
        Field::State => "state",
        Field::Country => "country",
        other => return Err(StoreError::Conflict(format!("field {} is not writable", other))),
    })
}

fn reference_column(reference: TimeReference) -> &'static str {
    match reference {
        TimeReference::Created => "created_at",
        TimeReference::Updated => "updated_at",
        TimeReference::StatusChanged => "status_changed_at",
        TimeReference::LastEngagement => "last_engagement_at",
    }
}

/// Write one text column. Status changes also record the previous status.
async fn write_text_field<'e, E>(
    executor: E,
    tenant_id: Uuid,
    lead_id: Uuid,
    field: Field,
    value: Option<String>,
) -> StoreResult<u64>
where
    E: sqlx::PgExecutor<'e>,
{
    let column = text_column(field)?;
    let sql = match field {
        Field::Status => "UPDATE leads SET previous_status = status, status = COALESCE($3, ''), \
             status_changed_at = NOW(), updated_at = NOW() \
             WHERE tenant_id = $1 AND id = $2 AND status IS DISTINCT FROM COALESCE($3, '')"
            .to_string(),
        Field::FirstName | Field::LastName => format!(
            "UPDATE leads SET {col} = COALESCE($3, ''), updated_at = NOW() WHERE tenant_id = $1 AND id = $2",
            col = column
        ),
        _ => format!(
            "UPDATE leads SET {col} = $3, updated_at = NOW() WHERE tenant_id = $1 AND id = $2",
            col = column
        ),
    };
    let result = sqlx::query(&sql)
        .bind(tenant_id)
        .bind(lead_id)
        .bind(value)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

#[derive(sqlx::FromRow)]
struct ScoringRuleRow {
    id: Uuid,
    name: String,
    category: String,
    condition: serde_json::Value,
    points: i32,
    decay_window_days: Option<i32>,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<ScoringRuleRow> for ScoringRule {
    type Error = StoreError;

    fn try_from(row: ScoringRuleRow) -> Result<Self, Self::Error> {
        Ok(ScoringRule {
            id: row.id,
            name: row.name,
            category: parse_enum(row.category)?,
            condition: serde_json::from_value(row.condition)?,
            points: row.points,
            decay_window_days: row.decay_window_days,
            is_active: row.is_active,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AssignmentRuleRow {
    id: Uuid,
    name: String,
    priority: i32,
    criteria: serde_json::Value,
    strategy: String,
    rotation_cursor: i64,
    is_active: bool,
}

impl AssignmentRuleRow {
    fn into_rule(self, members: Vec<AssignmentMember>) -> StoreResult<AssignmentRule> {
        Ok(AssignmentRule {
            id: self.id,
            name: self.name,
            priority: self.priority,
            criteria: serde_json::from_value(self.criteria)?,
            strategy: self.strategy.parse().map_err(StoreError::Corrupt)?,
            members,
            rotation_cursor: self.rotation_cursor,
            is_active: self.is_active,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowRuleRow {
    id: Uuid,
    name: String,
    entity_type: String,
    trigger: serde_json::Value,
    condition: serde_json::Value,
    action: serde_json::Value,
    delay_minutes: i32,
    is_active: bool,
}

impl TryFrom<WorkflowRuleRow> for WorkflowRule {
    type Error = StoreError;

    fn try_from(row: WorkflowRuleRow) -> Result<Self, Self::Error> {
        Ok(WorkflowRule {
            id: row.id,
            name: row.name,
            entity_type: row.entity_type.parse().map_err(StoreError::Corrupt)?,
            trigger: serde_json::from_value(row.trigger)?,
            condition: serde_json::from_value(row.condition)?,
            action: serde_json::from_value(row.action)?,
            delay_minutes: row.delay_minutes,
            is_active: row.is_active,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CandidateRow {
    id: Uuid,
    lead_a_id: Uuid,
    lead_b_id: Uuid,
    basis: String,
    confidence: f64,
    status: String,
    detected_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<CandidateRow> for DuplicateCandidate {
    type Error = StoreError;

    fn try_from(row: CandidateRow) -> Result<Self, Self::Error> {
        Ok(DuplicateCandidate {
            id: row.id,
            lead_a_id: row.lead_a_id,
            lead_b_id: row.lead_b_id,
            basis: row.basis.parse().map_err(StoreError::Corrupt)?,
            confidence: row.confidence,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            detected_at: row.detected_at,
            resolved_at: row.resolved_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    rule_id: Uuid,
    entity_type: String,
    entity_id: Uuid,
    scheduled_at: DateTime<Utc>,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    idempotency_key: String,
    claimed_by: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    outcome: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ExecutionRow> for WorkflowExecution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(WorkflowExecution {
            id: row.id,
            rule_id: row.rule_id,
            entity_type: row.entity_type.parse().map_err(StoreError::Corrupt)?,
            entity_id: row.entity_id,
            scheduled_at: row.scheduled_at,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            attempts: row.attempts,
            last_error: row.last_error,
            idempotency_key: row.idempotency_key,
            claimed_by: row.claimed_by,
            lease_expires_at: row.lease_expires_at,
            outcome: row.outcome,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

fn executions_from(rows: Vec<ExecutionRow>) -> StoreResult<Vec<WorkflowExecution>> {
    rows.into_iter().map(WorkflowExecution::try_from).collect()
}

#[async_trait]
impl RuleStore for PgStore {
    async fn active_scoring_rules(&self) -> StoreResult<Vec<ScoringRule>> {
        let rows = sqlx::query_as::<_, ScoringRuleRow>(
            "SELECT id, name, category, condition, points, decay_window_days, is_active, created_at \
             FROM scoring_rules WHERE tenant_id = $1 AND is_active = true ORDER BY created_at, id",
        )
        .bind(self.tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id;
                ScoringRule::try_from(row)
                    .map_err(|e| warn!(rule_id = %id, error = %e, "Skipping malformed scoring rule"))
                    .ok()
            })
            .collect())
    }

    async fn active_assignment_rules(&self) -> StoreResult<Vec<AssignmentRule>> {
        let rows = sqlx::query_as::<_, AssignmentRuleRow>(
            "SELECT id, name, priority, criteria, strategy, rotation_cursor, is_active \
             FROM assignment_rules WHERE tenant_id = $1 AND is_active = true \
             ORDER BY priority, created_at, id",
        )
        .bind(self.tenant_id)
        .fetch_all(&self.pool)
        .await?;

        let rule_ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let members = sqlx::query_as::<_, AssignmentMember>(
            "SELECT rule_id, user_id, position, is_active, max_capacity FROM assignment_members \
             WHERE tenant_id = $1 AND rule_id = ANY($2) ORDER BY rule_id, position",
        )
        .bind(self.tenant_id)
        .bind(&rule_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_rule: HashMap<Uuid, Vec<AssignmentMember>> = HashMap::new();
        for member in members {
            by_rule.entry(member.rule_id).or_default().push(member);
        }

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id;
                let members = by_rule.remove(&id).unwrap_or_default();
                row.into_rule(members)
                    .map_err(|e| warn!(rule_id = %id, error = %e, "Skipping malformed assignment rule"))
                    .ok()
            })
            .collect())
    }

    async fn active_workflow_rules(&self) -> StoreResult<Vec<WorkflowRule>> {
        let rows = sqlx::query_as::<_, WorkflowRuleRow>(
            "SELECT id, name, entity_type, trigger, condition, action, delay_minutes, is_active \
             FROM workflow_rules WHERE tenant_id = $1 AND is_active = true ORDER BY created_at, id",
        )
        .bind(self.tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let id = row.id;
                WorkflowRule::try_from(row)
                    .map_err(|e| warn!(rule_id = %id, error = %e, "Skipping malformed workflow rule"))
                    .ok()
            })
            .collect())
    }

    async fn workflow_rule(&self, id: Uuid) -> StoreResult<Option<WorkflowRule>> {
        let row = sqlx::query_as::<_, WorkflowRuleRow>(
            "SELECT id, name, entity_type, trigger, condition, action, delay_minutes, is_active \
             FROM workflow_rules WHERE tenant_id = $1 AND id = $2",
        )
        .bind(self.tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowRule::try_from).transpose()
    }
}

#[async_trait]
impl LeadStore for PgStore {
    async fn get_lead(&self, id: Uuid) -> StoreResult<Option<Lead>> {
        let sql = format!("SELECT {} FROM leads WHERE tenant_id = $1 AND id = $2", LEAD_COLUMNS);
        Ok(sqlx::query_as::<_, Lead>(&sql)
            .bind(self.tenant_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn active_leads_by_email(&self, email: &str, exclude: Uuid) -> StoreResult<Vec<Lead>> {
        let sql = format!(
            "SELECT {} FROM leads WHERE tenant_id = $1 AND id <> $2 AND is_active = true \
             AND merged_into_id IS NULL AND LOWER(TRIM(email)) = $3",
            LEAD_COLUMNS
        );
        Ok(sqlx::query_as::<_, Lead>(&sql)
            .bind(self.tenant_id)
            .bind(exclude)
            .bind(email)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn active_leads_by_phone(&self, digits: &str, exclude: Uuid) -> StoreResult<Vec<Lead>> {
        let sql = format!(
            r"SELECT {} FROM leads WHERE tenant_id = $1 AND id <> $2 AND is_active = true
              AND merged_into_id IS NULL AND regexp_replace(phone, '\D', '', 'g') = $3",
            LEAD_COLUMNS
        );
        Ok(sqlx::query_as::<_, Lead>(&sql)
            .bind(self.tenant_id)
            .bind(exclude)
            .bind(digits)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn fuzzy_match_pool(&self, exclude: Uuid, limit: i64) -> StoreResult<Vec<Lead>> {
        let sql = format!(
            "SELECT {} FROM leads WHERE tenant_id = $1 AND id <> $2 AND is_active = true \
             AND merged_into_id IS NULL AND NULLIF(TRIM(company_name), '') IS NOT NULL \
             ORDER BY updated_at DESC LIMIT $3",
            LEAD_COLUMNS
        );
        Ok(sqlx::query_as::<_, Lead>(&sql)
            .bind(self.tenant_id)
            .bind(exclude)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn active_lead_ids(&self, after: Option<Uuid>, limit: i64) -> StoreResult<Vec<Uuid>> {
        Ok(sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM leads WHERE tenant_id = $1 AND is_active = true AND merged_into_id IS NULL \
             AND ($2::uuid IS NULL OR id > $2) ORDER BY id LIMIT $3",
        )
        .bind(self.tenant_id)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn leads_with_reference_between(
        &self,
        reference: TimeReference,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Lead>> {
        let sql = format!(
            "SELECT {cols} FROM leads WHERE tenant_id = $1 AND is_active = true \
             AND merged_into_id IS NULL AND {col} >= $2 AND {col} < $3",
            cols = LEAD_COLUMNS,
            col = reference_column(reference)
        );
        Ok(sqlx::query_as::<_, Lead>(&sql)
            .bind(self.tenant_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn stale_open_lead_ids(&self, before: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        Ok(sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM leads WHERE tenant_id = $1 AND is_active = true AND merged_into_id IS NULL \
             AND archived_at IS NULL AND updated_at < $2",
        )
        .bind(self.tenant_id)
        .bind(before)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn score_history(&self, lead_id: Uuid) -> StoreResult<Vec<ScoreHistoryEntry>> {
        Ok(sqlx::query_as::<_, ScoreHistoryEntry>(
            "SELECT id, lead_id, rule_id, delta, resulting_score, decay_window_days, reason, created_at \
             FROM score_history WHERE tenant_id = $1 AND lead_id = $2 ORDER BY created_at, id",
        )
        .bind(self.tenant_id)
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn engagement_tallies(&self, lead_id: Uuid) -> StoreResult<Vec<EngagementTally>> {
        let rows = sqlx::query_as::<_, (String, i64, DateTime<Utc>)>(
            "SELECT kind, COUNT(*), MAX(occurred_at) FROM lead_engagements \
             WHERE tenant_id = $1 AND lead_id = $2 GROUP BY kind",
        )
        .bind(self.tenant_id)
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(kind, count, latest_at)| match kind.parse::<EngagementKind>() {
                Ok(kind) => Some(EngagementTally { kind, count, latest_at }),
                Err(e) => {
                    warn!(lead_id = %lead_id, error = %e, "Ignoring unknown engagement kind");
                    None
                }
            })
            .collect())
    }

    async fn record_engagement(&self, engagement: &Engagement) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query(
            "UPDATE leads SET last_engagement_at = GREATEST(COALESCE(last_engagement_at, $3), $3) \
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(self.tenant_id)
        .bind(engagement.lead_id)
        .bind(engagement.occurred_at)
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Lead {}", engagement.lead_id)));
        }

        sqlx::query(
            "INSERT INTO lead_engagements (id, tenant_id, lead_id, kind, occurred_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(engagement.id)
        .bind(self.tenant_id)
        .bind(engagement.lead_id)
        .bind(engagement.kind.as_str())
        .bind(engagement.occurred_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn apply_score(
        &self,
        lead_id: Uuid,
        seen: usize,
        score: i32,
        entries: &[ScoreHistoryEntry],
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        // The row lock serializes score writers for this lead
        let locked = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM leads WHERE tenant_id = $1 AND id = $2 FOR UPDATE",
        )
        .bind(self.tenant_id)
        .bind(lead_id)
        .fetch_optional(&mut *tx)
        .await?;
        if locked.is_none() {
            return Err(StoreError::NotFound(format!("Lead {}", lead_id)));
        }

        let current = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM score_history WHERE tenant_id = $1 AND lead_id = $2",
        )
        .bind(self.tenant_id)
        .bind(lead_id)
        .fetch_one(&mut *tx)
        .await?;
        if current != seen as i64 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE leads SET score = $3 WHERE tenant_id = $1 AND id = $2")
            .bind(self.tenant_id)
            .bind(lead_id)
            .bind(score)
            .execute(&mut *tx)
            .await?;

        for entry in entries {
            sqlx::query(
                "INSERT INTO score_history \
                 (id, tenant_id, lead_id, rule_id, delta, resulting_score, decay_window_days, reason, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(entry.id)
            .bind(self.tenant_id)
            .bind(entry.lead_id)
            .bind(entry.rule_id)
            .bind(entry.delta)
            .bind(entry.resulting_score)
            .bind(entry.decay_window_days)
            .bind(&entry.reason)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn set_owner(&self, lead_id: Uuid, owner_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE leads SET owner_id = $3, updated_at = NOW() WHERE tenant_id = $1 AND id = $2",
        )
        .bind(self.tenant_id)
        .bind(lead_id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;
        self.require_lead(lead_id, result.rows_affected()).await
    }

    async fn set_field(&self, lead_id: Uuid, field: Field, value: Option<String>) -> StoreResult<()> {
        let affected = write_text_field(&self.pool, self.tenant_id, lead_id, field, value).await?;
        self.require_lead(lead_id, affected).await
    }

    async fn archive_lead(&self, lead_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE leads SET archived_at = NOW(), previous_status = status, status = 'archived', \
             status_changed_at = NOW(), updated_at = NOW() \
             WHERE tenant_id = $1 AND id = $2 AND archived_at IS NULL",
        )
        .bind(self.tenant_id)
        .bind(lead_id)
        .execute(&self.pool)
        .await?;
        self.require_lead(lead_id, result.rows_affected()).await
    }

    async fn create_activity(&self, activity: &FollowUpActivity) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO activities (id, tenant_id, lead_id, owner_id, subject, activity_type, due_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(activity.id)
        .bind(self.tenant_id)
        .bind(activity.lead_id)
        .bind(activity.owner_id)
        .bind(&activity.subject)
        .bind(&activity.activity_type)
        .bind(activity.due_at)
        .bind(activity.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AssignmentStore for PgStore {
    async fn advance_cursor(&self, rule_id: Uuid) -> StoreResult<i64> {
        sqlx::query_scalar::<_, i64>(
            "UPDATE assignment_rules SET rotation_cursor = rotation_cursor + 1 \
             WHERE tenant_id = $1 AND id = $2 RETURNING rotation_cursor - 1",
        )
        .bind(self.tenant_id)
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("Assignment rule {}", rule_id)))
    }

    async fn open_lead_counts(&self, user_ids: &[Uuid]) -> StoreResult<HashMap<Uuid, i64>> {
        let rows = sqlx::query_as::<_, (Uuid, i64)>(
            "SELECT owner_id, COUNT(*) FROM leads WHERE tenant_id = $1 AND owner_id = ANY($2) \
             AND is_active = true AND merged_into_id IS NULL AND archived_at IS NULL GROUP BY owner_id",
        )
        .bind(self.tenant_id)
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut counts: HashMap<Uuid, i64> = user_ids.iter().map(|id| (*id, 0)).collect();
        counts.extend(rows);
        Ok(counts)
    }

    async fn active_user_ids(&self, user_ids: &[Uuid]) -> StoreResult<HashSet<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM users WHERE tenant_id = $1 AND id = ANY($2) AND is_active = true",
        )
        .bind(self.tenant_id)
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }
}

#[async_trait]
impl DuplicateStore for PgStore {
    async fn upsert_candidates(&self, candidates: &[DuplicateCandidate]) -> StoreResult<Vec<DuplicateCandidate>> {
        let mut stored = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let upsert = format!(
                "INSERT INTO duplicate_candidates \
                 (id, tenant_id, lead_a_id, lead_b_id, basis, confidence, status, detected_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, 'open', $7) \
                 ON CONFLICT (tenant_id, lead_a_id, lead_b_id) DO UPDATE \
                 SET confidence = EXCLUDED.confidence, basis = EXCLUDED.basis, detected_at = EXCLUDED.detected_at \
                 WHERE duplicate_candidates.status = 'open' \
                 AND EXCLUDED.confidence > duplicate_candidates.confidence \
                 RETURNING {}",
                CANDIDATE_COLUMNS
            );
            let row = sqlx::query_as::<_, CandidateRow>(&upsert)
                .bind(candidate.id)
                .bind(self.tenant_id)
                .bind(candidate.lead_a_id)
                .bind(candidate.lead_b_id)
                .bind(candidate.basis.as_str())
                .bind(candidate.confidence)
                .bind(candidate.detected_at)
                .fetch_optional(&self.pool)
                .await?;

            // No row back means the existing pair was kept as is
            let row = match row {
                Some(row) => row,
                None => {
                    let existing = format!(
                        "SELECT {} FROM duplicate_candidates WHERE tenant_id = $1 AND lead_a_id = $2 AND lead_b_id = $3",
                        CANDIDATE_COLUMNS
                    );
                    sqlx::query_as::<_, CandidateRow>(&existing)
                        .bind(self.tenant_id)
                        .bind(candidate.lead_a_id)
                        .bind(candidate.lead_b_id)
                        .fetch_one(&self.pool)
                        .await?
                }
            };
            stored.push(DuplicateCandidate::try_from(row)?);
        }
        Ok(stored)
    }

    async fn candidates_for(&self, lead_id: Uuid) -> StoreResult<Vec<DuplicateCandidate>> {
        let sql = format!(
            "SELECT {} FROM duplicate_candidates WHERE tenant_id = $1 AND (lead_a_id = $2 OR lead_b_id = $2) \
             ORDER BY confidence DESC, detected_at",
            CANDIDATE_COLUMNS
        );
        sqlx::query_as::<_, CandidateRow>(&sql)
            .bind(self.tenant_id)
            .bind(lead_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(DuplicateCandidate::try_from)
            .collect()
    }

    async fn dismiss_candidate(&self, id: Uuid) -> StoreResult<Option<DuplicateCandidate>> {
        sqlx::query(
            "UPDATE duplicate_candidates SET status = 'dismissed', resolved_at = NOW() \
             WHERE tenant_id = $1 AND id = $2 AND status = 'open'",
        )
        .bind(self.tenant_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        let sql = format!(
            "SELECT {} FROM duplicate_candidates WHERE tenant_id = $1 AND id = $2",
            CANDIDATE_COLUMNS
        );
        sqlx::query_as::<_, CandidateRow>(&sql)
            .bind(self.tenant_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(DuplicateCandidate::try_from)
            .transpose()
    }
}

impl PgStore {
    async fn lock_merge_pair(&self, tx: &mut Transaction<'_, Postgres>, plan: &MergePlan) -> StoreResult<()> {
        // Always lock in id order so two racing merges cannot deadlock
        let locked = sqlx::query_as::<_, (Uuid, bool, Option<Uuid>)>(
            "SELECT id, is_active, merged_into_id FROM leads \
             WHERE tenant_id = $1 AND id = ANY($2) ORDER BY id FOR UPDATE",
        )
        .bind(self.tenant_id)
        .bind(vec![plan.survivor_id, plan.loser_id])
        .fetch_all(&mut **tx)
        .await?;

        for id in [plan.survivor_id, plan.loser_id] {
            match locked.iter().find(|(locked_id, _, _)| *locked_id == id) {
                None => return Err(StoreError::NotFound(format!("Lead {}", id))),
                Some((_, is_active, merged_into)) if !is_active || merged_into.is_some() => {
                    return Err(StoreError::Conflict(format!("lead {} is no longer active", id)));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    async fn move_duplicate_candidates(&self, tx: &mut Transaction<'_, Postgres>, plan: &MergePlan) -> StoreResult<()> {
        const COUNTERPART: &str = "CASE WHEN d.lead_a_id = $3 THEN d.lead_b_id ELSE d.lead_a_id END";

        sqlx::query(
            "UPDATE duplicate_candidates SET status = 'merged', resolved_at = NOW() \
             WHERE tenant_id = $1 AND status = 'open' \
             AND lead_a_id = LEAST($2::uuid, $3::uuid) AND lead_b_id = GREATEST($2::uuid, $3::uuid)",
        )
        .bind(self.tenant_id)
        .bind(plan.survivor_id)
        .bind(plan.loser_id)
        .execute(&mut **tx)
        .await?;

        let survivor_has_pair = format!(
            "EXISTS (SELECT 1 FROM duplicate_candidates s WHERE s.tenant_id = $1 \
             AND s.lead_a_id = LEAST($2::uuid, {c}) AND s.lead_b_id = GREATEST($2::uuid, {c}))",
            c = COUNTERPART
        );

        let close_redundant = format!(
            "UPDATE duplicate_candidates d SET status = 'merged', resolved_at = NOW() \
             WHERE d.tenant_id = $1 AND d.status = 'open' AND (d.lead_a_id = $3 OR d.lead_b_id = $3) \
             AND {}",
            survivor_has_pair
        );
        sqlx::query(&close_redundant)
            .bind(self.tenant_id)
            .bind(plan.survivor_id)
            .bind(plan.loser_id)
            .execute(&mut **tx)
            .await?;

        let repoint = format!(
            "UPDATE duplicate_candidates d \
             SET lead_a_id = LEAST($2::uuid, {c}), lead_b_id = GREATEST($2::uuid, {c}) \
             WHERE d.tenant_id = $1 AND (d.lead_a_id = $3 OR d.lead_b_id = $3) \
             AND d.lead_a_id <> $2 AND d.lead_b_id <> $2 AND NOT {exists}",
            c = COUNTERPART,
            exists = survivor_has_pair
        );
        sqlx::query(&repoint)
            .bind(self.tenant_id)
            .bind(plan.survivor_id)
            .bind(plan.loser_id)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl MergeStore for PgStore {
    async fn merge_leads(&self, plan: &MergePlan) -> StoreResult<MergeOutcome> {
        let mut tx = self.pool.begin().await?;

        self.lock_merge_pair(&mut tx, plan).await?;

        let mut reassigned = BTreeMap::new();
        for table in DependentTable::ALL {
            let sql = format!(
                "UPDATE {} SET lead_id = $3 WHERE tenant_id = $1 AND lead_id = $2",
                table.table_name()
            );
            let moved = sqlx::query(&sql)
                .bind(self.tenant_id)
                .bind(plan.loser_id)
                .bind(plan.survivor_id)
                .execute(&mut *tx)
                .await?;
            reassigned.insert(table, moved.rows_affected());
        }

        self.move_duplicate_candidates(&mut tx, plan).await?;

        let mut applied = Vec::with_capacity(plan.updates.len());
        for (field, source) in &plan.updates {
            let value = match source {
                FieldSource::Literal(value) => value.clone(),
                FieldSource::Loser => {
                    let sql = format!(
                        "SELECT {} FROM leads WHERE tenant_id = $1 AND id = $2",
                        text_column(*field)?
                    );
                    sqlx::query_scalar::<_, Option<String>>(&sql)
                        .bind(self.tenant_id)
                        .bind(plan.loser_id)
                        .fetch_one(&mut *tx)
                        .await?
                }
            };
            write_text_field(&mut *tx, self.tenant_id, plan.survivor_id, *field, value.clone()).await?;
            applied.push(serde_json::json!({ "field": field, "value": value }));
        }

        sqlx::query(
            "UPDATE leads SET is_active = false, merged_into_id = $3, updated_at = NOW() \
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(self.tenant_id)
        .bind(plan.loser_id)
        .bind(plan.survivor_id)
        .execute(&mut *tx)
        .await?;

        let record = MergeHistoryRecord {
            id: Uuid::new_v4(),
            survivor_id: plan.survivor_id,
            loser_id: plan.loser_id,
            resolutions: serde_json::json!({
                "requested": plan.resolutions,
                "applied": applied,
            }),
            reassigned: serde_json::to_value(&reassigned)?,
            actor_id: plan.actor_id,
            merged_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO merge_history (id, tenant_id, survivor_id, loser_id, resolutions, reassigned, actor_id, merged_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(record.id)
        .bind(self.tenant_id)
        .bind(record.survivor_id)
        .bind(record.loser_id)
        .bind(&record.resolutions)
        .bind(&record.reassigned)
        .bind(record.actor_id)
        .bind(record.merged_at)
        .execute(&mut *tx)
        .await?;

        let sql = format!("SELECT {} FROM leads WHERE tenant_id = $1 AND id = $2", LEAD_COLUMNS);
        let survivor = sqlx::query_as::<_, Lead>(&sql)
            .bind(self.tenant_id)
            .bind(plan.survivor_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(MergeOutcome { record, survivor, reassigned })
    }

    async fn merge_history(&self, lead_id: Uuid) -> StoreResult<Vec<MergeHistoryRecord>> {
        Ok(sqlx::query_as::<_, MergeHistoryRecord>(
            "SELECT id, survivor_id, loser_id, resolutions, reassigned, actor_id, merged_at \
             FROM merge_history WHERE tenant_id = $1 AND (survivor_id = $2 OR loser_id = $2) \
             ORDER BY merged_at",
        )
        .bind(self.tenant_id)
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn schedule(&self, execution: &WorkflowExecution) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO workflow_executions \
             (id, tenant_id, rule_id, entity_type, entity_id, scheduled_at, status, attempts, \
              idempotency_key, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10) \
             ON CONFLICT (tenant_id, idempotency_key) \
             WHERE status IN ('pending', 'executing', 'completed') DO NOTHING",
        )
        .bind(execution.id)
        .bind(self.tenant_id)
        .bind(execution.rule_id)
        .bind(execution.entity_type.as_str())
        .bind(execution.entity_id)
        .bind(execution.scheduled_at)
        .bind(execution.status.as_str())
        .bind(execution.attempts)
        .bind(&execution.idempotency_key)
        .bind(execution.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_due(
        &self,
        worker: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<WorkflowExecution>> {
        let sql = format!(
            "UPDATE workflow_executions \
             SET status = 'executing', claimed_by = $2, lease_expires_at = $4, \
                 attempts = attempts + 1, updated_at = $3 \
             WHERE id IN ( \
                 SELECT id FROM workflow_executions \
                 WHERE tenant_id = $1 AND status = 'pending' AND scheduled_at <= $3 \
                 ORDER BY scheduled_at LIMIT $5 \
                 FOR UPDATE SKIP LOCKED) \
             AND status = 'pending' \
             RETURNING {}",
            EXECUTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(self.tenant_id)
            .bind(worker)
            .bind(now)
            .bind(lease_until)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        executions_from(rows)
    }

    async fn claim(
        &self,
        id: Uuid,
        worker: &str,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<WorkflowExecution>> {
        let sql = format!(
            "UPDATE workflow_executions \
             SET status = 'executing', claimed_by = $3, lease_expires_at = $4, \
                 attempts = attempts + 1, updated_at = NOW() \
             WHERE tenant_id = $1 AND id = $2 AND status = 'pending' \
             RETURNING {}",
            EXECUTION_COLUMNS
        );
        sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(self.tenant_id)
            .bind(id)
            .bind(worker)
            .bind(lease_until)
            .fetch_optional(&self.pool)
            .await?
            .map(WorkflowExecution::try_from)
            .transpose()
    }

    async fn complete(&self, id: Uuid, worker: &str, outcome: Option<serde_json::Value>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE workflow_executions \
             SET status = 'completed', outcome = $4, lease_expires_at = NULL, \
                 completed_at = NOW(), updated_at = NOW() \
             WHERE tenant_id = $1 AND id = $2 AND status = 'executing' AND claimed_by = $3",
        )
        .bind(self.tenant_id)
        .bind(id)
        .bind(worker)
        .bind(outcome)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail(
        &self,
        id: Uuid,
        worker: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        let sql = match retry_at {
            Some(_) => {
                "UPDATE workflow_executions \
                 SET status = 'pending', scheduled_at = $5, last_error = $4, claimed_by = NULL, \
                     lease_expires_at = NULL, updated_at = NOW() \
                 WHERE tenant_id = $1 AND id = $2 AND status = 'executing' AND claimed_by = $3"
            }
            None => {
                "UPDATE workflow_executions \
                 SET status = 'failed', last_error = $4, lease_expires_at = NULL, \
                     completed_at = NOW(), updated_at = NOW() \
                 WHERE tenant_id = $1 AND id = $2 AND status = 'executing' AND claimed_by = $3 \
                 AND $5::timestamptz IS NULL"
            }
        };
        let result = sqlx::query(sql)
            .bind(self.tenant_id)
            .bind(id)
            .bind(worker)
            .bind(error)
            .bind(retry_at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>, max_attempts: i32) -> StoreResult<ReclaimReport> {
        let mut tx = self.pool.begin().await?;

        let failed = sqlx::query(
            "UPDATE workflow_executions \
             SET status = 'failed', \
                 last_error = 'lease held by ' || COALESCE(claimed_by, 'unknown worker') || ' expired', \
                 claimed_by = NULL, lease_expires_at = NULL, completed_at = $2, updated_at = $2 \
             WHERE tenant_id = $1 AND status = 'executing' AND lease_expires_at < $2 AND attempts >= $3",
        )
        .bind(self.tenant_id)
        .bind(now)
        .bind(max_attempts)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let returned = sqlx::query(
            "UPDATE workflow_executions \
             SET status = 'pending', scheduled_at = $2, \
                 last_error = 'lease held by ' || COALESCE(claimed_by, 'unknown worker') || ' expired', \
                 claimed_by = NULL, lease_expires_at = NULL, updated_at = $2 \
             WHERE tenant_id = $1 AND status = 'executing' AND lease_expires_at < $2 AND attempts < $3",
        )
        .bind(self.tenant_id)
        .bind(now)
        .bind(max_attempts)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(ReclaimReport { returned_to_pending: returned, failed })
    }

    async fn cancel(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE workflow_executions SET status = 'cancelled', completed_at = NOW(), updated_at = NOW() \
             WHERE tenant_id = $1 AND id = $2 AND status = 'pending'",
        )
        .bind(self.tenant_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_execution(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("Workflow execution {}", id))),
        }
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<WorkflowExecution>> {
        let sql = format!(
            "SELECT {} FROM workflow_executions WHERE tenant_id = $1 AND id = $2",
            EXECUTION_COLUMNS
        );
        sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(self.tenant_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(WorkflowExecution::try_from)
            .transpose()
    }

    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<(Vec<WorkflowExecution>, i64)> {
        let status = status.map(|s| s.as_str());
        let sql = format!(
            "SELECT {} FROM workflow_executions WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2) \
             ORDER BY created_at DESC LIMIT $3 OFFSET $4",
            EXECUTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(self.tenant_id)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM workflow_executions WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2)",
        )
        .bind(self.tenant_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok((executions_from(rows)?, total))
    }
}
