use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const DEFAULT_SCORE_CEILING: i32 = 100;

// ---------------------------------------------------------------------------
// Leads
// ---------------------------------------------------------------------------

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lead {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company_name: Option<String>,
    pub job_title: Option<String>,
    pub source: Option<String>,
    pub status: String,
    pub previous_status: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub score: i32,
    pub owner_id: Option<Uuid>,
    pub is_active: bool,
    pub merged_into_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status_changed_at: Option<DateTime<Utc>>,
    pub last_engagement_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Lead {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Open leads count toward an owner's load
    pub fn is_open(&self) -> bool {
        self.is_active && self.archived_at.is_none()
    }

    /// Current value of a text column. `None` for unset columns and for
    /// fields that are not stored as text.
    pub fn text_value(&self, field: Field) -> Option<&str> {
        match field {
            Field::FirstName => Some(&self.first_name),
            Field::LastName => Some(&self.last_name),
            Field::Email => self.email.as_deref(),
            Field::Phone => self.phone.as_deref(),
            Field::CompanyName => self.company_name.as_deref(),
            Field::JobTitle => self.job_title.as_deref(),
            Field::Source => self.source.as_deref(),
            Field::Status => Some(&self.status),
            Field::PreviousStatus => self.previous_status.as_deref(),
            Field::City => self.city.as_deref(),
            Field::State => self.state.as_deref(),
            Field::Country => self.country.as_deref(),
            Field::Score | Field::Owner | Field::Engagement(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    EmailOpened,
    LinkClicked,
    FormSubmitted,
    MeetingBooked,
    CallLogged,
}

impl EngagementKind {
    pub const ALL: [EngagementKind; 5] = [
        EngagementKind::EmailOpened,
        EngagementKind::LinkClicked,
        EngagementKind::FormSubmitted,
        EngagementKind::MeetingBooked,
        EngagementKind::CallLogged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementKind::EmailOpened => "email_opened",
            EngagementKind::LinkClicked => "link_clicked",
            EngagementKind::FormSubmitted => "form_submitted",
            EngagementKind::MeetingBooked => "meeting_booked",
            EngagementKind::CallLogged => "call_logged",
        }
    }
}

impl FromStr for EngagementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown engagement kind: {}", s))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Engagement {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub kind: EngagementKind,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FollowUpActivity {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub owner_id: Option<Uuid>,
    pub subject: String,
    pub activity_type: String,
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Rule conditions
// ---------------------------------------------------------------------------

/// Lead attributes a rule may inspect. Serialized as `first_name`,
/// `engagement:email_opened`, etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Field {
    FirstName,
    LastName,
    Email,
    Phone,
    CompanyName,
    JobTitle,
    Source,
    Status,
    PreviousStatus,
    City,
    State,
    Country,
    Score,
    Owner,
    Engagement(EngagementKind),
}

impl Field {
    const SIMPLE: [Field; 14] = [
        Field::FirstName,
        Field::LastName,
        Field::Email,
        Field::Phone,
        Field::CompanyName,
        Field::JobTitle,
        Field::Source,
        Field::Status,
        Field::PreviousStatus,
        Field::City,
        Field::State,
        Field::Country,
        Field::Score,
        Field::Owner,
    ];

    fn simple_name(&self) -> Option<&'static str> {
        Some(match self {
            Field::FirstName => "first_name",
            Field::LastName => "last_name",
            Field::Email => "email",
            Field::Phone => "phone",
            Field::CompanyName => "company_name",
            Field::JobTitle => "job_title",
            Field::Source => "source",
            Field::Status => "status",
            Field::PreviousStatus => "previous_status",
            Field::City => "city",
            Field::State => "state",
            Field::Country => "country",
            Field::Score => "score",
            Field::Owner => "owner",
            Field::Engagement(_) => return None,
        })
    }

    /// Text columns a workflow or a merge is allowed to overwrite.
    /// Score and owner have dedicated engines; status history is derived.
    pub fn is_writable(&self) -> bool {
        !matches!(
            self,
            Field::Score | Field::Owner | Field::PreviousStatus | Field::Engagement(_)
        )
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Engagement(kind) => write!(f, "engagement:{}", kind.as_str()),
            other => f.write_str(other.simple_name().unwrap_or_default()),
        }
    }
}

impl FromStr for Field {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(kind) = s.strip_prefix("engagement:") {
            return kind.parse().map(Field::Engagement);
        }
        Self::SIMPLE
            .into_iter()
            .find(|field| field.simple_name() == Some(s))
            .ok_or_else(|| format!("unknown field: {}", s))
    }
}

impl TryFrom<String> for Field {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Field> for String {
    fn from(field: Field) -> Self {
        field.to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    InList,
    IsSet,
    IsNotSet,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConditionValue {
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<ConditionValue>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub field: Field,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ConditionValue>,
}

impl Condition {
    pub fn new(field: Field, operator: Operator, value: Option<ConditionValue>) -> Self {
        Self { field, operator, value }
    }

    pub fn equals(field: Field, value: &str) -> Self {
        Self::new(field, Operator::Equals, Some(ConditionValue::Text(value.to_string())))
    }

    pub fn contains(field: Field, value: &str) -> Self {
        Self::new(field, Operator::Contains, Some(ConditionValue::Text(value.to_string())))
    }

    pub fn greater_than(field: Field, value: f64) -> Self {
        Self::new(field, Operator::GreaterThan, Some(ConditionValue::Number(value)))
    }

    pub fn less_than(field: Field, value: f64) -> Self {
        Self::new(field, Operator::LessThan, Some(ConditionValue::Number(value)))
    }

    pub fn in_list(field: Field, values: &[&str]) -> Self {
        let values = values
            .iter()
            .map(|v| ConditionValue::Text(v.to_string()))
            .collect();
        Self::new(field, Operator::InList, Some(ConditionValue::List(values)))
    }

    pub fn is_set(field: Field) -> Self {
        Self::new(field, Operator::IsSet, None)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Logic {
    #[default]
    All,
    Any,
}

/// Conditions joined by `logic`. An empty group matches every lead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConditionGroup {
    #[serde(default)]
    pub logic: Logic,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub groups: Vec<ConditionGroup>,
}

impl ConditionGroup {
    pub fn all(conditions: Vec<Condition>) -> Self {
        Self { logic: Logic::All, conditions, groups: Vec::new() }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Self { logic: Logic::Any, conditions, groups: Vec::new() }
    }

    pub fn with_group(mut self, group: ConditionGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.groups.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScoreCategory {
    Demographic,
    Behavioral,
    Engagement,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringRule {
    pub id: Uuid,
    pub name: String,
    pub category: ScoreCategory,
    pub condition: Condition,
    /// -100..=100
    pub points: i32,
    pub decay_window_days: Option<i32>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreHistoryEntry {
    pub id: Uuid,
    pub lead_id: Uuid,
    /// `None` for manual adjustments
    pub rule_id: Option<Uuid>,
    pub delta: Decimal,
    pub resulting_score: i32,
    /// Window in force when the delta was applied
    pub decay_window_days: Option<i32>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    RoundRobin,
    LoadBalanced,
    Direct,
}

impl AssignmentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStrategy::RoundRobin => "round_robin",
            AssignmentStrategy::LoadBalanced => "load_balanced",
            AssignmentStrategy::Direct => "direct",
        }
    }
}

impl FromStr for AssignmentStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(AssignmentStrategy::RoundRobin),
            "load_balanced" => Ok(AssignmentStrategy::LoadBalanced),
            "direct" => Ok(AssignmentStrategy::Direct),
            other => Err(format!("unknown assignment strategy: {}", other)),
        }
    }
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentMember {
    pub rule_id: Uuid,
    pub user_id: Uuid,
    pub position: i32,
    pub is_active: bool,
    pub max_capacity: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentRule {
    pub id: Uuid,
    pub name: String,
    /// Lower is evaluated first
    pub priority: i32,
    pub criteria: ConditionGroup,
    pub strategy: AssignmentStrategy,
    /// Ordered by `position`
    pub members: Vec<AssignmentMember>,
    pub rotation_cursor: i64,
    pub is_active: bool,
}

// ---------------------------------------------------------------------------
// Duplicates and merges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MatchBasis {
    EmailExact,
    PhoneExact,
    NameCompanyFuzzy,
}

impl MatchBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchBasis::EmailExact => "email-exact",
            MatchBasis::PhoneExact => "phone-exact",
            MatchBasis::NameCompanyFuzzy => "name-company-fuzzy",
        }
    }
}

impl FromStr for MatchBasis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email-exact" => Ok(MatchBasis::EmailExact),
            "phone-exact" => Ok(MatchBasis::PhoneExact),
            "name-company-fuzzy" => Ok(MatchBasis::NameCompanyFuzzy),
            other => Err(format!("unknown match basis: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Open,
    Dismissed,
    Merged,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Open => "open",
            CandidateStatus::Dismissed => "dismissed",
            CandidateStatus::Merged => "merged",
        }
    }
}

impl FromStr for CandidateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(CandidateStatus::Open),
            "dismissed" => Ok(CandidateStatus::Dismissed),
            "merged" => Ok(CandidateStatus::Merged),
            other => Err(format!("unknown candidate status: {}", other)),
        }
    }
}

/// A suspected duplicate pair. The pair is stored with `lead_a_id < lead_b_id`
/// so each pair has exactly one row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicateCandidate {
    pub id: Uuid,
    pub lead_a_id: Uuid,
    pub lead_b_id: Uuid,
    pub basis: MatchBasis,
    pub confidence: f64,
    pub status: CandidateStatus,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DuplicateCandidate {
    pub fn new(lead: Uuid, other: Uuid, basis: MatchBasis, confidence: f64) -> Self {
        let (lead_a_id, lead_b_id) = if lead <= other { (lead, other) } else { (other, lead) };
        Self {
            id: Uuid::new_v4(),
            lead_a_id,
            lead_b_id,
            basis,
            confidence,
            status: CandidateStatus::Open,
            detected_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn pair(&self) -> (Uuid, Uuid) {
        (self.lead_a_id, self.lead_b_id)
    }

    pub fn involves(&self, lead: Uuid) -> bool {
        self.lead_a_id == lead || self.lead_b_id == lead
    }

    /// The other side of the pair, seen from `lead`
    pub fn counterpart(&self, lead: Uuid) -> Uuid {
        if self.lead_a_id == lead { self.lead_b_id } else { self.lead_a_id }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "choice", content = "value", rename_all = "snake_case")]
pub enum FieldChoice {
    KeepSurvivor,
    TakeLoser,
    Value(Option<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldResolution {
    pub field: Field,
    pub choice: FieldChoice,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeHistoryRecord {
    pub id: Uuid,
    pub survivor_id: Uuid,
    pub loser_id: Uuid,
    /// Resolutions as applied, including the concrete value written
    pub resolutions: serde_json::Value,
    /// Per-table counts of reassigned rows
    pub reassigned: serde_json::Value,
    pub actor_id: Option<Uuid>,
    pub merged_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Lead,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Lead => "lead",
        }
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lead" => Ok(EntityType::Lead),
            other => Err(format!("unknown entity type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CrossingDirection {
    Into,
    OutOf,
    Either,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeReference {
    Created,
    Updated,
    StatusChanged,
    LastEngagement,
}

impl TimeReference {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeReference::Created => "created",
            TimeReference::Updated => "updated",
            TimeReference::StatusChanged => "status_changed",
            TimeReference::LastEngagement => "last_engagement",
        }
    }

    pub fn timestamp_of(&self, lead: &Lead) -> Option<DateTime<Utc>> {
        match self {
            TimeReference::Created => Some(lead.created_at),
            TimeReference::Updated => Some(lead.updated_at),
            TimeReference::StatusChanged => lead.status_changed_at,
            TimeReference::LastEngagement => lead.last_engagement_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowTrigger {
    EntityCreated,
    EntityUpdated {
        /// Empty means any field change
        #[serde(default)]
        fields: Vec<Field>,
    },
    StatusChanged {
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        to: Option<String>,
    },
    ScoreThresholdCrossed {
        min: i32,
        max: i32,
        direction: CrossingDirection,
    },
    TimeElapsed {
        since: TimeReference,
        minutes: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "user_id", rename_all = "snake_case")]
pub enum NotificationRecipient {
    Owner,
    User(Uuid),
}

fn default_activity_type() -> String {
    "task".to_string()
}

fn default_http_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    Reassign {
        /// Skip the assignment rules and hand the lead to this user
        #[serde(default)]
        user_id: Option<Uuid>,
    },
    SendNotification {
        recipient: NotificationRecipient,
        title: String,
        body: String,
    },
    CreateFollowUpActivity {
        subject: String,
        #[serde(default = "default_activity_type")]
        activity_type: String,
        due_in_days: i32,
    },
    MutateField {
        field: Field,
        value: Option<String>,
    },
    Archive,
    InvokeWebhook {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default)]
        headers: std::collections::BTreeMap<String, String>,
    },
}

impl WorkflowAction {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowAction::Reassign { .. } => "reassign",
            WorkflowAction::SendNotification { .. } => "send_notification",
            WorkflowAction::CreateFollowUpActivity { .. } => "create_follow_up_activity",
            WorkflowAction::MutateField { .. } => "mutate_field",
            WorkflowAction::Archive => "archive",
            WorkflowAction::InvokeWebhook { .. } => "invoke_webhook",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRule {
    pub id: Uuid,
    pub name: String,
    pub entity_type: EntityType,
    pub trigger: WorkflowTrigger,
    #[serde(default)]
    pub condition: ConditionGroup,
    pub action: WorkflowAction,
    /// 0 runs inline
    pub delay_minutes: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Executing => "executing",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Statuses that hold an idempotency key. Failed and cancelled runs
    /// release it so the same event may be triggered again.
    pub fn holds_idempotency_key(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Pending | ExecutionStatus::Executing | ExecutionStatus::Completed
        )
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "executing" => Ok(ExecutionStatus::Executing),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub idempotency_key: String,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub outcome: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn idempotency_key_for(rule_id: Uuid, entity_id: Uuid, token: &str) -> String {
        format!("{}:{}:{}", rule_id, entity_id, token)
    }
}
