// Workflow Actions - Runs the action of a claimed workflow execution

use chrono::{Duration, Utc};
use leadflow_shared::{
    Field, FollowUpActivity, Lead, NotificationRecipient, WorkflowAction, WorkflowExecution, WorkflowRule,
};
use regex::{Captures, Regex};
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::conditions::LeadFacts;
use crate::error::{AutomationError, AutomationResult};
use crate::leads::AssignmentEngine;
use crate::notifications::{Notification, Notifier};
use crate::store::{AssignmentStore, EngagementTally, LeadStore, RuleStore};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Result of executing an action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResult {
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

impl ActionResult {
    pub fn success(output: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            output,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failure(error: &str) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.to_string()),
            duration_ms: 0,
        }
    }

    /// Nothing to do; counts as completed
    pub fn skipped(reason: &str) -> Self {
        Self::success(Some(serde_json::json!({ "skipped": reason })))
    }

    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

fn action_error(message: impl Into<String>) -> AutomationError {
    AutomationError::ActionExecution(message.into())
}

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^}\s]+)\s*\}\}").expect("placeholder pattern is valid"));

/// Replace `{{field}}` placeholders with the lead's values. `full_name` and
/// `id` are also available; unknown placeholders are left untouched.
pub fn render_template(template: &str, facts: &LeadFacts<'_>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            match name {
                "full_name" => facts.lead.full_name(),
                "id" => facts.lead.id.to_string(),
                _ => match name.parse::<Field>() {
                    Ok(field) => facts.value_of(field).map(|v| v.to_string()).unwrap_or_default(),
                    Err(_) => caps[0].to_string(),
                },
            }
        })
        .into_owned()
}

/// Hex HMAC-SHA256 of `body`
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hex::encode(hmac::sign(&key, body).as_ref())
}

pub struct ActionExecutor<S> {
    store: Arc<S>,
    assignment: AssignmentEngine<S>,
    notifier: Arc<dyn Notifier>,
    http: reqwest::Client,
    webhook_timeout: std::time::Duration,
    signing_secret: Option<String>,
}

impl<S> ActionExecutor<S>
where
    S: LeadStore + AssignmentStore + RuleStore,
{
    pub fn new(
        store: Arc<S>,
        notifier: Arc<dyn Notifier>,
        webhook_timeout: std::time::Duration,
        signing_secret: Option<String>,
    ) -> Self {
        Self {
            assignment: AssignmentEngine::new(store.clone()),
            store,
            notifier,
            http: reqwest::Client::new(),
            webhook_timeout,
            signing_secret,
        }
    }

    /// Execute the rule's action for the execution's lead. Failures are
    /// reported in the result, never raised.
    pub async fn execute(&self, rule: &WorkflowRule, execution: &WorkflowExecution) -> ActionResult {
        let start = Instant::now();

        info!(
            execution_id = %execution.id,
            rule_id = %rule.id,
            action = rule.action.name(),
            attempt = execution.attempts,
            "Executing workflow action"
        );

        let result = match self.run(rule, execution).await {
            Ok(result) => result,
            Err(e) => {
                error!(execution_id = %execution.id, rule_id = %rule.id, error = %e, "Workflow action failed");
                ActionResult::failure(&e.to_string())
            }
        };

        result.with_duration(start.elapsed().as_millis() as i64)
    }

    async fn run(&self, rule: &WorkflowRule, execution: &WorkflowExecution) -> AutomationResult<ActionResult> {
        let Some(lead) = self.store.get_lead(execution.entity_id).await? else {
            warn!(execution_id = %execution.id, lead_id = %execution.entity_id, "Lead no longer exists");
            return Ok(ActionResult::skipped("lead not found"));
        };
        if let Some(survivor) = lead.merged_into_id {
            info!(execution_id = %execution.id, survivor_id = %survivor, "Lead was merged; skipping action");
            return Ok(ActionResult::skipped("lead merged"));
        }
        if !lead.is_active {
            return Ok(ActionResult::skipped("lead inactive"));
        }

        let engagements = self.store.engagement_tallies(lead.id).await?;
        let facts = LeadFacts::new(&lead, &engagements);

        match &rule.action {
            WorkflowAction::Reassign { user_id } => self.reassign(&lead, *user_id).await,
            WorkflowAction::SendNotification { recipient, title, body } => {
                self.send_notification(&facts, recipient, title, body).await
            }
            WorkflowAction::CreateFollowUpActivity { subject, activity_type, due_in_days } => {
                self.create_follow_up(&facts, subject, activity_type, *due_in_days).await
            }
            WorkflowAction::MutateField { field, value } => self.mutate_field(&facts, *field, value.as_deref()).await,
            WorkflowAction::Archive => {
                self.store.archive_lead(lead.id).await?;
                Ok(ActionResult::success(Some(serde_json::json!({ "archived": lead.id }))))
            }
            WorkflowAction::InvokeWebhook { url, method, headers } => {
                self.invoke_webhook(&facts, &engagements, execution, url, method, headers).await
            }
        }
    }

    async fn reassign(&self, lead: &Lead, user_id: Option<Uuid>) -> AutomationResult<ActionResult> {
        let Some(user_id) = user_id else {
            let outcome = self.assignment.assign(lead.id).await?;
            let output = serde_json::to_value(&outcome).map_err(|e| action_error(e.to_string()))?;
            return Ok(ActionResult::success(Some(output)));
        };

        if !self.store.active_user_ids(&[user_id]).await?.contains(&user_id) {
            return Err(action_error(format!("user {} is not active", user_id)));
        }
        self.store.set_owner(lead.id, user_id).await?;
        info!(lead_id = %lead.id, owner_id = %user_id, "Lead reassigned by workflow");
        Ok(ActionResult::success(Some(serde_json::json!({ "owner_id": user_id }))))
    }

    async fn send_notification(
        &self,
        facts: &LeadFacts<'_>,
        recipient: &NotificationRecipient,
        title: &str,
        body: &str,
    ) -> AutomationResult<ActionResult> {
        let user_id = match recipient {
            NotificationRecipient::User(id) => *id,
            NotificationRecipient::Owner => match facts.lead.owner_id {
                Some(owner) => owner,
                None => return Ok(ActionResult::skipped("lead has no owner")),
            },
        };

        let notification = Notification::new(
            user_id,
            Some(facts.lead.id),
            render_template(title, facts),
            render_template(body, facts),
        );
        let notification_id = notification.id;
        self.notifier
            .notify(notification)
            .await
            .map_err(|e| action_error(e.to_string()))?;

        Ok(ActionResult::success(Some(serde_json::json!({
            "notification_id": notification_id,
            "user_id": user_id
        }))))
    }

    async fn create_follow_up(
        &self,
        facts: &LeadFacts<'_>,
        subject: &str,
        activity_type: &str,
        due_in_days: i32,
    ) -> AutomationResult<ActionResult> {
        let now = Utc::now();
        let activity = FollowUpActivity {
            id: Uuid::new_v4(),
            lead_id: facts.lead.id,
            owner_id: facts.lead.owner_id,
            subject: render_template(subject, facts),
            activity_type: activity_type.to_string(),
            due_at: now + Duration::days(due_in_days.max(0) as i64),
            created_at: now,
        };
        self.store.create_activity(&activity).await?;

        Ok(ActionResult::success(Some(serde_json::json!({
            "activity_id": activity.id,
            "due_at": activity.due_at
        }))))
    }

    async fn mutate_field(&self, facts: &LeadFacts<'_>, field: Field, value: Option<&str>) -> AutomationResult<ActionResult> {
        if !field.is_writable() {
            return Err(action_error(format!("field {} cannot be set by a workflow", field)));
        }
        let value = value.map(|template| render_template(template, facts));
        self.store.set_field(facts.lead.id, field, value.clone()).await?;

        Ok(ActionResult::success(Some(serde_json::json!({
            "field": field,
            "value": value
        }))))
    }

    async fn invoke_webhook(
        &self,
        facts: &LeadFacts<'_>,
        engagements: &[EngagementTally],
        execution: &WorkflowExecution,
        url: &str,
        method: &str,
        headers: &BTreeMap<String, String>,
    ) -> AutomationResult<ActionResult> {
        let url = url::Url::parse(&render_template(url, facts))
            .map_err(|e| action_error(format!("invalid webhook url: {}", e)))?;

        let payload = serde_json::json!({
            "execution_id": execution.id,
            "rule_id": execution.rule_id,
            "idempotency_key": execution.idempotency_key,
            "attempt": execution.attempts,
            "lead": facts.lead,
            "engagements": engagements,
        });
        let body = serde_json::to_vec(&payload).map_err(|e| action_error(e.to_string()))?;

        let mut request = match method.to_uppercase().as_str() {
            "POST" => self.http.post(url.clone()),
            "PUT" => self.http.put(url.clone()),
            "PATCH" => self.http.patch(url.clone()),
            other => return Err(action_error(format!("unsupported webhook method: {}", other))),
        };

        for (name, value) in headers {
            request = request.header(name.as_str(), render_template(value, facts));
        }
        if let Some(secret) = &self.signing_secret {
            request = request.header(SIGNATURE_HEADER, format!("sha256={}", sign_payload(secret, &body)));
        }

        let response = request
            .header(IDEMPOTENCY_HEADER, execution.idempotency_key.as_str())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(self.webhook_timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| action_error(format!("webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(action_error(format!("webhook returned {}", status)));
        }

        Ok(ActionResult::success(Some(serde_json::json!({
            "url": url.as_str(),
            "status_code": status.as_u16()
        }))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::{MockNotifier, NotifyError};
    use crate::store::MemoryStore;
    use leadflow_shared::{ConditionGroup, EntityType, ExecutionStatus, WorkflowTrigger};
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn lead(owner: Option<Uuid>) -> Lead {
        let now = Utc::now();
        Lead {
            id: Uuid::new_v4(),
            first_name: "Dorothy".into(),
            last_name: "Vaughan".into(),
            email: Some("dorothy@nasa.gov".into()),
            phone: None,
            company_name: Some("NASA".into()),
            job_title: None,
            source: Some("Referral".into()),
            status: "new".into(),
            previous_status: None,
            city: None,
            state: None,
            country: None,
            score: 64,
            owner_id: owner,
            is_active: true,
            merged_into_id: None,
            created_at: now,
            updated_at: now,
            status_changed_at: None,
            last_engagement_at: None,
            archived_at: None,
        }
    }

    fn rule(action: WorkflowAction) -> WorkflowRule {
        WorkflowRule {
            id: Uuid::new_v4(),
            name: "action".into(),
            entity_type: EntityType::Lead,
            trigger: WorkflowTrigger::EntityCreated,
            condition: ConditionGroup::default(),
            action,
            delay_minutes: 0,
            is_active: true,
        }
    }

    fn execution(rule: &WorkflowRule, lead_id: Uuid) -> WorkflowExecution {
        let now = Utc::now();
        WorkflowExecution {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            entity_type: EntityType::Lead,
            entity_id: lead_id,
            scheduled_at: now,
            status: ExecutionStatus::Executing,
            attempts: 1,
            last_error: None,
            idempotency_key: WorkflowExecution::idempotency_key_for(rule.id, lead_id, "evt-1"),
            claimed_by: Some("worker".into()),
            lease_expires_at: None,
            outcome: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn executor(store: Arc<MemoryStore>, notifier: Arc<dyn Notifier>, secret: Option<&str>) -> ActionExecutor<MemoryStore> {
        ActionExecutor::new(store, notifier, std::time::Duration::from_secs(2), secret.map(Into::into))
    }

    #[test]
    fn test_render_template() {
        let lead = lead(None);
        let facts = LeadFacts::new(&lead, &[]);
        let rendered = render_template("{{full_name}} ({{ company_name }}) scored {{score}}; {{job_title}} {{nope}}", &facts);
        assert_eq!(rendered, "Dorothy Vaughan (NASA) scored 64;  {{nope}}");
    }

    #[tokio::test]
    async fn test_notification_goes_to_owner_with_rendered_text() {
        let owner = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let lead = lead(Some(owner));
        store.insert_lead(lead.clone()).await;

        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(move |n| n.user_id == owner && n.title == "Hot: Dorothy Vaughan")
            .times(1)
            .returning(|_| Ok(()));

        let rule = rule(WorkflowAction::SendNotification {
            recipient: NotificationRecipient::Owner,
            title: "Hot: {{full_name}}".into(),
            body: "Score {{score}}".into(),
        });
        let result = executor(store, Arc::new(notifier), None)
            .execute(&rule, &execution(&rule, lead.id))
            .await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_notifier_failure_fails_the_action() {
        let store = Arc::new(MemoryStore::new());
        let lead = lead(None);
        store.insert_lead(lead.clone()).await;

        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .returning(|_| Err(NotifyError::Delivery("smtp down".into())));

        let rule = rule(WorkflowAction::SendNotification {
            recipient: NotificationRecipient::User(Uuid::new_v4()),
            title: "t".into(),
            body: "b".into(),
        });
        let result = executor(store, Arc::new(notifier), None)
            .execute(&rule, &execution(&rule, lead.id))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("smtp down"));
    }

    #[tokio::test]
    async fn test_follow_up_and_field_mutation() {
        let owner = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let lead = lead(Some(owner));
        store.insert_lead(lead.clone()).await;
        let actions = executor(store.clone(), Arc::new(MockNotifier::new()), None);

        let follow_up = rule(WorkflowAction::CreateFollowUpActivity {
            subject: "Call {{first_name}}".into(),
            activity_type: "call".into(),
            due_in_days: 2,
        });
        assert!(actions.execute(&follow_up, &execution(&follow_up, lead.id)).await.success);
        let activities = store.activities_for(lead.id).await;
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].subject, "Call Dorothy");
        assert_eq!(activities[0].owner_id, Some(owner));

        let qualify = rule(WorkflowAction::MutateField { field: Field::Status, value: Some("qualified".into()) });
        assert!(actions.execute(&qualify, &execution(&qualify, lead.id)).await.success);
        let updated = store.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(updated.status, "qualified");
        assert_eq!(updated.previous_status.as_deref(), Some("new"));

        let score = rule(WorkflowAction::MutateField { field: Field::Score, value: Some("100".into()) });
        assert!(!actions.execute(&score, &execution(&score, lead.id)).await.success);
    }

    #[tokio::test]
    async fn test_merged_lead_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let mut merged = lead(None);
        merged.is_active = false;
        merged.merged_into_id = Some(Uuid::new_v4());
        store.insert_lead(merged.clone()).await;

        let archive = rule(WorkflowAction::Archive);
        let result = executor(store.clone(), Arc::new(MockNotifier::new()), None)
            .execute(&archive, &execution(&archive, merged.id))
            .await;
        assert!(result.success);
        assert_eq!(result.output, Some(serde_json::json!({ "skipped": "lead merged" })));
        assert!(store.get_lead(merged.id).await.unwrap().unwrap().archived_at.is_none());
    }

    #[tokio::test]
    async fn test_webhook_carries_idempotency_key_and_signature() {
        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::new());
        let lead = lead(None);
        store.insert_lead(lead.clone()).await;

        let hook = rule(WorkflowAction::InvokeWebhook {
            url: format!("{}/hooks/lead", server.uri()),
            method: "POST".into(),
            headers: BTreeMap::from([("X-Lead".to_string(), "{{id}}".to_string())]),
        });
        let run = execution(&hook, lead.id);

        Mock::given(method("POST"))
            .and(path("/hooks/lead"))
            .and(header(IDEMPOTENCY_HEADER, run.idempotency_key.as_str()))
            .and(header("X-Lead", lead.id.to_string().as_str()))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let result = executor(store, Arc::new(MockNotifier::new()), Some("s3cret"))
            .execute(&hook, &run)
            .await;
        assert!(result.success, "{:?}", result.error);
    }

    #[tokio::test]
    async fn test_webhook_non_2xx_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let lead = lead(None);
        store.insert_lead(lead.clone()).await;
        let hook = rule(WorkflowAction::InvokeWebhook {
            url: server.uri(),
            method: "POST".into(),
            headers: BTreeMap::new(),
        });

        let result = executor(store, Arc::new(MockNotifier::new()), None)
            .execute(&hook, &execution(&hook, lead.id))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("503"));
    }

    #[test]
    fn test_signature_is_stable_hex() {
        let a = sign_payload("secret", b"{\"a\":1}");
        assert_eq!(a, sign_payload("secret", b"{\"a\":1}"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, sign_payload("other", b"{\"a\":1}"));
    }
}
