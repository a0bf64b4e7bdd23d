// PostgreSQL store tests. They need Docker or TEST_DATABASE_URL, so they
// are ignored by default: cargo test -- --ignored

use chrono::{Duration, Utc};
use leadflow_shared::{
    CandidateStatus, DuplicateCandidate, Field, FieldChoice, FieldResolution, Lead, MatchBasis,
    ScoreHistoryEntry, WorkflowAction, WorkflowRule, WorkflowTrigger,
};
use rust_decimal::Decimal;
use serial_test::serial;
use uuid::Uuid;

use crate::store::{
    AssignmentStore, DependentTable, DuplicateStore, ExecutionStore, FieldSource, LeadStore,
    MergePlan, MergeStore, PgStore,
};
use crate::tests::fixtures::{workflow_rule, LeadFixture};
use crate::tests::TestContext;
use crate::workflows::triggers::pending_execution;

async fn insert_lead(ctx: &TestContext, lead: &Lead) {
    sqlx::query(
        "INSERT INTO leads (id, tenant_id, first_name, last_name, email, phone, company_name, source, status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(lead.id)
    .bind(ctx.tenant_id)
    .bind(&lead.first_name)
    .bind(&lead.last_name)
    .bind(&lead.email)
    .bind(&lead.phone)
    .bind(&lead.company_name)
    .bind(&lead.source)
    .bind(&lead.status)
    .execute(&ctx.db_pool)
    .await
    .expect("Failed to insert lead");
}

async fn insert_workflow_rule(ctx: &TestContext, rule: &WorkflowRule) {
    sqlx::query(
        "INSERT INTO workflow_rules (id, tenant_id, name, entity_type, trigger, condition, action, delay_minutes) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(rule.id)
    .bind(ctx.tenant_id)
    .bind(&rule.name)
    .bind(rule.entity_type.as_str())
    .bind(serde_json::to_value(&rule.trigger).unwrap())
    .bind(serde_json::to_value(&rule.condition).unwrap())
    .bind(serde_json::to_value(&rule.action).unwrap())
    .bind(rule.delay_minutes)
    .execute(&ctx.db_pool)
    .await
    .expect("Failed to insert workflow rule");
}

async fn insert_note(ctx: &TestContext, lead_id: Uuid) {
    sqlx::query("INSERT INTO notes (id, tenant_id, lead_id, body) VALUES ($1, $2, $3, 'called twice')")
        .bind(Uuid::new_v4())
        .bind(ctx.tenant_id)
        .bind(lead_id)
        .execute(&ctx.db_pool)
        .await
        .expect("Failed to insert note");
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_schedule_is_idempotent_per_key() {
    let ctx = TestContext::new().await;
    let store = PgStore::new(ctx.db_pool.clone(), ctx.tenant_id);

    let lead = LeadFixture::default().build();
    insert_lead(&ctx, &lead).await;
    let rule = workflow_rule(WorkflowTrigger::EntityCreated, WorkflowAction::Archive);
    insert_workflow_rule(&ctx, &rule).await;

    let now = Utc::now();
    let first = pending_execution(&rule, lead.id, "delivery-1", now);
    let redelivered = pending_execution(&rule, lead.id, "delivery-1", now);
    assert!(store.schedule(&first).await.unwrap());
    assert!(!store.schedule(&redelivered).await.unwrap());

    // Cancelling releases the key
    assert!(store.cancel(first.id).await.unwrap());
    assert!(store.schedule(&redelivered).await.unwrap());

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_claims_are_exclusive() {
    let ctx = TestContext::new().await;
    let store = PgStore::new(ctx.db_pool.clone(), ctx.tenant_id);

    let lead = LeadFixture::default().build();
    insert_lead(&ctx, &lead).await;
    let rule = workflow_rule(WorkflowTrigger::EntityCreated, WorkflowAction::Archive);
    insert_workflow_rule(&ctx, &rule).await;

    let now = Utc::now();
    for n in 0..4 {
        let execution = pending_execution(&rule, lead.id, &format!("delivery-{}", n), now);
        assert!(store.schedule(&execution).await.unwrap());
    }

    let lease = now + Duration::minutes(5);
    let later = now + Duration::seconds(1);
    let (a, b) = tokio::join!(
        store.claim_due("worker-a", later, lease, 3),
        store.claim_due("worker-b", later, lease, 3),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.len() + b.len(), 4);
    assert!(a.iter().all(|e| b.iter().all(|o| o.id != e.id)));
    assert!(a.iter().chain(b.iter()).all(|e| e.attempts == 1));

    // Only the holder can complete
    let held = &a[0];
    assert!(!store.complete(held.id, "worker-b", None).await.unwrap());
    assert!(store.complete(held.id, "worker-a", None).await.unwrap());

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_merge_is_one_transaction() {
    let ctx = TestContext::new().await;
    let store = PgStore::new(ctx.db_pool.clone(), ctx.tenant_id);

    let survivor = LeadFixture::named("Katherine", "Johnson").build();
    let loser = LeadFixture::named("Kathy", "Johnson").with_company("NACA").build();
    let bystander = LeadFixture::default().build();
    for lead in [&survivor, &loser, &bystander] {
        insert_lead(&ctx, lead).await;
    }
    insert_note(&ctx, loser.id).await;
    insert_note(&ctx, loser.id).await;
    store
        .upsert_candidates(&[DuplicateCandidate::new(loser.id, bystander.id, MatchBasis::NameCompanyFuzzy, 0.8)])
        .await
        .unwrap();

    let plan = MergePlan {
        survivor_id: survivor.id,
        loser_id: loser.id,
        updates: vec![(Field::CompanyName, FieldSource::Loser)],
        resolutions: vec![FieldResolution { field: Field::CompanyName, choice: FieldChoice::TakeLoser }],
        actor_id: None,
    };
    let outcome = store.merge_leads(&plan).await.unwrap();

    assert_eq!(outcome.survivor.company_name.as_deref(), Some("NACA"));
    assert_eq!(outcome.reassigned.get(&DependentTable::Notes), Some(&2));

    let merged = store.get_lead(loser.id).await.unwrap().unwrap();
    assert!(!merged.is_active);
    assert_eq!(merged.merged_into_id, Some(survivor.id));

    // The loser's open pair now points at the survivor
    let moved = store.candidates_for(survivor.id).await.unwrap();
    assert!(moved.iter().any(|c| c.involves(bystander.id) && c.status == CandidateStatus::Open));

    // A second merge of the same loser is refused and changes nothing
    assert!(store.merge_leads(&plan).await.is_err());
    assert_eq!(store.merge_history(survivor.id).await.unwrap().len(), 1);

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_rotation_cursor_advances_atomically() {
    let ctx = TestContext::new().await;
    let store = PgStore::new(ctx.db_pool.clone(), ctx.tenant_id);

    let rule_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO assignment_rules (id, tenant_id, name, priority, strategy) \
         VALUES ($1, $2, 'inbound', 1, 'round_robin')",
    )
    .bind(rule_id)
    .bind(ctx.tenant_id)
    .execute(&ctx.db_pool)
    .await
    .unwrap();

    let (a, b, c) = tokio::join!(
        store.advance_cursor(rule_id),
        store.advance_cursor(rule_id),
        store.advance_cursor(rule_id),
    );
    let mut seen = vec![a.unwrap(), b.unwrap(), c.unwrap()];
    seen.sort();
    assert_eq!(seen, vec![0, 1, 2]);

    assert!(store.advance_cursor(Uuid::new_v4()).await.is_err());

    ctx.cleanup().await;
}

fn manual_entry(lead_id: Uuid, delta: i32, resulting_score: i32) -> ScoreHistoryEntry {
    ScoreHistoryEntry {
        id: Uuid::new_v4(),
        lead_id,
        rule_id: None,
        delta: Decimal::from(delta),
        resulting_score,
        decay_window_days: None,
        reason: Some("manual".to_string()),
        created_at: Utc::now(),
    }
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_score_write_requires_unchanged_history() {
    let ctx = TestContext::new().await;
    let store = PgStore::new(ctx.db_pool.clone(), ctx.tenant_id);

    let lead = LeadFixture::default().build();
    insert_lead(&ctx, &lead).await;

    assert!(store.apply_score(lead.id, 0, 10, &[manual_entry(lead.id, 10, 10)]).await.unwrap());
    assert!(!store.apply_score(lead.id, 0, 15, &[manual_entry(lead.id, 5, 15)]).await.unwrap());

    assert_eq!(store.score_history(lead.id).await.unwrap().len(), 1);
    assert_eq!(store.get_lead(lead.id).await.unwrap().unwrap().score, 10);
    assert!(store.apply_score(Uuid::new_v4(), 0, 1, &[]).await.is_err());

    ctx.cleanup().await;
}
