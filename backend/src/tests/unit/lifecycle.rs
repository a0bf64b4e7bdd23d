// Lead lifecycle across all engines, driven through LeadAutomation

use chrono::Utc;
use leadflow_shared::{
    CandidateStatus, Condition, ConditionGroup, CrossingDirection, ExecutionStatus, Field, FieldChoice,
    FieldResolution, MatchBasis, NotificationRecipient, WorkflowAction, WorkflowTrigger,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::leads::{AssignmentOutcome, MergeRequest};
use crate::notifications::BroadcastNotifier;
use crate::store::{DependentTable, LeadStore, MemoryStore};
use crate::tests::fixtures::{round_robin_rule, scoring_rule, workflow_rule, LeadFixture};
use crate::tests::helpers::automation_with;
use crate::workflows::DomainEvent;

#[tokio::test]
async fn test_new_leads_rotate_score_and_flag_duplicates() {
    let store = Arc::new(MemoryStore::new());
    let reps = [Uuid::new_v4(), Uuid::new_v4()];
    store
        .add_assignment_rule(round_robin_rule(1, ConditionGroup::default(), &reps))
        .await;
    store
        .add_scoring_rule(scoring_rule(Condition::equals(Field::Source, "website"), 20))
        .await;

    let existing = LeadFixture::named("Grace", "Hopper").with_email("grace@navy.mil").build();
    store.insert_lead(existing.clone()).await;
    let automation = automation_with(store.clone(), Arc::new(BroadcastNotifier::default()));

    let first = LeadFixture::named("Grace", "Hopper").with_email("  GRACE@navy.mil ").build();
    store.insert_lead(first.clone()).await;
    let report = automation.handle_event(&DomainEvent::lead_created(first.id)).await.unwrap();

    assert_eq!(report.score.as_ref().map(|s| s.score), Some(20));
    assert_eq!(report.assignment.as_ref().and_then(AssignmentOutcome::owner_id), Some(reps[0]));
    assert_eq!(report.duplicates.len(), 1);
    assert_eq!(report.duplicates[0].basis, MatchBasis::EmailExact);
    assert_eq!(report.duplicates[0].counterpart(first.id), existing.id);

    let second = LeadFixture::default().with_source("referral").build();
    store.insert_lead(second.clone()).await;
    let report = automation.handle_event(&DomainEvent::lead_created(second.id)).await.unwrap();
    assert_eq!(report.assignment.as_ref().and_then(AssignmentOutcome::owner_id), Some(reps[1]));
    assert_eq!(report.score.as_ref().map(|s| s.score), Some(0));
}

#[tokio::test]
async fn test_redelivered_event_schedules_nothing_new() {
    let store = Arc::new(MemoryStore::new());
    let mut rule = workflow_rule(WorkflowTrigger::EntityCreated, WorkflowAction::Archive);
    rule.delay_minutes = 60;
    store.add_workflow_rule(rule).await;

    let lead = LeadFixture::default().build();
    store.insert_lead(lead.clone()).await;
    let automation = automation_with(store.clone(), Arc::new(BroadcastNotifier::default()));

    let event = DomainEvent::lead_created(lead.id).with_token("crm-delivery-42");
    let first = automation.handle_event(&event).await.unwrap();
    let again = automation.handle_event(&event).await.unwrap();

    assert_eq!(first.scheduled.len(), 1);
    assert!(again.scheduled.is_empty());
    assert_eq!(store.all_executions().await.len(), 1);
}

#[tokio::test]
async fn test_hot_lead_notifies_owner_once() {
    let store = Arc::new(MemoryStore::new());
    let owner = Uuid::new_v4();
    store
        .add_workflow_rule(workflow_rule(
            WorkflowTrigger::ScoreThresholdCrossed { min: 80, max: 100, direction: CrossingDirection::Into },
            WorkflowAction::SendNotification {
                recipient: NotificationRecipient::Owner,
                title: "{{first_name}} is hot".into(),
                body: "Score reached {{score}}".into(),
            },
        ))
        .await;

    let mut fixture = LeadFixture::named("Ada", "Lovelace");
    fixture.owner_id = Some(owner);
    let lead = fixture.build();
    store.insert_lead(lead.clone()).await;

    let notifier = Arc::new(BroadcastNotifier::default());
    let mut inbox = notifier.subscribe();
    let automation = automation_with(store.clone(), notifier);

    automation.adjust_score(lead.id, 50, None).await.unwrap();
    let crossing = automation.adjust_score(lead.id, 40, Some("demo booked".into())).await.unwrap();
    assert_eq!(crossing.executed.len(), 1);
    assert_eq!(crossing.executed[0].status, ExecutionStatus::Completed);

    let notification = inbox.recv().await.unwrap();
    assert_eq!(notification.user_id, owner);
    assert_eq!(notification.title, "Ada is hot");
    assert_eq!(notification.body, "Score reached 90");

    // Staying inside the band does not notify again
    let inside = automation.adjust_score(lead.id, -5, None).await.unwrap();
    assert!(inside.scheduled.is_empty());
    assert!(inbox.try_recv().is_err());
}

#[tokio::test]
async fn test_merge_moves_everything_to_survivor() {
    let store = Arc::new(MemoryStore::new());
    let survivor = LeadFixture::named("Alan", "Turing").with_phone("020 7946 0000").build();
    let loser = LeadFixture::named("A.", "Turing")
        .with_phone("(020) 7946-0000")
        .with_company("Bletchley Park")
        .build();
    store.insert_lead(survivor.clone()).await;
    store.insert_lead(loser.clone()).await;
    for table in [DependentTable::Activities, DependentTable::Notes, DependentTable::Opportunities] {
        store.insert_dependent(table, loser.id).await;
    }

    let automation = automation_with(store.clone(), Arc::new(BroadcastNotifier::default()));
    let candidates = automation.check_duplicates(loser.id).await.unwrap();
    assert!(candidates.iter().any(|c| c.counterpart(loser.id) == survivor.id));

    let report = automation
        .merge_leads(&MergeRequest {
            survivor_id: survivor.id,
            loser_id: loser.id,
            resolutions: vec![FieldResolution { field: Field::CompanyName, choice: FieldChoice::TakeLoser }],
            actor_id: None,
        })
        .await
        .unwrap();

    assert_eq!(report.outcome.survivor.company_name.as_deref(), Some("Bletchley Park"));
    for table in [DependentTable::Activities, DependentTable::Notes, DependentTable::Opportunities] {
        assert_eq!(store.dependent_count(table, survivor.id).await, 1);
        assert_eq!(store.dependent_count(table, loser.id).await, 0);
    }

    let merged = store.get_lead(loser.id).await.unwrap().unwrap();
    assert!(!merged.is_active);
    assert_eq!(merged.merged_into_id, Some(survivor.id));

    let pair = store
        .all_candidates()
        .await
        .into_iter()
        .find(|c| c.involves(survivor.id) && c.involves(loser.id))
        .unwrap();
    assert_eq!(pair.status, CandidateStatus::Merged);

    let history = automation.merge_history(survivor.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].merged_at <= Utc::now());

    // Events for the merged lead are ignored
    let ignored = automation.handle_event(&DomainEvent::lead_created(loser.id)).await.unwrap();
    assert!(ignored.score.is_none());
}
