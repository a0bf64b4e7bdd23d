//! Lead merges
//!
//! Requests are validated and turned into a [`MergePlan`] here; the store
//! applies the plan in one transaction. Nothing is written when validation
//! fails or when either lead stops being mergeable before the lock is taken.

use leadflow_shared::{Field, FieldChoice, FieldResolution, Lead, MergeHistoryRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::error::{AutomationError, AutomationResult};
use crate::store::{FieldSource, LeadStore, MergeOutcome, MergePlan, MergeStore, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct MergeRequest {
    pub survivor_id: Uuid,
    pub loser_id: Uuid,
    /// Fields not listed keep the survivor's value
    #[serde(default)]
    #[validate(length(max = 32))]
    pub resolutions: Vec<FieldResolution>,
    #[serde(default)]
    pub actor_id: Option<Uuid>,
}

fn invalid(message: impl Into<String>) -> AutomationError {
    AutomationError::InvalidMerge(message.into())
}

/// Checks that only depend on the request itself
pub fn validate_request(request: &MergeRequest) -> AutomationResult<()> {
    if request.survivor_id == request.loser_id {
        return Err(invalid("a lead cannot be merged into itself"));
    }

    let mut seen = HashSet::new();
    for resolution in &request.resolutions {
        let field = resolution.field;
        if !seen.insert(field) {
            return Err(invalid(format!("field {} is resolved more than once", field)));
        }
        if !field.is_writable() {
            return Err(invalid(format!("field {} cannot be set by a merge", field)));
        }
        let required = matches!(field, Field::FirstName | Field::LastName | Field::Status);
        if required && resolution.choice == FieldChoice::Value(None) {
            return Err(invalid(format!("field {} cannot be cleared", field)));
        }
    }
    Ok(())
}

/// Field writes the survivor actually needs
pub fn plan_updates(survivor: &Lead, loser: &Lead, resolutions: &[FieldResolution]) -> Vec<(Field, FieldSource)> {
    resolutions
        .iter()
        .filter_map(|resolution| {
            let field = resolution.field;
            match &resolution.choice {
                FieldChoice::KeepSurvivor => None,
                FieldChoice::TakeLoser => {
                    (survivor.text_value(field) != loser.text_value(field)).then_some((field, FieldSource::Loser))
                }
                FieldChoice::Value(value) => {
                    (survivor.text_value(field) != value.as_deref())
                        .then(|| (field, FieldSource::Literal(value.clone())))
                }
            }
        })
        .collect()
}

fn conflict(err: StoreError) -> AutomationError {
    match err {
        StoreError::Conflict(msg) => AutomationError::MergeConflict(msg),
        StoreError::NotFound(what) => AutomationError::MergeConflict(format!("{} disappeared during the merge", what)),
        other => AutomationError::Store(other),
    }
}

pub struct MergeExecutor<S> {
    store: Arc<S>,
}

impl<S> MergeExecutor<S>
where
    S: LeadStore + MergeStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn live_lead(&self, id: Uuid) -> AutomationResult<Lead> {
        let lead = self
            .store
            .get_lead(id)
            .await?
            .ok_or(AutomationError::LeadNotFound(id))?;
        if let Some(target) = lead.merged_into_id {
            return Err(AutomationError::MergeConflict(format!(
                "lead {} was already merged into {}",
                id, target
            )));
        }
        if !lead.is_active {
            return Err(AutomationError::MergeConflict(format!("lead {} is not active", id)));
        }
        Ok(lead)
    }

    pub async fn merge(&self, request: &MergeRequest) -> AutomationResult<MergeOutcome> {
        validate_request(request)?;

        let survivor = self.live_lead(request.survivor_id).await?;
        let loser = self.live_lead(request.loser_id).await?;

        let plan = MergePlan {
            survivor_id: survivor.id,
            loser_id: loser.id,
            updates: plan_updates(&survivor, &loser, &request.resolutions),
            resolutions: request.resolutions.clone(),
            actor_id: request.actor_id,
        };

        let outcome = self.store.merge_leads(&plan).await.map_err(|e| {
            warn!(
                survivor_id = %plan.survivor_id,
                loser_id = %plan.loser_id,
                error = %e,
                "Merge rolled back"
            );
            conflict(e)
        })?;

        info!(
            survivor_id = %plan.survivor_id,
            loser_id = %plan.loser_id,
            fields = plan.updates.len(),
            "Leads merged"
        );
        Ok(outcome)
    }

    pub async fn history(&self, lead_id: Uuid) -> AutomationResult<Vec<MergeHistoryRecord>> {
        Ok(self.store.merge_history(lead_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DependentTable, DuplicateStore, MemoryStore};
    use chrono::Utc;
    use leadflow_shared::{CandidateStatus, DuplicateCandidate, MatchBasis};

    fn lead(first: &str, email: Option<&str>, phone: Option<&str>) -> Lead {
        let now = Utc::now();
        Lead {
            id: Uuid::new_v4(),
            first_name: first.into(),
            last_name: "Hopper".into(),
            email: email.map(Into::into),
            phone: phone.map(Into::into),
            company_name: Some("Navy".into()),
            job_title: None,
            source: None,
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

    fn request(survivor: &Lead, loser: &Lead, resolutions: Vec<FieldResolution>) -> MergeRequest {
        MergeRequest {
            survivor_id: survivor.id,
            loser_id: loser.id,
            resolutions,
            actor_id: None,
        }
    }

    fn take_loser(field: Field) -> FieldResolution {
        FieldResolution { field, choice: FieldChoice::TakeLoser }
    }

    async fn seeded() -> (Arc<MemoryStore>, Lead, Lead) {
        let store = Arc::new(MemoryStore::new());
        let survivor = lead("Grace", Some("grace@navy.mil"), None);
        let loser = lead("Amazing Grace", None, Some("555-010-9999"));
        store.insert_lead(survivor.clone()).await;
        store.insert_lead(loser.clone()).await;
        (store, survivor, loser)
    }

    #[tokio::test]
    async fn test_merge_moves_dependents_and_applies_resolutions() {
        let (store, survivor, loser) = seeded().await;
        store.insert_dependent(DependentTable::Notes, loser.id).await;
        store.insert_dependent(DependentTable::Opportunities, loser.id).await;
        let executor = MergeExecutor::new(store.clone());

        let outcome = executor
            .merge(&request(
                &survivor,
                &loser,
                vec![
                    take_loser(Field::Phone),
                    FieldResolution { field: Field::City, choice: FieldChoice::Value(Some("Arlington".into())) },
                    FieldResolution { field: Field::Email, choice: FieldChoice::KeepSurvivor },
                ],
            ))
            .await
            .unwrap();

        assert_eq!(outcome.survivor.phone.as_deref(), Some("555-010-9999"));
        assert_eq!(outcome.survivor.city.as_deref(), Some("Arlington"));
        assert_eq!(outcome.survivor.email.as_deref(), Some("grace@navy.mil"));
        assert_eq!(outcome.reassigned[&DependentTable::Notes], 1);
        assert_eq!(store.dependent_count(DependentTable::Opportunities, survivor.id).await, 1);

        let merged = store.get_lead(loser.id).await.unwrap().unwrap();
        assert!(!merged.is_active);
        assert_eq!(merged.merged_into_id, Some(survivor.id));
        assert_eq!(executor.history(survivor.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_self_merge_is_rejected() {
        let (store, survivor, _) = seeded().await;
        let executor = MergeExecutor::new(store);
        let err = executor.merge(&request(&survivor, &survivor, vec![])).await.unwrap_err();
        assert!(matches!(err, AutomationError::InvalidMerge(_)));
    }

    #[tokio::test]
    async fn test_unwritable_or_repeated_fields_are_rejected() {
        let (store, survivor, loser) = seeded().await;
        let executor = MergeExecutor::new(store);

        let score = executor.merge(&request(&survivor, &loser, vec![take_loser(Field::Score)])).await;
        assert!(matches!(score, Err(AutomationError::InvalidMerge(_))));

        let twice = executor
            .merge(&request(&survivor, &loser, vec![take_loser(Field::Phone), take_loser(Field::Phone)]))
            .await;
        assert!(matches!(twice, Err(AutomationError::InvalidMerge(_))));

        let cleared = executor
            .merge(&request(
                &survivor,
                &loser,
                vec![FieldResolution { field: Field::FirstName, choice: FieldChoice::Value(None) }],
            ))
            .await;
        assert!(matches!(cleared, Err(AutomationError::InvalidMerge(_))));
    }

    #[tokio::test]
    async fn test_merged_lead_cannot_be_merged_again() {
        let (store, survivor, loser) = seeded().await;
        let executor = MergeExecutor::new(store.clone());
        executor.merge(&request(&survivor, &loser, vec![])).await.unwrap();

        let again = executor.merge(&request(&survivor, &loser, vec![])).await.unwrap_err();
        assert!(matches!(again, AutomationError::MergeConflict(_)));
    }

    #[tokio::test]
    async fn test_failed_reassignment_rolls_back_everything() {
        let (store, survivor, loser) = seeded().await;
        store.insert_dependent(DependentTable::Notes, loser.id).await;
        store
            .upsert_candidates(&[DuplicateCandidate::new(survivor.id, loser.id, MatchBasis::NameCompanyFuzzy, 0.8)])
            .await
            .unwrap();
        store.fail_merge_on(Some(DependentTable::Opportunities)).await;
        let executor = MergeExecutor::new(store.clone());

        let err = executor
            .merge(&request(&survivor, &loser, vec![take_loser(Field::Phone)]))
            .await
            .unwrap_err();
        assert!(matches!(err, AutomationError::MergeConflict(_)));

        assert_eq!(store.dependent_count(DependentTable::Notes, loser.id).await, 1);
        assert!(store.get_lead(loser.id).await.unwrap().unwrap().is_active);
        assert_eq!(store.get_lead(survivor.id).await.unwrap().unwrap().phone, None);
        assert_eq!(store.all_candidates().await[0].status, CandidateStatus::Open);
        assert!(executor.history(survivor.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_closes_pair_and_repoints_other_candidates() {
        let (store, survivor, loser) = seeded().await;
        let third = lead("G.", None, Some("555-010-9999"));
        store.insert_lead(third.clone()).await;
        store
            .upsert_candidates(&[
                DuplicateCandidate::new(survivor.id, loser.id, MatchBasis::NameCompanyFuzzy, 0.8),
                DuplicateCandidate::new(loser.id, third.id, MatchBasis::PhoneExact, 0.9),
            ])
            .await
            .unwrap();
        let executor = MergeExecutor::new(store.clone());
        executor.merge(&request(&survivor, &loser, vec![])).await.unwrap();

        let candidates = store.all_candidates().await;
        let pair = DuplicateCandidate::new(survivor.id, loser.id, MatchBasis::NameCompanyFuzzy, 0.8).pair();
        let closed = candidates.iter().find(|c| c.pair() == pair).unwrap();
        assert_eq!(closed.status, CandidateStatus::Merged);

        let moved = candidates.iter().find(|c| c.involves(third.id)).unwrap();
        assert!(moved.involves(survivor.id));
        assert_eq!(moved.status, CandidateStatus::Open);
    }

    #[test]
    fn test_plan_skips_values_that_would_not_change() {
        let survivor = lead("Grace", Some("grace@navy.mil"), None);
        let mut loser = lead("Grace", Some("grace@navy.mil"), None);
        loser.city = Some("Arlington".into());

        let updates = plan_updates(
            &survivor,
            &loser,
            &[take_loser(Field::FirstName), take_loser(Field::Email), take_loser(Field::City)],
        );
        assert_eq!(updates, vec![(Field::City, FieldSource::Loser)]);
    }
}
