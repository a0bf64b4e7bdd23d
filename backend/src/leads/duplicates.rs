//! Duplicate lead detection
//!
//! Three passes, strongest first: normalized email, phone digits, then a
//! fuzzy name + company comparison. Pairs found by more than one pass keep
//! the highest confidence and the basis that produced it. Detection is
//! advisory; callers treat its errors as soft failures.

use leadflow_shared::{DuplicateCandidate, Lead, MatchBasis};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AutomationError, AutomationResult};
use crate::store::{normalize_email, normalize_phone, DuplicateStore, LeadStore, StoreError};

pub const EMAIL_CONFIDENCE: f64 = 1.0;
pub const PHONE_CONFIDENCE: f64 = 0.9;
const NAME_WEIGHT: f64 = 0.6;
const COMPANY_WEIGHT: f64 = 0.4;

/// Lower-cased with runs of whitespace collapsed to one space
pub fn normalize_text(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn company_of(lead: &Lead) -> Option<String> {
    lead.company_name
        .as_deref()
        .map(normalize_text)
        .filter(|c| !c.is_empty())
}

/// Weighted Jaro-Winkler similarity of full name and company. `None` when
/// either lead lacks a name or a company.
pub fn name_company_similarity(a: &Lead, b: &Lead) -> Option<f64> {
    let name_a = normalize_text(&a.full_name());
    let name_b = normalize_text(&b.full_name());
    if name_a.is_empty() || name_b.is_empty() {
        return None;
    }
    let company_a = company_of(a)?;
    let company_b = company_of(b)?;

    let score = NAME_WEIGHT * strsim::jaro_winkler(&name_a, &name_b)
        + COMPANY_WEIGHT * strsim::jaro_winkler(&company_a, &company_b);
    Some(score.clamp(0.0, 1.0))
}

fn soft(err: StoreError) -> AutomationError {
    AutomationError::DuplicateDetection(err.to_string())
}

pub struct DuplicateDetector<S> {
    store: Arc<S>,
    fuzzy_threshold: f64,
    pool_limit: i64,
}

impl<S> DuplicateDetector<S>
where
    S: LeadStore + DuplicateStore,
{
    pub fn new(store: Arc<S>, fuzzy_threshold: f64, pool_limit: i64) -> Self {
        Self {
            store,
            fuzzy_threshold,
            pool_limit,
        }
    }

    /// Candidate pairs for `lead`, highest confidence first. Nothing is stored.
    pub async fn find_candidates(&self, lead: &Lead) -> AutomationResult<Vec<DuplicateCandidate>> {
        if !lead.is_active || lead.merged_into_id.is_some() {
            return Ok(Vec::new());
        }

        let mut best: BTreeMap<(Uuid, Uuid), DuplicateCandidate> = BTreeMap::new();
        let mut offer = |other: Uuid, basis: MatchBasis, confidence: f64| {
            let candidate = DuplicateCandidate::new(lead.id, other, basis, confidence);
            match best.get(&candidate.pair()) {
                Some(existing) if existing.confidence >= confidence => {}
                _ => {
                    best.insert(candidate.pair(), candidate);
                }
            }
        };

        if let Some(email) = normalize_email(lead.email.as_deref()) {
            for other in self.store.active_leads_by_email(&email, lead.id).await.map_err(soft)? {
                offer(other.id, MatchBasis::EmailExact, EMAIL_CONFIDENCE);
            }
        }

        if let Some(digits) = normalize_phone(lead.phone.as_deref()) {
            for other in self.store.active_leads_by_phone(&digits, lead.id).await.map_err(soft)? {
                offer(other.id, MatchBasis::PhoneExact, PHONE_CONFIDENCE);
            }
        }

        if company_of(lead).is_some() {
            let pool = self
                .store
                .fuzzy_match_pool(lead.id, self.pool_limit)
                .await
                .map_err(soft)?;
            for other in &pool {
                if let Some(similarity) = name_company_similarity(lead, other) {
                    if similarity >= self.fuzzy_threshold {
                        offer(other.id, MatchBasis::NameCompanyFuzzy, similarity);
                    }
                }
            }
        }

        let mut candidates: Vec<DuplicateCandidate> = best.into_values().collect();
        candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(candidates)
    }

    /// Find and persist candidates for a stored lead
    pub async fn detect(&self, lead_id: Uuid) -> AutomationResult<Vec<DuplicateCandidate>> {
        let lead = self
            .store
            .get_lead(lead_id)
            .await
            .map_err(soft)?
            .ok_or(AutomationError::LeadNotFound(lead_id))?;

        let found = self.find_candidates(&lead).await?;
        if found.is_empty() {
            debug!(lead_id = %lead_id, "No duplicate candidates");
            return Ok(Vec::new());
        }

        let stored = self.store.upsert_candidates(&found).await.map_err(soft)?;
        info!(lead_id = %lead_id, candidates = stored.len(), "Duplicate candidates recorded");
        Ok(stored)
    }

    pub async fn candidates_for(&self, lead_id: Uuid) -> AutomationResult<Vec<DuplicateCandidate>> {
        Ok(self.store.candidates_for(lead_id).await?)
    }

    pub async fn dismiss(&self, candidate_id: Uuid) -> AutomationResult<DuplicateCandidate> {
        self.store
            .dismiss_candidate(candidate_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("Duplicate candidate {}", candidate_id)).into())
    }
}
