//! Owner assignment
//!
//! Rules are tried in ascending priority and the first whose criteria match
//! decides the outcome. The rotation cursor is only ever moved through
//! [`AssignmentStore::advance_cursor`], a single atomic statement against the
//! rule row, so concurrent assignments under one rule never land on the same
//! member twice.

use leadflow_shared::{AssignmentMember, AssignmentRule, AssignmentStrategy, Lead};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AutomationError, AutomationResult};
use crate::store::{AssignmentStore, EngagementTally, LeadStore, RuleStore};
use crate::workflows::conditions::{evaluate_group, LeadFacts};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssignmentOutcome {
    Assigned {
        owner_id: Uuid,
        rule_id: Uuid,
        strategy: AssignmentStrategy,
    },
    /// The lead stays unassigned
    NoMatch,
}

impl AssignmentOutcome {
    pub fn owner_id(&self) -> Option<Uuid> {
        match self {
            AssignmentOutcome::Assigned { owner_id, .. } => Some(*owner_id),
            AssignmentOutcome::NoMatch => None,
        }
    }
}

pub struct AssignmentEngine<S> {
    store: Arc<S>,
}

impl<S> AssignmentEngine<S>
where
    S: AssignmentStore + LeadStore + RuleStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Pick an owner for `lead` without writing it
    pub async fn select_owner(
        &self,
        lead: &Lead,
        engagements: &[EngagementTally],
        rules: &[AssignmentRule],
    ) -> AutomationResult<AssignmentOutcome> {
        let facts = LeadFacts::new(lead, engagements);

        let mut ordered: Vec<&AssignmentRule> = rules.iter().filter(|r| r.is_active).collect();
        ordered.sort_by_key(|r| r.priority);

        for rule in ordered {
            match evaluate_group(&rule.criteria, &facts) {
                Ok(true) => return self.apply_strategy(lead, rule).await,
                Ok(false) => continue,
                Err(e) => {
                    let error = AutomationError::RuleEvaluation { rule_id: rule.id, reason: e.to_string() };
                    warn!(lead_id = %lead.id, error = %error, "Skipping assignment rule");
                }
            }
        }

        debug!(lead_id = %lead.id, "No assignment rule matched");
        Ok(AssignmentOutcome::NoMatch)
    }

    /// Run the rules for a stored lead and persist the chosen owner
    pub async fn assign(&self, lead_id: Uuid) -> AutomationResult<AssignmentOutcome> {
        let lead = self
            .store
            .get_lead(lead_id)
            .await?
            .ok_or(AutomationError::LeadNotFound(lead_id))?;

        if !lead.is_active || lead.merged_into_id.is_some() {
            info!(lead_id = %lead_id, "Not assigning an inactive lead");
            return Ok(AssignmentOutcome::NoMatch);
        }

        let engagements = self.store.engagement_tallies(lead_id).await?;
        let rules = self.store.active_assignment_rules().await?;
        let outcome = self.select_owner(&lead, &engagements, &rules).await?;

        match &outcome {
            AssignmentOutcome::Assigned { owner_id, rule_id, strategy } => {
                self.store.set_owner(lead_id, *owner_id).await?;
                info!(
                    lead_id = %lead_id,
                    owner_id = %owner_id,
                    rule_id = %rule_id,
                    strategy = strategy.as_str(),
                    "Lead assigned"
                );
            }
            AssignmentOutcome::NoMatch => warn!(lead_id = %lead_id, "Lead left unassigned"),
        }
        Ok(outcome)
    }

    async fn eligible_members(&self, rule: &AssignmentRule) -> AutomationResult<(Vec<AssignmentMember>, HashSet<Uuid>)> {
        let mut members = rule.members.clone();
        members.sort_by_key(|m| m.position);

        let user_ids: Vec<Uuid> = members.iter().map(|m| m.user_id).collect();
        let active_users = self.store.active_user_ids(&user_ids).await?;
        let eligible = members
            .iter()
            .filter(|m| m.is_active && active_users.contains(&m.user_id))
            .map(|m| m.user_id)
            .collect();
        Ok((members, eligible))
    }

    async fn apply_strategy(&self, lead: &Lead, rule: &AssignmentRule) -> AutomationResult<AssignmentOutcome> {
        let (members, eligible) = self.eligible_members(rule).await?;
        let assigned = |owner_id: Uuid| AssignmentOutcome::Assigned {
            owner_id,
            rule_id: rule.id,
            strategy: rule.strategy,
        };

        if eligible.is_empty() {
            warn!(lead_id = %lead.id, rule_id = %rule.id, "Assignment rule matched but has no eligible members");
            return Ok(AssignmentOutcome::NoMatch);
        }

        match rule.strategy {
            AssignmentStrategy::Direct => {
                let owner = members.first().map(|m| m.user_id).filter(|id| eligible.contains(id));
                if owner.is_none() {
                    warn!(lead_id = %lead.id, rule_id = %rule.id, "Direct assignee is inactive");
                }
                Ok(owner.map(assigned).unwrap_or(AssignmentOutcome::NoMatch))
            }
            AssignmentStrategy::RoundRobin => {
                let ring = members.len() as i64;
                // Each tick of the cursor is one atomic claim on a slot; an
                // inactive member's slot is spent and we move on.
                for _ in 0..ring {
                    let slot = self.store.advance_cursor(rule.id).await?.rem_euclid(ring) as usize;
                    let candidate = members[slot].user_id;
                    if eligible.contains(&candidate) {
                        return Ok(assigned(candidate));
                    }
                    debug!(rule_id = %rule.id, user_id = %candidate, "Skipping inactive member in rotation");
                }
                Ok(AssignmentOutcome::NoMatch)
            }
            AssignmentStrategy::LoadBalanced => {
                let candidates: Vec<&AssignmentMember> =
                    members.iter().filter(|m| eligible.contains(&m.user_id)).collect();
                let ids: Vec<Uuid> = candidates.iter().map(|m| m.user_id).collect();
                let loads = self.store.open_lead_counts(&ids).await?;

                let with_room: Vec<(Uuid, i64)> = candidates
                    .iter()
                    .map(|m| (m.user_id, loads.get(&m.user_id).copied().unwrap_or(0), m.max_capacity))
                    .filter(|(_, load, cap)| cap.is_none_or(|cap| *load < cap as i64))
                    .map(|(id, load, _)| (id, load))
                    .collect();

                let Some(lowest) = with_room.iter().map(|(_, load)| *load).min() else {
                    warn!(lead_id = %lead.id, rule_id = %rule.id, "Every member is at capacity");
                    return Ok(AssignmentOutcome::NoMatch);
                };

                // Ties rotate with the rule cursor
                let start = self.store.advance_cursor(rule.id).await?.rem_euclid(with_room.len() as i64) as usize;
                let owner = with_room
                    .iter()
                    .cycle()
                    .skip(start)
                    .take(with_room.len())
                    .find(|(_, load)| *load == lowest)
                    .map(|(id, _)| *id);
                Ok(owner.map(assigned).unwrap_or(AssignmentOutcome::NoMatch))
            }
        }
    }
}
