//! Lead scoring
//!
//! A lead's score is derived from its append-only score history. Each
//! evaluation compares what every active rule should contribute right now
//! with what the history already holds and appends only the difference.
//! Decaying contributions fade linearly over the window snapshotted on the
//! entry; nothing is ever rewritten.

use chrono::{DateTime, Utc};
use leadflow_shared::{Lead, ScoreHistoryEntry, ScoringRule};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AutomationError, AutomationResult};
use crate::store::{EngagementTally, LeadStore, RuleStore, StoreError};
use crate::workflows::conditions::{engagement_kinds, evaluate, LeadFacts};

const SECONDS_PER_DAY: i64 = 86_400;
const MAX_RULE_POINTS: i32 = 100;
const REVOKED_REASON: &str = "rule deactivated";
const MAX_SCORE_ATTEMPTS: usize = 3;

/// Result of one pure score evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreComputation {
    pub score: i32,
    pub entries: Vec<ScoreHistoryEntry>,
    pub skipped_rules: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreChange {
    pub lead_id: Uuid,
    pub previous_score: i32,
    pub score: i32,
    pub entries: Vec<ScoreHistoryEntry>,
}

impl ScoreChange {
    pub fn changed(&self) -> bool {
        self.previous_score != self.score
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecalculationReport {
    pub scanned: u64,
    pub failed: u64,
    /// Leads whose score moved
    pub changes: Vec<ScoreChange>,
}

/// What `entry` still contributes at `now`
pub fn contribution(entry: &ScoreHistoryEntry, now: DateTime<Utc>) -> Decimal {
    match entry.decay_window_days {
        Some(window) if window > 0 => {
            let age_secs = (now - entry.created_at).num_seconds().max(0);
            let age_days = Decimal::from(age_secs) / Decimal::from(SECONDS_PER_DAY);
            let remaining = (Decimal::ONE - age_days / Decimal::from(window)).max(Decimal::ZERO);
            entry.delta * remaining
        }
        _ => entry.delta,
    }
}

/// Round half away from zero, then clamp into `[0, ceiling]`
pub fn settle(total: Decimal, ceiling: i32) -> i32 {
    let ceiling = ceiling.max(0);
    let rounded = total.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    match rounded.to_i32() {
        Some(points) => points.clamp(0, ceiling),
        None if rounded.is_sign_negative() => 0,
        None => ceiling,
    }
}

fn validate(rule: &ScoringRule) -> Result<(), String> {
    if !(-MAX_RULE_POINTS..=MAX_RULE_POINTS).contains(&rule.points) {
        return Err(format!("points {} outside -100..=100", rule.points));
    }
    if let Some(window) = rule.decay_window_days {
        if window <= 0 {
            return Err(format!("decay window of {} days", window));
        }
    }
    Ok(())
}

fn check_rule(rule: &ScoringRule, facts: &LeadFacts<'_>) -> AutomationResult<bool> {
    validate(rule)
        .and_then(|_| evaluate(&rule.condition, facts).map_err(|e| e.to_string()))
        .map_err(|reason| AutomationError::RuleEvaluation { rule_id: rule.id, reason })
}

fn entry(
    lead_id: Uuid,
    rule_id: Option<Uuid>,
    delta: Decimal,
    window: Option<i32>,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> ScoreHistoryEntry {
    ScoreHistoryEntry {
        id: Uuid::new_v4(),
        lead_id,
        rule_id,
        delta,
        resulting_score: 0,
        decay_window_days: window,
        reason,
        created_at: now,
    }
}

/// A decaying rule applies again once there is fresh evidence for it, or,
/// for conditions that carry no timestamp, once its last application expired.
fn should_reapply(
    rule: &ScoringRule,
    window: i32,
    prior: &[&ScoreHistoryEntry],
    facts: &LeadFacts<'_>,
    now: DateTime<Utc>,
) -> bool {
    let Some(last) = prior.iter().map(|e| e.created_at).max() else {
        return true;
    };
    match facts.latest_engagement(&engagement_kinds(&rule.condition)) {
        Some(evidence) => evidence > last,
        None => now >= last + chrono::Duration::days(window as i64),
    }
}

/// Evaluate `rules` against a lead snapshot. Pure: the caller persists the
/// returned entries.
pub fn compute_score(
    lead: &Lead,
    engagements: &[EngagementTally],
    rules: &[ScoringRule],
    history: &[ScoreHistoryEntry],
    ceiling: i32,
    now: DateTime<Utc>,
) -> ScoreComputation {
    let facts = LeadFacts::new(lead, engagements);
    let mut entries = Vec::new();
    let mut skipped_rules = Vec::new();
    let mut active = HashSet::new();

    for rule in rules.iter().filter(|r| r.is_active) {
        active.insert(rule.id);

        let matched = match check_rule(rule, &facts) {
            Ok(matched) => matched,
            Err(e) => {
                warn!(lead_id = %lead.id, rule_id = %rule.id, error = %e, "Skipping scoring rule");
                skipped_rules.push(rule.id);
                continue;
            }
        };

        let prior: Vec<&ScoreHistoryEntry> =
            history.iter().filter(|e| e.rule_id == Some(rule.id)).collect();

        match rule.decay_window_days {
            None => {
                let net: Decimal = prior
                    .iter()
                    .filter(|e| e.decay_window_days.is_none())
                    .map(|e| e.delta)
                    .sum();
                let target = if matched { Decimal::from(rule.points) } else { Decimal::ZERO };
                if target != net {
                    entries.push(entry(lead.id, Some(rule.id), target - net, None, Some(rule.name.clone()), now));
                }
            }
            Some(window) => {
                if matched && should_reapply(rule, window, &prior, &facts, now) {
                    entries.push(entry(
                        lead.id,
                        Some(rule.id),
                        Decimal::from(rule.points),
                        Some(window),
                        Some(rule.name.clone()),
                        now,
                    ));
                }
            }
        }
    }

    // Permanent contributions of rules that are no longer active
    let mut orphaned: BTreeMap<Uuid, Decimal> = BTreeMap::new();
    for past in history.iter().filter(|e| e.decay_window_days.is_none()) {
        if let Some(rule_id) = past.rule_id.filter(|id| !active.contains(id)) {
            *orphaned.entry(rule_id).or_default() += past.delta;
        }
    }
    for (rule_id, net) in orphaned.into_iter().filter(|(_, net)| !net.is_zero()) {
        entries.push(entry(lead.id, Some(rule_id), -net, None, Some(REVOKED_REASON.to_string()), now));
    }

    let score = stamp_running_totals(history, &mut entries, ceiling, now);
    ScoreComputation { score, entries, skipped_rules }
}

/// Fill in `resulting_score` on each new entry and return the final score
fn stamp_running_totals(
    history: &[ScoreHistoryEntry],
    entries: &mut [ScoreHistoryEntry],
    ceiling: i32,
    now: DateTime<Utc>,
) -> i32 {
    let mut total: Decimal = history.iter().map(|e| contribution(e, now)).sum();
    for new_entry in entries.iter_mut() {
        total += new_entry.delta;
        new_entry.resulting_score = settle(total, ceiling);
    }
    settle(total, ceiling)
}

fn contended(lead_id: Uuid) -> AutomationError {
    warn!(lead_id = %lead_id, attempts = MAX_SCORE_ATTEMPTS, "Gave up on a contended score write");
    AutomationError::Store(StoreError::Conflict(format!("Score of lead {} is being updated concurrently", lead_id)))
}

pub struct ScoringEngine<S> {
    store: Arc<S>,
    ceiling: i32,
}

impl<S> ScoringEngine<S>
where
    S: LeadStore + RuleStore,
{
    pub fn new(store: Arc<S>, ceiling: i32) -> Self {
        Self { store, ceiling }
    }

    pub fn ceiling(&self) -> i32 {
        self.ceiling
    }

    async fn load_lead(&self, lead_id: Uuid) -> AutomationResult<Lead> {
        self.store
            .get_lead(lead_id)
            .await?
            .ok_or(AutomationError::LeadNotFound(lead_id))
    }

    /// Re-evaluate every active rule for one lead and persist what changed.
    /// Nothing is written when neither the score nor the history moves.
    /// The write only lands if no other writer appended history since the
    /// read; otherwise the evaluation is redone against the fresh history.
    pub async fn rescore(&self, lead_id: Uuid) -> AutomationResult<ScoreChange> {
        for attempt in 1..=MAX_SCORE_ATTEMPTS {
            let lead = self.load_lead(lead_id).await?;
            let rules = self.store.active_scoring_rules().await?;
            let engagements = self.store.engagement_tallies(lead_id).await?;
            let history = self.store.score_history(lead_id).await?;

            let computation = compute_score(&lead, &engagements, &rules, &history, self.ceiling, Utc::now());

            if !computation.entries.is_empty() || computation.score != lead.score {
                let applied = self
                    .store
                    .apply_score(lead_id, history.len(), computation.score, &computation.entries)
                    .await?;
                if !applied {
                    debug!(lead_id = %lead_id, attempt, "Score history moved, re-evaluating");
                    continue;
                }
            }

            if computation.score != lead.score {
                info!(
                    lead_id = %lead_id,
                    from = lead.score,
                    to = computation.score,
                    entries = computation.entries.len(),
                    "Lead rescored"
                );
            } else {
                debug!(lead_id = %lead_id, score = lead.score, "Lead score unchanged");
            }

            return Ok(ScoreChange {
                lead_id,
                previous_score: lead.score,
                score: computation.score,
                entries: computation.entries,
            });
        }

        Err(contended(lead_id))
    }

    /// Manual adjustment, recorded without a rule id. Merged or inactive
    /// leads are refused.
    pub async fn adjust(&self, lead_id: Uuid, delta: i32, reason: Option<String>) -> AutomationResult<ScoreChange> {
        for attempt in 1..=MAX_SCORE_ATTEMPTS {
            let lead = self.load_lead(lead_id).await?;
            if !lead.is_active || lead.merged_into_id.is_some() {
                return Err(AutomationError::LeadInactive(lead_id));
            }
            let history = self.store.score_history(lead_id).await?;
            let now = Utc::now();

            let mut entries = vec![entry(lead_id, None, Decimal::from(delta), None, reason.clone(), now)];
            let score = stamp_running_totals(&history, &mut entries, self.ceiling, now);
            if !self.store.apply_score(lead_id, history.len(), score, &entries).await? {
                debug!(lead_id = %lead_id, attempt, "Score history moved, retrying adjustment");
                continue;
            }

            info!(lead_id = %lead_id, delta, from = lead.score, to = score, "Manual score adjustment");

            return Ok(ScoreChange { lead_id, previous_score: lead.score, score, entries });
        }

        Err(contended(lead_id))
    }

    /// Rescore every active lead so decay shows up without a new event
    pub async fn recalculate_all(&self, batch_size: i64) -> AutomationResult<RecalculationReport> {
        let mut report = RecalculationReport::default();
        let mut after = None;

        loop {
            let ids = self.store.active_lead_ids(after, batch_size.max(1)).await?;
            let Some(last) = ids.last().copied() else {
                break;
            };

            for lead_id in ids {
                report.scanned += 1;
                match self.rescore(lead_id).await {
                    Ok(change) if change.changed() => report.changes.push(change),
                    Ok(_) => {}
                    Err(e) => {
                        report.failed += 1;
                        warn!(lead_id = %lead_id, error = %e, "Score recalculation failed");
                    }
                }
            }
            after = Some(last);
        }

        if !report.changes.is_empty() || report.failed > 0 {
            info!(
                scanned = report.scanned,
                changed = report.changes.len(),
                failed = report.failed,
                "Score recalculation finished"
            );
        }
        Ok(report)
    }
}
