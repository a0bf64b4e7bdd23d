//! Lead endpoints: engagements, scoring, assignment, duplicates and merges

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use leadflow_shared::{DuplicateCandidate, EngagementKind, MergeHistoryRecord, ScoreHistoryEntry};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::AppState;
use crate::error::ApiResult;
use crate::leads::{AssignmentOutcome, MergeRequest};
use crate::store::AutomationStore;
use crate::validation::ValidatedJson;
use crate::workflows::{EventReport, MergeReport};

// ==================== Requests ====================

#[derive(Debug, Deserialize, Validate)]
pub struct RecordEngagementRequest {
    pub kind: EngagementKind,
    /// Defaults to now
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AdjustScoreRequest {
    #[validate(range(min = -1000, max = 1000))]
    pub delta: i32,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

// ==================== Handlers ====================

async fn record_engagement<S: AutomationStore>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Path(lead_id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<RecordEngagementRequest>,
) -> ApiResult<Json<EventReport>> {
    let automation = state.tenant(&headers).await?;
    let report = automation
        .record_engagement(lead_id, request.kind, request.occurred_at)
        .await?;
    Ok(Json(report))
}

async fn adjust_score<S: AutomationStore>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Path(lead_id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<AdjustScoreRequest>,
) -> ApiResult<Json<EventReport>> {
    let automation = state.tenant(&headers).await?;
    let reason = request.reason.filter(|r| !r.trim().is_empty());
    let report = automation.adjust_score(lead_id, request.delta, reason).await?;
    Ok(Json(report))
}

async fn score_history<S: AutomationStore>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Path(lead_id): Path<Uuid>,
) -> ApiResult<Json<Vec<ScoreHistoryEntry>>> {
    let automation = state.tenant(&headers).await?;
    Ok(Json(automation.score_history(lead_id).await?))
}

async fn assign_lead<S: AutomationStore>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Path(lead_id): Path<Uuid>,
) -> ApiResult<Json<AssignmentOutcome>> {
    let automation = state.tenant(&headers).await?;
    Ok(Json(automation.assign_lead(lead_id).await?))
}

async fn lead_duplicates<S: AutomationStore>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Path(lead_id): Path<Uuid>,
) -> ApiResult<Json<Vec<DuplicateCandidate>>> {
    let automation = state.tenant(&headers).await?;
    Ok(Json(automation.check_duplicates(lead_id).await?))
}

async fn merge_history<S: AutomationStore>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Path(lead_id): Path<Uuid>,
) -> ApiResult<Json<Vec<MergeHistoryRecord>>> {
    let automation = state.tenant(&headers).await?;
    Ok(Json(automation.merge_history(lead_id).await?))
}

async fn merge_leads<S: AutomationStore>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    ValidatedJson(request): ValidatedJson<MergeRequest>,
) -> ApiResult<Json<MergeReport>> {
    let automation = state.tenant(&headers).await?;
    Ok(Json(automation.merge_leads(&request).await?))
}

async fn dismiss_duplicate<S: AutomationStore>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Path(candidate_id): Path<Uuid>,
) -> ApiResult<Json<DuplicateCandidate>> {
    let automation = state.tenant(&headers).await?;
    Ok(Json(automation.dismiss_duplicate(candidate_id).await?))
}

// ==================== Routes ====================

pub fn lead_routes<S: AutomationStore>() -> Router<Arc<AppState<S>>> {
    Router::new()
        .route("/leads/merge", post(merge_leads::<S>))
        .route("/leads/:id/engagements", post(record_engagement::<S>))
        .route("/leads/:id/score/adjust", post(adjust_score::<S>))
        .route("/leads/:id/score/history", get(score_history::<S>))
        .route("/leads/:id/assign", post(assign_lead::<S>))
        .route("/leads/:id/duplicates", get(lead_duplicates::<S>))
        .route("/leads/:id/merges", get(merge_history::<S>))
}

pub fn duplicate_routes<S: AutomationStore>() -> Router<Arc<AppState<S>>> {
    Router::new().route("/duplicates/:id/dismiss", post(dismiss_duplicate::<S>))
}
