//! Operational view over workflow executions

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Json,
    routing::{get, post},
    Router,
};
use leadflow_shared::{ExecutionStatus, WorkflowExecution};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::AppState;
use crate::error::ApiResult;
use crate::pagination::{PaginatedResponse, PaginationParams, DEFAULT_PAGE, DEFAULT_PAGE_SIZE};
use crate::store::AutomationStore;

/// `?status=&page=&per_page=`. Not flattened over `PaginationParams`:
/// `serde(flatten)` cannot parse numbers out of a query string.
#[derive(Debug, Deserialize)]
pub struct ExecutionListParams {
    pub status: Option<ExecutionStatus>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

impl ExecutionListParams {
    fn pagination(&self) -> PaginationParams {
        PaginationParams::new(
            self.page.unwrap_or(DEFAULT_PAGE),
            self.per_page.unwrap_or(DEFAULT_PAGE_SIZE),
        )
    }
}

async fn list_executions<S: AutomationStore>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Query(params): Query<ExecutionListParams>,
) -> ApiResult<Json<PaginatedResponse<WorkflowExecution>>> {
    let automation = state.tenant(&headers).await?;
    let pagination = params.pagination();
    let page = automation
        .list_executions(params.status, pagination.limit(), pagination.offset())
        .await?;
    Ok(Json(PaginatedResponse::new(page.executions, &pagination, page.total)))
}

async fn cancel_execution<S: AutomationStore>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowExecution>> {
    let automation = state.tenant(&headers).await?;
    Ok(Json(automation.cancel_execution(id).await?))
}

pub fn execution_routes<S: AutomationStore>() -> Router<Arc<AppState<S>>> {
    Router::new()
        .route("/workflow-executions", get(list_executions::<S>))
        .route("/workflow-executions/:id/cancel", post(cancel_execution::<S>))
}
