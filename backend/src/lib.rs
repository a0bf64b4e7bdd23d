//! Lead lifecycle automation core
//!
//! Scoring, assignment, duplicate detection, merges and workflow automation
//! for CRM leads, with a tenant-bound store and a durable execution
//! scheduler.

use axum::{http::Method, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod leads;
pub mod notifications;
pub mod pagination;
pub mod store;
pub mod validation;
pub mod workflows;

pub use error::{ApiError, ApiResult, AppError, AutomationError, AutomationResult};
pub use pagination::{PaginatedResponse, PaginationMeta, PaginationParams};

use handlers::AppState;
use store::AutomationStore;

#[cfg(test)]
mod tests;

/// The HTTP application with tracing and CORS applied
pub fn app<S: AutomationStore>(state: Arc<AppState<S>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    handlers::router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    )
}
