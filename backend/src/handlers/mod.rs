//! HTTP surface of the automation core
//!
//! Thin axum handlers over [`LeadAutomation`]. The tenant is picked by the
//! `X-Tenant-Id` header from a directory that grows as tenants are provisioned.

use axum::{
    extract::State,
    http::HeaderMap,
    response::Json,
    routing::get,
    Router,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ApiResult, AppError};
use crate::store::AutomationStore;
use crate::workflows::LeadAutomation;

pub mod events;
pub mod executions;
pub mod leads;

pub use events::event_routes;
pub use executions::execution_routes;
pub use leads::{duplicate_routes, lead_routes};

pub const TENANT_HEADER: &str = "x-tenant-id";

pub struct AppState<S> {
    tenants: RwLock<HashMap<Uuid, Arc<LeadAutomation<S>>>>,
}

impl<S: AutomationStore> AppState<S> {
    pub fn new(tenants: HashMap<Uuid, Arc<LeadAutomation<S>>>) -> Self {
        Self { tenants: RwLock::new(tenants) }
    }

    /// Add a tenant; `false` if it was already served
    pub async fn insert_tenant(&self, tenant_id: Uuid, automation: Arc<LeadAutomation<S>>) -> bool {
        let mut tenants = self.tenants.write().await;
        if tenants.contains_key(&tenant_id) {
            return false;
        }
        tenants.insert(tenant_id, automation);
        true
    }

    pub async fn has_tenant(&self, tenant_id: Uuid) -> bool {
        self.tenants.read().await.contains_key(&tenant_id)
    }

    pub async fn tenant_count(&self) -> usize {
        self.tenants.read().await.len()
    }

    /// The automation service for the tenant named in the request headers
    pub async fn tenant(&self, headers: &HeaderMap) -> ApiResult<Arc<LeadAutomation<S>>> {
        let raw = headers
            .get(TENANT_HEADER)
            .ok_or_else(|| AppError::bad_request("X-Tenant-Id header is required"))?;
        let tenant_id = raw
            .to_str()
            .ok()
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .ok_or_else(|| AppError::bad_request("X-Tenant-Id must be a UUID"))?;

        self.tenants
            .read()
            .await
            .get(&tenant_id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("Tenant {}", tenant_id)))
    }
}

async fn health<S: AutomationStore>(State(state): State<Arc<AppState<S>>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "tenants": state.tenant_count().await,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub fn router<S: AutomationStore>(state: Arc<AppState<S>>) -> Router {
    let api = Router::new()
        .merge(event_routes())
        .merge(lead_routes())
        .merge(duplicate_routes())
        .merge(execution_routes());

    Router::new()
        .route("/health", get(health::<S>))
        .nest("/api/v1", api)
        .with_state(state)
}
