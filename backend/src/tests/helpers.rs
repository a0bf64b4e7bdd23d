use axum::{
    body::{to_bytes, Body},
    http::{header::CONTENT_TYPE, Method, Request, Response},
    Router,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{AutomationConfig, SchedulerConfig};
use crate::handlers::{AppState, TENANT_HEADER};
use crate::notifications::{BroadcastNotifier, Notifier};
use crate::store::MemoryStore;
use crate::workflows::LeadAutomation;

pub fn test_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        worker_id: "test-worker".to_string(),
        backoff_base_secs: 1,
        ..SchedulerConfig::default()
    }
}

pub fn automation_with(store: Arc<MemoryStore>, notifier: Arc<dyn Notifier>) -> Arc<LeadAutomation<MemoryStore>> {
    Arc::new(LeadAutomation::new(
        store,
        notifier,
        AutomationConfig::default(),
        test_scheduler_config(),
    ))
}

/// One tenant over a fresh store, with notifications going nowhere
pub struct TestApp {
    pub tenant_id: Uuid,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<BroadcastNotifier>,
    pub state: Arc<AppState<MemoryStore>>,
    pub router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        let tenant_id = Uuid::new_v4();
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(BroadcastNotifier::default());
        let automation = automation_with(store.clone(), notifier.clone());

        let mut tenants = HashMap::new();
        tenants.insert(tenant_id, automation);
        let state = Arc::new(AppState::new(tenants));
        let router = crate::app(state.clone());

        Self { tenant_id, store, notifier, state, router }
    }

    pub fn request(&self, method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(TENANT_HEADER, self.tenant_id.to_string());
        match body {
            Some(json) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .expect("Failed to build request"),
            None => builder.body(Body::empty()).expect("Failed to build request"),
        }
    }
}

pub async fn read_json(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");
    serde_json::from_slice(&bytes).expect("Response was not JSON")
}
