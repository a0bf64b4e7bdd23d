// Shared helpers for the integration tests under tests/
#![allow(dead_code)]

use chrono::Utc;
use leadflow_backend::config::{AutomationConfig, SchedulerConfig};
use leadflow_backend::notifications::BroadcastNotifier;
use leadflow_backend::store::MemoryStore;
use leadflow_backend::workflows::LeadAutomation;
use leadflow_shared::Lead;
use std::sync::{Arc, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("leadflow_backend=debug")
            .try_init()
            .ok();
    });
}

pub fn lead(first_name: &str, owner_id: Option<Uuid>) -> Lead {
    let now = Utc::now();
    Lead {
        id: Uuid::new_v4(),
        first_name: first_name.to_string(),
        last_name: "Tester".to_string(),
        email: Some(format!("{}@example.com", first_name.to_lowercase())),
        phone: None,
        company_name: None,
        job_title: None,
        source: Some("website".to_string()),
        status: "new".to_string(),
        previous_status: None,
        city: None,
        state: None,
        country: None,
        score: 0,
        owner_id,
        is_active: true,
        merged_into_id: None,
        created_at: now,
        updated_at: now,
        status_changed_at: None,
        last_engagement_at: None,
        archived_at: None,
    }
}

pub fn automation(store: Arc<MemoryStore>, scheduler: SchedulerConfig) -> Arc<LeadAutomation<MemoryStore>> {
    Arc::new(LeadAutomation::new(
        store,
        Arc::new(BroadcastNotifier::default()),
        AutomationConfig::default(),
        scheduler,
    ))
}
