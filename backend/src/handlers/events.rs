//! Domain event ingestion from the CRUD layer

use axum::{extract::State, http::HeaderMap, response::Json, routing::post, Router};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::AppState;
use crate::error::ApiResult;
use crate::store::AutomationStore;
use crate::validation::ValidatedJson;
use crate::workflows::{DomainEvent, EventKind, EventReport};

#[derive(Debug, Deserialize, Validate)]
pub struct IngestEventRequest {
    /// Delivery id. Redelivering the same id schedules nothing new.
    #[validate(length(min = 1, max = 200))]
    pub event_id: Option<String>,
    pub entity_id: Uuid,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl IngestEventRequest {
    pub fn into_event(self) -> DomainEvent {
        let event = DomainEvent::new(self.entity_id, self.kind);
        match self.event_id {
            Some(token) => event.with_token(token),
            None => event,
        }
    }
}

async fn ingest_event<S: AutomationStore>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    ValidatedJson(request): ValidatedJson<IngestEventRequest>,
) -> ApiResult<Json<EventReport>> {
    let automation = state.tenant(&headers).await?;
    let report = automation.handle_event(&request.into_event()).await?;
    Ok(Json(report))
}

pub fn event_routes<S: AutomationStore>() -> Router<Arc<AppState<S>>> {
    Router::new().route("/events", post(ingest_event::<S>))
}
