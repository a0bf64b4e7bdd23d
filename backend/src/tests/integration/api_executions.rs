// Integration tests for event ingestion and the execution endpoints

use axum::http::{Method, StatusCode};
use leadflow_shared::{WorkflowAction, WorkflowTrigger};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use crate::tests::fixtures::{workflow_rule, LeadFixture};
use crate::tests::helpers::{read_json, TestApp};

/// Three leads, each with one delayed archive waiting
async fn app_with_pending_executions() -> TestApp {
    let app = TestApp::new();
    let mut rule = workflow_rule(WorkflowTrigger::EntityCreated, WorkflowAction::Archive);
    rule.delay_minutes = 30;
    app.store.add_workflow_rule(rule).await;

    for n in 0..3 {
        let lead = LeadFixture::default().build();
        app.store.insert_lead(lead.clone()).await;
        let response = app
            .router
            .clone()
            .oneshot(app.request(
                Method::POST,
                "/api/v1/events",
                Some(json!({ "event_id": format!("delivery-{}", n), "entity_id": lead.id, "type": "created" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    app
}

async fn get(app: &TestApp, uri: &str) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(app.request(Method::GET, uri, None)).await.unwrap();
    let status = response.status();
    (status, read_json(response).await)
}

async fn cancel(app: &TestApp, id: &str) -> (StatusCode, Value) {
    let response = app
        .router
        .clone()
        .oneshot(app.request(Method::POST, &format!("/api/v1/workflow-executions/{}/cancel", id), None))
        .await
        .unwrap();
    let status = response.status();
    (status, read_json(response).await)
}

#[tokio::test]
async fn test_ingested_event_is_scheduled_once() {
    let app = TestApp::new();
    let mut rule = workflow_rule(WorkflowTrigger::EntityCreated, WorkflowAction::Archive);
    rule.delay_minutes = 30;
    app.store.add_workflow_rule(rule).await;
    let lead = LeadFixture::default().build();
    app.store.insert_lead(lead.clone()).await;

    let body = json!({ "event_id": "crm-7", "entity_id": lead.id, "type": "created" });
    for expected in [1, 0] {
        let response = app
            .router
            .clone()
            .oneshot(app.request(Method::POST, "/api/v1/events", Some(body.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = read_json(response).await;
        assert_eq!(report["scheduled"].as_array().map(Vec::len), Some(expected));
    }
}

#[tokio::test]
async fn test_blank_event_id_is_rejected() {
    let app = TestApp::new();
    let response = app
        .router
        .clone()
        .oneshot(app.request(
            Method::POST,
            "/api/v1/events",
            Some(json!({ "event_id": "", "entity_id": Uuid::new_v4(), "type": "created" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_list_executions_paginates_and_filters() {
    let app = app_with_pending_executions().await;

    let (status, page) = get(&app, "/api/v1/workflow-executions?status=pending&per_page=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["data"].as_array().map(Vec::len), Some(2));
    assert_eq!(page["meta"]["total"], 3);
    assert_eq!(page["meta"]["total_pages"], 2);
    assert_eq!(page["meta"]["has_next"], true);

    let (_, second) = get(&app, "/api/v1/workflow-executions?status=pending&page=2&per_page=2").await;
    assert_eq!(second["data"].as_array().map(Vec::len), Some(1));

    let (_, completed) = get(&app, "/api/v1/workflow-executions?status=completed").await;
    assert_eq!(completed["meta"]["total"], 0);
}

#[tokio::test]
async fn test_cancel_only_while_pending() {
    let app = app_with_pending_executions().await;
    let (_, page) = get(&app, "/api/v1/workflow-executions").await;
    let id = page["data"][0]["id"].as_str().unwrap().to_string();

    let (status, cancelled) = cancel(&app, &id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "cancelled");

    let (status, again) = cancel(&app, &id).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(again["code"], "CONFLICT");

    let (status, _) = cancel(&app, &Uuid::new_v4().to_string()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, pending) = get(&app, "/api/v1/workflow-executions?status=pending").await;
    assert_eq!(pending["meta"]["total"], 2);
}
