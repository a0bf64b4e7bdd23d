// Integration tests for the lead endpoints

use axum::http::{Method, StatusCode};
use leadflow_shared::{Condition, EngagementKind, Field};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use crate::notifications::BroadcastNotifier;
use crate::store::{LeadStore, MemoryStore};
use crate::tests::fixtures::{scoring_rule, LeadFixture};
use crate::tests::helpers::{automation_with, read_json, TestApp};

#[tokio::test]
async fn test_health() {
    let app = TestApp::new();
    let response = app
        .router
        .clone()
        .oneshot(app.request(Method::GET, "/health", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["tenants"], 1);
}

#[tokio::test]
async fn test_missing_or_unknown_tenant_is_rejected() {
    let app = TestApp::new();
    let lead_id = Uuid::new_v4();

    let request = axum::http::Request::builder()
        .method(Method::POST)
        .uri(format!("/api/v1/leads/{}/assign", lead_id))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let request = axum::http::Request::builder()
        .method(Method::POST)
        .uri(format!("/api/v1/leads/{}/assign", lead_id))
        .header("X-Tenant-Id", Uuid::new_v4().to_string())
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_engagement_rescores_and_history_is_listed() {
    let app = TestApp::new();
    app.store
        .add_scoring_rule(scoring_rule(
            Condition::greater_than(Field::Engagement(EngagementKind::LinkClicked), 0.0),
            12,
        ))
        .await;
    let lead = LeadFixture::default().build();
    app.store.insert_lead(lead.clone()).await;

    let response = app
        .router
        .clone()
        .oneshot(app.request(
            Method::POST,
            &format!("/api/v1/leads/{}/engagements", lead.id),
            Some(json!({ "kind": "link_clicked" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["score"]["score"], 12);

    let response = app
        .router
        .clone()
        .oneshot(app.request(Method::GET, &format!("/api/v1/leads/{}/score/history", lead.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let history = read_json(response).await;
    assert_eq!(history.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_score_adjustment_is_validated() {
    let app = TestApp::new();
    let lead = LeadFixture::default().build();
    app.store.insert_lead(lead.clone()).await;
    let uri = format!("/api/v1/leads/{}/score/adjust", lead.id);

    let response = app
        .router
        .clone()
        .oneshot(app.request(Method::POST, &uri, Some(json!({ "delta": 5000 }))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = read_json(response).await;
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert!(body["details"]["delta"].is_array());

    let response = app
        .router
        .clone()
        .oneshot(app.request(Method::POST, &uri, Some(json!({ "delta": 15, "reason": "trade show" }))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.store.get_lead(lead.id).await.unwrap().unwrap().score, 15);
}

#[tokio::test]
async fn test_unknown_lead_is_not_found() {
    let app = TestApp::new();
    let response = app
        .router
        .clone()
        .oneshot(app.request(
            Method::POST,
            &format!("/api/v1/leads/{}/engagements", Uuid::new_v4()),
            Some(json!({ "kind": "call_logged" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_duplicates_then_dismiss() {
    let app = TestApp::new();
    let a = LeadFixture::default().with_email("ops@acme.test").build();
    let b = LeadFixture::default().with_email("OPS@acme.test").build();
    app.store.insert_lead(a.clone()).await;
    app.store.insert_lead(b.clone()).await;

    let response = app
        .router
        .clone()
        .oneshot(app.request(Method::GET, &format!("/api/v1/leads/{}/duplicates", a.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let candidates = read_json(response).await;
    let candidate_id = candidates[0]["id"].as_str().unwrap().to_string();
    assert_eq!(candidates[0]["basis"], "email-exact");

    let response = app
        .router
        .clone()
        .oneshot(app.request(Method::POST, &format!("/api/v1/duplicates/{}/dismiss", candidate_id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["status"], "dismissed");
}

#[tokio::test]
async fn test_merge_conflict_surfaces_as_409() {
    let app = TestApp::new();
    let survivor = LeadFixture::default().build();
    let loser = LeadFixture::default().build();
    let third = LeadFixture::default().build();
    for lead in [&survivor, &loser, &third] {
        app.store.insert_lead(lead.clone()).await;
    }

    let merge = |survivor_id: Uuid, loser_id: Uuid| {
        app.request(
            Method::POST,
            "/api/v1/leads/merge",
            Some(json!({
                "survivor_id": survivor_id,
                "loser_id": loser_id,
                "resolutions": [{ "field": "first_name", "choice": { "choice": "take_loser" } }]
            })),
        )
    };

    let response = app.router.clone().oneshot(merge(survivor.id, loser.id)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["survivor"]["first_name"], loser.first_name.as_str());

    // The loser is gone now
    let response = app.router.clone().oneshot(merge(third.id, loser.id)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(read_json(response).await["code"], "MERGE_CONFLICT");

    let response = app.router.clone().oneshot(merge(third.id, third.id)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_tenant_provisioned_after_start_is_served() {
    let app = TestApp::new();
    let tenant_id = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());
    let lead = LeadFixture::default().build();
    store.insert_lead(lead.clone()).await;

    let uri = format!("/api/v1/leads/{}/score/adjust", lead.id);
    let request = |tenant: Uuid| {
        axum::http::Request::builder()
            .method(Method::POST)
            .uri(&uri)
            .header("X-Tenant-Id", tenant.to_string())
            .header("content-type", "application/json")
            .body(axum::body::Body::from(json!({ "delta": 5 }).to_string()))
            .unwrap()
    };

    let response = app.router.clone().oneshot(request(tenant_id)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let automation = automation_with(store.clone(), Arc::new(BroadcastNotifier::default()));
    assert!(app.state.insert_tenant(tenant_id, automation.clone()).await);
    assert!(!app.state.insert_tenant(tenant_id, automation).await);

    let response = app.router.clone().oneshot(request(tenant_id)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(store.get_lead(lead.id).await.unwrap().unwrap().score, 5);
    assert_eq!(app.state.tenant_count().await, 2);
}

#[tokio::test]
async fn test_adjusting_merged_lead_is_conflict() {
    let app = TestApp::new();
    let mut lead = LeadFixture::default().build();
    lead.is_active = false;
    lead.merged_into_id = Some(Uuid::new_v4());
    app.store.insert_lead(lead.clone()).await;

    let response = app
        .router
        .clone()
        .oneshot(app.request(
            Method::POST,
            &format!("/api/v1/leads/{}/score/adjust", lead.id),
            Some(json!({ "delta": 5 })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(app.store.get_lead(lead.id).await.unwrap().unwrap().score, 0);
}
