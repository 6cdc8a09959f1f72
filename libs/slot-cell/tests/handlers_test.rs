use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use shared_utils::test_utils::{JwtTestUtils, TestConfig, TestUser};
use slot_cell::router::slot_routes;
use slot_cell::SlotState;

struct TestApp {
    router: Router,
    config: TestConfig,
}

impl TestApp {
    fn new() -> Self {
        let config = TestConfig::default();
        let state = Arc::new(SlotState::in_memory(config.to_arc()));
        Self {
            router: Router::new().nest("/slots", slot_routes(state)),
            config,
        }
    }

    async fn call(&self, method: Method, uri: &str, user: Option<&TestUser>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(header::AUTHORIZATION, JwtTestUtils::bearer(user, &self.config.jwt_secret));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }
}

#[tokio::test]
async fn doctor_creates_batch_and_patient_sees_it() {
    let app = TestApp::new();
    let doctor = TestUser::doctor("doc@example.com");

    let (status, body) = app
        .call(
            Method::POST,
            "/slots/batch",
            Some(&doctor),
            Some(json!({
                "ranges": [{ "start_time": "2025-03-10T07:00:00Z", "end_time": "2025-03-10T08:00:00Z" }]
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["created_count"], 2);

    let (status, body) = app
        .call(Method::GET, &format!("/slots?doctor_id={}&date=2025-03-10", doctor.id), None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["slots"][0]["start_time"], "09:00");
    assert_eq!(body["slots"][0]["is_available"], true);
}

#[tokio::test]
async fn hold_conflict_is_a_400_with_slot_unavailable_code() {
    let app = TestApp::new();
    let doctor = TestUser::doctor("doc@example.com");

    let (_, created) = app
        .call(
            Method::POST,
            "/slots",
            Some(&doctor),
            Some(json!({ "date": "2025-03-10", "start_time": "09:00", "end_time": "09:30" })),
        )
        .await;
    let slot_id = created["slot"]["id"].as_str().unwrap().to_string();

    let (status, first) = app
        .call(Method::POST, "/slots/hold", None, Some(json!({ "slot_id": slot_id })))
        .await;
    assert_eq!(status, StatusCode::OK);
    let session_id = first["session_id"].as_str().unwrap().to_string();
    assert!(first["expires_at"].is_string());

    let (status, second) = app
        .call(Method::POST, "/slots/hold", None, Some(json!({ "slot_id": slot_id, "session_id": "someone-else" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(second["code"], "SLOT_UNAVAILABLE");

    let (_, held) = app
        .call(Method::GET, &format!("/slots/held?session_id={}", session_id), None, None)
        .await;
    assert_eq!(held["hold"]["slot_id"], slot_id.as_str());

    let (status, _) = app
        .call(Method::POST, "/slots/release", None, Some(json!({ "slot_id": slot_id })))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, held) = app
        .call(Method::GET, &format!("/slots/held?session_id={}", session_id), None, None)
        .await;
    assert!(held["hold"].is_null());
}

#[tokio::test]
async fn hold_length_is_fixed_whatever_the_client_asks_for() {
    let app = TestApp::new();
    let doctor = TestUser::doctor("doc@example.com");

    let (_, created) = app
        .call(
            Method::POST,
            "/slots",
            Some(&doctor),
            Some(json!({ "date": "2025-03-10", "start_time": "09:00", "end_time": "09:30" })),
        )
        .await;
    let slot_id = created["slot"]["id"].as_str().unwrap().to_string();

    for minutes in [525_600_i64, 9_000_000_000_000] {
        let (status, body) = app
            .call(
                Method::POST,
                "/slots/hold",
                None,
                Some(json!({ "slot_id": slot_id, "session_id": "greedy", "duration_minutes": minutes })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let held_at: DateTime<Utc> = body["hold"]["held_at"].as_str().unwrap().parse().unwrap();
        let expires_at: DateTime<Utc> = body["expires_at"].as_str().unwrap().parse().unwrap();
        assert_eq!(expires_at - held_at, Duration::minutes(15));
    }
}

#[tokio::test]
async fn editing_requires_authentication_and_ownership() {
    let app = TestApp::new();
    let owner = TestUser::doctor("owner@example.com");
    let other = TestUser::doctor("other@example.com");

    let (status, _) = app
        .call(
            Method::POST,
            "/slots",
            None,
            Some(json!({ "date": "2025-03-10", "start_time": "09:00", "end_time": "09:30" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, created) = app
        .call(
            Method::POST,
            "/slots",
            Some(&owner),
            Some(json!({ "date": "2025-03-10", "start_time": "09:00", "end_time": "09:30" })),
        )
        .await;
    let slot_id = created["slot"]["id"].as_str().unwrap().to_string();

    let (status, body) = app
        .call(Method::DELETE, &format!("/slots/{}", slot_id), Some(&other), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");

    let (status, _) = app
        .call(
            Method::POST,
            "/slots",
            Some(&other),
            Some(json!({ "doctor_id": owner.id, "date": "2025-03-11", "start_time": "09:00", "end_time": "09:30" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn range_delete_accepts_json_body() {
    let app = TestApp::new();
    let doctor = TestUser::doctor("doc@example.com");

    app.call(
        Method::POST,
        "/slots/recurring",
        Some(&doctor),
        Some(json!({
            "day_of_week": 1,
            "start_time": "09:00",
            "end_time": "10:00",
            "from_date": "2025-03-03",
            "until_date": "2025-03-17"
        })),
    )
    .await;

    let (status, body) = app
        .call(
            Method::DELETE,
            "/slots/range",
            Some(&doctor),
            Some(json!({
                "date": "2025-03-10",
                "start_time": "09:00",
                "end_time": "10:00",
                "scope": "forward"
            })),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 2);
    assert_eq!(body["dates"], json!(["2025-03-10", "2025-03-17"]));
}

#[tokio::test]
async fn cleanup_is_admin_only() {
    let app = TestApp::new();
    let doctor = TestUser::doctor("doc@example.com");
    let admin = TestUser::admin("admin@example.com");

    let (status, _) = app.call(Method::POST, "/slots/cleanup", Some(&doctor), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app.call(Method::POST, "/slots/cleanup", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], 0);
}
