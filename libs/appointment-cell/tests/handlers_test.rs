use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use shared_utils::signature::sign_payload;
use shared_utils::test_utils::{JwtTestUtils, ManualClock, TestConfig, TestUser};
use slot_cell::router::slot_routes;
use slot_cell::services::{InMemoryHoldRepository, InMemorySlotRepository};
use slot_cell::SlotState;

use appointment_cell::handlers::SIGNATURE_HEADER;
use appointment_cell::router::{admin_routes, appointment_routes, payment_routes};
use appointment_cell::services::{AppointmentRepository, InMemoryAppointmentRepository};
use appointment_cell::AppointmentState;

struct TestApp {
    router: Router,
    config: TestConfig,
}

impl TestApp {
    fn new() -> Self {
        let config = TestConfig::default();
        let app_config = config.to_arc();
        let repo: Arc<dyn AppointmentRepository> = Arc::new(InMemoryAppointmentRepository::new());
        let slots = SlotState::new(
            app_config.clone(),
            Arc::new(InMemorySlotRepository::new()),
            Arc::new(InMemoryHoldRepository::new()),
            AppointmentState::booking_guard(repo.clone()),
            Arc::new(ManualClock::at_fixed_start()),
        );
        let appointments = Arc::new(AppointmentState::new(app_config, repo, &slots));

        let router = Router::new()
            .nest("/slots", slot_routes(Arc::new(slots)))
            .nest("/appointments", appointment_routes(appointments.clone()))
            .nest("/payments", payment_routes(appointments.clone()))
            .nest("/admin", admin_routes(appointments));

        Self { router, config }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
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
        self.send(request).await
    }

    async fn webhook(&self, payload: Value, signature: Option<String>) -> (StatusCode, Value) {
        let body = payload.to_string();
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/payments/webhook")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        self.send(builder.body(Body::from(body)).unwrap()).await
    }

    fn sign(&self, payload: &Value) -> String {
        sign_payload(payload.to_string().as_bytes(), &self.config.webhook_secret)
    }

    async fn create_slot(&self, doctor: &TestUser, start: &str, end: &str) -> String {
        let (status, created) = self
            .call(
                Method::POST,
                "/slots",
                Some(doctor),
                Some(json!({ "date": "2025-03-10", "start_time": start, "end_time": end })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        created["slot"]["id"].as_str().unwrap().to_string()
    }

    async fn book(&self, patient: &TestUser, doctor: &TestUser, slot_id: &str) -> String {
        let (status, body) = self
            .call(
                Method::POST,
                "/appointments",
                Some(patient),
                Some(json!({ "doctor_id": doctor.id, "slot_id": slot_id, "price": 35.0 })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["appointment"]["status"], "pending");
        body["appointment"]["id"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn appointment_routes_require_a_token() {
    let app = TestApp::new();

    let (status, body) = app
        .call(Method::POST, "/appointments", None, Some(json!({ "price": 1.0 })))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, _) = app.call(Method::POST, "/admin/reconcile-slots", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn client_confirmation_then_signed_webhook_converge() {
    let app = TestApp::new();
    let doctor = TestUser::doctor("doc@example.com");
    let patient = TestUser::patient("pat@example.com");
    let slot_id = app.create_slot(&doctor, "09:00", "09:30").await;
    let appointment_id = app.book(&patient, &doctor, &slot_id).await;

    let (status, body) = app
        .call(
            Method::POST,
            &format!("/appointments/{}/checkout", appointment_id),
            Some(&patient),
            Some(json!({ "payment_reference": "cs_test_1" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["appointment"]["status"], "pending_payment");

    let (status, body) = app
        .call(
            Method::POST,
            &format!("/appointments/{}/confirm-payment", appointment_id),
            Some(&patient),
            Some(json!({})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["appointment"]["status"], "paid");
    assert_eq!(body["already_paid"], false);

    let event = json!({ "appointment_id": appointment_id, "payment_reference": "pi_1", "status": "succeeded" });
    let (status, body) = app.webhook(event.clone(), Some(app.sign(&event))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["already_paid"], true);

    let (_, listed) = app
        .call(Method::GET, &format!("/slots?doctor_id={}&date=2025-03-10", doctor.id), None, None)
        .await;
    assert_eq!(listed["slots"][0]["is_available"], false);
}

#[tokio::test]
async fn webhook_rejects_bad_signatures() {
    let app = TestApp::new();
    let event = json!({ "appointment_id": uuid::Uuid::new_v4(), "status": "succeeded" });

    let (status, body) = app.webhook(event.clone(), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let forged = sign_payload(event.to_string().as_bytes(), "not-the-secret");
    let (status, _) = app.webhook(event, Some(forged)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn webhook_for_a_lost_slot_asks_for_a_refund_without_failing() {
    let app = TestApp::new();
    let doctor = TestUser::doctor("doc@example.com");
    let first = TestUser::patient("first@example.com");
    let second = TestUser::patient("second@example.com");
    let slot_id = app.create_slot(&doctor, "09:00", "09:30").await;
    let winner = app.book(&first, &doctor, &slot_id).await;
    let loser = app.book(&second, &doctor, &slot_id).await;

    let paid = json!({ "appointment_id": winner, "status": "succeeded" });
    let (status, _) = app.webhook(paid.clone(), Some(app.sign(&paid))).await;
    assert_eq!(status, StatusCode::OK);

    let late = json!({ "appointment_id": loser, "status": "succeeded" });
    let (status, body) = app.webhook(late.clone(), Some(app.sign(&late))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["refund_required"], true);
}

#[tokio::test]
async fn failed_payment_webhook_marks_the_appointment() {
    let app = TestApp::new();
    let doctor = TestUser::doctor("doc@example.com");
    let patient = TestUser::patient("pat@example.com");
    let slot_id = app.create_slot(&doctor, "09:00", "09:30").await;
    let appointment_id = app.book(&patient, &doctor, &slot_id).await;

    let event = json!({ "appointment_id": appointment_id, "status": "failed" });
    let (status, body) = app.webhook(event.clone(), Some(app.sign(&event))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "payment_failed");
}

#[tokio::test]
async fn late_webhooks_are_acknowledged_without_changing_state() {
    let app = TestApp::new();
    let doctor = TestUser::doctor("doc@example.com");
    let patient = TestUser::patient("pat@example.com");
    let first_slot = app.create_slot(&doctor, "09:00", "09:30").await;
    let second_slot = app.create_slot(&doctor, "10:00", "10:30").await;

    let cancelled = app.book(&patient, &doctor, &first_slot).await;
    let (status, _) = app
        .call(
            Method::PUT,
            &format!("/appointments/{}/cancel", cancelled),
            Some(&patient),
            Some(json!({ "reason": "changed my mind" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let succeeded = json!({ "appointment_id": cancelled, "payment_reference": "pi_late", "status": "succeeded" });
    let (status, body) = app.webhook(succeeded.clone(), Some(app.sign(&succeeded))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["refund_required"], true);

    let paid = app.book(&patient, &doctor, &second_slot).await;
    let confirmed = json!({ "appointment_id": paid, "status": "succeeded" });
    app.webhook(confirmed.clone(), Some(app.sign(&confirmed))).await;

    let failed = json!({ "appointment_id": paid, "status": "failed" });
    let (status, body) = app.webhook(failed.clone(), Some(app.sign(&failed))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "paid");
}

#[tokio::test]
async fn reschedule_and_cancel_report_their_outcomes() {
    let app = TestApp::new();
    let doctor = TestUser::doctor("doc@example.com");
    let patient = TestUser::patient("pat@example.com");
    let old_slot = app.create_slot(&doctor, "09:00", "09:30").await;
    let new_slot = app.create_slot(&doctor, "10:00", "10:30").await;
    let appointment_id = app.book(&patient, &doctor, &old_slot).await;

    let event = json!({ "appointment_id": appointment_id, "status": "succeeded" });
    app.webhook(event.clone(), Some(app.sign(&event))).await;

    let (status, body) = app
        .call(
            Method::PUT,
            &format!("/appointments/{}/reschedule", appointment_id),
            Some(&patient),
            Some(json!({ "new_slot_id": new_slot, "reason": "train delayed" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["appointment"]["slot_id"], new_slot.as_str());
    assert_eq!(body["appointment"]["reschedule_count"], 1);
    assert_eq!(body["is_admin_override"], false);

    let (status, body) = app
        .call(
            Method::PUT,
            &format!("/appointments/{}/cancel", appointment_id),
            Some(&patient),
            Some(json!({ "reason": "feeling better" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["appointment"]["status"], "cancelled");
    assert_eq!(body["refund_eligible"], true);

    let (status, body) = app
        .call(
            Method::PUT,
            &format!("/appointments/{}/cancel", appointment_id),
            Some(&patient),
            Some(json!({ "reason": "again" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let (status, body) = app
        .call(Method::GET, &format!("/appointments/{}/changes", appointment_id), Some(&doctor), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["changes"][0]["action"], "reschedule");
    assert_eq!(body["changes"][1]["action"], "cancel");
}

#[tokio::test]
async fn strangers_and_non_admins_are_forbidden() {
    let app = TestApp::new();
    let doctor = TestUser::doctor("doc@example.com");
    let patient = TestUser::patient("pat@example.com");
    let stranger = TestUser::patient("nosy@example.com");
    let slot_id = app.create_slot(&doctor, "09:00", "09:30").await;
    let appointment_id = app.book(&patient, &doctor, &slot_id).await;

    let (status, _) = app
        .call(Method::GET, &format!("/appointments/{}", appointment_id), Some(&stranger), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app.call(Method::POST, "/admin/reconcile-slots", Some(&doctor), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin = TestUser::admin("ops@example.com");
    let (status, body) = app.call(Method::POST, "/admin/reconcile-slots", Some(&admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["examined"], 0);
}
