use std::sync::Arc;

use axum::{routing::get, Router};

use appointment_cell::router::{admin_routes, appointment_routes, payment_routes};
use appointment_cell::AppointmentState;
use slot_cell::router::slot_routes;
use slot_cell::SlotState;

pub fn create_router(slots: Arc<SlotState>, appointments: Arc<AppointmentState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Clinic booking API is running!" }))
        .nest("/slots", slot_routes(slots))
        .nest("/appointments", appointment_routes(appointments.clone()))
        .nest("/payments", payment_routes(appointments.clone()))
        .nest("/admin", admin_routes(appointments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use shared_utils::test_utils::TestConfig;

    #[tokio::test]
    async fn liveness_and_cell_mounts() {
        let config = TestConfig::default().to_arc();
        let repo = AppointmentState::repository_from_config(&config);
        let slots = SlotState::in_memory(config.clone());
        let appointments = Arc::new(AppointmentState::new(config, repo, &slots));
        let app = create_router(Arc::new(slots), appointments);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().method("POST").uri("/admin/reconcile-slots").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
