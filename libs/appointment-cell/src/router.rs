// libs/appointment-cell/src/router.rs
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

use shared_utils::extractor::auth_middleware;

use crate::handlers;
use crate::state::AppointmentState;

pub fn appointment_routes(state: Arc<AppointmentState>) -> Router {
    // All appointment operations require authentication
    let protected_routes = Router::new()
        .route("/", post(handlers::create_appointment))
        .route("/{appointment_id}", get(handlers::get_appointment))
        .route("/{appointment_id}/checkout", post(handlers::begin_checkout))
        .route("/{appointment_id}/confirm-payment", post(handlers::confirm_payment))
        .route("/{appointment_id}/reschedule", put(handlers::reschedule_appointment))
        .route("/{appointment_id}/cancel", put(handlers::cancel_appointment))
        .route("/{appointment_id}/complete", put(handlers::complete_appointment))
        .route("/{appointment_id}/changes", get(handlers::list_changes))
        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware));

    Router::new()
        .merge(protected_routes)
        .with_state(state)
}

/// The gateway authenticates with the body signature, not a user token.
pub fn payment_routes(state: Arc<AppointmentState>) -> Router {
    Router::new()
        .route("/webhook", post(handlers::payment_webhook))
        .with_state(state)
}

pub fn admin_routes(state: Arc<AppointmentState>) -> Router {
    let protected_routes = Router::new()
        .route("/reconcile-slots", post(handlers::reconcile_slots))
        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware));

    Router::new()
        .merge(protected_routes)
        .with_state(state)
}
