use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};

use shared_utils::extractor::auth_middleware;

use crate::handlers;
use crate::state::SlotState;

pub fn slot_routes(state: Arc<SlotState>) -> Router {
    // Checkout starts before sign-in, so reading and holding are public
    let public_routes = Router::new()
        .route("/", get(handlers::list_slots))
        .route("/hold", post(handlers::hold_slot))
        .route("/release", post(handlers::release_slot))
        .route("/held", get(handlers::get_held_slot));

    let protected_routes = Router::new()
        .route("/", post(handlers::create_slot))
        .route("/batch", post(handlers::create_batch))
        .route("/recurring", post(handlers::create_recurring))
        .route("/range", axum::routing::delete(handlers::delete_range))
        .route(
            "/{slot_id}",
            put(handlers::update_slot)
                .patch(handlers::set_slot_availability)
                .delete(handlers::delete_slot),
        )
        .route("/hold/transfer", post(handlers::transfer_hold))
        .route("/cleanup", post(handlers::cleanup_expired_holds))
        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
