use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use shared_models::auth::{Actor, User};
use shared_models::error::AppError;

use crate::models::{
    BatchCreateRequest, BatchOutcome, CreateSlotRequest, DeleteRangeRequest, HeldQuery, HoldRequest,
    RecurringSlotRequest, ReleaseRequest, SetAvailabilityRequest, SlotQuery, TransferHoldRequest,
    UpdateSlotRequest,
};
use crate::services::AvailabilityEditor;
use crate::state::SlotState;

fn batch_response(outcome: BatchOutcome) -> Json<Value> {
    Json(json!({
        "success": true,
        "created_count": outcome.created_count(),
        "skipped_count": outcome.skipped_count(),
        "failed_count": outcome.failed_count(),
        "created": outcome.created,
        "skipped": outcome.skipped,
        "failed": outcome.failed,
    }))
}

// ==============================================================================
// PUBLIC HANDLERS (NO AUTHENTICATION REQUIRED)
// ==============================================================================

#[axum::debug_handler]
pub async fn list_slots(
    State(state): State<Arc<SlotState>>,
    Query(query): Query<SlotQuery>,
) -> Result<Json<Value>, AppError> {
    let slots = state.store.list_slots(query.doctor_id, query.date).await?;

    Ok(Json(json!({
        "slots": slots,
        "total": slots.len()
    })))
}

#[axum::debug_handler]
pub async fn hold_slot(
    State(state): State<Arc<SlotState>>,
    Json(request): Json<HoldRequest>,
) -> Result<Json<Value>, AppError> {
    // Anonymous checkouts get a session minted here and echo it back on later calls
    let session_id = request
        .session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let hold = state
        .holds
        .hold(request.slot_id, &session_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "session_id": hold.session_id,
        "expires_at": hold.expires_at,
        "hold": hold
    })))
}

#[axum::debug_handler]
pub async fn release_slot(
    State(state): State<Arc<SlotState>>,
    Json(request): Json<ReleaseRequest>,
) -> Result<Json<Value>, AppError> {
    state.holds.release(request.slot_id).await?;

    Ok(Json(json!({ "success": true })))
}

#[axum::debug_handler]
pub async fn get_held_slot(
    State(state): State<Arc<SlotState>>,
    Query(query): Query<HeldQuery>,
) -> Result<Json<Value>, AppError> {
    let hold = state.holds.get_held(&query.session_id).await?;

    Ok(Json(json!({ "hold": hold })))
}

// ==============================================================================
// PROTECTED HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn create_slot(
    State(state): State<Arc<SlotState>>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateSlotRequest>,
) -> Result<Json<Value>, AppError> {
    let actor = Actor::from_user(&user)?;
    let slot = AvailabilityEditor::new(&state).create_slot(&actor, request).await?;

    Ok(Json(json!({
        "success": true,
        "slot": slot
    })))
}

#[axum::debug_handler]
pub async fn create_batch(
    State(state): State<Arc<SlotState>>,
    Extension(user): Extension<User>,
    Json(request): Json<BatchCreateRequest>,
) -> Result<Json<Value>, AppError> {
    let actor = Actor::from_user(&user)?;
    let doctor_id = AvailabilityEditor::target_doctor(&actor, request.doctor_id)?;

    let outcome = AvailabilityEditor::new(&state)
        .create_batch(&actor, doctor_id, &request.ranges)
        .await?;

    Ok(batch_response(outcome))
}

#[axum::debug_handler]
pub async fn create_recurring(
    State(state): State<Arc<SlotState>>,
    Extension(user): Extension<User>,
    Json(request): Json<RecurringSlotRequest>,
) -> Result<Json<Value>, AppError> {
    let actor = Actor::from_user(&user)?;
    let outcome = AvailabilityEditor::new(&state).create_recurring(&actor, request).await?;

    Ok(batch_response(outcome))
}

#[axum::debug_handler]
pub async fn delete_range(
    State(state): State<Arc<SlotState>>,
    Extension(user): Extension<User>,
    Json(request): Json<DeleteRangeRequest>,
) -> Result<Json<Value>, AppError> {
    let actor = Actor::from_user(&user)?;
    let deletion = AvailabilityEditor::new(&state).delete_range(&actor, request).await?;

    Ok(Json(json!({
        "success": true,
        "deleted": deletion.deleted,
        "skipped_booked": deletion.skipped_booked,
        "dates": deletion.dates
    })))
}

#[axum::debug_handler]
pub async fn update_slot(
    State(state): State<Arc<SlotState>>,
    Path(slot_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<UpdateSlotRequest>,
) -> Result<Json<Value>, AppError> {
    let actor = Actor::from_user(&user)?;
    let slot = AvailabilityEditor::new(&state).update_slot(&actor, slot_id, request).await?;

    Ok(Json(json!({
        "success": true,
        "slot": slot
    })))
}

#[axum::debug_handler]
pub async fn set_slot_availability(
    State(state): State<Arc<SlotState>>,
    Path(slot_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<SetAvailabilityRequest>,
) -> Result<Json<Value>, AppError> {
    let actor = Actor::from_user(&user)?;
    let slot = AvailabilityEditor::new(&state)
        .set_slot_availability(&actor, slot_id, request.is_available)
        .await?;

    Ok(Json(json!({
        "success": true,
        "slot": slot
    })))
}

#[axum::debug_handler]
pub async fn delete_slot(
    State(state): State<Arc<SlotState>>,
    Path(slot_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let actor = Actor::from_user(&user)?;
    AvailabilityEditor::new(&state).delete_slot(&actor, slot_id).await?;

    Ok(Json(json!({ "success": true })))
}

#[axum::debug_handler]
pub async fn transfer_hold(
    State(state): State<Arc<SlotState>>,
    Extension(user): Extension<User>,
    Json(request): Json<TransferHoldRequest>,
) -> Result<Json<Value>, AppError> {
    let hold = state
        .holds
        .transfer_session(&request.from_session_id, &request.to_session_id)
        .await?;
    if hold.is_some() {
        info!("User {} took over checkout session", user.id);
    }

    Ok(Json(json!({
        "success": true,
        "hold": hold
    })))
}

#[axum::debug_handler]
pub async fn cleanup_expired_holds(
    State(state): State<Arc<SlotState>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let actor = Actor::from_user(&user)?;
    if !actor.is_admin() {
        return Err(AppError::Forbidden("Admin access required".to_string()));
    }

    let cleared = state.holds.sweep_expired().await?;

    Ok(Json(json!({
        "success": true,
        "cleared": cleared
    })))
}
