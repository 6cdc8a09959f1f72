// libs/appointment-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use shared_models::auth::{Actor, User};
use shared_models::error::AppError;
use shared_utils::signature::verify_payload;

use crate::models::{
    AppointmentError, CancelRequest, CheckoutRequest, ConfirmPaymentRequest, CreateAppointmentRequest,
    PaymentSource, PaymentWebhook, RescheduleRequest, WebhookPaymentStatus,
};
use crate::state::AppointmentState;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

// ==============================================================================
// APPOINTMENT HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn create_appointment(
    State(state): State<Arc<AppointmentState>>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let actor = Actor::from_user(&user)?;
    let appointment = state.resolver.create_appointment(&actor, request).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment
    })))
}

#[axum::debug_handler]
pub async fn get_appointment(
    State(state): State<Arc<AppointmentState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let actor = Actor::from_user(&user)?;
    let appointment = state.resolver.get_appointment(&actor, appointment_id).await?;

    Ok(Json(json!({ "appointment": appointment })))
}

#[axum::debug_handler]
pub async fn begin_checkout(
    State(state): State<Arc<AppointmentState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<Value>, AppError> {
    let actor = Actor::from_user(&user)?;
    let appointment = state
        .resolver
        .begin_checkout(&actor, appointment_id, request.payment_reference)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment
    })))
}

#[axum::debug_handler]
pub async fn confirm_payment(
    State(state): State<Arc<AppointmentState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<ConfirmPaymentRequest>,
) -> Result<Json<Value>, AppError> {
    let actor = Actor::from_user(&user)?;
    let outcome = state
        .resolver
        .confirm_payment(PaymentSource::Client(actor), appointment_id, request.payment_reference)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": outcome.appointment,
        "already_paid": outcome.already_paid,
        "needs_reconciliation": outcome.needs_reconciliation
    })))
}

#[axum::debug_handler]
pub async fn reschedule_appointment(
    State(state): State<Arc<AppointmentState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<RescheduleRequest>,
) -> Result<Json<Value>, AppError> {
    let actor = Actor::from_user(&user)?;
    let outcome = state.resolver.reschedule(&actor, appointment_id, request).await?;

    Ok(Json(json!({
        "success": true,
        "message": "Appointment rescheduled successfully",
        "appointment": outcome.appointment,
        "is_admin_override": outcome.is_admin_override
    })))
}

#[axum::debug_handler]
pub async fn cancel_appointment(
    State(state): State<Arc<AppointmentState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<Value>, AppError> {
    let actor = Actor::from_user(&user)?;
    let outcome = state.resolver.cancel(&actor, appointment_id, request).await?;

    Ok(Json(json!({
        "success": true,
        "message": "Appointment cancelled successfully",
        "appointment": outcome.appointment,
        "refund_eligible": outcome.refund_eligible,
        "is_admin_override": outcome.is_admin_override
    })))
}

#[axum::debug_handler]
pub async fn complete_appointment(
    State(state): State<Arc<AppointmentState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let actor = Actor::from_user(&user)?;
    let appointment = state.resolver.complete_appointment(&actor, appointment_id).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment
    })))
}

#[axum::debug_handler]
pub async fn list_changes(
    State(state): State<Arc<AppointmentState>>,
    Path(appointment_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let actor = Actor::from_user(&user)?;
    let changes = state.resolver.list_changes(&actor, appointment_id).await?;

    Ok(Json(json!({
        "changes": changes,
        "total": changes.len()
    })))
}

// ==============================================================================
// PAYMENT GATEWAY WEBHOOK
// ==============================================================================

/// Signed with base64 HMAC-SHA256 of the raw body. Answers 2xx for anything the gateway
/// should not redeliver, including payments for a lost slot or a cancelled appointment.
#[axum::debug_handler]
pub async fn payment_webhook(
    State(state): State<Arc<AppointmentState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !verify_payload(&body, signature, &state.config.payment_webhook_secret) {
        warn!("Rejected payment webhook with a bad or missing signature");
        return Err(AppointmentError::InvalidSignature.into());
    }

    let event: PaymentWebhook = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Malformed webhook payload: {}", e)))?;
    info!("Payment webhook {:?} for appointment {}", event.status, event.appointment_id);

    match event.status {
        WebhookPaymentStatus::Succeeded => {
            match state
                .resolver
                .confirm_payment(PaymentSource::Webhook, event.appointment_id, event.payment_reference)
                .await
            {
                Ok(outcome) => Ok(Json(json!({
                    "success": true,
                    "already_paid": outcome.already_paid,
                    "needs_reconciliation": outcome.needs_reconciliation
                }))),
                Err(AppointmentError::SlotUnavailable(msg)) => {
                    error!("Appointment {} paid for a slot that was taken: {}", event.appointment_id, msg);
                    Ok(Json(json!({
                        "success": false,
                        "refund_required": true,
                        "error": msg
                    })))
                }
                Err(err @ AppointmentError::PaidAfterCancellation) => Ok(Json(json!({
                    "success": false,
                    "refund_required": true,
                    "error": err.to_string()
                }))),
                Err(e) => Err(e.into()),
            }
        }
        WebhookPaymentStatus::Failed => {
            let appointment = state
                .resolver
                .mark_payment_failed(event.appointment_id, event.payment_reference)
                .await?;
            Ok(Json(json!({
                "success": true,
                "status": appointment.status
            })))
        }
    }
}

// ==============================================================================
// ADMIN HANDLERS
// ==============================================================================

#[axum::debug_handler]
pub async fn reconcile_slots(
    State(state): State<Arc<AppointmentState>>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let actor = Actor::from_user(&user)?;
    let report = state.resolver.reconcile_slots(&actor).await?;

    Ok(Json(json!({
        "success": true,
        "examined": report.examined,
        "locked": report.locked,
        "already_locked": report.already_locked,
        "missing_slots": report.missing_slots
    })))
}
