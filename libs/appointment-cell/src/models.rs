// libs/appointment-cell/src/models.rs
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use shared_models::auth::{Actor, ActorRole};
use shared_models::error::AppError;
use slot_cell::SlotError;

// ==============================================================================
// CORE APPOINTMENT MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub slot_id: Option<Uuid>,
    pub appointment_date: DateTime<Utc>,
    pub status: AppointmentStatus,
    #[serde(default)]
    pub reschedule_count: i32,
    pub price: f64,
    pub payment_reference: Option<String>,
    pub cancel_reason: Option<String>,
    pub cancelled_by: Option<CancelledBy>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    /// Patient, the appointment's doctor, or an admin.
    pub fn is_participant(&self, actor: &Actor) -> bool {
        actor.is_admin() || actor.user_id == self.patient_id || actor.user_id == self.doctor_id
    }

    pub fn minutes_until(&self, now: DateTime<Utc>) -> i64 {
        (self.appointment_date - now).num_minutes()
    }

    pub fn version(&self) -> AppointmentVersion {
        AppointmentVersion {
            status: self.status,
            reschedule_count: self.reschedule_count,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    PendingPayment,
    Paid,
    Completed,
    Cancelled,
    PaymentFailed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::PendingPayment => "pending_payment",
            AppointmentStatus::Paid => "paid",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::PaymentFailed => "payment_failed",
        }
    }

    /// Statuses whose slot must stay unavailable.
    pub fn holds_slot(&self) -> bool {
        matches!(self, AppointmentStatus::Paid | AppointmentStatus::Completed)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelledBy {
    Patient,
    Doctor,
    Admin,
}

impl CancelledBy {
    /// The patient wins when one user is both, then the doctor.
    pub fn for_actor(actor: &Actor, appointment: &Appointment) -> Self {
        if actor.user_id == appointment.patient_id {
            CancelledBy::Patient
        } else if actor.user_id == appointment.doctor_id {
            CancelledBy::Doctor
        } else {
            CancelledBy::Admin
        }
    }
}

/// Fields an optimistic appointment write is conditioned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppointmentVersion {
    pub status: AppointmentStatus,
    pub reschedule_count: i32,
}

#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub slot_id: Option<Uuid>,
    pub appointment_date: DateTime<Utc>,
    pub price: f64,
}

/// Partial update. Unset fields are left alone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AppointmentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AppointmentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appointment_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reschedule_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_reference: Option<String>,
    /// `Some(None)` clears the column.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_by: Option<Option<CancelledBy>>,
}

impl AppointmentPatch {
    pub fn status(status: AppointmentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Puts a cancelled appointment back to `status` and wipes the cancellation details.
    pub fn uncancel(status: AppointmentStatus) -> Self {
        Self {
            status: Some(status),
            cancel_reason: Some(None),
            cancelled_by: Some(None),
            ..Self::default()
        }
    }

    pub fn apply(&self, appointment: &mut Appointment) {
        if let Some(status) = self.status {
            appointment.status = status;
        }
        if let Some(slot_id) = self.slot_id {
            appointment.slot_id = Some(slot_id);
        }
        if let Some(date) = self.appointment_date {
            appointment.appointment_date = date;
        }
        if let Some(count) = self.reschedule_count {
            appointment.reschedule_count = count;
        }
        if let Some(reference) = &self.payment_reference {
            appointment.payment_reference = Some(reference.clone());
        }
        if let Some(reason) = &self.cancel_reason {
            appointment.cancel_reason = reason.clone();
        }
        if let Some(by) = self.cancelled_by {
            appointment.cancelled_by = by;
        }
    }
}

// ==============================================================================
// CHANGE LOG
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Reschedule,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppointmentChange {
    pub id: Uuid,
    pub appointment_id: Uuid,
    pub action: ChangeAction,
    pub actor_id: Uuid,
    pub actor_role: ActorRole,
    pub reason: Option<String>,
    pub before: Value,
    pub after: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewAppointmentChange {
    pub appointment_id: Uuid,
    pub action: ChangeAction,
    pub actor_id: Uuid,
    pub actor_role: ActorRole,
    pub reason: Option<String>,
    pub before: Value,
    pub after: Value,
}

// ==============================================================================
// REQUEST MODELS
// ==============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAppointmentRequest {
    pub doctor_id: Uuid,
    pub slot_id: Uuid,
    /// Checkout session that holds the slot, if any.
    pub session_id: Option<String>,
    pub price: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub payment_reference: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfirmPaymentRequest {
    pub payment_reference: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RescheduleRequest {
    pub new_slot_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WebhookPaymentStatus {
    Succeeded,
    Failed,
}

/// Body of `POST /payments/webhook`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentWebhook {
    pub appointment_id: Uuid,
    pub payment_reference: Option<String>,
    pub status: WebhookPaymentStatus,
}

/// Who is confirming a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentSource {
    Client(Actor),
    Webhook,
}

// ==============================================================================
// OUTCOMES
// ==============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PaymentOutcome {
    pub appointment: Appointment,
    /// The appointment was already paid; nothing changed.
    pub already_paid: bool,
    /// Paid without a slot to lock; left for reconciliation.
    pub needs_reconciliation: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RescheduleOutcome {
    pub appointment: Appointment,
    pub is_admin_override: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub appointment: Appointment,
    pub refund_eligible: bool,
    pub is_admin_override: bool,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ReconciliationReport {
    pub examined: usize,
    pub locked: usize,
    pub already_locked: usize,
    pub missing_slots: Vec<Uuid>,
}

// ==============================================================================
// POLICY
// ==============================================================================

#[derive(Debug, Clone)]
pub struct BookingPolicy {
    /// Non-admins cannot reschedule or cancel closer than this to the start.
    pub change_window: Duration,
    pub reschedule_limit: i32,
    pub max_retry_attempts: u32,
    pub retry_backoff: std::time::Duration,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            change_window: Duration::minutes(60),
            reschedule_limit: 2,
            max_retry_attempts: 3,
            retry_backoff: std::time::Duration::from_millis(100),
        }
    }
}

impl BookingPolicy {
    pub fn within_change_window(&self, appointment: &Appointment, now: DateTime<Utc>) -> bool {
        appointment.appointment_date - now < self.change_window
    }

    /// Only a paid appointment cancelled outside the change window is refunded.
    pub fn refund_eligible(&self, appointment: &Appointment, now: DateTime<Utc>) -> bool {
        appointment.status == AppointmentStatus::Paid && !self.within_change_window(appointment, now)
    }
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AppointmentError {
    #[error("Appointment not found")]
    NotFound,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Appointment is already cancelled")]
    AlreadyCancelled,

    #[error("Changes are only allowed at least 1 hour before your consultation")]
    ChangeWindowClosed,

    #[error("You've reached the reschedule limit for this appointment")]
    RescheduleLimitReached,

    #[error("Appointment cannot be modified in current status: {0}")]
    InvalidStatusTransition(AppointmentStatus),

    #[error("Slot unavailable: {0}")]
    SlotUnavailable(String),

    #[error("Appointment was cancelled before payment arrived, payment will be refunded")]
    PaidAfterCancellation,

    #[error("Appointment was modified concurrently, please retry")]
    ConcurrentModification,

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Database error: {0}")]
    Database(String),

    #[error(transparent)]
    Slot(SlotError),
}

impl From<SlotError> for AppointmentError {
    fn from(err: SlotError) -> Self {
        match err {
            SlotError::SlotUnavailable(msg) => AppointmentError::SlotUnavailable(msg),
            other => AppointmentError::Slot(other),
        }
    }
}

impl From<anyhow::Error> for AppointmentError {
    fn from(err: anyhow::Error) -> Self {
        AppointmentError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for AppointmentError {
    fn from(err: serde_json::Error) -> Self {
        AppointmentError::Database(format!("malformed record: {}", err))
    }
}

impl From<AppointmentError> for AppError {
    fn from(err: AppointmentError) -> Self {
        match err {
            AppointmentError::NotFound => AppError::NotFound("Appointment not found".to_string()),
            AppointmentError::Forbidden(msg) => AppError::Forbidden(msg),
            AppointmentError::Validation(msg) => AppError::ValidationError(msg),
            AppointmentError::AlreadyCancelled
            | AppointmentError::ChangeWindowClosed
            | AppointmentError::RescheduleLimitReached => AppError::BadRequest(err.to_string()),
            AppointmentError::InvalidStatusTransition(status) => {
                AppError::BadRequest(format!("Cannot transition from current status: {}", status))
            }
            AppointmentError::SlotUnavailable(msg) => AppError::SlotUnavailable(msg),
            AppointmentError::ConcurrentModification | AppointmentError::PaidAfterCancellation => {
                AppError::Conflict(err.to_string())
            }
            AppointmentError::InvalidSignature => AppError::Auth(err.to_string()),
            AppointmentError::Database(msg) => {
                warn!("Appointment storage failure: {}", msg);
                AppError::Database(msg)
            }
            AppointmentError::Slot(slot_err) => AppError::from(slot_err),
        }
    }
}
