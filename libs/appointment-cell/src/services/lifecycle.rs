// libs/appointment-cell/src/services/lifecycle.rs
use tracing::{debug, info, warn};

use crate::models::{AppointmentError, AppointmentStatus};

/// Guards the appointment state machine:
/// `pending -> pending_payment -> {paid | payment_failed}`, `paid -> {completed | cancelled}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppointmentLifecycleService;

impl AppointmentLifecycleService {
    pub fn new() -> Self {
        Self
    }

    /// Validate that a status transition is allowed
    pub fn validate_status_transition(
        &self,
        current_status: &AppointmentStatus,
        new_status: &AppointmentStatus,
    ) -> Result<(), AppointmentError> {
        debug!("Validating status transition from {:?} to {:?}", current_status, new_status);

        let valid_transitions = self.get_valid_transitions(current_status);

        if !valid_transitions.contains(new_status) {
            warn!("Invalid status transition attempted: {:?} -> {:?}", current_status, new_status);
            return Err(AppointmentError::InvalidStatusTransition(*current_status));
        }

        info!("Status transition validated: {:?} -> {:?}", current_status, new_status);
        Ok(())
    }

    /// Get all valid next statuses for a given current status
    pub fn get_valid_transitions(&self, current_status: &AppointmentStatus) -> Vec<AppointmentStatus> {
        match current_status {
            // A client confirmation can arrive before the checkout session is recorded
            AppointmentStatus::Pending => vec![
                AppointmentStatus::PendingPayment,
                AppointmentStatus::Paid,
                AppointmentStatus::Cancelled,
            ],
            AppointmentStatus::PendingPayment => vec![
                AppointmentStatus::Paid,
                AppointmentStatus::PaymentFailed,
                AppointmentStatus::Cancelled,
            ],
            // Retrying checkout after a declined card
            AppointmentStatus::PaymentFailed => vec![
                AppointmentStatus::PendingPayment,
                AppointmentStatus::Paid,
                AppointmentStatus::Cancelled,
            ],
            AppointmentStatus::Paid => vec![
                AppointmentStatus::Completed,
                AppointmentStatus::Cancelled,
            ],
            // Terminal states - no transitions allowed
            AppointmentStatus::Completed => vec![],
            AppointmentStatus::Cancelled => vec![],
        }
    }

    /// Rescheduling swaps the slot without changing status.
    pub fn validate_reschedule(&self, current_status: &AppointmentStatus) -> Result<(), AppointmentError> {
        match current_status {
            AppointmentStatus::Cancelled => Err(AppointmentError::AlreadyCancelled),
            AppointmentStatus::Pending | AppointmentStatus::PendingPayment | AppointmentStatus::Paid => Ok(()),
            other => {
                warn!("Reschedule attempted on {} appointment", other);
                Err(AppointmentError::InvalidStatusTransition(*other))
            }
        }
    }

    pub fn is_terminal(&self, status: &AppointmentStatus) -> bool {
        self.get_valid_transitions(status).is_empty()
    }
}
