use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use slot_cell::services::BookingGuard;
use slot_cell::SlotError;

use crate::services::repository::AppointmentRepository;

/// Tells the availability editor whether a paid appointment still references a slot.
pub struct AppointmentBookings {
    repo: Arc<dyn AppointmentRepository>,
}

impl AppointmentBookings {
    pub fn new(repo: Arc<dyn AppointmentRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl BookingGuard for AppointmentBookings {
    async fn is_booked(&self, slot_id: Uuid) -> Result<bool, SlotError> {
        let appointments = self
            .repo
            .find_by_slot(slot_id)
            .await
            .map_err(|e| SlotError::Storage(e.to_string()))?;
        Ok(appointments.iter().any(|a| a.status.holds_slot()))
    }
}
