use async_trait::async_trait;
use uuid::Uuid;

use crate::error::SlotError;

/// Answers whether a live booking still references a slot.
///
/// Slot editing cannot see appointments directly; the appointment side supplies this.
#[async_trait]
pub trait BookingGuard: Send + Sync {
    async fn is_booked(&self, slot_id: Uuid) -> Result<bool, SlotError>;
}

/// Used when no appointment store is wired in.
pub struct NoBookings;

#[async_trait]
impl BookingGuard for NoBookings {
    async fn is_booked(&self, _slot_id: Uuid) -> Result<bool, SlotError> {
        Ok(false)
    }
}
