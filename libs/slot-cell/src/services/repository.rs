use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use uuid::Uuid;

use crate::error::SlotError;
use crate::models::{NewTimeSlot, TimeSlot};

/// Persistence for time slots. Every availability write is a single conditional update.
#[async_trait]
pub trait SlotRepository: Send + Sync {
    /// Ordered by date then start time.
    async fn list(&self, doctor_id: Uuid, date: Option<NaiveDate>) -> Result<Vec<TimeSlot>, SlotError>;

    /// Slots dated `from` onwards, up to `to` inclusive when given.
    async fn list_between(
        &self,
        doctor_id: Uuid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<TimeSlot>, SlotError>;

    async fn get(&self, slot_id: Uuid) -> Result<Option<TimeSlot>, SlotError>;

    async fn find_starting_at(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<Vec<TimeSlot>, SlotError>;

    async fn insert(&self, slot: NewTimeSlot) -> Result<TimeSlot, SlotError>;

    /// One result per input row, in order. The outer error is reserved for transport failures.
    async fn insert_many(&self, slots: Vec<NewTimeSlot>) -> Result<Vec<Result<TimeSlot, SlotError>>, SlotError>;

    /// Sets `is_available` when the current value equals `expected` (any value when `None`).
    /// Returns `None` when no row matched.
    async fn set_available_if(
        &self,
        slot_id: Uuid,
        expected: Option<bool>,
        value: bool,
    ) -> Result<Option<TimeSlot>, SlotError>;

    /// Releases `release_id` and locks `lock_id` in one step. `false` when `lock_id` was not available;
    /// nothing is written in that case.
    async fn swap_availability(&self, release_id: Uuid, lock_id: Uuid) -> Result<bool, SlotError>;

    /// Moves an available slot. `None` when the slot is absent or no longer available.
    async fn update_window_if_available(
        &self,
        slot_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Result<Option<TimeSlot>, SlotError>;

    /// `true` when a row was removed.
    async fn delete(&self, slot_id: Uuid, only_if_available: bool) -> Result<bool, SlotError>;
}
