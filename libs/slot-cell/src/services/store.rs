use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::SlotError;
use crate::models::{NewTimeSlot, TimeSlot};
use crate::services::repository::SlotRepository;

/// Source of truth for whether a slot is bookable.
#[derive(Clone)]
pub struct SlotStore {
    repo: Arc<dyn SlotRepository>,
}

impl SlotStore {
    pub fn new(repo: Arc<dyn SlotRepository>) -> Self {
        Self { repo }
    }

    pub async fn list_slots(&self, doctor_id: Uuid, date: Option<NaiveDate>) -> Result<Vec<TimeSlot>, SlotError> {
        self.repo.list(doctor_id, date).await
    }

    pub async fn list_between(
        &self,
        doctor_id: Uuid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<TimeSlot>, SlotError> {
        self.repo.list_between(doctor_id, from, to).await
    }

    pub async fn get_slot(&self, slot_id: Uuid) -> Result<TimeSlot, SlotError> {
        self.repo
            .get(slot_id)
            .await?
            .ok_or_else(|| SlotError::slot_not_found(slot_id))
    }

    /// Matches a slot by its doctor-local start. An available match is preferred over a booked one.
    pub async fn find_slot_at(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<Option<TimeSlot>, SlotError> {
        let mut matches = self.repo.find_starting_at(doctor_id, date, start_time).await?;
        matches.sort_by_key(|slot| !slot.is_available);
        Ok(matches.into_iter().next())
    }

    /// Does not check overlap; adjacent windows are legitimate and overlap is the editor's call.
    pub async fn create_slot(&self, slot: NewTimeSlot) -> Result<TimeSlot, SlotError> {
        validate_window(slot.start_time, slot.end_time)?;
        let created = self.repo.insert(slot).await?;
        debug!("Created slot {} for doctor {}", created.id, created.doctor_id);
        Ok(created)
    }

    /// One batched write. Invalid rows fail individually without reaching storage.
    pub async fn create_slots(&self, slots: Vec<NewTimeSlot>) -> Result<Vec<Result<TimeSlot, SlotError>>, SlotError> {
        let mut results: Vec<Option<Result<TimeSlot, SlotError>>> = Vec::with_capacity(slots.len());
        let mut valid = Vec::new();

        for slot in slots {
            match validate_window(slot.start_time, slot.end_time) {
                Ok(()) => {
                    results.push(None);
                    valid.push(slot);
                }
                Err(e) => results.push(Some(Err(e))),
            }
        }

        let mut written = self.repo.insert_many(valid).await?.into_iter();
        Ok(results
            .into_iter()
            .map(|result| match result {
                Some(rejected) => rejected,
                None => written
                    .next()
                    .unwrap_or_else(|| Err(SlotError::Storage("batch insert returned too few rows".to_string()))),
            })
            .collect())
    }

    /// `false` is a compare-and-set from available; `true` is an idempotent release.
    pub async fn set_availability(&self, slot_id: Uuid, is_available: bool) -> Result<TimeSlot, SlotError> {
        if is_available {
            self.release_slot(slot_id).await
        } else {
            self.lock_slot(slot_id).await
        }
    }

    /// Atomically flips an available slot to unavailable. Losing the race is `SlotUnavailable`.
    #[instrument(skip(self))]
    pub async fn lock_slot(&self, slot_id: Uuid) -> Result<TimeSlot, SlotError> {
        match self.repo.set_available_if(slot_id, Some(true), false).await? {
            Some(slot) => {
                debug!("Locked slot {}", slot_id);
                Ok(slot)
            }
            None => match self.repo.get(slot_id).await? {
                Some(_) => Err(SlotError::SlotUnavailable(
                    "slot no longer available".to_string(),
                )),
                None => Err(SlotError::slot_not_found(slot_id)),
            },
        }
    }

    #[instrument(skip(self))]
    pub async fn release_slot(&self, slot_id: Uuid) -> Result<TimeSlot, SlotError> {
        self.repo
            .set_available_if(slot_id, None, true)
            .await?
            .ok_or_else(|| SlotError::slot_not_found(slot_id))
    }

    /// Releases one slot and locks another so readers never see both or neither available.
    #[instrument(skip(self))]
    pub async fn swap_availability(&self, release_id: Uuid, lock_id: Uuid) -> Result<(), SlotError> {
        if self.repo.swap_availability(release_id, lock_id).await? {
            info!("Moved booking from slot {} to slot {}", release_id, lock_id);
            return Ok(());
        }

        match self.repo.get(lock_id).await? {
            Some(_) => Err(SlotError::SlotUnavailable("slot no longer available".to_string())),
            None => Err(SlotError::slot_not_found(lock_id)),
        }
    }

    /// Hard delete. Absent slots are not an error.
    pub async fn delete_slot(&self, slot_id: Uuid) -> Result<(), SlotError> {
        if !self.repo.delete(slot_id, false).await? {
            debug!("Slot {} already absent", slot_id);
        }
        Ok(())
    }

    /// Compare-and-delete: removes the slot only while it is still available.
    pub async fn delete_slot_if_available(&self, slot_id: Uuid) -> Result<bool, SlotError> {
        self.repo.delete(slot_id, true).await
    }

    pub async fn update_slot_window(
        &self,
        slot_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Result<TimeSlot, SlotError> {
        validate_window(start_time, end_time)?;

        match self.repo.update_window_if_available(slot_id, date, start_time, end_time).await? {
            Some(slot) => Ok(slot),
            None => match self.repo.get(slot_id).await? {
                Some(_) => Err(SlotError::SlotBooked(
                    "slot is booked and its time cannot change".to_string(),
                )),
                None => Err(SlotError::slot_not_found(slot_id)),
            },
        }
    }
}

pub fn validate_window(start_time: NaiveTime, end_time: NaiveTime) -> Result<(), SlotError> {
    if start_time >= end_time {
        return Err(SlotError::Validation("start time must be before end time".to_string()));
    }
    Ok(())
}
