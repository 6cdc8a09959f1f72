use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::SlotError;
use crate::models::{NewTimeSlot, TimeSlot};
use crate::services::repository::SlotRepository;

/// Process-local slot table. Each conditional write runs under the write lock,
/// and the partial unique index on available `(doctor_id, date, start_time)` is enforced here too.
#[derive(Default)]
pub struct InMemorySlotRepository {
    slots: RwLock<HashMap<Uuid, TimeSlot>>,
}

impl InMemorySlotRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(mut slots: Vec<TimeSlot>) -> Vec<TimeSlot> {
        slots.sort_by(|a, b| (a.date, a.start_time).cmp(&(b.date, b.start_time)));
        slots
    }

    fn clashes_with_available(
        slots: &HashMap<Uuid, TimeSlot>,
        except: Option<Uuid>,
        doctor_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> bool {
        slots.values().any(|s| {
            Some(s.id) != except
                && s.is_available
                && s.doctor_id == doctor_id
                && s.date == date
                && s.start_time == start_time
        })
    }

    fn insert_locked(slots: &mut HashMap<Uuid, TimeSlot>, new: NewTimeSlot) -> Result<TimeSlot, SlotError> {
        if new.start_time >= new.end_time {
            return Err(SlotError::Validation("start time must be before end time".to_string()));
        }
        if Self::clashes_with_available(slots, None, new.doctor_id, new.date, new.start_time) {
            return Err(SlotError::Constraint(format!(
                "an available slot already starts at {} {}",
                new.date,
                new.start_time.format("%H:%M")
            )));
        }

        let slot = TimeSlot {
            id: Uuid::new_v4(),
            doctor_id: new.doctor_id,
            date: new.date,
            start_time: new.start_time,
            end_time: new.end_time,
            is_available: true,
            is_recurring: new.is_recurring,
            recurring_end_date: new.recurring_end_date,
            locked_by: None,
            locked_until: None,
            created_at: Utc::now(),
        };
        slots.insert(slot.id, slot.clone());
        Ok(slot)
    }
}

#[async_trait]
impl SlotRepository for InMemorySlotRepository {
    async fn list(&self, doctor_id: Uuid, date: Option<NaiveDate>) -> Result<Vec<TimeSlot>, SlotError> {
        let slots = self.slots.read().await;
        let matching = slots
            .values()
            .filter(|s| s.doctor_id == doctor_id && date.map_or(true, |d| s.date == d))
            .cloned()
            .collect();
        Ok(Self::sorted(matching))
    }

    async fn list_between(
        &self,
        doctor_id: Uuid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<TimeSlot>, SlotError> {
        let slots = self.slots.read().await;
        let matching = slots
            .values()
            .filter(|s| {
                s.doctor_id == doctor_id
                    && from.map_or(true, |f| s.date >= f)
                    && to.map_or(true, |t| s.date <= t)
            })
            .cloned()
            .collect();
        Ok(Self::sorted(matching))
    }

    async fn get(&self, slot_id: Uuid) -> Result<Option<TimeSlot>, SlotError> {
        Ok(self.slots.read().await.get(&slot_id).cloned())
    }

    async fn find_starting_at(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<Vec<TimeSlot>, SlotError> {
        let slots = self.slots.read().await;
        Ok(slots
            .values()
            .filter(|s| s.doctor_id == doctor_id && s.date == date && s.start_time == start_time)
            .cloned()
            .collect())
    }

    async fn insert(&self, slot: NewTimeSlot) -> Result<TimeSlot, SlotError> {
        let mut slots = self.slots.write().await;
        Self::insert_locked(&mut slots, slot)
    }

    async fn insert_many(&self, new_slots: Vec<NewTimeSlot>) -> Result<Vec<Result<TimeSlot, SlotError>>, SlotError> {
        let mut slots = self.slots.write().await;
        Ok(new_slots
            .into_iter()
            .map(|new| Self::insert_locked(&mut slots, new))
            .collect())
    }

    async fn set_available_if(
        &self,
        slot_id: Uuid,
        expected: Option<bool>,
        value: bool,
    ) -> Result<Option<TimeSlot>, SlotError> {
        let mut slots = self.slots.write().await;

        let (doctor_id, date, start_time, current) = match slots.get(&slot_id) {
            Some(s) => (s.doctor_id, s.date, s.start_time, s.is_available),
            None => return Ok(None),
        };
        if expected.is_some_and(|e| e != current) {
            return Ok(None);
        }
        if value && !current && Self::clashes_with_available(&slots, Some(slot_id), doctor_id, date, start_time) {
            return Err(SlotError::Constraint(format!(
                "another available slot already starts at {} {}",
                date,
                start_time.format("%H:%M")
            )));
        }

        Ok(slots.get_mut(&slot_id).map(|slot| {
            slot.is_available = value;
            slot.clone()
        }))
    }

    async fn swap_availability(&self, release_id: Uuid, lock_id: Uuid) -> Result<bool, SlotError> {
        let mut slots = self.slots.write().await;

        if !slots.get(&lock_id).is_some_and(|s| s.is_available) {
            return Ok(false);
        }
        if let Some(slot) = slots.get_mut(&lock_id) {
            slot.is_available = false;
        }
        if let Some(slot) = slots.get_mut(&release_id) {
            slot.is_available = true;
        }
        Ok(true)
    }

    async fn update_window_if_available(
        &self,
        slot_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Result<Option<TimeSlot>, SlotError> {
        let mut slots = self.slots.write().await;

        let doctor_id = match slots.get(&slot_id) {
            Some(s) if s.is_available => s.doctor_id,
            _ => return Ok(None),
        };
        if Self::clashes_with_available(&slots, Some(slot_id), doctor_id, date, start_time) {
            return Err(SlotError::Constraint(format!(
                "an available slot already starts at {} {}",
                date,
                start_time.format("%H:%M")
            )));
        }

        Ok(slots.get_mut(&slot_id).map(|slot| {
            slot.date = date;
            slot.start_time = start_time;
            slot.end_time = end_time;
            slot.clone()
        }))
    }

    async fn delete(&self, slot_id: Uuid, only_if_available: bool) -> Result<bool, SlotError> {
        let mut slots = self.slots.write().await;
        match slots.get(&slot_id) {
            Some(slot) if only_if_available && !slot.is_available => Ok(false),
            Some(_) => Ok(slots.remove(&slot_id).is_some()),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn new_slot(doctor_id: Uuid, start: &str, end: &str) -> NewTimeSlot {
        NewTimeSlot {
            doctor_id,
            date: "2025-03-10".parse().unwrap(),
            start_time: NaiveTime::parse_from_str(start, "%H:%M").unwrap(),
            end_time: NaiveTime::parse_from_str(end, "%H:%M").unwrap(),
            is_recurring: false,
            recurring_end_date: None,
        }
    }

    #[tokio::test]
    async fn duplicate_available_start_is_a_constraint_violation() {
        let repo = InMemorySlotRepository::new();
        let doctor = Uuid::new_v4();

        let first = repo.insert(new_slot(doctor, "09:00", "09:30")).await.unwrap();
        assert_matches!(repo.insert(new_slot(doctor, "09:00", "09:30")).await, Err(SlotError::Constraint(_)));

        // Once the first one is booked the start time is free again
        repo.set_available_if(first.id, Some(true), false).await.unwrap().unwrap();
        let second = repo.insert(new_slot(doctor, "09:00", "09:30")).await.unwrap();

        // Releasing the booked duplicate would now violate the index
        assert_matches!(repo.set_available_if(first.id, None, true).await, Err(SlotError::Constraint(_)));
        assert!(repo.get(second.id).await.unwrap().unwrap().is_available);
    }

    #[tokio::test]
    async fn conditional_write_reports_lost_race() {
        let repo = InMemorySlotRepository::new();
        let slot = repo.insert(new_slot(Uuid::new_v4(), "10:00", "10:30")).await.unwrap();

        assert!(repo.set_available_if(slot.id, Some(true), false).await.unwrap().is_some());
        assert!(repo.set_available_if(slot.id, Some(true), false).await.unwrap().is_none());
        assert!(repo.set_available_if(Uuid::new_v4(), None, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn guarded_delete_keeps_booked_rows() {
        let repo = InMemorySlotRepository::new();
        let slot = repo.insert(new_slot(Uuid::new_v4(), "11:00", "11:30")).await.unwrap();
        repo.set_available_if(slot.id, Some(true), false).await.unwrap();

        assert!(!repo.delete(slot.id, true).await.unwrap());
        assert!(repo.get(slot.id).await.unwrap().is_some());
        assert!(repo.delete(slot.id, false).await.unwrap());
        assert!(!repo.delete(slot.id, false).await.unwrap());
    }
}
