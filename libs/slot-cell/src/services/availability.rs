use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, NaiveDate};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_models::auth::Actor;
use shared_utils::clock::Clock;

use crate::error::SlotError;
use crate::models::{
    day_of_week, BatchOutcome, ClinicZone, CreateSlotRequest, DeleteRangeRequest, DeleteScope, NewTimeSlot,
    RangeDeletion, RecurringSlotRequest, SlotAttempt, SlotPolicy, SlotWindow, TimeRange, TimeSlot,
    UpdateSlotRequest,
};
use crate::services::booking_guard::BookingGuard;
use crate::services::hold::HoldManager;
use crate::services::store::{validate_window, SlotStore};
use crate::state::SlotState;

/// Splits an absolute range into consecutive fixed-size doctor-local windows.
///
/// A trailing remainder shorter than `minutes` is dropped, as is any window that
/// would cross local midnight.
pub fn decompose_range(range: &TimeRange, zone: &ClinicZone, minutes: i64) -> Vec<SlotWindow> {
    let step = Duration::minutes(minutes);
    let mut windows = Vec::new();
    if minutes <= 0 {
        return windows;
    }

    let mut cursor = range.start_time;
    while cursor + step <= range.end_time {
        let start = zone.to_local(cursor);
        let end = zone.to_local(cursor + step);
        if start.date() == end.date() {
            windows.push(SlotWindow {
                date: start.date(),
                start_time: start.time(),
                end_time: end.time(),
            });
        }
        cursor += step;
    }
    windows
}

/// Doctor-facing edits to future availability.
pub struct AvailabilityEditor {
    store: SlotStore,
    holds: HoldManager,
    bookings: Arc<dyn BookingGuard>,
    clock: Arc<dyn Clock>,
    zone: ClinicZone,
    policy: SlotPolicy,
}

impl AvailabilityEditor {
    pub fn new(state: &SlotState) -> Self {
        Self {
            store: state.store.clone(),
            holds: state.holds.clone(),
            bookings: state.bookings.clone(),
            clock: state.clock.clone(),
            zone: state.zone,
            policy: state.policy,
        }
    }

    fn authorize(actor: &Actor, doctor_id: Uuid) -> Result<(), SlotError> {
        if actor.can_manage_doctor(doctor_id) {
            Ok(())
        } else {
            Err(SlotError::Forbidden("cannot edit another doctor's availability".to_string()))
        }
    }

    /// The acting doctor unless an admin names one.
    pub fn target_doctor(actor: &Actor, requested: Option<Uuid>) -> Result<Uuid, SlotError> {
        let doctor_id = requested.unwrap_or(actor.user_id);
        Self::authorize(actor, doctor_id)?;
        Ok(doctor_id)
    }

    async fn owned_slot(&self, actor: &Actor, slot_id: Uuid) -> Result<TimeSlot, SlotError> {
        let slot = self.store.get_slot(slot_id).await?;
        Self::authorize(actor, slot.doctor_id)?;
        Ok(slot)
    }

    pub async fn create_slot(&self, actor: &Actor, request: CreateSlotRequest) -> Result<TimeSlot, SlotError> {
        let doctor_id = Self::target_doctor(actor, request.doctor_id)?;
        validate_window(request.start_time, request.end_time)?;

        let window = SlotWindow {
            date: request.date,
            start_time: request.start_time,
            end_time: request.end_time,
        };
        let existing = self.store.list_slots(doctor_id, Some(request.date)).await?;
        if existing.iter().any(|slot| slot.window().overlaps(&window)) {
            return Err(SlotError::Constraint("overlaps an existing slot".to_string()));
        }

        let is_recurring = request.is_recurring.unwrap_or(false);
        self.store
            .create_slot(NewTimeSlot {
                doctor_id,
                date: request.date,
                start_time: request.start_time,
                end_time: request.end_time,
                is_recurring,
                recurring_end_date: request.recurring_end_date.filter(|_| is_recurring),
            })
            .await
    }

    /// Creates every sub-slot of every range in one batch. Overlaps with existing slots are
    /// skipped and insert failures reported; neither aborts the rest.
    pub async fn create_batch(&self, actor: &Actor, doctor_id: Uuid, ranges: &[TimeRange]) -> Result<BatchOutcome, SlotError> {
        Self::authorize(actor, doctor_id)?;
        if ranges.is_empty() {
            return Err(SlotError::Validation("at least one range is required".to_string()));
        }
        if let Some(bad) = ranges.iter().find(|range| range.start_time >= range.end_time) {
            return Err(SlotError::Validation(format!(
                "range starting {} does not end after it starts",
                bad.start_time
            )));
        }

        let mut windows = BTreeSet::new();
        for range in ranges {
            windows.extend(decompose_range(range, &self.zone, self.policy.sub_slot_minutes));
        }

        let candidates = windows
            .into_iter()
            .map(|window| NewTimeSlot::single(doctor_id, window))
            .collect();
        let outcome = self.create_without_overlap(doctor_id, candidates).await?;

        info!(
            "Batch for doctor {}: {} created, {} skipped, {} failed",
            doctor_id,
            outcome.created_count(),
            outcome.skipped_count(),
            outcome.failed_count()
        );
        Ok(outcome)
    }

    /// One slot per matching weekday from `from_date` (default today) through `until_date`.
    pub async fn create_recurring(&self, actor: &Actor, request: RecurringSlotRequest) -> Result<BatchOutcome, SlotError> {
        let doctor_id = Self::target_doctor(actor, request.doctor_id)?;
        validate_window(request.start_time, request.end_time)?;
        if request.day_of_week > 6 {
            return Err(SlotError::Validation(
                "day of week must be between 0 (Sunday) and 6 (Saturday)".to_string(),
            ));
        }

        let from = request
            .from_date
            .unwrap_or_else(|| self.zone.today(self.clock.now()));
        if request.until_date < from {
            return Err(SlotError::Validation("until date is before the first occurrence".to_string()));
        }
        if request.until_date > from + Duration::days(self.policy.recurring_horizon_days) {
            return Err(SlotError::Validation(format!(
                "recurring series may extend at most {} days",
                self.policy.recurring_horizon_days
            )));
        }

        let candidates = occurrences(from, request.until_date, request.day_of_week)
            .into_iter()
            .map(|date| NewTimeSlot {
                doctor_id,
                date,
                start_time: request.start_time,
                end_time: request.end_time,
                is_recurring: true,
                recurring_end_date: Some(request.until_date),
            })
            .collect();
        let outcome = self.create_without_overlap(doctor_id, candidates).await?;

        info!(
            "Recurring series for doctor {} on weekday {}: {} created, {} skipped, {} failed",
            doctor_id,
            request.day_of_week,
            outcome.created_count(),
            outcome.skipped_count(),
            outcome.failed_count()
        );
        Ok(outcome)
    }

    async fn create_without_overlap(&self, doctor_id: Uuid, candidates: Vec<NewTimeSlot>) -> Result<BatchOutcome, SlotError> {
        let mut outcome = BatchOutcome::default();
        let (Some(first), Some(last)) = (
            candidates.iter().map(|c| c.date).min(),
            candidates.iter().map(|c| c.date).max(),
        ) else {
            return Ok(outcome);
        };

        let existing: Vec<SlotWindow> = self
            .store
            .list_between(doctor_id, Some(first), Some(last))
            .await?
            .iter()
            .map(TimeSlot::window)
            .collect();

        let mut to_create = Vec::new();
        let mut windows: Vec<SlotWindow> = Vec::new();
        for candidate in candidates {
            let window = candidate.window();
            if existing.iter().any(|taken| taken.overlaps(&window)) {
                outcome.skipped.push(SlotAttempt {
                    window,
                    reason: "overlaps an existing slot".to_string(),
                });
            } else if windows.iter().any(|accepted| accepted.overlaps(&window)) {
                outcome.skipped.push(SlotAttempt {
                    window,
                    reason: "overlaps another slot in this request".to_string(),
                });
            } else {
                windows.push(window);
                to_create.push(candidate);
            }
        }

        let results = self.store.create_slots(to_create).await?;
        for (window, result) in windows.into_iter().zip(results) {
            match result {
                Ok(slot) => outcome.created.push(slot),
                Err(e) => {
                    warn!("Skipping sub-slot {} {}: {}", window.date, window.start_time, e);
                    outcome.failed.push(SlotAttempt { window, reason: e.to_string() });
                }
            }
        }
        Ok(outcome)
    }

    /// Deletes the slots starting inside `[start, end)` on the dates the scope selects.
    /// Booked slots are never touched; missing ones are skipped.
    pub async fn delete_range(&self, actor: &Actor, request: DeleteRangeRequest) -> Result<RangeDeletion, SlotError> {
        let doctor_id = Self::target_doctor(actor, request.doctor_id)?;
        validate_window(request.start_time, request.end_time)?;

        let weekday = day_of_week(request.date);
        let candidates: Vec<TimeSlot> = match request.scope {
            DeleteScope::Single => self.store.list_slots(doctor_id, Some(request.date)).await?,
            DeleteScope::Forward => self.store.list_between(doctor_id, Some(request.date), None).await?,
            DeleteScope::All => self.store.list_between(doctor_id, None, None).await?,
        }
        .into_iter()
        .filter(|slot| day_of_week(slot.date) == weekday)
        .filter(|slot| slot.start_time >= request.start_time && slot.start_time < request.end_time)
        .collect();

        let mut deletion = RangeDeletion::default();
        for slot in candidates {
            match self.remove_unless_booked(&slot).await {
                Ok(true) => {
                    deletion.deleted += 1;
                    if !deletion.dates.contains(&slot.date) {
                        deletion.dates.push(slot.date);
                    }
                }
                Ok(false) => deletion.skipped_booked += 1,
                Err(e) if e.is_not_found() => debug!("Slot {} vanished during range delete", slot.id),
                Err(e) => return Err(e),
            }
        }
        deletion.dates.sort();

        info!(
            "Range delete for doctor {} ({:?} from {}): {} deleted, {} booked kept",
            doctor_id, request.scope, request.date, deletion.deleted, deletion.skipped_booked
        );
        Ok(deletion)
    }

    pub async fn delete_slot(&self, actor: &Actor, slot_id: Uuid) -> Result<(), SlotError> {
        let slot = self.owned_slot(actor, slot_id).await?;
        if !self.remove_unless_booked(&slot).await? {
            return Err(SlotError::SlotBooked("slot backs a booking and cannot be deleted".to_string()));
        }
        Ok(())
    }

    /// Deletes the slot unless a booking stands behind it. Open slots go through the
    /// conditional delete so a payment that locks them first wins; blocked slots are
    /// deleted once the booking guard confirms nothing references them.
    async fn remove_unless_booked(&self, slot: &TimeSlot) -> Result<bool, SlotError> {
        if slot.is_available && self.store.delete_slot_if_available(slot.id).await? {
            self.drop_hold(slot.id).await;
            return Ok(true);
        }

        // Blocked by the doctor, or locked since the listing
        let current = self.store.get_slot(slot.id).await?;
        if current.is_available {
            return Err(SlotError::SlotUnavailable("slot changed while deleting, retry".to_string()));
        }
        if self.bookings.is_booked(slot.id).await? {
            return Ok(false);
        }
        self.store.delete_slot(slot.id).await?;
        self.drop_hold(slot.id).await;
        Ok(true)
    }

    pub async fn update_slot(&self, actor: &Actor, slot_id: Uuid, request: UpdateSlotRequest) -> Result<TimeSlot, SlotError> {
        let slot = self.owned_slot(actor, slot_id).await?;
        let window = SlotWindow {
            date: request.date.unwrap_or(slot.date),
            start_time: request.start_time.unwrap_or(slot.start_time),
            end_time: request.end_time.unwrap_or(slot.end_time),
        };
        validate_window(window.start_time, window.end_time)?;

        let neighbours = self.store.list_slots(slot.doctor_id, Some(window.date)).await?;
        if neighbours.iter().any(|other| other.id != slot_id && other.window().overlaps(&window)) {
            return Err(SlotError::Constraint("overlaps an existing slot".to_string()));
        }

        let updated = self
            .store
            .update_slot_window(slot_id, window.date, window.start_time, window.end_time)
            .await?;
        self.drop_hold(slot_id).await;
        Ok(updated)
    }

    /// Doctor toggle. Blocking an already blocked slot is a no-op; reopening a slot that
    /// still backs a booking is refused.
    pub async fn set_slot_availability(&self, actor: &Actor, slot_id: Uuid, is_available: bool) -> Result<TimeSlot, SlotError> {
        let slot = self.owned_slot(actor, slot_id).await?;

        if is_available {
            if !slot.is_available && self.bookings.is_booked(slot_id).await? {
                return Err(SlotError::SlotBooked("slot backs a booking and cannot be reopened".to_string()));
            }
            return self.store.release_slot(slot_id).await;
        }

        match self.store.lock_slot(slot_id).await {
            Ok(blocked) => {
                self.drop_hold(slot_id).await;
                Ok(blocked)
            }
            Err(SlotError::SlotUnavailable(_)) => self.store.get_slot(slot_id).await,
            Err(e) => Err(e),
        }
    }

    async fn drop_hold(&self, slot_id: Uuid) {
        if let Err(e) = self.holds.release(slot_id).await {
            warn!("Failed to release hold on slot {}: {}", slot_id, e);
        }
    }
}

/// Dates in `[from, until]` falling on `weekday` (0 = Sunday).
fn occurrences(from: NaiveDate, until: NaiveDate, weekday: u32) -> Vec<NaiveDate> {
    let offset = (i64::from(weekday) - i64::from(day_of_week(from))).rem_euclid(7);
    let mut date = from + Duration::days(offset);
    let mut dates = Vec::new();
    while date <= until {
        dates.push(date);
        date += Duration::days(7);
    }
    dates
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone, Utc};
    use proptest::prelude::*;

    fn at(h: u32, m: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn nine_to_five_becomes_sixteen_half_hours() {
        let zone = ClinicZone::from_offset_minutes(120);
        let range = TimeRange { start_time: at(7, 0), end_time: at(15, 0) };

        let windows = decompose_range(&range, &zone, 30);

        assert_eq!(windows.len(), 16);
        assert_eq!(windows[0].start_time, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(windows[15].end_time, NaiveTime::from_hms_opt(17, 0, 0).unwrap());
    }

    #[test]
    fn trailing_remainder_and_midnight_crossing_are_dropped() {
        let zone = ClinicZone::utc();
        let short_tail = TimeRange { start_time: at(9, 0), end_time: at(10, 15) };
        assert_eq!(decompose_range(&short_tail, &zone, 30).len(), 2);

        let late = TimeRange {
            start_time: Utc.with_ymd_and_hms(2025, 3, 10, 23, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2025, 3, 11, 1, 0, 0).unwrap(),
        };
        let windows = decompose_range(&late, &zone, 30);
        // 23:30-00:00 ends on the next day
        assert_eq!(windows.len(), 3);
        assert!(windows.iter().all(|w| w.start_time < w.end_time));
    }

    #[test]
    fn occurrences_land_on_the_requested_weekday() {
        let dates = occurrences("2025-03-01".parse().unwrap(), "2025-03-17".parse().unwrap(), 1);
        let expected: Vec<NaiveDate> = ["2025-03-03", "2025-03-10", "2025-03-17"]
            .iter()
            .map(|d| d.parse().unwrap())
            .collect();
        assert_eq!(dates, expected);

        assert!(occurrences("2025-03-04".parse().unwrap(), "2025-03-09".parse().unwrap(), 1).is_empty());
    }

    proptest! {
        #[test]
        fn sub_slots_are_contiguous_and_fit_the_range(
            start_minute in 0i64..(14 * 24 * 60),
            length in 0i64..(12 * 60),
            offset in -12i32..=14,
        ) {
            let zone = ClinicZone::from_offset_minutes(offset * 60);
            let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
            let range = TimeRange {
                start_time: base + Duration::minutes(start_minute),
                end_time: base + Duration::minutes(start_minute + length),
            };

            let windows = decompose_range(&range, &zone, 30);

            prop_assert!(windows.len() as i64 <= length / 30);
            for window in &windows {
                prop_assert_eq!(window.end_time - window.start_time, Duration::minutes(30));
                let begins = zone.to_utc(window.date, window.start_time);
                prop_assert!(begins >= range.start_time);
                prop_assert!(begins + Duration::minutes(30) <= range.end_time);
            }
            for pair in windows.windows(2) {
                prop_assert!(!pair[0].overlaps(&pair[1]));
            }
        }
    }
}
