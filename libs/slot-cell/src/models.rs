use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared_config::AppConfig;

/// Wall-clock times are exchanged as `HH:MM`; Postgres `time` columns come back as `HH:MM:SS`.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(D::Error::custom)
    }

    pub fn parse(raw: &str) -> Result<NaiveTime, String> {
        NaiveTime::parse_from_str(raw, "%H:%M:%S")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
            .map_err(|_| format!("invalid time of day: {}", raw))
    }
}

// ==============================================================================
// CORE RECORDS
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub is_available: bool,
    #[serde(default)]
    pub is_recurring: bool,
    #[serde(default)]
    pub recurring_end_date: Option<NaiveDate>,
    // Retired field-based lock. Read for schema compatibility, never written or consulted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TimeSlot {
    pub fn window(&self) -> SlotWindow {
        SlotWindow {
            date: self.date,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

/// Insert payload for a slot. New slots are always available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTimeSlot {
    pub doctor_id: Uuid,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub is_recurring: bool,
    pub recurring_end_date: Option<NaiveDate>,
}

impl NewTimeSlot {
    pub fn single(doctor_id: Uuid, window: SlotWindow) -> Self {
        Self {
            doctor_id,
            date: window.date,
            start_time: window.start_time,
            end_time: window.end_time,
            is_recurring: false,
            recurring_end_date: None,
        }
    }

    pub fn window(&self) -> SlotWindow {
        SlotWindow {
            date: self.date,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

/// A doctor-local date and time-of-day window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotWindow {
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
}

impl SlotWindow {
    /// Half-open overlap on the same day; touching windows do not overlap.
    pub fn overlaps(&self, other: &SlotWindow) -> bool {
        self.date == other.date && self.start_time < other.end_time && other.start_time < self.end_time
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub slot_id: Uuid,
    pub session_id: String,
    pub held_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Hold {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteScope {
    /// Only the named date.
    Single,
    /// The named date and every later date on the same weekday.
    Forward,
    /// Every date on the same weekday, past ones included.
    All,
}

// ==============================================================================
// CLINIC TIME AND POLICY
// ==============================================================================

/// The clinic's fixed UTC offset. Slot dates and times are wall-clock at this offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClinicZone {
    offset: FixedOffset,
}

impl ClinicZone {
    pub fn from_offset_minutes(minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }

    pub fn utc() -> Self {
        Self::from_offset_minutes(0)
    }

    pub fn to_local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.with_timezone(&self.offset).naive_local()
    }

    pub fn to_utc(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let local = date.and_time(time);
        (local - Duration::seconds(i64::from(self.offset.local_minus_utc()))).and_utc()
    }

    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        self.to_local(now).date()
    }

    /// Instant at which the slot starts.
    pub fn slot_start(&self, slot: &TimeSlot) -> DateTime<Utc> {
        self.to_utc(slot.date, slot.start_time)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SlotPolicy {
    pub sub_slot_minutes: i64,
    pub recurring_horizon_days: i64,
    pub hold_duration_minutes: i64,
}

impl Default for SlotPolicy {
    fn default() -> Self {
        Self {
            sub_slot_minutes: 30,
            recurring_horizon_days: 366,
            hold_duration_minutes: 15,
        }
    }
}

impl SlotPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            hold_duration_minutes: config.hold_duration_minutes,
            ..Self::default()
        }
    }
}

/// 0 = Sunday .. 6 = Saturday.
pub fn day_of_week(date: NaiveDate) -> u32 {
    date.weekday().num_days_from_sunday()
}

// ==============================================================================
// REQUESTS
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct SlotQuery {
    pub doctor_id: Uuid,
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSlotRequest {
    pub doctor_id: Option<Uuid>,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub is_recurring: Option<bool>,
    pub recurring_end_date: Option<NaiveDate>,
}

/// An absolute range picked in a calendar; split into sub-slots on creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct BatchCreateRequest {
    pub doctor_id: Option<Uuid>,
    pub ranges: Vec<TimeRange>,
}

#[derive(Debug, Deserialize)]
pub struct RecurringSlotRequest {
    pub doctor_id: Option<Uuid>,
    pub day_of_week: u32,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub until_date: NaiveDate,
    pub from_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRangeRequest {
    pub doctor_id: Option<Uuid>,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    #[serde(default = "default_scope")]
    pub scope: DeleteScope,
}

fn default_scope() -> DeleteScope {
    DeleteScope::Single
}

#[derive(Debug, Deserialize)]
pub struct UpdateSlotRequest {
    pub date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "optional_hhmm")]
    pub start_time: Option<NaiveTime>,
    #[serde(default, deserialize_with = "optional_hhmm")]
    pub end_time: Option<NaiveTime>,
}

fn optional_hhmm<'de, D>(deserializer: D) -> Result<Option<NaiveTime>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|value| hhmm::parse(&value).map_err(serde::de::Error::custom))
        .transpose()
}

#[derive(Debug, Deserialize)]
pub struct SetAvailabilityRequest {
    pub is_available: bool,
}

#[derive(Debug, Deserialize)]
pub struct HoldRequest {
    pub slot_id: Uuid,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub slot_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct HeldQuery {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TransferHoldRequest {
    pub from_session_id: String,
    pub to_session_id: String,
}

// ==============================================================================
// OUTCOMES
// ==============================================================================

/// One sub-slot that was not created, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotAttempt {
    #[serde(flatten)]
    pub window: SlotWindow,
    pub reason: String,
}

/// Aggregate result of batch and recurring creation. Individual failures never abort the batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub created: Vec<TimeSlot>,
    pub skipped: Vec<SlotAttempt>,
    pub failed: Vec<SlotAttempt>,
}

impl BatchOutcome {
    pub fn created_count(&self) -> usize {
        self.created.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RangeDeletion {
    pub deleted: usize,
    pub skipped_booked: usize,
    pub dates: Vec<NaiveDate>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window(date: &str, start: &str, end: &str) -> SlotWindow {
        SlotWindow {
            date: date.parse().unwrap(),
            start_time: hhmm::parse(start).unwrap(),
            end_time: hhmm::parse(end).unwrap(),
        }
    }

    #[test]
    fn adjacent_windows_do_not_overlap() {
        let first = window("2025-03-10", "09:00", "09:30");
        let second = window("2025-03-10", "09:30", "10:00");
        let straddling = window("2025-03-10", "09:15", "09:45");
        let other_day = window("2025-03-11", "09:00", "09:30");

        assert!(!first.overlaps(&second));
        assert!(first.overlaps(&straddling));
        assert!(second.overlaps(&straddling));
        assert!(!first.overlaps(&other_day));
    }

    #[test]
    fn clinic_zone_converts_wall_clock() {
        let zone = ClinicZone::from_offset_minutes(120);
        let instant = zone.to_utc("2025-03-10".parse().unwrap(), hhmm::parse("09:00").unwrap());

        assert_eq!(instant, Utc.with_ymd_and_hms(2025, 3, 10, 7, 0, 0).unwrap());
        assert_eq!(zone.to_local(instant).time(), hhmm::parse("09:00").unwrap());
        assert_eq!(zone.today(Utc.with_ymd_and_hms(2025, 3, 9, 23, 30, 0).unwrap()), "2025-03-10".parse().unwrap());
    }

    #[test]
    fn slot_rows_accept_postgres_time_format() {
        let row = serde_json::json!({
            "id": Uuid::new_v4(),
            "doctor_id": Uuid::new_v4(),
            "date": "2025-03-10",
            "start_time": "09:00:00",
            "end_time": "09:30:00",
            "is_available": true,
            "created_at": "2025-03-01T08:00:00Z"
        });

        let slot: TimeSlot = serde_json::from_value(row).unwrap();
        assert!(!slot.is_recurring);
        assert_eq!(serde_json::to_value(&slot).unwrap()["start_time"], "09:00");
    }

    #[test]
    fn days_of_week_start_on_sunday() {
        assert_eq!(day_of_week("2025-03-09".parse().unwrap()), 0);
        assert_eq!(day_of_week("2025-03-10".parse().unwrap()), 1);
    }
}
