use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::{is_conflict, SupabaseClient};

use crate::error::SlotError;
use crate::models::{NewTimeSlot, TimeSlot};
use crate::services::repository::SlotRepository;

const TABLE: &str = "/rest/v1/doctor_time_slots";

/// Slots stored in the `doctor_time_slots` table through PostgREST.
///
/// Conditional writes are filtered `PATCH`/`DELETE` requests asking for the affected
/// rows back; an empty representation means the filter no longer matched.
pub struct SupabaseSlotRepository {
    supabase: SupabaseClient,
}

impl SupabaseSlotRepository {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: SupabaseClient::new(config),
        }
    }

    fn time_param(time: NaiveTime) -> String {
        time.format("%H:%M:%S").to_string()
    }

    fn parse_rows(rows: Vec<Value>) -> Result<Vec<TimeSlot>, SlotError> {
        rows.into_iter()
            .map(|row| serde_json::from_value(row).map_err(SlotError::from))
            .collect()
    }

    async fn fetch(&self, path: &str) -> Result<Vec<TimeSlot>, SlotError> {
        let rows: Vec<Value> = self
            .supabase
            .request(Method::GET, path, Some(self.supabase.service_token()), None)
            .await?;
        Self::parse_rows(rows)
    }

    async fn write(&self, method: Method, path: &str, body: Option<Value>) -> Result<Vec<TimeSlot>, SlotError> {
        let rows: Vec<Value> = self
            .supabase
            .request_with_headers(
                method,
                path,
                Some(self.supabase.service_token()),
                body,
                Some(SupabaseClient::representation_headers()),
            )
            .await?;
        Self::parse_rows(rows)
    }
}

#[async_trait]
impl SlotRepository for SupabaseSlotRepository {
    async fn list(&self, doctor_id: Uuid, date: Option<NaiveDate>) -> Result<Vec<TimeSlot>, SlotError> {
        let mut path = format!("{}?doctor_id=eq.{}", TABLE, doctor_id);
        if let Some(date) = date {
            path.push_str(&format!("&date=eq.{}", date));
        }
        path.push_str("&order=date.asc,start_time.asc");
        self.fetch(&path).await
    }

    async fn list_between(
        &self,
        doctor_id: Uuid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<TimeSlot>, SlotError> {
        let mut path = format!("{}?doctor_id=eq.{}", TABLE, doctor_id);
        if let Some(from) = from {
            path.push_str(&format!("&date=gte.{}", from));
        }
        if let Some(to) = to {
            path.push_str(&format!("&date=lte.{}", to));
        }
        path.push_str("&order=date.asc,start_time.asc");
        self.fetch(&path).await
    }

    async fn get(&self, slot_id: Uuid) -> Result<Option<TimeSlot>, SlotError> {
        let path = format!("{}?id=eq.{}", TABLE, slot_id);
        Ok(self.fetch(&path).await?.into_iter().next())
    }

    async fn find_starting_at(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<Vec<TimeSlot>, SlotError> {
        let path = format!(
            "{}?doctor_id=eq.{}&date=eq.{}&start_time=eq.{}",
            TABLE,
            doctor_id,
            date,
            Self::time_param(start_time)
        );
        self.fetch(&path).await
    }

    async fn insert(&self, slot: NewTimeSlot) -> Result<TimeSlot, SlotError> {
        let body = json!({
            "doctor_id": slot.doctor_id,
            "date": slot.date,
            "start_time": Self::time_param(slot.start_time),
            "end_time": Self::time_param(slot.end_time),
            "is_available": true,
            "is_recurring": slot.is_recurring,
            "recurring_end_date": slot.recurring_end_date,
        });

        self.write(Method::POST, TABLE, Some(body))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SlotError::Storage("insert returned no row".to_string()))
    }

    async fn insert_many(&self, slots: Vec<NewTimeSlot>) -> Result<Vec<Result<TimeSlot, SlotError>>, SlotError> {
        if slots.is_empty() {
            return Ok(Vec::new());
        }

        let body = Value::Array(
            slots
                .iter()
                .map(|slot| {
                    json!({
                        "doctor_id": slot.doctor_id,
                        "date": slot.date,
                        "start_time": Self::time_param(slot.start_time),
                        "end_time": Self::time_param(slot.end_time),
                        "is_available": true,
                        "is_recurring": slot.is_recurring,
                        "recurring_end_date": slot.recurring_end_date,
                    })
                })
                .collect(),
        );

        let bulk: anyhow::Result<Vec<Value>> = self
            .supabase
            .request_with_headers(
                Method::POST,
                TABLE,
                Some(self.supabase.service_token()),
                Some(body),
                Some(SupabaseClient::representation_headers()),
            )
            .await;

        match bulk {
            Ok(rows) => {
                debug!("Bulk inserted {} slots", rows.len());
                Ok(Self::parse_rows(rows)?.into_iter().map(Ok).collect())
            }
            // A single duplicate fails the whole statement; retry row by row so the rest still land
            Err(e) if is_conflict(&e) => {
                warn!("Bulk slot insert hit a constraint, retrying {} rows individually", slots.len());
                let mut results = Vec::with_capacity(slots.len());
                for slot in slots {
                    results.push(self.insert(slot).await);
                }
                Ok(results)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_available_if(
        &self,
        slot_id: Uuid,
        expected: Option<bool>,
        value: bool,
    ) -> Result<Option<TimeSlot>, SlotError> {
        let mut path = format!("{}?id=eq.{}", TABLE, slot_id);
        if let Some(expected) = expected {
            path.push_str(&format!("&is_available=eq.{}", expected));
        }

        let rows = self
            .write(Method::PATCH, &path, Some(json!({ "is_available": value })))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn swap_availability(&self, release_id: Uuid, lock_id: Uuid) -> Result<bool, SlotError> {
        let swapped: bool = self
            .supabase
            .request(
                Method::POST,
                "/rest/v1/rpc/swap_slot_availability",
                Some(self.supabase.service_token()),
                Some(json!({
                    "release_slot_id": release_id,
                    "lock_slot_id": lock_id,
                })),
            )
            .await?;
        Ok(swapped)
    }

    async fn update_window_if_available(
        &self,
        slot_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Result<Option<TimeSlot>, SlotError> {
        let path = format!("{}?id=eq.{}&is_available=eq.true", TABLE, slot_id);
        let body = json!({
            "date": date,
            "start_time": Self::time_param(start_time),
            "end_time": Self::time_param(end_time),
        });

        Ok(self.write(Method::PATCH, &path, Some(body)).await?.into_iter().next())
    }

    async fn delete(&self, slot_id: Uuid, only_if_available: bool) -> Result<bool, SlotError> {
        let mut path = format!("{}?id=eq.{}", TABLE, slot_id);
        if only_if_available {
            path.push_str("&is_available=eq.true");
        }

        Ok(!self.write(Method::DELETE, &path, None).await?.is_empty())
    }
}
