use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::models::{
    Appointment, AppointmentChange, AppointmentError, AppointmentPatch, AppointmentStatus, AppointmentVersion,
    NewAppointment, NewAppointmentChange,
};
use crate::services::repository::AppointmentRepository;

const APPOINTMENTS: &str = "/rest/v1/appointments";
const CHANGES: &str = "/rest/v1/appointment_changes";

/// Appointments in PostgREST. Optimistic writes filter on `status` and `reschedule_count`.
pub struct SupabaseAppointmentRepository {
    supabase: SupabaseClient,
}

impl SupabaseAppointmentRepository {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: SupabaseClient::new(config),
        }
    }

    fn parse_rows<T: DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, AppointmentError> {
        rows.into_iter()
            .map(|row| serde_json::from_value(row).map_err(AppointmentError::from))
            .collect()
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, AppointmentError> {
        let rows: Vec<Value> = self
            .supabase
            .request(Method::GET, path, Some(self.supabase.service_token()), None)
            .await?;
        Self::parse_rows(rows)
    }

    async fn write<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Value,
    ) -> Result<Vec<T>, AppointmentError> {
        let rows: Vec<Value> = self
            .supabase
            .request_with_headers(
                method,
                path,
                Some(self.supabase.service_token()),
                Some(body),
                Some(SupabaseClient::representation_headers()),
            )
            .await?;
        Self::parse_rows(rows)
    }
}

#[async_trait]
impl AppointmentRepository for SupabaseAppointmentRepository {
    async fn insert(&self, appointment: NewAppointment) -> Result<Appointment, AppointmentError> {
        let body = json!({
            "patient_id": appointment.patient_id,
            "doctor_id": appointment.doctor_id,
            "slot_id": appointment.slot_id,
            "appointment_date": appointment.appointment_date,
            "status": AppointmentStatus::Pending,
            "reschedule_count": 0,
            "price": appointment.price,
        });

        self.write(Method::POST, APPOINTMENTS, body)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppointmentError::Database("insert returned no row".to_string()))
    }

    async fn get(&self, appointment_id: Uuid) -> Result<Option<Appointment>, AppointmentError> {
        let path = format!("{}?id=eq.{}", APPOINTMENTS, appointment_id);
        Ok(self.fetch(&path).await?.into_iter().next())
    }

    async fn update_if(
        &self,
        appointment_id: Uuid,
        expected: AppointmentVersion,
        patch: AppointmentPatch,
    ) -> Result<Option<Appointment>, AppointmentError> {
        let path = format!(
            "{}?id=eq.{}&status=eq.{}&reschedule_count=eq.{}",
            APPOINTMENTS, appointment_id, expected.status, expected.reschedule_count
        );
        let mut body = serde_json::to_value(&patch)?;
        if let Value::Object(fields) = &mut body {
            fields.insert("updated_at".to_string(), json!(Utc::now()));
        }

        let updated: Option<Appointment> = self.write(Method::PATCH, &path, body).await?.into_iter().next();
        if updated.is_none() {
            debug!("Conditional update of appointment {} matched no row", appointment_id);
        }
        Ok(updated)
    }

    async fn list_by_status(&self, status: AppointmentStatus) -> Result<Vec<Appointment>, AppointmentError> {
        let path = format!("{}?status=eq.{}&order=appointment_date.asc", APPOINTMENTS, status);
        self.fetch(&path).await
    }

    async fn find_by_slot(&self, slot_id: Uuid) -> Result<Vec<Appointment>, AppointmentError> {
        let path = format!("{}?slot_id=eq.{}", APPOINTMENTS, slot_id);
        self.fetch(&path).await
    }

    async fn record_change(&self, change: NewAppointmentChange) -> Result<AppointmentChange, AppointmentError> {
        let body = serde_json::to_value(&change)?;
        self.write(Method::POST, CHANGES, body)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppointmentError::Database("change log insert returned no row".to_string()))
    }

    async fn list_changes(&self, appointment_id: Uuid) -> Result<Vec<AppointmentChange>, AppointmentError> {
        let path = format!("{}?appointment_id=eq.{}&order=created_at.asc", CHANGES, appointment_id);
        self.fetch(&path).await
    }
}
