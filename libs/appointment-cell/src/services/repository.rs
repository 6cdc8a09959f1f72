use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    Appointment, AppointmentChange, AppointmentError, AppointmentPatch, AppointmentStatus, AppointmentVersion,
    NewAppointment, NewAppointmentChange,
};

/// Durable appointment records and their change log.
#[async_trait]
pub trait AppointmentRepository: Send + Sync {
    async fn insert(&self, appointment: NewAppointment) -> Result<Appointment, AppointmentError>;

    async fn get(&self, appointment_id: Uuid) -> Result<Option<Appointment>, AppointmentError>;

    /// Applies `patch` only while the row still matches `expected`. `None` means the write lost.
    async fn update_if(
        &self,
        appointment_id: Uuid,
        expected: AppointmentVersion,
        patch: AppointmentPatch,
    ) -> Result<Option<Appointment>, AppointmentError>;

    async fn list_by_status(&self, status: AppointmentStatus) -> Result<Vec<Appointment>, AppointmentError>;

    async fn find_by_slot(&self, slot_id: Uuid) -> Result<Vec<Appointment>, AppointmentError>;

    async fn record_change(&self, change: NewAppointmentChange) -> Result<AppointmentChange, AppointmentError>;

    /// Oldest first.
    async fn list_changes(&self, appointment_id: Uuid) -> Result<Vec<AppointmentChange>, AppointmentError>;
}
