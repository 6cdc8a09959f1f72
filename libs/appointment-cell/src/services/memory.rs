use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    Appointment, AppointmentChange, AppointmentError, AppointmentPatch, AppointmentStatus, AppointmentVersion,
    NewAppointment, NewAppointmentChange,
};
use crate::services::repository::AppointmentRepository;

/// Process-local appointments. Conditional updates compare and write under one write lock.
#[derive(Default)]
pub struct InMemoryAppointmentRepository {
    appointments: RwLock<HashMap<Uuid, Appointment>>,
    changes: RwLock<Vec<AppointmentChange>>,
}

impl InMemoryAppointmentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AppointmentRepository for InMemoryAppointmentRepository {
    async fn insert(&self, new: NewAppointment) -> Result<Appointment, AppointmentError> {
        let now = Utc::now();
        let appointment = Appointment {
            id: Uuid::new_v4(),
            patient_id: new.patient_id,
            doctor_id: new.doctor_id,
            slot_id: new.slot_id,
            appointment_date: new.appointment_date,
            status: AppointmentStatus::Pending,
            reschedule_count: 0,
            price: new.price,
            payment_reference: None,
            cancel_reason: None,
            cancelled_by: None,
            created_at: now,
            updated_at: now,
        };
        self.appointments.write().await.insert(appointment.id, appointment.clone());
        Ok(appointment)
    }

    async fn get(&self, appointment_id: Uuid) -> Result<Option<Appointment>, AppointmentError> {
        Ok(self.appointments.read().await.get(&appointment_id).cloned())
    }

    async fn update_if(
        &self,
        appointment_id: Uuid,
        expected: AppointmentVersion,
        patch: AppointmentPatch,
    ) -> Result<Option<Appointment>, AppointmentError> {
        let mut appointments = self.appointments.write().await;
        match appointments.get_mut(&appointment_id) {
            Some(appointment) if appointment.version() == expected => {
                patch.apply(appointment);
                appointment.updated_at = Utc::now();
                Ok(Some(appointment.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_by_status(&self, status: AppointmentStatus) -> Result<Vec<Appointment>, AppointmentError> {
        let appointments = self.appointments.read().await;
        let mut matching: Vec<Appointment> = appointments.values().filter(|a| a.status == status).cloned().collect();
        matching.sort_by_key(|a| a.appointment_date);
        Ok(matching)
    }

    async fn find_by_slot(&self, slot_id: Uuid) -> Result<Vec<Appointment>, AppointmentError> {
        let appointments = self.appointments.read().await;
        Ok(appointments
            .values()
            .filter(|a| a.slot_id == Some(slot_id))
            .cloned()
            .collect())
    }

    async fn record_change(&self, change: NewAppointmentChange) -> Result<AppointmentChange, AppointmentError> {
        let entry = AppointmentChange {
            id: Uuid::new_v4(),
            appointment_id: change.appointment_id,
            action: change.action,
            actor_id: change.actor_id,
            actor_role: change.actor_role,
            reason: change.reason,
            before: change.before,
            after: change.after,
            created_at: Utc::now(),
        };
        self.changes.write().await.push(entry.clone());
        Ok(entry)
    }

    async fn list_changes(&self, appointment_id: Uuid) -> Result<Vec<AppointmentChange>, AppointmentError> {
        let changes = self.changes.read().await;
        Ok(changes
            .iter()
            .filter(|c| c.appointment_id == appointment_id)
            .cloned()
            .collect())
    }
}
