use std::sync::Arc;

use tracing::{info, warn};

use shared_config::{AppConfig, StorageBackend};
use slot_cell::services::BookingGuard;
use slot_cell::SlotState;

use crate::models::BookingPolicy;
use crate::services::{
    AppointmentBookings, AppointmentRepository, BookingConflictResolver, InMemoryAppointmentRepository,
    LogMeetingProvisioner, LogNotificationDispatcher, MeetingProvisioner, NotificationDispatcher,
    SupabaseAppointmentRepository,
};

/// Shared state for the appointment, payment and admin routers.
#[derive(Clone)]
pub struct AppointmentState {
    pub config: Arc<AppConfig>,
    pub repo: Arc<dyn AppointmentRepository>,
    pub resolver: BookingConflictResolver,
}

impl AppointmentState {
    pub fn new(config: Arc<AppConfig>, repo: Arc<dyn AppointmentRepository>, slots: &SlotState) -> Self {
        Self::with_collaborators(
            config,
            repo,
            slots,
            Arc::new(LogNotificationDispatcher),
            Arc::new(LogMeetingProvisioner),
        )
    }

    pub fn with_collaborators(
        config: Arc<AppConfig>,
        repo: Arc<dyn AppointmentRepository>,
        slots: &SlotState,
        notifier: Arc<dyn NotificationDispatcher>,
        meetings: Arc<dyn MeetingProvisioner>,
    ) -> Self {
        let resolver = BookingConflictResolver::new(repo.clone(), slots, notifier, meetings, BookingPolicy::default());
        Self { config, repo, resolver }
    }

    /// Appointment storage for the configured backend.
    pub fn repository_from_config(config: &AppConfig) -> Arc<dyn AppointmentRepository> {
        match config.storage_backend {
            StorageBackend::Supabase => {
                info!("Using Supabase appointment storage");
                Arc::new(SupabaseAppointmentRepository::new(config))
            }
            StorageBackend::Memory => {
                warn!("Using in-memory appointment storage, data will not survive a restart");
                Arc::new(InMemoryAppointmentRepository::new())
            }
        }
    }

    /// The booked-slot check handed to the availability editor.
    pub fn booking_guard(repo: Arc<dyn AppointmentRepository>) -> Arc<dyn BookingGuard> {
        Arc::new(AppointmentBookings::new(repo))
    }
}
