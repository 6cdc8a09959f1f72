use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

/// Email triggers, keyed by the code the mailer's templates use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationTrigger {
    BookingConfirmed,
    Rescheduled,
    Cancelled,
}

impl NotificationTrigger {
    pub fn code(&self) -> &'static str {
        match self {
            NotificationTrigger::BookingConfirmed => "BOOK_CONF",
            NotificationTrigger::Rescheduled => "RESCHEDULED",
            NotificationTrigger::Cancelled => "CANCELLED",
        }
    }
}

/// Schedules patient and doctor emails. Failures never undo a booking change.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, trigger: NotificationTrigger, appointment_id: Uuid) -> anyhow::Result<()>;
}

/// Creates the video meeting for a paid appointment.
#[async_trait]
pub trait MeetingProvisioner: Send + Sync {
    async fn provision(&self, appointment_id: Uuid) -> anyhow::Result<()>;
}

/// Stand-in used until a mail provider is wired in.
pub struct LogNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for LogNotificationDispatcher {
    async fn dispatch(&self, trigger: NotificationTrigger, appointment_id: Uuid) -> anyhow::Result<()> {
        info!("Notification {} queued for appointment {}", trigger.code(), appointment_id);
        Ok(())
    }
}

pub struct LogMeetingProvisioner;

#[async_trait]
impl MeetingProvisioner for LogMeetingProvisioner {
    async fn provision(&self, appointment_id: Uuid) -> anyhow::Result<()> {
        info!("Meeting requested for appointment {}", appointment_id);
        Ok(())
    }
}
