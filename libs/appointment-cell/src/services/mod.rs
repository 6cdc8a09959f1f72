pub mod collaborators;
pub mod guard;
pub mod lifecycle;
pub mod memory;
pub mod repository;
pub mod resolver;
pub mod supabase;

pub use collaborators::{
    LogMeetingProvisioner, LogNotificationDispatcher, MeetingProvisioner, NotificationDispatcher, NotificationTrigger,
};
pub use guard::AppointmentBookings;
pub use lifecycle::AppointmentLifecycleService;
pub use memory::InMemoryAppointmentRepository;
pub use repository::AppointmentRepository;
pub use resolver::BookingConflictResolver;
pub use supabase::SupabaseAppointmentRepository;
