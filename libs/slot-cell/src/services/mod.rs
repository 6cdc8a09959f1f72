pub mod availability;
pub mod booking_guard;
pub mod hold;
pub mod memory;
pub mod redis_hold;
pub mod repository;
pub mod store;
pub mod supabase;
pub mod sweeper;

pub use availability::{decompose_range, AvailabilityEditor};
pub use booking_guard::{BookingGuard, NoBookings};
pub use hold::{HoldManager, HoldRepository, InMemoryHoldRepository};
pub use memory::InMemorySlotRepository;
pub use redis_hold::RedisHoldRepository;
pub use repository::SlotRepository;
pub use store::SlotStore;
pub use supabase::SupabaseSlotRepository;
pub use sweeper::spawn_hold_sweeper;
