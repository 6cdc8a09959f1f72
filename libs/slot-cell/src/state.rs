use std::sync::Arc;

use tracing::{info, warn};

use shared_config::{AppConfig, StorageBackend};
use shared_utils::clock::{Clock, SystemClock};

use crate::error::SlotError;
use crate::models::{ClinicZone, SlotPolicy};
use crate::services::{
    BookingGuard, HoldManager, HoldRepository, InMemoryHoldRepository, InMemorySlotRepository, NoBookings,
    RedisHoldRepository, SlotRepository, SlotStore, SupabaseSlotRepository,
};

/// Everything the slot handlers need, shared across requests.
#[derive(Clone)]
pub struct SlotState {
    pub config: Arc<AppConfig>,
    pub store: SlotStore,
    pub holds: HoldManager,
    pub bookings: Arc<dyn BookingGuard>,
    pub clock: Arc<dyn Clock>,
    pub zone: ClinicZone,
    pub policy: SlotPolicy,
}

impl SlotState {
    pub fn new(
        config: Arc<AppConfig>,
        slots: Arc<dyn SlotRepository>,
        holds: Arc<dyn HoldRepository>,
        bookings: Arc<dyn BookingGuard>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let policy = SlotPolicy::from_config(&config);
        let store = SlotStore::new(slots);
        let holds = HoldManager::new(holds, store.clone(), clock.clone(), policy.hold_duration_minutes);

        Self {
            zone: ClinicZone::from_offset_minutes(config.clinic_utc_offset_minutes),
            config,
            store,
            holds,
            bookings,
            clock,
            policy,
        }
    }

    /// In-memory slots and holds with the system clock.
    pub fn in_memory(config: Arc<AppConfig>) -> Self {
        Self::new(
            config,
            Arc::new(InMemorySlotRepository::new()),
            Arc::new(InMemoryHoldRepository::new()),
            Arc::new(NoBookings),
            Arc::new(SystemClock),
        )
    }

    /// Picks slot and hold backends from configuration.
    pub async fn from_config(config: Arc<AppConfig>, bookings: Arc<dyn BookingGuard>) -> Result<Self, SlotError> {
        let slots: Arc<dyn SlotRepository> = match config.storage_backend {
            StorageBackend::Supabase => {
                info!("Using Supabase slot storage at {}", config.supabase_url);
                Arc::new(SupabaseSlotRepository::new(&config))
            }
            StorageBackend::Memory => {
                warn!("Using in-memory slot storage, data will not survive a restart");
                Arc::new(InMemorySlotRepository::new())
            }
        };

        let holds: Arc<dyn HoldRepository> = match &config.redis_url {
            Some(url) => Arc::new(RedisHoldRepository::new(url).await?),
            None => {
                warn!("REDIS_URL not set, slot holds are local to this process");
                Arc::new(InMemoryHoldRepository::new())
            }
        };

        Ok(Self::new(config, slots, holds, bookings, Arc::new(SystemClock)))
    }
}
