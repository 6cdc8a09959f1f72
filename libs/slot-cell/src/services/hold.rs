use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use shared_utils::clock::Clock;

use crate::error::SlotError;
use crate::models::Hold;
use crate::services::store::SlotStore;

/// Storage for session-scoped holds. Each method is one atomic step against the backing store.
#[async_trait]
pub trait HoldRepository: Send + Sync {
    /// Drops any hold the session has on another slot, then claims `hold.slot_id` unless a
    /// different session holds it past `now`. Returns the blocking hold on conflict.
    async fn acquire(&self, hold: Hold, now: DateTime<Utc>) -> Result<Option<Hold>, SlotError>;

    /// Removes the hold on `slot_id`, whoever owns it.
    async fn release(&self, slot_id: Uuid) -> Result<bool, SlotError>;

    /// The session's unexpired hold. An expired one is removed as a side effect.
    async fn active_for_session(&self, session_id: &str, now: DateTime<Utc>) -> Result<Option<Hold>, SlotError>;

    /// The slot's unexpired hold. An expired one is removed as a side effect.
    async fn active_for_slot(&self, slot_id: Uuid, now: DateTime<Utc>) -> Result<Option<Hold>, SlotError>;

    /// Removes every hold with `expires_at <= now`, returning how many were removed.
    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, SlotError>;

    /// Re-keys an active hold from one session to another, keeping its expiry.
    async fn transfer(&self, from_session: &str, to_session: &str, now: DateTime<Utc>) -> Result<Option<Hold>, SlotError>;
}

#[derive(Default)]
struct HoldTable {
    by_slot: HashMap<Uuid, Hold>,
    by_session: HashMap<String, Uuid>,
}

impl HoldTable {
    fn remove_slot(&mut self, slot_id: Uuid) -> Option<Hold> {
        let hold = self.by_slot.remove(&slot_id)?;
        if self.by_session.get(&hold.session_id) == Some(&slot_id) {
            self.by_session.remove(&hold.session_id);
        }
        Some(hold)
    }

    fn remove_session(&mut self, session_id: &str) -> Option<Hold> {
        let slot_id = self.by_session.remove(session_id)?;
        match self.by_slot.get(&slot_id) {
            Some(hold) if hold.session_id == session_id => self.by_slot.remove(&slot_id),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct InMemoryHoldRepository {
    table: Mutex<HoldTable>,
}

impl InMemoryHoldRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HoldRepository for InMemoryHoldRepository {
    async fn acquire(&self, hold: Hold, now: DateTime<Utc>) -> Result<Option<Hold>, SlotError> {
        let mut table = self.table.lock().await;

        if table.by_session.get(&hold.session_id).is_some_and(|held| *held != hold.slot_id) {
            table.remove_session(&hold.session_id);
        }

        if let Some(existing) = table.by_slot.get(&hold.slot_id) {
            if existing.session_id != hold.session_id && !existing.is_expired(now) {
                return Ok(Some(existing.clone()));
            }
        }
        table.remove_slot(hold.slot_id);

        table.by_session.insert(hold.session_id.clone(), hold.slot_id);
        table.by_slot.insert(hold.slot_id, hold);
        Ok(None)
    }

    async fn release(&self, slot_id: Uuid) -> Result<bool, SlotError> {
        Ok(self.table.lock().await.remove_slot(slot_id).is_some())
    }

    async fn active_for_session(&self, session_id: &str, now: DateTime<Utc>) -> Result<Option<Hold>, SlotError> {
        let mut table = self.table.lock().await;
        let Some(slot_id) = table.by_session.get(session_id).copied() else {
            return Ok(None);
        };

        match table.by_slot.get(&slot_id) {
            Some(hold) if hold.session_id == session_id && !hold.is_expired(now) => Ok(Some(hold.clone())),
            Some(hold) if hold.session_id == session_id => {
                table.remove_slot(slot_id);
                Ok(None)
            }
            _ => {
                table.by_session.remove(session_id);
                Ok(None)
            }
        }
    }

    async fn active_for_slot(&self, slot_id: Uuid, now: DateTime<Utc>) -> Result<Option<Hold>, SlotError> {
        let mut table = self.table.lock().await;
        match table.by_slot.get(&slot_id) {
            Some(hold) if !hold.is_expired(now) => Ok(Some(hold.clone())),
            Some(_) => {
                table.remove_slot(slot_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, SlotError> {
        let mut table = self.table.lock().await;
        let expired: Vec<Uuid> = table
            .by_slot
            .values()
            .filter(|hold| hold.is_expired(now))
            .map(|hold| hold.slot_id)
            .collect();

        for slot_id in &expired {
            table.remove_slot(*slot_id);
        }
        Ok(expired.len())
    }

    async fn transfer(&self, from_session: &str, to_session: &str, now: DateTime<Utc>) -> Result<Option<Hold>, SlotError> {
        let mut table = self.table.lock().await;

        let Some(mut hold) = table.remove_session(from_session) else {
            return Ok(None);
        };
        if hold.is_expired(now) {
            return Ok(None);
        }

        table.remove_session(to_session);
        hold.session_id = to_session.to_string();
        table.by_session.insert(hold.session_id.clone(), hold.slot_id);
        table.by_slot.insert(hold.slot_id, hold.clone());
        Ok(Some(hold))
    }
}

/// Session-scoped checkout reservations on top of the slot store.
///
/// Holds are keyed by session rather than user so they survive a sign-up or login
/// mid-checkout; `transfer_session` moves the hold to the promoted session.
#[derive(Clone)]
pub struct HoldManager {
    holds: Arc<dyn HoldRepository>,
    store: SlotStore,
    clock: Arc<dyn Clock>,
    default_duration: Duration,
}

impl HoldManager {
    pub fn new(
        holds: Arc<dyn HoldRepository>,
        store: SlotStore,
        clock: Arc<dyn Clock>,
        default_duration_minutes: i64,
    ) -> Self {
        Self {
            holds,
            store,
            clock,
            default_duration: Duration::minutes(default_duration_minutes),
        }
    }

    /// Holds always run for the configured duration; clients cannot extend them.
    #[instrument(skip(self))]
    pub async fn hold(&self, slot_id: Uuid, session_id: &str) -> Result<Hold, SlotError> {
        if session_id.trim().is_empty() {
            return Err(SlotError::Validation("session id is required".to_string()));
        }

        let slot = self.store.get_slot(slot_id).await?;
        if !slot.is_available {
            return Err(SlotError::SlotUnavailable("slot is already booked".to_string()));
        }

        let now = self.clock.now();
        let expires_at = now
            .checked_add_signed(self.default_duration)
            .ok_or_else(|| SlotError::Validation("hold duration is out of range".to_string()))?;
        let hold = Hold {
            slot_id,
            session_id: session_id.to_string(),
            held_at: now,
            expires_at,
        };

        match self.holds.acquire(hold.clone(), now).await? {
            None => {
                debug!("Session {} holds slot {} until {}", session_id, slot_id, hold.expires_at);
                Ok(hold)
            }
            Some(blocking) => {
                debug!("Slot {} is held by another session until {}", slot_id, blocking.expires_at);
                Err(SlotError::SlotUnavailable(
                    "this slot is being booked by someone else".to_string(),
                ))
            }
        }
    }

    pub async fn release(&self, slot_id: Uuid) -> Result<(), SlotError> {
        if self.holds.release(slot_id).await? {
            debug!("Released hold on slot {}", slot_id);
        }
        Ok(())
    }

    /// Drops the hold once the slot has been paid for.
    pub async fn consume(&self, slot_id: Uuid) -> Result<(), SlotError> {
        self.release(slot_id).await
    }

    pub async fn get_held(&self, session_id: &str) -> Result<Option<Hold>, SlotError> {
        self.holds.active_for_session(session_id, self.clock.now()).await
    }

    /// `true` when an unexpired hold on the slot belongs to a session other than `session_id`.
    pub async fn is_held_by_other(&self, slot_id: Uuid, session_id: Option<&str>) -> Result<bool, SlotError> {
        let active = self.holds.active_for_slot(slot_id, self.clock.now()).await?;
        Ok(active.is_some_and(|hold| Some(hold.session_id.as_str()) != session_id))
    }

    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<usize, SlotError> {
        let cleared = self.holds.remove_expired(self.clock.now()).await?;
        if cleared > 0 {
            info!("Cleared {} expired slot holds", cleared);
        }
        Ok(cleared)
    }

    pub async fn transfer_session(&self, from_session: &str, to_session: &str) -> Result<Option<Hold>, SlotError> {
        if to_session.trim().is_empty() {
            return Err(SlotError::Validation("target session id is required".to_string()));
        }
        if from_session == to_session {
            return self.get_held(from_session).await;
        }

        let moved = self.holds.transfer(from_session, to_session, self.clock.now()).await?;
        if let Some(hold) = &moved {
            info!("Transferred hold on slot {} to promoted session", hold.slot_id);
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{hhmm, NewTimeSlot};
    use crate::services::memory::InMemorySlotRepository;
    use assert_matches::assert_matches;
    use shared_utils::test_utils::ManualClock;

    struct Fixture {
        manager: HoldManager,
        store: SlotStore,
        clock: ManualClock,
        doctor_id: Uuid,
    }

    fn fixture() -> Fixture {
        let store = SlotStore::new(Arc::new(InMemorySlotRepository::new()));
        let clock = ManualClock::at_fixed_start();
        let manager = HoldManager::new(
            Arc::new(InMemoryHoldRepository::new()),
            store.clone(),
            Arc::new(clock.clone()),
            15,
        );
        Fixture { manager, store, clock, doctor_id: Uuid::new_v4() }
    }

    async fn slot(f: &Fixture, start: &str, end: &str) -> Uuid {
        f.store
            .create_slot(NewTimeSlot {
                doctor_id: f.doctor_id,
                date: "2025-03-10".parse().unwrap(),
                start_time: hhmm::parse(start).unwrap(),
                end_time: hhmm::parse(end).unwrap(),
                is_recurring: false,
                recurring_end_date: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn second_session_is_refused_while_hold_is_live() {
        let f = fixture();
        let slot_id = slot(&f, "09:00", "09:30").await;

        let hold = f.manager.hold(slot_id, "session-a").await.unwrap();
        assert_eq!(hold.expires_at - hold.held_at, Duration::minutes(15));

        assert_matches!(f.manager.hold(slot_id, "session-b").await, Err(SlotError::SlotUnavailable(_)));
    }

    #[tokio::test]
    async fn new_hold_supersedes_the_sessions_previous_one() {
        let f = fixture();
        let first = slot(&f, "09:00", "09:30").await;
        let second = slot(&f, "09:30", "10:00").await;

        f.manager.hold(first, "session-a").await.unwrap();
        f.manager.hold(second, "session-a").await.unwrap();

        assert_eq!(f.manager.get_held("session-a").await.unwrap().unwrap().slot_id, second);
        // The first slot is free for anyone now
        f.manager.hold(first, "session-b").await.unwrap();
    }

    #[tokio::test]
    async fn losing_hold_attempt_leaves_the_session_empty_handed() {
        let f = fixture();
        let mine = slot(&f, "09:00", "09:30").await;
        let contested = slot(&f, "09:30", "10:00").await;
        let booked = slot(&f, "10:00", "10:30").await;
        f.store.lock_slot(booked).await.unwrap();

        f.manager.hold(mine, "session-a").await.unwrap();
        // Refused on the slot lookup, before the session's hold is touched
        assert_matches!(f.manager.hold(booked, "session-a").await, Err(SlotError::SlotUnavailable(_)));
        assert_eq!(f.manager.get_held("session-a").await.unwrap().unwrap().slot_id, mine);

        f.manager.hold(contested, "session-b").await.unwrap();
        assert_matches!(f.manager.hold(contested, "session-a").await, Err(SlotError::SlotUnavailable(_)));
        assert_eq!(f.manager.get_held("session-a").await.unwrap(), None);
        assert!(!f.manager.is_held_by_other(mine, Some("session-c")).await.unwrap());
    }

    #[tokio::test]
    async fn same_session_rehold_refreshes_expiry() {
        let f = fixture();
        let slot_id = slot(&f, "09:00", "09:30").await;

        let first = f.manager.hold(slot_id, "session-a").await.unwrap();
        f.clock.advance(Duration::minutes(10));
        let refreshed = f.manager.hold(slot_id, "session-a").await.unwrap();

        assert!(refreshed.expires_at > first.expires_at);
        assert_eq!(f.manager.get_held("session-a").await.unwrap(), Some(refreshed));
    }

    #[tokio::test]
    async fn expired_hold_is_absent_and_reclaimable() {
        let f = fixture();
        let slot_id = slot(&f, "09:00", "09:30").await;

        f.manager.hold(slot_id, "session-a").await.unwrap();
        f.clock.advance(Duration::minutes(15));

        assert_eq!(f.manager.get_held("session-a").await.unwrap(), None);
        let taken = f.manager.hold(slot_id, "session-b").await.unwrap();
        assert_eq!(taken.session_id, "session-b");
    }

    #[tokio::test]
    async fn sweep_clears_only_expired_holds() {
        let f = fixture();
        let early = slot(&f, "09:00", "09:30").await;
        let late = slot(&f, "09:30", "10:00").await;

        f.manager.hold(early, "session-a").await.unwrap();
        f.clock.advance(Duration::minutes(10));
        f.manager.hold(late, "session-b").await.unwrap();
        f.clock.advance(Duration::minutes(6));

        assert_eq!(f.manager.sweep_expired().await.unwrap(), 1);
        assert!(f.manager.get_held("session-b").await.unwrap().is_some());
        assert_eq!(f.manager.sweep_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refuses_missing_and_booked_slots() {
        let f = fixture();
        let booked = slot(&f, "09:00", "09:30").await;
        f.store.lock_slot(booked).await.unwrap();

        assert_matches!(f.manager.hold(Uuid::new_v4(), "s").await, Err(SlotError::NotFound(_)));
        assert_matches!(f.manager.hold(booked, "s").await, Err(SlotError::SlotUnavailable(_)));
        assert_matches!(f.manager.hold(booked, " ").await, Err(SlotError::Validation(_)));
    }

    #[tokio::test]
    async fn transfer_keeps_expiry_and_moves_ownership() {
        let f = fixture();
        let slot_id = slot(&f, "09:00", "09:30").await;
        let original = f.manager.hold(slot_id, "anon-123").await.unwrap();

        let moved = f.manager.transfer_session("anon-123", "user-42").await.unwrap().unwrap();

        assert_eq!(moved.expires_at, original.expires_at);
        assert_eq!(f.manager.get_held("anon-123").await.unwrap(), None);
        assert!(!f.manager.is_held_by_other(slot_id, Some("user-42")).await.unwrap());
        assert!(f.manager.is_held_by_other(slot_id, Some("anon-123")).await.unwrap());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let f = fixture();
        let slot_id = slot(&f, "09:00", "09:30").await;
        f.manager.hold(slot_id, "session-a").await.unwrap();

        f.manager.release(slot_id).await.unwrap();
        f.manager.release(slot_id).await.unwrap();
        assert_eq!(f.manager.get_held("session-a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn racing_sessions_leave_exactly_one_hold() {
        let f = fixture();
        let slot_id = slot(&f, "09:00", "09:30").await;

        let attempts = (0..10).map(|i| {
            let manager = f.manager.clone();
            tokio::spawn(async move { manager.hold(slot_id, &format!("session-{}", i)).await })
        });
        let results = futures::future::join_all(attempts).await;

        assert_eq!(results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count(), 1);
    }
}
