use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::Script;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SlotError;
use crate::models::Hold;
use crate::services::hold::HoldRepository;

const SLOT_PREFIX: &str = "slot_hold:slot:";
const SESSION_PREFIX: &str = "slot_hold:session:";

// Keys expire a minute after the hold itself so the sweep, not Redis, decides when a hold ends.
const TTL_GRACE_MS: i64 = 60_000;

#[derive(Debug, Serialize, Deserialize)]
struct StoredHold {
    slot_id: Uuid,
    session_id: String,
    held_at_ms: i64,
    expires_at_ms: i64,
}

impl StoredHold {
    fn from_hold(hold: &Hold) -> Self {
        Self {
            slot_id: hold.slot_id,
            session_id: hold.session_id.clone(),
            held_at_ms: hold.held_at.timestamp_millis(),
            expires_at_ms: hold.expires_at.timestamp_millis(),
        }
    }

    fn into_hold(self) -> Hold {
        Hold {
            slot_id: self.slot_id,
            session_id: self.session_id,
            held_at: millis(self.held_at_ms),
            expires_at: millis(self.expires_at_ms),
        }
    }
}

fn millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

// KEYS: slot key, session key. ARGV: session id, slot id, record, now ms, ttl ms.
const ACQUIRE: &str = r#"
local previous = redis.call('GET', KEYS[2])
if previous and previous ~= ARGV[2] then
  local prev_key = 'slot_hold:slot:' .. previous
  local prev = redis.call('GET', prev_key)
  if prev and cjson.decode(prev).session_id == ARGV[1] then
    redis.call('DEL', prev_key)
  end
  redis.call('DEL', KEYS[2])
end
local current = redis.call('GET', KEYS[1])
if current then
  local held = cjson.decode(current)
  if held.session_id ~= ARGV[1] then
    if tonumber(held.expires_at_ms) > tonumber(ARGV[4]) then
      return current
    end
    local stale_session = 'slot_hold:session:' .. held.session_id
    if redis.call('GET', stale_session) == ARGV[2] then
      redis.call('DEL', stale_session)
    end
  end
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[5])
redis.call('SET', KEYS[2], ARGV[2], 'PX', ARGV[5])
return false
"#;

// KEYS: slot key. ARGV: slot id, expired-only flag, now ms.
const RELEASE: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return 0
end
local held = cjson.decode(current)
if ARGV[2] == '1' and tonumber(held.expires_at_ms) > tonumber(ARGV[3]) then
  return 0
end
local session_key = 'slot_hold:session:' .. held.session_id
if redis.call('GET', session_key) == ARGV[1] then
  redis.call('DEL', session_key)
end
redis.call('DEL', KEYS[1])
return 1
"#;

// KEYS: from session key, to session key. ARGV: to session id, now ms, ttl grace ms.
const TRANSFER: &str = r#"
local slot_id = redis.call('GET', KEYS[1])
if not slot_id then
  return false
end
redis.call('DEL', KEYS[1])
local slot_key = 'slot_hold:slot:' .. slot_id
local current = redis.call('GET', slot_key)
if not current then
  return false
end
local held = cjson.decode(current)
if tonumber(held.expires_at_ms) <= tonumber(ARGV[2]) then
  redis.call('DEL', slot_key)
  return false
end
local replaced = redis.call('GET', KEYS[2])
if replaced and replaced ~= slot_id then
  local replaced_key = 'slot_hold:slot:' .. replaced
  local other = redis.call('GET', replaced_key)
  if other and cjson.decode(other).session_id == ARGV[1] then
    redis.call('DEL', replaced_key)
  end
end
held.session_id = ARGV[1]
local record = cjson.encode(held)
local ttl = tonumber(held.expires_at_ms) - tonumber(ARGV[2]) + tonumber(ARGV[3])
redis.call('SET', slot_key, record, 'PX', ttl)
redis.call('SET', KEYS[2], slot_id, 'PX', ttl)
return record
"#;

/// Holds kept in Redis so every API instance sees the same reservations.
///
/// Each multi-key mutation is a Lua script, so Redis applies it atomically.
pub struct RedisHoldRepository {
    pool: Pool,
}

impl RedisHoldRepository {
    pub async fn new(redis_url: &str) -> Result<Self, SlotError> {
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| SlotError::Storage(format!("failed to create Redis pool: {}", e)))?;

        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Redis hold store initialized");

        Ok(Self { pool })
    }

    async fn connection(&self) -> Result<Connection, SlotError> {
        Ok(self.pool.get().await?)
    }

    fn slot_key(slot_id: Uuid) -> String {
        format!("{}{}", SLOT_PREFIX, slot_id)
    }

    fn session_key(session_id: &str) -> String {
        format!("{}{}", SESSION_PREFIX, session_id)
    }

    async fn read_slot(conn: &mut Connection, slot_id: Uuid) -> Result<Option<Hold>, SlotError> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::slot_key(slot_id))
            .query_async(conn)
            .await?;
        raw.map(|json| serde_json::from_str::<StoredHold>(&json).map(StoredHold::into_hold))
            .transpose()
            .map_err(SlotError::from)
    }

    async fn release_script(&self, slot_id: Uuid, expired_before: Option<DateTime<Utc>>) -> Result<bool, SlotError> {
        let mut conn = self.connection().await?;
        let removed: i64 = Script::new(RELEASE)
            .key(Self::slot_key(slot_id))
            .arg(slot_id.to_string())
            .arg(if expired_before.is_some() { "1" } else { "0" })
            .arg(expired_before.map(|t| t.timestamp_millis()).unwrap_or_default())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }
}

#[async_trait]
impl HoldRepository for RedisHoldRepository {
    async fn acquire(&self, hold: Hold, now: DateTime<Utc>) -> Result<Option<Hold>, SlotError> {
        let mut conn = self.connection().await?;
        let record = serde_json::to_string(&StoredHold::from_hold(&hold))?;
        let ttl_ms = (hold.expires_at - now).num_milliseconds().max(1) + TTL_GRACE_MS;

        let blocking: Option<String> = Script::new(ACQUIRE)
            .key(Self::slot_key(hold.slot_id))
            .key(Self::session_key(&hold.session_id))
            .arg(&hold.session_id)
            .arg(hold.slot_id.to_string())
            .arg(record)
            .arg(now.timestamp_millis())
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        blocking
            .map(|json| serde_json::from_str::<StoredHold>(&json).map(StoredHold::into_hold))
            .transpose()
            .map_err(SlotError::from)
    }

    async fn release(&self, slot_id: Uuid) -> Result<bool, SlotError> {
        self.release_script(slot_id, None).await
    }

    async fn active_for_session(&self, session_id: &str, now: DateTime<Utc>) -> Result<Option<Hold>, SlotError> {
        let mut conn = self.connection().await?;
        let slot_id: Option<String> = redis::cmd("GET")
            .arg(Self::session_key(session_id))
            .query_async(&mut conn)
            .await?;
        let Some(slot_id) = slot_id.and_then(|raw| Uuid::parse_str(&raw).ok()) else {
            return Ok(None);
        };

        match Self::read_slot(&mut conn, slot_id).await? {
            Some(hold) if hold.session_id == session_id && !hold.is_expired(now) => Ok(Some(hold)),
            Some(hold) if hold.session_id == session_id => {
                drop(conn);
                self.release_script(slot_id, Some(now)).await?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn active_for_slot(&self, slot_id: Uuid, now: DateTime<Utc>) -> Result<Option<Hold>, SlotError> {
        let mut conn = self.connection().await?;
        match Self::read_slot(&mut conn, slot_id).await? {
            Some(hold) if !hold.is_expired(now) => Ok(Some(hold)),
            Some(_) => {
                drop(conn);
                self.release_script(slot_id, Some(now)).await?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, SlotError> {
        let mut conn = self.connection().await?;

        let mut slot_ids = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{}*", SLOT_PREFIX))
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            slot_ids.extend(
                keys.iter()
                    .filter_map(|key| key.strip_prefix(SLOT_PREFIX))
                    .filter_map(|raw| Uuid::parse_str(raw).ok()),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        drop(conn);

        let mut removed = 0;
        for slot_id in slot_ids {
            if self.release_script(slot_id, Some(now)).await? {
                removed += 1;
            }
        }
        debug!("Redis sweep removed {} holds", removed);
        Ok(removed)
    }

    async fn transfer(&self, from_session: &str, to_session: &str, now: DateTime<Utc>) -> Result<Option<Hold>, SlotError> {
        let mut conn = self.connection().await?;
        let moved: Option<String> = Script::new(TRANSFER)
            .key(Self::session_key(from_session))
            .key(Self::session_key(to_session))
            .arg(to_session)
            .arg(now.timestamp_millis())
            .arg(TTL_GRACE_MS)
            .invoke_async(&mut conn)
            .await?;

        moved
            .map(|json| serde_json::from_str::<StoredHold>(&json).map(StoredHold::into_hold))
            .transpose()
            .map_err(SlotError::from)
    }
}
