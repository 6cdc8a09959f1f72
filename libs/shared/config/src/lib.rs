use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Where slot and appointment records are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Supabase,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "supabase" => Ok(StorageBackend::Supabase),
            "memory" | "in_memory" | "in-memory" => Ok(StorageBackend::Memory),
            other => Err(format!("unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_service_role_key: String,
    pub supabase_jwt_secret: String,
    pub redis_url: Option<String>,
    pub storage_backend: StorageBackend,
    pub payment_webhook_secret: String,
    pub clinic_utc_offset_minutes: i32,
    pub hold_duration_minutes: i64,
    pub hold_sweep_interval_seconds: u64,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let supabase_url = env::var("SUPABASE_URL").unwrap_or_else(|_| {
            warn!("SUPABASE_URL not set, using empty value");
            String::new()
        });

        let storage_backend = match env::var("STORAGE_BACKEND") {
            Ok(raw) => raw.parse().unwrap_or_else(|e: String| {
                warn!("{}, falling back to in-memory storage", e);
                StorageBackend::Memory
            }),
            Err(_) if supabase_url.is_empty() => StorageBackend::Memory,
            Err(_) => StorageBackend::Supabase,
        };

        let config = Self {
            supabase_url,
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY").unwrap_or_else(|_| {
                warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                String::new()
            }),
            supabase_service_role_key: env::var("SUPABASE_SERVICE_ROLE_KEY").unwrap_or_else(|_| {
                warn!("SUPABASE_SERVICE_ROLE_KEY not set, using empty value");
                String::new()
            }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET").unwrap_or_else(|_| {
                warn!("SUPABASE_JWT_SECRET not set, using empty value");
                String::new()
            }),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            storage_backend,
            payment_webhook_secret: env::var("PAYMENT_WEBHOOK_SECRET").unwrap_or_else(|_| {
                warn!("PAYMENT_WEBHOOK_SECRET not set, payment webhooks will be rejected");
                String::new()
            }),
            clinic_utc_offset_minutes: parse_or("CLINIC_UTC_OFFSET_MINUTES", 120),
            hold_duration_minutes: parse_or("HOLD_DURATION_MINUTES", 15),
            hold_sweep_interval_seconds: parse_or("HOLD_SWEEP_INTERVAL_SECONDS", 60),
            port: parse_or("PORT", 3000),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_jwt_secret.is_empty()
            && (self.storage_backend == StorageBackend::Memory || self.is_supabase_configured())
    }

    pub fn is_supabase_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_service_role_key.is_empty()
    }

    pub fn is_webhook_configured(&self) -> bool {
        !self.payment_webhook_secret.is_empty()
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} is not valid ({}), using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}
