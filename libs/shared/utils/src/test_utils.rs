use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use shared_config::{AppConfig, StorageBackend};
use shared_models::auth::{Actor, ActorRole, User};

use crate::clock::Clock;
use crate::jwt::sign_token;

pub struct TestConfig {
    pub jwt_secret: String,
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub webhook_secret: String,
    pub storage_backend: StorageBackend,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "test-secret-key-for-jwt-validation-must-be-long-enough".to_string(),
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
            webhook_secret: "test-webhook-secret".to_string(),
            storage_backend: StorageBackend::Memory,
        }
    }
}

impl TestConfig {
    /// Points the Supabase backend at a mock server.
    pub fn with_supabase(url: &str) -> Self {
        Self {
            supabase_url: url.to_string(),
            storage_backend: StorageBackend::Supabase,
            ..Self::default()
        }
    }

    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            supabase_service_role_key: "test-service-role-key".to_string(),
            supabase_jwt_secret: self.jwt_secret.clone(),
            redis_url: None,
            storage_backend: self.storage_backend,
            payment_webhook_secret: self.webhook_secret.clone(),
            clinic_utc_offset_minutes: 120,
            hold_duration_minutes: 15,
            hold_sweep_interval_seconds: 60,
            port: 0,
        }
    }

    pub fn to_arc(&self) -> Arc<AppConfig> {
        Arc::new(self.to_app_config())
    }
}

pub struct TestUser {
    pub id: Uuid,
    pub email: String,
    pub role: String,
}

impl TestUser {
    pub fn new(email: &str, role: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.to_string(),
            role: role.to_string(),
        }
    }

    pub fn doctor(email: &str) -> Self {
        Self::new(email, "doctor")
    }

    pub fn patient(email: &str) -> Self {
        Self::new(email, "patient")
    }

    pub fn admin(email: &str) -> Self {
        Self::new(email, "admin")
    }

    pub fn to_user(&self) -> User {
        User {
            id: self.id.to_string(),
            email: Some(self.email.clone()),
            role: Some(self.role.clone()),
            metadata: None,
            created_at: Some(Utc::now()),
        }
    }

    pub fn actor(&self) -> Actor {
        let role = match self.role.as_str() {
            "admin" => ActorRole::Admin,
            "doctor" => ActorRole::Doctor,
            _ => ActorRole::Patient,
        };
        Actor::new(self.id, role)
    }
}

pub struct JwtTestUtils;

impl JwtTestUtils {
    pub fn create_test_token(user: &TestUser, secret: &str, exp_hours: Option<i64>) -> String {
        let now = Utc::now();
        let exp = now + Duration::hours(exp_hours.unwrap_or(24));

        let claims = json!({
            "sub": user.id.to_string(),
            "email": user.email,
            "role": "authenticated",
            "app_metadata": { "role": user.role },
            "iat": now.timestamp(),
            "exp": exp.timestamp().max(0)
        });

        sign_token(&claims, secret).unwrap_or_default()
    }

    pub fn create_expired_token(user: &TestUser, secret: &str) -> String {
        Self::create_test_token(user, secret, Some(-1))
    }

    pub fn bearer(user: &TestUser, secret: &str) -> String {
        format!("Bearer {}", Self::create_test_token(user, secret, None))
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    /// 2025-03-01 08:00 UTC.
    pub fn at_fixed_start() -> Self {
        Self::new(Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).single().unwrap_or_else(Utc::now))
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// PostgREST row fixtures for wiremock responses.
pub struct MockSupabaseResponses;

impl MockSupabaseResponses {
    pub fn slot_row(id: Uuid, doctor_id: Uuid, date: &str, start: &str, end: &str, available: bool) -> serde_json::Value {
        json!({
            "id": id,
            "doctor_id": doctor_id,
            "date": date,
            "start_time": start,
            "end_time": end,
            "is_available": available,
            "is_recurring": false,
            "recurring_end_date": null,
            "locked_by": null,
            "locked_until": null,
            "created_at": "2025-03-01T08:00:00Z"
        })
    }

    pub fn appointment_row(id: Uuid, patient_id: Uuid, doctor_id: Uuid, slot_id: Option<Uuid>, status: &str) -> serde_json::Value {
        json!({
            "id": id,
            "patient_id": patient_id,
            "doctor_id": doctor_id,
            "slot_id": slot_id,
            "appointment_date": "2025-03-10T07:00:00Z",
            "status": status,
            "reschedule_count": 0,
            "price": 35.0,
            "payment_reference": null,
            "cancel_reason": null,
            "cancelled_by": null,
            "created_at": "2025-03-01T08:00:00Z",
            "updated_at": "2025-03-01T08:00:00Z"
        })
    }

    pub fn error_response(message: &str, code: &str) -> serde_json::Value {
        json!({
            "message": message,
            "code": code
        })
    }
}
