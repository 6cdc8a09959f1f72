use anyhow::Result;
use reqwest::{
    Client,
    header::{HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION},
    Method,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};

use shared_config::AppConfig;

/// Failure classes callers need to tell apart after a PostgREST call.
#[derive(Error, Debug)]
pub enum SupabaseError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Unique or exclusion constraint violation (HTTP 409 / SQLSTATE 23505).
    #[error("Constraint violation: {0}")]
    Conflict(String),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Invalid header value: {0}")]
    InvalidHeader(String),
}

pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
    service_role_key: String,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.clone(),
            anon_key: config.supabase_anon_key.clone(),
            service_role_key: config.supabase_service_role_key.clone(),
        }
    }

    /// Token used for server-side writes that must bypass row level security.
    pub fn service_token(&self) -> &str {
        &self.service_role_key
    }

    fn get_headers(&self, auth_token: Option<&str>) -> Result<HeaderMap, SupabaseError> {
        let mut headers = HeaderMap::new();

        headers.insert(
            "apikey",
            HeaderValue::from_str(&self.anon_key)
                .map_err(|e| SupabaseError::InvalidHeader(e.to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = auth_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| SupabaseError::InvalidHeader(e.to_string()))?,
            );
        }

        Ok(headers)
    }

    pub async fn request<T>(&self, method: Method, path: &str,
                            auth_token: Option<&str>, body: Option<Value>)
                            -> Result<T>
    where T: DeserializeOwned {
        self.request_with_headers(method, path, auth_token, body, None).await
    }

    pub async fn request_with_headers<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
        extra_headers: Option<HeaderMap>,
    ) -> Result<T>
    where T: DeserializeOwned {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making {} request to {}", method, url);

        let mut headers = self.get_headers(auth_token)?;
        if let Some(extra) = extra_headers {
            headers.extend(extra);
        }

        let mut req = self.client.request(method, &url)
            .headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!("API error ({}): {}", status, error_text);

            let err = match status.as_u16() {
                401 | 403 => SupabaseError::Auth(error_text),
                404 => SupabaseError::NotFound(error_text),
                409 => SupabaseError::Conflict(error_text),
                code => SupabaseError::Api { status: code, body: error_text },
            };
            return Err(err.into());
        }

        // PostgREST answers 204 with an empty body when no representation is requested
        let bytes = response.bytes().await?;
        let data = if bytes.is_empty() {
            serde_json::from_value::<T>(Value::Null)?
        } else {
            serde_json::from_slice::<T>(&bytes)?
        };
        Ok(data)
    }

    /// Headers asking PostgREST to echo the affected rows back.
    pub fn representation_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));
        headers
    }

    pub fn get_base_url(&self) -> &str {
        &self.base_url
    }
}

/// True when an error returned by [`SupabaseClient`] is a constraint violation.
pub fn is_conflict(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<SupabaseError>(), Some(SupabaseError::Conflict(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> AppConfig {
        AppConfig {
            supabase_url: server.uri(),
            supabase_anon_key: "anon".to_string(),
            supabase_service_role_key: "service".to_string(),
            supabase_jwt_secret: "secret".to_string(),
            redis_url: None,
            storage_backend: shared_config::StorageBackend::Supabase,
            payment_webhook_secret: String::new(),
            clinic_utc_offset_minutes: 0,
            hold_duration_minutes: 15,
            hold_sweep_interval_seconds: 60,
            port: 3000,
        }
    }

    #[tokio::test]
    async fn conflict_status_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/doctor_time_slots"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({"code": "23505"})))
            .mount(&server)
            .await;

        let client = SupabaseClient::new(&config_for(&server));
        let err = client
            .request::<Value>(Method::POST, "/rest/v1/doctor_time_slots", Some("service"), Some(json!({})))
            .await
            .unwrap_err();

        assert!(is_conflict(&err));
        assert_matches!(err.downcast_ref::<SupabaseError>(), Some(SupabaseError::Conflict(_)));
    }

    #[tokio::test]
    async fn sends_api_key_and_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/appointments"))
            .and(header("apikey", "anon"))
            .and(header("authorization", "Bearer service"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = SupabaseClient::new(&config_for(&server));
        let rows: Vec<Value> = client
            .request(Method::GET, "/rest/v1/appointments", Some(client.service_token()), None)
            .await
            .unwrap();

        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn empty_body_deserializes_as_unit() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/doctor_time_slots"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = SupabaseClient::new(&config_for(&server));
        let result: Option<Value> = client
            .request(Method::DELETE, "/rest/v1/doctor_time_slots", Some("service"), None)
            .await
            .unwrap();

        assert!(result.is_none());
    }
}
