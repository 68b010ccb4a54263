//! Wire types exchanged with the identity service and business endpoints.

use chrono::{DateTime, Duration, Utc};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ApiError;

/// Username length limits enforced by the identity service
const USERNAME_MIN_LENGTH: usize = 3;
const USERNAME_MAX_LENGTH: usize = 50;

/// Minimum password length enforced by the identity service
const PASSWORD_MIN_LENGTH: usize = 8;

/// Credentials issued by `/auth/login`, `/auth/register` and `/auth/refresh`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Absent on some renewal responses; the previous refresh token stays valid then
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

impl TokenResponse {
    /// When the issued access token stops being valid. A lifetime that does
    /// not fit a timestamp is a malformed response.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ApiError> {
        Duration::try_seconds(self.expires_in)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| {
                ApiError::InvalidResponse(format!("expires_in out of range: {}", self.expires_in))
            })
    }
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// Body of `POST /auth/register`
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl Registration {
    pub fn new(username: &str, email: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        }
    }

    /// Apply the same field rules the service enforces, so obviously bad
    /// input never costs a round trip.
    pub fn validate(&self) -> Result<(), ApiError> {
        let len = self.username.chars().count();
        if !(USERNAME_MIN_LENGTH..=USERNAME_MAX_LENGTH).contains(&len) {
            return Err(ApiError::Validation(format!(
                "Username must be {}-{} characters",
                USERNAME_MIN_LENGTH, USERNAME_MAX_LENGTH
            )));
        }
        if !is_plausible_email(&self.email) {
            return Err(ApiError::Validation("Valid email address required".to_string()));
        }
        if self.password.chars().count() < PASSWORD_MIN_LENGTH {
            return Err(ApiError::Validation(format!(
                "Password must be at least {} characters",
                PASSWORD_MIN_LENGTH
            )));
        }
        Ok(())
    }
}

fn is_plausible_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .map(|(host, tld)| !host.is_empty() && !tld.is_empty())
            .unwrap_or(false)
}

/// The register endpoint either issues credentials directly or answers with
/// the created account, in which case the client logs in afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RegisterOutcome {
    Issued(TokenResponse),
    Created(UserProfile),
}

/// Account returned by `GET /auth/me` and `POST /auth/register`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub default_work_environment: Option<String>,
    #[serde(default)]
    pub focus_times: Vec<serde_json::Value>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Body of `PUT /auth/me`; unset fields are left untouched server side
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_work_environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus_times: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// An outbound business call, relative to the configured base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    /// Set once the pipeline has renewed and resent this request
    pub retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_json<B: Serialize>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Unserializable request body: {}", e)))?;
        self.body = Some(value);
        Ok(self)
    }
}

/// Raw response of a business call, before status interpretation.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    /// Turn a non-success status into the matching `ApiError`
    pub fn error_for_status(self) -> Result<Self, ApiError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(ApiError::from_status(self.status, &self.body))
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e)))
    }
}
