//! Shared test helpers - available to all `#[cfg(test)]` modules in the crate.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::sync::Semaphore;

use crate::api::{
    ApiError, ApiRequest, ApiResponse, IdentityProvider, RegisterOutcome, Registration,
    TokenResponse, Transport, UserProfile,
};
use crate::auth::{KeyValueStore, Session};

/// Token lifetime the fakes hand out, in seconds
pub const TOKEN_LIFETIME_SECS: i64 = 3600;

/// Password the fake identity service refuses
pub const WRONG_PASSWORD: &str = "wrong";

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// An authenticated session for "alice", valid for an hour.
pub fn sample_session(access: &str, refresh: &str) -> Session {
    Session {
        access_token: Some(access.to_string()),
        refresh_token: Some(refresh.to_string()),
        expires_at: Some(Utc::now() + Duration::seconds(TOKEN_LIFETIME_SECS)),
        principal: Some("alice".to_string()),
    }
}

pub fn tokens_lasting(access: &str, refresh: &str, expires_in: i64) -> TokenResponse {
    TokenResponse {
        access_token: access.to_string(),
        refresh_token: Some(refresh.to_string()),
        expires_in,
        token_type: "bearer".to_string(),
    }
}

/// Durable medium that is always unavailable.
pub struct FailingStorage;

impl KeyValueStore for FailingStorage {
    fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(anyhow!("storage unavailable"))
    }

    fn set(&self, _key: &str, _value: &str) -> Result<()> {
        Err(anyhow!("storage unavailable"))
    }

    fn remove(&self, _key: &str) -> Result<()> {
        Err(anyhow!("storage unavailable"))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RefreshScript {
    /// Issue `A{n+1}`/`R{n+1}` on the n-th refresh
    Issue,
    /// 401 - the refresh token is no good
    Reject,
    /// 503 - the service is down
    Unavailable,
}

#[derive(Debug, Clone, Copy)]
pub enum RegisterScript {
    Issue,
    Profile,
}

/// In-process identity service. Login always issues `A1`/`R1`.
pub struct FakeIdentity {
    refresh_script: RefreshScript,
    register_script: RegisterScript,
    lifetime_secs: i64,
    gate: Option<Semaphore>,
    login_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    refresh_seen: Mutex<Vec<String>>,
}

impl FakeIdentity {
    pub fn new() -> Self {
        Self {
            refresh_script: RefreshScript::Issue,
            register_script: RegisterScript::Issue,
            lifetime_secs: TOKEN_LIFETIME_SECS,
            gate: None,
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            refresh_seen: Mutex::new(Vec::new()),
        }
    }

    /// Refresh calls block until `release_refresh` is called.
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    pub fn with_refresh(mut self, script: RefreshScript) -> Self {
        self.refresh_script = script;
        self
    }

    pub fn with_register(mut self, script: RegisterScript) -> Self {
        self.register_script = script;
        self
    }

    /// `expires_in` of every token response
    pub fn with_lifetime(mut self, secs: i64) -> Self {
        self.lifetime_secs = secs;
        self
    }

    pub fn release_refresh(&self) {
        if let Some(ref gate) = self.gate {
            gate.add_permits(1);
        }
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_tokens_seen(&self) -> Vec<String> {
        self.refresh_seen.lock().clone()
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn login(&self, _username: &str, password: &str) -> Result<TokenResponse, ApiError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if password == WRONG_PASSWORD {
            return Err(ApiError::Unauthorized);
        }
        Ok(tokens_lasting("A1", "R1", self.lifetime_secs))
    }

    async fn register(&self, registration: &Registration) -> Result<RegisterOutcome, ApiError> {
        match self.register_script {
            RegisterScript::Issue => {
                Ok(RegisterOutcome::Issued(tokens_lasting("A1", "R1", self.lifetime_secs)))
            }
            RegisterScript::Profile => Ok(RegisterOutcome::Created(UserProfile {
                user_id: "8f14e45f-ceea-467f-a0f6-0d1b7e3f1a11".to_string(),
                username: registration.username.clone(),
                email: registration.email.clone(),
                default_work_environment: None,
                focus_times: Vec::new(),
                timezone: None,
                created_at: None,
                updated_at: None,
            })),
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ApiError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.refresh_seen.lock().push(refresh_token.to_string());

        if let Some(ref gate) = self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        match self.refresh_script {
            RefreshScript::Issue => Ok(tokens_lasting(
                &format!("A{}", n + 1),
                &format!("R{}", n + 1),
                self.lifetime_secs,
            )),
            RefreshScript::Reject => Err(ApiError::Unauthorized),
            RefreshScript::Unavailable => {
                Err(ApiError::ServerError("Service Unavailable".to_string()))
            }
        }
    }
}

/// In-process business API that accepts a configurable set of bearer tokens.
pub struct FakeTransport {
    accepted: Mutex<HashSet<String>>,
    sent: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeTransport {
    pub fn accepting(tokens: &[&str]) -> Self {
        Self {
            accepted: Mutex::new(tokens.iter().map(|t| t.to_string()).collect()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Every request as (path, bearer token) in send order
    pub fn sent(&self) -> Vec<(String, Option<String>)> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse, ApiError> {
        self.sent
            .lock()
            .push((request.path.clone(), bearer.map(str::to_string)));

        if request.path == "/unreachable" {
            return Err(ApiError::ServerError("Bad Gateway".to_string()));
        }

        let authorized = bearer
            .map(|token| self.accepted.lock().contains(token))
            .unwrap_or(false);
        if request.path == "/auth/me" && authorized {
            let username = request
                .body
                .as_ref()
                .and_then(|body| body.get("username"))
                .and_then(|name| name.as_str())
                .unwrap_or("alice");
            let profile = serde_json::json!({
                "user_id": "8f14e45f-ceea-467f-a0f6-0d1b7e3f1a11",
                "username": username,
                "email": "alice@example.com",
                "timezone": "UTC",
            });
            return Ok(ApiResponse::new(StatusCode::OK, profile.to_string()));
        }

        if request.path.starts_with("/public") || authorized {
            let body = serde_json::json!({
                "path": request.path,
                "token": bearer,
                "echo": request.body,
            });
            Ok(ApiResponse::new(StatusCode::OK, body.to_string()))
        } else {
            Ok(ApiResponse::new(
                StatusCode::UNAUTHORIZED,
                r#"{"detail":"Not authenticated"}"#,
            ))
        }
    }
}
