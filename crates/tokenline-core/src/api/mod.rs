//! Remote operations consumed by the session core.
//!
//! This module provides:
//! - `IdentityProvider`: the issue/renew credential operations
//! - `Transport`: the wire for authenticated business calls
//! - `HttpClient`: the reqwest-backed implementation of both
//!
//! The service uses bearer token authentication; tokens are issued by
//! `/auth/login` and `/auth/register` and renewed by `/auth/refresh`.

pub mod client;
pub mod error;
pub mod types;

use async_trait::async_trait;

pub use client::HttpClient;
pub use error::ApiError;
pub use types::{
    ApiRequest, ApiResponse, ProfileUpdate, RegisterOutcome, Registration, TokenResponse,
    UserProfile,
};

/// Credential issuing side of the identity service.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `POST /auth/login`
    async fn login(&self, username: &str, password: &str) -> Result<TokenResponse, ApiError>;

    /// `POST /auth/register`
    async fn register(&self, registration: &Registration) -> Result<RegisterOutcome, ApiError>;

    /// `POST /auth/refresh`
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ApiError>;
}

/// Sends one business call. Non-success statuses come back as `Ok`; the
/// pipeline decides what an authorization failure means.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse, ApiError>;
}
