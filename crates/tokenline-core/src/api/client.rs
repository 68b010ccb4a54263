//! HTTP client for the identity service and authenticated business calls.
//!
//! This module provides the `HttpClient` struct, which implements both
//! `IdentityProvider` and `Transport` over a single reqwest connection pool.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::{
    ApiError, ApiRequest, ApiResponse, IdentityProvider, RegisterOutcome, Registration,
    TokenResponse, Transport,
};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

const LOGIN_PATH: &str = "/auth/login";
const REGISTER_PATH: &str = "/auth/register";
const REFRESH_PATH: &str = "/auth/refresh";

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Client for the identity service and the business API behind it.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
}

impl HttpClient {
    /// Create a new client rooted at `base_url` (e.g. `http://localhost:8000/api/v1`)
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Send a request, backing off and resending while the server answers 429.
    /// `build` is called once per attempt since a RequestBuilder is consumed by `send`.
    async fn send_with_backoff<F>(&self, url: &str, build: F) -> Result<Response, ApiError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build().send().await?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2; // Exponential backoff
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn parse<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, ApiError> {
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse {} response: {}", what, e)))
    }
}

#[async_trait]
impl IdentityProvider for HttpClient {
    async fn login(&self, username: &str, password: &str) -> Result<TokenResponse, ApiError> {
        let url = self.url(LOGIN_PATH);
        debug!(username = username, "Requesting credentials");

        let response = self
            .send_with_backoff(&url, || {
                self.client
                    .post(&url)
                    .header(header::ACCEPT, "application/json")
                    .form(&[("username", username), ("password", password)])
            })
            .await?;

        let response = Self::check_response(response).await?;
        Self::parse(response, "login").await
    }

    async fn register(&self, registration: &Registration) -> Result<RegisterOutcome, ApiError> {
        let url = self.url(REGISTER_PATH);
        debug!(username = %registration.username, "Registering account");

        let response = self
            .send_with_backoff(&url, || self.client.post(&url).json(registration))
            .await?;

        let response = Self::check_response(response).await?;
        Self::parse(response, "register").await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ApiError> {
        let url = self.url(REFRESH_PATH);
        let body = RefreshRequest { refresh_token };

        let response = self
            .send_with_backoff(&url, || self.client.post(&url).json(&body))
            .await?;

        let response = Self::check_response(response).await?;
        Self::parse(response, "refresh").await
    }
}

#[async_trait]
impl Transport for HttpClient {
    async fn send(&self, request: &ApiRequest, bearer: Option<&str>) -> Result<ApiResponse, ApiError> {
        let url = self.url(&request.path);

        let response = self
            .send_with_backoff(&url, || {
                let mut builder = self
                    .client
                    .request(request.method.clone(), &url)
                    .header(header::ACCEPT, "application/json");
                if let Some(token) = bearer {
                    builder = builder.bearer_auth(token);
                }
                if let Some(ref body) = request.body {
                    builder = builder.json(body);
                }
                builder
            })
            .await?;

        let status = response.status();
        let body = response.text().await?;
        debug!(method = %request.method, url = %url, status = status.as_u16(), "Response received");
        Ok(ApiResponse::new(status, body))
    }
}
