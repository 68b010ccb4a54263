use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::api::TokenResponse;

/// The authenticated session: the only state that is persisted.
///
/// `access_token` present means authenticated. `expires_at` is only ever
/// set together with an access token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub principal: Option<String>,
}

impl Session {
    /// Session created by a successful login or registration
    pub fn issued(principal: &str, tokens: TokenResponse, expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at: Some(expires_at),
            access_token: Some(tokens.access_token),
            refresh_token: tokens.refresh_token,
            principal: Some(principal.to_string()),
        }
    }

    /// Session after a successful renewal. The principal carries over, and so
    /// does the refresh token when the service did not rotate it.
    pub fn renewed(&self, tokens: TokenResponse, expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at: Some(expires_at),
            access_token: Some(tokens.access_token),
            refresh_token: tokens.refresh_token.or_else(|| self.refresh_token.clone()),
            principal: self.principal.clone(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at.map(|at| at - now)
    }
}
