//! Client-side session core for token-authenticated HTTP services.
//!
//! Keeps a user signed in: the current access and refresh tokens live in a
//! persisted `SessionStore`, access tokens are renewed shortly before they
//! expire, and a request rejected with 401 is renewed and retried once.
//! Concurrent renewals collapse into a single refresh call.

pub mod api;
pub mod auth;
pub mod config;
pub mod pipeline;

#[cfg(test)]
mod testutil;

pub use api::{ApiError, ApiRequest, ApiResponse, HttpClient, IdentityProvider, Transport};
pub use auth::{LogoutReason, Session, SessionController, SessionEvent, SessionStore};
pub use config::{Config, StorageKind};
pub use pipeline::RequestPipeline;
