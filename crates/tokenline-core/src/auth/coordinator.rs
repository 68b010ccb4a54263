//! Single-flight access token renewal.
//!
//! However many callers ask for a renewal while one is underway, exactly one
//! `/auth/refresh` call is made and every caller receives its outcome. The
//! renewal runs in its own task, so it settles even if every caller has gone
//! away. The coordinator is back to idle before any caller sees the outcome,
//! which means a caller arriving right after settlement starts a new renewal.

use std::sync::Arc;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use super::events::SessionEvent;
use super::store::SessionStore;
use crate::api::{ApiError, IdentityProvider};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenewalError {
    #[error("No refresh token available")]
    MissingRefreshToken,

    #[error("Refresh token rejected by the identity service")]
    Rejected,

    #[error("Renewal failed: {0}")]
    Transport(String),

    #[error("Session changed while the renewal was in flight")]
    Superseded,

    #[error("Renewal task ended without an outcome")]
    Abandoned,
}

impl RenewalError {
    fn from_api(error: &ApiError) -> Self {
        match error {
            ApiError::Unauthorized | ApiError::AccessDenied(_) | ApiError::Validation(_) => {
                RenewalError::Rejected
            }
            other => RenewalError::Transport(other.to_string()),
        }
    }
}

pub type RenewalOutcome = Result<String, RenewalError>;

/// The outcome every concurrent caller shares; resolves to the new access token.
pub type PendingRenewal = Shared<BoxFuture<'static, RenewalOutcome>>;

/// Invoked once per renewal that ended the session.
pub type FailureHook = Arc<dyn Fn() + Send + Sync>;

pub struct RenewalCoordinator {
    store: Arc<SessionStore>,
    provider: Arc<dyn IdentityProvider>,
    events: broadcast::Sender<SessionEvent>,
    on_failure: FailureHook,
    // Some while a renewal is in flight
    in_flight: Mutex<Option<PendingRenewal>>,
}

impl RenewalCoordinator {
    pub fn new(
        store: Arc<SessionStore>,
        provider: Arc<dyn IdentityProvider>,
        events: broadcast::Sender<SessionEvent>,
        on_failure: FailureHook,
    ) -> Self {
        Self {
            store,
            provider,
            events,
            on_failure,
            in_flight: Mutex::new(None),
        }
    }

    pub fn is_renewing(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Join the in-flight renewal, or start one. Must be called from within
    /// a tokio runtime.
    pub fn renew_now(self: &Arc<Self>) -> PendingRenewal {
        let mut slot = self.in_flight.lock();
        if let Some(pending) = slot.as_ref() {
            debug!("Joining in-flight renewal");
            return pending.clone();
        }

        let (tx, rx) = oneshot::channel();
        let pending = async move { rx.await.unwrap_or(Err(RenewalError::Abandoned)) }
            .boxed()
            .shared();
        *slot = Some(pending.clone());
        drop(slot);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            // back to idle even if the renewal panics
            let slot = SlotGuard(&this.in_flight);
            let (outcome, ended_session) = this.renew().await;
            drop(slot);

            // the logout cascade has run by the time any waiter settles
            match &outcome {
                Ok(_) => {
                    let _ = this.events.send(SessionEvent::Renewed);
                }
                Err(e) if ended_session => {
                    warn!(error = %e, "Renewal failed, ending session");
                    (this.on_failure)();
                }
                Err(e) => debug!(error = %e, "Renewal did not complete"),
            }
            let _ = tx.send(outcome);
        });

        pending
    }

    /// One renewal attempt. The flag says whether this attempt cleared the session.
    async fn renew(&self) -> (RenewalOutcome, bool) {
        let Some(refresh_token) = self.store.refresh_token() else {
            warn!("Renewal requested without a refresh token");
            return (Err(RenewalError::MissingRefreshToken), false);
        };

        info!("Renewing access token");
        let refreshed = self.provider.refresh(&refresh_token).await.and_then(|tokens| {
            let expires_at = tokens.expires_at(Utc::now())?;
            Ok((tokens, expires_at))
        });
        match refreshed {
            Ok((tokens, expires_at)) => {
                let access_token = tokens.access_token.clone();
                let written = self.store.update(|current| {
                    (current.refresh_token.as_deref() == Some(refresh_token.as_str()))
                        .then(|| current.renewed(tokens, expires_at))
                });
                if written.is_some() {
                    info!("Access token renewed");
                    return (Ok(access_token), false);
                }

                // Logged out or logged in again meanwhile; whatever is current wins
                warn!("Session changed during renewal, discarding renewed credentials");
                let outcome = self.store.access_token().ok_or(RenewalError::Superseded);
                (outcome, false)
            }
            Err(e) => {
                warn!(error = %e, "Refresh request failed");
                let cleared = self
                    .store
                    .update(|current| {
                        (current.refresh_token.as_deref() == Some(refresh_token.as_str()))
                            .then(Default::default)
                    })
                    .is_some();
                (Err(RenewalError::from_api(&e)), cleared)
            }
        }
    }
}

/// Empties the in-flight slot when dropped.
struct SlotGuard<'a>(&'a Mutex<Option<PendingRenewal>>);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}
