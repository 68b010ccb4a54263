use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::coordinator::RenewalCoordinator;
use super::session::Session;

/// Shortest wait before a proactive renewal. Tokens that live no longer
/// than the lead would otherwise renew back to back.
pub const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(5);

/// Delay until a proactive renewal should fire: `lead` before `expires_at`,
/// or right away when that moment has already passed.
pub fn renewal_delay(expires_at: DateTime<Utc>, now: DateTime<Utc>, lead: Duration) -> Duration {
    chrono::Duration::from_std(lead)
        .ok()
        .and_then(|lead| expires_at.checked_sub_signed(lead))
        .and_then(|fire_at| (fire_at - now).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

/// Keeps exactly one pending proactive renewal per session.
pub struct RenewalScheduler {
    lead: Duration,
    coordinator: Arc<RenewalCoordinator>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl RenewalScheduler {
    pub fn new(lead: Duration, coordinator: Arc<RenewalCoordinator>) -> Self {
        Self {
            lead,
            coordinator,
            pending: Mutex::new(None),
        }
    }

    /// Schedule a renewal `lead` before the session expires, but no sooner
    /// than `MIN_RENEWAL_DELAY`, replacing any previously scheduled one.
    /// Without an expiry there is nothing to do.
    pub fn arm(&self, session: &Session) {
        let Some(expires_at) = session.expires_at else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, proactive renewal not scheduled");
            return;
        };

        let mut delay = renewal_delay(expires_at, Utc::now(), self.lead);
        if delay < MIN_RENEWAL_DELAY {
            warn!(
                delay_ms = delay.as_millis() as u64,
                floor_secs = MIN_RENEWAL_DELAY.as_secs(),
                "Token expires within the renewal lead, delaying proactive renewal"
            );
            delay = MIN_RENEWAL_DELAY;
        }
        let deadline = Instant::now() + delay;
        debug!(delay_secs = delay.as_secs(), "Proactive renewal scheduled");

        let coordinator = Arc::clone(&self.coordinator);
        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            debug!("Proactive renewal firing");
            // the coordinator records the outcome itself
            let _ = coordinator.renew_now().await;
        });

        if let Some(previous) = self.pending.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn disarm(&self) {
        if let Some(pending) = self.pending.lock().take() {
            debug!("Proactive renewal cancelled");
            pending.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for RenewalScheduler {
    fn drop(&mut self) {
        self.disarm();
    }
}
