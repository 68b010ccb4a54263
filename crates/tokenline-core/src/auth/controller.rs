//! The session facade the rest of the application talks to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::coordinator::{FailureHook, RenewalCoordinator};
use super::events::{LogoutReason, SessionEvent};
use super::scheduler::RenewalScheduler;
use super::session::Session;
use super::store::{SessionStore, Subscription};
use crate::api::{
    ApiError, ApiRequest, ApiResponse, HttpClient, IdentityProvider, ProfileUpdate,
    RegisterOutcome, Registration, TokenResponse, Transport, UserProfile,
};
use crate::config::Config;
use crate::pipeline::RequestPipeline;

/// Buffer size for the session event channel.
const EVENT_CHANNEL_CAPACITY: usize = 32;

const PROFILE_PATH: &str = "/auth/me";

/// Owns the session store, renewal machinery and request pipeline, and
/// wires them together: every store write re-arms the proactive renewal,
/// and a renewal that ends the session logs out.
pub struct SessionController {
    store: Arc<SessionStore>,
    provider: Arc<dyn IdentityProvider>,
    scheduler: Arc<RenewalScheduler>,
    pipeline: RequestPipeline,
    events: broadcast::Sender<SessionEvent>,
    // whether a logout would still have something to end
    active: AtomicBool,
    subscription: Mutex<Option<Subscription>>,
}

impl SessionController {
    /// Build a controller around an existing store. A restored session is
    /// scheduled for proactive renewal right away.
    pub fn new(
        store: Arc<SessionStore>,
        provider: Arc<dyn IdentityProvider>,
        transport: Arc<dyn Transport>,
        renewal_lead: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let controller = Arc::new_cyclic(|this: &Weak<Self>| {
            let this = this.clone();
            let on_failure: FailureHook = Arc::new(move || {
                if let Some(controller) = this.upgrade() {
                    controller.end_session(LogoutReason::RenewalFailed);
                }
            });

            let coordinator = Arc::new(RenewalCoordinator::new(
                Arc::clone(&store),
                Arc::clone(&provider),
                events.clone(),
                on_failure,
            ));
            let scheduler = Arc::new(RenewalScheduler::new(renewal_lead, Arc::clone(&coordinator)));
            let pipeline = RequestPipeline::new(Arc::clone(&store), Arc::clone(&coordinator), transport);

            let rearm = Arc::downgrade(&scheduler);
            let subscription = store.subscribe(move |session: &Session| {
                let Some(scheduler) = rearm.upgrade() else {
                    return;
                };
                if session.expires_at.is_some() {
                    scheduler.arm(session);
                } else {
                    scheduler.disarm();
                }
            });

            Self {
                active: AtomicBool::new(store.read().is_authenticated()),
                store,
                provider,
                scheduler,
                pipeline,
                events,
                subscription: Mutex::new(Some(subscription)),
            }
        });

        let session = controller.store.read();
        if session.is_authenticated() {
            debug!(principal = ?session.principal, "Resuming restored session");
            controller.scheduler.arm(&session);
        }
        controller
    }

    /// Controller talking to the configured service, with the session
    /// restored from the configured storage backend.
    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        let client = Arc::new(HttpClient::new(&config.base_url, config.request_timeout())?);
        let store = Arc::new(SessionStore::restore(config.storage_backend()?));
        Ok(Self::new(store, client.clone(), client, config.renewal_lead()))
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(), ApiError> {
        let tokens = self.provider.login(username, password).await?;
        self.start_session(username, tokens)
    }

    /// Create an account and sign in to it.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<(), ApiError> {
        let registration = Registration::new(username, email, password);
        registration.validate()?;

        match self.provider.register(&registration).await? {
            RegisterOutcome::Issued(tokens) => self.start_session(username, tokens),
            RegisterOutcome::Created(profile) => {
                debug!(user_id = %profile.user_id, "Account created, logging in");
                self.login(username, password).await
            }
        }
    }

    /// End the session. Calling it while logged out does nothing.
    pub fn logout(&self) {
        self.end_session(LogoutReason::UserRequested);
    }

    pub fn current_principal(&self) -> Option<String> {
        self.store.read().principal
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.read().is_authenticated()
    }

    pub fn access_token(&self) -> Option<String> {
        self.store.access_token()
    }

    pub fn session(&self) -> Session {
        self.store.read()
    }

    /// Events for the hosting application; `LoggedOut` means navigate to login.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    /// Perform an authenticated call
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.pipeline.execute(request).await
    }

    /// `GET /auth/me`
    pub async fn fetch_profile(&self) -> Result<UserProfile, ApiError> {
        self.pipeline.get(PROFILE_PATH).await
    }

    /// `PUT /auth/me`. A changed username becomes the session principal.
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile, ApiError> {
        let profile: UserProfile = self.pipeline.put(PROFILE_PATH, update).await?;
        self.store.update(|current| {
            (current.is_authenticated()
                && current.principal.as_deref() != Some(profile.username.as_str()))
            .then(|| Session {
                principal: Some(profile.username.clone()),
                ..current.clone()
            })
        });
        Ok(profile)
    }

    fn start_session(&self, principal: &str, tokens: TokenResponse) -> Result<(), ApiError> {
        let expires_at = tokens.expires_at(Utc::now())?;
        self.store.write(Session::issued(principal, tokens, expires_at));
        self.active.store(true, Ordering::SeqCst);
        info!(principal = principal, "Logged in");
        let _ = self.events.send(SessionEvent::LoggedIn {
            principal: principal.to_string(),
        });
        Ok(())
    }

    fn end_session(&self, reason: LogoutReason) {
        if !self.active.swap(false, Ordering::SeqCst) {
            debug!(?reason, "Already logged out");
            return;
        }
        self.store.clear();
        self.scheduler.disarm();
        info!(?reason, "Logged out");
        let _ = self.events.send(SessionEvent::LoggedOut { reason });
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
        self.scheduler.disarm();
    }
}
