use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::session::Session;
use super::storage::KeyValueStore;

// Persisted entry names, one string each
const ACCESS_TOKEN_KEY: &str = "access_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";
const PRINCIPAL_KEY: &str = "username";
const EXPIRY_KEY: &str = "token_expiry";

/// Change listener, called synchronously with the session just written.
pub type Listener = Arc<dyn Fn(&Session) + Send + Sync>;

/// Owns the in-memory session and mirrors it to a durable medium.
///
/// Every `write`/`clear` persists first, then updates memory, then notifies
/// listeners in registration order before returning. A persistence failure
/// is logged and flagged but never fails the write: the in-memory copy is
/// authoritative for the rest of the process.
pub struct SessionStore {
    current: RwLock<Session>,
    backend: Arc<dyn KeyValueStore>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    // serializes write/clear so notifications never interleave
    write_lock: Mutex<()>,
    degraded: AtomicBool,
}

impl SessionStore {
    /// Empty store; nothing is read from `backend`.
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self::with_session(backend, Session::default())
    }

    /// Store initialized from whatever `backend` holds. A missing access
    /// token means logged out.
    pub fn restore(backend: Arc<dyn KeyValueStore>) -> Self {
        let session = match load_session(backend.as_ref()) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Failed to restore session, starting logged out");
                Session::default()
            }
        };
        debug!(
            authenticated = session.is_authenticated(),
            expires_at = ?session.expires_at,
            "Session restored"
        );
        Self::with_session(backend, session)
    }

    fn with_session(backend: Arc<dyn KeyValueStore>, session: Session) -> Self {
        Self {
            current: RwLock::new(session),
            backend,
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn read(&self) -> Session {
        self.current.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.current.read().access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.current.read().refresh_token.clone()
    }

    pub fn write(&self, session: Session) {
        self.update(|_| Some(session));
    }

    pub fn clear(&self) {
        self.update(|_| Some(Session::default()));
    }

    /// Compare-and-write: `f` sees the current session and returns the
    /// replacement, or `None` to leave the store untouched. No other write
    /// can slip in between the read and the write.
    pub fn update<F>(&self, f: F) -> Option<Session>
    where
        F: FnOnce(&Session) -> Option<Session>,
    {
        let _guard = self.write_lock.lock();
        let current = self.read();
        let session = f(&current)?;
        self.record_persist(persist_session(self.backend.as_ref(), &session));
        *self.current.write() = session.clone();
        self.notify(&session);
        Some(session)
    }

    /// Register a listener for every subsequent write/clear. Listeners must
    /// not write to the store themselves.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        Subscription {
            id,
            store: Arc::downgrade(self),
        }
    }

    /// Whether the last persistence attempt failed
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn record_persist(&self, result: Result<()>) {
        match result {
            Ok(()) => self.degraded.store(false, Ordering::SeqCst),
            Err(e) => {
                warn!(error = %e, "Failed to persist session, keeping it in memory only");
                self.degraded.store(true, Ordering::SeqCst);
            }
        }
    }

    fn notify(&self, session: &Session) {
        // Snapshot so a listener may subscribe or unsubscribe without deadlocking
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(session);
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.listeners.lock().retain(|(listener_id, _)| *listener_id != id);
    }
}

/// Handle returned by `SessionStore::subscribe`.
pub struct Subscription {
    id: u64,
    store: Weak<SessionStore>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(self.id);
        }
    }
}

fn load_session(backend: &dyn KeyValueStore) -> Result<Session> {
    let Some(access_token) = backend.get(ACCESS_TOKEN_KEY)? else {
        return Ok(Session::default());
    };

    let refresh_token = read_optional(backend, REFRESH_TOKEN_KEY);
    let principal = read_optional(backend, PRINCIPAL_KEY);
    let expires_at = read_optional(backend, EXPIRY_KEY).and_then(|raw| match parse_expiry(&raw) {
        Some(at) => Some(at),
        None => {
            warn!(value = %raw, "Ignoring unreadable token expiry");
            None
        }
    });

    Ok(Session {
        access_token: Some(access_token),
        refresh_token,
        expires_at,
        principal,
    })
}

fn read_optional(backend: &dyn KeyValueStore, key: &str) -> Option<String> {
    match backend.get(key) {
        Ok(value) => value,
        Err(e) => {
            warn!(key = key, error = %e, "Failed to read session entry");
            None
        }
    }
}

fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}

fn persist_session(backend: &dyn KeyValueStore, session: &Session) -> Result<()> {
    let expiry = session
        .expires_at
        .filter(|_| session.is_authenticated())
        .map(|at| at.timestamp_millis().to_string());

    persist_entry(backend, ACCESS_TOKEN_KEY, session.access_token.as_deref())?;
    persist_entry(backend, REFRESH_TOKEN_KEY, session.refresh_token.as_deref())?;
    persist_entry(backend, PRINCIPAL_KEY, session.principal.as_deref())?;
    persist_entry(backend, EXPIRY_KEY, expiry.as_deref())
}

fn persist_entry(backend: &dyn KeyValueStore, key: &str, value: Option<&str>) -> Result<()> {
    let result = match value {
        Some(value) => backend.set(key, value),
        None => backend.remove(key),
    };
    result.with_context(|| format!("Failed to persist {}", key))
}
