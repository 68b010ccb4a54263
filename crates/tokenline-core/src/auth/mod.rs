//! Session lifecycle: storage, renewal and the controller that ties them together.
//!
//! This module provides:
//! - `SessionStore`: the single source of truth for the current tokens, persisted
//!   through a `KeyValueStore` backend (memory, file or OS keyring)
//! - `RenewalCoordinator`: at most one refresh call in flight, shared by every caller
//! - `RenewalScheduler`: renews shortly before the access token expires
//! - `SessionController`: login, register and logout for the hosting application

pub mod controller;
pub mod coordinator;
pub mod credentials;
pub mod events;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod store;

pub use controller::SessionController;
pub use coordinator::{PendingRenewal, RenewalCoordinator, RenewalError};
pub use credentials::KeyringStorage;
pub use events::{LogoutReason, SessionEvent};
pub use scheduler::{renewal_delay, RenewalScheduler};
pub use session::Session;
pub use storage::{FileStorage, KeyValueStore, MemoryStorage};
pub use store::{SessionStore, Subscription};
