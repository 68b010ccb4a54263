use serde::Serialize;

/// Notifications for the hosting application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    LoggedIn { principal: String },
    /// A renewal stored fresh credentials
    Renewed,
    /// The session is gone; the host should navigate to its login entry point
    LoggedOut { reason: LogoutReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum LogoutReason {
    UserRequested,
    RenewalFailed,
}
