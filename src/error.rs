use thiserror::Error;

/// The signaling relay could not be reached or the link dropped.
/// Recoverable: the caller may retry `join`.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay unavailable: {reason}")]
    Unavailable { reason: String },
}

impl RelayError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Local capture acquisition failed. Surfaced to the caller so the user can
/// retry or adjust permissions; never touches already-active media.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media acquisition denied: {reason}")]
    Denied { reason: String },
    #[error("media unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Anomalies in the signaling flow. `Stale` and `Glare` are absorbed by the
/// dispatch loop after logging; `Transport` degrades the affected session
/// only. Nothing here is fatal to the process.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("stale signal for chat {chat_id}: {reason}")]
    Stale {
        chat_id: String,
        reason: &'static str,
    },
    #[error("offer glare in chat {chat_id}: local {local_id} outranks remote {remote_id}")]
    Glare {
        chat_id: String,
        local_id: String,
        remote_id: String,
    },
    #[error("peer transport: {0}")]
    Transport(String),
}

impl SignalError {
    pub fn stale(chat_id: impl Into<String>, reason: &'static str) -> Self {
        Self::Stale {
            chat_id: chat_id.into(),
            reason,
        }
    }

    /// True for anomalies the dispatch loop logs and swallows.
    pub fn is_absorbed(&self) -> bool {
        matches!(self, Self::Stale { .. } | Self::Glare { .. })
    }
}
