use thiserror::Error;

use vigil_shared::ProtocolError;
use vigil_store::StoreError;

/// Failures reported by a backend port.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),
}

/// Everything the synchronization core reports through its error hook.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Initial page failed to load: {0}")]
    InitialPage(BackendError),

    #[error("Older page failed to load: {0}")]
    OlderPage(BackendError),

    #[error("Could not subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BackendError,
    },

    #[error("Channel error on {topic}: {reason}")]
    Channel { topic: String, reason: String },

    #[error("Channel {0} closed")]
    ChannelClosed(String),

    #[error("Discarded notification: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Conversation list failed to load: {0}")]
    ConversationList(BackendError),

    #[error("Read marker was not saved: {0}")]
    MarkRead(BackendError),

    #[error("Session is no longer running")]
    SessionClosed,
}

/// Invalid configuration values.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Page size must be between 1 and {max}, got {value}")]
    PageSize { value: u32, max: u32 },

    #[error("Near-top threshold must be a non-negative number, got {0}")]
    NearTopThreshold(f64),

    #[error("Corrective scroll must lie in (0, {max}], got {value}")]
    CorrectiveScroll { value: f64, max: f64 },

    #[error("Corrective scroll ({corrective}) must exceed the near-top threshold ({threshold})")]
    CorrectiveInsideThreshold { corrective: f64, threshold: f64 },
}
