use std::sync::Arc;

use serde::Serialize;

use vigil_shared::types::MessageId;

use crate::error::SyncError;

/// Notices a session broadcasts next to its window snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A reply was posted under `parent_id`.
    ReplyAdded {
        parent_id: MessageId,
        reply_id: MessageId,
    },
    /// A reply under `parent_id` was deleted. The parent's displayed reply
    /// count should drop by one.
    ReplyRemoved {
        parent_id: MessageId,
        reply_id: MessageId,
    },
}

/// Callback receiving every recoverable error.
pub type ErrorHook = Arc<dyn Fn(&SyncError) + Send + Sync>;

/// A hook that only logs.
pub fn log_only() -> ErrorHook {
    Arc::new(|_: &SyncError| {})
}

pub fn report_error(hook: &ErrorHook, error: SyncError) {
    tracing::warn!(error = %error, "Sync error");
    hook(&error);
}
