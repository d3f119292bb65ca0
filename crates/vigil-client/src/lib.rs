//! # vigil-client
//!
//! Real-time message synchronization for Vigil conversations: a paginated,
//! ordered, deduplicated window of messages kept in step with the backend's
//! change feed while the user scrolls, pages backward and sends.

pub mod backend;
pub mod config;
pub mod conversation_list;
pub mod error;
pub mod events;
pub mod pagination;
pub mod reconciler;
pub mod scroll;
pub mod session;
pub mod window;

#[cfg(test)]
mod testing;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::bail;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use vigil_store::Database;

use crate::backend::LocalBackend;
use crate::config::ClientConfig;
use crate::error::SyncError;
use crate::events::ErrorHook;
use crate::pagination::PaginationState;
use crate::session::{ConversationSession, SessionTarget};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vigil_client_lib=debug,vigil_store=info,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

/// Open the local store and page one conversation from its newest message
/// back to its oldest through a conversation session.
pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting Vigil client v{}", env!("CARGO_PKG_VERSION"));

    let config = ClientConfig::from_env();
    config.validate()?;
    info!(?config, "Loaded configuration");

    let db = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    info!(path = ?db.path(), "Database opened");

    let Some(conversation_id) = config.conversation_id else {
        bail!("VIGIL_CONVERSATION_ID is not set");
    };
    let tenant_id = match config.tenant_id {
        Some(tenant_id) => tenant_id,
        None => db.get_conversation(conversation_id)?.tenant_id,
    };

    let backend = Arc::new(LocalBackend::with_capacity(db, config.channel_capacity));
    let page_failures = Arc::new(AtomicUsize::new(0));
    let failures = page_failures.clone();
    let on_error: ErrorHook = Arc::new(move |e: &SyncError| {
        if matches!(e, SyncError::OlderPage(_)) {
            failures.fetch_add(1, Ordering::Relaxed);
        }
        warn!(error = %e, "Session reported an error");
    });
    let session = ConversationSession::spawn(backend.clone(), backend, &config, on_error);

    let mut revisions = session.watch();
    tokio::spawn(async move {
        while revisions.changed().await.is_ok() {
            let snapshot = revisions.borrow_and_update().clone();
            info!(
                revision = snapshot.revision,
                messages = snapshot.messages.len(),
                has_more = snapshot.has_more,
                state = %snapshot.state,
                "Window changed"
            );
        }
    });

    session
        .switch_conversation(SessionTarget::conversation(conversation_id, tenant_id))
        .await?;
    session.flush().await?;

    loop {
        let snapshot = session.snapshot();
        match snapshot.state {
            PaginationState::Exhausted => break,
            PaginationState::Failed => {
                bail!(
                    "first page failed: {}",
                    snapshot.blocking_error.unwrap_or_default()
                );
            }
            _ => {}
        }

        session.load_more().await?;
        session.flush().await?;

        if page_failures.load(Ordering::Relaxed) > 0 {
            bail!("older page could not be loaded");
        }
    }

    let snapshot = session.snapshot();
    info!(
        conversation = %conversation_id,
        messages = snapshot.messages.len(),
        "Reached the oldest message"
    );

    session.shutdown().await?;
    Ok(())
}
