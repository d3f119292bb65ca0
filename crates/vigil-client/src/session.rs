//! Conversation session with tokio mpsc command pattern.
//!
//! One task owns everything a conversation view needs: the message window,
//! the pagination controller, the scroll reconciler and the live channel.
//! It handles commands, fetch completions and live notifications one at a
//! time, so no two mutations of the window ever interleave. Fetch Page and
//! hydration reads run as separate tasks and post their results back tagged
//! with the generation that issued them.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info};

use vigil_shared::protocol::FeedTopic;
use vigil_shared::types::{ConversationId, MessageId, MessageScope, TenantId};
use vigil_store::Message;

use crate::backend::{ChangeFeed, FeedItem, MessageSource, PageRequest};
use crate::config::ClientConfig;
use crate::error::{BackendError, SyncError};
use crate::events::{report_error, ErrorHook, SessionEvent};
use crate::pagination::{PageKind, PageTicket, PaginationController, PaginationState};
use crate::reconciler::{LiveAction, LiveEventReconciler};
use crate::scroll::{ScrollCommand, ScrollReconciler};
use crate::window::MessageWindow;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// What a session displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SessionTarget {
    pub conversation_id: Option<ConversationId>,
    pub tenant_id: Option<TenantId>,
    pub scope: MessageScope,
}

impl SessionTarget {
    /// The main timeline of a conversation.
    pub fn conversation(conversation_id: ConversationId, tenant_id: TenantId) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            tenant_id: Some(tenant_id),
            scope: MessageScope::TopLevel,
        }
    }

    /// The replies of one top-level message.
    pub fn thread(conversation_id: ConversationId, tenant_id: TenantId, parent_id: MessageId) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            tenant_id: Some(tenant_id),
            scope: MessageScope::Replies(parent_id),
        }
    }
}

/// Everything a view renders, published after every change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WindowSnapshot {
    pub conversation_id: Option<ConversationId>,
    pub scope: MessageScope,
    /// Oldest first.
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub state: PaginationState,
    /// Set when the first page failed. Cleared by a successful refetch.
    pub blocking_error: Option<String>,
    pub revision: u64,
}

impl WindowSnapshot {
    pub fn is_loading(&self) -> bool {
        self.state.is_loading()
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.messages.iter().map(|m| m.id).collect()
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Commands sent *into* the session task.
#[derive(Debug)]
enum SessionCommand {
    /// Show another conversation or scope.
    Switch(SessionTarget),
    /// The consumer approaches the oldest loaded message.
    LoadMore,
    /// Reload from the first page.
    Refetch,
    /// Reopen the live channel for the current conversation.
    Resubscribe,
    ScrollToTop(oneshot::Sender<Option<ScrollCommand>>),
    Scrolled(f64),
    BeginDrag,
    /// A message produced by the local send path.
    AppendLocal(Message),
    /// Reply once no fetch is in flight and no notification is queued.
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Results posted back by spawned fetch tasks.
enum Completion {
    Page {
        ticket: PageTicket,
        result: Result<Vec<Message>, BackendError>,
    },
    Hydrated {
        generation: u64,
        id: MessageId,
        result: Result<Option<Message>, BackendError>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    snapshots: watch::Receiver<WindowSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    async fn send(&self, command: SessionCommand) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::SessionClosed)
    }

    pub async fn switch_conversation(&self, target: SessionTarget) -> Result<(), SyncError> {
        self.send(SessionCommand::Switch(target)).await
    }

    /// Ask for the next older page. Ignored while a page is loading or when
    /// nothing older remains.
    pub async fn load_more(&self) -> Result<(), SyncError> {
        self.send(SessionCommand::LoadMore).await
    }

    pub async fn refetch(&self) -> Result<(), SyncError> {
        self.send(SessionCommand::Refetch).await
    }

    pub async fn resubscribe(&self) -> Result<(), SyncError> {
        self.send(SessionCommand::Resubscribe).await
    }

    /// Plan a scroll to the top that does not trigger pagination. `None`
    /// when the view is already there.
    pub async fn scroll_to_top(&self) -> Result<Option<ScrollCommand>, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::ScrollToTop(tx)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Report the view's scroll offset, measured from the oldest message.
    pub async fn on_scroll(&self, offset: f64) -> Result<(), SyncError> {
        self.send(SessionCommand::Scrolled(offset)).await
    }

    pub async fn begin_drag(&self) -> Result<(), SyncError> {
        self.send(SessionCommand::BeginDrag).await
    }

    pub async fn append_local(&self, message: Message) -> Result<(), SyncError> {
        self.send(SessionCommand::AppendLocal(message)).await
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<WindowSnapshot> {
        self.snapshots.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Wait until the session is quiescent.
    pub async fn flush(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Flush(tx)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    /// Stop the session and release its live channel.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Shutdown(tx)).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

pub struct ConversationSession {
    source: Arc<dyn MessageSource>,
    live: LiveEventReconciler,
    on_error: ErrorHook,

    target: SessionTarget,
    window: MessageWindow,
    pager: PaginationController,
    scroll: ScrollReconciler,
    blocking_error: Option<String>,

    /// Bumped on every switch. Hydration reads from older views are dropped.
    view_generation: u64,
    /// Replies already counted up or down in the current view.
    counted_replies: HashSet<MessageId>,
    removed_replies: HashSet<MessageId>,

    in_flight: usize,
    flush_waiters: Vec<oneshot::Sender<()>>,
    revision: u64,

    commands: mpsc::Receiver<SessionCommand>,
    completions_tx: mpsc::Sender<Completion>,
    completions_rx: mpsc::Receiver<Completion>,
    snapshot_tx: watch::Sender<WindowSnapshot>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl ConversationSession {
    /// Spawn a session task with nothing displayed. Call
    /// [`SessionHandle::switch_conversation`] to open a conversation.
    pub fn spawn(
        source: Arc<dyn MessageSource>,
        feed: Arc<dyn ChangeFeed>,
        config: &ClientConfig,
        on_error: ErrorHook,
    ) -> SessionHandle {
        let capacity = config.channel_capacity.max(1);
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let (completions_tx, completions_rx) = mpsc::channel(capacity);
        let (snapshot_tx, snapshot_rx) = watch::channel(WindowSnapshot::default());
        let (events_tx, _) = broadcast::channel(capacity);

        let session = Self {
            source,
            live: LiveEventReconciler::new(feed),
            on_error,
            target: SessionTarget::default(),
            window: MessageWindow::default(),
            pager: PaginationController::new(config.page_size),
            scroll: ScrollReconciler::new(config.near_top_threshold, config.corrective_scroll),
            blocking_error: None,
            view_generation: 0,
            counted_replies: HashSet::new(),
            removed_replies: HashSet::new(),
            in_flight: 0,
            flush_waiters: Vec::new(),
            revision: 0,
            commands: cmd_rx,
            completions_tx,
            completions_rx,
            snapshot_tx,
            events_tx: events_tx.clone(),
        };

        tokio::spawn(session.run());

        SessionHandle {
            commands: cmd_tx,
            snapshots: snapshot_rx,
            events: events_tx,
        }
    }

    async fn run(mut self) {
        info!("Conversation session started");
        let mut shutdown_reply = None;

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(SessionCommand::Shutdown(reply)) => {
                            shutdown_reply = Some(reply);
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            debug!("All session handles dropped");
                            break;
                        }
                    }
                }

                // The session keeps a sender, so this never yields `None`.
                Some(done) = self.completions_rx.recv() => {
                    self.handle_completion(done);
                }

                item = self.live.next_item() => {
                    self.handle_feed_item(item).await;
                }
            }

            self.settle_flush_waiters().await;
        }

        self.commands.close();
        self.live.stop().await;
        info!("Conversation session stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Switch(target) => self.switch(target).await,
            SessionCommand::LoadMore => self.load_more(),
            SessionCommand::Refetch => self.refetch(),
            SessionCommand::Resubscribe => self.subscribe().await,
            SessionCommand::ScrollToTop(reply) => {
                let command = self.scroll.scroll_to_top();
                debug!(?command, "Scroll to top");
                let _ = reply.send(command);
            }
            SessionCommand::Scrolled(offset) => {
                if self.scroll.on_scroll(offset) {
                    self.load_more();
                }
            }
            SessionCommand::BeginDrag => self.scroll.begin_drag(),
            SessionCommand::AppendLocal(message) => {
                if self.window.append_newest(message) {
                    self.publish();
                }
            }
            SessionCommand::Flush(reply) => self.flush_waiters.push(reply),
            // Handled by the run loop.
            SessionCommand::Shutdown(_) => {}
        }
    }

    async fn switch(&mut self, target: SessionTarget) {
        info!(
            conversation = ?target.conversation_id,
            scope = ?target.scope,
            "Switching conversation"
        );

        self.target = target;
        self.view_generation += 1;
        self.pager.reset();
        self.window.reset(target.conversation_id, target.scope);
        self.scroll.reset();
        self.blocking_error = None;
        self.counted_replies.clear();
        self.removed_replies.clear();

        self.subscribe().await;
        self.start_initial();
        self.publish();
    }

    /// (Re)open the live channel for the current conversation. The previous
    /// channel is released before the new one is requested.
    async fn subscribe(&mut self) {
        let Some(conversation_id) = self.target.conversation_id else {
            self.live.stop().await;
            return;
        };

        if let Err(source) = self.live.follow(conversation_id).await {
            self.report(SyncError::Subscribe {
                topic: FeedTopic::Conversation(conversation_id).name(),
                source,
            });
        }
    }

    fn refetch(&mut self) {
        info!(conversation = ?self.target.conversation_id, "Refetching from the first page");
        self.pager.reset();
        self.window.clear();
        self.blocking_error = None;
        self.start_initial();
        self.publish();
    }

    fn start_initial(&mut self) {
        if let Some(ticket) = self.pager.begin_initial() {
            self.spawn_page(ticket);
        }
    }

    fn load_more(&mut self) {
        let Some(ticket) = self
            .pager
            .begin_more(self.window.has_more(), self.window.cursor())
        else {
            return;
        };

        debug!(offset = ticket.offset, limit = ticket.limit, "Loading older page");
        self.spawn_page(ticket);
        self.publish();
    }

    fn spawn_page(&mut self, ticket: PageTicket) {
        let request = PageRequest {
            conversation_id: self.target.conversation_id,
            tenant_id: self.target.tenant_id,
            scope: self.target.scope,
            offset: ticket.offset,
            limit: ticket.limit,
        };
        let source = self.source.clone();
        let tx = self.completions_tx.clone();

        self.in_flight += 1;
        tokio::spawn(async move {
            let result = source.fetch_page(request).await;
            let _ = tx.send(Completion::Page { ticket, result }).await;
        });
    }

    fn spawn_hydration(&mut self, id: MessageId) {
        let source = self.source.clone();
        let tx = self.completions_tx.clone();
        let generation = self.view_generation;
        let tenant_id = self.target.tenant_id;

        self.in_flight += 1;
        tokio::spawn(async move {
            let result = source.fetch_by_id(id, tenant_id).await;
            let _ = tx
                .send(Completion::Hydrated {
                    generation,
                    id,
                    result,
                })
                .await;
        });
    }

    // ------------------------------------------------------------------
    // Completions
    // ------------------------------------------------------------------

    fn handle_completion(&mut self, completion: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);

        match completion {
            Completion::Page { ticket, result } => self.on_page(ticket, result),
            Completion::Hydrated {
                generation,
                id,
                result,
            } => self.on_hydrated(generation, id, result),
        }
    }

    fn on_page(&mut self, ticket: PageTicket, result: Result<Vec<Message>, BackendError>) {
        if !self.pager.is_current(&ticket) {
            debug!(generation = ticket.generation, kind = ?ticket.kind, "Discarding stale page");
            return;
        }

        match result {
            Ok(page) => {
                let returned = page.len();
                match ticket.kind {
                    PageKind::Initial => self.window.seed(page, ticket.limit),
                    PageKind::Older => {
                        self.window.prepend_older(page, ticket.limit);
                    }
                }
                self.pager.complete(&ticket, self.window.has_more());
                self.blocking_error = None;
                debug!(
                    kind = ?ticket.kind,
                    returned,
                    total = self.window.len(),
                    state = %self.pager.state(),
                    "Page merged"
                );
            }
            Err(e) => {
                self.pager.fail(&ticket);
                match ticket.kind {
                    PageKind::Initial => {
                        self.window.clear();
                        self.blocking_error = Some(e.to_string());
                        self.report(SyncError::InitialPage(e));
                    }
                    PageKind::Older => self.report(SyncError::OlderPage(e)),
                }
            }
        }
        self.publish();
    }

    fn on_hydrated(
        &mut self,
        generation: u64,
        id: MessageId,
        result: Result<Option<Message>, BackendError>,
    ) {
        if generation != self.view_generation {
            debug!(id = %id, "Discarding hydration for a previous view");
            return;
        }

        match result {
            Ok(Some(message)) => {
                if self.window.append_newest(message) {
                    self.publish();
                }
            }
            Ok(None) => debug!(id = %id, "Inserted message no longer visible, dropped"),
            Err(e) => debug!(id = %id, error = %e, "Hydration failed, dropped"),
        }
    }

    // ------------------------------------------------------------------
    // Live notifications
    // ------------------------------------------------------------------

    async fn handle_feed_item(&mut self, item: Option<FeedItem>) {
        let topic = self
            .live
            .topic()
            .map(|t| t.name())
            .unwrap_or_default();

        match item {
            Some(FeedItem::Change(payload)) => {
                match LiveEventReconciler::translate(
                    &payload,
                    self.target.conversation_id,
                    self.target.scope,
                ) {
                    Ok(action) => self.apply(action),
                    Err(e) => self.report(SyncError::Protocol(e)),
                }
            }
            // The subscription stays up; resubscribing is the caller's call.
            Some(FeedItem::Error(reason)) => self.report(SyncError::Channel { topic, reason }),
            None => {
                self.live.stop().await;
                self.report(SyncError::ChannelClosed(topic));
            }
        }
    }

    fn apply(&mut self, action: LiveAction) {
        match action {
            LiveAction::Hydrate(id) => {
                if self.window.contains(id) {
                    debug!(id = %id, "Insert already in window");
                } else {
                    self.spawn_hydration(id);
                }
            }
            LiveAction::ReplyInserted {
                parent_id,
                reply_id,
            } => {
                if self.removed_replies.contains(&reply_id) || !self.counted_replies.insert(reply_id) {
                    return;
                }
                if self.window.adjust_reply_count(parent_id, 1) {
                    self.publish();
                }
                let _ = self.events_tx.send(SessionEvent::ReplyAdded {
                    parent_id,
                    reply_id,
                });
            }
            LiveAction::Update(message) => {
                if self.window.apply_update(message) {
                    self.publish();
                }
            }
            LiveAction::Remove { id, parent_id } => {
                let removed = self.window.apply_delete(id);
                let parent_id = parent_id.or_else(|| removed.as_ref().and_then(|m| m.parent_id));

                if let Some(parent_id) = parent_id {
                    if self.removed_replies.insert(id) {
                        self.window.adjust_reply_count(parent_id, -1);
                        let _ = self.events_tx.send(SessionEvent::ReplyRemoved {
                            parent_id,
                            reply_id: id,
                        });
                        self.publish();
                        return;
                    }
                }
                if removed.is_some() {
                    self.publish();
                }
            }
            LiveAction::Ignore(reason) => debug!(reason, "Notification ignored"),
        }
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    fn publish(&mut self) {
        self.revision += 1;
        self.snapshot_tx.send_replace(WindowSnapshot {
            conversation_id: self.window.conversation_id(),
            scope: self.window.scope(),
            messages: self.window.messages().to_vec(),
            has_more: self.window.has_more(),
            state: self.pager.state(),
            blocking_error: self.blocking_error.clone(),
            revision: self.revision,
        });
    }

    fn report(&self, error: SyncError) {
        report_error(&self.on_error, error);
    }

    async fn settle_flush_waiters(&mut self) {
        if self.flush_waiters.is_empty() {
            return;
        }

        loop {
            if self.in_flight > 0 {
                return;
            }
            let Some(item) = self.live.try_next() else {
                break;
            };
            self.handle_feed_item(item).await;
        }

        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}
