//! In-memory fakes of the backend ports.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::{mpsc, Semaphore};

use vigil_shared::protocol::{ChangeEvent, FeedTopic};
use vigil_shared::types::{ContentKind, ConversationId, MessageId, TenantId, UserId};
use vigil_store::{ConversationOverview, Message};

use crate::backend::{
    ChangeFeed, ConversationSource, FeedItem, FeedSubscription, MessageSource, PageRequest,
    SubscriptionId,
};
use crate::error::{BackendError, SyncError};
use crate::events::ErrorHook;

pub fn ts(t: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + Duration::seconds(t)
}

pub fn message(conversation: ConversationId, t: i64) -> Message {
    Message {
        id: MessageId::new(),
        conversation_id: conversation,
        sender_id: UserId::new(),
        kind: ContentKind::Text,
        content: format!("t={t}"),
        parent_id: None,
        is_restricted: false,
        created_at: ts(t),
        updated_at: ts(t),
        deleted_at: None,
        reply_count: 0,
        sender: None,
    }
}

pub fn reply(parent: &Message, t: i64) -> Message {
    Message {
        parent_id: Some(parent.id),
        ..message(parent.conversation_id, t)
    }
}

pub fn insert_payload(message: &Message) -> serde_json::Value {
    ChangeEvent::Insert { new: message.to_row() }.to_payload()
}

pub fn update_payload(message: &Message) -> serde_json::Value {
    ChangeEvent::Update {
        new: message.to_row(),
        old: None,
    }
    .to_payload()
}

/// A hook collecting error messages.
pub fn error_sink() -> (ErrorHook, Arc<Mutex<Vec<String>>>) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let hook: ErrorHook = Arc::new(move |e: &SyncError| sink.lock().unwrap().push(e.to_string()));
    (hook, errors)
}

/// Serves pages and hydration reads from a list of messages.
pub struct FakeSource {
    messages: Mutex<Vec<Message>>,
    unhydratable: Mutex<HashSet<MessageId>>,
    requests: Mutex<Vec<PageRequest>>,
    failing_calls: Mutex<HashSet<usize>>,
    calls: AtomicUsize,
    gated: AtomicBool,
    gate: Semaphore,
    overviews: Mutex<Vec<ConversationOverview>>,
    marks: Mutex<Vec<(ConversationId, UserId)>>,
}

impl Default for FakeSource {
    fn default() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            unhydratable: Mutex::new(HashSet::new()),
            requests: Mutex::new(Vec::new()),
            failing_calls: Mutex::new(HashSet::new()),
            calls: AtomicUsize::new(0),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
            overviews: Mutex::new(Vec::new()),
            marks: Mutex::new(Vec::new()),
        }
    }
}

impl FakeSource {
    pub fn with_messages(messages: Vec<Message>) -> Self {
        let source = Self::default();
        *source.messages.lock().unwrap() = messages;
        source
    }

    pub fn add(&self, message: Message) {
        self.messages.lock().unwrap().push(message);
    }

    /// Hydration reads for `id` will find nothing.
    pub fn hide(&self, id: MessageId) {
        self.unhydratable.lock().unwrap().insert(id);
    }

    /// The `n`th page call (1-based) fails.
    pub fn fail_call(&self, n: usize) {
        self.failing_calls.lock().unwrap().insert(n);
    }

    /// Hold every following page call until [`FakeSource::release`].
    pub fn close_gate(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// Let `n` held page calls through, oldest first.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn page_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn set_overviews(&self, overviews: Vec<ConversationOverview>) {
        *self.overviews.lock().unwrap() = overviews;
    }

    pub fn marks(&self) -> Vec<(ConversationId, UserId)> {
        self.marks.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSource for FakeSource {
    async fn fetch_page(&self, request: PageRequest) -> Result<Vec<Message>, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request);

        if self.gated.load(Ordering::SeqCst) {
            self.gate.acquire().await.unwrap().forget();
        }
        if self.failing_calls.lock().unwrap().contains(&call) {
            return Err(BackendError::Network(format!("call {call} failed")));
        }

        let Some((conversation_id, _)) = request.target() else {
            return Ok(Vec::new());
        };

        let mut page: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| !m.is_deleted() && request.scope.admits_parent(m.parent_id))
            .cloned()
            .collect();
        page.sort_by_key(|m| std::cmp::Reverse(m.sort_key()));

        Ok(page
            .into_iter()
            .skip(request.offset as usize)
            .take(request.limit as usize)
            .collect())
    }

    async fn fetch_by_id(
        &self,
        id: MessageId,
        _tenant_id: Option<TenantId>,
    ) -> Result<Option<Message>, BackendError> {
        if self.unhydratable.lock().unwrap().contains(&id) {
            return Ok(None);
        }
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == id && !m.is_deleted())
            .cloned())
    }
}

#[async_trait]
impl ConversationSource for FakeSource {
    async fn list_conversations(
        &self,
        _viewer: UserId,
        _tenant_id: TenantId,
    ) -> Result<Vec<ConversationOverview>, BackendError> {
        Ok(self.overviews.lock().unwrap().clone())
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        viewer: UserId,
        _at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        self.marks.lock().unwrap().push((conversation_id, viewer));
        Ok(())
    }
}

#[derive(Default)]
struct FeedState {
    next_id: u64,
    live: HashMap<SubscriptionId, (FeedTopic, mpsc::Sender<FeedItem>)>,
    log: Vec<String>,
    fail_next: bool,
}

/// A change feed driven by the test.
#[derive(Default)]
pub struct FakeFeed {
    state: Mutex<FeedState>,
}

impl FakeFeed {
    /// Subscribe and unsubscribe calls, in order.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn fail_next_subscribe(&self) {
        self.state.lock().unwrap().fail_next = true;
    }

    /// Deliver `item` to every subscription on `topic`.
    pub fn push(&self, topic: FeedTopic, item: FeedItem) -> usize {
        let state = self.state.lock().unwrap();
        state
            .live
            .values()
            .filter(|(t, _)| *t == topic)
            .filter(|(_, tx)| tx.try_send(item.clone()).is_ok())
            .count()
    }

    /// Close every channel on `topic` from the backend side.
    pub fn close(&self, topic: FeedTopic) {
        self.state.lock().unwrap().live.retain(|_, (t, _)| *t != topic);
    }
}

#[async_trait]
impl ChangeFeed for FakeFeed {
    async fn subscribe(&self, topic: FeedTopic) -> Result<FeedSubscription, BackendError> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next) {
            return Err(BackendError::Subscription("refused".into()));
        }

        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        let (tx, events) = mpsc::channel(64);
        state.live.insert(id, (topic, tx));
        state.log.push(format!("subscribe {topic}"));
        Ok(FeedSubscription { id, topic, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.state.lock().unwrap();
        if let Some((topic, _)) = state.live.remove(&id) {
            state.log.push(format!("unsubscribe {topic}"));
        }
    }
}
