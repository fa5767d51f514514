//! Conversation synchronization engine for a multi-channel support inbox.
//!
//! Three independently ordered sources feed one store: paginated list
//! snapshots, paginated message history, and a live push-event stream. The
//! engine reconciles them without duplicating messages, losing optimistic
//! sends, or leaking conversations across tenants. All mutation is serialized
//! through a single state mutex; consumers read cloned snapshots and listen
//! on a broadcast channel.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::{Stream, StreamExt};
use shared::{
    domain::{
        AttachmentKind, ConversationId, DeliveryStatus, MessageId, SenderRole, TenantId,
    },
    protocol::{
        Attachment, ConversationPage, ConversationSnapshot, MessagePayload, PushEvent,
        SendReceipt, TypingSource,
    },
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod store;
pub mod transport;

pub use store::{Conversation, ConversationStore, Message, SyncCursor};

const DEFAULT_PAGE_SIZE: u32 = 20;
const DEFAULT_HISTORY_PAGE_SIZE: u32 = 30;
/// Tuned in the field, not derived; see [`EngineConfig::duplicate_window`].
const DEFAULT_DUPLICATE_WINDOW_MS: i64 = 2_000;
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_TYPING_INDICATOR_TTL: Duration = Duration::from_secs(6);
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub page_size: u32,
    pub history_page_size: u32,
    /// Window for the content-based duplicate heuristic. Deliberately a
    /// configurable approximation: widening it merges more racing automated
    /// replies, narrowing it risks visible duplicate bubbles.
    pub duplicate_window: chrono::Duration,
    pub refresh_interval: Duration,
    pub typing_indicator_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            duplicate_window: chrono::Duration::milliseconds(DEFAULT_DUPLICATE_WINDOW_MS),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            typing_indicator_ttl: DEFAULT_TYPING_INDICATOR_TTL,
        }
    }
}

/// Who the engine is running for. Operators belong to exactly one tenant;
/// admins may open another tenant's inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorIdentity {
    pub tenant_id: TenantId,
    pub is_admin: bool,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("tenant identity could not be established")]
    TenantUnresolved,
    #[error("operator of tenant {operator} may not open tenant {requested}")]
    TenantForbidden { operator: i64, requested: i64 },
    #[error("no conversation is selected")]
    NoSelection,
    #[error("unknown conversation {0}")]
    UnknownConversation(i64),
    #[error("message {0} is not a retryable local message")]
    NotRetryable(String),
    #[error("attachment upload failed: {0}")]
    UploadFailed(String),
}

/// Outgoing attachment before upload. The uploaded [`Attachment`] reference
/// is what ends up on the message and is reused on retry.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub filename: String,
    pub kind: AttachmentKind,
    pub bytes: Vec<u8>,
}

/// The CRUD/REST side of the product, seen from the engine. Implementations
/// live outside the engine; [`transport::HttpSupportBackend`] is the
/// production one.
#[async_trait]
pub trait SupportBackend: Send + Sync {
    async fn fetch_conversations(
        &self,
        tenant: TenantId,
        page: u32,
        page_size: u32,
    ) -> Result<ConversationPage>;
    async fn fetch_messages(
        &self,
        conversation: ConversationId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<MessagePayload>>;
    async fn fetch_conversation_detail(
        &self,
        conversation: ConversationId,
    ) -> Result<ConversationSnapshot>;
    async fn send_message(
        &self,
        conversation: ConversationId,
        content: &str,
        attachment: Option<&Attachment>,
    ) -> Result<SendReceipt>;
    async fn upload_attachment(&self, upload: AttachmentUpload) -> Result<Attachment>;
    async fn mark_conversation_read(&self, conversation: ConversationId) -> Result<()>;
}

pub struct MissingSupportBackend;

#[async_trait]
impl SupportBackend for MissingSupportBackend {
    async fn fetch_conversations(
        &self,
        tenant: TenantId,
        _page: u32,
        _page_size: u32,
    ) -> Result<ConversationPage> {
        Err(anyhow::anyhow!(
            "support backend unavailable for tenant {}",
            tenant.0
        ))
    }

    async fn fetch_messages(
        &self,
        conversation: ConversationId,
        _page: u32,
        _page_size: u32,
    ) -> Result<Vec<MessagePayload>> {
        Err(anyhow::anyhow!(
            "support backend unavailable for conversation {}",
            conversation.0
        ))
    }

    async fn fetch_conversation_detail(
        &self,
        conversation: ConversationId,
    ) -> Result<ConversationSnapshot> {
        Err(anyhow::anyhow!(
            "support backend unavailable for conversation {}",
            conversation.0
        ))
    }

    async fn send_message(
        &self,
        conversation: ConversationId,
        _content: &str,
        _attachment: Option<&Attachment>,
    ) -> Result<SendReceipt> {
        Err(anyhow::anyhow!(
            "support backend unavailable for conversation {}",
            conversation.0
        ))
    }

    async fn upload_attachment(&self, upload: AttachmentUpload) -> Result<Attachment> {
        Err(anyhow::anyhow!(
            "support backend unavailable for upload {}",
            upload.filename
        ))
    }

    async fn mark_conversation_read(&self, conversation: ConversationId) -> Result<()> {
        Err(anyhow::anyhow!(
            "support backend unavailable for conversation {}",
            conversation.0
        ))
    }
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Ordering, previews, selection, or membership of the list changed.
    ConversationListChanged,
    MessageAppended {
        conversation_id: ConversationId,
        message_id: MessageId,
        /// True only if the viewport was already at the bottom before the
        /// append; the consumer must not scroll otherwise.
        autoscroll: bool,
    },
    MessageRemoved {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    HistoryLoaded {
        conversation_id: ConversationId,
        count: usize,
        /// Previously oldest visible message; the consumer re-anchors the
        /// scroll position to it after a prepend. None on the initial load.
        anchor: Option<MessageId>,
    },
    SendStateChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
        status: DeliveryStatus,
    },
    TypingChanged {
        conversation_id: ConversationId,
        source: TypingSource,
        active: bool,
    },
    ListFetchFailed {
        reason: String,
    },
    HistoryFetchFailed {
        conversation_id: ConversationId,
        reason: String,
    },
    Error(String),
}

/// Counters for silently filtered input. Observability only; nothing here is
/// surfaced to the operator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineMetrics {
    pub cross_tenant_dropped: u64,
    pub unknown_staff_echo_dropped: u64,
    pub duplicates_suppressed: u64,
    pub stale_fetches_discarded: u64,
}

/// Read-only view handed to the UI layer.
#[derive(Debug, Clone)]
pub struct InboxSnapshot {
    pub conversations: Vec<Conversation>,
    pub selected: Option<ConversationId>,
    pub list_has_more: bool,
    pub metrics: EngineMetrics,
}

/// Captured at fetch issue time; a completion whose token no longer matches
/// the live selection is discarded. The epoch makes an A -> B -> A flip-flop
/// produce three distinct tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SelectionToken {
    conversation_id: ConversationId,
    epoch: u64,
}

struct PendingSend {
    temp_id: MessageId,
    content: String,
}

struct EngineState {
    tenant: Option<TenantId>,
    store: ConversationStore,
    list_cursor: SyncCursor,
    history_cursor: SyncCursor,
    selection: Option<SelectionToken>,
    selection_epoch: u64,
    viewport_at_bottom: bool,
    refresh_in_flight: bool,
    list_fetch_in_flight: bool,
    history_fetch_in_flight: bool,
    pending_sends: HashMap<ConversationId, Vec<PendingSend>>,
    detail_fetches_in_flight: HashSet<ConversationId>,
    metrics: EngineMetrics,
}

#[derive(Default)]
struct EngineTasks {
    push_task: Option<JoinHandle<()>>,
    refresh_task: Option<JoinHandle<()>>,
    typing_clear: HashMap<(ConversationId, TypingSource), JoinHandle<()>>,
}

pub struct InboxEngine {
    backend: Arc<dyn SupportBackend>,
    config: EngineConfig,
    inner: Mutex<EngineState>,
    tasks: Mutex<EngineTasks>,
    events: broadcast::Sender<EngineEvent>,
}

impl InboxEngine {
    pub fn new(backend: Arc<dyn SupportBackend>) -> Arc<Self> {
        Self::with_config(backend, EngineConfig::default())
    }

    pub fn with_config(backend: Arc<dyn SupportBackend>, config: EngineConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            backend,
            inner: Mutex::new(EngineState {
                tenant: None,
                store: ConversationStore::default(),
                list_cursor: SyncCursor::new(config.page_size),
                history_cursor: SyncCursor::new(config.history_page_size),
                selection: None,
                selection_epoch: 0,
                viewport_at_bottom: true,
                refresh_in_flight: false,
                list_fetch_in_flight: false,
                history_fetch_in_flight: false,
                pending_sends: HashMap::new(),
                detail_fetches_in_flight: HashSet::new(),
                metrics: EngineMetrics::default(),
            }),
            tasks: Mutex::new(EngineTasks::default()),
            events,
            config,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Establish identity and load the first snapshot page. Calling this
    /// again performs a tenant switch: the store and every cursor reset.
    /// Failing to establish identity is the one fatal startup condition.
    pub async fn start(
        self: &Arc<Self>,
        operator: Option<OperatorIdentity>,
        view_tenant: Option<TenantId>,
    ) -> Result<(), EngineError> {
        let Some(operator) = operator else {
            return Err(EngineError::TenantUnresolved);
        };
        let tenant = view_tenant.unwrap_or(operator.tenant_id);
        if tenant != operator.tenant_id && !operator.is_admin {
            return Err(EngineError::TenantForbidden {
                operator: operator.tenant_id.0,
                requested: tenant.0,
            });
        }

        {
            let mut state = self.inner.lock().await;
            state.tenant = Some(tenant);
            state.store.clear();
            state.selection = None;
            state.selection_epoch += 1;
            state.pending_sends.clear();
            state.detail_fetches_in_flight.clear();
            state.list_cursor = SyncCursor::new(self.config.page_size);
            state.history_cursor = SyncCursor::new(self.config.history_page_size);
            state.refresh_in_flight = false;
            state.list_fetch_in_flight = false;
            state.history_fetch_in_flight = false;
        }
        info!(
            tenant_id = tenant.0,
            admin = operator.is_admin,
            "sync: engine started"
        );

        self.refresh_now().await;
        self.spawn_refresh_task().await;
        Ok(())
    }

    /// Consume a push-event stream, applying events strictly in arrival
    /// order. Replaces any previously attached stream.
    pub async fn attach_push_stream<S>(self: &Arc<Self>, stream: S)
    where
        S: Stream<Item = PushEvent> + Send + 'static,
    {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::pin!(stream);
            while let Some(event) = stream.next().await {
                engine.apply_push_event(event).await;
            }
            info!("push: event stream ended");
        });
        let mut tasks = self.tasks.lock().await;
        if let Some(old) = tasks.push_task.replace(handle) {
            old.abort();
        }
    }

    /// Tear down the engine: cancel the push subscription, the periodic
    /// refresh, and all typing auto-clear timers, then clear the store so no
    /// late callback can mutate torn-down state.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.push_task.take() {
            task.abort();
        }
        if let Some(task) = tasks.refresh_task.take() {
            task.abort();
        }
        for (_, task) in tasks.typing_clear.drain() {
            task.abort();
        }
        drop(tasks);

        let mut state = self.inner.lock().await;
        state.tenant = None;
        state.store.clear();
        state.selection = None;
        state.pending_sends.clear();
        state.detail_fetches_in_flight.clear();
        state.list_cursor = SyncCursor::new(self.config.page_size);
        state.history_cursor = SyncCursor::new(self.config.history_page_size);
        state.refresh_in_flight = false;
        state.list_fetch_in_flight = false;
        state.history_fetch_in_flight = false;
        info!("sync: engine shut down");
    }

    pub async fn snapshot(&self) -> InboxSnapshot {
        let state = self.inner.lock().await;
        InboxSnapshot {
            conversations: state.store.to_vec(),
            selected: state.selection.map(|t| t.conversation_id),
            list_has_more: state.list_cursor.has_more,
            metrics: state.metrics,
        }
    }

    /// The consumer reports whether the message viewport sits at the bottom;
    /// this gates the autoscroll hint on appends.
    pub async fn set_viewport_at_bottom(&self, at_bottom: bool) {
        self.inner.lock().await.viewport_at_bottom = at_bottom;
    }

    async fn spawn_refresh_task(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let interval = self.config.refresh_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // start() already ran the initial refresh
            ticker.tick().await;
            loop {
                ticker.tick().await;
                engine.refresh_now().await;
            }
        });
        let mut tasks = self.tasks.lock().await;
        if let Some(old) = tasks.refresh_task.replace(handle) {
            old.abort();
        }
    }

    /// Silent snapshot refresh of the first list page. A cycle that finds the
    /// previous one still in flight is skipped, never queued.
    pub async fn refresh_now(&self) {
        let tenant = {
            let mut state = self.inner.lock().await;
            let Some(tenant) = state.tenant else {
                return;
            };
            if state.refresh_in_flight {
                debug!("refresh: previous cycle still in flight, skipping");
                return;
            }
            state.refresh_in_flight = true;
            tenant
        };

        let fetched = self
            .backend
            .fetch_conversations(tenant, 1, self.config.page_size)
            .await;

        let mut changed = false;
        let mut failure = None;
        {
            let mut state = self.inner.lock().await;
            state.refresh_in_flight = false;
            if state.tenant != Some(tenant) {
                state.metrics.stale_fetches_discarded += 1;
                debug!("refresh: tenant switched mid-flight, result discarded");
                return;
            }
            match fetched {
                Ok(page) => {
                    let selected = state.selection.map(|t| t.conversation_id);
                    let items = filter_foreign(&mut state, page.items, tenant);
                    changed = store::merge_refresh(&mut state.store, items, selected, tenant);
                    state.list_cursor = SyncCursor {
                        page: 2,
                        page_size: self.config.page_size,
                        has_more: page.pagination.has_next_page,
                    };
                }
                Err(err) => {
                    warn!(error = %err, "refresh: conversation list fetch failed");
                    failure = Some(err.to_string());
                }
            }
        }
        if changed {
            let _ = self.events.send(EngineEvent::ConversationListChanged);
        }
        if let Some(reason) = failure {
            let _ = self.events.send(EngineEvent::ListFetchFailed { reason });
        }
    }

    /// Forward-page the conversation list; new entries append to the end of
    /// the ordered list after the identity merge.
    pub async fn load_more_conversations(&self) -> Result<(), EngineError> {
        let (tenant, page) = {
            let mut state = self.inner.lock().await;
            let Some(tenant) = state.tenant else {
                return Err(EngineError::TenantUnresolved);
            };
            if state.list_fetch_in_flight || !state.list_cursor.has_more {
                return Ok(());
            }
            state.list_fetch_in_flight = true;
            (tenant, state.list_cursor.page)
        };

        let fetched = self
            .backend
            .fetch_conversations(tenant, page, self.config.page_size)
            .await;

        let mut changed = false;
        let mut failure = None;
        {
            let mut state = self.inner.lock().await;
            state.list_fetch_in_flight = false;
            if state.tenant != Some(tenant) {
                state.metrics.stale_fetches_discarded += 1;
                return Ok(());
            }
            match fetched {
                Ok(result) => {
                    let items = filter_foreign(&mut state, result.items, tenant);
                    changed = store::merge_append_page(&mut state.store, items, tenant);
                    state.list_cursor.advance(result.pagination.has_next_page);
                }
                Err(err) => {
                    warn!(page, error = %err, "sync: conversation page fetch failed");
                    failure = Some(err.to_string());
                }
            }
        }
        if changed {
            let _ = self.events.send(EngineEvent::ConversationListChanged);
        }
        if let Some(reason) = failure {
            let _ = self.events.send(EngineEvent::ListFetchFailed { reason });
        }
        Ok(())
    }

    /// Open a conversation. Loads the newest history page if this is the
    /// first visit; zeroes the unread counter and schedules the fire-and-
    /// forget mark-as-read once messages are in place.
    pub async fn select_conversation(
        self: &Arc<Self>,
        conversation_id: ConversationId,
    ) -> Result<(), EngineError> {
        let (token, needs_history) = {
            let mut state = self.inner.lock().await;
            if state.tenant.is_none() {
                return Err(EngineError::TenantUnresolved);
            }
            if !state.store.contains(conversation_id) {
                return Err(EngineError::UnknownConversation(conversation_id.0));
            }
            state.selection_epoch += 1;
            let token = SelectionToken {
                conversation_id,
                epoch: state.selection_epoch,
            };
            state.selection = Some(token);
            state.history_cursor = SyncCursor::new(self.config.history_page_size);
            state.history_fetch_in_flight = false;
            for conversation in state.store.iter_mut() {
                conversation.is_selected = conversation.id == conversation_id;
            }
            let needs_history = state
                .store
                .get(conversation_id)
                .map(|c| !c.history_loaded)
                .unwrap_or(false);
            if !needs_history {
                if let Some(conversation) = state.store.get_mut(conversation_id) {
                    conversation.unread_count = 0;
                    conversation.unread_as_of = Utc::now();
                }
            }
            (token, needs_history)
        };
        let _ = self.events.send(EngineEvent::ConversationListChanged);

        if !needs_history {
            self.spawn_mark_read(conversation_id);
            return Ok(());
        }

        let fetched = self
            .backend
            .fetch_messages(conversation_id, 1, self.config.history_page_size)
            .await;

        let mut emitted = Vec::new();
        let mut mark_read = false;
        {
            let mut state = self.inner.lock().await;
            if state.selection != Some(token) {
                state.metrics.stale_fetches_discarded += 1;
                debug!(
                    conversation_id = conversation_id.0,
                    "sync: history fetch for stale selection discarded"
                );
                return Ok(());
            }
            match fetched {
                Ok(page) => {
                    let page_len = page.len() as u32;
                    let messages: Vec<Message> = page
                        .into_iter()
                        .map(|p| Message::from_payload(p, DeliveryStatus::Delivered))
                        .collect();
                    if let Some(conversation) = state.store.get_mut(conversation_id) {
                        let count = store::install_history(
                            conversation,
                            messages,
                            self.config.duplicate_window,
                        );
                        conversation.unread_count = 0;
                        conversation.unread_as_of = Utc::now();
                        emitted.push(EngineEvent::HistoryLoaded {
                            conversation_id,
                            count,
                            anchor: None,
                        });
                        emitted.push(EngineEvent::ConversationListChanged);
                        mark_read = true;
                    }
                    state
                        .history_cursor
                        .advance(page_len >= self.config.history_page_size);
                }
                Err(err) => {
                    warn!(
                        conversation_id = conversation_id.0,
                        error = %err,
                        "sync: initial history fetch failed"
                    );
                    emitted.push(EngineEvent::HistoryFetchFailed {
                        conversation_id,
                        reason: err.to_string(),
                    });
                }
            }
        }
        for event in emitted {
            let _ = self.events.send(event);
        }
        if mark_read {
            self.spawn_mark_read(conversation_id);
        }
        Ok(())
    }

    /// Backward-page the selected conversation's history. Only one load-older
    /// may be outstanding; further requests are refused until it resolves.
    pub async fn load_older_messages(&self) -> Result<(), EngineError> {
        let (token, page) = {
            let mut state = self.inner.lock().await;
            let Some(token) = state.selection else {
                return Err(EngineError::NoSelection);
            };
            if state.history_fetch_in_flight {
                debug!(
                    conversation_id = token.conversation_id.0,
                    "sync: load-older already in flight, refused"
                );
                return Ok(());
            }
            if !state.history_cursor.has_more {
                return Ok(());
            }
            state.history_fetch_in_flight = true;
            (token, state.history_cursor.page)
        };
        let conversation_id = token.conversation_id;

        let fetched = self
            .backend
            .fetch_messages(conversation_id, page, self.config.history_page_size)
            .await;

        let mut emitted = Vec::new();
        {
            let mut state = self.inner.lock().await;
            if state.selection != Some(token) {
                // the in-flight flag now belongs to the new selection; leave it
                state.metrics.stale_fetches_discarded += 1;
                return Ok(());
            }
            state.history_fetch_in_flight = false;
            match fetched {
                Ok(older) => {
                    let page_len = older.len() as u32;
                    let older: Vec<Message> = older
                        .into_iter()
                        .map(|p| Message::from_payload(p, DeliveryStatus::Delivered))
                        .collect();
                    if let Some(conversation) = state.store.get_mut(conversation_id) {
                        let (count, anchor) = store::prepend_older(conversation, older);
                        emitted.push(EngineEvent::HistoryLoaded {
                            conversation_id,
                            count,
                            anchor,
                        });
                    }
                    state
                        .history_cursor
                        .advance(page_len >= self.config.history_page_size);
                }
                Err(err) => {
                    warn!(
                        conversation_id = conversation_id.0,
                        page,
                        error = %err,
                        "sync: older history fetch failed"
                    );
                    emitted.push(EngineEvent::HistoryFetchFailed {
                        conversation_id,
                        reason: err.to_string(),
                    });
                }
            }
        }
        for event in emitted {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    /// Optimistic send. The composing message is visible before any network
    /// round-trip; the push echo, not the direct response, finalizes it. An
    /// attachment uploads first so a failed upload aborts with no partial
    /// state.
    pub async fn submit_message(
        self: &Arc<Self>,
        content: &str,
        attachment: Option<AttachmentUpload>,
    ) -> Result<MessageId, EngineError> {
        let token = {
            let state = self.inner.lock().await;
            state.selection.ok_or(EngineError::NoSelection)?
        };

        let uploaded = match attachment {
            Some(upload) => Some(
                self.backend
                    .upload_attachment(upload)
                    .await
                    .map_err(|err| EngineError::UploadFailed(err.to_string()))?,
            ),
            None => None,
        };

        let conversation_id = token.conversation_id;
        let temp_id = MessageId::local();
        let message = Message {
            id: temp_id.clone(),
            conversation_id,
            sender_role: SenderRole::Staff,
            content: content.to_string(),
            timestamp: Utc::now(),
            delivery_status: DeliveryStatus::Composing,
            attachment: uploaded.clone(),
        };

        let autoscroll;
        {
            let mut state = self.inner.lock().await;
            let still_selected =
                state.selection.map(|t| t.conversation_id) == Some(conversation_id);
            autoscroll = still_selected && state.viewport_at_bottom;
            let Some(conversation) = state.store.get_mut(conversation_id) else {
                return Err(EngineError::UnknownConversation(conversation_id.0));
            };
            conversation.messages.push(message.clone());
            conversation.record_outbound_preview(&message);
            state
                .pending_sends
                .entry(conversation_id)
                .or_default()
                .push(PendingSend {
                    temp_id: temp_id.clone(),
                    content: content.to_string(),
                });
        }
        let _ = self.events.send(EngineEvent::MessageAppended {
            conversation_id,
            message_id: temp_id.clone(),
            autoscroll,
        });
        let _ = self.events.send(EngineEvent::ConversationListChanged);

        self.dispatch_send(conversation_id, temp_id.clone(), content.to_string(), uploaded)
            .await;
        Ok(temp_id)
    }

    /// Re-issue a failed optimistic send under the same temp id, reusing the
    /// already-uploaded attachment reference.
    pub async fn retry_failed_message(
        self: &Arc<Self>,
        temp_id: MessageId,
    ) -> Result<(), EngineError> {
        if !temp_id.is_local() {
            return Err(EngineError::NotRetryable(temp_id.0));
        }
        let (conversation_id, content, attachment) = {
            let mut state = self.inner.lock().await;
            let mut found = None;
            for conversation in state.store.iter_mut() {
                if let Some(message) =
                    conversation.messages.iter_mut().find(|m| m.id == temp_id)
                {
                    if message.delivery_status != DeliveryStatus::Failed {
                        return Err(EngineError::NotRetryable(temp_id.0.clone()));
                    }
                    message.delivery_status = DeliveryStatus::Composing;
                    found = Some((
                        conversation.id,
                        message.content.clone(),
                        message.attachment.clone(),
                    ));
                    break;
                }
            }
            let Some(found) = found else {
                return Err(EngineError::NotRetryable(temp_id.0.clone()));
            };
            state
                .pending_sends
                .entry(found.0)
                .or_default()
                .push(PendingSend {
                    temp_id: temp_id.clone(),
                    content: found.1.clone(),
                });
            found
        };
        let _ = self.events.send(EngineEvent::SendStateChanged {
            conversation_id,
            message_id: temp_id.clone(),
            status: DeliveryStatus::Composing,
        });
        self.dispatch_send(conversation_id, temp_id, content, attachment)
            .await;
        Ok(())
    }

    /// Drop a failed optimistic message the operator chose not to retry.
    pub async fn dismiss_failed_message(&self, temp_id: MessageId) -> Result<(), EngineError> {
        let mut removed_from = None;
        {
            let mut state = self.inner.lock().await;
            for conversation in state.store.iter_mut() {
                if let Some(index) = conversation.messages.iter().position(|m| {
                    m.id == temp_id && m.delivery_status == DeliveryStatus::Failed
                }) {
                    conversation.messages.remove(index);
                    removed_from = Some(conversation.id);
                    break;
                }
            }
        }
        match removed_from {
            Some(conversation_id) => {
                let _ = self.events.send(EngineEvent::MessageRemoved {
                    conversation_id,
                    message_id: temp_id,
                });
                Ok(())
            }
            None => Err(EngineError::NotRetryable(temp_id.0)),
        }
    }

    async fn dispatch_send(
        &self,
        conversation_id: ConversationId,
        temp_id: MessageId,
        content: String,
        attachment: Option<Attachment>,
    ) {
        let result = self
            .backend
            .send_message(conversation_id, &content, attachment.as_ref())
            .await;

        let mut event = None;
        {
            let mut state = self.inner.lock().await;
            match result {
                Ok(receipt) => {
                    info!(
                        conversation_id = conversation_id.0,
                        message_id = %receipt.id,
                        "send: request acknowledged, awaiting echo"
                    );
                    // the temp message may already be gone if the echo won
                    // the race against the direct response
                    if let Some(conversation) = state.store.get_mut(conversation_id) {
                        if let Some(message) =
                            conversation.messages.iter_mut().find(|m| m.id == temp_id)
                        {
                            if message.delivery_status.can_advance_to(DeliveryStatus::Sent) {
                                message.delivery_status = DeliveryStatus::Sent;
                                event = Some(EngineEvent::SendStateChanged {
                                    conversation_id,
                                    message_id: temp_id.clone(),
                                    status: DeliveryStatus::Sent,
                                });
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        conversation_id = conversation_id.0,
                        message_id = %temp_id,
                        error = %err,
                        "send: request failed"
                    );
                    // no echo will come for this attempt
                    let now_empty = state
                        .pending_sends
                        .get_mut(&conversation_id)
                        .map(|pending| {
                            pending.retain(|p| p.temp_id != temp_id);
                            pending.is_empty()
                        })
                        .unwrap_or(false);
                    if now_empty {
                        state.pending_sends.remove(&conversation_id);
                    }
                    if let Some(conversation) = state.store.get_mut(conversation_id) {
                        if let Some(message) =
                            conversation.messages.iter_mut().find(|m| m.id == temp_id)
                        {
                            message.delivery_status = DeliveryStatus::Failed;
                            event = Some(EngineEvent::SendStateChanged {
                                conversation_id,
                                message_id: temp_id.clone(),
                                status: DeliveryStatus::Failed,
                            });
                        }
                    }
                }
            }
        }
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    /// Apply one push event. Events for the same conversation are applied in
    /// the order received; this method is also the test seam for injecting
    /// events without a live stream.
    pub async fn apply_push_event(self: &Arc<Self>, event: PushEvent) {
        match event {
            PushEvent::NewMessage { tenant_id, message } => {
                self.apply_new_message(tenant_id, message).await;
            }
            PushEvent::NewConversation {
                tenant_id,
                conversation,
            } => {
                self.apply_new_conversation(tenant_id, conversation).await;
            }
            PushEvent::Typing {
                tenant_id,
                conversation_id,
                source,
            } => {
                self.apply_typing(tenant_id, conversation_id, source).await;
            }
            PushEvent::Error(api_error) => {
                warn!(code = ?api_error.code, "push: server reported error");
                let _ = self
                    .events
                    .send(EngineEvent::Error(api_error.message));
            }
        }
    }

    async fn apply_new_message(
        self: &Arc<Self>,
        payload_tenant: Option<TenantId>,
        payload: MessagePayload,
    ) {
        let mut emitted = Vec::new();
        let mut spawn_detail = None;
        {
            let mut state = self.inner.lock().await;
            let Some(active) = state.tenant else {
                return;
            };
            if !store::tenant_accepts(payload_tenant, active) {
                state.metrics.cross_tenant_dropped += 1;
                debug!(
                    conversation_id = payload.conversation_id.0,
                    "sync: dropped cross-tenant message event"
                );
                return;
            }

            let conversation_id = payload.conversation_id;
            let incoming = Message::from_payload(payload, DeliveryStatus::Delivered);

            if !state.store.contains(conversation_id) {
                if !incoming.sender_role.is_customer() {
                    // a reply cannot spawn a conversation; stale or
                    // cross-tenant echo, possibly a backend inconsistency
                    state.metrics.unknown_staff_echo_dropped += 1;
                    warn!(
                        conversation_id = conversation_id.0,
                        "sync: dropped staff message for unknown conversation"
                    );
                    return;
                }
                if !store::tenant_confirms(payload_tenant, active) {
                    // never promote a brand-new conversation on an unscoped payload
                    state.metrics.cross_tenant_dropped += 1;
                    debug!(
                        conversation_id = conversation_id.0,
                        "sync: unconfirmed tenant on unknown conversation, dropped"
                    );
                    return;
                }
                state
                    .store
                    .insert_front(Conversation::synthesize(&incoming, active));
                if state.detail_fetches_in_flight.insert(conversation_id) {
                    spawn_detail = Some(conversation_id);
                }
                emitted.push(EngineEvent::ConversationListChanged);
            } else {
                let selected =
                    state.selection.map(|t| t.conversation_id) == Some(conversation_id);
                let autoscroll = selected && state.viewport_at_bottom;

                // resolve the optimistic echo before deduplication so the
                // temp message cannot shadow its own authoritative copy
                let mut resolved_temp = None;
                if !incoming.sender_role.is_customer() {
                    if let Some(pending) = state.pending_sends.get_mut(&conversation_id) {
                        if let Some(index) =
                            pending.iter().position(|p| p.content == incoming.content)
                        {
                            resolved_temp = Some(pending.remove(index).temp_id);
                        }
                    }
                    if state
                        .pending_sends
                        .get(&conversation_id)
                        .is_some_and(|p| p.is_empty())
                    {
                        state.pending_sends.remove(&conversation_id);
                    }
                }

                if let Some(temp_id) = resolved_temp {
                    info!(
                        conversation_id = conversation_id.0,
                        message_id = %incoming.id,
                        "send: echo confirmed optimistic message"
                    );
                    if let Some(conversation) = state.store.get_mut(conversation_id) {
                        conversation.messages.retain(|m| m.id != temp_id);
                        conversation.messages.push(incoming.clone());
                        conversation.record_inbound(&incoming, selected, false);
                    }
                    emitted.push(EngineEvent::MessageRemoved {
                        conversation_id,
                        message_id: temp_id,
                    });
                    emitted.push(EngineEvent::SendStateChanged {
                        conversation_id,
                        message_id: incoming.id.clone(),
                        status: DeliveryStatus::Delivered,
                    });
                    emitted.push(EngineEvent::MessageAppended {
                        conversation_id,
                        message_id: incoming.id,
                        autoscroll,
                    });
                    emitted.push(EngineEvent::ConversationListChanged);
                } else {
                    let duplicate = state
                        .store
                        .get(conversation_id)
                        .map(|c| {
                            store::is_duplicate(
                                &incoming,
                                &c.messages,
                                self.config.duplicate_window,
                            )
                        })
                        .unwrap_or(false);
                    if duplicate {
                        // the authoritative copy may carry corrected fields:
                        // refresh preview and derived state, append nothing
                        state.metrics.duplicates_suppressed += 1;
                        debug!(
                            conversation_id = conversation_id.0,
                            message_id = %incoming.id,
                            "sync: duplicate message suppressed"
                        );
                    }
                    let mut appended = false;
                    if let Some(conversation) = state.store.get_mut(conversation_id) {
                        if !duplicate
                            && (conversation.history_loaded
                                || conversation.provisional
                                || selected)
                        {
                            conversation.messages.push(incoming.clone());
                            appended = true;
                        }
                        conversation.record_inbound(&incoming, selected, !duplicate);
                    }
                    // only a customer message may reorder the list; an
                    // operator's own replies must not make rows jump under them
                    if incoming.sender_role.is_customer() {
                        state.store.move_to_front(conversation_id);
                    }
                    if appended {
                        emitted.push(EngineEvent::MessageAppended {
                            conversation_id,
                            message_id: incoming.id,
                            autoscroll,
                        });
                    }
                    emitted.push(EngineEvent::ConversationListChanged);
                }
            }
        }
        for event in emitted {
            let _ = self.events.send(event);
        }
        if let Some(conversation_id) = spawn_detail {
            self.spawn_detail_fetch(conversation_id);
        }
    }

    async fn apply_new_conversation(
        &self,
        payload_tenant: Option<TenantId>,
        snapshot: ConversationSnapshot,
    ) {
        let mut changed = false;
        {
            let mut state = self.inner.lock().await;
            let Some(active) = state.tenant else {
                return;
            };
            let tenant = payload_tenant.or(snapshot.tenant_id);
            let conversation_id = snapshot.conversation_id;
            if state.store.contains(conversation_id) {
                if !store::tenant_accepts(tenant, active) {
                    state.metrics.cross_tenant_dropped += 1;
                    return;
                }
                if let Some(existing) = state.store.get_mut(conversation_id) {
                    changed = store::apply_fresh_snapshot(existing, &snapshot);
                }
            } else {
                if !store::tenant_confirms(tenant, active) {
                    state.metrics.cross_tenant_dropped += 1;
                    debug!(
                        conversation_id = conversation_id.0,
                        "sync: dropped new conversation without confirmed tenant"
                    );
                    return;
                }
                state
                    .store
                    .insert_front(Conversation::from_snapshot(snapshot, active));
                changed = true;
            }
        }
        if changed {
            let _ = self.events.send(EngineEvent::ConversationListChanged);
        }
    }

    async fn apply_typing(
        self: &Arc<Self>,
        payload_tenant: Option<TenantId>,
        conversation_id: ConversationId,
        source: TypingSource,
    ) {
        {
            let mut state = self.inner.lock().await;
            let Some(active) = state.tenant else {
                return;
            };
            if !store::tenant_accepts(payload_tenant, active) {
                state.metrics.cross_tenant_dropped += 1;
                return;
            }
            let Some(conversation) = state.store.get_mut(conversation_id) else {
                debug!(
                    conversation_id = conversation_id.0,
                    "sync: typing event for unknown conversation ignored"
                );
                return;
            };
            match source {
                TypingSource::Customer => conversation.customer_typing = true,
                TypingSource::AutomatedAgent => conversation.agent_typing = true,
            }
        }
        let _ = self.events.send(EngineEvent::TypingChanged {
            conversation_id,
            source,
            active: true,
        });

        let engine = Arc::clone(self);
        let ttl = self.config.typing_indicator_ttl;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut cleared = false;
            {
                let mut state = engine.inner.lock().await;
                if let Some(conversation) = state.store.get_mut(conversation_id) {
                    match source {
                        TypingSource::Customer if conversation.customer_typing => {
                            conversation.customer_typing = false;
                            cleared = true;
                        }
                        TypingSource::AutomatedAgent if conversation.agent_typing => {
                            conversation.agent_typing = false;
                            cleared = true;
                        }
                        _ => {}
                    }
                }
            }
            if cleared {
                let _ = engine.events.send(EngineEvent::TypingChanged {
                    conversation_id,
                    source,
                    active: false,
                });
            }
        });
        let mut tasks = self.tasks.lock().await;
        if let Some(old) = tasks.typing_clear.insert((conversation_id, source), handle) {
            old.abort();
        }
    }

    fn spawn_detail_fetch(self: &Arc<Self>, conversation_id: ConversationId) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let result = engine
                .backend
                .fetch_conversation_detail(conversation_id)
                .await;
            let mut changed = false;
            {
                let mut state = engine.inner.lock().await;
                state.detail_fetches_in_flight.remove(&conversation_id);
                let Some(active) = state.tenant else {
                    return;
                };
                match result {
                    Ok(detail) => {
                        if !store::tenant_confirms(detail.tenant_id, active) {
                            // the provisional entry was admitted on trust; a
                            // detail that cannot confirm the tenant revokes it
                            state.metrics.cross_tenant_dropped += 1;
                            warn!(
                                conversation_id = conversation_id.0,
                                "sync: detail fetch could not confirm tenant, provisional entry removed"
                            );
                            changed = state.store.remove(conversation_id).is_some();
                        } else {
                            changed = engine.install_detail(&mut state, detail);
                        }
                    }
                    Err(err) => {
                        // the provisional entry stays; the next snapshot poll
                        // will either confirm or drop it
                        warn!(
                            conversation_id = conversation_id.0,
                            error = %err,
                            "sync: background conversation fill failed"
                        );
                    }
                }
            }
            if changed {
                let _ = engine.events.send(EngineEvent::ConversationListChanged);
            }
        });
    }

    /// Replace a provisional entry with the fetched detail. The fetched
    /// history wins; locally held messages are merged into it unless already
    /// represented, and a strictly newer local preview is preserved.
    fn install_detail(&self, state: &mut EngineState, detail: ConversationSnapshot) -> bool {
        let Some(active) = state.tenant else {
            return false;
        };
        let conversation_id = detail.conversation_id;
        let position = state.store.position(conversation_id);
        let prior = state.store.remove(conversation_id);
        let mut fresh = Conversation::from_snapshot(detail, active);

        if let Some(prior) = &prior {
            fresh.is_selected = prior.is_selected;
            if fresh.history_loaded {
                for old in prior.messages.clone() {
                    if fresh.messages.iter().any(|m| m.id == old.id) {
                        continue;
                    }
                    if !old.id.is_local()
                        && store::is_duplicate(&old, &fresh.messages, self.config.duplicate_window)
                    {
                        continue;
                    }
                    fresh.messages.push(old);
                }
                fresh.messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
            } else {
                fresh.messages = prior.messages.clone();
                fresh.history_loaded = prior.history_loaded;
            }
            if prior.preview_time > fresh.preview_time {
                fresh.preview_text = prior.preview_text.clone();
                fresh.preview_time = prior.preview_time;
                fresh.preview_from_customer = prior.preview_from_customer;
                fresh.unread_count = prior.unread_count;
                fresh.unread_as_of = prior.unread_as_of;
                fresh.staff_replied_since = prior.staff_replied_since;
                fresh.recompute_awaiting();
            }
        }

        let changed = prior.as_ref() != Some(&fresh);
        match position {
            Some(index) => state.store.insert_at(index, fresh),
            None => state.store.insert_front(fresh),
        }
        changed
    }

    fn spawn_mark_read(self: &Arc<Self>, conversation_id: ConversationId) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            // fire and forget: local state stays reset even if this fails
            if let Err(err) = engine.backend.mark_conversation_read(conversation_id).await {
                warn!(
                    conversation_id = conversation_id.0,
                    error = %err,
                    "sync: mark-as-read side effect failed"
                );
            }
        });
    }
}

fn filter_foreign(
    state: &mut EngineState,
    items: Vec<ConversationSnapshot>,
    active: TenantId,
) -> Vec<ConversationSnapshot> {
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        if store::tenant_accepts(item.tenant_id, active) {
            kept.push(item);
        } else {
            state.metrics.cross_tenant_dropped += 1;
            debug!(
                conversation_id = item.conversation_id.0,
                "sync: dropped cross-tenant snapshot entry"
            );
        }
    }
    kept
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
