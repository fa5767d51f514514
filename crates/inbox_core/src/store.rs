//! Conversation store and the pure reconciliation rules that operate on it.
//!
//! Everything in this module is synchronous and lock-free; the engine in
//! `lib.rs` owns the single store instance behind its state mutex and calls
//! into these functions from there.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::{
        Channel, ConversationId, CustomerId, DeliveryStatus, MessageId, SenderRole, TenantId,
    },
    protocol::{Attachment, ConversationSnapshot, MessagePayload},
};
use tracing::debug;

/// A message as held in client state. Unlike the wire payload it tracks the
/// local delivery status, which is what distinguishes an optimistic send from
/// a confirmed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_role: SenderRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    pub attachment: Option<Attachment>,
}

impl Message {
    pub fn from_payload(payload: MessagePayload, delivery_status: DeliveryStatus) -> Self {
        Self {
            id: payload.id,
            conversation_id: payload.conversation_id,
            sender_role: payload.sender_role,
            content: payload.content,
            timestamp: payload.timestamp,
            delivery_status,
            attachment: payload.attachment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub tenant_id: TenantId,
    /// Unknown only while the entry is provisional (synthesized from a push
    /// event, before the background detail fetch fills it in).
    pub customer_id: Option<CustomerId>,
    pub customer_name: String,
    pub channel: Channel,
    /// Chronological, oldest first. Lazily populated; empty until a history
    /// fetch has run for this conversation.
    pub messages: Vec<Message>,
    pub history_loaded: bool,
    pub preview_text: String,
    pub preview_time: DateTime<Utc>,
    pub preview_from_customer: bool,
    pub unread_count: u32,
    /// Recency of the unread counter, used to arbitrate between the server's
    /// value and a locally tracked one.
    pub unread_as_of: DateTime<Utc>,
    /// Derived; recomputed via [`Conversation::recompute_awaiting`], never
    /// written directly.
    pub awaiting_reply: bool,
    pub staff_replied_since: bool,
    pub customer_typing: bool,
    pub agent_typing: bool,
    pub provisional: bool,
    pub is_selected: bool,
}

impl Conversation {
    pub fn from_snapshot(snapshot: ConversationSnapshot, active_tenant: TenantId) -> Self {
        let history_loaded = !snapshot.messages.is_empty();
        let messages = snapshot
            .messages
            .into_iter()
            .map(|p| Message::from_payload(p, DeliveryStatus::Delivered))
            .collect();
        let mut conversation = Self {
            id: snapshot.conversation_id,
            tenant_id: snapshot.tenant_id.unwrap_or(active_tenant),
            customer_id: Some(snapshot.customer_id),
            customer_name: snapshot.customer_name,
            channel: snapshot.channel,
            messages,
            history_loaded,
            preview_text: snapshot.preview_text,
            preview_time: snapshot.preview_time,
            preview_from_customer: snapshot.preview_from_customer,
            unread_count: snapshot.unread_count,
            unread_as_of: snapshot.preview_time,
            awaiting_reply: false,
            staff_replied_since: !snapshot.preview_from_customer,
            customer_typing: false,
            agent_typing: false,
            provisional: false,
            is_selected: false,
        };
        conversation.recompute_awaiting();
        conversation
    }

    /// Minimal provisional entry for a conversation first seen through a
    /// customer push message. Customer identity stays unknown until the
    /// background detail fetch overwrites this entry.
    pub fn synthesize(message: &Message, tenant_id: TenantId) -> Self {
        let mut conversation = Self {
            id: message.conversation_id,
            tenant_id,
            customer_id: None,
            customer_name: String::new(),
            channel: Channel::Unknown,
            messages: vec![message.clone()],
            history_loaded: false,
            preview_text: message.content.clone(),
            preview_time: message.timestamp,
            preview_from_customer: true,
            unread_count: 1,
            unread_as_of: message.timestamp,
            awaiting_reply: false,
            staff_replied_since: false,
            customer_typing: false,
            agent_typing: false,
            provisional: true,
            is_selected: false,
        };
        conversation.recompute_awaiting();
        conversation
    }

    /// `awaiting_reply` is a pure function of these two fields; nothing else
    /// may write it.
    pub fn recompute_awaiting(&mut self) {
        self.awaiting_reply = self.preview_from_customer && !self.staff_replied_since;
    }

    /// Fold an incoming (push-delivered) message into the preview and derived
    /// state. `count_unread` is false when the message was recognized as a
    /// duplicate, so a replayed event cannot inflate the counter.
    pub fn record_inbound(&mut self, message: &Message, selected: bool, count_unread: bool) {
        self.preview_text = message.content.clone();
        self.preview_time = message.timestamp;
        self.preview_from_customer = message.sender_role.is_customer();
        match message.sender_role {
            SenderRole::Customer => {
                self.staff_replied_since = false;
                self.customer_typing = false;
                if selected {
                    self.unread_count = 0;
                    self.unread_as_of = message.timestamp;
                } else if count_unread {
                    self.unread_count += 1;
                    self.unread_as_of = message.timestamp;
                }
            }
            SenderRole::Staff | SenderRole::AutomatedAgent => {
                self.staff_replied_since = true;
                if message.sender_role == SenderRole::AutomatedAgent {
                    self.agent_typing = false;
                }
            }
        }
        self.recompute_awaiting();
    }

    /// Preview update for an operator-composed message. Never reorders and
    /// never touches unread counters.
    pub fn record_outbound_preview(&mut self, message: &Message) {
        self.preview_text = message.content.clone();
        self.preview_time = message.timestamp;
        self.preview_from_customer = false;
        self.staff_replied_since = true;
        self.recompute_awaiting();
    }
}

/// Ordered collection of conversations, newest preview first. The engine is
/// the only mutator; consumers see cloned snapshots.
#[derive(Debug, Default, Clone)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
}

impl ConversationStore {
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.iter()
    }

    pub fn ids(&self) -> Vec<ConversationId> {
        self.conversations.iter().map(|c| c.id).collect()
    }

    pub fn contains(&self, id: ConversationId) -> bool {
        self.conversations.iter().any(|c| c.id == id)
    }

    pub fn get(&self, id: ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn get_mut(&mut self, id: ConversationId) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    pub fn position(&self, id: ConversationId) -> Option<usize> {
        self.conversations.iter().position(|c| c.id == id)
    }

    pub fn insert_front(&mut self, conversation: Conversation) {
        self.conversations.insert(0, conversation);
    }

    pub fn insert_at(&mut self, index: usize, conversation: Conversation) {
        let index = index.min(self.conversations.len());
        self.conversations.insert(index, conversation);
    }

    pub fn push_back(&mut self, conversation: Conversation) {
        self.conversations.push(conversation);
    }

    pub fn remove(&mut self, id: ConversationId) -> Option<Conversation> {
        let index = self.position(id)?;
        Some(self.conversations.remove(index))
    }

    pub fn retain(&mut self, keep: impl FnMut(&Conversation) -> bool) {
        self.conversations.retain(keep);
    }

    /// Returns true when the conversation actually moved.
    pub fn move_to_front(&mut self, id: ConversationId) -> bool {
        match self.position(id) {
            Some(0) | None => false,
            Some(index) => {
                let conversation = self.conversations.remove(index);
                self.conversations.insert(0, conversation);
                true
            }
        }
    }

    pub fn sort_by_preview_desc(&mut self) {
        self.conversations
            .sort_by(|a, b| b.preview_time.cmp(&a.preview_time));
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
    }

    pub fn to_vec(&self) -> Vec<Conversation> {
        self.conversations.clone()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Conversation> {
        self.conversations.iter_mut()
    }
}

/// Pagination state for one list. `page` is the next page to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCursor {
    pub page: u32,
    pub page_size: u32,
    pub has_more: bool,
}

impl SyncCursor {
    pub fn new(page_size: u32) -> Self {
        Self {
            page: 1,
            page_size,
            has_more: true,
        }
    }

    pub fn reset(&mut self) {
        self.page = 1;
        self.has_more = true;
    }

    pub fn advance(&mut self, has_more: bool) {
        self.page += 1;
        self.has_more = has_more;
    }
}

/// Soft tenant check: an unscoped legacy payload is accepted for an existing
/// conversation.
pub fn tenant_accepts(payload_tenant: Option<TenantId>, active_tenant: TenantId) -> bool {
    match payload_tenant {
        None => true,
        Some(tenant) => tenant == active_tenant,
    }
}

/// Strict tenant check for conversations we have never seen: an unscoped
/// payload is not enough to admit a new entry into the list.
pub fn tenant_confirms(payload_tenant: Option<TenantId>, active_tenant: TenantId) -> bool {
    payload_tenant == Some(active_tenant)
}

/// Duplicate detection. Server-issued ids are authoritative; on top of that a
/// content+window heuristic catches automated replies that race a fetch and a
/// push event before sharing an id. Two genuinely distinct non-customer
/// messages with identical text inside the window will be merged; that false
/// positive is accepted in exchange for never showing duplicated bubbles.
pub fn is_duplicate(candidate: &Message, existing: &[Message], window: Duration) -> bool {
    if existing
        .iter()
        .any(|m| !m.id.is_local() && m.id == candidate.id)
    {
        return true;
    }
    if candidate.sender_role.is_customer() {
        return false;
    }
    existing.iter().any(|m| {
        !m.id.is_local()
            && !m.sender_role.is_customer()
            && m.content == candidate.content
            && (m.timestamp - candidate.timestamp).abs() <= window
    })
}

/// Merge one fresh snapshot into an existing entry. Loaded messages are never
/// touched here. A strictly newer local preview (push events ahead of this
/// poll) keeps the local preview, unread counter, and awaiting flag; otherwise
/// the fresh values win. Returns true when any field changed.
pub fn apply_fresh_snapshot(
    conversation: &mut Conversation,
    fresh: &ConversationSnapshot,
) -> bool {
    let before = conversation.clone();

    if conversation.customer_id != Some(fresh.customer_id) {
        conversation.customer_id = Some(fresh.customer_id);
    }
    if conversation.customer_name != fresh.customer_name {
        conversation.customer_name = fresh.customer_name.clone();
    }
    if conversation.channel != fresh.channel {
        conversation.channel = fresh.channel;
    }
    conversation.provisional = false;

    if conversation.preview_time > fresh.preview_time {
        debug!(
            conversation_id = conversation.id.0,
            "sync: local preview newer than snapshot, keeping local fields"
        );
    } else {
        conversation.preview_text = fresh.preview_text.clone();
        conversation.preview_time = fresh.preview_time;
        conversation.preview_from_customer = fresh.preview_from_customer;
        if fresh.preview_time >= conversation.unread_as_of {
            conversation.unread_count = fresh.unread_count;
            conversation.unread_as_of = fresh.preview_time;
        }
        conversation.staff_replied_since = !fresh.preview_from_customer;
        conversation.recompute_awaiting();
    }

    *conversation != before
}

/// Merge a freshly polled first page into the store. Locally known entries
/// absent from the page are dropped unless selected; the result is ordered by
/// preview time descending. Returns false when the merge was a no-op, in
/// which case the caller must not signal a store change.
pub fn merge_refresh(
    store: &mut ConversationStore,
    fresh: Vec<ConversationSnapshot>,
    selected: Option<ConversationId>,
    active_tenant: TenantId,
) -> bool {
    let order_before = store.ids();
    let mut fields_changed = false;

    let fresh_ids: HashSet<ConversationId> =
        fresh.iter().map(|s| s.conversation_id).collect();
    let len_before = store.len();
    store.retain(|c| fresh_ids.contains(&c.id) || Some(c.id) == selected);
    fields_changed |= store.len() != len_before;

    for snapshot in fresh {
        match store.get_mut(snapshot.conversation_id) {
            Some(existing) => {
                fields_changed |= apply_fresh_snapshot(existing, &snapshot);
            }
            None => {
                store.push_back(Conversation::from_snapshot(snapshot, active_tenant));
                fields_changed = true;
            }
        }
    }

    store.sort_by_preview_desc();
    fields_changed || store.ids() != order_before
}

/// Identity merge for a "load more" page: known entries are updated in place,
/// unknown ones append to the end of the ordered list. No entry is dropped
/// and the list is not re-sorted.
pub fn merge_append_page(
    store: &mut ConversationStore,
    items: Vec<ConversationSnapshot>,
    active_tenant: TenantId,
) -> bool {
    let mut changed = false;
    for snapshot in items {
        match store.get_mut(snapshot.conversation_id) {
            Some(existing) => changed |= apply_fresh_snapshot(existing, &snapshot),
            None => {
                store.push_back(Conversation::from_snapshot(snapshot, active_tenant));
                changed = true;
            }
        }
    }
    changed
}

/// Install a freshly fetched newest history page. The fetched messages take
/// priority; prior local messages (optimistic sends, a synthesized provisional
/// message) are merged back in unless already represented. Returns the number
/// of messages now loaded.
pub fn install_history(
    conversation: &mut Conversation,
    fetched: Vec<Message>,
    window: Duration,
) -> usize {
    let prior = std::mem::take(&mut conversation.messages);
    let mut messages = fetched;
    for old in prior {
        if messages.iter().any(|m| m.id == old.id) {
            continue;
        }
        if !old.id.is_local() && is_duplicate(&old, &messages, window) {
            continue;
        }
        messages.push(old);
    }
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    conversation.messages = messages;
    conversation.history_loaded = true;
    conversation.messages.len()
}

/// Prepend an older history page. Returns how many messages were actually
/// prepended plus the id of the previously oldest message, which the consumer
/// uses as the visual anchor to keep the scroll position stable.
pub fn prepend_older(
    conversation: &mut Conversation,
    older: Vec<Message>,
) -> (usize, Option<MessageId>) {
    let anchor = conversation.messages.first().map(|m| m.id.clone());
    let existing: HashSet<MessageId> =
        conversation.messages.iter().map(|m| m.id.clone()).collect();
    let mut combined: Vec<Message> = older
        .into_iter()
        .filter(|m| !existing.contains(&m.id))
        .collect();
    let prepended = combined.len();
    combined.append(&mut conversation.messages);
    conversation.messages = combined;
    (prepended, anchor)
}
