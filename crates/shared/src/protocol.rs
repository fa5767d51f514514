use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        AttachmentKind, Channel, ConversationId, CustomerId, MessageId, SenderRole, TenantId,
    },
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub uri: String,
    pub kind: AttachmentKind,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_role: SenderRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

/// Point-in-time summary of a conversation as the list endpoints return it.
/// Never carries message history; `preview_*` summarize the latest message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub conversation_id: ConversationId,
    /// Absent on legacy payloads that predate tenant scoping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    pub customer_id: CustomerId,
    pub customer_name: String,
    #[serde(default)]
    pub channel: Channel,
    pub preview_text: String,
    pub preview_time: DateTime<Utc>,
    pub preview_from_customer: bool,
    pub unread_count: u32,
    /// Empty on list payloads; the detail endpoint returns the recent
    /// history here.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub total: u64,
    pub has_next_page: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPage {
    pub items: Vec<ConversationSnapshot>,
    pub pagination: PageInfo,
}

/// Direct response of a send request. Not authoritative for the message's
/// final shape; the push echo is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingSource {
    Customer,
    AutomatedAgent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushEvent {
    NewMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tenant_id: Option<TenantId>,
        message: MessagePayload,
    },
    NewConversation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tenant_id: Option<TenantId>,
        conversation: ConversationSnapshot,
    },
    Typing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tenant_id: Option<TenantId>,
        conversation_id: ConversationId,
        source: TypingSource,
    },
    Error(ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_events_decode_from_tagged_json() {
        let raw = r#"{
            "type": "new_message",
            "payload": {
                "tenant_id": 4,
                "message": {
                    "id": "m_12",
                    "conversation_id": 9,
                    "sender_role": "customer",
                    "content": "hello",
                    "timestamp": "2024-05-01T10:00:00Z"
                }
            }
        }"#;
        let event: PushEvent = serde_json::from_str(raw).expect("decode");
        match event {
            PushEvent::NewMessage { tenant_id, message } => {
                assert_eq!(tenant_id, Some(TenantId(4)));
                assert_eq!(message.id, MessageId::new("m_12"));
                assert!(message.sender_role.is_customer());
                assert!(message.attachment.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn legacy_payload_without_tenant_decodes_as_none() {
        let raw = r#"{
            "type": "typing",
            "payload": {"conversation_id": 3, "source": "automated_agent"}
        }"#;
        let event: PushEvent = serde_json::from_str(raw).expect("decode");
        match event {
            PushEvent::Typing {
                tenant_id, source, ..
            } => {
                assert_eq!(tenant_id, None);
                assert_eq!(source, TypingSource::AutomatedAgent);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
