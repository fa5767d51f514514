use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(TenantId);
id_newtype!(ConversationId);
id_newtype!(CustomerId);

/// Prefix marking a locally generated, not-yet-confirmed message id.
pub const LOCAL_MESSAGE_ID_PREFIX: &str = "local-";

/// Message ids are strings so that server-issued ids and optimistic local ids
/// share one type. Local ids carry the [`LOCAL_MESSAGE_ID_PREFIX`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn local() -> Self {
        Self(format!("{LOCAL_MESSAGE_ID_PREFIX}{}", Uuid::new_v4()))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_MESSAGE_ID_PREFIX)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Facebook,
    Whatsapp,
    Telegram,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    Customer,
    Staff,
    AutomatedAgent,
}

impl SenderRole {
    pub fn is_customer(self) -> bool {
        self == Self::Customer
    }
}

/// Delivery progress of an outgoing message. Transitions only move forward,
/// except `Failed`, which is terminal and explicitly retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Composing,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Composing => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            Self::Failed => 4,
        }
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        if self == Self::Failed {
            return false;
        }
        if next == Self::Failed {
            return true;
        }
        next.rank() > self.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    File,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_message_ids_are_marked_and_unique() {
        let a = MessageId::local();
        let b = MessageId::local();
        assert!(a.is_local());
        assert!(b.is_local());
        assert_ne!(a, b);
        assert!(!MessageId::new("m_17").is_local());
    }

    #[test]
    fn delivery_status_is_monotonic_except_failed() {
        use DeliveryStatus::*;
        assert!(Composing.can_advance_to(Sent));
        assert!(Sent.can_advance_to(Read));
        assert!(Composing.can_advance_to(Failed));
        assert!(!Read.can_advance_to(Sent));
        assert!(!Failed.can_advance_to(Sent));
        assert!(!Failed.can_advance_to(Failed));
    }
}
