//! Production implementation of the engine's collaborator ports: REST calls
//! over HTTP and the push-event channel over WebSocket.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{AttachmentKind, ConversationId, TenantId},
    protocol::{
        Attachment, ConversationPage, ConversationSnapshot, MessagePayload, PushEvent,
        SendReceipt,
    },
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::warn;

use crate::{AttachmentUpload, SupportBackend};

pub struct HttpSupportBackend {
    http: Client,
    server_url: String,
}

impl HttpSupportBackend {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SendMessageHttpRequest<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachment: Option<&'a Attachment>,
}

#[derive(Debug, Deserialize)]
struct UploadHttpResponse {
    uri: String,
    size_bytes: u64,
}

fn kind_param(kind: AttachmentKind) -> &'static str {
    match kind {
        AttachmentKind::Image => "image",
        AttachmentKind::File => "file",
    }
}

#[async_trait]
impl SupportBackend for HttpSupportBackend {
    async fn fetch_conversations(
        &self,
        tenant: TenantId,
        page: u32,
        page_size: u32,
    ) -> Result<ConversationPage> {
        self.http
            .get(format!("{}/conversations", self.server_url))
            .query(&[
                ("tenant_id", tenant.0),
                ("page", i64::from(page)),
                ("page_size", i64::from(page_size)),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid conversation list payload")
    }

    async fn fetch_messages(
        &self,
        conversation: ConversationId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<MessagePayload>> {
        self.http
            .get(format!(
                "{}/conversations/{}/messages",
                self.server_url, conversation.0
            ))
            .query(&[("page", i64::from(page)), ("page_size", i64::from(page_size))])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid message history payload")
    }

    async fn fetch_conversation_detail(
        &self,
        conversation: ConversationId,
    ) -> Result<ConversationSnapshot> {
        self.http
            .get(format!(
                "{}/conversations/{}",
                self.server_url, conversation.0
            ))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid conversation detail payload")
    }

    async fn send_message(
        &self,
        conversation: ConversationId,
        content: &str,
        attachment: Option<&Attachment>,
    ) -> Result<SendReceipt> {
        self.http
            .post(format!(
                "{}/conversations/{}/messages",
                self.server_url, conversation.0
            ))
            .json(&SendMessageHttpRequest {
                content,
                attachment,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid send receipt payload")
    }

    async fn upload_attachment(&self, upload: AttachmentUpload) -> Result<Attachment> {
        let kind = upload.kind;
        let response: UploadHttpResponse = self
            .http
            .post(format!("{}/uploads", self.server_url))
            .query(&[
                ("filename", upload.filename.as_str()),
                ("kind", kind_param(kind)),
            ])
            .body(upload.bytes)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid upload response payload")?;
        Ok(Attachment {
            uri: response.uri,
            kind,
            size_bytes: response.size_bytes,
        })
    }

    async fn mark_conversation_read(&self, conversation: ConversationId) -> Result<()> {
        self.http
            .post(format!(
                "{}/conversations/{}/read",
                self.server_url, conversation.0
            ))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Open the push-event WebSocket for one tenant. Undecodable frames and
/// transport errors are logged and skipped; the stream ends when the socket
/// closes.
pub async fn connect_push_events(
    server_url: &str,
    tenant: TenantId,
) -> Result<impl Stream<Item = PushEvent>> {
    let ws_url = if server_url.starts_with("https://") {
        server_url.replacen("https://", "wss://", 1)
    } else if server_url.starts_with("http://") {
        server_url.replacen("http://", "ws://", 1)
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    let ws_url = format!("{ws_url}/events?tenant_id={}", tenant.0);
    let (ws_stream, _) = connect_async(&ws_url)
        .await
        .with_context(|| format!("failed to connect push socket: {ws_url}"))?;
    let (_, reader) = ws_stream.split();

    Ok(reader.filter_map(|frame| async move {
        match frame {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<PushEvent>(&text) {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!(error = %err, "push: undecodable event payload skipped");
                    None
                }
            },
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "push: websocket receive failed");
                None
            }
        }
    }))
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
