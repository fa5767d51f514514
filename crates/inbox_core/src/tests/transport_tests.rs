use super::*;
use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::{TimeZone, Utc};
use shared::{
    domain::{Channel, ConversationId, CustomerId, MessageId, SenderRole, TenantId},
    protocol::{PageInfo, TypingSource},
};
use tokio::{net::TcpListener, sync::Mutex};

fn sample_snapshot() -> ConversationSnapshot {
    ConversationSnapshot {
        conversation_id: ConversationId(8),
        tenant_id: Some(TenantId(4)),
        customer_id: CustomerId(80),
        customer_name: "ada".to_string(),
        channel: Channel::Facebook,
        preview_text: "hi".to_string(),
        preview_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        preview_from_customer: true,
        unread_count: 1,
        messages: Vec::new(),
    }
}

fn sample_payload() -> MessagePayload {
    MessagePayload {
        id: MessageId::new("m_1"),
        conversation_id: ConversationId(8),
        sender_role: SenderRole::Customer,
        content: "hi".to_string(),
        timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        attachment: None,
    }
}

#[derive(Clone, Default)]
struct ApiState {
    list_queries: Arc<Mutex<Vec<(i64, u32, u32)>>>,
    message_queries: Arc<Mutex<Vec<(i64, u32, u32)>>>,
    send_bodies: Arc<Mutex<Vec<serde_json::Value>>>,
    upload_queries: Arc<Mutex<Vec<(String, String)>>>,
    read_calls: Arc<Mutex<Vec<i64>>>,
    fail_list: Arc<Mutex<bool>>,
}

#[derive(Deserialize)]
struct ListQuery {
    tenant_id: i64,
    page: u32,
    page_size: u32,
}

async fn list_conversations(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ConversationPage>, StatusCode> {
    if *state.fail_list.lock().await {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    state
        .list_queries
        .lock()
        .await
        .push((query.tenant_id, query.page, query.page_size));
    Ok(Json(ConversationPage {
        items: vec![sample_snapshot()],
        pagination: PageInfo {
            total: 1,
            has_next_page: true,
        },
    }))
}

#[derive(Deserialize)]
struct PageQuery {
    page: u32,
    page_size: u32,
}

async fn conversation_messages(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> Json<Vec<MessagePayload>> {
    state
        .message_queries
        .lock()
        .await
        .push((id, query.page, query.page_size));
    Json(vec![sample_payload()])
}

async fn conversation_detail(Path(_id): Path<i64>) -> Json<ConversationSnapshot> {
    Json(sample_snapshot())
}

async fn post_message(
    State(state): State<ApiState>,
    Path(_id): Path<i64>,
    Json(body): Json<serde_json::Value>,
) -> Json<SendReceipt> {
    state.send_bodies.lock().await.push(body);
    Json(SendReceipt {
        id: MessageId::new("m_500"),
        timestamp: Utc.timestamp_opt(1_700_000_100, 0).unwrap(),
    })
}

#[derive(Deserialize)]
struct UploadQuery {
    filename: String,
    kind: String,
}

async fn upload(
    State(state): State<ApiState>,
    Query(query): Query<UploadQuery>,
    body: axum::body::Bytes,
) -> Json<serde_json::Value> {
    state
        .upload_queries
        .lock()
        .await
        .push((query.filename.clone(), query.kind));
    Json(serde_json::json!({
        "uri": format!("https://cdn.test/{}", query.filename),
        "size_bytes": body.len(),
    }))
}

async fn mark_read(State(state): State<ApiState>, Path(id): Path<i64>) -> StatusCode {
    state.read_calls.lock().await.push(id);
    StatusCode::NO_CONTENT
}

async fn ws_events(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|mut socket| async move {
        let typing = PushEvent::Typing {
            tenant_id: Some(TenantId(4)),
            conversation_id: ConversationId(8),
            source: TypingSource::Customer,
        };
        let _ = socket
            .send(AxumWsMessage::Text(
                serde_json::to_string(&typing).expect("encode"),
            ))
            .await;
        // an undecodable frame must be skipped, not kill the stream
        let _ = socket
            .send(AxumWsMessage::Text("not an event".to_string()))
            .await;
        let message = PushEvent::NewMessage {
            tenant_id: Some(TenantId(4)),
            message: sample_payload(),
        };
        let _ = socket
            .send(AxumWsMessage::Text(
                serde_json::to_string(&message).expect("encode"),
            ))
            .await;
    })
}

async fn spawn_api_server() -> Result<(String, ApiState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = ApiState::default();
    let app = Router::new()
        .route("/conversations", get(list_conversations))
        .route("/conversations/:id", get(conversation_detail))
        .route(
            "/conversations/:id/messages",
            get(conversation_messages).post(post_message),
        )
        .route("/conversations/:id/read", post(mark_read))
        .route("/uploads", post(upload))
        .route("/events", get(ws_events))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), state))
}

#[tokio::test]
async fn fetch_conversations_passes_paging_and_decodes() {
    let (server_url, state) = spawn_api_server().await.expect("spawn server");
    let backend = HttpSupportBackend::new(server_url);

    let page = backend
        .fetch_conversations(TenantId(4), 2, 25)
        .await
        .expect("fetch");

    assert_eq!(state.list_queries.lock().await.clone(), vec![(4, 2, 25)]);
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].conversation_id, ConversationId(8));
    assert!(page.pagination.has_next_page);
}

#[tokio::test]
async fn fetch_failures_surface_as_errors() {
    let (server_url, state) = spawn_api_server().await.expect("spawn server");
    *state.fail_list.lock().await = true;
    let backend = HttpSupportBackend::new(server_url);

    backend
        .fetch_conversations(TenantId(4), 1, 20)
        .await
        .expect_err("server error must propagate");
}

#[tokio::test]
async fn fetch_messages_and_detail_decode() {
    let (server_url, state) = spawn_api_server().await.expect("spawn server");
    let backend = HttpSupportBackend::new(server_url);

    let messages = backend
        .fetch_messages(ConversationId(8), 3, 30)
        .await
        .expect("messages");
    assert_eq!(state.message_queries.lock().await.clone(), vec![(8, 3, 30)]);
    assert_eq!(messages[0].id, MessageId::new("m_1"));

    let detail = backend
        .fetch_conversation_detail(ConversationId(8))
        .await
        .expect("detail");
    assert_eq!(detail.customer_name, "ada");
}

#[tokio::test]
async fn send_message_posts_content_and_attachment_reference() {
    let (server_url, state) = spawn_api_server().await.expect("spawn server");
    let backend = HttpSupportBackend::new(server_url);
    let attachment = Attachment {
        uri: "https://cdn.test/photo.png".to_string(),
        kind: AttachmentKind::Image,
        size_bytes: 512,
    };

    let receipt = backend
        .send_message(ConversationId(8), "hello there", Some(&attachment))
        .await
        .expect("send");
    assert_eq!(receipt.id, MessageId::new("m_500"));

    let bodies = state.send_bodies.lock().await.clone();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["content"], "hello there");
    assert_eq!(bodies[0]["attachment"]["uri"], "https://cdn.test/photo.png");
}

#[tokio::test]
async fn upload_returns_the_stored_reference() {
    let (server_url, state) = spawn_api_server().await.expect("spawn server");
    let backend = HttpSupportBackend::new(server_url);

    let stored = backend
        .upload_attachment(AttachmentUpload {
            filename: "invoice.pdf".to_string(),
            kind: AttachmentKind::File,
            bytes: vec![0u8; 64],
        })
        .await
        .expect("upload");

    assert_eq!(stored.uri, "https://cdn.test/invoice.pdf");
    assert_eq!(stored.kind, AttachmentKind::File);
    assert_eq!(stored.size_bytes, 64);
    assert_eq!(
        state.upload_queries.lock().await.clone(),
        vec![("invoice.pdf".to_string(), "file".to_string())]
    );
}

#[tokio::test]
async fn mark_read_hits_the_endpoint() {
    let (server_url, state) = spawn_api_server().await.expect("spawn server");
    let backend = HttpSupportBackend::new(server_url);

    backend
        .mark_conversation_read(ConversationId(8))
        .await
        .expect("mark read");
    assert_eq!(state.read_calls.lock().await.clone(), vec![8]);
}

#[tokio::test]
async fn push_stream_decodes_events_and_skips_garbage() {
    let (server_url, _state) = spawn_api_server().await.expect("spawn server");

    let stream = connect_push_events(&server_url, TenantId(4))
        .await
        .expect("connect");
    let events: Vec<PushEvent> = tokio::time::timeout(Duration::from_secs(5), stream.collect())
        .await
        .expect("stream must end when the socket closes");

    assert_eq!(events.len(), 2, "undecodable frame skipped");
    assert!(matches!(
        events[0],
        PushEvent::Typing {
            conversation_id: ConversationId(8),
            source: TypingSource::Customer,
            ..
        }
    ));
    match &events[1] {
        PushEvent::NewMessage { tenant_id, message } => {
            assert_eq!(*tenant_id, Some(TenantId(4)));
            assert_eq!(message.content, "hi");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}
