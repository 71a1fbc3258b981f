use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        multipart::MultipartError, DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request,
        State,
    },
    http::{header::CONTENT_TYPE, Method, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use guardpost_shared::constants::SERVICE_NAME;
use guardpost_shared::protocol::{SeenResponse, SendMessageRequest, SendMessageResponse};
use guardpost_shared::{AttachmentRef, Conversation, ConversationId, ConversationKind, Message, UserId};
use guardpost_store::HistoryPage;

use crate::attachments::{content_type, AttachmentStore};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::facade::MessagingFacade;
use crate::gateway::RealtimeGateway;
use crate::identity::{AuthUser, IdentityGateway};
use crate::ws;

/// Room for multipart framing and the JSON payload on top of an attachment.
const BODY_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub facade: MessagingFacade,
    pub identity: Arc<dyn IdentityGateway>,
    pub attachments: Arc<AttachmentStore>,
    pub gateway: RealtimeGateway,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers(Any);

    let body_limit = state.config.max_attachment_size.saturating_add(BODY_OVERHEAD);

    Router::new()
        .route("/health", get(health_check))
        .route("/presence", get(online_users))
        .route("/attachments", post(upload_attachment))
        .route("/attachments/:reference", get(download_attachment))
        .route("/conversations", get(list_conversations))
        .route("/conversations/messages", post(send_message))
        .route("/conversations/:id/messages", get(conversation_messages))
        .route("/conversations/:id/seen", patch(mark_seen))
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    connections: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceResponse {
    online_users: Vec<UserId>,
}

#[derive(Deserialize)]
struct ListQuery {
    kind: Option<ConversationKind>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        connections: state.gateway.connection_count().await,
    })
}

async fn online_users(
    State(state): State<AppState>,
    AuthUser(_caller): AuthUser,
) -> Json<PresenceResponse> {
    Json(PresenceResponse {
        online_users: state.gateway.online_users().await,
    })
}

fn multipart_error(err: MultipartError, max: usize) -> ServerError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ServerError::PayloadTooLarge { max }
    } else {
        ServerError::BadRequest(format!("Multipart error: {}", err.body_text()))
    }
}

async fn upload_attachment(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    mut multipart: Multipart,
) -> Result<Json<AttachmentRef>, ServerError> {
    let max = state.attachments.max_size();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, max))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name == "file" {
            let file_name = field.file_name().unwrap_or_default().to_string();
            let data = field.bytes().await.map_err(|e| multipart_error(e, max))?;

            let stored = state.attachments.store(&file_name, &data).await?;

            info!(
                user = %caller.user_id,
                reference = %stored.file_path,
                size = data.len(),
                "Attachment uploaded"
            );

            return Ok(Json(stored));
        }
    }

    Err(ServerError::BadRequest(
        "Missing 'file' field in multipart form".to_string(),
    ))
}

async fn download_attachment(
    State(state): State<AppState>,
    AuthUser(_caller): AuthUser,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    let data = state.attachments.load(&reference).await?;
    Ok(([(CONTENT_TYPE, content_type(&reference))], data))
}

async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Conversation>>, ServerError> {
    let conversations = state.facade.list_conversations(&caller, query.kind).await?;
    Ok(Json(conversations))
}

/// A send request from either a JSON body or a multipart form with a
/// `payload` JSON part and an optional `file` part. A file is stored before
/// the request reaches the facade and replaces any `attachmentRef`.
pub struct SendForm(pub SendMessageRequest);

#[async_trait]
impl FromRequest<AppState> for SendForm {
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        let is_multipart = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("multipart/form-data"));

        if !is_multipart {
            let Json(request) = Json::<SendMessageRequest>::from_request(req, state)
                .await
                .map_err(|e| ServerError::BadRequest(e.body_text()))?;
            return Ok(SendForm(request));
        }

        let max = state.attachments.max_size();
        let mut multipart = Multipart::from_request(req, state)
            .await
            .map_err(|e| ServerError::BadRequest(e.body_text()))?;

        let mut payload = None;
        let mut upload = None;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| multipart_error(e, max))?
        {
            let name = field.name().unwrap_or("").to_string();
            match name.as_str() {
                "payload" => {
                    let raw = field.text().await.map_err(|e| multipart_error(e, max))?;
                    let parsed: SendMessageRequest = serde_json::from_str(&raw)
                        .map_err(|e| ServerError::BadRequest(format!("Invalid payload: {e}")))?;
                    payload = Some(parsed);
                }
                "file" => {
                    let file_name = field.file_name().unwrap_or_default().to_string();
                    let data = field.bytes().await.map_err(|e| multipart_error(e, max))?;
                    upload = Some((file_name, data));
                }
                _ => {}
            }
        }

        let mut request = payload.ok_or_else(|| {
            ServerError::BadRequest("Missing 'payload' field in multipart form".to_string())
        })?;

        if let Some((file_name, data)) = upload.filter(|(_, data)| !data.is_empty()) {
            request.attachment_ref = Some(state.attachments.store(&file_name, &data).await?);
        }

        Ok(SendForm(request))
    }
}

async fn send_message(
    State(state): State<AppState>,
    AuthUser(sender): AuthUser,
    SendForm(request): SendForm,
) -> Result<Json<SendMessageResponse>, ServerError> {
    let response = state.facade.send_message(&sender, request).await?;
    Ok(Json(response))
}

async fn conversation_messages(
    State(state): State<AppState>,
    AuthUser(viewer): AuthUser,
    Path(id): Path<ConversationId>,
    Query(page): Query<HistoryPage>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let messages = state.facade.open_conversation(&viewer, id, page).await?;
    Ok(Json(messages))
}

async fn mark_seen(
    State(state): State<AppState>,
    AuthUser(viewer): AuthUser,
    Path(id): Path<ConversationId>,
) -> Result<Json<SeenResponse>, ServerError> {
    let response = state.facade.mark_seen(&viewer, id).await?;
    Ok(Json(response))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::header::AUTHORIZATION;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::testing::{test_app, MAX_TEST_ATTACHMENT};

    const BOUNDARY: &str = "guardpost-test-boundary";

    async fn call(router: &Router, request: axum::http::Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        match body {
            Some(body) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Body {
        let mut body = Vec::new();
        for (name, file_name, data) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match file_name {
                Some(file_name) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        Body::from(body)
    }

    fn multipart_request(uri: &str, token: &str, body: Body) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(body)
            .unwrap()
    }

    fn hello_guard(text: &str) -> Value {
        json!({
            "senderId": "sub-a",
            "receiverId": "guard-b",
            "receiverRole": "Guard",
            "kind": "staff_guard",
            "text": text,
        })
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app().await;
        let router = build_router(app.state.clone());

        let (status, body) = call(&router, request("GET", "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], SERVICE_NAME);
        assert_eq!(body["connections"], 0);
    }

    #[tokio::test]
    async fn test_requests_need_a_known_token() {
        let app = test_app().await;
        let router = build_router(app.state.clone());

        let (status, _) = call(
            &router,
            request("POST", "/conversations/messages", None, Some(hello_guard("hi"))),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&router, request("GET", "/conversations", Some("tok-nope"), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_first_contact_then_seen_flow() {
        let app = test_app().await;
        let router = build_router(app.state.clone());

        let (status, sent) = call(
            &router,
            request(
                "POST",
                "/conversations/messages",
                Some("tok-sub-a"),
                Some(hello_guard("Hello")),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sent["message"]["text"], "Hello");
        assert_eq!(sent["message"]["seenByRecipient"], false);
        let id = sent["conversation"]["id"].as_str().unwrap().to_string();
        assert_eq!(
            sent["conversation"]["lastMessage"]["messageId"],
            sent["message"]["id"]
        );

        let (status, listed) =
            call(&router, request("GET", "/conversations", Some("tok-guard-b"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, history) = call(
            &router,
            request(
                "GET",
                &format!("/conversations/{id}/messages"),
                Some("tok-guard-b"),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history[0]["seenByRecipient"], true);

        let (status, listed) =
            call(&router, request("GET", "/conversations", Some("tok-sub-a"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed[0]["lastMessage"]["seenByRecipient"], true);

        let (status, seen) = call(
            &router,
            request(
                "PATCH",
                &format!("/conversations/{id}/seen"),
                Some("tok-guard-b"),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(seen["updated"], 0);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let app = test_app().await;
        let router = build_router(app.state.clone());

        let (status, body) = call(
            &router,
            request(
                "POST",
                "/conversations/messages",
                Some("tok-sub-a"),
                Some(hello_guard("")),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("text or an attachment"));

        let stale = json!({
            "conversationId": ConversationId::new(),
            "text": "still there?",
        });
        let (status, _) = call(
            &router,
            request("POST", "/conversations/messages", Some("tok-sub-a"), Some(stale)),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, sent) = call(
            &router,
            request(
                "POST",
                "/conversations/messages",
                Some("tok-sub-a"),
                Some(hello_guard("private")),
            ),
        )
        .await;
        let id = sent["conversation"]["id"].as_str().unwrap().to_string();

        let (status, _) = call(
            &router,
            request(
                "GET",
                &format!("/conversations/{id}/messages"),
                Some("tok-guard-c"),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &router,
            request(
                "PATCH",
                &format!("/conversations/{}/seen", ConversationId::new()),
                Some("tok-guard-b"),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_history_paging_and_kind_filter() {
        let app = test_app().await;
        let router = build_router(app.state.clone());

        let mut id = String::new();
        for n in 0..5 {
            let (_, sent) = call(
                &router,
                request(
                    "POST",
                    "/conversations/messages",
                    Some("tok-sub-a"),
                    Some(hello_guard(&format!("msg {n}"))),
                ),
            )
            .await;
            id = sent["conversation"]["id"].as_str().unwrap().to_string();
        }

        let (_, newest) = call(
            &router,
            request(
                "GET",
                &format!("/conversations/{id}/messages?limit=2"),
                Some("tok-sub-a"),
                None,
            ),
        )
        .await;
        let newest = newest.as_array().unwrap().clone();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0]["text"], "msg 3");
        assert_eq!(newest[1]["text"], "msg 4");

        let cursor = newest[0]["seq"].as_i64().unwrap();
        let (_, older) = call(
            &router,
            request(
                "GET",
                &format!("/conversations/{id}/messages?before={cursor}&limit=10"),
                Some("tok-sub-a"),
                None,
            ),
        )
        .await;
        let texts: Vec<&str> = older
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["text"].as_str().unwrap())
            .collect();
        assert_eq!(texts, vec!["msg 0", "msg 1", "msg 2"]);

        let (_, applicant_chats) = call(
            &router,
            request(
                "GET",
                "/conversations?kind=staff_applicant",
                Some("tok-sub-a"),
                None,
            ),
        )
        .await;
        assert!(applicant_chats.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_multipart_send_with_file() {
        let app = test_app().await;
        let router = build_router(app.state.clone());

        let payload = json!({
            "receiverId": "applicant-d",
            "kind": "staff_applicant",
        })
        .to_string();
        let body = multipart_body(&[
            ("payload", None, payload.as_bytes()),
            ("file", Some("licence.png"), &b"fake png bytes"[..]),
        ]);

        let (status, sent) = call(
            &router,
            multipart_request("/conversations/messages", "tok-sub-a", body),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sent["message"]["fileName"], "licence.png");
        let reference = sent["message"]["filePath"].as_str().unwrap().to_string();
        assert!(reference.ends_with(".png"));

        let response = router
            .clone()
            .oneshot(request(
                "GET",
                &format!("/attachments/{reference}"),
                Some("tok-applicant-d"),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "image/png");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"fake png bytes");
    }

    #[tokio::test]
    async fn test_attachment_upload_limits() {
        let app = test_app().await;
        let router = build_router(app.state.clone());

        let (status, stored) = call(
            &router,
            multipart_request(
                "/attachments",
                "tok-guard-b",
                multipart_body(&[("file", Some("notes.txt"), &b"gate code changed"[..])]),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stored["fileName"], "notes.txt");

        let oversized = vec![b'x'; MAX_TEST_ATTACHMENT + 1];
        let (status, _) = call(
            &router,
            multipart_request(
                "/attachments",
                "tok-guard-b",
                multipart_body(&[("file", Some("big.bin"), oversized.as_slice())]),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

        let (status, _) = call(
            &router,
            multipart_request(
                "/attachments",
                "tok-guard-b",
                multipart_body(&[("file", Some("empty.txt"), &b""[..])]),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &router,
            request("GET", "/attachments/..%2Fchat.db", Some("tok-guard-b"), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_presence_endpoint() {
        let app = test_app().await;
        let router = build_router(app.state.clone());

        let handle = app.state.gateway.register(UserId::new("guard-b")).await;
        app.state.gateway.announce_presence(handle.id).await;

        let (status, body) =
            call(&router, request("GET", "/presence", Some("tok-sub-a"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["onlineUsers"], json!(["guard-b"]));
    }
}
