use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::{
    AttachmentRef, Conversation, ConversationId, ConversationKind, ConversationRef, Message, Role,
    UserId,
};

/// Events a client sends over its realtime connection.
///
/// Encoded as JSON text frames: `{"event": "<name>", "data": <payload>}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Announce presence for the authenticated user
    #[serde(rename = "userOnline")]
    UserOnline(UserId),

    /// Subscribe this connection to a conversation's room
    #[serde(rename = "joinConversation")]
    JoinConversation(ConversationId),

    /// Mark the counterpart's messages as seen
    #[serde(rename = "mark_seen")]
    MarkSeen(SeenRequest),
}

/// Events the server pushes to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Full online set, sent on every presence change and on connect
    #[serde(rename = "onlineUsers")]
    OnlineUsers(Vec<UserId>),

    /// New message in a joined conversation room
    #[serde(rename = "receiveMessage")]
    ReceiveMessage(Message),

    /// Conversation summary changed; sent to both participants' personal
    /// channels
    #[serde(rename = "conversationUpdated")]
    ConversationUpdated(Conversation),

    /// Messages in the room were seen by their recipient
    #[serde(rename = "messages_seen")]
    MessagesSeen(SeenReceipt),

    /// An inbound event was rejected
    #[serde(rename = "error")]
    Error(EventError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeenRequest {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeenReceipt {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventError {
    pub message: String,
}

impl ClientEvent {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerEvent {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error(EventError {
            message: message.into(),
        })
    }

    /// Event name as it appears on the wire, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::OnlineUsers(_) => "onlineUsers",
            ServerEvent::ReceiveMessage(_) => "receiveMessage",
            ServerEvent::ConversationUpdated(_) => "conversationUpdated",
            ServerEvent::MessagesSeen(_) => "messages_seen",
            ServerEvent::Error(_) => "error",
        }
    }
}

// ─── REST payloads ───

/// Body of `POST /conversations/messages`.
///
/// Either `conversation_id` (optimistic reuse of a known conversation) or
/// `receiver_id` + `kind` must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    /// Must match the authenticated caller when present
    #[serde(default)]
    pub sender_id: Option<UserId>,
    #[serde(default)]
    pub receiver_id: Option<UserId>,
    #[serde(default)]
    pub receiver_role: Option<Role>,
    #[serde(default)]
    pub kind: Option<ConversationKind>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub attachment_ref: Option<AttachmentRef>,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
}

impl SendMessageRequest {
    pub fn target(&self) -> Result<ConversationRef, ValidationError> {
        if let Some(id) = self.conversation_id {
            return Ok(ConversationRef::Persisted(id));
        }
        match (&self.receiver_id, self.kind) {
            (Some(receiver_id), Some(kind)) => Ok(ConversationRef::Pending {
                kind,
                receiver_id: receiver_id.clone(),
                receiver_role: self.receiver_role,
            }),
            _ => Err(ValidationError::MissingTarget),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendMessageResponse {
    pub message: Message,
    pub conversation: Conversation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeenResponse {
    pub conversation_id: ConversationId,
    pub updated: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_wire_names() {
        let id = ConversationId::new();
        let text = format!(
            r#"{{"event":"mark_seen","data":{{"conversationId":"{}","userId":"guard-7"}}}}"#,
            id
        );
        let event = ClientEvent::from_text(&text).unwrap();
        assert_eq!(
            event,
            ClientEvent::MarkSeen(SeenRequest {
                conversation_id: id,
                user_id: UserId::new("guard-7"),
            })
        );

        let online = ClientEvent::from_text(r#"{"event":"userOnline","data":"admin-1"}"#).unwrap();
        assert_eq!(online, ClientEvent::UserOnline(UserId::new("admin-1")));
    }

    #[test]
    fn test_server_event_encoding() {
        let event = ServerEvent::OnlineUsers(vec![UserId::new("a"), UserId::new("b")]);
        let text = event.to_text().unwrap();
        assert_eq!(text, r#"{"event":"onlineUsers","data":["a","b"]}"#);

        let seen = ServerEvent::MessagesSeen(SeenReceipt {
            conversation_id: ConversationId::new(),
        });
        assert!(seen.to_text().unwrap().contains(r#""event":"messages_seen""#));
    }

    #[test]
    fn test_unknown_event_rejected() {
        assert!(ClientEvent::from_text(r#"{"event":"typing","data":null}"#).is_err());
    }

    #[test]
    fn test_send_request_target() {
        let request: SendMessageRequest = serde_json::from_str(
            r#"{"receiverId":"guard-7","receiverRole":"Guard","kind":"staff_guard","text":"Hello"}"#,
        )
        .unwrap();
        assert_eq!(
            request.target().unwrap(),
            ConversationRef::Pending {
                kind: ConversationKind::StaffGuard,
                receiver_id: UserId::new("guard-7"),
                receiver_role: Some(Role::Guard),
            }
        );

        let empty = SendMessageRequest::default();
        assert_eq!(empty.target(), Err(ValidationError::MissingTarget));
    }
}
