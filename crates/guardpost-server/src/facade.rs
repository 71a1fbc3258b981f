//! The single entry point for anything that creates or reads messages.
//!
//! REST handlers and realtime connections both go through
//! [`MessagingFacade`]; neither touches the store or the gateway's rooms
//! directly for message traffic. Each conversation has its own async lock,
//! held across "persist then broadcast", so two appends to one
//! conversation can never deliver their events out of ledger order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use guardpost_shared::protocol::{
    SeenReceipt, SeenResponse, SendMessageRequest, SendMessageResponse, ServerEvent,
};
use guardpost_shared::{
    validate_content, Conversation, ConversationId, ConversationKind, ConversationRef, Message,
    Participant, PendingConversation, ValidationError,
};
use guardpost_store::{HistoryPage, NewMessage, SeenUpdate};

use crate::attachments::AttachmentStore;
use crate::error::ServerError;
use crate::gateway::{ConnectionId, RealtimeGateway};
use crate::identity::IdentityGateway;
use crate::store::SharedStore;

/// Per-conversation async locks. Entries are weak, so a lock disappears
/// once nobody holds or waits on it.
#[derive(Clone, Default)]
pub struct ConversationLocks {
    locks: Arc<StdMutex<HashMap<ConversationId, Weak<Mutex<()>>>>>,
}

impl ConversationLocks {
    pub async fn lock(&self, id: ConversationId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(&id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    locks.insert(id, Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// Where a send lands. A first contact is only persisted together with
/// its message.
enum Resolved {
    Existing(ConversationId),
    FirstContact(PendingConversation),
}

impl Resolved {
    fn conversation_id(&self) -> ConversationId {
        match self {
            Resolved::Existing(id) => *id,
            Resolved::FirstContact(pending) => pending.conversation_id(),
        }
    }
}

#[derive(Clone)]
pub struct MessagingFacade {
    store: SharedStore,
    gateway: RealtimeGateway,
    identity: Arc<dyn IdentityGateway>,
    attachments: Arc<AttachmentStore>,
    locks: ConversationLocks,
}

impl MessagingFacade {
    pub fn new(
        store: SharedStore,
        gateway: RealtimeGateway,
        identity: Arc<dyn IdentityGateway>,
        attachments: Arc<AttachmentStore>,
    ) -> Self {
        Self {
            store,
            gateway,
            identity,
            attachments,
            locks: ConversationLocks::default(),
        }
    }

    /// Persist a message, creating the conversation on first contact, then
    /// broadcast it. Nothing is broadcast unless the append committed.
    pub async fn send_message(
        &self,
        sender: &Participant,
        request: SendMessageRequest,
    ) -> Result<SendMessageResponse, ServerError> {
        if let Some(claimed) = &request.sender_id {
            if claimed != &sender.user_id {
                return Err(ServerError::Forbidden(
                    "senderId does not match the authenticated user".into(),
                ));
            }
        }

        let target = request.target()?;
        let text = request.text.unwrap_or_default();
        let attachment = request
            .attachment_ref
            .filter(|a| !a.file_path.trim().is_empty());
        validate_content(&text, attachment.as_ref())?;

        if let Some(attachment) = &attachment {
            if !self.attachments.contains(&attachment.file_path).await {
                return Err(ValidationError::InvalidField {
                    field: "attachmentRef",
                    reason: "unknown attachment".into(),
                }
                .into());
            }
        }

        let resolved = self.resolve_target(sender, target).await?;
        let conversation_id = resolved.conversation_id();

        let _guard = self.locks.lock(conversation_id).await;

        let sender_id = sender.user_id.clone();
        let sender_role = sender.role;
        let (message, conversation) = self
            .store
            .call(move |db| {
                let new = NewMessage {
                    sender_id: &sender_id,
                    sender_role,
                    text: &text,
                    attachment: attachment.as_ref(),
                };
                match &resolved {
                    Resolved::Existing(id) => db.append_message(*id, new),
                    Resolved::FirstContact(pending) => db.append_first_contact(pending, new),
                }
            })
            .await?;

        self.gateway
            .emit_to_room(conversation_id, ServerEvent::ReceiveMessage(message.clone()))
            .await;
        self.gateway
            .emit_to_users(
                &conversation.participant_ids(),
                ServerEvent::ConversationUpdated(conversation.clone()),
            )
            .await;

        info!(
            conversation = %conversation_id,
            message = %message.id,
            sender = %message.sender_id,
            "Message sent"
        );

        Ok(SendMessageResponse {
            message,
            conversation,
        })
    }

    async fn resolve_target(
        &self,
        sender: &Participant,
        target: ConversationRef,
    ) -> Result<Resolved, ServerError> {
        match target {
            ConversationRef::Persisted(id) => {
                let conversation = self.store.call(move |db| db.get_conversation(id)).await?;
                if !conversation.has_participant(&sender.user_id) {
                    return Err(ServerError::Forbidden(
                        "Not a participant of this conversation".into(),
                    ));
                }
                Ok(Resolved::Existing(conversation.id))
            }
            ConversationRef::Pending {
                kind,
                receiver_id,
                receiver_role,
            } => {
                let receiver = self
                    .identity
                    .lookup(&receiver_id)
                    .await
                    .ok_or_else(|| ServerError::NotFound(format!("Unknown receiver {receiver_id}")))?;

                if let Some(claimed) = receiver_role {
                    if claimed != receiver.role {
                        return Err(ValidationError::RoleMismatch {
                            claimed,
                            actual: receiver.role,
                        }
                        .into());
                    }
                }

                let pending = PendingConversation::new(kind, sender.clone(), receiver)?;
                Ok(Resolved::FirstContact(pending))
            }
        }
    }

    /// History for a participant, marking the counterpart's messages seen.
    ///
    /// Seen-marking and the history read happen under the conversation
    /// lock, so a message appended concurrently is either in the returned
    /// history (and seen) or delivered afterwards as a new message.
    pub async fn open_conversation(
        &self,
        viewer: &Participant,
        conversation_id: ConversationId,
        page: HistoryPage,
    ) -> Result<Vec<Message>, ServerError> {
        let _guard = self.locks.lock(conversation_id).await;

        let viewer_id = viewer.user_id.clone();
        let (seen, messages) = self
            .store
            .call(move |db| {
                let seen = db.mark_seen(conversation_id, &viewer_id)?;
                let messages = db.history(conversation_id, page)?;
                Ok((seen, messages))
            })
            .await?;

        self.publish_seen(conversation_id, &seen).await;
        Ok(messages)
    }

    /// Mark the counterpart's messages seen without reading history.
    pub async fn mark_seen(
        &self,
        viewer: &Participant,
        conversation_id: ConversationId,
    ) -> Result<SeenResponse, ServerError> {
        let _guard = self.locks.lock(conversation_id).await;

        let viewer_id = viewer.user_id.clone();
        let seen = self
            .store
            .call(move |db| db.mark_seen(conversation_id, &viewer_id))
            .await?;

        self.publish_seen(conversation_id, &seen).await;
        Ok(SeenResponse {
            conversation_id,
            updated: seen.updated,
        })
    }

    async fn publish_seen(&self, conversation_id: ConversationId, seen: &SeenUpdate) {
        if seen.updated > 0 {
            self.gateway
                .emit_to_room(
                    conversation_id,
                    ServerEvent::MessagesSeen(SeenReceipt { conversation_id }),
                )
                .await;
        }
        if seen.summary_changed {
            self.gateway
                .emit_to_users(
                    &seen.conversation.participant_ids(),
                    ServerEvent::ConversationUpdated(seen.conversation.clone()),
                )
                .await;
        }
    }

    /// Subscribe a realtime connection to a conversation's room after
    /// confirming the viewer takes part in it.
    pub async fn join_conversation(
        &self,
        connection: ConnectionId,
        viewer: &Participant,
        conversation_id: ConversationId,
    ) -> Result<(), ServerError> {
        let conversation = self
            .store
            .call(move |db| db.get_conversation(conversation_id))
            .await?;
        if !conversation.has_participant(&viewer.user_id) {
            return Err(ServerError::Forbidden(
                "Not a participant of this conversation".into(),
            ));
        }

        self.gateway.join_room(connection, conversation_id).await;
        Ok(())
    }

    /// The viewer's conversations, most recent activity first.
    pub async fn list_conversations(
        &self,
        viewer: &Participant,
        kind: Option<ConversationKind>,
    ) -> Result<Vec<Conversation>, ServerError> {
        let viewer_id = viewer.user_id.clone();
        self.store
            .call(move |db| db.list_conversations_for_user(&viewer_id, kind))
            .await
    }
}
