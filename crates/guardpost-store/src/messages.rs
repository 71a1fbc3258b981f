//! Message ledger: append-only messages per conversation, with the parent
//! conversation's summary maintained in the same transaction.

use rusqlite::{params, Connection, TransactionBehavior};
use serde::Deserialize;
use tracing::debug;

use guardpost_shared::constants::MAX_HISTORY_PAGE;
use guardpost_shared::{
    validate_content, AttachmentRef, Conversation, ConversationId, Message, MessageId,
    PendingConversation, Role, UserId,
};

use crate::conversations::{load_conversation, resolve_or_create};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::rows::{now, role_from_sql, ts_from_sql, ts_to_sql, uuid_from_sql};

const MESSAGE_COLUMNS: &str = "seq, id, conversation_id, sender_id, sender_role, text,
     file_path, file_name, seen_by_recipient, created_at";

/// A message about to be appended.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub sender_id: &'a UserId,
    pub sender_role: Role,
    pub text: &'a str,
    pub attachment: Option<&'a AttachmentRef>,
}

/// Optional history window. Without `before`, the newest `limit` messages
/// are returned.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct HistoryPage {
    /// Only messages with a sequence strictly below this cursor
    pub before: Option<i64>,
    pub limit: Option<u32>,
}

impl HistoryPage {
    fn is_unbounded(&self) -> bool {
        self.before.is_none() && self.limit.is_none()
    }
}

/// Outcome of [`Database::mark_seen`].
#[derive(Debug, Clone)]
pub struct SeenUpdate {
    /// Messages flipped to seen by this call
    pub updated: usize,
    /// Whether the conversation's last-message summary changed
    pub summary_changed: bool,
    /// The conversation as stored after the update
    pub conversation: Conversation,
}

impl Database {
    /// Append a message and update the conversation summary atomically.
    ///
    /// `created_at` never precedes the current last message, so ledger
    /// order by `(created_at, seq)` always equals append order.
    pub fn append_message(
        &mut self,
        conversation_id: ConversationId,
        new: NewMessage<'_>,
    ) -> Result<(Message, Conversation)> {
        validate_content(new.text, new.attachment)?;

        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let conversation = load_conversation(&tx, conversation_id)?;
        let appended = insert_message(&tx, conversation, &new)?;
        tx.commit()?;
        Ok(appended)
    }

    /// First message between a pair: the conversation is resolved or
    /// created in the same transaction as the append, so a failed append
    /// leaves no empty conversation behind.
    pub fn append_first_contact(
        &mut self,
        pending: &PendingConversation,
        new: NewMessage<'_>,
    ) -> Result<(Message, Conversation)> {
        validate_content(new.text, new.attachment)?;

        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let conversation = resolve_or_create(&tx, pending)?;
        let appended = insert_message(&tx, conversation, &new)?;
        tx.commit()?;
        Ok(appended)
    }

    /// Messages of a conversation in ledger order (oldest first).
    pub fn history(&self, conversation_id: ConversationId, page: HistoryPage) -> Result<Vec<Message>> {
        // Distinguish "no messages" from "no such conversation".
        load_conversation(self.conn(), conversation_id)?;

        if page.is_unbounded() {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at ASC, seq ASC"
            );
            let mut stmt = self.conn().prepare(&sql)?;
            let rows = stmt.query_map(params![conversation_id.to_string()], row_to_message)?;

            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            return Ok(messages);
        }

        let before = page.before.unwrap_or(i64::MAX);
        let limit = page.limit.unwrap_or(MAX_HISTORY_PAGE).clamp(1, MAX_HISTORY_PAGE);

        let sql = format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE conversation_id = ?1 AND seq < ?2
             ORDER BY created_at DESC, seq DESC
             LIMIT ?3"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![conversation_id.to_string(), before, limit],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// Mark every message not authored by `viewer` as seen.
    ///
    /// Idempotent: with nothing unseen it changes nothing and reports zero.
    pub fn mark_seen(
        &mut self,
        conversation_id: ConversationId,
        viewer: &UserId,
    ) -> Result<SeenUpdate> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut conversation = load_conversation(&tx, conversation_id)?;
        if !conversation.has_participant(viewer) {
            return Err(StoreError::NotParticipant);
        }

        let updated = tx.execute(
            "UPDATE messages
             SET seen_by_recipient = 1
             WHERE conversation_id = ?1 AND sender_id != ?2 AND seen_by_recipient = 0",
            params![conversation_id.to_string(), viewer.as_str()],
        )?;

        let mut summary_changed = false;
        if let Some(last) = conversation.last_message.as_mut() {
            if &last.sender_id != viewer && !last.seen_by_recipient {
                tx.execute(
                    "UPDATE conversations SET last_seen = 1 WHERE id = ?1",
                    params![conversation_id.to_string()],
                )?;
                last.seen_by_recipient = true;
                summary_changed = true;
            }
        }

        tx.commit()?;

        if updated > 0 {
            debug!(
                conversation = %conversation_id,
                viewer = %viewer,
                updated,
                "marked messages seen"
            );
        }

        Ok(SeenUpdate {
            updated,
            summary_changed,
            conversation,
        })
    }
}

fn insert_message(
    conn: &Connection,
    mut conversation: Conversation,
    new: &NewMessage<'_>,
) -> Result<(Message, Conversation)> {
    if !conversation.has_participant(new.sender_id) {
        return Err(StoreError::NotParticipant);
    }

    let created_at = match &conversation.last_message {
        Some(last) if last.created_at > now() => last.created_at,
        _ => now(),
    };

    let attachment = new.attachment.filter(|a| !a.file_path.trim().is_empty());
    let id = MessageId::new();
    let ts = ts_to_sql(&created_at);

    conn.execute(
        "INSERT INTO messages
             (id, conversation_id, sender_id, sender_role, text, file_path, file_name, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id.to_string(),
            conversation.id.to_string(),
            new.sender_id.as_str(),
            new.sender_role.as_str(),
            new.text,
            attachment.map(|a| a.file_path.as_str()),
            attachment.map(|a| a.file_name.as_str()),
            ts,
        ],
    )?;
    let seq = conn.last_insert_rowid();

    let message = Message {
        id,
        seq,
        conversation_id: conversation.id,
        sender_id: new.sender_id.clone(),
        sender_role: new.sender_role,
        text: new.text.to_string(),
        file_path: attachment.map(|a| a.file_path.clone()),
        file_name: attachment.map(|a| a.file_name.clone()),
        seen_by_recipient: false,
        created_at,
    };

    conn.execute(
        "UPDATE conversations
         SET last_message_id = ?2, last_sender_id = ?3, last_text = ?4,
             last_file_name = ?5, last_seen = 0, last_message_at = ?6
         WHERE id = ?1",
        params![
            conversation.id.to_string(),
            id.to_string(),
            new.sender_id.as_str(),
            message.text,
            message.file_name,
            ts,
        ],
    )?;

    debug!(
        conversation = %conversation.id,
        message = %id,
        seq,
        "appended message"
    );

    conversation.last_message = Some(message.summary());
    Ok((message, conversation))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let seq: i64 = row.get(0)?;
    let id_str: String = row.get(1)?;
    let conversation_str: String = row.get(2)?;
    let sender_id: String = row.get(3)?;
    let role_str: String = row.get(4)?;
    let text: String = row.get(5)?;
    let file_path: Option<String> = row.get(6)?;
    let file_name: Option<String> = row.get(7)?;
    let seen_by_recipient: bool = row.get(8)?;
    let ts_str: String = row.get(9)?;

    Ok(Message {
        id: MessageId(uuid_from_sql(1, &id_str)?),
        seq,
        conversation_id: ConversationId(uuid_from_sql(2, &conversation_str)?),
        sender_id: UserId(sender_id),
        sender_role: role_from_sql(4, &role_str)?,
        text,
        file_path,
        file_name,
        seen_by_recipient,
        created_at: ts_from_sql(9, &ts_str)?,
    })
}
