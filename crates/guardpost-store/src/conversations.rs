//! Conversation directory: lookup and idempotent creation of two-party
//! conversations, keyed by `(kind, lower user id, higher user id)`.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use guardpost_shared::{
    Conversation, ConversationId, ConversationKind, MessageId, MessageSummary, Participant,
    PendingConversation, UserId,
};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::rows::{kind_from_sql, now, role_from_sql, ts_from_sql, ts_to_sql, uuid_from_sql};

pub(crate) const CONVERSATION_COLUMNS: &str = "id, kind,
     user_a_id, user_a_role, user_a_name,
     user_b_id, user_b_role, user_b_name,
     last_message_id, last_sender_id, last_text, last_file_name, last_seen, last_message_at,
     created_at";

impl Database {
    /// Fetch a single conversation by id.
    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        load_conversation(self.conn(), id)
    }

    /// All conversations `user_id` takes part in, newest activity first,
    /// optionally restricted to one kind.
    pub fn list_conversations_for_user(
        &self,
        user_id: &UserId,
        kind: Option<ConversationKind>,
    ) -> Result<Vec<Conversation>> {
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS}
             FROM conversations
             WHERE (user_a_id = ?1 OR user_b_id = ?1)
               AND (?2 IS NULL OR kind = ?2)
             ORDER BY COALESCE(last_message_at, created_at) DESC, id ASC"
        );
        let mut stmt = self.conn().prepare(&sql)?;

        let rows = stmt.query_map(
            params![user_id.as_str(), kind.map(|k| k.as_str())],
            row_to_conversation,
        )?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }
}

pub(crate) fn load_conversation(conn: &Connection, id: ConversationId) -> Result<Conversation> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1");
    conn.query_row(&sql, params![id.to_string()], row_to_conversation)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Sqlite(other),
        })
}

/// Return the conversation for the pending pair, creating it if this kind
/// has none yet. Runs on any connection, including an open transaction;
/// new rows get the pair-derived id.
///
/// Safe to race from several connections: the losing insert hits the pair
/// index and returns the winner's row instead of an error. Stale embedded
/// names or roles on an existing row are refreshed from the pending
/// participants.
pub(crate) fn resolve_or_create(
    conn: &Connection,
    pending: &PendingConversation,
) -> Result<Conversation> {
    let [a, b] = pending.participants();

    if let Some(existing) = find_by_pair(conn, pending.kind, &a.user_id, &b.user_id)? {
        return refresh_participants(conn, existing, pending.participants());
    }

    let conversation = Conversation {
        id: pending.conversation_id(),
        kind: pending.kind,
        participants: pending.participants().clone(),
        last_message: None,
        created_at: now(),
    };

    match insert_conversation(conn, &conversation) {
        Ok(()) => {
            info!(
                conversation = %conversation.id,
                kind = %conversation.kind,
                user_a = %a.user_id,
                user_b = %b.user_id,
                "created conversation"
            );
            Ok(conversation)
        }
        Err(StoreError::Sqlite(e)) if is_unique_violation(&e) => {
            debug!(
                kind = %pending.kind,
                user_a = %a.user_id,
                user_b = %b.user_id,
                "lost conversation creation race, using existing row"
            );
            find_by_pair(conn, pending.kind, &a.user_id, &b.user_id)?.ok_or(StoreError::NotFound)
        }
        Err(e) => Err(e),
    }
}

/// Rewrite embedded participant fields that no longer match the
/// authoritative copies. Returns the conversation as stored afterwards.
fn refresh_participants(
    conn: &Connection,
    mut conversation: Conversation,
    fresh: &[Participant; 2],
) -> Result<Conversation> {
    if conversation.participants == *fresh {
        return Ok(conversation);
    }

    conn.execute(
        "UPDATE conversations
         SET user_a_role = ?2, user_a_name = ?3, user_b_role = ?4, user_b_name = ?5
         WHERE id = ?1",
        params![
            conversation.id.to_string(),
            fresh[0].role.as_str(),
            fresh[0].display_name,
            fresh[1].role.as_str(),
            fresh[1].display_name,
        ],
    )?;

    debug!(conversation = %conversation.id, "refreshed stale participant details");
    conversation.participants = fresh.clone();
    Ok(conversation)
}

fn find_by_pair(
    conn: &Connection,
    kind: ConversationKind,
    user_a: &UserId,
    user_b: &UserId,
) -> Result<Option<Conversation>> {
    let sql = format!(
        "SELECT {CONVERSATION_COLUMNS}
         FROM conversations
         WHERE kind = ?1 AND user_a_id = ?2 AND user_b_id = ?3"
    );
    let found = conn
        .query_row(
            &sql,
            params![kind.as_str(), user_a.as_str(), user_b.as_str()],
            row_to_conversation,
        )
        .optional()?;
    Ok(found)
}

fn insert_conversation(conn: &Connection, conversation: &Conversation) -> Result<()> {
    let [a, b] = &conversation.participants;
    conn.execute(
        "INSERT INTO conversations
             (id, kind, user_a_id, user_a_role, user_a_name,
              user_b_id, user_b_role, user_b_name, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            conversation.id.to_string(),
            conversation.kind.as_str(),
            a.user_id.as_str(),
            a.role.as_str(),
            a.display_name,
            b.user_id.as_str(),
            b.role.as_str(),
            b.display_name,
            ts_to_sql(&conversation.created_at),
        ],
    )?;
    Ok(())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

/// Map a row selected with [`CONVERSATION_COLUMNS`] to a [`Conversation`].
pub(crate) fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let id_str: String = row.get(0)?;
    let kind_str: String = row.get(1)?;

    let mut participants = Vec::with_capacity(2);
    for base in [2, 5] {
        let user_id: String = row.get(base)?;
        let role_str: String = row.get(base + 1)?;
        let display_name: String = row.get(base + 2)?;
        participants.push(Participant {
            user_id: UserId(user_id),
            role: role_from_sql(base + 1, &role_str)?,
            display_name,
        });
    }
    let second = participants.pop();
    let first = participants.pop();
    let (Some(first), Some(second)) = (first, second) else {
        return Err(rusqlite::Error::InvalidColumnIndex(2));
    };

    let last_message_id: Option<String> = row.get(8)?;
    let last_message = match last_message_id {
        Some(message_id) => {
            let sender_id: String = row.get(9)?;
            let text: Option<String> = row.get(10)?;
            let file_name: Option<String> = row.get(11)?;
            let seen: bool = row.get(12)?;
            let at_str: String = row.get(13)?;
            Some(MessageSummary {
                message_id: MessageId(uuid_from_sql(8, &message_id)?),
                sender_id: UserId(sender_id),
                text: text.unwrap_or_default(),
                file_name,
                seen_by_recipient: seen,
                created_at: ts_from_sql(13, &at_str)?,
            })
        }
        None => None,
    };

    let created_str: String = row.get(14)?;

    Ok(Conversation {
        id: ConversationId(uuid_from_sql(0, &id_str)?),
        kind: kind_from_sql(1, &kind_str)?,
        participants: [first, second],
        last_message,
        created_at: ts_from_sql(14, &created_str)?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};

    use guardpost_shared::Role;

    use super::*;

    fn participant(id: &str, role: Role, name: &str) -> Participant {
        Participant::new(UserId::new(id), role, name)
    }

    fn staff_guard(staff: &str, guard: &str) -> PendingConversation {
        PendingConversation::new(
            ConversationKind::StaffGuard,
            participant(staff, Role::Subadmin, "Sam Staff"),
            participant(guard, Role::Guard, "Gail Guard"),
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_is_stable_for_either_order() {
        let db = Database::open_in_memory().unwrap();

        let first = resolve_or_create(db.conn(), &staff_guard("staff-1", "guard-1")).unwrap();
        let reversed = PendingConversation::new(
            ConversationKind::StaffGuard,
            participant("guard-1", Role::Guard, "Gail Guard"),
            participant("staff-1", Role::Subadmin, "Sam Staff"),
        )
        .unwrap();
        let second = resolve_or_create(db.conn(), &reversed).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.id, reversed.conversation_id());
        assert!(second.last_message.is_none());
        assert_eq!(db.get_conversation(first.id).unwrap(), first);
    }

    #[test]
    fn test_kinds_are_independent_pairing_spaces() {
        let db = Database::open_in_memory().unwrap();
        let staff = participant("staff-1", Role::Admin, "Ada Admin");

        let guard_chat = PendingConversation::new(
            ConversationKind::StaffGuard,
            staff.clone(),
            participant("user-9", Role::Guard, "Uma"),
        )
        .unwrap();
        let applicant_chat = PendingConversation::new(
            ConversationKind::StaffApplicant,
            staff,
            participant("user-9", Role::Applicant, "Uma"),
        )
        .unwrap();
        let guard_chat = resolve_or_create(db.conn(), &guard_chat).unwrap();
        let applicant_chat = resolve_or_create(db.conn(), &applicant_chat).unwrap();

        assert_ne!(guard_chat.id, applicant_chat.id);

        let all = db
            .list_conversations_for_user(&UserId::new("user-9"), None)
            .unwrap();
        assert_eq!(all.len(), 2);

        let guards_only = db
            .list_conversations_for_user(&UserId::new("user-9"), Some(ConversationKind::StaffGuard))
            .unwrap();
        assert_eq!(guards_only.len(), 1);
        assert_eq!(guards_only[0].id, guard_chat.id);
    }

    #[test]
    fn test_stale_participant_names_are_refreshed() {
        let db = Database::open_in_memory().unwrap();
        let original = resolve_or_create(db.conn(), &staff_guard("staff-1", "guard-1")).unwrap();

        let renamed = PendingConversation::new(
            ConversationKind::StaffGuard,
            participant("staff-1", Role::Admin, "Sam Staff"),
            participant("guard-1", Role::Guard, "Gail Married-Name"),
        )
        .unwrap();
        let refreshed = resolve_or_create(db.conn(), &renamed).unwrap();

        assert_eq!(refreshed.id, original.id);
        let stored = db.get_conversation(original.id).unwrap();
        assert_eq!(stored.participants[0].role, Role::Admin);
        assert_eq!(stored.participants[1].display_name, "Gail Married-Name");
    }

    #[test]
    fn test_unknown_conversation_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_conversation(ConversationId::new()),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_concurrent_first_contact_creates_one_row() {
        const WRITERS: usize = 8;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");

        // Open (and migrate) every handle up front so the threads only race
        // on the insert itself.
        let handles: Vec<Database> = (0..WRITERS)
            .map(|_| Database::open_at(&path).unwrap())
            .collect();
        let barrier = Arc::new(Barrier::new(WRITERS));

        let threads: Vec<_> = handles
            .into_iter()
            .map(|db| {
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    resolve_or_create(db.conn(), &staff_guard("staff-1", "guard-1"))
                        .unwrap()
                        .id
                })
            })
            .collect();

        let ids: Vec<ConversationId> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert!(ids.iter().all(|id| *id == ids[0]));

        let db = Database::open_at(&path).unwrap();
        let rows: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }
}
