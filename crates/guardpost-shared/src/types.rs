use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::MAX_TEXT_LEN;
use crate::error::ValidationError;

/// Namespace for pair-derived conversation ids.
const CONVERSATION_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b8e_93d4_4a57_b0e1_52c7_d8a9_3f60);

// User identity = opaque id issued by the identity gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    Subadmin,
    Guard,
    Applicant,
}

impl Role {
    /// Admins and subadmins staff the agency side of every conversation.
    pub fn is_staff(self) -> bool {
        matches!(self, Role::Admin | Role::Subadmin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Subadmin => "Subadmin",
            Role::Guard => "Guard",
            Role::Applicant => "Applicant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Admin" => Some(Role::Admin),
            "Subadmin" => Some(Role::Subadmin),
            "Guard" => Some(Role::Guard),
            "Applicant" => Some(Role::Applicant),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chat surface a conversation belongs to. Pairs are unique per kind, so the
/// same two users may hold one conversation of each kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    StaffGuard,
    StaffApplicant,
}

impl ConversationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationKind::StaffGuard => "staff_guard",
            ConversationKind::StaffApplicant => "staff_applicant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "staff_guard" => Some(ConversationKind::StaffGuard),
            "staff_applicant" => Some(ConversationKind::StaffApplicant),
            _ => None,
        }
    }

    /// Whether this surface pairs the two roles: one staff member and one
    /// counterpart of the kind's non-staff role, in either order.
    pub fn admits(self, a: Role, b: Role) -> bool {
        let counterpart = match self {
            ConversationKind::StaffGuard => Role::Guard,
            ConversationKind::StaffApplicant => Role::Applicant,
        };
        (a.is_staff() && b == counterpart) || (b.is_staff() && a == counterpart)
    }
}

impl std::fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical participant shape, always fully resolved before it leaves the
/// server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    pub role: Role,
    pub display_name: String,
}

impl Participant {
    pub fn new(user_id: UserId, role: Role, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            role,
            display_name: display_name.into(),
        }
    }
}

/// Reference returned by the attachment store; only this is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub file_path: String,
    pub file_name: String,
}

/// A persisted chat message. Only `seen_by_recipient` ever changes after
/// creation, and only from false to true.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    /// Ledger insertion sequence; breaks `created_at` ties and serves as the
    /// history paging cursor.
    pub seq: i64,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_role: Role,
    pub text: String,
    pub file_path: Option<String>,
    pub file_name: Option<String>,
    pub seen_by_recipient: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            message_id: self.id,
            sender_id: self.sender_id.clone(),
            text: self.text.clone(),
            file_name: self.file_name.clone(),
            seen_by_recipient: self.seen_by_recipient,
            created_at: self.created_at,
        }
    }

    pub fn attachment(&self) -> Option<AttachmentRef> {
        self.file_path.as_ref().map(|path| AttachmentRef {
            file_path: path.clone(),
            file_name: self.file_name.clone().unwrap_or_default(),
        })
    }
}

/// Denormalized snapshot of a conversation's most recent message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub text: String,
    pub file_name: Option<String>,
    pub seen_by_recipient: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    /// Ordered by user id.
    pub participants: [Participant; 2],
    pub last_message: Option<MessageSummary>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user_id == user_id)
    }

    pub fn has_participant(&self, user_id: &UserId) -> bool {
        self.participant(user_id).is_some()
    }

    pub fn participant_ids(&self) -> [&UserId; 2] {
        [&self.participants[0].user_id, &self.participants[1].user_id]
    }

}

/// A conversation that exists only as a participant pair. The messaging
/// facade's send path is the one place it becomes a persisted
/// [`Conversation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConversation {
    pub kind: ConversationKind,
    participants: [Participant; 2],
}

impl PendingConversation {
    pub fn new(
        kind: ConversationKind,
        a: Participant,
        b: Participant,
    ) -> Result<Self, ValidationError> {
        if a.user_id == b.user_id {
            return Err(ValidationError::SameParticipant);
        }
        if !kind.admits(a.role, b.role) {
            return Err(ValidationError::KindMismatch {
                kind,
                a: a.role,
                b: b.role,
            });
        }
        let participants = if a.user_id < b.user_id { [a, b] } else { [b, a] };
        Ok(Self { kind, participants })
    }

    /// Participants ordered by user id, matching the pair uniqueness key.
    pub fn participants(&self) -> &[Participant; 2] {
        &self.participants
    }

    /// The id this pair's conversation has once persisted. Derived from the
    /// kind and both user ids, so it is known before the row exists.
    pub fn conversation_id(&self) -> ConversationId {
        let [a, b] = &self.participants;
        let key = format!(
            "{}/{}:{}/{}",
            self.kind.as_str(),
            a.user_id.as_str().len(),
            a.user_id,
            b.user_id
        );
        ConversationId(Uuid::new_v5(&CONVERSATION_NAMESPACE, key.as_bytes()))
    }
}

/// How a send request addresses its conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationRef {
    Persisted(ConversationId),
    Pending {
        kind: ConversationKind,
        receiver_id: UserId,
        receiver_role: Option<Role>,
    },
}

/// Reject content that is neither text nor attachment, or oversized text.
pub fn validate_content(
    text: &str,
    attachment: Option<&AttachmentRef>,
) -> Result<(), ValidationError> {
    if text.len() > MAX_TEXT_LEN {
        return Err(ValidationError::TextTooLong { max: MAX_TEXT_LEN });
    }
    let has_attachment = attachment.is_some_and(|a| !a.file_path.trim().is_empty());
    if text.trim().is_empty() && !has_attachment {
        return Err(ValidationError::EmptyMessage);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(id: &str, role: Role) -> Participant {
        Participant::new(UserId::new(id), role, id.to_uppercase())
    }

    #[test]
    fn test_kind_admits_staff_pairs_only() {
        let kind = ConversationKind::StaffGuard;
        assert!(kind.admits(Role::Subadmin, Role::Guard));
        assert!(kind.admits(Role::Guard, Role::Admin));
        assert!(!kind.admits(Role::Guard, Role::Guard));
        assert!(!kind.admits(Role::Admin, Role::Applicant));
        assert!(ConversationKind::StaffApplicant.admits(Role::Applicant, Role::Admin));
    }

    #[test]
    fn test_pending_orders_participants() {
        let pending = PendingConversation::new(
            ConversationKind::StaffGuard,
            participant("zed", Role::Guard),
            participant("amy", Role::Admin),
        )
        .unwrap();
        assert_eq!(pending.participants()[0].user_id.as_str(), "amy");
        assert_eq!(pending.participants()[1].user_id.as_str(), "zed");
    }

    #[test]
    fn test_pending_rejects_self_conversation() {
        let err = PendingConversation::new(
            ConversationKind::StaffGuard,
            participant("amy", Role::Admin),
            participant("amy", Role::Guard),
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::SameParticipant);
    }

    #[test]
    fn test_validate_content() {
        assert_eq!(validate_content("   ", None), Err(ValidationError::EmptyMessage));
        assert!(validate_content("Hello", None).is_ok());

        let attachment = AttachmentRef {
            file_path: "abc.pdf".into(),
            file_name: "roster.pdf".into(),
        };
        assert!(validate_content("", Some(&attachment)).is_ok());

        let long = "x".repeat(MAX_TEXT_LEN + 1);
        assert!(matches!(
            validate_content(&long, None),
            Err(ValidationError::TextTooLong { .. })
        ));
    }

    #[test]
    fn test_conversation_id_is_derived_from_pair() {
        let pending = |a: &str, b: &str, kind| {
            PendingConversation::new(kind, participant(a, Role::Subadmin), participant(b, Role::Guard))
                .unwrap()
        };
        let staff_applicant = |a: &str, b: &str| {
            PendingConversation::new(
                ConversationKind::StaffApplicant,
                participant(a, Role::Subadmin),
                participant(b, Role::Applicant),
            )
            .unwrap()
        };

        let id = pending("amy", "bob", ConversationKind::StaffGuard).conversation_id();
        let swapped = PendingConversation::new(
            ConversationKind::StaffGuard,
            participant("bob", Role::Guard),
            participant("amy", Role::Subadmin),
        )
        .unwrap();
        assert_eq!(swapped.conversation_id(), id);

        assert_ne!(staff_applicant("amy", "bob").conversation_id(), id);
        assert_ne!(
            pending("amy", "bobby", ConversationKind::StaffGuard).conversation_id(),
            id
        );
    }
}
