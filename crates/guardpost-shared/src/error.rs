use thiserror::Error;

use crate::types::{ConversationKind, Role};

/// Input rejected before anything is persisted or broadcast.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message must contain text or an attachment")]
    EmptyMessage,

    #[error("Message text exceeds {max} bytes")]
    TextTooLong { max: usize },

    #[error("A conversation needs two distinct participants")]
    SameParticipant,

    #[error("A {kind} conversation cannot pair a {a} with a {b}")]
    KindMismatch {
        kind: ConversationKind,
        a: Role,
        b: Role,
    },

    #[error("Receiver is a {actual}, not a {claimed}")]
    RoleMismatch { claimed: Role, actual: Role },

    #[error("Request names neither a conversation nor a receiver and kind")]
    MissingTarget,

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}
