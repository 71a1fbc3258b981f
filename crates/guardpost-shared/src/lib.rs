//! # guardpost-shared
//!
//! Domain types and wire formats shared by the Guardpost messaging store and
//! server: participant identities, conversations, messages, the realtime
//! event protocol, and the REST payloads built on top of them.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ValidationError;
pub use types::*;
