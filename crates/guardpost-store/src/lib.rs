//! # guardpost-store
//!
//! Durable storage for the Guardpost messaging core, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection`. Conversation lookup and creation (the directory)
//! live in [`conversations`]; the append-only message ledger, history and
//! seen-state updates live in [`messages`].

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;

mod error;
mod rows;

pub use database::Database;
pub use error::StoreError;
pub use messages::{HistoryPage, NewMessage, SeenUpdate};
