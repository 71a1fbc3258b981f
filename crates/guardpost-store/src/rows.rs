//! Column codecs shared by the conversation and message queries.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use guardpost_shared::{ConversationKind, Role};
use rusqlite::types::Type;
use uuid::Uuid;

/// Current time at the precision timestamps are stored with, so a value
/// read back compares equal to the one written.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC-3339 text; sorts lexicographically in time order.
pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_from_sql(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn uuid_from_sql(idx: usize, raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn role_from_sql(idx: usize, raw: &str) -> rusqlite::Result<Role> {
    Role::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown role '{raw}'").into(),
        )
    })
}

pub(crate) fn kind_from_sql(idx: usize, raw: &str) -> rusqlite::Result<ConversationKind> {
    ConversationKind::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown conversation kind '{raw}'").into(),
        )
    })
}
