//! Caller authentication and user lookup.
//!
//! The messaging core never owns user accounts. It asks an
//! [`IdentityGateway`] who a bearer token belongs to and what role and
//! display name a user currently has.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::info;

use guardpost_shared::{Participant, Role, UserId};

use crate::api::AppState;
use crate::error::ServerError;

#[async_trait]
pub trait IdentityGateway: Send + Sync {
    /// Resolve a bearer token to the participant it identifies.
    async fn authenticate(&self, token: &str) -> Option<Participant>;

    /// Current role and display name of a user.
    async fn lookup(&self, user_id: &UserId) -> Option<Participant>;
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub user_id: UserId,
    pub role: Role,
    pub display_name: String,
    pub token: String,
}

impl DirectoryEntry {
    fn participant(&self) -> Participant {
        Participant::new(self.user_id.clone(), self.role, self.display_name.clone())
    }
}

#[derive(Deserialize)]
struct DirectoryFile {
    users: Vec<DirectoryEntry>,
}

/// Fixed user directory, typically loaded from a JSON file at startup.
#[derive(Default)]
pub struct StaticDirectory {
    users: HashMap<UserId, DirectoryEntry>,
}

impl StaticDirectory {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = DirectoryEntry>) -> Self {
        let users = entries
            .into_iter()
            .map(|entry| (entry.user_id.clone(), entry))
            .collect();
        Self { users }
    }

    /// Load `{"users": [{userId, role, displayName, token}, ...]}`.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read identity file '{}'", path.display()))?;
        let file: DirectoryFile = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid identity file '{}'", path.display()))?;

        let directory = Self::from_entries(file.users);
        info!(
            path = %path.display(),
            users = directory.len(),
            "Identity directory loaded"
        );
        Ok(directory)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }
}

#[async_trait]
impl IdentityGateway for StaticDirectory {
    async fn authenticate(&self, token: &str) -> Option<Participant> {
        if token.is_empty() {
            return None;
        }
        // Compare against every entry so the scan time does not depend on
        // which user (if any) matched.
        let mut found = None;
        for entry in self.users.values() {
            if bool::from(entry.token.as_bytes().ct_eq(token.as_bytes())) {
                found = Some(entry);
            }
        }
        found.map(DirectoryEntry::participant)
    }

    async fn lookup(&self, user_id: &UserId) -> Option<Participant> {
        self.users.get(user_id).map(DirectoryEntry::participant)
    }
}

/// The authenticated caller of a request.
///
/// Reads `Authorization: Bearer <token>`, falling back to a `token` query
/// parameter for browser WebSocket clients that cannot set headers.
pub struct AuthUser(pub Participant);

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn query_token(parts: &Parts) -> Option<String> {
    let Query(query) = Query::<TokenQuery>::try_from_uri(&parts.uri).ok()?;
    query.token.filter(|t| !t.is_empty())
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .or_else(|| query_token(parts))
            .ok_or(ServerError::Unauthenticated)?;

        state
            .identity
            .authenticate(&token)
            .await
            .map(AuthUser)
            .ok_or(ServerError::Unauthenticated)
    }
}
