//! Reference-counted online presence.
//!
//! A user may hold several realtime connections (tabs, devices); they are
//! online while at least one is live. Counts live in process memory only
//! and start from zero on every restart.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use guardpost_shared::UserId;

/// Effect of a connect or disconnect on a user's presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    CameOnline,
    WentOffline,
    Unchanged,
}

#[derive(Clone, Default)]
pub struct PresenceTracker {
    counts: Arc<Mutex<HashMap<UserId, usize>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self, user_id: &UserId) -> PresenceChange {
        let mut counts = self.counts.lock().await;
        let count = counts.entry(user_id.clone()).or_insert(0);
        *count += 1;

        if *count == 1 {
            info!(user = %user_id, "User online");
            PresenceChange::CameOnline
        } else {
            PresenceChange::Unchanged
        }
    }

    /// Drop one connection. Unknown users are ignored; counts never go
    /// below zero.
    pub async fn disconnect(&self, user_id: &UserId) -> PresenceChange {
        let mut counts = self.counts.lock().await;
        let Some(count) = counts.get_mut(user_id) else {
            return PresenceChange::Unchanged;
        };

        *count -= 1;
        if *count == 0 {
            counts.remove(user_id);
            info!(user = %user_id, "User offline");
            PresenceChange::WentOffline
        } else {
            PresenceChange::Unchanged
        }
    }

    /// Online users, sorted for stable output.
    pub async fn snapshot(&self) -> Vec<UserId> {
        let counts = self.counts.lock().await;
        let mut online: Vec<UserId> = counts.keys().cloned().collect();
        online.sort();
        online
    }

    #[cfg(test)]
    pub async fn is_online(&self, user_id: &UserId) -> bool {
        self.counts.lock().await.contains_key(user_id)
    }

    #[cfg(test)]
    pub async fn connection_count(&self, user_id: &UserId) -> usize {
        self.counts.lock().await.get(user_id).copied().unwrap_or(0)
    }
}
