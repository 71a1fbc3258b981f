//! Realtime fan-out to connected clients.
//!
//! Every connection owns a bounded outbound queue and is registered under
//! its user's personal channel; opening a conversation adds it to that
//! conversation's room. Delivery never waits: a connection whose queue is
//! closed or full is dropped from every table (and from presence) instead
//! of stalling the sender.
//!
//! Lock order is gateway state, then presence. All presence broadcasts
//! happen under the gateway lock, so every connection sees online-set
//! snapshots in the order they were taken.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use guardpost_shared::protocol::ServerEvent;
use guardpost_shared::{ConversationId, UserId};

use crate::presence::{PresenceChange, PresenceTracker};

pub type ConnectionId = u64;

/// The connection task's end of a registration.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub events: mpsc::Receiver<ServerEvent>,
}

struct ConnectionEntry {
    user_id: UserId,
    tx: mpsc::Sender<ServerEvent>,
    /// Whether this connection counted toward presence
    announced: bool,
    rooms: HashSet<ConversationId>,
}

#[derive(Default)]
struct GatewayState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    rooms: HashMap<ConversationId, HashSet<ConnectionId>>,
    personal: HashMap<UserId, HashSet<ConnectionId>>,
}

impl GatewayState {
    /// Enqueue `event` for each target. Returns the connections that could
    /// not take it.
    fn deliver<'a>(
        &self,
        targets: impl IntoIterator<Item = &'a ConnectionId>,
        event: &ServerEvent,
    ) -> Vec<ConnectionId> {
        let mut dead = Vec::new();
        for id in targets {
            let Some(entry) = self.connections.get(id) else {
                continue;
            };
            match entry.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        connection = id,
                        user = %entry.user_id,
                        event = event.name(),
                        "Outbound queue full, dropping connection"
                    );
                    dead.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(connection = id, user = %entry.user_id, "Connection already gone");
                    dead.push(*id);
                }
            }
        }
        dead
    }

    /// Remove a connection from every table.
    fn remove(&mut self, id: ConnectionId) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(&id)?;

        for room in &entry.rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(&id);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }

        if let Some(channel) = self.personal.get_mut(&entry.user_id) {
            channel.remove(&id);
            if channel.is_empty() {
                self.personal.remove(&entry.user_id);
            }
        }

        Some(entry)
    }
}

#[derive(Clone)]
pub struct RealtimeGateway {
    state: Arc<Mutex<GatewayState>>,
    presence: PresenceTracker,
    next_id: Arc<AtomicU64>,
    queue_capacity: usize,
}

impl RealtimeGateway {
    pub fn new(presence: PresenceTracker, queue_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(GatewayState::default())),
            presence,
            next_id: Arc::new(AtomicU64::new(1)),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a new connection under its user's personal channel.
    pub async fn register(&self, user_id: UserId) -> ConnectionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let mut state = self.state.lock().await;
        state.connections.insert(
            id,
            ConnectionEntry {
                user_id: user_id.clone(),
                tx,
                announced: false,
                rooms: HashSet::new(),
            },
        );
        state.personal.entry(user_id.clone()).or_default().insert(id);

        debug!(connection = id, user = %user_id, "Connection registered");

        ConnectionHandle {
            id,
            user_id,
            events: rx,
        }
    }

    /// Count this connection toward its user's presence and send it the
    /// current online set. Announcing twice on one connection counts once.
    ///
    /// Returns `false` if the connection is no longer registered.
    pub async fn announce_presence(&self, id: ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        let Some(entry) = state.connections.get_mut(&id) else {
            return false;
        };
        let first = !entry.announced;
        entry.announced = true;
        let user_id = entry.user_id.clone();

        let dead = if first && self.presence.connect(&user_id).await == PresenceChange::CameOnline
        {
            self.broadcast_presence(&state).await
        } else {
            let online = ServerEvent::OnlineUsers(self.presence.snapshot().await);
            state.deliver([&id], &online)
        };

        self.evict(&mut state, dead).await;
        true
    }

    /// Add a connection to a conversation room. Participation must already
    /// have been checked by the caller.
    pub async fn join_room(&self, id: ConnectionId, conversation_id: ConversationId) -> bool {
        let mut state = self.state.lock().await;
        let Some(entry) = state.connections.get_mut(&id) else {
            return false;
        };
        entry.rooms.insert(conversation_id);
        state.rooms.entry(conversation_id).or_default().insert(id);

        debug!(connection = id, conversation = %conversation_id, "Joined room");
        true
    }

    /// Remove a connection. Safe to call more than once and after eviction.
    pub async fn unregister(&self, id: ConnectionId) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.remove(id) else {
            return;
        };

        debug!(connection = id, user = %entry.user_id, "Connection unregistered");

        if entry.announced
            && self.presence.disconnect(&entry.user_id).await == PresenceChange::WentOffline
        {
            let dead = self.broadcast_presence(&state).await;
            self.evict(&mut state, dead).await;
        }
    }

    /// Push an event to every connection in a conversation room. Returns
    /// the number of connections that accepted it.
    pub async fn emit_to_room(&self, conversation_id: ConversationId, event: ServerEvent) -> usize {
        let mut state = self.state.lock().await;
        let (attempted, dead) = match state.rooms.get(&conversation_id) {
            Some(members) => (members.len(), state.deliver(members, &event)),
            None => (0, Vec::new()),
        };
        let delivered = attempted - dead.len();

        debug!(
            conversation = %conversation_id,
            event = event.name(),
            delivered,
            "Room broadcast"
        );

        self.evict(&mut state, dead).await;
        delivered
    }

    /// Push an event to every connection of the given users.
    pub async fn emit_to_users(&self, users: &[&UserId], event: ServerEvent) -> usize {
        let mut state = self.state.lock().await;
        let targets: Vec<ConnectionId> = users
            .iter()
            .filter_map(|user| state.personal.get(*user))
            .flatten()
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let dead = state.deliver(&targets, &event);
        let delivered = targets.len() - dead.len();

        self.evict(&mut state, dead).await;
        delivered
    }

    /// Push an event to a single connection.
    pub async fn send_to(&self, id: ConnectionId, event: ServerEvent) -> bool {
        let mut state = self.state.lock().await;
        let dead = state.deliver([&id], &event);
        let delivered = dead.is_empty() && state.connections.contains_key(&id);
        self.evict(&mut state, dead).await;
        delivered
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        self.presence.snapshot().await
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    #[cfg(test)]
    pub async fn room_size(&self, conversation_id: ConversationId) -> usize {
        self.state
            .lock()
            .await
            .rooms
            .get(&conversation_id)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    async fn broadcast_presence(&self, state: &GatewayState) -> Vec<ConnectionId> {
        let online = ServerEvent::OnlineUsers(self.presence.snapshot().await);
        state.deliver(state.connections.keys(), &online)
    }

    /// Drop dead connections. Losing the last connection of an announced
    /// user changes the online set, whose broadcast may uncover more dead
    /// connections, so this repeats until nothing is left to drop.
    async fn evict(&self, state: &mut GatewayState, mut dead: Vec<ConnectionId>) {
        while !dead.is_empty() {
            let mut presence_changed = false;
            for id in dead.drain(..) {
                let Some(entry) = state.remove(id) else {
                    continue;
                };
                info!(connection = id, user = %entry.user_id, "Evicted dead connection");
                if entry.announced
                    && self.presence.disconnect(&entry.user_id).await
                        == PresenceChange::WentOffline
                {
                    presence_changed = true;
                }
            }
            if presence_changed {
                dead = self.broadcast_presence(state).await;
            }
        }
    }
}
