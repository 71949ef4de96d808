//! Room lifecycle: lookup, lazy creation, and the shared registry of
//! mailboxes that lets a room evict itself without the room and the manager
//! borrowing each other's internals.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tracing::info;

use crate::engine::OtEngine;
use crate::persistence::Persistence;
use crate::room::{Room, RoomCommand, RoomRegistry};
use crate::ServerConfig;

/// Owns the set of active rooms and routes commands to the one that owns
/// them, creating a room lazily on first join.
pub struct RoomManager {
    rooms: RoomRegistry,
    persistence: Arc<dyn Persistence>,
    config: Arc<ServerConfig>,
}

impl RoomManager {
    pub fn new(persistence: Arc<dyn Persistence>, config: Arc<ServerConfig>) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            persistence,
            config,
        }
    }

    /// Number of rooms currently held in memory (for `/stats`).
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Get the mailbox for `room_id`, creating (and rehydrating, if
    /// persisted) the room's actor task if it isn't already active.
    pub async fn get_or_create(&self, room_id: &str) -> mpsc::Sender<RoomCommand> {
        match self.rooms.entry(room_id.to_string()) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(e) => {
                let engine = self.load_engine(room_id).await;
                info!(room_id, "room created");
                let tx = Room::spawn(
                    room_id.to_string(),
                    engine,
                    self.persistence.clone(),
                    self.config.clone(),
                    self.rooms.clone(),
                );
                e.insert(tx.clone());
                tx
            }
        }
    }

    async fn load_engine(&self, room_id: &str) -> OtEngine {
        match self.persistence.load_room(room_id).await {
            Ok(Some(loaded)) => {
                let mut engine = OtEngine::new(
                    loaded.snapshot.content,
                    loaded.snapshot.version,
                    self.config.history_window,
                );
                engine.replay(loaded.tail);
                engine
            }
            Ok(None) => OtEngine::new(String::new(), 0, self.config.history_window),
            Err(e) => {
                tracing::error!(room_id, error = %e, "failed to load persisted room, starting fresh");
                OtEngine::new(String::new(), 0, self.config.history_window)
            }
        }
    }

    /// Look up an already-active room's mailbox without creating one.
    pub fn lookup(&self, room_id: &str) -> Option<mpsc::Sender<RoomCommand>> {
        self.rooms.get(room_id).map(|e| e.clone())
    }

    /// Signal every active room to flush a final snapshot and disconnect its
    /// sessions.
    pub async fn shutdown_all(&self) {
        let senders: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for tx in senders {
            let _ = tx.send(RoomCommand::Shutdown).await;
        }
    }
}
