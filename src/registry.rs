//! Process-wide room registry: the `uuid → Room` and `stream-id → Room`
//! maps, lazy room creation, and the periodic keyframe dispatch that keeps
//! late joiners' decoders fed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::chat::Hub;
use crate::peer_set::PeerSet;

const KEYFRAME_INTERVAL: Duration = Duration::from_secs(3);

/// A room and its read-only stream alias are the same object: one peer set,
/// one chat hub.
#[derive(Debug, Clone)]
pub struct Room {
    pub peers: PeerSet,
    pub hub: Hub,
}

#[derive(Debug, Default)]
struct RegistryInner {
    rooms: HashMap<String, Room>,
    streams: HashMap<String, Room>,
}

/// Registry of all rooms in the process. Rooms are created on first
/// reference and live until shutdown. The mutex is never held across a
/// suspension point.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Registry {
    /// Creates the registry and starts the keyframe ticker, which runs until
    /// `shutdown` is cancelled.
    pub fn new(shutdown: CancellationToken) -> Registry {
        let registry = Registry { inner: Arc::new(Mutex::new(RegistryInner::default())) };
        {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.dispatch_key_frames(shutdown).await;
            });
        }
        registry
    }

    /// Derived viewer-facing id: the hex SHA-256 of the room id.
    pub fn stream_id(room_id: &str) -> String {
        hex::encode(Sha256::digest(room_id.as_bytes()))
    }

    /// Looks up a room by id, creating it (and its stream alias) on first
    /// reference. Returns the stream id alongside the room.
    pub fn get_or_create(&self, room_id: &str) -> (String, Room) {
        let stream_id = Self::stream_id(room_id);
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(room) = inner.rooms.get(room_id) {
            let room = room.clone();
            inner.streams.entry(stream_id.clone()).or_insert_with(|| room.clone());
            return (stream_id, room);
        }

        let room = Room { peers: PeerSet::new(), hub: Hub::new() };
        inner.rooms.insert(room_id.to_owned(), room.clone());
        inner.streams.insert(stream_id.clone(), room.clone());
        tracing::info!("room created: id={} stream={}", room_id, stream_id);
        (stream_id, room)
    }

    pub fn room(&self, room_id: &str) -> Option<Room> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rooms
            .get(room_id)
            .cloned()
    }

    pub fn stream(&self, stream_id: &str) -> Option<Room> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .streams
            .get(stream_id)
            .cloned()
    }

    fn rooms_snapshot(&self) -> Vec<Room> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rooms
            .values()
            .cloned()
            .collect()
    }

    async fn dispatch_key_frames(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(KEYFRAME_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for room in self.rooms_snapshot() {
                        room.peers.dispatch_key_frame().await;
                    }
                }
            }
        }
        tracing::debug!("keyframe dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_is_hex_sha256() {
        let stream_id = Registry::stream_id("R1");
        assert_eq!(stream_id.len(), 64);
        assert!(stream_id.chars().all(|c| c.is_ascii_hexdigit()));
        // Stable: the same room id always derives the same alias.
        assert_eq!(stream_id, Registry::stream_id("R1"));
        assert_ne!(stream_id, Registry::stream_id("R2"));
    }

    #[tokio::test]
    async fn stream_alias_points_at_the_same_room() {
        let registry = Registry::new(CancellationToken::new());
        let (stream_id, room) = registry.get_or_create("R1");

        let by_stream = registry.stream(&stream_id).unwrap();
        assert!(room.peers.same_set(&by_stream.peers));

        let again = registry.room("R1").unwrap();
        assert!(room.peers.same_set(&again.peers));
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let registry = Registry::new(CancellationToken::new());
        let (first_stream, first) = registry.get_or_create("R1");
        let (second_stream, second) = registry.get_or_create("R1");

        assert_eq!(first_stream, second_stream);
        assert!(first.peers.same_set(&second.peers));
    }

    #[tokio::test]
    async fn unknown_ids_miss() {
        let registry = Registry::new(CancellationToken::new());
        assert!(registry.room("nope").is_none());
        assert!(registry.stream("nope").is_none());
    }
}
