//! The southbound contract: how the pusher reaches the back-end pool.
//!
//! Every stream is a pair of channels so the multiplexer never touches a
//! transport directly; the WebSocket implementation lives in
//! [`ws_client`] and tests substitute channel-backed fakes.

pub mod room_pump;
pub mod space_pump;
pub mod ws_client;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use protocol::{
    AdminMessage, BanMessage, RoomBroadcast, RoomInFrame, RoomOutFrame, SpaceReadFrame,
    SpaceWriteFrame, ZoneFrame,
};

#[derive(Debug, Error)]
pub enum BackError {
    #[error("no back-end endpoints configured")]
    NoBackends,

    #[error("failed to connect to back-end {url}: {message}")]
    Connect { url: String, message: String },

    #[error("back-end stream closed")]
    StreamClosed,

    #[error("back-end stream error: {0}")]
    Stream(String),

    #[error("malformed back-end frame: {0}")]
    Codec(String),
}

/// One item of an inbound stream: a decoded frame, or the error that killed
/// the transport. The channel closing without an error is a plain `end`.
pub type StreamItem<T> = Result<T, BackError>;

/// Bidirectional stream serving one client inside one room.
pub struct RoomStream {
    pub to_back: mpsc::Sender<RoomInFrame>,
    pub from_back: mpsc::Receiver<StreamItem<RoomOutFrame>>,
}

/// Inbound-only stream feeding one room's zone index.
pub struct ZoneStream {
    pub frames: mpsc::Receiver<StreamItem<ZoneFrame>>,
}

/// Bidirectional stream shared by every space living on one back.
pub struct SpaceStream {
    pub to_back: mpsc::Sender<SpaceWriteFrame>,
    pub from_back: mpsc::Receiver<StreamItem<SpaceReadFrame>>,
}

/// RPC surface of one back-end process.
#[async_trait]
pub trait BackClient: Send + Sync {
    /// Opens a fresh room stream; one per client and room.
    async fn join_room(&self) -> Result<RoomStream, BackError>;

    /// Opens the zone feed for one room; one per room.
    async fn watch_zone(&self, room_url: &str) -> Result<ZoneStream, BackError>;

    /// Opens the shared space stream; the multiplexer opens at most one.
    async fn watch_space(&self) -> Result<SpaceStream, BackError>;

    async fn send_admin_message(&self, message: AdminMessage) -> Result<(), BackError>;

    async fn ban(&self, ban: BanMessage) -> Result<(), BackError>;

    async fn send_admin_message_to_room(
        &self,
        room_url: &str,
        broadcast: RoomBroadcast,
    ) -> Result<(), BackError>;
}

/// Stable assignment of rooms and spaces to back-end processes: hash the key,
/// take it modulo the pool size, memoize one client per back.
pub struct BackendDirectory {
    backs: Vec<Arc<dyn BackClient>>,
}

impl BackendDirectory {
    pub fn new(backs: Vec<Arc<dyn BackClient>>) -> Result<Self, BackError> {
        if backs.is_empty() {
            return Err(BackError::NoBackends);
        }
        Ok(BackendDirectory { backs })
    }

    /// Stable over the process lifetime; the same key always lands on the
    /// same back.
    pub fn index(&self, key: &str) -> usize {
        stable_hash(key) % self.backs.len()
    }

    pub fn back_count(&self) -> usize {
        self.backs.len()
    }

    pub fn client_for(&self, back_id: usize) -> Arc<dyn BackClient> {
        self.backs[back_id % self.backs.len()].clone()
    }

    pub fn room_client(&self, room_id: &str) -> Arc<dyn BackClient> {
        self.client_for(self.index(room_id))
    }

    pub fn space_client(&self, space_name: &str) -> Arc<dyn BackClient> {
        self.client_for(self.index(space_name))
    }
}

/// djb2-style fold, deterministic and cheap. Not a cryptographic hash, just a
/// stable spread of keys over the pool.
fn stable_hash(key: &str) -> usize {
    key.bytes()
        .fold(5381usize, |hash, byte| hash.wrapping_mul(33) ^ byte as usize)
}

/// Writer half and pump handle of the shared per-back space stream. Disposal
/// is driven by the space-set cardinality, never by a single client.
pub struct BackSpaceConnection {
    back_id: usize,
    writer: mpsc::Sender<SpaceWriteFrame>,
    pump: JoinHandle<&'static str>,
}

impl BackSpaceConnection {
    pub fn new(
        back_id: usize,
        writer: mpsc::Sender<SpaceWriteFrame>,
        pump: JoinHandle<&'static str>,
    ) -> Self {
        BackSpaceConnection {
            back_id,
            writer,
            pump,
        }
    }

    pub fn back_id(&self) -> usize {
        self.back_id
    }

    pub fn writer(&self) -> mpsc::Sender<SpaceWriteFrame> {
        self.writer.clone()
    }

    pub async fn write(&self, frame: SpaceWriteFrame) -> Result<(), BackError> {
        self.writer
            .send(frame)
            .await
            .map_err(|_| BackError::StreamClosed)
    }

    /// Tears the stream down; the pump task stops and the transport closes.
    pub fn end(&self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullBack;

    #[async_trait]
    impl BackClient for NullBack {
        async fn join_room(&self) -> Result<RoomStream, BackError> {
            Err(BackError::StreamClosed)
        }
        async fn watch_zone(&self, _room_url: &str) -> Result<ZoneStream, BackError> {
            Err(BackError::StreamClosed)
        }
        async fn watch_space(&self) -> Result<SpaceStream, BackError> {
            Err(BackError::StreamClosed)
        }
        async fn send_admin_message(&self, _message: AdminMessage) -> Result<(), BackError> {
            Ok(())
        }
        async fn ban(&self, _ban: BanMessage) -> Result<(), BackError> {
            Ok(())
        }
        async fn send_admin_message_to_room(
            &self,
            _room_url: &str,
            _broadcast: RoomBroadcast,
        ) -> Result<(), BackError> {
            Ok(())
        }
    }

    fn directory(count: usize) -> BackendDirectory {
        let backs: Vec<Arc<dyn BackClient>> =
            (0..count).map(|_| Arc::new(NullBack) as _).collect();
        BackendDirectory::new(backs).unwrap()
    }

    #[test]
    fn an_empty_pool_is_rejected() {
        assert!(matches!(
            BackendDirectory::new(Vec::new()),
            Err(BackError::NoBackends)
        ));
    }

    #[test]
    fn the_index_is_stable_and_bounded() {
        let dir = directory(4);
        let first = dir.index("space/town-hall");
        for _ in 0..10 {
            assert_eq!(dir.index("space/town-hall"), first);
        }
        assert!(first < 4);
    }

    #[test]
    fn different_keys_spread_over_the_pool() {
        let dir = directory(8);
        let distinct: std::collections::HashSet<usize> = (0..64)
            .map(|i| dir.index(&format!("room/{i}")))
            .collect();
        assert!(distinct.len() > 1);
    }
}
