//! Per-client session state: identity, the outbound channel drained by the
//! write pump, and the routing data owned by the client's own code paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};

use protocol::{RoomInFrame, ServerMessage, SpaceFilter, SpaceUser, Viewport};

use crate::batch::{BatchEmitter, BatchSettings};

/// What the write pump consumes: regular frames, or an order to close the
/// socket with a code and reason.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerMessage),
    Close { code: u16, reason: &'static str },
}

/// Identity established by the handshake, immutable for the session.
#[derive(Clone, Debug, Default)]
pub struct ClientIdentity {
    pub room_id: String,
    pub uuid: String,
    pub name: String,
    pub ip_address: String,
    pub tags: Vec<String>,
    pub textures: Vec<String>,
    pub chat_id: String,
}

/// A space membership as seen from the client side: the global space name
/// plus the alias the client joined it under.
#[derive(Clone, Debug)]
pub struct SpaceRef {
    pub name: String,
    pub local_name: String,
}

/// Mutable routing state, only written by code paths originating from this
/// client's socket.
#[derive(Default)]
pub struct SocketData {
    pub viewport: Viewport,
    /// Writer half of the client's room back-stream.
    pub back_connection: Option<mpsc::Sender<RoomInFrame>>,
    /// Edit permission granted by the back on room join.
    pub can_edit: bool,
    pub spaces: Vec<SpaceRef>,
    /// Client-side mirror of the filters installed per space.
    pub spaces_filters: HashMap<String, Vec<SpaceFilter>>,
    /// The canonical record published into spaces, mutated via masked merges.
    pub space_user: SpaceUser,
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Sentinel meaning the back has not assigned a user id yet.
const USER_ID_UNSET: i32 = -1;

pub struct ClientSession {
    pub session_id: u64,
    pub room_id: String,
    pub uuid: String,
    pub name: String,
    pub ip_address: String,
    pub tags: Vec<String>,
    pub textures: Vec<String>,
    user_id: AtomicI32,
    disconnecting: Arc<AtomicBool>,
    to_client: mpsc::Sender<Outbound>,
    pub emitter: BatchEmitter,
    pub data: Mutex<SocketData>,
}

impl ClientSession {
    pub fn new(
        identity: ClientIdentity,
        to_client: mpsc::Sender<Outbound>,
        batching: BatchSettings,
    ) -> Arc<Self> {
        let disconnecting = Arc::new(AtomicBool::new(false));
        let emitter = BatchEmitter::new(to_client.clone(), disconnecting.clone(), batching);
        let space_user = SpaceUser {
            id: USER_ID_UNSET,
            uuid: identity.uuid.clone(),
            name: identity.name.clone(),
            role: identity.tags.first().cloned().unwrap_or_default(),
            tags: identity.tags.clone(),
            availability_status: 0,
            chat_id: identity.chat_id.clone(),
        };
        Arc::new(ClientSession {
            session_id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            room_id: identity.room_id,
            uuid: identity.uuid,
            name: identity.name,
            ip_address: identity.ip_address,
            tags: identity.tags,
            textures: identity.textures,
            user_id: AtomicI32::new(USER_ID_UNSET),
            disconnecting,
            to_client,
            emitter,
            data: Mutex::new(SocketData {
                space_user,
                ..SocketData::default()
            }),
        })
    }

    pub fn is_admin(&self) -> bool {
        self.tags.iter().any(|tag| tag == "admin")
    }

    pub fn user_id(&self) -> Option<i32> {
        let id = self.user_id.load(Ordering::Relaxed);
        (id != USER_ID_UNSET).then_some(id)
    }

    pub fn assign_user_id(&self, id: i32) {
        self.user_id.store(id, Ordering::Relaxed);
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::Relaxed)
    }

    /// Marks the session as disconnecting. Returns the previous value so the
    /// teardown runs exactly once.
    pub fn mark_disconnecting(&self) -> bool {
        self.disconnecting.swap(true, Ordering::SeqCst)
    }

    /// Sends a frame to the client. Disconnecting sessions drop everything.
    pub fn send(&self, message: ServerMessage) {
        if self.is_disconnecting() {
            return;
        }
        if let Err(err) = self.to_client.try_send(Outbound::Frame(message)) {
            tracing::warn!(
                session_id = self.session_id,
                ?err,
                "Dropping frame for saturated client channel."
            );
        }
    }

    /// Orders the write pump to close the socket.
    pub fn close(&self, code: u16, reason: &'static str) {
        let _ = self.to_client.try_send(Outbound::Close { code, reason });
    }
}
