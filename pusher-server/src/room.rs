//! Per-room state: the connected clients, the zone mirror fed by the back,
//! and the viewport-overlap fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use protocol::{GroupDescriptor, Viewport, ZoneFrame, ZoneUser};

use crate::back::{BackClient, BackError};
use crate::client::ClientSession;
use crate::zone::ZoneEventListener;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum EntityKey {
    User(i32),
    Group(i32),
}

#[derive(Default)]
struct RoomInner {
    clients: HashMap<u64, Arc<ClientSession>>,
    viewports: HashMap<u64, Viewport>,
    /// Which entities each client currently sees; drives enter/leave diffs.
    visible: HashMap<u64, HashSet<EntityKey>>,
    users: HashMap<i32, ZoneUser>,
    groups: HashMap<i32, GroupDescriptor>,
    version_number: u64,
}

pub struct PusherRoom {
    room_url: String,
    listener: Arc<dyn ZoneEventListener>,
    inner: Mutex<RoomInner>,
    zone_pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PusherRoom {
    pub fn new(room_url: &str, listener: Arc<dyn ZoneEventListener>) -> Arc<Self> {
        Arc::new(PusherRoom {
            room_url: room_url.to_string(),
            listener,
            inner: Mutex::new(RoomInner::default()),
            zone_pump: std::sync::Mutex::new(None),
        })
    }

    pub fn room_url(&self) -> &str {
        &self.room_url
    }

    /// Opens the zone feed on the back owning this room and starts mirroring.
    pub async fn init(self: &Arc<Self>, back: &Arc<dyn BackClient>) -> Result<(), BackError> {
        let mut stream = back.watch_zone(&self.room_url).await?;
        let weak = Arc::downgrade(self);
        let pump = tokio::spawn(async move {
            while let Some(item) = stream.frames.recv().await {
                let Some(room) = weak.upgrade() else {
                    return;
                };
                match item {
                    Ok(frame) => room.on_zone_frame(frame).await,
                    Err(err) => {
                        tracing::error!(room = room.room_url, ?err, "Zone stream error.");
                        return;
                    }
                }
            }
            if let Some(room) = weak.upgrade() {
                tracing::warn!(room = room.room_url, "Zone stream ended.");
            }
        });
        *self.zone_pump.lock().unwrap() = Some(pump);
        Ok(())
    }

    /// Adds a client; joining twice is a no-op.
    pub async fn join(&self, client: Arc<ClientSession>) {
        let mut inner = self.inner.lock().await;
        let session_id = client.session_id;
        inner.visible.entry(session_id).or_default();
        inner.clients.entry(session_id).or_insert(client);
    }

    /// Removes a client; absent clients are ignored.
    pub async fn leave(&self, client: &ClientSession) {
        let mut inner = self.inner.lock().await;
        inner.clients.remove(&client.session_id);
        inner.viewports.remove(&client.session_id);
        inner.visible.remove(&client.session_id);
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.clients.is_empty()
    }

    pub async fn client_count(&self) -> usize {
        self.inner.lock().await.clients.len()
    }

    /// Returns true iff `version` is newer than anything seen so far, and
    /// records it. Repeating a version never reports an update twice.
    pub async fn needs_update(&self, version: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if version > inner.version_number {
            inner.version_number = version;
            true
        } else {
            false
        }
    }

    /// Stores the client's viewport and emits the enter/leave diff against
    /// the previously visible entity set.
    pub async fn set_viewport(&self, client: &Arc<ClientSession>, viewport: Viewport) {
        let mut inner = self.inner.lock().await;
        let RoomInner {
            viewports,
            visible,
            users,
            groups,
            ..
        } = &mut *inner;

        viewports.insert(client.session_id, viewport);
        let seen = visible.entry(client.session_id).or_default();

        for (user_id, user) in users.iter() {
            let key = EntityKey::User(*user_id);
            if viewport.contains(user.position) {
                if seen.insert(key) {
                    self.listener.on_user_enters(client, user);
                }
            } else if seen.remove(&key) {
                self.listener.on_user_leaves(client, *user_id);
            }
        }
        for (group_id, group) in groups.iter() {
            let key = EntityKey::Group(*group_id);
            if viewport.contains(group.position) {
                if seen.insert(key) {
                    self.listener.on_group_enters(client, group);
                }
            } else if seen.remove(&key) {
                self.listener.on_group_leaves(client, *group_id);
            }
        }
    }

    /// Releases the zone feed.
    pub fn close(&self) {
        if let Some(pump) = self.zone_pump.lock().unwrap().take() {
            pump.abort();
        }
    }

    pub(crate) async fn on_zone_frame(&self, frame: ZoneFrame) {
        let mut inner = self.inner.lock().await;
        let RoomInner {
            clients,
            viewports,
            visible,
            users,
            groups,
            ..
        } = &mut *inner;

        match frame {
            ZoneFrame::UserEntered(user) => {
                let key = EntityKey::User(user.user_id);
                users.insert(user.user_id, user.clone());
                for (session_id, client) in clients.iter() {
                    let Some(viewport) = viewports.get(session_id) else {
                        continue;
                    };
                    if viewport.contains(user.position)
                        && visible.entry(*session_id).or_default().insert(key)
                    {
                        self.listener.on_user_enters(client, &user);
                    }
                }
            }
            ZoneFrame::UserMoved { user_id, position } => {
                let Some(user) = users.get_mut(&user_id) else {
                    tracing::warn!(room = self.room_url, user_id, "Move for unknown user.");
                    return;
                };
                user.position = position;
                let user = user.clone();
                let key = EntityKey::User(user_id);
                for (session_id, client) in clients.iter() {
                    let Some(viewport) = viewports.get(session_id) else {
                        continue;
                    };
                    let seen = visible.entry(*session_id).or_default();
                    if viewport.contains(position) {
                        if seen.insert(key) {
                            self.listener.on_user_enters(client, &user);
                        } else {
                            self.listener.on_user_moves(client, user_id, position);
                        }
                    } else if seen.remove(&key) {
                        self.listener.on_user_leaves(client, user_id);
                    }
                }
            }
            ZoneFrame::UserLeft { user_id } => {
                users.remove(&user_id);
                let key = EntityKey::User(user_id);
                for (session_id, client) in clients.iter() {
                    if visible
                        .get_mut(session_id)
                        .is_some_and(|seen| seen.remove(&key))
                    {
                        self.listener.on_user_leaves(client, user_id);
                    }
                }
            }
            ZoneFrame::GroupUpdated(group) => {
                let key = EntityKey::Group(group.group_id);
                groups.insert(group.group_id, group);
                for (session_id, client) in clients.iter() {
                    let Some(viewport) = viewports.get(session_id) else {
                        continue;
                    };
                    let seen = visible.entry(*session_id).or_default();
                    if viewport.contains(group.position) {
                        if seen.insert(key) {
                            self.listener.on_group_enters(client, &group);
                        } else {
                            self.listener.on_group_moves(client, &group);
                        }
                    } else if seen.remove(&key) {
                        self.listener.on_group_leaves(client, group.group_id);
                    }
                }
            }
            ZoneFrame::GroupDeleted { group_id } => {
                groups.remove(&group_id);
                let key = EntityKey::Group(group_id);
                for (session_id, client) in clients.iter() {
                    if visible
                        .get_mut(session_id)
                        .is_some_and(|seen| seen.remove(&key))
                    {
                        self.listener.on_group_leaves(client, group_id);
                    }
                }
            }
            ZoneFrame::Emote { user_id, emote } => {
                let key = EntityKey::User(user_id);
                for (session_id, client) in clients.iter() {
                    if visible.get(session_id).is_some_and(|seen| seen.contains(&key)) {
                        self.listener.on_emote(client, user_id, &emote);
                    }
                }
            }
            ZoneFrame::PlayerDetailsUpdated { user_id, details } => {
                if details.availability_status != 0 {
                    if let Some(user) = users.get_mut(&user_id) {
                        user.availability_status = details.availability_status;
                    }
                }
                let key = EntityKey::User(user_id);
                for (session_id, client) in clients.iter() {
                    if visible.get(session_id).is_some_and(|seen| seen.contains(&key)) {
                        self.listener
                            .on_player_details_updated(client, user_id, &details);
                    }
                }
            }
            ZoneFrame::Error { message } => {
                for client in clients.values() {
                    self.listener.on_error(client, &message);
                }
            }
        }
    }
}
