//! The session multiplexer: the process-wide owner of the rooms, spaces and
//! shared back-stream maps, and the handler of every client operation.
//!
//! All three maps live behind their own mutex. Creations that await (a room
//! init, a shared stream connect) park a `OnceCell` in the map synchronously
//! so concurrent joiners converge on one creation; a failed initialization
//! removes the cell and the next joiner retries.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell, mpsc};

use protocol::{
    ActionMessage, AdminEnvelope, AdminMemberData, AdminMessage, AnswerPayload, BanMessage, BatchSub, FieldMask,
    GroupDescriptor, JoinRoomMessage, PlayGlobalMessage, PlayerDetails, Position,
    PrivateSpaceEvent, PublicSpaceEvent, QueryKind, RoomBroadcast, RoomInFrame, ServerMessage,
    SpaceFilter, SpaceReadFrame, SpaceUser, SpaceWriteFrame, UserMovesMessage, Viewport, ZoneUser,
    parse_metadata,
};

use crate::admin_api::AdminApi;
use crate::back::room_pump::spawn_room_pump;
use crate::back::space_pump::spawn_space_pump;
use crate::back::{BackError, BackSpaceConnection, BackendDirectory};
use crate::client::{ClientSession, SpaceRef};
use crate::embeddable::EmbeddableChecker;
use crate::error::PusherError;
use crate::room::PusherRoom;
use crate::space::Space;
use crate::zone::ZoneEventListener;

/// Tunables that change multiplexer behavior.
#[derive(Clone, Copy, Debug)]
pub struct MultiplexerSettings {
    /// Relay a kick-off for a space unknown locally to its back anyway.
    pub forward_unknown_kick: bool,
}

impl Default for MultiplexerSettings {
    fn default() -> Self {
        MultiplexerSettings {
            forward_unknown_kick: true,
        }
    }
}

/// An administrative client listening for member churn in some rooms.
pub struct AdminWatcher {
    pub id: u64,
    pub sender: mpsc::Sender<AdminEnvelope>,
}

pub struct SessionMultiplexer {
    directory: BackendDirectory,
    admin_api: Arc<dyn AdminApi>,
    embeddable: EmbeddableChecker,
    settings: MultiplexerSettings,
    rooms: Mutex<HashMap<String, Arc<OnceCell<Arc<PusherRoom>>>>>,
    spaces: Mutex<HashMap<String, Arc<Space>>>,
    space_streams: Mutex<HashMap<usize, Arc<OnceCell<Arc<BackSpaceConnection>>>>>,
    admin_watchers: Mutex<HashMap<String, Vec<AdminWatcher>>>,
}

impl SessionMultiplexer {
    pub fn new(
        directory: BackendDirectory,
        admin_api: Arc<dyn AdminApi>,
        embeddable: EmbeddableChecker,
        settings: MultiplexerSettings,
    ) -> Arc<Self> {
        Arc::new(SessionMultiplexer {
            directory,
            admin_api,
            embeddable,
            settings,
            rooms: Mutex::new(HashMap::new()),
            spaces: Mutex::new(HashMap::new()),
            space_streams: Mutex::new(HashMap::new()),
            admin_watchers: Mutex::new(HashMap::new()),
        })
    }

    pub fn directory(&self) -> &BackendDirectory {
        &self.directory
    }

    // ----- room lifecycle -------------------------------------------------

    /// Opens the client's room stream, announces the join to the back and
    /// registers the client in its (possibly freshly created) room.
    pub async fn handle_join_room(
        self: &Arc<Self>,
        client: &Arc<ClientSession>,
    ) -> Result<(), PusherError> {
        let back = self.directory.room_client(&client.room_id);
        let stream = back.join_room().await?;
        stream
            .to_back
            .send(RoomInFrame::JoinRoom(JoinRoomMessage {
                room_url: client.room_id.clone(),
                user_uuid: client.uuid.clone(),
                name: client.name.clone(),
                ip_address: client.ip_address.clone(),
                textures: client.textures.clone(),
                tags: client.tags.clone(),
            }))
            .await
            .map_err(|_| BackError::StreamClosed)?;
        client.data.lock().await.back_connection = Some(stream.to_back);

        let room = self.get_or_create_room(&client.room_id).await?;
        spawn_room_pump(client.clone(), room.clone(), stream.from_back);
        room.join(client.clone()).await;

        self.notify_admins(
            &client.room_id,
            AdminEnvelope::MemberJoin(AdminMemberData {
                uuid: client.uuid.clone(),
                name: client.name.clone(),
                ip_address: client.ip_address.clone(),
                room_id: client.room_id.clone(),
            }),
        )
        .await;
        Ok(())
    }

    async fn get_or_create_room(
        self: &Arc<Self>,
        room_url: &str,
    ) -> Result<Arc<PusherRoom>, PusherError> {
        let cell = {
            let mut rooms = self.rooms.lock().await;
            rooms
                .entry(room_url.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let created = cell
            .get_or_try_init(|| async {
                let listener: Arc<dyn ZoneEventListener> = self.clone();
                let room = PusherRoom::new(room_url, listener);
                let back = self.directory.room_client(room_url);
                room.init(&back).await?;
                Ok::<_, PusherError>(room)
            })
            .await;
        match created {
            Ok(room) => Ok(room.clone()),
            Err(err) => {
                // Drop the failed cell so the next joiner retries.
                let mut rooms = self.rooms.lock().await;
                if let Some(existing) = rooms.get(room_url) {
                    if Arc::ptr_eq(existing, &cell) {
                        rooms.remove(room_url);
                    }
                }
                Err(err)
            }
        }
    }

    async fn room_by_url(&self, room_url: &str) -> Option<Arc<PusherRoom>> {
        self.rooms
            .lock()
            .await
            .get(room_url)
            .and_then(|cell| cell.get().cloned())
    }

    /// Ends the client's room back-stream, then removes the client from its
    /// room and disposes the room when it became empty.
    pub async fn leave_room(&self, client: &Arc<ClientSession>) {
        // Dropping the writer closes the stream towards the back; the stream
        // is gone before the client leaves the room.
        client.data.lock().await.back_connection = None;
        if let Some(room) = self.room_by_url(&client.room_id).await {
            room.leave(client).await;
            self.delete_room_if_empty(&client.room_id).await;
        }
    }

    async fn delete_room_if_empty(&self, room_url: &str) {
        let removed = {
            let mut rooms = self.rooms.lock().await;
            let Some(cell) = rooms.get(room_url) else {
                return;
            };
            let Some(room) = cell.get().cloned() else {
                return;
            };
            if !room.is_empty().await {
                return;
            }
            rooms.remove(room_url);
            room
        };
        removed.close();
        tracing::debug!(room = room_url, "Removed empty room.");
    }

    // ----- client messages touching the room -----------------------------

    /// Stores the viewport and recomputes the client's zone view.
    pub async fn handle_viewport(&self, client: &Arc<ClientSession>, viewport: Viewport) {
        client.data.lock().await.viewport = viewport;
        if let Some(room) = self.room_by_url(&client.room_id).await {
            room.set_viewport(client, viewport).await;
        }
    }

    /// Forwards the movement to the back, then updates the viewport embedded
    /// in the message.
    pub async fn handle_user_moves(
        &self,
        client: &Arc<ClientSession>,
        message: UserMovesMessage,
    ) -> Result<(), PusherError> {
        let back = self
            .back_connection(client)
            .await
            .ok_or(PusherError::NoBackConnection)?;
        let viewport = message.viewport;
        back.send(RoomInFrame::UserMoves(message))
            .await
            .map_err(|_| BackError::StreamClosed)?;
        self.handle_viewport(client, viewport).await;
        Ok(())
    }

    /// Forwards player details to the back and, when an allowed field
    /// actually changed, broadcasts a masked update into every joined space.
    pub async fn handle_set_player_details(
        &self,
        client: &Arc<ClientSession>,
        details: PlayerDetails,
    ) -> Result<(), PusherError> {
        let back = self
            .back_connection(client)
            .await
            .ok_or(PusherError::NoBackConnection)?;
        back.send(RoomInFrame::SetPlayerDetails(details.clone()))
            .await
            .map_err(|_| BackError::StreamClosed)?;

        let Some((update, mask, space_names)) = ({
            let mut data = client.data.lock().await;
            let mut paths: Vec<&str> = Vec::new();
            if details.availability_status != 0
                && details.availability_status != data.space_user.availability_status
            {
                paths.push("availabilityStatus");
            }
            if !details.chat_id.is_empty() && details.chat_id != data.space_user.chat_id {
                paths.push("chatID");
            }
            if paths.is_empty() {
                None
            } else {
                let mask = FieldMask::new(paths);
                let update = SpaceUser {
                    availability_status: details.availability_status,
                    chat_id: details.chat_id.clone(),
                    ..data.space_user.clone()
                };
                data.space_user.merge_masked(&update, &mask);
                let names: Vec<String> =
                    data.spaces.iter().map(|r| r.name.clone()).collect();
                Some((data.space_user.clone(), mask, names))
            }
        }) else {
            return Ok(());
        };

        if mask.paths.iter().any(|p| p == "chatID") {
            let admin_api = self.admin_api.clone();
            let uuid = client.uuid.clone();
            let chat_id = details.chat_id.clone();
            tokio::spawn(async move {
                if let Err(err) = admin_api.update_chat_id(&uuid, &chat_id).await {
                    tracing::warn!(?err, "Failed to persist chat id.");
                }
            });
        }

        for name in space_names {
            let space = { self.spaces.lock().await.get(&name).cloned() };
            if let Some(space) = space {
                if let Err(err) = space.update_user(update.clone(), mask.clone()).await {
                    tracing::warn!(space = name, ?err, "Failed to broadcast details update.");
                }
            }
        }
        Ok(())
    }

    /// Relays an opaque client action to the back.
    pub async fn handle_forward_action(
        &self,
        client: &Arc<ClientSession>,
        action: ActionMessage,
    ) -> Result<(), PusherError> {
        let back = self
            .back_connection(client)
            .await
            .ok_or(PusherError::NoBackConnection)?;
        back.send(RoomInFrame::Action(action))
            .await
            .map_err(|_| BackError::StreamClosed)?;
        Ok(())
    }

    /// Relays a map edit; clients without edit rights get an error frame and
    /// the action is dropped.
    pub async fn handle_edit_map_action(
        &self,
        client: &Arc<ClientSession>,
        action: ActionMessage,
    ) -> Result<(), PusherError> {
        let (can_edit, back) = {
            let data = client.data.lock().await;
            (data.can_edit, data.back_connection.clone())
        };
        if !can_edit {
            client.emitter.push(BatchSub::Error {
                message: "You are not allowed to edit this map.".into(),
            });
            return Ok(());
        }
        let back = back.ok_or(PusherError::NoBackConnection)?;
        back.send(RoomInFrame::EditMapAction(action))
            .await
            .map_err(|_| BackError::StreamClosed)?;
        Ok(())
    }

    async fn back_connection(
        &self,
        client: &ClientSession,
    ) -> Option<mpsc::Sender<RoomInFrame>> {
        client.data.lock().await.back_connection.clone()
    }

    // ----- space lifecycle ------------------------------------------------

    /// Registers the client as watcher of the space (creating it, and the
    /// shared back-stream, on first use), sends the metadata snapshot and
    /// publishes the client's presence.
    pub async fn handle_join_space(
        self: &Arc<Self>,
        client: &Arc<ClientSession>,
        space_name: &str,
        local_name: &str,
    ) -> Result<(), PusherError> {
        let local_name = if local_name.is_empty() {
            space_name
        } else {
            local_name
        };
        let back_id = self.directory.index(space_name);
        let connection = self.shared_space_stream(back_id).await?;

        let (space, created) = {
            let mut spaces = self.spaces.lock().await;
            match spaces.get(space_name) {
                Some(space) => (space.clone(), false),
                None => {
                    let space = Space::new(space_name, back_id, connection.writer());
                    spaces.insert(space_name.to_string(), space.clone());
                    (space, true)
                }
            }
        };
        if created {
            connection
                .write(SpaceWriteFrame::JoinSpace {
                    space_name: space_name.to_string(),
                })
                .await?;
        }

        let filters = {
            let mut data = client.data.lock().await;
            if !data.spaces.iter().any(|r| r.name == space_name) {
                data.spaces.push(SpaceRef {
                    name: space_name.to_string(),
                    local_name: local_name.to_string(),
                });
            }
            data.spaces_filters
                .get(space_name)
                .cloned()
                .unwrap_or_default()
        };
        space
            .add_client_watcher(client.clone(), local_name, filters)
            .await;

        let snapshot = space.metadata_snapshot().await;
        space
            .notify_me(
                client,
                ServerMessage::SpaceMetadataUpdated {
                    space_name: local_name.to_string(),
                    metadata: snapshot,
                },
            )
            .await;

        let user = client.data.lock().await.space_user.clone();
        space.add_user(user, client).await?;
        Ok(())
    }

    async fn shared_space_stream(
        self: &Arc<Self>,
        back_id: usize,
    ) -> Result<Arc<BackSpaceConnection>, PusherError> {
        let cell = {
            let mut streams = self.space_streams.lock().await;
            streams
                .entry(back_id)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let created = cell
            .get_or_try_init(|| async {
                let back = self.directory.client_for(back_id);
                let stream = back.watch_space().await?;
                let pump = spawn_space_pump(
                    Arc::downgrade(self),
                    back_id,
                    stream.to_back.clone(),
                    stream.from_back,
                );
                Ok::<_, PusherError>(Arc::new(BackSpaceConnection::new(
                    back_id,
                    stream.to_back,
                    pump,
                )))
            })
            .await;
        match created {
            Ok(connection) => Ok(connection.clone()),
            Err(err) => {
                let mut streams = self.space_streams.lock().await;
                if let Some(existing) = streams.get(&back_id) {
                    if Arc::ptr_eq(existing, &cell) {
                        streams.remove(&back_id);
                    }
                }
                Err(err)
            }
        }
    }

    /// Resolves a space the client must have joined; the error lists the
    /// spaces it actually knows.
    async fn space_for_client(
        &self,
        client: &ClientSession,
        space_name: &str,
    ) -> Result<Arc<Space>, PusherError> {
        let (joined, known) = {
            let data = client.data.lock().await;
            (
                data.spaces.iter().any(|r| r.name == space_name),
                data.spaces.iter().map(|r| r.name.clone()).collect::<Vec<_>>(),
            )
        };
        if !joined {
            return Err(PusherError::UnknownSpace {
                requested: space_name.to_string(),
                known,
            });
        }
        match self.spaces.lock().await.get(space_name) {
            Some(space) => Ok(space.clone()),
            None => Err(PusherError::UnknownSpace {
                requested: space_name.to_string(),
                known,
            }),
        }
    }

    pub async fn handle_leave_space(
        &self,
        client: &Arc<ClientSession>,
        space_name: &str,
    ) -> Result<(), PusherError> {
        let space = self.space_for_client(client, space_name).await?;
        let user_id = {
            let mut data = client.data.lock().await;
            data.spaces.retain(|r| r.name != space_name);
            data.space_user.id
        };
        space.remove_client_watcher(client).await;
        if let Err(err) = space.remove_user(user_id).await {
            tracing::warn!(space = space_name, ?err, "Failed to announce user removal.");
        }
        self.delete_space_if_empty(&space).await;
        Ok(())
    }

    /// Tears down every space membership of the client; used on disconnect.
    pub async fn leave_spaces(&self, client: &Arc<ClientSession>) {
        let (refs, user_id) = {
            let mut data = client.data.lock().await;
            let refs = std::mem::take(&mut data.spaces);
            data.spaces_filters.clear();
            (refs, data.space_user.id)
        };
        for space_ref in refs {
            let space = { self.spaces.lock().await.get(&space_ref.name).cloned() };
            let Some(space) = space else {
                continue;
            };
            space.remove_client_watcher(client).await;
            if let Err(err) = space.remove_user(user_id).await {
                tracing::debug!(space = space_ref.name, ?err, "Removal not delivered.");
            }
            self.delete_space_if_empty(&space).await;
        }
    }

    /// Disposal is driven by watcher cardinality; the shared stream goes away
    /// with the last space referencing its back.
    async fn delete_space_if_empty(&self, space: &Arc<Space>) {
        {
            let mut spaces = self.spaces.lock().await;
            if !space.is_empty().await {
                return;
            }
            spaces.remove(space.name());
        }
        space.announce_leave().await;

        let back_id = space.back_id();
        let still_referenced = {
            self.spaces
                .lock()
                .await
                .values()
                .any(|s| s.back_id() == back_id)
        };
        if !still_referenced {
            let connection = {
                let mut streams = self.space_streams.lock().await;
                streams
                    .remove(&back_id)
                    .and_then(|cell| cell.get().cloned())
            };
            if let Some(connection) = connection {
                connection.end();
                tracing::info!(back_id, "Disposed space back-stream, no space references it.");
            }
        }
    }

    /// Removes the stream handle and every space on the lost back. Client
    /// sockets stay open; later writes surface as client-level errors.
    pub(crate) async fn evict_back(self: &Arc<Self>, back_id: usize) {
        {
            let mut streams = self.space_streams.lock().await;
            streams.remove(&back_id);
        }
        let evicted: Vec<Arc<Space>> = {
            let mut spaces = self.spaces.lock().await;
            let names: Vec<String> = spaces
                .iter()
                .filter(|(_, s)| s.back_id() == back_id)
                .map(|(name, _)| name.clone())
                .collect();
            names.iter().filter_map(|name| spaces.remove(name)).collect()
        };
        for space in evicted {
            tracing::warn!(
                space = space.name(),
                back_id,
                "Evicting space after back-end stream loss."
            );
            for client in space.drain_watchers().await {
                let mut data = client.data.lock().await;
                data.spaces.retain(|r| r.name != space.name());
                data.spaces_filters.remove(space.name());
            }
        }
    }

    /// Dispatch of one demuxed frame from a shared space stream.
    pub(crate) async fn dispatch_space_frame(
        &self,
        frame: SpaceReadFrame,
        to_back: &mpsc::Sender<SpaceWriteFrame>,
    ) {
        match frame {
            // Answered by the pump before dispatch.
            SpaceReadFrame::Ping => {}
            SpaceReadFrame::AddSpaceUser { space_name, user } => {
                if let Some(space) = self.space_by_name(&space_name).await {
                    space.local_add_user(user).await;
                } else {
                    tracing::warn!(space_name, "Add for unknown space.");
                }
            }
            SpaceReadFrame::UpdateSpaceUser {
                space_name,
                user,
                mask,
            } => {
                if let Some(space) = self.space_by_name(&space_name).await {
                    space.local_update_user(user, mask).await;
                } else {
                    tracing::warn!(space_name, "Update for unknown space.");
                }
            }
            SpaceReadFrame::RemoveSpaceUser {
                space_name,
                user_id,
            } => {
                if let Some(space) = self.space_by_name(&space_name).await {
                    space.local_remove_user(user_id).await;
                } else {
                    tracing::warn!(space_name, "Removal for unknown space.");
                }
            }
            SpaceReadFrame::UpdateSpaceMetadata {
                space_name,
                metadata,
            } => match parse_metadata(&metadata) {
                Ok(update) => {
                    if let Some(space) = self.space_by_name(&space_name).await {
                        space.local_update_metadata(update, true).await;
                    } else {
                        tracing::warn!(space_name, "Metadata for unknown space.");
                    }
                }
                Err(err) => {
                    tracing::error!(space_name, err, "Dropping invalid metadata blob.");
                }
            },
            SpaceReadFrame::KickOff {
                space_name,
                user_id,
            } => {
                // Legacy relay: the back expects the pusher to echo the kick
                // command back after authorization.
                let _ = to_back
                    .send(SpaceWriteFrame::KickOffUser {
                        space_name,
                        user_id,
                    })
                    .await;
            }
            SpaceReadFrame::PublicEvent(event) => {
                if let Some(space) = self.space_by_name(&event.space_name).await {
                    space.send_public_event(event).await;
                } else {
                    tracing::warn!(space_name = event.space_name, "Event for unknown space.");
                }
            }
            SpaceReadFrame::PrivateEvent(event) => {
                if let Some(space) = self.space_by_name(&event.space_name).await {
                    space.send_private_event(event).await;
                } else {
                    tracing::warn!(space_name = event.space_name, "Event for unknown space.");
                }
            }
        }
    }

    async fn space_by_name(&self, space_name: &str) -> Option<Arc<Space>> {
        self.spaces.lock().await.get(space_name).cloned()
    }

    // ----- space operations from clients ----------------------------------

    /// Local non-propagating merge plus forward to the back.
    pub async fn handle_update_space_metadata(
        &self,
        client: &Arc<ClientSession>,
        space_name: &str,
        metadata: String,
    ) -> Result<(), PusherError> {
        let space = self.space_for_client(client, space_name).await?;
        let update = parse_metadata(&metadata).map_err(PusherError::InvalidMetadata)?;
        space.local_update_metadata(update, false).await;
        space.forward_metadata_update(metadata).await?;
        Ok(())
    }

    /// Idempotent add-by-name; mirrors the filter on the client side.
    pub async fn handle_add_space_filter(
        &self,
        client: &Arc<ClientSession>,
        space_name: &str,
        filter: SpaceFilter,
    ) -> Result<(), PusherError> {
        let space = self.space_for_client(client, space_name).await?;
        {
            let mut data = client.data.lock().await;
            let list = data
                .spaces_filters
                .entry(space_name.to_string())
                .or_default();
            match list.iter_mut().find(|f| f.name == filter.name) {
                Some(existing) => *existing = filter.clone(),
                None => list.push(filter.clone()),
            }
        }
        space.handle_add_filter(client, filter).await;
        Ok(())
    }

    /// Requires the filter to exist; unknown names are logged and dropped.
    pub async fn handle_update_space_filter(
        &self,
        client: &Arc<ClientSession>,
        space_name: &str,
        filter: SpaceFilter,
    ) -> Result<(), PusherError> {
        let space = self.space_for_client(client, space_name).await?;
        if !space.handle_update_filter(client, filter.clone()).await {
            tracing::warn!(
                space_name,
                filter = filter.name,
                "Dropping update for unknown filter."
            );
            return Ok(());
        }
        let mut data = client.data.lock().await;
        if let Some(list) = data.spaces_filters.get_mut(space_name) {
            if let Some(existing) = list.iter_mut().find(|f| f.name == filter.name) {
                *existing = filter;
            }
        }
        Ok(())
    }

    /// Removing an absent filter is a no-op.
    pub async fn handle_remove_space_filter(
        &self,
        client: &Arc<ClientSession>,
        space_name: &str,
        filter_name: &str,
    ) -> Result<(), PusherError> {
        let space = self.space_for_client(client, space_name).await?;
        {
            let mut data = client.data.lock().await;
            if let Some(list) = data.spaces_filters.get_mut(space_name) {
                list.retain(|f| f.name != filter_name);
            }
        }
        space.handle_remove_filter(client, filter_name).await;
        Ok(())
    }

    /// Applies the masked merge to the client's canonical record, then
    /// delegates to the space.
    pub async fn handle_update_space_user(
        &self,
        client: &Arc<ClientSession>,
        space_name: &str,
        user: SpaceUser,
        mask: FieldMask,
    ) -> Result<(), PusherError> {
        let space = self.space_for_client(client, space_name).await?;
        {
            let mut data = client.data.lock().await;
            let unknown = data.space_user.merge_masked(&user, &mask);
            if !unknown.is_empty() {
                tracing::warn!(?unknown, "Unknown paths in space user update.");
            }
        }
        space.update_user(user, mask).await?;
        Ok(())
    }

    pub async fn handle_public_event(
        &self,
        client: &Arc<ClientSession>,
        space_name: &str,
        payload: String,
    ) -> Result<(), PusherError> {
        let sender_user_id = client.user_id().ok_or(PusherError::NoUserId)?;
        let space = self.space_for_client(client, space_name).await?;
        space
            .forward_public_event(PublicSpaceEvent {
                space_name: space.name().to_string(),
                sender_user_id,
                payload,
            })
            .await?;
        Ok(())
    }

    pub async fn handle_private_event(
        &self,
        client: &Arc<ClientSession>,
        space_name: &str,
        receiver_user_id: i32,
        payload: String,
    ) -> Result<(), PusherError> {
        let sender_user_id = client.user_id().ok_or(PusherError::NoUserId)?;
        let space = self.space_for_client(client, space_name).await?;
        space
            .forward_private_event(PrivateSpaceEvent {
                space_name: space.name().to_string(),
                sender_user_id,
                receiver_user_id,
                payload,
            })
            .await?;
        Ok(())
    }

    /// Kick requests for spaces known locally go through the space; unknown
    /// spaces are optionally relayed blind (cross-front kick).
    pub async fn handle_kick_off(
        &self,
        client: &Arc<ClientSession>,
        space_name: &str,
        user_id: i32,
    ) -> Result<(), PusherError> {
        match self.space_for_client(client, space_name).await {
            Ok(space) => Ok(space.kick_off_user(client, user_id).await?),
            Err(err) => {
                if !self.settings.forward_unknown_kick {
                    return Err(err);
                }
                let back_id = self.directory.index(space_name);
                let connection = {
                    self.space_streams
                        .lock()
                        .await
                        .get(&back_id)
                        .and_then(|cell| cell.get().cloned())
                };
                match connection {
                    Some(connection) => {
                        connection
                            .write(SpaceWriteFrame::KickOffUser {
                                space_name: space_name.to_string(),
                                user_id,
                            })
                            .await?;
                        Ok(())
                    }
                    None => {
                        tracing::warn!(
                            space_name,
                            "Dropping kick-off, no stream for the space's back."
                        );
                        Ok(())
                    }
                }
            }
        }
    }

    // ----- teardown -------------------------------------------------------

    /// Runs the full client teardown exactly once: flag, room, spaces.
    pub async fn handle_disconnect(&self, client: &Arc<ClientSession>) {
        if client.mark_disconnecting() {
            return;
        }
        self.leave_room(client).await;
        self.leave_spaces(client).await;
        self.notify_admins(
            &client.room_id,
            AdminEnvelope::MemberLeave {
                uuid: client.uuid.clone(),
                room_id: client.room_id.clone(),
            },
        )
        .await;
    }

    /// Disposes everything; tests construct a fresh multiplexer per case and
    /// call this explicitly.
    pub async fn close(&self) {
        let rooms: Vec<_> = self.rooms.lock().await.drain().collect();
        for (_, cell) in rooms {
            if let Some(room) = cell.get() {
                room.close();
            }
        }
        self.spaces.lock().await.clear();
        let streams: Vec<_> = self.space_streams.lock().await.drain().collect();
        for (_, cell) in streams {
            if let Some(connection) = cell.get() {
                connection.end();
            }
        }
        self.admin_watchers.lock().await.clear();
    }

    /// Fallback cleanup; rooms and spaces normally dispose themselves on the
    /// last leave.
    pub async fn sweep(&self) {
        let room_urls: Vec<String> = self.rooms.lock().await.keys().cloned().collect();
        for room_url in room_urls {
            self.delete_room_if_empty(&room_url).await;
        }
        let spaces: Vec<Arc<Space>> = self.spaces.lock().await.values().cloned().collect();
        for space in spaces {
            self.delete_space_if_empty(&space).await;
        }
    }

    /// Number of clients in a room, if the room exists.
    pub async fn room_population(&self, room_url: &str) -> Option<usize> {
        match self.room_by_url(room_url).await {
            Some(room) => Some(room.client_count().await),
            None => None,
        }
    }

    /// Number of watchers of a space, if the space exists.
    pub async fn space_watcher_count(&self, space_name: &str) -> Option<usize> {
        match self.space_by_name(space_name).await {
            Some(space) => Some(space.watcher_count().await),
            None => None,
        }
    }

    /// Whether a shared stream towards the given back is currently open.
    pub async fn has_space_stream(&self, back_id: usize) -> bool {
        self.space_streams
            .lock()
            .await
            .get(&back_id)
            .is_some_and(|cell| cell.get().is_some())
    }

    /// One line per room and space, for the status page.
    pub async fn enlist(&self) -> String {
        let mut lines = Vec::new();
        for (room_url, cell) in self.rooms.lock().await.iter() {
            if let Some(room) = cell.get() {
                lines.push(format!(
                    "Room:  {:<40} Clients: {:03}",
                    room_url,
                    room.client_count().await
                ));
            }
        }
        for (name, space) in self.spaces.lock().await.iter() {
            lines.push(format!(
                "Space: {:<40} Users: {:03} Watchers: {:03} Back: {}",
                name,
                space.user_count().await,
                space.watcher_count().await,
                space.back_id()
            ));
        }
        lines.join("\n")
    }

    // ----- admin ----------------------------------------------------------

    /// Registers an administrative watcher for one room.
    pub async fn handle_admin_room(&self, watcher: AdminWatcher, room_id: &str) {
        self.admin_watchers
            .lock()
            .await
            .entry(room_id.to_string())
            .or_default()
            .push(watcher);
    }

    /// Drops an administrative watcher from every room it listened to.
    pub async fn leave_admin(&self, admin_id: u64) {
        let mut watchers = self.admin_watchers.lock().await;
        for list in watchers.values_mut() {
            list.retain(|w| w.id != admin_id);
        }
        watchers.retain(|_, list| !list.is_empty());
    }

    async fn notify_admins(&self, room_id: &str, envelope: AdminEnvelope) {
        let mut watchers = self.admin_watchers.lock().await;
        if let Some(list) = watchers.get_mut(room_id) {
            list.retain(|watcher| match watcher.sender.try_send(envelope.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(room_id, "Admin watcher channel saturated.");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    /// Bans a user: best effort against the admin service, authoritative via
    /// the back owning the room.
    pub async fn emit_ban(
        &self,
        uuid: &str,
        name: &str,
        room_id: &str,
        message: &str,
    ) -> Result<(), PusherError> {
        if let Err(err) = self
            .admin_api
            .ban_user_by_uuid(uuid, room_id, name, message)
            .await
        {
            tracing::warn!(?err, "Admin service ban failed, still relaying to back.");
        }
        self.directory
            .room_client(room_id)
            .ban(BanMessage {
                recipient_uuid: uuid.to_string(),
                message: message.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Ban requested over the client protocol; non-admins are rejected
    /// silently.
    pub async fn handle_ban_user(
        &self,
        client: &Arc<ClientSession>,
        uuid: &str,
        name: &str,
        message: &str,
    ) -> Result<(), PusherError> {
        if !client.is_admin() {
            tracing::warn!(client = client.uuid, "Ignoring ban from non-admin client.");
            return Ok(());
        }
        self.emit_ban(uuid, name, &client.room_id, message).await
    }

    /// Sends a moderation message to one user of one room.
    pub async fn emit_send_user_message(
        &self,
        room_id: &str,
        uuid: &str,
        message: &str,
        kind: &str,
    ) -> Result<(), PusherError> {
        self.directory
            .room_client(room_id)
            .send_admin_message(AdminMessage {
                recipient_uuid: uuid.to_string(),
                message: message.to_string(),
                kind: kind.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Broadcasts to the client's room, or to every room of the same world
    /// when requested. Requires the admin tag.
    pub async fn emit_play_global_message(
        &self,
        client: &Arc<ClientSession>,
        message: PlayGlobalMessage,
    ) -> Result<(), PusherError> {
        if !client.is_admin() {
            return Err(PusherError::Unauthorized(
                "global messages require the admin tag",
            ));
        }
        let broadcast = RoomBroadcast {
            kind: message.kind,
            content: message.content,
        };
        if message.broadcast_to_world {
            let room_urls = self
                .admin_api
                .get_url_rooms_from_same_world(&client.room_id)
                .await?;
            for room_url in room_urls {
                if let Err(err) = self
                    .directory
                    .room_client(&room_url)
                    .send_admin_message_to_room(&room_url, broadcast.clone())
                    .await
                {
                    tracing::error!(room_url, ?err, "World broadcast failed for one room.");
                }
            }
        } else {
            self.directory
                .room_client(&client.room_id)
                .send_admin_message_to_room(&client.room_id, broadcast)
                .await?;
        }
        Ok(())
    }

    /// Relays a player report to the admin service; failures degrade to a log
    /// line.
    pub async fn handle_report_player(
        &self,
        client: &Arc<ClientSession>,
        reported_uuid: &str,
        comment: &str,
    ) {
        if let Err(err) = self
            .admin_api
            .report_player(reported_uuid, comment, &client.uuid, &client.room_id)
            .await
        {
            tracing::warn!(?err, "Player report not delivered.");
        }
    }

    // ----- queries --------------------------------------------------------

    /// Answers one query; every failure becomes an error answer, never a
    /// crash of the session.
    pub async fn handle_query(&self, client: &Arc<ClientSession>, id: u32, kind: QueryKind) {
        let payload = self.answer_query(client, kind).await;
        client.send(ServerMessage::Answer { id, payload });
    }

    async fn answer_query(&self, client: &ClientSession, kind: QueryKind) -> AnswerPayload {
        match kind {
            QueryKind::RoomTags => match self.admin_api.get_tags_list(&client.room_id).await {
                Ok(tags) => AnswerPayload::Tags { tags },
                Err(err) => {
                    // Degraded mode: an empty list instead of an error.
                    tracing::warn!(?err, "Tag list unavailable.");
                    AnswerPayload::Tags { tags: Vec::new() }
                }
            },
            QueryKind::RoomsFromSameWorld => {
                match self
                    .admin_api
                    .get_url_rooms_from_same_world(&client.room_id)
                    .await
                {
                    Ok(room_urls) => AnswerPayload::Rooms { room_urls },
                    Err(err) => AnswerPayload::Error {
                        message: err.to_string(),
                    },
                }
            }
            QueryKind::SearchMembers { query } => {
                match self.admin_api.search_members(&client.room_id, &query).await {
                    Ok((members, total)) => AnswerPayload::Members { members, total },
                    Err(err) => AnswerPayload::Error {
                        message: err.to_string(),
                    },
                }
            }
            QueryKind::SearchTags { query } => {
                match self.admin_api.search_tags(&client.room_id, &query).await {
                    Ok(tags) => AnswerPayload::Tags { tags },
                    Err(err) => AnswerPayload::Error {
                        message: err.to_string(),
                    },
                }
            }
            QueryKind::GetMember { uuid } => match self.admin_api.get_member(&uuid).await {
                Ok(member) => AnswerPayload::Member { member },
                Err(err) => AnswerPayload::Error {
                    message: err.to_string(),
                },
            },
            QueryKind::ChatMembers { search } => {
                match self
                    .admin_api
                    .get_world_chat_members(&client.room_id, &search)
                    .await
                {
                    Ok((members, total)) => AnswerPayload::ChatMembers { members, total },
                    Err(err) => AnswerPayload::Error {
                        message: err.to_string(),
                    },
                }
            }
            QueryKind::EmbeddableWebsite { url } => {
                let (state, message) = self.embeddable.verify(&url).await;
                AnswerPayload::EmbeddableWebsite {
                    url,
                    state,
                    message,
                }
            }
            QueryKind::OauthRefreshToken { token } => {
                match self.admin_api.refresh_oauth_token(&token).await {
                    Ok(token) => AnswerPayload::OauthRefreshToken { token },
                    Err(err) => AnswerPayload::Error {
                        message: err.to_string(),
                    },
                }
            }
        }
    }
}

/// Zone events reach their client through the batch emitter; group moves are
/// encoded as group updates.
impl ZoneEventListener for SessionMultiplexer {
    fn on_user_enters(&self, client: &ClientSession, user: &ZoneUser) {
        client.emitter.push(BatchSub::UserJoined(user.clone()));
    }

    fn on_user_moves(&self, client: &ClientSession, user_id: i32, position: Position) {
        client.emitter.push(BatchSub::UserMoved { user_id, position });
    }

    fn on_user_leaves(&self, client: &ClientSession, user_id: i32) {
        client.emitter.push(BatchSub::UserLeft { user_id });
    }

    fn on_group_enters(&self, client: &ClientSession, group: &GroupDescriptor) {
        client.emitter.push(BatchSub::GroupUpdate(*group));
    }

    fn on_group_moves(&self, client: &ClientSession, group: &GroupDescriptor) {
        client.emitter.push(BatchSub::GroupUpdate(*group));
    }

    fn on_group_leaves(&self, client: &ClientSession, group_id: i32) {
        client.emitter.push(BatchSub::GroupDelete { group_id });
    }

    fn on_emote(&self, client: &ClientSession, user_id: i32, emote: &str) {
        client.emitter.push(BatchSub::Emote {
            user_id,
            emote: emote.to_string(),
        });
    }

    fn on_player_details_updated(
        &self,
        client: &ClientSession,
        user_id: i32,
        details: &PlayerDetails,
    ) {
        client.emitter.push(BatchSub::PlayerDetailsUpdated {
            user_id,
            details: details.clone(),
        });
    }

    fn on_error(&self, client: &ClientSession, message: &str) {
        client.emitter.push(BatchSub::Error {
            message: message.to_string(),
        });
    }
}
