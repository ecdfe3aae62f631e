//! The pump draining one client's room back-stream: frames are re-emitted to
//! the client unchanged, two of them are snooped on the way through.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use protocol::{CLOSE_BACK_LOST, RoomInFrame, RoomOutFrame, ServerMessage};

use crate::back::StreamItem;
use crate::client::ClientSession;
use crate::room::PusherRoom;

/// Spawns the task forwarding back frames to one client. Returns its handle;
/// the task ends with a reason string when the stream does.
pub fn spawn_room_pump(
    client: Arc<ClientSession>,
    room: Arc<PusherRoom>,
    mut from_back: mpsc::Receiver<StreamItem<RoomOutFrame>>,
) -> JoinHandle<&'static str> {
    tokio::spawn(async move {
        while let Some(item) = from_back.recv().await {
            match item {
                Ok(RoomOutFrame::RoomJoined(joined)) => {
                    client.assign_user_id(joined.current_user_id);
                    let (viewport, back) = {
                        let mut data = client.data.lock().await;
                        data.space_user.id = joined.current_user_id;
                        data.can_edit = joined.can_edit;
                        (data.viewport, data.back_connection.clone())
                    };
                    if let Some(back) = back {
                        // Re-issue the viewport so the back starts feeding
                        // zone events for this client right away.
                        let _ = back.send(RoomInFrame::UpdateViewport(viewport)).await;
                    }
                    room.set_viewport(&client, viewport).await;
                    client.send(ServerMessage::Room(RoomOutFrame::RoomJoined(joined)));
                }
                Ok(RoomOutFrame::RefreshRoom { version }) => {
                    if room.needs_update(version).await {
                        tracing::debug!(
                            room = room.room_url(),
                            version,
                            "Room refresh observed."
                        );
                    }
                    client.send(ServerMessage::Room(RoomOutFrame::RefreshRoom { version }));
                }
                Ok(frame) => client.send(ServerMessage::Room(frame)),
                Err(err) => {
                    tracing::error!(
                        session_id = client.session_id,
                        room = room.room_url(),
                        ?err,
                        "Room back-stream error."
                    );
                    if !client.is_disconnecting() {
                        client.close(CLOSE_BACK_LOST, "Connection to back server lost");
                    }
                    return "Room back-stream error.";
                }
            }
        }
        if !client.is_disconnecting() {
            client.close(CLOSE_BACK_LOST, "Connection to back server lost");
        }
        "Room back-stream ended."
    })
}
