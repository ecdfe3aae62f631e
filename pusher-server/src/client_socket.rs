//! The front WebSocket pumps for one client: the write task drains the
//! session's outbound channel, the read task decodes client frames and
//! dispatches them into the multiplexer.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use protocol::{BatchSub, CHANNEL_BUFFER_SIZE, ClientMessage};

use crate::batch::BatchSettings;
use crate::client::{ClientIdentity, ClientSession, Outbound};
use crate::error::PusherError;
use crate::multiplexer::SessionMultiplexer;

/// Does the whole handling from session creation to teardown: room join, the
/// paired pumps, and the disconnect cleanup once either pump finishes.
pub async fn serve_client(
    socket: WebSocket,
    mux: Arc<SessionMultiplexer>,
    identity: ClientIdentity,
    batching: BatchSettings,
) {
    let (mut ws_sender, ws_receiver) = socket.split();
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    let client = ClientSession::new(identity, out_tx, batching);

    if let Err(err) = mux.handle_join_room(&client).await {
        tracing::error!(room = client.room_id, %err, "Room join failed.");
        let _ = ws_sender
            .send(Message::Close(Some(CloseFrame {
                code: protocol::CLOSE_BACK_LOST,
                reason: "Unable to join the room back-end.".into(),
            })))
            .await;
        return;
    }

    let mut send_task = tokio::spawn(write_pump(ws_sender, out_rx));
    let read_mux = mux.clone();
    let read_client = client.clone();
    let mut receive_task =
        tokio::spawn(async move { read_pump(ws_receiver, read_mux, read_client).await });

    // If any one of the tasks runs to completion, we abort the other.
    let result = tokio::select! {
        res_a = &mut send_task => { receive_task.abort(); res_a },
        res_b = &mut receive_task => { send_task.abort(); res_b },
    };
    let reason = result.unwrap_or_else(|err| {
        tracing::error!(?err, "Internal panic in client socket logic.");
        "Internal panic in client socket logic."
    });

    mux.handle_disconnect(&client).await;
    tracing::info!(
        session_id = client.session_id,
        room = client.room_id,
        reason,
        "Client session closed."
    );
}

/// Drains the session channel into the socket; a close order ends the task.
async fn write_pump(
    mut sender: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Outbound>,
) -> &'static str {
    while let Some(outbound) = out_rx.recv().await {
        match outbound {
            Outbound::Frame(message) => {
                let bytes = match postcard::to_stdvec(&message) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        tracing::error!(?err, "Failed to encode frame for the client.");
                        return "Failed to encode frame for the client.";
                    }
                };
                if sender.send(Message::Binary(Bytes::from(bytes))).await.is_err() {
                    return "Connection lost.";
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                return reason;
            }
        }
    }
    "Client channel closed."
}

/// Decodes inbound frames and routes them; handler errors become error
/// sub-messages for the client instead of ending the session.
async fn read_pump(
    mut receiver: SplitStream<WebSocket>,
    mux: Arc<SessionMultiplexer>,
    client: Arc<ClientSession>,
) -> &'static str {
    while let Some(item) = receiver.next().await {
        match item {
            Ok(Message::Binary(bytes)) => {
                let message = match postcard::from_bytes::<ClientMessage>(&bytes) {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::error!(
                            session_id = client.session_id,
                            ?err,
                            "Malformed client frame."
                        );
                        return "Malformed client frame.";
                    }
                };
                if let Err(err) = dispatch(&mux, &client, message).await {
                    tracing::warn!(session_id = client.session_id, %err, "Client operation failed.");
                    client.emitter.push(BatchSub::Error {
                        message: err.to_string(),
                    });
                }
            }
            Ok(Message::Close(_)) => return "Client closed the socket.",
            Ok(_) => {} // Ping/pong is handled by axum.
            Err(_) => return "Connection lost.",
        }
    }
    "Connection lost."
}

/// Total dispatch over the client protocol.
async fn dispatch(
    mux: &Arc<SessionMultiplexer>,
    client: &Arc<ClientSession>,
    message: ClientMessage,
) -> Result<(), PusherError> {
    match message {
        ClientMessage::Viewport(viewport) => {
            mux.handle_viewport(client, viewport).await;
            Ok(())
        }
        ClientMessage::UserMoves(moves) => mux.handle_user_moves(client, moves).await,
        ClientMessage::SetPlayerDetails(details) => {
            mux.handle_set_player_details(client, details).await
        }
        ClientMessage::ForwardAction(action) => mux.handle_forward_action(client, action).await,
        ClientMessage::EditMapAction(action) => mux.handle_edit_map_action(client, action).await,
        ClientMessage::JoinSpace {
            space_name,
            local_name,
        } => mux.handle_join_space(client, &space_name, &local_name).await,
        ClientMessage::LeaveSpace { space_name } => {
            mux.handle_leave_space(client, &space_name).await
        }
        ClientMessage::UpdateSpaceMetadata {
            space_name,
            metadata,
        } => {
            mux.handle_update_space_metadata(client, &space_name, metadata)
                .await
        }
        ClientMessage::AddSpaceFilter { space_name, filter } => {
            mux.handle_add_space_filter(client, &space_name, filter).await
        }
        ClientMessage::UpdateSpaceFilter { space_name, filter } => {
            mux.handle_update_space_filter(client, &space_name, filter)
                .await
        }
        ClientMessage::RemoveSpaceFilter {
            space_name,
            filter_name,
        } => {
            mux.handle_remove_space_filter(client, &space_name, &filter_name)
                .await
        }
        ClientMessage::UpdateSpaceUser {
            space_name,
            user,
            mask,
        } => mux.handle_update_space_user(client, &space_name, user, mask).await,
        ClientMessage::PublicEvent {
            space_name,
            payload,
        } => mux.handle_public_event(client, &space_name, payload).await,
        ClientMessage::PrivateEvent {
            space_name,
            receiver_user_id,
            payload,
        } => {
            mux.handle_private_event(client, &space_name, receiver_user_id, payload)
                .await
        }
        ClientMessage::KickOffUser {
            space_name,
            user_id,
        } => mux.handle_kick_off(client, &space_name, user_id).await,
        ClientMessage::PlayGlobal(message) => mux.emit_play_global_message(client, message).await,
        ClientMessage::BanUser {
            uuid,
            name,
            message,
        } => mux.handle_ban_user(client, &uuid, &name, &message).await,
        ClientMessage::ReportPlayer {
            reported_uuid,
            comment,
        } => {
            mux.handle_report_player(client, &reported_uuid, &comment)
                .await;
            Ok(())
        }
        ClientMessage::Query { id, kind } => {
            mux.handle_query(client, id, kind).await;
            Ok(())
        }
    }
}
