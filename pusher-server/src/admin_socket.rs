//! The administrative WebSocket: a JSON text protocol with `{type, data}`
//! envelopes. Admins subscribe to rooms and receive member churn events;
//! their commands (ban, user message) are relayed to the owning back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use protocol::{AdminCommand, AdminEnvelope, CHANNEL_BUFFER_SIZE};

use crate::multiplexer::{AdminWatcher, SessionMultiplexer};

static NEXT_ADMIN_ID: AtomicU64 = AtomicU64::new(1);

/// Serves one administrative client from upgrade to teardown.
pub async fn serve_admin(socket: WebSocket, mux: Arc<SessionMultiplexer>) {
    let (ws_sender, ws_receiver) = socket.split();
    let (envelope_tx, envelope_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    let admin_id = NEXT_ADMIN_ID.fetch_add(1, Ordering::Relaxed);

    let mut send_task = tokio::spawn(write_pump(ws_sender, envelope_rx));
    let read_mux = mux.clone();
    let mut receive_task =
        tokio::spawn(async move { read_pump(ws_receiver, read_mux, envelope_tx, admin_id).await });

    let result = tokio::select! {
        res_a = &mut send_task => { receive_task.abort(); res_a },
        res_b = &mut receive_task => { send_task.abort(); res_b },
    };
    let reason = result.unwrap_or_else(|err| {
        tracing::error!(?err, "Internal panic in admin socket logic.");
        "Internal panic in admin socket logic."
    });

    mux.leave_admin(admin_id).await;
    tracing::info!(admin_id, reason, "Admin session closed.");
}

async fn write_pump(
    mut sender: SplitSink<WebSocket, Message>,
    mut envelope_rx: mpsc::Receiver<AdminEnvelope>,
) -> &'static str {
    while let Some(envelope) = envelope_rx.recv().await {
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(?err, "Failed to encode admin envelope.");
                continue;
            }
        };
        if sender.send(Message::Text(text.into())).await.is_err() {
            return "Connection lost.";
        }
    }
    "Admin channel closed."
}

async fn read_pump(
    mut receiver: SplitStream<WebSocket>,
    mux: Arc<SessionMultiplexer>,
    envelope_tx: mpsc::Sender<AdminEnvelope>,
    admin_id: u64,
) -> &'static str {
    while let Some(item) = receiver.next().await {
        match item {
            Ok(Message::Text(text)) => match serde_json::from_str::<AdminCommand>(&text) {
                Ok(AdminCommand::Listen { room_ids }) => {
                    for room_id in room_ids {
                        mux.handle_admin_room(
                            AdminWatcher {
                                id: admin_id,
                                sender: envelope_tx.clone(),
                            },
                            &room_id,
                        )
                        .await;
                    }
                }
                Ok(AdminCommand::Ban {
                    uuid,
                    name,
                    room_id,
                    message,
                }) => {
                    if let Err(err) = mux.emit_ban(&uuid, &name, &room_id, &message).await {
                        report_error(&envelope_tx, format!("Ban failed: {err}"));
                    }
                }
                Ok(AdminCommand::UserMessage {
                    uuid,
                    room_id,
                    message,
                    kind,
                }) => {
                    if let Err(err) = mux
                        .emit_send_user_message(&room_id, &uuid, &message, &kind)
                        .await
                    {
                        report_error(&envelope_tx, format!("User message failed: {err}"));
                    }
                }
                Err(err) => {
                    report_error(&envelope_tx, format!("Unparsable admin command: {err}"));
                }
            },
            Ok(Message::Close(_)) => return "Admin closed the socket.",
            Ok(_) => {}
            Err(_) => return "Connection lost.",
        }
    }
    "Connection lost."
}

fn report_error(envelope_tx: &mpsc::Sender<AdminEnvelope>, message: String) {
    let _ = envelope_tx.try_send(AdminEnvelope::Error { message });
}
