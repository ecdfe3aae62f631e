//! WebSocket implementation of the back-end contract: one connection per
//! stream, postcard-framed binary messages, channel pairs towards the core.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use protocol::{
    AdminMessage, AdminRpcFrame, BanMessage, CHANNEL_BUFFER_SIZE, RoomBroadcast, RoomInFrame,
    RoomOutFrame, SpaceReadFrame, SpaceWriteFrame, ZoneFrame, ZoneWatchRequest,
};

use crate::back::{BackClient, BackError, RoomStream, SpaceStream, StreamItem, ZoneStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One back-end process, addressed by its WebSocket base URL.
pub struct WsBackClient {
    endpoint: String,
}

impl WsBackClient {
    pub fn new(endpoint: &str) -> Self {
        WsBackClient {
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    async fn connect(&self, path: &str) -> Result<WsStream, BackError> {
        let url = format!("{}{}", self.endpoint, path);
        match connect_async(url.as_str()).await {
            Ok((socket, _response)) => Ok(socket),
            Err(err) => Err(BackError::Connect {
                message: err.to_string(),
                url,
            }),
        }
    }

    /// One-shot call: connect, write the frame, close.
    async fn send_unary(&self, frame: AdminRpcFrame) -> Result<(), BackError> {
        let mut socket = self.connect("/admin").await?;
        let bytes =
            postcard::to_stdvec(&frame).map_err(|err| BackError::Codec(err.to_string()))?;
        socket
            .send(Message::Binary(Bytes::from(bytes)))
            .await
            .map_err(|err| BackError::Stream(err.to_string()))?;
        let _ = socket.close(None).await;
        Ok(())
    }
}

/// Spawns the writer and reader tasks for one bidirectional stream and
/// returns the channel pair the core works with. The transport closes when
/// the writer channel does.
fn spawn_stream_pumps<In, Out>(
    socket: WsStream,
) -> (mpsc::Sender<In>, mpsc::Receiver<StreamItem<Out>>)
where
    In: Serialize + Send + 'static,
    Out: DeserializeOwned + Send + 'static,
{
    let (write_tx, mut write_rx) = mpsc::channel::<In>(CHANNEL_BUFFER_SIZE);
    let (read_tx, read_rx) = mpsc::channel::<StreamItem<Out>>(CHANNEL_BUFFER_SIZE);
    let (mut sink, stream) = socket.split();

    tokio::spawn(async move {
        while let Some(frame) = write_rx.recv().await {
            let bytes = match postcard::to_stdvec(&frame) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::error!(?err, "Failed to encode frame for the back.");
                    break;
                }
            };
            if sink.send(Message::Binary(Bytes::from(bytes))).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    spawn_reader(stream, read_tx);
    (write_tx, read_rx)
}

/// Reader half shared by the bidirectional and the read-only streams.
fn spawn_reader<Out, S>(mut stream: S, read_tx: mpsc::Sender<StreamItem<Out>>)
where
    Out: DeserializeOwned + Send + 'static,
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin
        + Send
        + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(Message::Binary(bytes)) => match postcard::from_bytes::<Out>(&bytes) {
                    Ok(frame) => {
                        if read_tx.send(Ok(frame)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = read_tx.send(Err(BackError::Codec(err.to_string()))).await;
                        return;
                    }
                },
                Ok(Message::Close(_)) => return,
                Ok(_) => {}
                Err(err) => {
                    let _ = read_tx.send(Err(BackError::Stream(err.to_string()))).await;
                    return;
                }
            }
        }
    });
}

#[async_trait]
impl BackClient for WsBackClient {
    async fn join_room(&self) -> Result<RoomStream, BackError> {
        let socket = self.connect("/room").await?;
        let (to_back, from_back) = spawn_stream_pumps::<RoomInFrame, RoomOutFrame>(socket);
        Ok(RoomStream { to_back, from_back })
    }

    async fn watch_zone(&self, room_url: &str) -> Result<ZoneStream, BackError> {
        let mut socket = self.connect("/zone").await?;
        let request = ZoneWatchRequest {
            room_url: room_url.to_string(),
        };
        let bytes =
            postcard::to_stdvec(&request).map_err(|err| BackError::Codec(err.to_string()))?;
        socket
            .send(Message::Binary(Bytes::from(bytes)))
            .await
            .map_err(|err| BackError::Stream(err.to_string()))?;
        let (read_tx, frames) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        spawn_reader::<ZoneFrame, _>(socket, read_tx);
        Ok(ZoneStream { frames })
    }

    async fn watch_space(&self) -> Result<SpaceStream, BackError> {
        let socket = self.connect("/space").await?;
        let (to_back, from_back) = spawn_stream_pumps::<SpaceWriteFrame, SpaceReadFrame>(socket);
        Ok(SpaceStream { to_back, from_back })
    }

    async fn send_admin_message(&self, message: AdminMessage) -> Result<(), BackError> {
        self.send_unary(AdminRpcFrame::SendAdminMessage(message)).await
    }

    async fn ban(&self, ban: BanMessage) -> Result<(), BackError> {
        self.send_unary(AdminRpcFrame::Ban(ban)).await
    }

    async fn send_admin_message_to_room(
        &self,
        room_url: &str,
        broadcast: RoomBroadcast,
    ) -> Result<(), BackError> {
        self.send_unary(AdminRpcFrame::SendAdminMessageToRoom {
            room_url: room_url.to_string(),
            broadcast,
        })
        .await
    }
}
