//! The pump draining a shared per-back space stream, including the ping
//! watchdog: the back must ping at least every 60 seconds, each ping is
//! answered with a pong, and an expired watchdog tears the stream down.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use protocol::{SpaceReadFrame, SpaceWriteFrame};

use crate::back::StreamItem;
use crate::multiplexer::SessionMultiplexer;

/// How long the pusher waits for the next ping before declaring the back dead.
pub const PING_TIMEOUT: Duration = Duration::from_secs(60);

/// Spawns the task owning one shared space stream. Whatever ends the task —
/// stream end, stream error, or watchdog expiry — the handle is removed from
/// the directory and every space on this back is evicted.
pub fn spawn_space_pump(
    mux: Weak<SessionMultiplexer>,
    back_id: usize,
    to_back: mpsc::Sender<SpaceWriteFrame>,
    mut from_back: mpsc::Receiver<StreamItem<SpaceReadFrame>>,
) -> JoinHandle<&'static str> {
    tokio::spawn(async move {
        let mut deadline = Instant::now() + PING_TIMEOUT;
        let reason = loop {
            tokio::select! {
                item = from_back.recv() => match item {
                    Some(Ok(SpaceReadFrame::Ping)) => {
                        deadline = Instant::now() + PING_TIMEOUT;
                        if to_back.send(SpaceWriteFrame::Pong).await.is_err() {
                            break "Space back-stream writer closed.";
                        }
                    }
                    Some(Ok(frame)) => {
                        let Some(mux) = mux.upgrade() else {
                            break "Multiplexer disposed.";
                        };
                        mux.dispatch_space_frame(frame, &to_back).await;
                    }
                    Some(Err(err)) => {
                        tracing::error!(back_id, ?err, "Space back-stream error.");
                        break "Space back-stream error.";
                    }
                    None => break "Space back-stream ended.",
                },
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::error!(back_id, "Ping watchdog expired, ending space stream.");
                    break "Ping watchdog expired.";
                }
            }
        };
        if let Some(mux) = mux.upgrade() {
            mux.evict_back(back_id).await;
        }
        reason
    })
}
