//! Per-client coalescing of outbound zone events into bounded batches.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use protocol::{BatchSub, ServerMessage};

use crate::client::Outbound;

/// Flush thresholds for one client's batch queue.
#[derive(Clone, Copy, Debug)]
pub struct BatchSettings {
    pub max_batch: usize,
    pub flush_interval: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        BatchSettings {
            max_batch: 64,
            flush_interval: Duration::from_millis(100),
        }
    }
}

/// Buffers zone sub-messages for one client and flushes them either on the
/// interval tick or as soon as the configured batch size is reached.
pub struct BatchEmitter {
    shared: Arc<EmitterShared>,
    flusher: JoinHandle<()>,
}

struct EmitterShared {
    queue: std::sync::Mutex<Vec<BatchSub>>,
    max_batch: usize,
    out: mpsc::Sender<Outbound>,
    disconnecting: Arc<AtomicBool>,
}

impl BatchEmitter {
    pub fn new(
        out: mpsc::Sender<Outbound>,
        disconnecting: Arc<AtomicBool>,
        settings: BatchSettings,
    ) -> Self {
        let shared = Arc::new(EmitterShared {
            queue: std::sync::Mutex::new(Vec::new()),
            max_batch: settings.max_batch.max(1),
            out,
            disconnecting,
        });
        let ticker_shared = shared.clone();
        let flusher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(settings.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                ticker_shared.flush();
            }
        });
        BatchEmitter { shared, flusher }
    }

    /// Queues one sub-message; a full queue flushes immediately.
    pub fn push(&self, sub: BatchSub) {
        let flush_now = {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.push(sub);
            queue.len() >= self.shared.max_batch
        };
        if flush_now {
            self.shared.flush();
        }
    }
}

impl EmitterShared {
    fn flush(&self) {
        let batch = {
            let mut queue = self.queue.lock().unwrap();
            if queue.is_empty() {
                return;
            }
            std::mem::take(&mut *queue)
        };
        if self.disconnecting.load(Ordering::Relaxed) {
            return;
        }
        if let Err(err) = self.out.try_send(Outbound::Frame(ServerMessage::Batch(batch))) {
            tracing::warn!(?err, "Dropping batch for saturated client channel.");
        }
    }
}

impl Drop for BatchEmitter {
    fn drop(&mut self) {
        self.flusher.abort();
    }
}
