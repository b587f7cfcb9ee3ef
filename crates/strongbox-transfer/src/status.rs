/// Status reporting for the transfer engine.
///
/// The engine pushes [`StatusEvent`]s and never waits on the consumer:
/// dashboards, terminal renderers and bridges all sit behind [`StatusSink`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use strongbox_types::events::StatusEvent;

/// Fire-and-forget event consumer. Implementations must not block.
pub trait StatusSink: Send + Sync {
    fn emit(&self, event: StatusEvent);
}

/// Sink that writes events through `tracing`.
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn emit(&self, event: StatusEvent) {
        // Progress is per-packet spam; everything else is lifecycle.
        match &event {
            StatusEvent::Progress {
                bytes_done,
                bytes_total,
                speed_bytes_per_sec,
                eta_ms,
            } => {
                tracing::debug!(
                    bytes_done,
                    bytes_total,
                    speed_bytes_per_sec,
                    eta_ms,
                    "progress"
                );
            }
            StatusEvent::Error { message, fatal: true } => {
                tracing::error!(%message, "fatal");
            }
            StatusEvent::Error { message, fatal: false } => {
                tracing::warn!(%message, "recoverable");
            }
            other => tracing::info!(event = ?other, "status"),
        }
    }
}

/// Sink that discards everything.
pub struct NullSink;

impl StatusSink for NullSink {
    fn emit(&self, _event: StatusEvent) {}
}

/// Bounded queue to a consumer thread. A full queue drops the event instead
/// of stalling the transfer loop.
pub struct ChannelSink {
    tx: Sender<StatusEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, Receiver<StatusEvent>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events lost to a full or disconnected queue.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl StatusSink for ChannelSink {
    fn emit(&self, event: StatusEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Fan out to several sinks.
pub struct Tee(pub Vec<Arc<dyn StatusSink>>);

impl StatusSink for Tee {
    fn emit(&self, event: StatusEvent) {
        if let Some((last, rest)) = self.0.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
