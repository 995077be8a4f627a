//! Pipeline event sink
//!
//! The core publishes structured events over a broadcast channel; the
//! notification fan-out (Discord, email, dashboards) lives outside and
//! simply subscribes. Events are fire-and-forget: no subscriber, no
//! backpressure.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::db::file_entries::FileStatus;
use crate::error::ErrorKind;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    FileEntryProgressed {
        entry_id: i64,
        status: FileStatus,
    },
    FileEntryCompleted {
        entry_id: i64,
        release_name: Option<String>,
    },
    FileEntryFailed {
        entry_id: i64,
        kind: ErrorKind,
        message: String,
    },
    DuplicateDetected {
        entry_id: i64,
        tracker_slug: String,
        matches: usize,
    },
    BatchProgressed {
        batch_id: i64,
        completed: i64,
        failed: i64,
        cancelled: i64,
        total: i64,
    },
}

/// Broadcast-backed event sink.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            debug!("No subscribers for pipeline event");
        }
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}
