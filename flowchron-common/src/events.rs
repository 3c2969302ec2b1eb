//! Pipeline event types and EventBus
//!
//! The dispatcher reports chunk lifecycle events here; the binary subscribes
//! to render progress. Emitting never blocks a worker and no subscriber is
//! required.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Pipeline stage a chunk belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStage {
    /// Stage 1: one sub-model per dataset chunk
    Training,
    /// Stage 2: flow records per chunk of pattern occurrences
    Sampling,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStage::Training => write!(f, "training"),
            PipelineStage::Sampling => write!(f, "sampling"),
        }
    }
}

/// flowchron pipeline events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// A stage submitted its chunks to the worker pool
    StageStarted {
        run_id: Uuid,
        stage: PipelineStage,
        chunk_count: usize,
        max_workers: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// One chunk finished successfully
    ChunkCompleted {
        run_id: Uuid,
        stage: PipelineStage,
        /// Chunk position (0-based)
        chunk_index: usize,
        /// Number of items in the chunk
        chunk_len: usize,
        /// Chunks finished so far, successful or not
        finished: usize,
        total: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// One chunk failed, panicked or timed out
    ChunkFailed {
        run_id: Uuid,
        stage: PipelineStage,
        chunk_index: usize,
        chunk_len: usize,
        message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A chunk result was written to its artifact
    ChunkPersisted {
        run_id: Uuid,
        stage: PipelineStage,
        chunk_index: usize,
        path: String,
    },

    /// All chunks of a stage have been collected
    StageCompleted {
        run_id: Uuid,
        stage: PipelineStage,
        succeeded: usize,
        failed: usize,
        elapsed_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Broadcast bus for pipeline events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    ///
    /// # Examples
    ///
    /// ```
    /// use flowchron_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// assert_eq!(event_bus.capacity(), 100);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: PipelineEvent,
    ) -> Result<usize, broadcast::error::SendError<PipelineEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
