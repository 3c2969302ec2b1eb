//! Error types for flowchron
//!
//! Taxonomy:
//! - Partition errors: invalid item count or worker budget, never retried
//! - Chunk failures: one unit of work failed, panicked or timed out
//! - Persistence failures: a per-chunk or final artifact could not be written
//! - Ordering violations: a completion tagged with an impossible position

use flowchron_common::events::PipelineStage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// How a chunk task ended without producing a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkFailureKind {
    /// The work function returned an error
    Failed,
    /// The worker panicked
    Panicked,
    /// The task exceeded the configured timeout
    TimedOut,
}

impl fmt::Display for ChunkFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkFailureKind::Failed => write!(f, "failed"),
            ChunkFailureKind::Panicked => write!(f, "panicked"),
            ChunkFailureKind::TimedOut => write!(f, "timed out"),
        }
    }
}

/// A failed chunk, identified by position and size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub stage: PipelineStage,
    pub index: usize,
    pub len: usize,
    pub kind: ChunkFailureKind,
    pub message: String,
}

impl fmt::Display for ChunkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} chunk {} ({} items) {}: {}",
            self.stage, self.index, self.len, self.kind, self.message
        )
    }
}

/// Pipeline error type
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid item count or worker budget
    #[error("Invalid partition: {0}")]
    Partition(String),

    /// A unit of work did not produce a result
    #[error("{0}")]
    ChunkFailed(ChunkFailure),

    /// A per-chunk or final artifact could not be written
    #[error("Failed to persist chunk {index} to {}: {message}", .path.display())]
    Persistence {
        index: usize,
        path: PathBuf,
        message: String,
    },

    /// Completion tagged with a position outside the chunk range, or twice
    #[error("Ordering violation: {0}")]
    OrderingViolation(String),

    /// Input dataset is unusable
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// A sampler broke its output contract
    #[error("Sampler error: {0}")]
    Sampler(String),

    /// Run was cancelled before every chunk was submitted
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// flowchron-common error
    #[error("Common error: {0}")]
    Common(#[from] flowchron_common::Error),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
