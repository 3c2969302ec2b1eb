//! flowchron library interface
//!
//! Parallel orchestration for pattern-based synthetic network flow
//! generation: chunked training of sub-models, composition into one model,
//! and chunked sampling of synthetic flows.

pub mod baseline;
pub mod config;
pub mod dataset;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod persistence;
pub mod pipeline;
pub mod planner;
pub mod sampling;
pub mod types;

pub use crate::error::{PipelineError, Result};
pub use crate::model::CompositeModel;
pub use crate::pipeline::{Pipeline, TrainedModel};
