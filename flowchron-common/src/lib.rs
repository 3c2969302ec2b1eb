//! # flowchron common library
//!
//! Shared code for the flowchron workspace:
//! - Error type shared by every crate
//! - Configuration loading and data root resolution
//! - Pipeline event types and the EventBus
//! - Human-readable elapsed time formatting

pub mod config;
pub mod error;
pub mod events;
pub mod human_time;

pub use error::{Error, Result};
