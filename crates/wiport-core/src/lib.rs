//! wiport-core library.
//!
//! Replays exported work item histories into a destination work tracker,
//! one revision at a time, and records progress in a journal so interrupted
//! runs resume where they stopped.
//!
//! # Conventions
//!
//! - **Errors**: `thiserror` enums per concern, each with a stable
//!   [`error::ErrorCode`]; `anyhow::Result` at file-loading boundaries.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `error!`, `debug!`).

pub mod attachments;
pub mod classification;
pub mod config;
pub mod destination;
pub mod error;
pub mod export;
pub mod journal;
pub mod links;
pub mod lock;
pub mod model;
pub mod replay;
pub mod runner;
pub mod setup;

pub use replay::{EntityOutcome, EntityState, RevisionReplayer};
pub use runner::{RunSummary, run};
