//! # tally-core
//!
//! Core types, traits, and configuration for the tally invoice pipeline.
//!
//! This crate provides the data model, error taxonomy, and capability traits
//! that the other tally crates depend on.
//!
//! ## Logging
//!
//! All crates log through `tracing` with a shared field vocabulary:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `subsystem` | `database`, `extraction`, `jobs`, `scheduler`, `mailbox`, `monitoring` |
//! | `component` | module within the subsystem (`pool`, `controller`, `persister`, ...) |
//! | `op` | operation name |
//! | `run_id` | processing run |
//! | `attachment_record_id` | persisted attachment record |
//! | `message_id` | source email message |
//! | `attempt` | retry attempt, starting at 1 |
//! | `duration_ms` | elapsed time of the operation |
//!
//! Levels: `error` for failures the run cannot absorb, `warn` for isolated
//! attachment failures and retries, `info` for run and record lifecycle,
//! `debug` for per-step detail.

pub mod config;
pub mod defaults;
pub mod error;
pub mod events;
pub mod models;
pub mod traits;
pub mod uuid_utils;
pub mod validation;

// Re-export commonly used types at crate root
pub use config::{ConfigReport, PipelineConfig};
pub use error::{Error, ErrorKind, Result};
pub use events::{EventBus, EventEnvelope, MonitoringEvent};
pub use models::*;
pub use traits::*;
pub use uuid_utils::new_v7;
