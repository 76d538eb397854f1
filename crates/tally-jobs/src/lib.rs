//! # tally-jobs
//!
//! Pipeline stages and orchestration for the tally invoice pipeline.
//!
//! A run goes through these stages:
//!
//! 1. [`RunController`] searches the [`AttachmentSource`](tally_core::AttachmentSource)
//!    and ranks the results with `tally-rank`.
//! 2. For each selected candidate, [`AuditPersister::begin`] creates (or
//!    reopens) the attachment record before anything else happens.
//! 3. [`ExtractionCoordinator`] downloads the attachment, runs the
//!    extractor, and validates and sequences the returned invoices.
//! 4. [`AuditPersister::complete`] writes the batch and completes the record
//!    in one atomic store call; failures mark the record failed instead.
//!
//! Every external step runs under a [`RetryPolicy`] and its own timeout.
//! [`Scheduler`] repeats runs on a daily cadence and keeps the
//! [`FileWatermarkStore`] watermark so missed days are caught up.

pub mod controller;
pub mod coordinator;
pub mod mailbox;
pub mod persister;
pub mod retry;
pub mod scheduler;
pub mod sinks;
pub mod watermark;

pub use controller::{AttachmentStatus, CandidateOutcome, RunController, RunReport};
pub use coordinator::{parse_date, shape_output, ExtractionCoordinator, ExtractionOutcome, Rejection};
pub use mailbox::{HttpMailboxSource, MailboxConfig};
pub use persister::{AuditPersister, BeginOutcome};
pub use retry::{Attempted, RetryPolicy};
pub use scheduler::{ScheduleConfig, Scheduler, SchedulerEvent, SchedulerHandle};
pub use sinks::{BroadcastSink, FanoutSink, TracingSink, WebhookSink};
pub use watermark::{advance, widen_lookback, FileWatermarkStore, Progress};
