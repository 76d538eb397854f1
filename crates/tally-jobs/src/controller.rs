//! Run controller: search, rank, then drive each selected attachment through
//! download, extraction, and persistence with a bounded worker pool.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Instant as StdInstant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use tally_core::{
    AttachmentCandidate, AttachmentFailure, AttachmentRecord, AttachmentSource, Error, ErrorKind,
    EventBus, Extractor, InvoiceStore, MonitoringEvent, MonitoringSink, PipelineConfig,
    ProcessingRun, Result, RunMode, SearchIntent,
};
use tally_rank::Recommendation;

use crate::coordinator::ExtractionCoordinator;
use crate::persister::{AuditPersister, BeginOutcome};
use crate::retry::{check_deadline, with_timeout, RetryPolicy};

/// Where one candidate ended up.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttachmentStatus {
    /// Invoices persisted and the record completed (possibly with none).
    Completed {
        attachment_record_id: Uuid,
        invoices: usize,
    },
    /// A completed record already existed, another pipeline owned the
    /// record, or an earlier candidate in the run had the same natural key.
    Deduplicated { attachment_record_id: Option<Uuid> },
    /// Record marked failed (or never created).
    Failed(AttachmentFailure),
    /// Deadline hit between steps; the record stays pending.
    Interrupted { attachment_record_id: Option<Uuid> },
    /// Never started because the deadline had passed.
    Skipped,
}

impl AttachmentStatus {
    /// Completed now or earlier.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            AttachmentStatus::Completed { .. } | AttachmentStatus::Deduplicated { .. }
        )
    }

    pub fn attachment_record_id(&self) -> Option<Uuid> {
        match self {
            AttachmentStatus::Completed {
                attachment_record_id,
                ..
            } => Some(*attachment_record_id),
            AttachmentStatus::Deduplicated {
                attachment_record_id,
            }
            | AttachmentStatus::Interrupted {
                attachment_record_id,
            } => *attachment_record_id,
            AttachmentStatus::Failed(failure) => failure.attachment_record_id,
            AttachmentStatus::Skipped => None,
        }
    }
}

/// Per-candidate result of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateOutcome {
    pub message_id: String,
    pub attachment_name: String,
    pub received_at: DateTime<Utc>,
    pub confidence_score: f64,
    #[serde(flatten)]
    pub status: AttachmentStatus,
}

impl CandidateOutcome {
    fn new(candidate: &AttachmentCandidate, status: AttachmentStatus) -> Self {
        Self {
            message_id: candidate.message_id.clone(),
            attachment_name: candidate.attachment_name.clone(),
            received_at: candidate.received_at,
            confidence_score: candidate.confidence_score,
            status,
        }
    }
}

/// Run summary plus what happened to every selected candidate.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: ProcessingRun,
    pub outcomes: Vec<CandidateOutcome>,
}

/// Drives processing runs.
pub struct RunController {
    source: Arc<dyn AttachmentSource>,
    extractor: Arc<dyn Extractor>,
    store: Arc<dyn InvoiceStore>,
    sink: Arc<dyn MonitoringSink>,
    events: Option<EventBus>,
    config: PipelineConfig,
    retry: RetryPolicy,
}

impl RunController {
    pub fn new(
        source: Arc<dyn AttachmentSource>,
        extractor: Arc<dyn Extractor>,
        store: Arc<dyn InvoiceStore>,
        sink: Arc<dyn MonitoringSink>,
        config: PipelineConfig,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            source,
            extractor,
            store,
            sink,
            events: None,
            config,
            retry,
        }
    }

    /// Publish progress events (run started, attachment finished) on `bus`.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Override the retry policy for every external step.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn InvoiceStore> {
        &self.store
    }

    /// Run once and return the summary.
    pub async fn run(&self, intent: &SearchIntent, mode: RunMode) -> Result<ProcessingRun> {
        self.run_detailed(intent, mode).await.map(|report| report.run)
    }

    /// Run once and return the summary with per-candidate outcomes.
    ///
    /// Fails only when the mailbox search fails; attachment failures are
    /// counted in the summary.
    #[instrument(skip(self, intent), fields(subsystem = "jobs", component = "controller"))]
    pub async fn run_detailed(&self, intent: &SearchIntent, mode: RunMode) -> Result<RunReport> {
        let started = StdInstant::now();
        let deadline = Instant::now() + self.config.run_deadline;
        let mut run = ProcessingRun::start(intent.clone());
        let run_id = run.run_id;

        info!(
            run_id = %run_id,
            mode = ?mode,
            days_back = intent.days_back,
            "Processing run started"
        );
        self.emit(MonitoringEvent::RunStarted {
            run_id,
            search_intent: intent.clone(),
        });

        let discovered = match self
            .retry
            .run("search", Some(deadline), || {
                with_timeout(
                    "search",
                    self.config.download_timeout,
                    self.source.search(intent),
                )
            })
            .await
        {
            Ok(found) => found,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Mailbox search failed, aborting run");
                let event = MonitoringEvent::RunFailed {
                    run_id,
                    error_kind: e.kind(),
                    error: e.to_string(),
                };
                self.publish(&event).await;
                return Err(e);
            }
        };

        let ranked = tally_rank::rank(intent, &discovered);
        let selected = self.select(&ranked, mode);
        run.attachments_discovered = discovered.len();
        run.attachments_below_threshold = ranked.len() - selected.len();
        debug!(
            run_id = %run_id,
            discovered = discovered.len(),
            selected = selected.len(),
            "Candidates ranked"
        );

        let (unique, repeats) = collapse_natural_keys(selected);
        if !repeats.is_empty() {
            debug!(
                run_id = %run_id,
                repeats = repeats.len(),
                "Candidates sharing a message and attachment name collapsed"
            );
        }
        let mut outcomes = self.process_all(run_id, unique, deadline).await;
        outcomes.extend(deduplicated_repeats(&outcomes, &repeats));
        summarize(&mut run, &outcomes);
        if Instant::now() >= deadline {
            run.deadline_exceeded = true;
        }
        run.finish();

        info!(
            run_id = %run_id,
            succeeded = run.attachments_succeeded,
            failed = run.attachments_failed,
            deduplicated = run.attachments_deduplicated,
            skipped = run.attachments_skipped,
            interrupted = run.attachments_interrupted,
            invoices = run.invoices_persisted,
            duration_ms = started.elapsed().as_millis() as u64,
            "Processing run completed"
        );
        self.publish(&MonitoringEvent::RunCompleted { run: run.clone() })
            .await;

        Ok(RunReport { run, outcomes })
    }

    fn select(&self, ranked: &[AttachmentCandidate], mode: RunMode) -> Vec<AttachmentCandidate> {
        let threshold = self.config.confidence_threshold;
        match mode {
            RunMode::RecommendedOnly => match tally_rank::recommend(ranked, threshold) {
                Recommendation::Recommended(c) => vec![c],
                Recommendation::NoSuitableMatch { best } => {
                    info!(
                        best_score = best.as_ref().map(|c| c.confidence_score),
                        threshold, "No candidate reached the confidence threshold"
                    );
                    Vec::new()
                }
            },
            RunMode::AllAboveThreshold => tally_rank::above_threshold(ranked, threshold),
        }
    }

    async fn process_all(
        &self,
        run_id: Uuid,
        selected: Vec<AttachmentCandidate>,
        deadline: Instant,
    ) -> Vec<CandidateOutcome> {
        let pipeline = Arc::new(AttachmentPipeline {
            coordinator: ExtractionCoordinator::new(
                self.source.clone(),
                self.extractor.clone(),
                &self.config,
            )
            .with_retry(self.retry.clone()),
            persister: AuditPersister::new(self.store.clone(), &self.config)
                .with_retry(self.retry.clone()),
            events: self.events.clone(),
            run_id,
            deadline,
        });

        let semaphore = Arc::new(Semaphore::new(self.config.worker_max_in_flight.max(1)));
        let mut tasks = JoinSet::new();
        let mut outcomes = Vec::with_capacity(selected.len());
        let mut pending = selected.into_iter();

        while let Some(candidate) = pending.next() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if Instant::now() >= deadline {
                drop(permit);
                let skipped: Vec<_> = std::iter::once(candidate).chain(pending.by_ref()).collect();
                warn!(
                    run_id = %run_id,
                    skipped = skipped.len(),
                    "Run deadline reached, not starting remaining attachments"
                );
                outcomes.extend(
                    skipped
                        .iter()
                        .map(|c| CandidateOutcome::new(c, AttachmentStatus::Skipped)),
                );
                break;
            }

            let pipeline = pipeline.clone();
            tasks.spawn(async move {
                let record_slot = RecordSlot::default();
                let status = match AssertUnwindSafe(pipeline.process(&candidate, &record_slot))
                    .catch_unwind()
                    .await
                {
                    Ok(status) => status,
                    Err(_) => pipeline.panicked(&candidate, record_slot.get().copied()).await,
                };
                drop(permit);
                CandidateOutcome::new(&candidate, status)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = ?e, "Attachment task did not complete"),
            }
        }
        outcomes
    }

    fn emit(&self, event: MonitoringEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }

    async fn publish(&self, event: &MonitoringEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event.clone());
        }
        if let Err(e) = self.sink.publish(event).await {
            warn!(
                event_type = event.event_type(),
                error = %e,
                "Monitoring sink rejected run summary"
            );
        }
    }
}

/// Split ranked candidates into the first per `(message_id, attachment_name)`
/// and the later repeats of an already kept key.
fn collapse_natural_keys(
    selected: Vec<AttachmentCandidate>,
) -> (Vec<AttachmentCandidate>, Vec<AttachmentCandidate>) {
    let mut seen = HashSet::new();
    selected
        .into_iter()
        .partition(|c| seen.insert((c.message_id.clone(), c.attachment_name.clone())))
}

/// Outcomes for collapsed repeats, pointing at the kept candidate's record.
fn deduplicated_repeats(
    outcomes: &[CandidateOutcome],
    repeats: &[AttachmentCandidate],
) -> Vec<CandidateOutcome> {
    let records: HashMap<(&str, &str), Option<Uuid>> = outcomes
        .iter()
        .map(|o| {
            (
                (o.message_id.as_str(), o.attachment_name.as_str()),
                o.status.attachment_record_id(),
            )
        })
        .collect();
    repeats
        .iter()
        .map(|c| {
            let attachment_record_id = records
                .get(&(c.message_id.as_str(), c.attachment_name.as_str()))
                .copied()
                .flatten();
            CandidateOutcome::new(
                c,
                AttachmentStatus::Deduplicated {
                    attachment_record_id,
                },
            )
        })
        .collect()
}

fn summarize(run: &mut ProcessingRun, outcomes: &[CandidateOutcome]) {
    for outcome in outcomes {
        match &outcome.status {
            AttachmentStatus::Completed { invoices, .. } => {
                run.attachments_succeeded += 1;
                run.invoices_persisted += invoices;
            }
            AttachmentStatus::Deduplicated { .. } => run.attachments_deduplicated += 1,
            AttachmentStatus::Failed(failure) => {
                run.attachments_failed += 1;
                run.failures.push(failure.clone());
            }
            AttachmentStatus::Interrupted { .. } => run.attachments_interrupted += 1,
            AttachmentStatus::Skipped => run.attachments_skipped += 1,
        }
    }
    if run.attachments_skipped > 0 || run.attachments_interrupted > 0 {
        run.deadline_exceeded = true;
    }
}

/// Shared state for the per-attachment tasks of one run.
struct AttachmentPipeline {
    coordinator: ExtractionCoordinator,
    persister: AuditPersister,
    events: Option<EventBus>,
    run_id: Uuid,
    deadline: Instant,
}

/// Attachment record id, readable after the pipeline future has unwound.
type RecordSlot = OnceLock<Uuid>;

/// How far one attachment got through its steps.
struct StepTracker {
    record: Option<AttachmentRecord>,
    step: &'static str,
}

impl AttachmentPipeline {
    async fn process(&self, candidate: &AttachmentCandidate, slot: &RecordSlot) -> AttachmentStatus {
        let mut progress = StepTracker {
            record: None,
            step: "begin",
        };
        let result = self.steps(candidate, &mut progress, slot).await;
        let record_id = progress.record.as_ref().map(|r| r.id);

        let status = match result {
            Ok(status) => status,
            Err(Error::DeadlineExceeded) => {
                warn!(
                    run_id = %self.run_id,
                    message_id = %candidate.message_id,
                    attachment_record_id = ?record_id,
                    step = progress.step,
                    "Run deadline reached, leaving attachment pending"
                );
                AttachmentStatus::Interrupted {
                    attachment_record_id: record_id,
                }
            }
            Err(e) => self.fail(candidate, &progress, e).await,
        };

        match &status {
            AttachmentStatus::Completed {
                attachment_record_id,
                invoices,
            } => self.emit(MonitoringEvent::AttachmentCompleted {
                run_id: self.run_id,
                attachment_record_id: *attachment_record_id,
                attachment_name: candidate.attachment_name.clone(),
                invoices: *invoices,
            }),
            AttachmentStatus::Failed(failure) => self.emit(MonitoringEvent::AttachmentFailed {
                run_id: self.run_id,
                attachment_record_id: failure.attachment_record_id,
                attachment_name: failure.attachment_name.clone(),
                error_kind: failure.error_kind,
                error: failure.error.clone(),
            }),
            _ => {}
        }
        status
    }

    /// Begin, download, extract, persist; deadline checked between steps.
    async fn steps(
        &self,
        candidate: &AttachmentCandidate,
        progress: &mut StepTracker,
        slot: &RecordSlot,
    ) -> Result<AttachmentStatus> {
        let deadline = Some(self.deadline);

        let record = match self.persister.begin(candidate, deadline).await? {
            BeginOutcome::AlreadyCompleted(record) | BeginOutcome::InFlight(record) => {
                debug!(
                    run_id = %self.run_id,
                    attachment_record_id = %record.id,
                    status = %record.processing_status,
                    "Attachment record owned elsewhere, skipping"
                );
                return Ok(AttachmentStatus::Deduplicated {
                    attachment_record_id: Some(record.id),
                });
            }
            BeginOutcome::Fresh(record) | BeginOutcome::Reprocess(record) => record,
        };
        let record_id = record.id;
        let _ = slot.set(record_id);
        progress.record = Some(record);
        check_deadline(self.deadline)?;

        progress.step = "download";
        let content = self.coordinator.download(candidate, deadline).await?;
        check_deadline(self.deadline)?;

        progress.step = "extract";
        let outcome = self.coordinator.extract(candidate, content, deadline).await?;
        check_deadline(self.deadline)?;

        progress.step = "persist";
        let created = self.persister.complete(record_id, &outcome, deadline).await?;
        Ok(AttachmentStatus::Completed {
            attachment_record_id: record_id,
            invoices: created.len(),
        })
    }

    async fn fail(
        &self,
        candidate: &AttachmentCandidate,
        progress: &StepTracker,
        error: Error,
    ) -> AttachmentStatus {
        let record_id = progress.record.as_ref().map(|r| r.id);
        warn!(
            run_id = %self.run_id,
            message_id = %candidate.message_id,
            attachment_name = %candidate.attachment_name,
            attachment_record_id = ?record_id,
            step = progress.step,
            error_kind = %error.kind(),
            error = %error,
            "Attachment failed"
        );

        // The persister already failed the record when it refused the batch
        let already_marked = progress.step == "persist"
            && matches!(error.kind(), ErrorKind::Integrity | ErrorKind::Validation);
        if let (Some(id), false) = (record_id, already_marked) {
            if let Err(e) = self.persister.fail(id, &error, None).await {
                error!(
                    run_id = %self.run_id,
                    attachment_record_id = %id,
                    error = %e,
                    "Could not mark attachment record failed"
                );
            }
        }

        AttachmentStatus::Failed(AttachmentFailure {
            message_id: candidate.message_id.clone(),
            attachment_name: candidate.attachment_name.clone(),
            attachment_record_id: record_id,
            error_kind: error.kind(),
            error: error.to_string(),
            attempts: progress
                .record
                .as_ref()
                .map(|r| r.attempts.max(1) as u32)
                .unwrap_or(1),
        })
    }

    /// Fail the attachment after its pipeline panicked, marking any record it
    /// had opened.
    async fn panicked(
        &self,
        candidate: &AttachmentCandidate,
        record_id: Option<Uuid>,
    ) -> AttachmentStatus {
        let error = Error::Internal("attachment pipeline panicked".to_string());
        error!(
            run_id = %self.run_id,
            message_id = %candidate.message_id,
            attachment_name = %candidate.attachment_name,
            attachment_record_id = ?record_id,
            "Attachment pipeline panicked"
        );
        if let Some(id) = record_id {
            if let Err(e) = self.persister.fail(id, &error, None).await {
                error!(
                    run_id = %self.run_id,
                    attachment_record_id = %id,
                    error = %e,
                    "Could not mark attachment record failed"
                );
            }
        }

        let failure = AttachmentFailure {
            message_id: candidate.message_id.clone(),
            attachment_name: candidate.attachment_name.clone(),
            attachment_record_id: record_id,
            error_kind: error.kind(),
            error: error.to_string(),
            attempts: 1,
        };
        self.emit(MonitoringEvent::AttachmentFailed {
            run_id: self.run_id,
            attachment_record_id: record_id,
            attachment_name: failure.attachment_name.clone(),
            error_kind: failure.error_kind,
            error: failure.error.clone(),
        });
        AttachmentStatus::Failed(failure)
    }

    fn emit(&self, event: MonitoringEvent) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }
}
