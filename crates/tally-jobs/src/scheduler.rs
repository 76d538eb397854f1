//! Daily scheduler with watermark-based catch-up.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, NaiveTime, Utc, Weekday};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use uuid::Uuid;

use tally_core::{PipelineConfig, Result, RunMode, SearchIntent, WatermarkStore};

use crate::controller::{RunController, RunReport};
use crate::watermark::{advance, widen_lookback, Progress};

/// When scheduled runs fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// Time of day, UTC.
    pub run_at: NaiveTime,
    /// Skip Saturday and Sunday.
    pub weekdays_only: bool,
}

impl ScheduleConfig {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            run_at: config.schedule_at,
            weekdays_only: config.schedule_weekdays_only,
        }
    }

    /// First scheduled instant strictly after `now`.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut day = now.date_naive();
        if now.time() >= self.run_at {
            day = day + Days::new(1);
        }
        while self.weekdays_only && matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            day = day + Days::new(1);
        }
        day.and_time(self.run_at).and_utc()
    }
}

/// Event emitted by the scheduler loop.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Started { next_run: DateTime<Utc> },
    RunFinished { run_id: Uuid, watermark_advanced: bool },
    RunFailed { error: String },
    Stopped,
}

/// Handle for controlling a running scheduler.
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<SchedulerEvent>,
}

impl SchedulerHandle {
    /// Signal the scheduler to stop after any run in progress.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| tally_core::Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    pub fn events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Runs the controller on a daily cadence and keeps the watermark.
pub struct Scheduler {
    controller: Arc<RunController>,
    watermarks: Arc<dyn WatermarkStore>,
    schedule: ScheduleConfig,
    intent: SearchIntent,
    max_catch_up_days: u32,
    mode: RunMode,
    event_tx: broadcast::Sender<SchedulerEvent>,
}

impl Scheduler {
    /// Scheduler using the controller's configured intent and cadence.
    pub fn new(controller: Arc<RunController>, watermarks: Arc<dyn WatermarkStore>) -> Self {
        let config = controller.config();
        let schedule = ScheduleConfig::from_config(config);
        let intent = config.search.clone();
        let max_catch_up_days = config.max_catch_up_days;
        let (event_tx, _) = broadcast::channel(tally_core::defaults::EVENT_BUS_CAPACITY);
        Self {
            controller,
            watermarks,
            schedule,
            intent,
            max_catch_up_days,
            mode: RunMode::AllAboveThreshold,
            event_tx,
        }
    }

    pub fn with_schedule(mut self, schedule: ScheduleConfig) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_intent(mut self, intent: SearchIntent) -> Self {
        self.intent = intent;
        self
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn schedule(&self) -> &ScheduleConfig {
        &self.schedule
    }

    pub fn events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    /// One run: widen the lookback to the watermark, process, advance.
    ///
    /// A failed run leaves the watermark untouched.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RunReport> {
        let current = self.watermarks.load().await?;
        let intent = widen_lookback(&self.intent, current.as_ref(), now, self.max_catch_up_days);

        let report = match self.controller.run_detailed(&intent, self.mode).await {
            Ok(report) => report,
            Err(e) => {
                let _ = self.event_tx.send(SchedulerEvent::RunFailed {
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let progress: Vec<Progress> = report
            .outcomes
            .iter()
            .map(|o| Progress {
                message_id: o.message_id.clone(),
                received_at: o.received_at,
                done: o.status.is_done(),
            })
            .collect();

        let next = advance(current.as_ref(), &progress, Utc::now());
        if let Some(watermark) = &next {
            self.watermarks.save(watermark).await?;
            info!(
                subsystem = "scheduler",
                component = "scheduler",
                run_id = %report.run.run_id,
                last_message_id = %watermark.last_message_id,
                last_received_at = %watermark.last_received_at,
                "Watermark advanced"
            );
        }

        let _ = self.event_tx.send(SchedulerEvent::RunFinished {
            run_id: report.run.run_id,
            watermark_advanced: next.is_some(),
        });
        Ok(report)
    }

    /// Start the loop and return a handle for control.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        tokio::spawn(async move {
            self.run_loop(&mut shutdown_rx).await;
        });

        SchedulerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    async fn run_loop(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        loop {
            let now = Utc::now();
            let next_run = self.schedule.next_run_after(now);
            let wait = (next_run - now).to_std().unwrap_or(Duration::ZERO);
            info!(
                subsystem = "scheduler",
                component = "scheduler",
                next_run = %next_run,
                weekdays_only = self.schedule.weekdays_only,
                "Next scheduled run"
            );
            let _ = self.event_tx.send(SchedulerEvent::Started { next_run });

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(subsystem = "scheduler", "Scheduler received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            match self.run_once(Utc::now()).await {
                Ok(report) if report.run.deadline_exceeded => warn!(
                    subsystem = "scheduler",
                    run_id = %report.run.run_id,
                    "Scheduled run hit its deadline"
                ),
                Ok(_) => {}
                Err(e) => error!(
                    subsystem = "scheduler",
                    error = %e,
                    "Scheduled run failed"
                ),
            }
        }

        let _ = self.event_tx.send(SchedulerEvent::Stopped);
        info!(subsystem = "scheduler", "Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn six_am(weekdays_only: bool) -> ScheduleConfig {
        ScheduleConfig {
            run_at: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            weekdays_only,
        }
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_next_run_same_day_before_time() {
        // 2024-03-05 is a Tuesday
        let next = six_am(true).next_run_after(utc(2024, 3, 5, 5, 30));
        assert_eq!(next, utc(2024, 3, 5, 6, 0));
    }

    #[test]
    fn test_next_run_is_strictly_after_now() {
        let next = six_am(true).next_run_after(utc(2024, 3, 5, 6, 0));
        assert_eq!(next, utc(2024, 3, 6, 6, 0));
    }

    #[test]
    fn test_friday_evening_skips_weekend() {
        // 2024-03-08 is a Friday
        let next = six_am(true).next_run_after(utc(2024, 3, 8, 18, 0));
        assert_eq!(next, utc(2024, 3, 11, 6, 0));
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_every_day_when_weekends_allowed() {
        let next = six_am(false).next_run_after(utc(2024, 3, 8, 18, 0));
        assert_eq!(next, utc(2024, 3, 9, 6, 0));
    }

    #[test]
    fn test_from_config() {
        let config = PipelineConfig::default()
            .with_schedule(NaiveTime::from_hms_opt(7, 30, 0).unwrap(), false);
        let schedule = ScheduleConfig::from_config(&config);
        assert_eq!(schedule.run_at, NaiveTime::from_hms_opt(7, 30, 0).unwrap());
        assert!(!schedule.weekdays_only);
    }
}
