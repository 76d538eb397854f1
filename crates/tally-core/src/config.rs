//! Pipeline configuration.
//!
//! Values come from the environment with defaults from [`crate::defaults`].
//! [`PipelineConfig::from_lookup`] takes any lookup function so parsing can be
//! tested without touching the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;
use serde::Serialize;

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::SearchIntent;

/// Tunables for ranking, extraction, retries, the run controller, and the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineConfig {
    pub max_invoices_per_attachment: usize,
    pub confidence_threshold: f64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub worker_max_in_flight: usize,
    pub run_deadline: Duration,
    pub download_timeout: Duration,
    pub extract_timeout: Duration,
    pub storage_timeout: Duration,
    /// Daily run time, UTC.
    pub schedule_at: NaiveTime,
    pub schedule_weekdays_only: bool,
    /// Intent used by scheduled runs.
    pub search: SearchIntent,
    pub max_catch_up_days: u32,
    pub watermark_path: PathBuf,
    pub monitoring_webhook_url: Option<String>,
    #[serde(skip_serializing)]
    pub monitoring_webhook_secret: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_invoices_per_attachment: defaults::MAX_INVOICES_PER_ATTACHMENT,
            confidence_threshold: defaults::CONFIDENCE_THRESHOLD,
            retry_attempts: defaults::RETRY_ATTEMPTS,
            retry_base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
            worker_max_in_flight: defaults::WORKER_MAX_IN_FLIGHT,
            run_deadline: Duration::from_secs(defaults::RUN_DEADLINE_SECS),
            download_timeout: Duration::from_secs(defaults::DOWNLOAD_TIMEOUT_SECS),
            extract_timeout: Duration::from_secs(defaults::EXTRACT_TIMEOUT_SECS),
            storage_timeout: Duration::from_secs(defaults::STORAGE_TIMEOUT_SECS),
            schedule_at: default_schedule_at(),
            schedule_weekdays_only: defaults::SCHEDULE_WEEKDAYS_ONLY,
            search: SearchIntent::new(defaults::SEARCH_DAYS_BACK)
                .with_subject(defaults::SEARCH_SUBJECT_CONTAINS),
            max_catch_up_days: defaults::MAX_CATCH_UP_DAYS,
            watermark_path: PathBuf::from(defaults::WATERMARK_PATH),
            monitoring_webhook_url: None,
            monitoring_webhook_secret: None,
        }
    }
}

fn default_schedule_at() -> NaiveTime {
    NaiveTime::from_hms_opt(6, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// Outcome of [`PipelineConfig::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl PipelineConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `MAX_INVOICES_PER_ATTACHMENT` | `2` | Invoices kept per attachment |
    /// | `CONFIDENCE_THRESHOLD` | `0.7` | Minimum ranker score to process |
    /// | `RETRY_ATTEMPTS` | `3` | Attempts per external step |
    /// | `RETRY_BASE_DELAY_MS` | `500` | First backoff delay |
    /// | `RETRY_MAX_DELAY_MS` | `30000` | Backoff ceiling |
    /// | `WORKER_MAX_IN_FLIGHT` | `4` | Concurrent attachments per run |
    /// | `RUN_DEADLINE_SECS` | `3600` | Run deadline |
    /// | `DOWNLOAD_TIMEOUT_SECS` | `60` | Per-download timeout |
    /// | `EXTRACT_TIMEOUT_SECS` | `300` | Per-extraction timeout |
    /// | `STORAGE_TIMEOUT_SECS` | `30` | Per-storage-call timeout |
    /// | `SCHEDULE_AT` | `06:00` | Daily run time (UTC, `HH:MM`) |
    /// | `SCHEDULE_WEEKDAYS_ONLY` | `true` | Skip Saturday and Sunday |
    /// | `SEARCH_SENDER_EMAIL` | unset | Scheduled sender filter |
    /// | `SEARCH_SUBJECT_CONTAINS` | `invoice` | Scheduled subject filter |
    /// | `SEARCH_ATTACHMENT_NAME` | unset | Scheduled attachment name hint |
    /// | `SEARCH_DAYS_BACK` | `1` | Scheduled lookback window |
    /// | `MAX_CATCH_UP_DAYS` | `30` | Cap on watermark catch-up |
    /// | `WATERMARK_PATH` | `tally-watermark.json` | Watermark file |
    /// | `MONITORING_WEBHOOK_URL` | unset | Run summary webhook |
    /// | `MONITORING_WEBHOOK_SECRET` | unset | HMAC key for the webhook |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let schedule_at = match get("SCHEDULE_AT") {
            Some(raw) => parse_schedule_at(&raw)?,
            None => d.schedule_at,
        };

        let search = SearchIntent {
            sender_email: get("SEARCH_SENDER_EMAIL"),
            subject_contains: match lookup("SEARCH_SUBJECT_CONTAINS") {
                // Explicitly empty disables the subject filter.
                Some(v) if v.trim().is_empty() => None,
                Some(v) => Some(v),
                None => d.search.subject_contains.clone(),
            },
            attachment_name_hint: get("SEARCH_ATTACHMENT_NAME"),
            days_back: parse_or(&get, "SEARCH_DAYS_BACK", d.search.days_back)?,
        };

        Ok(Self {
            max_invoices_per_attachment: parse_or(
                &get,
                "MAX_INVOICES_PER_ATTACHMENT",
                d.max_invoices_per_attachment,
            )?,
            confidence_threshold: parse_or(&get, "CONFIDENCE_THRESHOLD", d.confidence_threshold)?,
            retry_attempts: parse_or(&get, "RETRY_ATTEMPTS", d.retry_attempts)?,
            retry_base_delay_ms: parse_or(&get, "RETRY_BASE_DELAY_MS", d.retry_base_delay_ms)?,
            retry_max_delay_ms: parse_or(&get, "RETRY_MAX_DELAY_MS", d.retry_max_delay_ms)?,
            worker_max_in_flight: parse_or(&get, "WORKER_MAX_IN_FLIGHT", d.worker_max_in_flight)?,
            run_deadline: secs_or(&get, "RUN_DEADLINE_SECS", d.run_deadline)?,
            download_timeout: secs_or(&get, "DOWNLOAD_TIMEOUT_SECS", d.download_timeout)?,
            extract_timeout: secs_or(&get, "EXTRACT_TIMEOUT_SECS", d.extract_timeout)?,
            storage_timeout: secs_or(&get, "STORAGE_TIMEOUT_SECS", d.storage_timeout)?,
            schedule_at,
            schedule_weekdays_only: match get("SCHEDULE_WEEKDAYS_ONLY") {
                Some(v) => parse_bool("SCHEDULE_WEEKDAYS_ONLY", &v)?,
                None => d.schedule_weekdays_only,
            },
            search,
            max_catch_up_days: parse_or(&get, "MAX_CATCH_UP_DAYS", d.max_catch_up_days)?,
            watermark_path: get("WATERMARK_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.watermark_path),
            monitoring_webhook_url: get("MONITORING_WEBHOOK_URL"),
            monitoring_webhook_secret: get("MONITORING_WEBHOOK_SECRET"),
        })
    }

    /// Check value ranges. Errors make the config unusable; warnings do not.
    pub fn validate(&self) -> ConfigReport {
        let mut report = ConfigReport::default();

        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            report.errors.push(format!(
                "CONFIDENCE_THRESHOLD must be within [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if self.max_invoices_per_attachment == 0 {
            report
                .errors
                .push("MAX_INVOICES_PER_ATTACHMENT must be at least 1".to_string());
        }
        if self.retry_attempts == 0 {
            report
                .errors
                .push("RETRY_ATTEMPTS must be at least 1".to_string());
        }
        if self.worker_max_in_flight == 0 {
            report
                .errors
                .push("WORKER_MAX_IN_FLIGHT must be at least 1".to_string());
        }
        if self.run_deadline.is_zero() {
            report
                .errors
                .push("RUN_DEADLINE_SECS must be greater than 0".to_string());
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            report.warnings.push(format!(
                "RETRY_BASE_DELAY_MS ({}) exceeds RETRY_MAX_DELAY_MS ({}); every delay is capped",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            ));
        }
        if self.run_deadline < self.extract_timeout {
            report.warnings.push(
                "RUN_DEADLINE_SECS is shorter than EXTRACT_TIMEOUT_SECS; slow extractions will be interrupted"
                    .to_string(),
            );
        }
        if self.monitoring_webhook_secret.is_some() && self.monitoring_webhook_url.is_none() {
            report.warnings.push(
                "MONITORING_WEBHOOK_SECRET is set without MONITORING_WEBHOOK_URL".to_string(),
            );
        }
        if self.search.sender_email.is_none()
            && self.search.subject_contains.is_none()
            && self.search.attachment_name_hint.is_none()
        {
            report.warnings.push(
                "scheduled search has no sender, subject, or name filter; every attachment in the window is ranked"
                    .to_string(),
            );
        }

        report
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_max_invoices(mut self, max: usize) -> Self {
        self.max_invoices_per_attachment = max;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn with_retry_delays(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.retry_base_delay_ms = base_ms;
        self.retry_max_delay_ms = max_ms;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.worker_max_in_flight = max;
        self
    }

    pub fn with_run_deadline(mut self, deadline: Duration) -> Self {
        self.run_deadline = deadline;
        self
    }

    /// Set download, extraction, and storage timeouts.
    pub fn with_timeouts(mut self, download: Duration, extract: Duration, storage: Duration) -> Self {
        self.download_timeout = download;
        self.extract_timeout = extract;
        self.storage_timeout = storage;
        self
    }

    pub fn with_search(mut self, search: SearchIntent) -> Self {
        self.search = search;
        self
    }

    pub fn with_schedule(mut self, at: NaiveTime, weekdays_only: bool) -> Self {
        self.schedule_at = at;
        self.schedule_weekdays_only = weekdays_only;
        self
    }

    pub fn with_watermark_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.watermark_path = path.into();
        self
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| Error::Config(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}

fn secs_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{}={:?}: expected a boolean", key, raw))),
    }
}

/// Parse a `HH:MM` (or `HH:MM:SS`) UTC time of day.
pub fn parse_schedule_at(raw: &str) -> Result<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|e| Error::Config(format!("SCHEDULE_AT={:?}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.max_invoices_per_attachment, 2);
        assert_eq!(config.confidence_threshold, 0.7);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.worker_max_in_flight, 4);
        assert_eq!(config.schedule_at, NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        assert_eq!(config.search.subject_contains.as_deref(), Some("invoice"));
        assert_eq!(config.search.days_back, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_parsed() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("MAX_INVOICES_PER_ATTACHMENT", "5"),
            ("CONFIDENCE_THRESHOLD", "0.85"),
            ("RUN_DEADLINE_SECS", "120"),
            ("SCHEDULE_AT", "07:30"),
            ("SCHEDULE_WEEKDAYS_ONLY", "false"),
            ("SEARCH_SENDER_EMAIL", "billing@acme.com"),
            ("SEARCH_SUBJECT_CONTAINS", ""),
            ("MONITORING_WEBHOOK_URL", "http://localhost:9000/hook"),
        ]))
        .unwrap();
        assert_eq!(config.max_invoices_per_attachment, 5);
        assert_eq!(config.confidence_threshold, 0.85);
        assert_eq!(config.run_deadline, Duration::from_secs(120));
        assert_eq!(config.schedule_at, NaiveTime::from_hms_opt(7, 30, 0).unwrap());
        assert!(!config.schedule_weekdays_only);
        assert_eq!(config.search.sender_email.as_deref(), Some("billing@acme.com"));
        assert!(config.search.subject_contains.is_none());
        assert!(config.monitoring_webhook_url.is_some());
    }

    #[test]
    fn test_unparsable_value_is_config_error() {
        let err = PipelineConfig::from_lookup(lookup(&[("RETRY_ATTEMPTS", "three")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("RETRY_ATTEMPTS"));

        let err = PipelineConfig::from_lookup(lookup(&[("SCHEDULE_AT", "25:00")])).unwrap_err();
        assert!(err.to_string().contains("SCHEDULE_AT"));
    }

    #[test]
    fn test_validate_reports_errors() {
        let report = PipelineConfig::default()
            .with_confidence_threshold(1.5)
            .with_retry_attempts(0)
            .with_max_in_flight(0)
            .validate();
        assert!(!report.is_ok());
        assert_eq!(report.errors.len(), 3);
    }

    #[test]
    fn test_validate_reports_warnings() {
        let mut config = PipelineConfig::default()
            .with_run_deadline(Duration::from_secs(10))
            .with_search(SearchIntent::new(1));
        config.monitoring_webhook_secret = Some("s3cret".into());
        let report = config.validate();
        assert!(report.is_ok());
        assert_eq!(report.warnings.len(), 3);
    }

    #[test]
    fn test_parse_schedule_at_with_seconds() {
        assert_eq!(
            parse_schedule_at("18:05:30").unwrap(),
            NaiveTime::from_hms_opt(18, 5, 30).unwrap()
        );
    }
}
