//! Durable watermark and lookback widening.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use tally_core::{Result, SearchIntent, Watermark, WatermarkStore};

/// Watermark persisted as a JSON file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn load(&self) -> Result<Option<Watermark>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, watermark: &Watermark) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(watermark)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(
            subsystem = "scheduler",
            component = "watermark",
            op = "save",
            path = %self.path.display(),
            last_received_at = %watermark.last_received_at,
            "Watermark saved"
        );
        Ok(())
    }
}

/// A processed candidate as seen by the watermark.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub message_id: String,
    pub received_at: DateTime<Utc>,
    /// Completed in this run or in an earlier one.
    pub done: bool,
}

/// Advance over the longest done prefix (by `received_at`). Never moves back.
pub fn advance(
    current: Option<&Watermark>,
    progress: &[Progress],
    now: DateTime<Utc>,
) -> Option<Watermark> {
    let mut ordered: Vec<&Progress> = progress.iter().collect();
    ordered.sort_by(|a, b| {
        a.received_at
            .cmp(&b.received_at)
            .then_with(|| a.message_id.cmp(&b.message_id))
    });

    let last_done = ordered.iter().take_while(|p| p.done).last()?;
    if let Some(current) = current {
        if last_done.received_at <= current.last_received_at {
            return None;
        }
    }
    Some(Watermark {
        last_message_id: last_done.message_id.clone(),
        last_received_at: last_done.received_at,
        updated_at: now,
    })
}

/// Widen the lookback so the search reaches back to the watermark.
///
/// Never narrows `base.days_back`; never widens past `max_catch_up_days`.
pub fn widen_lookback(
    base: &SearchIntent,
    watermark: Option<&Watermark>,
    now: DateTime<Utc>,
    max_catch_up_days: u32,
) -> SearchIntent {
    let mut intent = base.clone();
    let Some(watermark) = watermark else {
        return intent;
    };

    let gap = now - watermark.last_received_at;
    // Whole days since the watermark, plus one to cover the partial day
    let needed = u32::try_from(gap.num_days().max(0) + 1).unwrap_or(u32::MAX);
    let widened = needed.min(max_catch_up_days).max(base.days_back);
    if widened != base.days_back {
        debug!(
            subsystem = "scheduler",
            component = "watermark",
            op = "widen_lookback",
            from_days = base.days_back,
            to_days = widened,
            "Lookback widened to reach watermark"
        );
    }
    intent.days_back = widened;
    intent
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    fn p(id: &str, received_at: DateTime<Utc>, done: bool) -> Progress {
        Progress {
            message_id: id.to_string(),
            received_at,
            done,
        }
    }

    #[test]
    fn test_advance_stops_at_first_unfinished() {
        let progress = vec![
            p("c", at(3, 9), true),
            p("a", at(1, 9), true),
            p("b", at(2, 9), false),
        ];
        let wm = advance(None, &progress, at(4, 6)).unwrap();
        assert_eq!(wm.last_message_id, "a");
        assert_eq!(wm.last_received_at, at(1, 9));
    }

    #[test]
    fn test_advance_never_moves_backwards() {
        let current = Watermark {
            last_message_id: "z".into(),
            last_received_at: at(5, 9),
            updated_at: at(5, 10),
        };
        let progress = vec![p("a", at(1, 9), true)];
        assert!(advance(Some(&current), &progress, at(6, 6)).is_none());

        let progress = vec![p("n", at(6, 1), true)];
        let wm = advance(Some(&current), &progress, at(6, 6)).unwrap();
        assert_eq!(wm.last_received_at, at(6, 1));
    }

    #[test]
    fn test_advance_nothing_done() {
        assert!(advance(None, &[p("a", at(1, 9), false)], at(2, 0)).is_none());
        assert!(advance(None, &[], at(2, 0)).is_none());
    }

    #[test]
    fn test_widen_lookback_reaches_watermark_with_cap() {
        let base = SearchIntent::new(1);
        let now = at(10, 6);

        assert_eq!(widen_lookback(&base, None, now, 30).days_back, 1);

        let wm = Watermark {
            last_message_id: "m".into(),
            last_received_at: now - Duration::days(4) - Duration::hours(3),
            updated_at: now,
        };
        assert_eq!(widen_lookback(&base, Some(&wm), now, 30).days_back, 5);
        assert_eq!(widen_lookback(&base, Some(&wm), now, 3).days_back, 3);

        let wide = SearchIntent::new(14);
        assert_eq!(widen_lookback(&wide, Some(&wm), now, 30).days_back, 14);
    }

    #[tokio::test]
    async fn test_file_store_round_trip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileWatermarkStore::new(dir.path().join("state").join("wm.json"));
        assert!(store.load().await.unwrap().is_none());

        let wm = Watermark {
            last_message_id: "m-1".into(),
            last_received_at: at(1, 9),
            updated_at: at(1, 10),
        };
        store.save(&wm).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(wm));
        assert!(!store.tmp_path().exists());
    }

    #[tokio::test]
    async fn test_file_store_corrupt_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wm.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(FileWatermarkStore::new(path).load().await.is_err());
    }
}
