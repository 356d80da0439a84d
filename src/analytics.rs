//! Playback analytics.
//!
//! Events are best-effort: a sink that fails logs a warning and playback
//! carries on. `JsonlAnalytics` stores one record per line in
//! {dir}/{date}.jsonl.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CATEGORY: &str = "ReadAloud";

pub trait AnalyticsSink: Send + Sync {
    fn send_event(&self, category: &str, action: &str, value: Option<f64>, extra: Option<&str>);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsRecord {
    pub timestamp: String,
    pub category: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

pub struct JsonlAnalytics {
    dir: PathBuf,
}

impl JsonlAnalytics {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{date}.jsonl"))
    }

    fn save(&self, record: &AnalyticsRecord) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!("Failed to create analytics dir: {e}");
            return;
        }

        let path = self.file_for(&record.timestamp[..10]);
        let mut file = match fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("Failed to open analytics file: {e}");
                return;
            }
        };

        match serde_json::to_string(record) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{line}") {
                    warn!("Failed to write analytics record: {e}");
                }
            }
            Err(e) => warn!("Failed to serialize analytics record: {e}"),
        }
    }

    pub fn load_records(&self, date: &str) -> Vec<AnalyticsRecord> {
        let contents = match fs::read_to_string(self.file_for(date)) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn report(&self, date: &str) -> String {
        generate_report(date, &self.load_records(date))
    }
}

impl AnalyticsSink for JsonlAnalytics {
    fn send_event(&self, category: &str, action: &str, value: Option<f64>, extra: Option<&str>) {
        self.save(&AnalyticsRecord {
            timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
            category: category.to_string(),
            action: action.to_string(),
            value,
            extra: extra.map(String::from),
        });
    }
}

pub fn generate_report(date: &str, records: &[AnalyticsRecord]) -> String {
    if records.is_empty() {
        return format!("No read-aloud events for {date}.");
    }

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for r in records {
        *counts.entry(r.action.as_str()).or_insert(0) += 1;
    }

    let sessions = counts.get("Start").copied().unwrap_or(0);
    let finished = counts.get("Done").copied().unwrap_or(0);

    let mut report = format!(
        "# Read-aloud report for {date}\n\n\
        - Sessions: {sessions}\n\
        - Read to the end: {finished}\n\n\
        ## Actions\n"
    );
    for (action, count) in &counts {
        report.push_str(&format!("- {action}: {count}\n"));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_round_trip_through_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let analytics = JsonlAnalytics::new(dir.path());

        analytics.send_event(CATEGORY, "Start", None, None);
        analytics.send_event(CATEGORY, "SetPlaybackRate", Some(1.5), None);
        analytics.send_event(CATEGORY, "SetVoice", None, Some("af_heart"));

        let today = Local::now().format("%Y-%m-%d").to_string();
        let records = analytics.load_records(&today);
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].value, Some(1.5));
        assert_eq!(records[2].extra.as_deref(), Some("af_heart"));
        assert!(records.iter().all(|r| r.category == CATEGORY));
    }

    #[test]
    fn report_counts_actions() {
        let record = |action: &str| AnalyticsRecord {
            timestamp: "2026-10-15T10:00:00.000".into(),
            category: CATEGORY.into(),
            action: action.into(),
            value: None,
            extra: None,
        };
        let records = vec![record("Start"), record("JumpForward"), record("JumpForward"), record("Done")];
        let report = generate_report("2026-10-15", &records);
        assert!(report.contains("- Sessions: 1"));
        assert!(report.contains("- Read to the end: 1"));
        assert!(report.contains("- JumpForward: 2"));
    }

    #[test]
    fn missing_day_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let analytics = JsonlAnalytics::new(dir.path());
        assert_eq!(analytics.report("2001-01-01"), "No read-aloud events for 2001-01-01.");
    }
}
