//! Telemetry acquisition
//!
//! Every mode implements [`TelemetryPort`]. The scheduler only ever calls
//! [`TelemetryPort::fetch`]; the HTTP layer calls [`TelemetryPort::push`],
//! which modes without a push channel reject.

use crate::config::{TelemetryConfig, TelemetryMode};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Date formats accepted in the first CSV column
pub const CSV_DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y/%m/%d"];

const BOM: char = '\u{feff}';

/// Telemetry errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelemetryError {
    /// Source could not be read
    #[error("telemetry source unavailable: {0}")]
    Unavailable(String),

    /// Source was read but is malformed
    #[error("telemetry parse error: {0}")]
    Parse(String),

    /// Nothing has been pushed yet
    #[error("no telemetry reading received yet")]
    NoReading,

    /// CSV file has no row for the date
    #[error("no telemetry row for {0}")]
    NoDataForDate(NaiveDate),

    /// Observation must be finite and > 0
    #[error("observation must be > 0 (got {0})")]
    InvalidObservation(f64),

    /// Volume must be finite and >= 0
    #[error("volume must be >= 0 (got {0})")]
    InvalidVolume(f64),

    /// Mode has no push channel
    #[error("POST disabled in {0} mode")]
    PushUnsupported(&'static str),
}

/// One validated telemetry reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// External demand observation
    pub observation: f64,

    /// Transaction volume since the last step
    pub volume: f64,
}

impl Reading {
    /// Reading the scheduler falls back to when telemetry fails
    pub const MISSING: Reading = Reading {
        observation: 0.0,
        volume: 0.0,
    };

    /// Validate and build a reading
    pub fn new(observation: f64, volume: f64) -> Result<Self, TelemetryError> {
        if !observation.is_finite() || observation <= 0.0 {
            return Err(TelemetryError::InvalidObservation(observation));
        }
        if !volume.is_finite() || volume < 0.0 {
            return Err(TelemetryError::InvalidVolume(volume));
        }
        Ok(Self {
            observation,
            volume,
        })
    }
}

/// Source of telemetry readings
pub trait TelemetryPort: Send + Sync + fmt::Debug {
    /// Reading for the current step
    fn fetch(&self) -> Result<Reading, TelemetryError>;

    /// Store a pushed reading
    fn push(&self, reading: Reading) -> Result<(), TelemetryError> {
        let _ = reading;
        Err(TelemetryError::PushUnsupported(self.mode().as_str()))
    }

    /// Whether [`TelemetryPort::push`] is accepted
    fn accepts_push(&self) -> bool {
        false
    }

    /// Configured mode
    fn mode(&self) -> TelemetryMode;
}

/// Build the port for the configured mode.
///
/// `timezone` is the schedule timezone; CSV rows are matched against
/// today's date in that zone.
pub fn from_config(config: &TelemetryConfig, timezone: Tz) -> Arc<dyn TelemetryPort> {
    match config.mode {
        TelemetryMode::Manual => Arc::new(ManualTelemetry::new()),
        TelemetryMode::Webhook => Arc::new(WebhookTelemetry::new()),
        TelemetryMode::Csv => Arc::new(CsvTelemetry::new(
            config.csv_path.clone().unwrap_or_default(),
            timezone,
        )),
    }
}

/// Fetch a reading, degrading any failure to [`Reading::MISSING`]
pub fn fetch_or_default(port: &dyn TelemetryPort) -> (Reading, Option<TelemetryError>) {
    match port.fetch() {
        Ok(reading) => (reading, None),
        Err(e) => {
            warn!(
                mode = port.mode().as_str(),
                error = %e,
                "Telemetry fetch failed, using observation=0 volume=0"
            );
            (Reading::MISSING, Some(e))
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Received {
    reading: Reading,
    at: DateTime<Utc>,
}

/// Latest pushed reading behind its own lock
#[derive(Debug, Default)]
struct LatestReading {
    inner: RwLock<Option<Received>>,
}

impl LatestReading {
    fn store(&self, reading: Reading) {
        *self.inner.write() = Some(Received {
            reading,
            at: Utc::now(),
        });
    }

    fn get(&self) -> Option<Received> {
        *self.inner.read()
    }
}

/// Readings set by an operator over HTTP
#[derive(Debug, Default)]
pub struct ManualTelemetry {
    latest: LatestReading,
}

impl ManualTelemetry {
    /// Empty holder; fetch fails until the first push
    pub fn new() -> Self {
        Self::default()
    }
}

impl TelemetryPort for ManualTelemetry {
    fn fetch(&self) -> Result<Reading, TelemetryError> {
        self.latest
            .get()
            .map(|r| r.reading)
            .ok_or(TelemetryError::NoReading)
    }

    fn push(&self, reading: Reading) -> Result<(), TelemetryError> {
        self.latest.store(reading);
        Ok(())
    }

    fn accepts_push(&self) -> bool {
        true
    }

    fn mode(&self) -> TelemetryMode {
        TelemetryMode::Manual
    }
}

/// Readings pushed by an external system
#[derive(Debug, Default)]
pub struct WebhookTelemetry {
    latest: LatestReading,
}

impl WebhookTelemetry {
    /// Empty holder; fetch fails until the first push
    pub fn new() -> Self {
        Self::default()
    }

    /// When the latest reading arrived
    pub fn last_received(&self) -> Option<DateTime<Utc>> {
        self.latest.get().map(|r| r.at)
    }
}

impl TelemetryPort for WebhookTelemetry {
    fn fetch(&self) -> Result<Reading, TelemetryError> {
        let received = self.latest.get().ok_or(TelemetryError::NoReading)?;
        debug!(received_at = %received.at, "Using webhook reading");
        Ok(received.reading)
    }

    fn push(&self, reading: Reading) -> Result<(), TelemetryError> {
        self.latest.store(reading);
        Ok(())
    }

    fn accepts_push(&self) -> bool {
        true
    }

    fn mode(&self) -> TelemetryMode {
        TelemetryMode::Webhook
    }
}

/// Readings looked up by date in a `date,observation,volume` CSV file.
///
/// The file is re-read on every fetch so operators can edit it in place.
#[derive(Debug, Clone)]
pub struct CsvTelemetry {
    path: PathBuf,
    timezone: Tz,
}

impl CsvTelemetry {
    /// Source reading `path`, matching dates in `timezone`
    pub fn new(path: impl Into<PathBuf>, timezone: Tz) -> Self {
        Self {
            path: path.into(),
            timezone,
        }
    }

    /// File being read
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Today's date in the schedule timezone
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.timezone).date_naive()
    }

    /// First row dated `date`
    pub fn fetch_for(&self, date: NaiveDate) -> Result<Reading, TelemetryError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .map_err(|e| {
                TelemetryError::Unavailable(format!("{}: {}", self.path.display(), e))
            })?;

        let mut rows = 0usize;
        for record in reader.records() {
            let record = record.map_err(|e| TelemetryError::Parse(e.to_string()))?;
            rows += 1;

            if record.len() < 3 || !date_matches(&record[0], date) {
                continue;
            }

            let observation = parse_number(&record[1], "observation")?;
            let volume = parse_number(&record[2], "volume")?;
            return Reading::new(observation, volume);
        }

        if rows == 0 {
            return Err(TelemetryError::Parse(format!(
                "{} needs a header and at least one data row",
                self.path.display()
            )));
        }
        Err(TelemetryError::NoDataForDate(date))
    }
}

impl TelemetryPort for CsvTelemetry {
    fn fetch(&self) -> Result<Reading, TelemetryError> {
        self.fetch_for(self.today())
    }

    fn mode(&self) -> TelemetryMode {
        TelemetryMode::Csv
    }
}

fn date_matches(cell: &str, date: NaiveDate) -> bool {
    let cell = cell.trim_start_matches(BOM).trim();
    CSV_DATE_FORMATS
        .iter()
        .any(|fmt| NaiveDate::parse_from_str(cell, fmt).map_or(false, |d| d == date))
}

fn parse_number(cell: &str, field: &str) -> Result<f64, TelemetryError> {
    cell.parse::<f64>()
        .map_err(|_| TelemetryError::Parse(format!("invalid {} value {:?}", field, cell)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn csv_file(content: &str) -> (tempfile::TempDir, CsvTelemetry) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        (dir, CsvTelemetry::new(path, chrono_tz::UTC))
    }

    #[test]
    fn test_reading_validation() {
        assert!(Reading::new(1.0, 0.0).is_ok());
        assert_eq!(
            Reading::new(0.0, 1.0),
            Err(TelemetryError::InvalidObservation(0.0))
        );
        assert_eq!(
            Reading::new(1.0, -1.0),
            Err(TelemetryError::InvalidVolume(-1.0))
        );
        assert!(Reading::new(f64::NAN, 1.0).is_err());
        assert!(Reading::new(1.0, f64::INFINITY).is_err());
    }

    #[test]
    fn test_manual_requires_push() {
        let port = ManualTelemetry::new();
        assert_eq!(port.fetch(), Err(TelemetryError::NoReading));

        port.push(Reading::new(2_000.0, 50.0).unwrap()).unwrap();
        assert_eq!(port.fetch().unwrap().observation, 2_000.0);

        port.push(Reading::new(3_000.0, 0.0).unwrap()).unwrap();
        assert_eq!(port.fetch().unwrap().observation, 3_000.0);
        assert!(port.accepts_push());
    }

    #[test]
    fn test_webhook_tracks_receipt_time() {
        let port = WebhookTelemetry::new();
        assert!(port.last_received().is_none());

        let before = Utc::now();
        port.push(Reading::new(10.0, 1.0).unwrap()).unwrap();
        assert!(port.last_received().unwrap() >= before);
        assert_eq!(port.fetch().unwrap().volume, 1.0);
    }

    #[test]
    fn test_csv_rejects_push() {
        let port = CsvTelemetry::new("unused.csv", chrono_tz::UTC);
        assert!(!port.accepts_push());
        assert_eq!(
            port.push(Reading::new(1.0, 1.0).unwrap()),
            Err(TelemetryError::PushUnsupported("csv"))
        );
    }

    #[test]
    fn test_csv_matches_date() {
        let (_dir, port) = csv_file(
            "date,observation,volume\n2025-03-01,1000,10\n2025-03-02,2000,20\n",
        );
        let reading = port.fetch_for(date(2025, 3, 2)).unwrap();
        assert_eq!(reading, Reading::new(2000.0, 20.0).unwrap());
    }

    #[test]
    fn test_csv_first_match_wins() {
        let (_dir, port) = csv_file(
            "date,observation,volume\n2025-03-02,1000,10\n2025-03-02,2000,20\n",
        );
        assert_eq!(port.fetch_for(date(2025, 3, 2)).unwrap().observation, 1000.0);
    }

    #[test]
    fn test_csv_slash_dates_bom_and_whitespace() {
        let (_dir, port) = csv_file(
            "\u{feff}date,observation,volume\n  2025/03/02 , 1500 , 5 \n",
        );
        let reading = port.fetch_for(date(2025, 3, 2)).unwrap();
        assert_eq!(reading.observation, 1500.0);
        assert_eq!(reading.volume, 5.0);
    }

    #[test]
    fn test_csv_short_rows_skipped() {
        let (_dir, port) = csv_file(
            "date,observation,volume\n2025-03-02,1000\n2025-03-02,1200,3\n",
        );
        assert_eq!(port.fetch_for(date(2025, 3, 2)).unwrap().observation, 1200.0);
    }

    #[test]
    fn test_csv_no_row_for_date() {
        let (_dir, port) = csv_file("date,observation,volume\n2025-03-01,1000,10\n");
        assert_eq!(
            port.fetch_for(date(2025, 3, 2)),
            Err(TelemetryError::NoDataForDate(date(2025, 3, 2)))
        );
    }

    #[test]
    fn test_csv_header_only_is_parse_error() {
        let (_dir, port) = csv_file("date,observation,volume\n");
        assert!(matches!(
            port.fetch_for(date(2025, 3, 2)),
            Err(TelemetryError::Parse(_))
        ));
    }

    #[test]
    fn test_csv_applies_reading_validation() {
        let (_dir, port) = csv_file("date,observation,volume\n2025-03-02,0,10\n");
        assert_eq!(
            port.fetch_for(date(2025, 3, 2)),
            Err(TelemetryError::InvalidObservation(0.0))
        );

        let (_dir, port) = csv_file("date,observation,volume\n2025-03-02,abc,10\n");
        assert!(matches!(
            port.fetch_for(date(2025, 3, 2)),
            Err(TelemetryError::Parse(_))
        ));
    }

    #[test]
    fn test_csv_missing_file_unavailable() {
        let port = CsvTelemetry::new("/nonexistent/telemetry.csv", chrono_tz::UTC);
        assert!(matches!(
            port.fetch_for(date(2025, 3, 2)),
            Err(TelemetryError::Unavailable(_))
        ));
    }

    #[test]
    fn test_fetch_or_default_degrades() {
        let port = ManualTelemetry::new();
        let (reading, error) = fetch_or_default(&port);
        assert_eq!(reading, Reading::MISSING);
        assert_eq!(error, Some(TelemetryError::NoReading));
    }

    #[test]
    fn test_from_config_selects_mode() {
        let mut config = TelemetryConfig::default();
        assert_eq!(from_config(&config, chrono_tz::UTC).mode(), TelemetryMode::Manual);

        config.mode = TelemetryMode::Csv;
        config.csv_path = Some(PathBuf::from("t.csv"));
        assert_eq!(from_config(&config, chrono_tz::UTC).mode(), TelemetryMode::Csv);

        config.mode = TelemetryMode::Webhook;
        assert!(from_config(&config, chrono_tz::UTC).accepts_push());
    }
}
