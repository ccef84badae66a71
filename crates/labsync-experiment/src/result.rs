//! Sweep results and CSV export.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use labsync_core::error::{LabError, LabResult};
use serde::Serialize;

/// CSV header of an exported sweep.
pub const CSV_HEADER: [&str; 2] = ["frequency_hz", "amplitude"];

/// One measured point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SweepPoint {
    /// Generator frequency in Hz
    pub frequency_hz: f64,
    /// Analyzer amplitude in the configured unit
    pub amplitude: f64,
}

/// How a sweep ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SweepOutcome {
    /// Every planned point was measured
    Completed,
    /// Stopped on request at a point boundary
    Aborted,
    /// A device command failed; earlier points are kept
    Failed {
        /// The failing error
        reason: String,
    },
}

impl std::fmt::Display for SweepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepOutcome::Completed => write!(f, "completed"),
            SweepOutcome::Aborted => write!(f, "aborted"),
            SweepOutcome::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Points of one sweep, append-only until finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepResult {
    planned: usize,
    points: Vec<SweepPoint>,
    outcome: Option<SweepOutcome>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl SweepResult {
    /// Empty result for a sweep of `planned` points.
    pub fn new(planned: usize) -> Self {
        Self {
            planned,
            points: Vec::with_capacity(planned),
            outcome: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Append a point. Ignored once the result is finished.
    pub fn push(&mut self, point: SweepPoint) {
        if self.outcome.is_none() {
            self.points.push(point);
        }
    }

    /// Seal the result. Later calls keep the first outcome.
    pub fn finish(&mut self, outcome: SweepOutcome) {
        if self.outcome.is_none() {
            self.outcome = Some(outcome);
            self.finished_at = Some(Utc::now());
        }
    }

    /// Measured points in sweep order.
    pub fn points(&self) -> &[SweepPoint] {
        &self.points
    }

    /// Number of planned points.
    pub fn planned(&self) -> usize {
        self.planned
    }

    /// Terminal outcome, once finished.
    pub fn outcome(&self) -> Option<&SweepOutcome> {
        self.outcome.as_ref()
    }

    /// True once an outcome is set.
    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// When the sweep started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// When the sweep ended.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Write `frequency_hz,amplitude` rows, header first.
    pub fn write_csv<W: Write>(&self, writer: W) -> LabResult<()> {
        write_points_csv(&self.points, writer)
    }

    /// Export to a CSV file, replacing it.
    pub fn export_csv(&self, path: &Path) -> LabResult<()> {
        let file = std::fs::File::create(path)?;
        self.write_csv(std::io::BufWriter::new(file))?;
        tracing::info!(path = %path.display(), rows = self.points.len(), "Exported sweep");
        Ok(())
    }
}

/// Write `points` as `frequency_hz,amplitude` rows, header first.
pub fn write_points_csv<W: Write>(points: &[SweepPoint], writer: W) -> LabResult<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(CSV_HEADER).map_err(csv_error)?;
    for point in points {
        csv.write_record([point.frequency_hz.to_string(), point.amplitude.to_string()])
            .map_err(csv_error)?;
    }
    csv.flush()?;
    Ok(())
}

fn csv_error(err: csv::Error) -> LabError {
    LabError::Io(err.into())
}
