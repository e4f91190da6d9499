//! Append-only raw metric rows, one per face and canonical emotion.

use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
};

use affect_core::{Emotion, FaceObservation};
use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::monitor::config::SessionContext;

pub const CSV_HEADER: [&str; 9] = [
    "date",
    "time",
    "gender",
    "emotion",
    "percentage",
    "teaching_level",
    "grade",
    "subject",
    "temperature",
];

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RawMetricRow {
    pub date: String,
    pub time: String,
    pub gender: String,
    pub emotion: String,
    pub percentage: f64,
    pub teaching_level: String,
    pub grade: String,
    pub subject: String,
    pub temperature: String,
}

impl RawMetricRow {
    /// Seven rows for one face, in canonical emotion order.
    pub fn for_face(
        face: &FaceObservation,
        at: &DateTime<Local>,
        context: &SessionContext,
    ) -> Vec<RawMetricRow> {
        let date = at.format("%Y-%m-%d").to_string();
        let time = at.format("%H:%M:%S").to_string();
        Emotion::ALL
            .iter()
            .map(|&emotion| RawMetricRow {
                date: date.clone(),
                time: time.clone(),
                gender: face.gender.label().to_string(),
                emotion: emotion.label().to_string(),
                percentage: (face.emotions[emotion] as f64 * 100.0).round() / 100.0,
                teaching_level: context.teaching_level.clone().unwrap_or_default(),
                grade: context.grade.clone().unwrap_or_default(),
                subject: context.subject.clone().unwrap_or_default(),
                temperature: context.temperature.clone().unwrap_or_default(),
            })
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to prepare metrics directory {path:?}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub trait RawMetricsSink: Send {
    fn append(&mut self, rows: &[RawMetricRow]) -> Result<(), SinkError>;
}

impl<S: RawMetricsSink + ?Sized> RawMetricsSink for Box<S> {
    fn append(&mut self, rows: &[RawMetricRow]) -> Result<(), SinkError> {
        (**self).append(rows)
    }
}

/// Sink that drops every row; used when no directory is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardSink;

impl RawMetricsSink for DiscardSink {
    fn append(&mut self, _rows: &[RawMetricRow]) -> Result<(), SinkError> {
        Ok(())
    }
}

/// CSV file per day, subject and grade.
pub struct CsvMetricsSink {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvMetricsSink {
    /// Open (or create) today's file for `context` under `dir`.
    pub fn open(dir: &Path, context: &SessionContext) -> Result<Self, SinkError> {
        Self::open_for_date(dir, context, &Local::now())
    }

    pub fn open_for_date(
        dir: &Path,
        context: &SessionContext,
        date: &DateTime<Local>,
    ) -> Result<Self, SinkError> {
        fs::create_dir_all(dir).map_err(|source| SinkError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(file_name(context, date));
        let is_new = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if is_new {
            writer.write_record(CSV_HEADER)?;
            writer.flush()?;
        }
        debug!("Writing raw metrics to {}", path.display());
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RawMetricsSink for CsvMetricsSink {
    fn append(&mut self, rows: &[RawMetricRow]) -> Result<(), SinkError> {
        for row in rows {
            self.writer.serialize(row)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// `{date}_{subject}_{grade}.csv` with path-hostile characters stripped.
pub fn file_name(context: &SessionContext, date: &DateTime<Local>) -> String {
    let subject = context.subject.as_deref().unwrap_or("NoSubject");
    let grade = context.grade.as_deref().unwrap_or("NoGrade");
    format!(
        "{}_{}_{}.csv",
        date.format("%Y-%m-%d"),
        sanitize(subject),
        sanitize(grade)
    )
}

fn sanitize(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|'))
        .map(|c| if c == ' ' { '_' } else { c })
        .collect()
}
