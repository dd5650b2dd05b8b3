// src/recorder.rs
// Run 文件: 表头 `Time,<channel>`, 每行 `unix 时间,数值`; 误差不写入文件
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

use crate::analysis::error_model::{DomainError, ErrorModel};
use crate::config::ErrorMode;
use crate::drivers::{DriverError, SampleBuffer};
use crate::types::{Reading, Sample};

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}:{line}: malformed row {content:?}")]
    Malformed {
        path: PathBuf,
        line: usize,
        content: String,
    },
    #[error("{path}:{line}: {source}")]
    Domain {
        path: PathBuf,
        line: usize,
        #[source]
        source: DomainError,
    },
    #[error("{path}:{line}: {source}")]
    Sample {
        path: PathBuf,
        line: usize,
        #[source]
        source: DriverError,
    },
}

/// Append-only writer of one run file.
///
/// The file is reopened for every row and closed again before returning, so
/// a crash loses at most the row being written.
pub struct RunRecorder {
    path: PathBuf,
}

impl RunRecorder {
    pub fn create(path: impl Into<PathBuf>, channel: &str) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut w = BufWriter::new(File::create(&path)?);
        writeln!(w, "Time,{channel}")?;
        w.flush()?;
        info!("CSV file created: {}", path.display());
        Ok(Self { path })
    }

    pub fn append(&mut self, reading: &Reading) -> io::Result<()> {
        let mut w = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        // Display for f64 is the shortest text that parses back to the same value
        writeln!(w, "{},{}", reading.timestamp, reading.value)?;
        w.flush()
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads a run file back, dropping rows below `start_pressure` and
/// recomputing each uncertainty with `error_mode`.
pub fn reload(
    path: &Path,
    error_mode: ErrorMode,
    start_pressure: Option<f64>,
    error_model: &ErrorModel,
) -> Result<SampleBuffer, ReloadError> {
    let io_err = |source| ReloadError::Io {
        path: path.to_path_buf(),
        source,
    };
    let reader = BufReader::new(File::open(path).map_err(io_err)?);
    info!("CSV file read: {}", path.display());
    let mut samples = SampleBuffer::new();
    let mut skipped = 0usize;
    // first line is the header
    for (idx, line) in reader.lines().enumerate().skip(1) {
        let line = line.map_err(io_err)?;
        let line_no = idx + 1;
        let row = line.trim();
        if row.is_empty() {
            continue;
        }
        let reading = parse_row(row).ok_or_else(|| ReloadError::Malformed {
            path: path.to_path_buf(),
            line: line_no,
            content: row.to_owned(),
        })?;
        if start_pressure.is_some_and(|p| reading.value < p) {
            skipped += 1;
            continue;
        }
        let uncertainty = error_mode
            .uncertainty(error_model, reading.value)
            .map_err(|source| ReloadError::Domain {
                path: path.to_path_buf(),
                line: line_no,
                source,
            })?;
        samples
            .push(Sample {
                timestamp: reading.timestamp,
                value: reading.value,
                uncertainty,
            })
            .map_err(|source| ReloadError::Sample {
                path: path.to_path_buf(),
                line: line_no,
                source,
            })?;
    }
    debug!(
        "{}: {} samples, {} below start pressure",
        path.display(),
        samples.len(),
        skipped
    );
    Ok(samples)
}

fn parse_row(row: &str) -> Option<Reading> {
    let (time, value) = row.split_once(',')?;
    Some(Reading {
        timestamp: time.trim().parse().ok()?,
        value: value.trim().parse().ok()?,
    })
}
