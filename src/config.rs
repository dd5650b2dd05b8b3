// src/config.rs
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::analysis::error_model::{DomainError, ErrorModel};
use crate::analysis::model::LinearModel;

/// Wait between two polls of the data source.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Wait after the source had nothing to report.
pub const NO_DATA_BACKOFF: Duration = Duration::from_secs(2);
/// Timestamp encoded in run file names, e.g. `outgas_20240101000000.csv`.
pub const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("duration must be positive")]
    NonPositiveDuration,
    #[error("error must be positive, got {0}")]
    NonPositiveError(f64),
    #[error("start pressure must be positive, got {0}")]
    NegativeStartPressure(f64),
    #[error("filename must be set")]
    EmptyFilename,
    #[error("data name must be set")]
    EmptyChannel,
    #[error("unknown error type: {0}")]
    UnknownErrorType(String),
}

/// How the uncertainty of a reading is obtained.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ErrorMode {
    /// Gauge calibration table.
    Auto,
    /// Fixed half width in Pa.
    Constant(f64),
}

impl ErrorMode {
    pub fn from_cli(error_type: &str, constant: f64) -> Result<Self, ConfigError> {
        let mode = match error_type {
            "auto" => ErrorMode::Auto,
            "constant" | "const" => ErrorMode::Constant(constant),
            other => return Err(ConfigError::UnknownErrorType(other.to_owned())),
        };
        mode.validate()?;
        Ok(mode)
    }
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            ErrorMode::Constant(err) if !(err > 0.0 && err.is_finite()) => {
                Err(ConfigError::NonPositiveError(err))
            }
            _ => Ok(()),
        }
    }
    pub fn uncertainty(&self, model: &ErrorModel, value: f64) -> Result<f64, DomainError> {
        match *self {
            ErrorMode::Auto => model.estimate(value),
            ErrorMode::Constant(err) => Ok(err),
        }
    }
}

fn validate_start_pressure(start_pressure: Option<f64>) -> Result<(), ConfigError> {
    match start_pressure {
        Some(p) if !(p >= 0.0) => Err(ConfigError::NegativeStartPressure(p)),
        _ => Ok(()),
    }
}

/// Settings of one live acquisition, fixed for the whole run.
#[derive(Clone, Debug)]
pub struct AcquisitionConfig {
    pub channel: String,
    pub duration: Duration,
    pub error_mode: ErrorMode,
    /// Output path without extension; `.csv`, `.png` and `.json` are appended.
    pub output_base: PathBuf,
    pub start_pressure: Option<f64>,
    pub poll_interval: Duration,
    pub no_data_backoff: Duration,
}

impl AcquisitionConfig {
    pub fn new(
        channel: impl Into<String>,
        duration: Duration,
        error_mode: ErrorMode,
        output_base: impl Into<PathBuf>,
        start_pressure: Option<f64>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            channel: channel.into(),
            duration,
            error_mode,
            output_base: output_base.into(),
            start_pressure,
            poll_interval: POLL_INTERVAL,
            no_data_backoff: NO_DATA_BACKOFF,
        };
        config.validate()?;
        Ok(config)
    }
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.duration.is_zero() {
            return Err(ConfigError::NonPositiveDuration);
        }
        if self.channel.is_empty() {
            return Err(ConfigError::EmptyChannel);
        }
        if self.output_base.as_os_str().is_empty() {
            return Err(ConfigError::EmptyFilename);
        }
        self.error_mode.validate()?;
        validate_start_pressure(self.start_pressure)
    }
    pub fn run_path(&self) -> PathBuf {
        with_suffix(&self.output_base, "csv")
    }
}

/// Selection and re-fit settings of a batch over stored runs.
#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub directory: PathBuf,
    /// File name prefix, e.g. `outgas_`.
    pub prefix: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub start_pressure: Option<f64>,
    pub error_mode: ErrorMode,
    pub initial_guess: [f64; 2],
}

impl BatchConfig {
    /// Splits a path-like prefix such as `data/outgas_` into directory and
    /// file name prefix.
    pub fn new(
        prefix: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
        start_pressure: Option<f64>,
    ) -> Result<Self, ConfigError> {
        validate_start_pressure(start_pressure)?;
        let (directory, prefix) = match prefix.rfind(|c: char| c == '/' || c == '\\') {
            Some(idx) => (PathBuf::from(&prefix[..=idx]), prefix[idx + 1..].to_owned()),
            None => (PathBuf::from("."), prefix.to_owned()),
        };
        Ok(Self {
            directory,
            prefix,
            start,
            end,
            start_pressure,
            error_mode: ErrorMode::Auto,
            initial_guess: LinearModel::DEFAULT_GUESS,
        })
    }
}

/// What to do with the result once a fit is done.
#[derive(Clone, Debug)]
pub struct ReportConfig {
    /// Points drawn in the run plot, 0 = all.
    pub display_number: usize,
    pub save_png: bool,
    pub show: bool,
}

/// `base` + `.ext`, keeping any dots already in the file name.
pub fn with_suffix(base: &Path, ext: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Output base when a stored run is re-fitted: `filename` if given, otherwise
/// the run file itself without its extension.
pub fn reread_output_base(run_file: &Path, filename: Option<PathBuf>) -> PathBuf {
    filename.unwrap_or_else(|| run_file.with_extension(""))
}
