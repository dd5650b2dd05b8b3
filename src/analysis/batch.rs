// src/analysis/batch.rs
// 批处理: 按文件名里的时间戳选出 run, 逐个重新拟合
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use log::{info, warn};
use serde::Serialize;

use crate::analysis::error_model::ErrorModel;
use crate::analysis::fit::FitEngine;
use crate::analysis::model::LinearModel;
use crate::config::{BatchConfig, FILE_TIMESTAMP_FORMAT};
use crate::recorder::reload;
use crate::types::RatePoint;

/// A stored run whose file name carries its start time.
#[derive(Clone, Debug, PartialEq)]
pub struct RunFile {
    pub started_at: NaiveDateTime,
    pub path: PathBuf,
    pub file_name: String,
}

/// A selected run that did not contribute a rate.
#[derive(Clone, Debug, Serialize)]
pub struct SkippedRun {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchReport {
    pub points: Vec<RatePoint>,
    pub skipped: Vec<SkippedRun>,
}

/// Parses `<prefix><YYYYMMDDHHMMSS>.csv`, anything else gives `None`.
pub fn parse_run_name(file_name: &str, prefix: &str) -> Option<NaiveDateTime> {
    let digits = file_name.strip_prefix(prefix)?.strip_suffix(".csv")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(digits, FILE_TIMESTAMP_FORMAT).ok()
}

/// Keeps the names strictly inside `(start, end)`, sorted by file name.
pub fn select_runs<I>(
    entries: I,
    prefix: &str,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Vec<RunFile>
where
    I: IntoIterator<Item = PathBuf>,
{
    let mut runs: Vec<RunFile> = entries
        .into_iter()
        .filter_map(|path| {
            let file_name = path.file_name()?.to_str()?.to_owned();
            let started_at = parse_run_name(&file_name, prefix)?;
            (start < started_at && started_at < end).then_some(RunFile {
                started_at,
                path,
                file_name,
            })
        })
        .collect();
    // lexicographic, only equal to time order for a fixed prefix
    runs.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    runs
}

/// Re-derives a rate-vs-time series from the runs stored in one directory.
pub struct BatchSelector<'a> {
    config: &'a BatchConfig,
    error_model: &'a ErrorModel,
    engine: FitEngine<LinearModel>,
}

impl<'a> BatchSelector<'a> {
    pub fn new(config: &'a BatchConfig, error_model: &'a ErrorModel) -> Self {
        Self {
            config,
            error_model,
            engine: FitEngine::linear(),
        }
    }

    pub fn scan(&self) -> io::Result<Vec<RunFile>> {
        let entries = fs::read_dir(&self.config.directory)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path());
        Ok(select_runs(
            entries,
            &self.config.prefix,
            self.config.start,
            self.config.end,
        ))
    }

    pub fn run(&self) -> io::Result<BatchReport> {
        let runs = self.scan()?;
        info!(
            "{} runs between {} and {}",
            runs.len(),
            self.config.start,
            self.config.end
        );
        let mut report = BatchReport::default();
        for run in runs {
            match self.rate_of(&run.path) {
                Ok((rate, rate_error)) => {
                    info!("{}: {rate:.4e} ± {rate_error:.2e} Pa/h", run.file_name);
                    report.points.push(RatePoint {
                        run_start_time: run.started_at,
                        rate,
                        rate_error,
                    });
                }
                Err(reason) => {
                    warn!("{}: skipped, {reason}", run.file_name);
                    report.skipped.push(SkippedRun {
                        path: run.path,
                        reason,
                    });
                }
            }
        }
        Ok(report)
    }

    fn rate_of(&self, path: &Path) -> Result<(f64, f64), String> {
        let samples = reload(
            path,
            self.config.error_mode,
            self.config.start_pressure,
            self.error_model,
        )
        .map_err(|e| e.to_string())?;
        let fit = self
            .engine
            .fit_linear(
                samples.times(),
                samples.values(),
                samples.uncertainties(),
                self.config.initial_guess,
            )
            .map_err(|e| e.to_string())?;
        Ok((fit.rate_per_hour(), fit.rate_error_per_hour()))
    }
}
