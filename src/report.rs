// src/report.rs
// 结果输出: PNG 图、JSON 摘要、终端表格
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::analysis::batch::BatchReport;
use crate::analysis::fit::FitError;
use crate::config::{with_suffix, ReportConfig};
use crate::drivers::{render_rates_png, render_run_png, DriverError, PlotStyle, SampleBuffer};
use crate::engine::format_unix;
use crate::types::{AcquisitionState, FitResult, RunInfo};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot render plot: {0}")]
    Plot(#[from] DriverError),
}

/// JSON summary of one run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run: RunInfo,
    /// `None` when the run was read back from disk.
    pub state: Option<AcquisitionState>,
    pub samples: usize,
    pub fit: Option<FitResult>,
    /// Pa/h
    pub rate: Option<f64>,
    pub rate_error: Option<f64>,
    pub fit_error: Option<String>,
}

impl RunReport {
    pub fn new(
        run: RunInfo,
        state: Option<AcquisitionState>,
        samples: &SampleBuffer,
        fit: &Result<FitResult, FitError>,
    ) -> Self {
        let (fit, fit_error) = match fit {
            Ok(fit) => (Some(*fit), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Self {
            run,
            state,
            samples: samples.len(),
            rate: fit.map(|f| f.rate_per_hour()),
            rate_error: fit.map(|f| f.rate_error_per_hour()),
            fit,
            fit_error,
        }
    }

    /// The console line, `None` without a fit.
    pub fn result_line(&self) -> Option<String> {
        Some(format!(
            "Result: Outgas Rate = {:.4e} ± {:.2e} Pa/h",
            self.rate?, self.rate_error?
        ))
    }
}

/// Writes `<base>.json` and, when enabled, `<base>.png` for one run.
///
/// Only the JSON summary is required; a plot that cannot be rendered or saved
/// is logged and skipped.
pub fn write_run(
    base: &Path,
    report: &RunReport,
    samples: &SampleBuffer,
    config: &ReportConfig,
) -> Result<(), ReportError> {
    write_file(
        &with_suffix(base, "json"),
        serde_json::to_string_pretty(report)?.as_bytes(),
    )?;
    if config.show {
        print!("{}", samples_table(samples, config.display_number));
    }
    if config.save_png {
        if samples.is_empty() {
            warn!("No samples, plot skipped");
        } else {
            let png = render_run_png(
                samples,
                report.fit.as_ref(),
                config.display_number,
                &PlotStyle::default(),
            );
            save_plot(base, png);
        }
    }
    Ok(())
}

/// Writes `<base>.json` and, when enabled, `<base>.png` for a batch.
pub fn write_batch(
    base: &Path,
    report: &BatchReport,
    config: &ReportConfig,
) -> Result<(), ReportError> {
    write_file(
        &with_suffix(base, "json"),
        serde_json::to_string_pretty(report)?.as_bytes(),
    )?;
    if config.show {
        print!("{}", rates_table(report));
    }
    if config.save_png {
        if report.points.is_empty() {
            warn!("No rates, plot skipped");
        } else {
            save_plot(base, render_rates_png(&report.points, &PlotStyle::default()));
        }
    }
    Ok(())
}

fn save_plot(base: &Path, png: Result<Vec<u8>, DriverError>) {
    let saved = png
        .map_err(ReportError::from)
        .and_then(|bytes| write_file(&with_suffix(base, "png"), &bytes));
    if let Err(e) = saved {
        warn!("Plot not saved: {e}");
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ReportError> {
    let to_err = |source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(to_err)?;
    }
    fs::write(path, bytes).map_err(to_err)?;
    info!("Saved {}", path.display());
    Ok(())
}

pub fn samples_table(samples: &SampleBuffer, display_number: usize) -> String {
    let mut out = String::from("time                 pressure [Pa]  error [Pa]\n");
    for s in samples.decimated(display_number).iter() {
        out.push_str(&format!(
            "{:<20} {:<14.4e} {:.2e}\n",
            format_unix(s.timestamp),
            s.value,
            s.uncertainty
        ));
    }
    out
}

pub fn rates_table(report: &BatchReport) -> String {
    let mut out = String::from("run start            rate [Pa/h]    error [Pa/h]\n");
    for p in &report.points {
        out.push_str(&format!(
            "{:<20} {:<14.4e} {:.2e}\n",
            p.run_start_time.format("%Y/%m/%d %H:%M:%S"),
            p.rate,
            p.rate_error
        ));
    }
    for s in &report.skipped {
        out.push_str(&format!("skipped {}: {}\n", s.path.display(), s.reason));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::batch::SkippedRun;
    use crate::types::{RatePoint, Sample};
    use chrono::NaiveDateTime;
    use tempfile::tempdir;

    fn info(path: &Path) -> RunInfo {
        RunInfo {
            channel: "Ch2".into(),
            path: path.to_path_buf(),
            start_time: Some(0.0),
        }
    }

    fn buffer(n: usize) -> SampleBuffer {
        let mut buf = SampleBuffer::new();
        for i in 0..n {
            buf.push(Sample {
                timestamp: 2.0 * i as f64,
                value: 1e-2,
                uncertainty: 1e-3,
            })
            .unwrap();
        }
        buf
    }

    #[test]
    fn result_line_needs_a_fit() {
        let fit = FitResult {
            slope: 1e-4,
            slope_error: 1e-6,
            intercept: 1.0,
            intercept_error: 0.1,
            chi_square: 0.5,
            degrees_of_freedom: 7,
        };
        let samples = buffer(10);
        let ok = RunReport::new(info(Path::new("a.csv")), None, &samples, &Ok(fit));
        assert_eq!(
            ok.result_line().unwrap(),
            "Result: Outgas Rate = 3.6000e-1 ± 3.60e-3 Pa/h"
        );
        let failed = RunReport::new(
            info(Path::new("a.csv")),
            Some(AcquisitionState::Stopped),
            &samples,
            &Err(FitError::SingularCovariance),
        );
        assert!(failed.result_line().is_none());
        assert_eq!(failed.fit_error.as_deref(), Some("parameter covariance is singular"));
    }

    #[test]
    fn trendless_report_writes_json() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("out/run");
        let samples = SampleBuffer::new();
        let report = RunReport::new(
            info(&base),
            Some(AcquisitionState::Interrupted),
            &samples,
            &Err(FitError::InsufficientData { samples: 0, params: 2 }),
        );
        let config = ReportConfig {
            display_number: 10,
            save_png: true,
            show: false,
        };
        write_run(&base, &report, &samples, &config).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(with_suffix(&base, "json")).unwrap()).unwrap();
        assert_eq!(json["state"], "Interrupted");
        assert!(json["fit"].is_null());
        assert!(!with_suffix(&base, "png").exists());
    }

    #[test]
    fn tables_list_shown_points() {
        assert_eq!(samples_table(&buffer(100), 10).lines().count(), 11);
        let report = BatchReport {
            points: vec![RatePoint {
                run_start_time: NaiveDateTime::parse_from_str("20240101000000", "%Y%m%d%H%M%S")
                    .unwrap(),
                rate: 0.36,
                rate_error: 0.01,
            }],
            skipped: Vec::new(),
        };
        let table = rates_table(&report);
        assert!(table.contains("2024/01/01 00:00:00"));
        assert_eq!(table.lines().count(), 2);
    }

    fn rising(n: usize) -> SampleBuffer {
        let mut buf = SampleBuffer::new();
        for i in 0..n {
            let value = 1e-2 + 1e-5 * i as f64;
            buf.push(Sample {
                timestamp: 1_700_000_000.0 + 2.0 * i as f64,
                value,
                uncertainty: value * 0.1,
            })
            .unwrap();
        }
        buf
    }

    fn is_png(path: &Path) -> bool {
        fs::read(path).map(|b| b.starts_with(b"\x89PNG")).unwrap_or(false)
    }

    #[test]
    fn fitted_run_writes_plot_and_summary() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("run");
        let samples = rising(40);
        let fit = crate::analysis::fit_linear(
            samples.times(),
            samples.values(),
            samples.uncertainties(),
            crate::analysis::LinearModel::DEFAULT_GUESS,
        );
        let report = RunReport::new(info(&base), Some(AcquisitionState::Stopped), &samples, &fit);
        let config = ReportConfig {
            display_number: 10,
            save_png: true,
            show: true,
        };
        write_run(&base, &report, &samples, &config).unwrap();
        assert!(is_png(&with_suffix(&base, "png")));
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(with_suffix(&base, "json")).unwrap()).unwrap();
        assert_eq!(json["samples"], 40);
        assert!((json["rate"].as_f64().unwrap() - 0.018).abs() < 1e-6);
    }

    #[test]
    fn unsaved_plot_keeps_summary() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("run");
        // a directory where the image should go
        fs::create_dir(with_suffix(&base, "png")).unwrap();
        let samples = rising(5);
        let report = RunReport::new(
            info(&base),
            Some(AcquisitionState::Stopped),
            &samples,
            &Err(FitError::SingularCovariance),
        );
        let config = ReportConfig {
            display_number: 0,
            save_png: true,
            show: false,
        };
        write_run(&base, &report, &samples, &config).unwrap();
        assert!(with_suffix(&base, "json").is_file());
        assert!(with_suffix(&base, "png").is_dir());
    }

    #[test]
    fn batch_writes_plot_and_summary() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("plots/outgas_plot_20240101000000_20240401000000");
        let at = |s: &str| NaiveDateTime::parse_from_str(s, "%Y%m%d%H%M%S").unwrap();
        let report = BatchReport {
            points: vec![
                RatePoint {
                    run_start_time: at("20240102000000"),
                    rate: 0.36,
                    rate_error: 0.01,
                },
                RatePoint {
                    run_start_time: at("20240110120000"),
                    rate: -0.02,
                    rate_error: 0.05,
                },
            ],
            skipped: vec![SkippedRun {
                path: PathBuf::from("outgas_20240105000000.csv"),
                reason: "solver did not converge within 200 iterations".into(),
            }],
        };
        let config = ReportConfig {
            display_number: 0,
            save_png: true,
            show: false,
        };
        write_batch(&base, &report, &config).unwrap();
        assert!(is_png(&with_suffix(&base, "png")));
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(with_suffix(&base, "json")).unwrap()).unwrap();
        assert_eq!(json["points"].as_array().unwrap().len(), 2);
        assert_eq!(json["points"][1]["rate"], -0.02);
        assert_eq!(json["skipped"][0]["path"], "outgas_20240105000000.csv");
    }
}
