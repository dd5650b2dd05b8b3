// src/types.rs
use chrono::NaiveDateTime;
use serde::Serialize;
use std::path::PathBuf;

/// Seconds per hour, used to report rates in Pa/h.
pub const SECONDS_PER_HOUR: f64 = 3600.0;

// 数据源返回的原始读数 (还没有误差)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading {
    pub timestamp: f64, // unix epoch seconds
    pub value: f64,     // Pa
}

// 带误差的采样点
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: f64,
    pub value: f64,
    pub uncertainty: f64,
}

// 采集状态机
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize)]
pub enum AcquisitionState {
    Init,
    WaitingForThreshold,
    Recording,
    Stopped,
    Interrupted,
}

impl AcquisitionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AcquisitionState::Stopped | AcquisitionState::Interrupted)
    }
}

/// Metadata of one acquisition session.
#[derive(Clone, Debug, Serialize)]
pub struct RunInfo {
    pub channel: String,
    pub path: PathBuf,
    /// Timestamp of the first accepted sample, `None` until recording starts.
    pub start_time: Option<f64>,
}

/// Linear trend `value = slope * t + intercept` extracted from a run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FitResult {
    pub slope: f64,
    pub slope_error: f64,
    pub intercept: f64,
    pub intercept_error: f64,
    pub chi_square: f64,
    pub degrees_of_freedom: i64,
}

impl FitResult {
    /// Slope converted to Pa/h.
    pub fn rate_per_hour(&self) -> f64 {
        self.slope * SECONDS_PER_HOUR
    }
    pub fn rate_error_per_hour(&self) -> f64 {
        self.slope_error * SECONDS_PER_HOUR
    }
    pub fn predict(&self, t: f64) -> f64 {
        self.slope * t + self.intercept
    }
}

// 批处理中每个 run 的结果
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RatePoint {
    pub run_start_time: NaiveDateTime,
    pub rate: f64,       // Pa/h
    pub rate_error: f64, // Pa/h
}
