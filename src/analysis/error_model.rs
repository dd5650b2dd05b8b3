//! Measurement uncertainty of the MPT200 Pirani/cold-cathode gauge.
//!
//! The manufacturer specifies the relative accuracy per pressure decade, so
//! the error is a band-wise multiple of the reading (half width, N2):
//!
//! | band        | range [Pa]       | error         |
//! |-------------|------------------|---------------|
//! | high        | `[1e3, 1e5)`     | 30 % of value |
//! | mid         | `[2e-3, 1e3)`    | 10 % of value |
//! | low         | `[1e-8, 2e-3)`   | 25 % of value |
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    #[error("pressure value {value:e} Pa is outside the calibrated range, cannot estimate error")]
    OutOfRange { value: f64 },
    #[error("invalid error band table: {0}")]
    InvalidBands(String),
}

/// Half-open range `[lo, hi)` with a relative error multiplier.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ErrorBand {
    pub lo: f64,
    pub hi: f64,
    pub multiplier: f64,
}

impl ErrorBand {
    pub const fn new(lo: f64, hi: f64, multiplier: f64) -> Self {
        Self { lo, hi, multiplier }
    }
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lo && value < self.hi
    }
}

/// Ordered, non-overlapping set of error bands.
#[derive(Clone, Debug)]
pub struct ErrorModel {
    bands: Vec<ErrorBand>,
}

impl ErrorModel {
    pub fn new(mut bands: Vec<ErrorBand>) -> Result<Self, DomainError> {
        if bands.is_empty() {
            return Err(DomainError::InvalidBands("no bands given".into()));
        }
        for band in &bands {
            if !(band.lo.is_finite() && band.hi.is_finite()) || band.lo >= band.hi {
                return Err(DomainError::InvalidBands(format!(
                    "band [{:e}, {:e}) is empty or not finite",
                    band.lo, band.hi
                )));
            }
            if !(band.multiplier > 0.0) {
                return Err(DomainError::InvalidBands(format!(
                    "multiplier {} must be positive",
                    band.multiplier
                )));
            }
        }
        bands.sort_by(|a, b| a.lo.total_cmp(&b.lo));
        for pair in bands.windows(2) {
            if pair[1].lo < pair[0].hi {
                return Err(DomainError::InvalidBands(format!(
                    "bands [{:e}, {:e}) and [{:e}, {:e}) overlap",
                    pair[0].lo, pair[0].hi, pair[1].lo, pair[1].hi
                )));
            }
        }
        Ok(Self { bands })
    }

    /// Calibration table of the MPT200 gauge (N2).
    pub fn mpt200() -> Self {
        Self {
            bands: vec![
                ErrorBand::new(1e-8, 2e-3, 0.25),
                ErrorBand::new(2e-3, 1e3, 0.1),
                ErrorBand::new(1e3, 1e5, 0.3),
            ],
        }
    }

    #[cfg(test)]
    pub(crate) fn bands(&self) -> &[ErrorBand] {
        &self.bands
    }

    pub fn estimate(&self, value: f64) -> Result<f64, DomainError> {
        self.bands
            .iter()
            .find(|band| band.contains(value))
            .map(|band| value * band.multiplier)
            .ok_or(DomainError::OutOfRange { value })
    }
}

impl Default for ErrorModel {
    fn default() -> Self {
        Self::mpt200()
    }
}

/// MPT200 analog output: gauge voltage to pressure in Pa.
pub fn mpt200_pressure_from_voltage(volts: f64) -> f64 {
    10f64.powf(1.667 * volts - 9.333)
}

/// Inverse of [`mpt200_pressure_from_voltage`].
pub fn mpt200_voltage_from_pressure(pressure_pa: f64) -> f64 {
    (pressure_pa.log10() + 9.333) / 1.667
}
