use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use crate::analysis::error_model::{mpt200_pressure_from_voltage, mpt200_voltage_from_pressure};
use crate::drivers::DriverError;
use crate::types::Reading;
/// Something that can report the latest reading of a named channel.
///
/// `Ok(None)` means "nothing new yet"; callers back off and poll again.
/// Implementations make no promise about latency, duplicates or gaps.
pub trait PressureSource {
    fn pull_latest(&mut self, channel: &str) -> Result<Option<Reading>, DriverError>;
}
impl<S: PressureSource + ?Sized> PressureSource for &mut S {
    fn pull_latest(&mut self, channel: &str) -> Result<Option<Reading>, DriverError> {
        (**self).pull_latest(channel)
    }
}
/// In-memory source useful for tests and deterministic playback.
/// `None` entries play back as "no data".
pub struct ManualSource {
    queue: VecDeque<Option<Reading>>,
}
impl ManualSource {
    pub fn new(readings: impl IntoIterator<Item = Option<Reading>>) -> Self {
        Self {
            queue: readings.into_iter().collect(),
        }
    }
    #[cfg(test)]
    pub(crate) fn remaining(&self) -> usize {
        self.queue.len()
    }
}
impl PressureSource for ManualSource {
    fn pull_latest(&mut self, _channel: &str) -> Result<Option<Reading>, DriverError> {
        Ok(self.queue.pop_front().flatten())
    }
}
/// Simulated MPT200 analog output: a chamber whose pressure rises linearly
/// from `base_pressure` with multiplicative noise, reported as gauge volts.
pub struct SimulatedGauge {
    base_pressure: f64,
    rise_per_second: f64,
    noise_fraction: f64,
    started_at: f64,
    rng: StdRng,
}
impl SimulatedGauge {
    pub fn new(base_pressure: f64, rise_per_hour: f64, noise_fraction: f64) -> Self {
        Self {
            base_pressure,
            rise_per_second: rise_per_hour / 3600.0,
            noise_fraction,
            started_at: unix_now(),
            rng: StdRng::from_entropy(),
        }
    }
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }
    fn volts_at(&mut self, timestamp: f64) -> f64 {
        let ideal = self.base_pressure + self.rise_per_second * (timestamp - self.started_at);
        let noise = if self.noise_fraction > 0.0 {
            self.rng.gen_range(-self.noise_fraction..self.noise_fraction)
        } else {
            0.0
        };
        mpt200_voltage_from_pressure(ideal * (1.0 + noise))
    }
}
impl PressureSource for SimulatedGauge {
    fn pull_latest(&mut self, channel: &str) -> Result<Option<Reading>, DriverError> {
        let timestamp = unix_now();
        let value = self.volts_at(timestamp);
        debug!("{channel}: simulated {value:.4} V");
        Ok(Some(Reading { timestamp, value }))
    }
}
/// Converts MPT200 gauge volts from the wrapped source into Pa.
pub struct Mpt200Source<S> {
    inner: S,
}
impl<S: PressureSource> Mpt200Source<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}
impl<S: PressureSource> PressureSource for Mpt200Source<S> {
    fn pull_latest(&mut self, channel: &str) -> Result<Option<Reading>, DriverError> {
        let Some(r) = self.inner.pull_latest(channel)? else {
            return Ok(None);
        };
        if !r.value.is_finite() {
            return Err(DriverError::SourceUnavailable(format!(
                "{channel}: gauge output {} is not a voltage",
                r.value
            )));
        }
        Ok(Some(Reading {
            timestamp: r.timestamp,
            value: mpt200_pressure_from_voltage(r.value),
        }))
    }
}
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
