use crate::drivers::DriverError;
use crate::types::Sample;
/// Parallel time / value / uncertainty series of one run.
///
/// The fitter consumes the three slices directly, so they are kept as
/// separate vectors instead of a `Vec<Sample>`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SampleBuffer {
    times: Vec<f64>,
    values: Vec<f64>,
    uncertainties: Vec<f64>,
}
impl SampleBuffer {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            times: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            uncertainties: Vec::with_capacity(capacity),
        }
    }
    /// Appends a sample, keeping timestamps non-decreasing.
    pub fn push(&mut self, sample: Sample) -> Result<(), DriverError> {
        if !(sample.uncertainty > 0.0) {
            return Err(DriverError::InvalidUncertainty(sample.uncertainty));
        }
        if let Some(&previous) = self.times.last() {
            if sample.timestamp < previous {
                return Err(DriverError::OutOfOrder {
                    previous,
                    next: sample.timestamp,
                });
            }
        }
        self.times.push(sample.timestamp);
        self.values.push(sample.value);
        self.uncertainties.push(sample.uncertainty);
        Ok(())
    }
    /// Cuts all three series to the length of the shortest one and returns
    /// how many entries were dropped in total.
    pub fn truncate_to_shortest(&mut self) -> usize {
        let shortest = self
            .times
            .len()
            .min(self.values.len())
            .min(self.uncertainties.len());
        let before = self.times.len() + self.values.len() + self.uncertainties.len();
        self.times.truncate(shortest);
        self.values.truncate(shortest);
        self.uncertainties.truncate(shortest);
        before - 3 * shortest
    }
    pub fn len(&self) -> usize {
        self.times.len()
    }
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
    pub fn times(&self) -> &[f64] {
        &self.times
    }
    pub fn values(&self) -> &[f64] {
        &self.values
    }
    pub fn uncertainties(&self) -> &[f64] {
        &self.uncertainties
    }
    pub fn iter(&self) -> impl Iterator<Item = Sample> + '_ {
        self.times
            .iter()
            .zip(&self.values)
            .zip(&self.uncertainties)
            .map(|((&timestamp, &value), &uncertainty)| Sample {
                timestamp,
                value,
                uncertainty,
            })
    }
    /// Every `step`-th sample, used to thin out dense runs for display.
    pub fn decimated(&self, display_number: usize) -> Vec<Sample> {
        let step = decimation_step(self.len(), display_number);
        self.iter().step_by(step).collect()
    }
    #[cfg(test)]
    pub(crate) fn from_raw_parts(
        times: Vec<f64>,
        values: Vec<f64>,
        uncertainties: Vec<f64>,
    ) -> Self {
        Self {
            times,
            values,
            uncertainties,
        }
    }
}
/// `display_number == 0` shows everything, otherwise at most about
/// `display_number` points are kept.
pub fn decimation_step(len: usize, display_number: usize) -> usize {
    if display_number == 0 || len <= display_number {
        1
    } else {
        len / display_number
    }
}
