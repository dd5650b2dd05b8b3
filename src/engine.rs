// src/engine.rs
// 采集循环: 轮询数据源 -> 阈值判断 -> 写入 CSV -> 缓冲区
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{Local, TimeZone};
use log::{error, info, warn};
use thiserror::Error;

use crate::analysis::error_model::ErrorModel;
use crate::config::AcquisitionConfig;
use crate::drivers::{PressureSource, SampleBuffer};
use crate::recorder::RunRecorder;
use crate::types::{AcquisitionState, Reading, RunInfo, Sample};

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("cannot write run file {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Monotonic time base of the loop. Tests drive it by hand.
pub trait Clock {
    fn elapsed(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Cancellation flag shared with the Ctrl-C handler.
#[derive(Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }
    /// Routes Ctrl-C into this flag.
    pub fn install_ctrlc(&self) -> Result<(), ctrlc::Error> {
        let this = self.clone();
        ctrlc::set_handler(move || {
            warn!("Interrupted, stopping measurement");
            this.trigger();
        })
    }
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Everything collected by one acquisition.
#[derive(Debug)]
pub struct Run {
    pub info: RunInfo,
    pub state: AcquisitionState,
    pub samples: SampleBuffer,
    /// Readings refused because no uncertainty could be assigned.
    pub rejected: usize,
    /// True once the run file has been created.
    pub persisted: bool,
    /// Write failure that ended the run early.
    pub persist_error: Option<AcquisitionError>,
}

/// Time-bounded polling loop writing every accepted reading to disk.
pub struct AcquisitionLoop<'a, S: PressureSource, C: Clock> {
    config: &'a AcquisitionConfig,
    error_model: &'a ErrorModel,
    source: S,
    clock: C,
    interrupt: Interrupt,
    state: AcquisitionState,
    samples: SampleBuffer,
    recorder: Option<RunRecorder>,
    rejected: usize,
    start_time: Option<f64>,
    persist_error: Option<AcquisitionError>,
}

impl<'a, S: PressureSource, C: Clock> AcquisitionLoop<'a, S, C> {
    pub fn new(
        config: &'a AcquisitionConfig,
        error_model: &'a ErrorModel,
        source: S,
        clock: C,
        interrupt: Interrupt,
    ) -> Self {
        let polls = config.duration.as_secs_f64() / config.poll_interval.as_secs_f64().max(1e-3);
        let capacity = polls.ceil() as usize + 1;
        Self {
            config,
            error_model,
            source,
            clock,
            interrupt,
            state: AcquisitionState::Init,
            samples: SampleBuffer::with_capacity(capacity.min(1 << 16)),
            recorder: None,
            rejected: 0,
            start_time: None,
            persist_error: None,
        }
    }

    /// Runs until the duration is over, the interrupt fires or the run file
    /// can no longer be written. The samples collected so far are returned in
    /// every case.
    pub fn run(mut self) -> Run {
        let started = self.clock.elapsed();
        self.state = if self.config.start_pressure.is_some() {
            AcquisitionState::WaitingForThreshold
        } else {
            AcquisitionState::Recording
        };
        info!(
            "Start Time: {}",
            Local::now().format("%Y/%m/%d %H:%M:%S")
        );
        if let Some(p) = self.config.start_pressure {
            info!("Waiting for pressure above {p:0.3e} Pa");
        }
        while !self.state.is_terminal() {
            // the only place where cancellation is observed
            if self.interrupt.is_triggered() {
                self.state = AcquisitionState::Interrupted;
            } else if self.clock.elapsed().saturating_sub(started) > self.config.duration {
                self.state = AcquisitionState::Stopped;
            } else {
                match self.step() {
                    Ok(wait) => self.clock.sleep(wait),
                    Err(e) => {
                        error!("{e}, stopping measurement");
                        self.persist_error = Some(e);
                        self.state = AcquisitionState::Stopped;
                    }
                }
            }
        }
        let dropped = self.samples.truncate_to_shortest();
        if dropped > 0 {
            warn!("Some data were removed ({dropped} entries)");
        }
        info!(
            "Stop Measurement ({:?}): {} samples",
            self.state,
            self.samples.len()
        );
        Run {
            info: RunInfo {
                channel: self.config.channel.clone(),
                path: self.config.run_path(),
                start_time: self.start_time,
            },
            state: self.state,
            persisted: self.recorder.is_some(),
            samples: self.samples,
            rejected: self.rejected,
            persist_error: self.persist_error,
        }
    }

    fn step(&mut self) -> Result<Duration, AcquisitionError> {
        let config = self.config;
        let reading = match self.source.pull_latest(&config.channel) {
            Ok(Some(reading)) => reading,
            Ok(None) => {
                info!(
                    "Data is None. Retry after {:.1}s",
                    config.no_data_backoff.as_secs_f64()
                );
                return Ok(config.no_data_backoff);
            }
            Err(e) => {
                warn!(
                    "{e}. Retry after {:.1}s",
                    config.no_data_backoff.as_secs_f64()
                );
                return Ok(config.no_data_backoff);
            }
        };
        if let Some(threshold) = config.start_pressure {
            if reading.value < threshold {
                info!(
                    "Pressure ({:0.3e} Pa) is lower than start pressure.",
                    reading.value
                );
                return Ok(config.poll_interval);
            }
        }
        let uncertainty = match config.error_mode.uncertainty(self.error_model, reading.value) {
            Ok(u) => u,
            Err(e) => {
                error!("{e}; use a constant error (--error-type const) for this range");
                self.rejected += 1;
                return Ok(config.poll_interval);
            }
        };
        if let Some(&last) = self.samples.times().last() {
            if reading.timestamp < last {
                warn!(
                    "Reading at {} is older than the last sample, ignored",
                    reading.timestamp
                );
                return Ok(config.poll_interval);
            }
        }
        self.persist(&reading)?;
        let sample = Sample {
            timestamp: reading.timestamp,
            value: reading.value,
            uncertainty,
        };
        if let Err(e) = self.samples.push(sample) {
            // timestamp and uncertainty were checked above
            error!("{e}");
        }
        info!(
            "Time:{} data:{:0.3e}",
            format_unix(reading.timestamp),
            reading.value
        );
        Ok(config.poll_interval)
    }

    fn persist(&mut self, reading: &Reading) -> Result<(), AcquisitionError> {
        let path = self.config.run_path();
        let to_err = |source| AcquisitionError::Persist {
            path: path.clone(),
            source,
        };
        if self.recorder.is_none() {
            info!("---------------Out Gas Rate Measurement Start!!---------------");
            self.recorder = Some(RunRecorder::create(&path, &self.config.channel).map_err(to_err)?);
            self.state = AcquisitionState::Recording;
            self.start_time = Some(reading.timestamp);
        }
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.append(reading).map_err(to_err)?;
        }
        Ok(())
    }
}

pub fn format_unix(timestamp: f64) -> String {
    match Local.timestamp_opt(timestamp.floor() as i64, 0).single() {
        Some(t) => t.format("%Y/%m/%d %H:%M:%S").to_string(),
        None => format!("{timestamp}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ErrorMode;
    use crate::drivers::{DriverError, ManualSource};
    use crate::recorder::reload;
    use std::cell::Cell;
    use tempfile::{tempdir, TempDir};

    /// Clock that only moves when slept on.
    #[derive(Default)]
    struct ManualClock {
        now: Cell<Duration>,
    }

    impl Clock for ManualClock {
        fn elapsed(&self) -> Duration {
            self.now.get()
        }
        fn sleep(&self, duration: Duration) {
            self.now.set(self.now.get() + duration);
        }
    }

    /// Always has a fresh reading, one per poll.
    struct CountingSource {
        polls: usize,
        interrupt_after: Option<(usize, Interrupt)>,
    }

    impl PressureSource for CountingSource {
        fn pull_latest(&mut self, _channel: &str) -> Result<Option<Reading>, DriverError> {
            self.polls += 1;
            if let Some((after, interrupt)) = &self.interrupt_after {
                if self.polls >= *after {
                    interrupt.trigger();
                }
            }
            Ok(Some(Reading {
                timestamp: 1_700_000_000.0 + 2.0 * self.polls as f64,
                value: 1e-2 + 1e-5 * self.polls as f64,
            }))
        }
    }

    fn config(dir: &TempDir, secs: u64, start_pressure: Option<f64>) -> AcquisitionConfig {
        AcquisitionConfig::new(
            "Ch2",
            Duration::from_secs(secs),
            ErrorMode::Auto,
            dir.path().join("outgas_20240101000000"),
            start_pressure,
        )
        .unwrap()
    }

    fn measure<S: PressureSource>(
        cfg: &AcquisitionConfig,
        model: &ErrorModel,
        source: S,
        interrupt: Interrupt,
    ) -> Run {
        AcquisitionLoop::new(cfg, model, source, ManualClock::default(), interrupt).run()
    }

    #[test]
    fn duration_bounds_sample_count() {
        let model = ErrorModel::mpt200();
        for secs in [1u64, 2, 7, 10, 61] {
            let dir = tempdir().unwrap();
            let cfg = config(&dir, secs, None);
            let source = CountingSource {
                polls: 0,
                interrupt_after: None,
            };
            let run = measure(&cfg, &model, source, Interrupt::new());
            let lower = (secs / 2) as usize;
            assert_eq!(run.state, AcquisitionState::Stopped);
            assert!(run.samples.len() >= lower && run.samples.len() <= lower + 1, "{secs}s");
        }
    }

    #[test]
    fn interrupt_leaves_equal_series() {
        let model = ErrorModel::mpt200();
        for after in 1..6 {
            let dir = tempdir().unwrap();
            let cfg = config(&dir, 3600, None);
            let interrupt = Interrupt::new();
            let source = CountingSource {
                polls: 0,
                interrupt_after: Some((after, interrupt.clone())),
            };
            let run = measure(&cfg, &model, source, interrupt);
            assert_eq!(run.state, AcquisitionState::Interrupted);
            assert_eq!(run.samples.len(), after);
            assert_eq!(run.samples.times().len(), run.samples.values().len());
            assert_eq!(run.samples.values().len(), run.samples.uncertainties().len());
        }
    }

    #[test]
    fn interrupt_before_first_poll_gives_empty_run() {
        let model = ErrorModel::mpt200();
        let dir = tempdir().unwrap();
        let cfg = config(&dir, 60, None);
        let interrupt = Interrupt::new();
        interrupt.trigger();
        let run = measure(&cfg, &model, ManualSource::new(Vec::new()), interrupt);
        assert_eq!(run.state, AcquisitionState::Interrupted);
        assert!(run.samples.is_empty());
        assert!(!run.persisted);
        assert!(!cfg.run_path().exists());
    }

    #[test]
    fn gaps_and_threshold_are_not_recorded() {
        let model = ErrorModel::mpt200();
        let dir = tempdir().unwrap();
        let cfg = config(&dir, 20, Some(1e-2));
        let r = |timestamp: f64, value: f64| Some(Reading { timestamp, value });
        let source = ManualSource::new(vec![
            None,
            r(10.0, 5e-3),
            r(12.0, 2e-2),
            None,
            r(14.0, 3e-2),
        ]);
        let run = measure(&cfg, &model, source, Interrupt::new());
        assert_eq!(run.state, AcquisitionState::Stopped);
        assert_eq!(run.samples.times(), &[12.0, 14.0]);
        assert_eq!(run.info.start_time, Some(12.0));
        let reloaded = reload(&cfg.run_path(), ErrorMode::Auto, Some(1e-2), &model).unwrap();
        assert_eq!(reloaded, run.samples);
    }

    #[test]
    fn threshold_never_reached_stays_waiting_until_stop() {
        let model = ErrorModel::mpt200();
        let dir = tempdir().unwrap();
        let cfg = config(&dir, 10, Some(1.0));
        let source = CountingSource {
            polls: 0,
            interrupt_after: None,
        };
        let clock = ManualClock::default();
        let mut lp = AcquisitionLoop::new(&cfg, &model, source, clock, Interrupt::new());
        assert_eq!(lp.state, AcquisitionState::Init);
        assert_eq!(lp.step().unwrap(), cfg.poll_interval);
        let run = lp.run();
        assert_eq!(run.state, AcquisitionState::Stopped);
        assert!(run.samples.is_empty());
        assert!(!run.persisted);
    }

    #[test]
    fn out_of_band_readings_are_rejected_not_substituted() {
        let model = ErrorModel::mpt200();
        let dir = tempdir().unwrap();
        let cfg = config(&dir, 10, None);
        let r = |timestamp: f64, value: f64| Some(Reading { timestamp, value });
        let source = ManualSource::new(vec![r(0.0, 1e-2), r(2.0, 1e6), r(4.0, 2e-2)]);
        let run = measure(&cfg, &model, source, Interrupt::new());
        assert_eq!(run.rejected, 1);
        assert_eq!(run.samples.values(), &[1e-2, 2e-2]);
        let text = std::fs::read_to_string(cfg.run_path()).unwrap();
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn persisted_run_round_trips() {
        let model = ErrorModel::mpt200();
        let dir = tempdir().unwrap();
        let cfg = config(&dir, 40, None);
        let source = CountingSource {
            polls: 0,
            interrupt_after: None,
        };
        let run = measure(&cfg, &model, source, Interrupt::new());
        let text = std::fs::read_to_string(&run.info.path).unwrap();
        assert!(text.starts_with("Time,Ch2\n"));
        let reloaded = reload(&run.info.path, ErrorMode::Auto, None, &model).unwrap();
        assert_eq!(reloaded, run.samples);
    }

    /// Removes the run file on the given poll.
    struct VanishingFile {
        inner: CountingSource,
        path: PathBuf,
        on_poll: usize,
    }

    impl PressureSource for VanishingFile {
        fn pull_latest(&mut self, channel: &str) -> Result<Option<Reading>, DriverError> {
            if self.inner.polls + 1 == self.on_poll {
                std::fs::remove_file(&self.path).unwrap();
            }
            self.inner.pull_latest(channel)
        }
    }

    #[test]
    fn write_failure_keeps_collected_samples() {
        let model = ErrorModel::mpt200();
        let dir = tempdir().unwrap();
        let cfg = config(&dir, 60, None);
        let source = VanishingFile {
            inner: CountingSource {
                polls: 0,
                interrupt_after: None,
            },
            path: cfg.run_path(),
            on_poll: 6,
        };
        let run = measure(&cfg, &model, source, Interrupt::new());
        assert_eq!(run.state, AcquisitionState::Stopped);
        assert!(matches!(run.persist_error, Some(AcquisitionError::Persist { .. })));
        assert_eq!(run.samples.len(), 5);
        assert_eq!(run.samples.times().len(), run.samples.uncertainties().len());

        let fit = crate::analysis::fit_linear(
            run.samples.times(),
            run.samples.values(),
            run.samples.uncertainties(),
            crate::analysis::LinearModel::DEFAULT_GUESS,
        );
        let report = crate::report::RunReport::new(run.info, Some(run.state), &run.samples, &fit);
        assert_eq!(report.samples, 5);
        // 1e-5 Pa every 2 s
        assert!((report.rate.unwrap() - 0.018).abs() < 1e-6);
        assert!(report.result_line().is_some());
    }
}
