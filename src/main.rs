// src/main.rs
// 命令行入口: live (采集或读取单个 run) / batch (多个 run 的放气率随时间变化)
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};

use outgasrate::analysis::{fit_linear, BatchSelector, ErrorModel, LinearModel};
use outgasrate::config::{
    reread_output_base, AcquisitionConfig, BatchConfig, ErrorMode, ReportConfig,
    FILE_TIMESTAMP_FORMAT,
};
use outgasrate::drivers::{Mpt200Source, SimulatedGauge};
use outgasrate::engine::{AcquisitionLoop, Interrupt, SystemClock};
use outgasrate::recorder::reload;
use outgasrate::report::{write_batch, write_run, RunReport};
use outgasrate::types::RunInfo;

#[derive(Parser, Debug)]
#[command(name = "outgasrate", version, about = "Outgas rate measurement of a vacuum chamber")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record one run (or re-read a stored one) and fit its pressure rise.
    Live(LiveArgs),
    /// Fit every stored run in a time range and plot the rates.
    Batch(BatchArgs),
}

#[derive(Args, Debug)]
struct LiveArgs {
    /// Measurement time [s].
    #[arg(short, long, default_value_t = 180)]
    duration: u64,
    /// auto | constant | const
    #[arg(short = 't', long, default_value = "auto")]
    error_type: String,
    /// Constant error [Pa], used with --error-type constant.
    #[arg(short, long, default_value_t = 0.05)]
    error: f64,
    /// Output path without extension (default data/outgas_<now>).
    #[arg(short, long)]
    filename: Option<PathBuf>,
    /// Start recording once the pressure exceeds this value [Pa].
    #[arg(short = 'p', long)]
    start_pressure: Option<f64>,
    /// Points drawn in the plot, 0 = all.
    #[arg(long, default_value_t = 10)]
    display_number: usize,
    /// Channel name of the gauge.
    #[arg(long, default_value = "Ch2")]
    dataname: String,
    /// Print the plotted points.
    #[arg(short, long)]
    show: bool,
    #[arg(long)]
    no_png: bool,
    /// Re-fit a stored run instead of measuring.
    #[arg(short, long, value_name = "CSV")]
    read: Option<PathBuf>,
    /// Simulated chamber: initial pressure [Pa].
    #[arg(long, hide = true, default_value_t = 1e-2)]
    sim_base_pressure: f64,
    /// Simulated chamber: pressure rise [Pa/h].
    #[arg(long, hide = true, default_value_t = 0.36)]
    sim_rate: f64,
    /// Simulated chamber: relative noise.
    #[arg(long, hide = true, default_value_t = 0.01)]
    sim_noise: f64,
}

#[derive(Args, Debug)]
struct BatchArgs {
    /// Range start, YYYYMMDDHHMMSS.
    start: String,
    /// Range end, YYYYMMDDHHMMSS (default now).
    end: Option<String>,
    #[arg(short = 'p', long)]
    start_pressure: Option<f64>,
    /// Run file prefix, may include a directory.
    #[arg(long, default_value = "outgas_")]
    prefix: String,
    #[arg(short = 'f', long, default_value = "outgas_plot")]
    outputfile_namebase: String,
    #[arg(short, long)]
    show: bool,
    #[arg(long)]
    no_png: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Live(args) => run_live(args),
        Commands::Batch(args) => run_batch(args),
    }
}

fn run_live(args: LiveArgs) -> Result<()> {
    let error_mode = ErrorMode::from_cli(&args.error_type, args.error)?;
    let model = ErrorModel::mpt200();
    let report_config = ReportConfig {
        display_number: args.display_number,
        save_png: !args.no_png,
        show: args.show,
    };

    let (base, info, state, samples) = if let Some(path) = args.read {
        let samples = reload(&path, error_mode, args.start_pressure, &model)
            .with_context(|| format!("failed to read run {}", path.display()))?;
        let info = RunInfo {
            channel: args.dataname,
            path: path.clone(),
            start_time: samples.times().first().copied(),
        };
        (reread_output_base(&path, args.filename), info, None, samples)
    } else {
        let output_base = args.filename.unwrap_or_else(|| {
            PathBuf::from(format!(
                "data/outgas_{}",
                Local::now().format(FILE_TIMESTAMP_FORMAT)
            ))
        });
        let config = AcquisitionConfig::new(
            args.dataname,
            Duration::from_secs(args.duration),
            error_mode,
            output_base,
            args.start_pressure,
        )
        .context("invalid measurement settings")?;

        let interrupt = Interrupt::new();
        interrupt
            .install_ctrlc()
            .context("failed to install Ctrl-C handler")?;
        let gauge = SimulatedGauge::new(args.sim_base_pressure, args.sim_rate, args.sim_noise);
        let run = AcquisitionLoop::new(
            &config,
            &model,
            Mpt200Source::new(gauge),
            SystemClock::new(),
            interrupt,
        )
        .run();
        if let Some(e) = &run.persist_error {
            warn!("Measurement ended early ({e}), reporting the samples collected so far");
        }
        if run.rejected > 0 {
            warn!("{} readings had no calibrated error and were dropped", run.rejected);
        }
        if !run.persisted {
            warn!("Nothing was recorded");
        }
        (config.output_base, run.info, Some(run.state), run.samples)
    };

    let fit = fit_linear(
        samples.times(),
        samples.values(),
        samples.uncertainties(),
        LinearModel::DEFAULT_GUESS,
    );
    if let Err(e) = &fit {
        error!("Fit failed ({e}), reporting data without trend");
    }
    let report = RunReport::new(info, state, &samples, &fit);
    if let Some(line) = report.result_line() {
        println!("{line}");
    }
    write_run(&base, &report, &samples, &report_config).context("failed to write report")?;
    Ok(())
}

fn run_batch(args: BatchArgs) -> Result<()> {
    let start = parse_bound("start", Some(&args.start));
    let end = parse_bound("end", args.end.as_deref());
    let config = BatchConfig::new(&args.prefix, start, end, args.start_pressure)
        .context("invalid batch settings")?;
    let model = ErrorModel::mpt200();
    let report = BatchSelector::new(&config, &model)
        .run()
        .with_context(|| format!("cannot list {}", config.directory.display()))?;
    info!(
        "{} rates, {} runs skipped",
        report.points.len(),
        report.skipped.len()
    );
    let base = PathBuf::from(format!(
        "{}_{}_{}",
        args.outputfile_namebase,
        start.format(FILE_TIMESTAMP_FORMAT),
        end.format(FILE_TIMESTAMP_FORMAT)
    ));
    let report_config = ReportConfig {
        display_number: 0,
        save_png: !args.no_png,
        show: args.show,
    };
    write_batch(&base, &report, &report_config).context("failed to write report")?;
    Ok(())
}

/// Invalid or missing bounds fall back to the current time.
fn parse_bound(label: &str, value: Option<&str>) -> NaiveDateTime {
    let now = Local::now().naive_local();
    match value {
        Some(text) => match NaiveDateTime::parse_from_str(text, FILE_TIMESTAMP_FORMAT) {
            Ok(t) => t,
            Err(e) => {
                warn!("Invalid {label} time {text:?} ({e}), using now");
                now
            }
        },
        None => {
            info!("No {label} time given, using now");
            now
        }
    }
}
