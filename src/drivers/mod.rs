// src/drivers/mod.rs
// 数据源、缓冲区、绘图
pub mod buffer;
pub mod error;
pub mod plot;
pub mod source;
// 公开导出这些模块里的结构体，方便外部调用
pub use buffer::{decimation_step, SampleBuffer};
pub use error::DriverError;
pub use plot::{render_rates_png, render_run_png, PlotStyle};
pub use source::{unix_now, ManualSource, Mpt200Source, PressureSource, SimulatedGauge};
