// src/lib.rs
// 放气率测量: 采集、误差模型、拟合、批处理
pub mod analysis;
pub mod config;
pub mod drivers;
pub mod engine;
pub mod recorder;
pub mod report;
pub mod types;
