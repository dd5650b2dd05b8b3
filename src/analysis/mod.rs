// src/analysis/mod.rs
// 误差模型、拟合引擎、批处理
pub mod batch;
pub mod error_model;
pub mod fit;
pub mod model;

pub use batch::{BatchReport, BatchSelector};
pub use error_model::{DomainError, ErrorModel};
pub use fit::{fit_linear, FitError};
pub use model::LinearModel;
