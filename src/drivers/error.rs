use thiserror::Error;
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("data source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("timestamp {next} is earlier than the previous sample at {previous}")]
    OutOfOrder { previous: f64, next: f64 },
    #[error("uncertainty must be positive, got {0}")]
    InvalidUncertainty(f64),
    #[error("failed to render plot: {0}")]
    Plot(String),
}
impl<E: std::error::Error + Send + Sync + 'static> From<plotters::drawing::DrawingAreaErrorKind<E>>
    for DriverError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        DriverError::Plot(format!("{value:?}"))
    }
}
impl From<image::ImageError> for DriverError {
    fn from(value: image::ImageError) -> Self {
        DriverError::Plot(value.to_string())
    }
}
