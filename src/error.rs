use thiserror::Error;

use crate::ml::TrainingError;

/// Reasons a forecasting run produces no output.
#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),
    #[error("Model training failed: {0}")]
    Training(#[from] TrainingError),
}
