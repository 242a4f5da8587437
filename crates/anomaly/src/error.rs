use bincode::error::{DecodeError, EncodeError};
use thiserror::Error;

/// Errors surfaced by the anomaly models, the calibrator and the ensemble.
#[derive(Debug, Error)]
pub enum AnomalyError {
    /// Hyperparameters or training-set size rule the request out.
    #[error("configuration error: {0}")]
    Config(String),
    /// Empty input, ragged rows or mismatched lengths.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("model has not been fitted")]
    NotFitted,
    /// Training produced a NaN or infinite loss.
    #[error("training diverged at epoch {epoch}: loss = {loss}")]
    Numeric { epoch: usize, loss: f32 },
    /// Encoding, compression or schema failures on persisted blobs.
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("tensor error: {0}")]
    Model(#[from] candle_core::Error),
    #[error("no model verdicts to combine")]
    NoModels,
}

impl From<EncodeError> for AnomalyError {
    fn from(e: EncodeError) -> Self {
        AnomalyError::Persistence(format!("encode: {e}"))
    }
}

impl From<DecodeError> for AnomalyError {
    fn from(e: DecodeError) -> Self {
        AnomalyError::Persistence(format!("decode: {e}"))
    }
}

impl From<std::io::Error> for AnomalyError {
    fn from(e: std::io::Error) -> Self {
        AnomalyError::Persistence(e.to_string())
    }
}
