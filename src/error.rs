use burn::record::RecorderError;
use thiserror::Error;

/// Errors raised while fetching or loading pre-trained weights.
#[derive(Error, Debug)]
pub enum WeightsError {
    #[error("Could not fetch weights checkpoint: {0}")]
    Fetch(#[from] std::io::Error),

    #[error("Could not load weights checkpoint: {0}")]
    Load(#[from] RecorderError),
}
