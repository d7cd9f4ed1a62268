//! Error types for sessions

use thiserror::Error;

/// Error type for capture, training and prediction
#[derive(Error, Debug)]
pub enum Error {
    /// Core library error (shape mismatch, bad label, budget)
    #[error("Core error: {0}")]
    Core(#[from] ctrl_core::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Configuration parsed but is not usable
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Training requested before any example was added
    #[error("Add some examples before training")]
    EmptyDataset,

    /// The batch size derived from the dataset size is zero
    #[error("Batch size is 0 for {examples} examples at fraction {fraction}; choose a larger fraction")]
    InvalidBatchSize {
        /// Examples in the dataset
        examples: usize,
        /// Requested batch size fraction
        fraction: f64,
    },

    /// Prediction requested before a head was trained
    #[error("No trained model; train before predicting")]
    ModelNotTrained,

    /// Frame capture failed
    #[error("Capture error: {0}")]
    Capture(String),
}

/// Result type for sessions
pub type Result<T> = std::result::Result<T, Error>;
