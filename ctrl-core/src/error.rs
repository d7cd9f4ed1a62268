//! Error types for buffers, tensors and the example accumulator

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for core operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Tensor shapes disagree along a dimension that must match
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Shape (or partial shape) the operation required
        expected: Vec<usize>,
        /// Shape that was supplied
        actual: Vec<usize>,
    },

    /// Class label outside `[0, num_classes)`
    #[error("Label {label} is out of range for {num_classes} classes")]
    LabelOutOfRange {
        /// The rejected label
        label: usize,
        /// Number of classes of the encoder
        num_classes: usize,
    },

    /// Index out of bounds
    #[error("Index out of bounds")]
    IndexOutOfBounds,

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Layout error (alignment, element size)
    #[error("Memory layout error: {0}")]
    LayoutError(String),

    /// Memory budget exceeded
    #[error("Memory budget exceeded: requested {requested} bytes, available {available} bytes")]
    MemoryBudgetExceeded {
        /// Requested memory in bytes
        requested: usize,
        /// Available memory in bytes
        available: usize,
    },
}

impl Error {
    pub(crate) fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Error::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
