//! Numeric buffers, dense tensors and the labeled example accumulator
//!
//! This crate provides the data-side foundation of the webcam controller:
//! immutable reference-counted buffers whose lifetime is tracked by memory
//! pools, dense tensors built on them, and [`ControllerDataset`], which
//! accumulates feature tensors and one-hot labels into aligned training
//! tensors.

#![warn(missing_docs)]

pub mod buffer;
pub mod dataset;
pub mod error;
pub mod memory;
pub mod tensor;

// Re-export key types for convenience
pub use buffer::Buffer;
pub use dataset::{ControllerDataset, DatasetState};
pub use error::{Error, Result};
pub use tensor::{DenseTensor, TensorType};

/// Memory budget and accounting functionality
pub mod budget {
    pub use crate::memory::MemoryBudget;
    pub use crate::memory::MemoryPool;
    pub use crate::memory::MemoryPoolStats;
    pub use crate::memory::MemoryStats;
    pub use crate::memory::TrackingMemoryPool;
}
