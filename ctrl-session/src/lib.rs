//! Webcam controller sessions
//!
//! Everything around the example accumulator: frame capture and cropping, a
//! frozen feature extractor seam, the trainable classifier head and its
//! training driver, and the hold-to-collect and live-predict loops, tied
//! together by [`Session`].

#![warn(missing_docs)]

mod error;

pub mod capture;
pub mod classifier;
pub mod config;
pub mod extractor;
pub mod schedule;
pub mod session;
pub mod training;

pub use capture::{FrameSource, MemoryFrameSource, SyntheticFrameSource};
pub use classifier::ClassifierHead;
pub use config::{CaptureConfig, SessionConfig, TrainingConfig};
pub use error::{Error, Result};
pub use extractor::{FeatureExtractor, PoolingExtractor};
pub use schedule::CancellationFlag;
pub use session::{LoggingObserver, Session, SessionObserver, TrainStatus};
pub use training::{BatchLogs, TrainingHistory};

// Re-export core types
pub use ctrl_core::{ControllerDataset, DatasetState, DenseTensor};
