//! The controller session
//!
//! [`Session`] is the context every handler works through: it owns the frame
//! source, the frozen extractor, the example dataset and the trained head.
//! All operations take `&mut self`, so collecting, training and predicting
//! can never overlap.

use std::fmt;
use std::sync::Arc;

use ctrl_core::budget::{MemoryBudget, MemoryPool, MemoryPoolStats, TrackingMemoryPool};
use ctrl_core::{ControllerDataset, DenseTensor};

use crate::capture::{adjust_video_size, capture_in, DisplaySize, FrameSource};
use crate::classifier::ClassifierHead;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::extractor::FeatureExtractor;
use crate::schedule::{next_frame, CancellationFlag};
use crate::training::{fit_dataset, BatchLogs, TrainingHistory};

/// Progress of a training run as shown to the user
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrainStatus {
    /// Training started on this many examples
    Started {
        /// Rows in the dataset
        examples: usize,
    },
    /// A mini-batch finished
    Batch(BatchLogs),
    /// Training finished with this final epoch loss
    Finished {
        /// Mean loss of the last epoch
        loss: f32,
    },
}

impl fmt::Display for TrainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { .. } => write!(f, "Training..."),
            Self::Batch(logs) => write!(f, "Loss: {:.5}", logs.loss),
            Self::Finished { loss } => write!(f, "Done. Loss: {loss:.5}"),
        }
    }
}

/// Receives session events, typically to update a UI
///
/// Every method has an empty default so observers only implement what they
/// display.
#[allow(unused_variables)]
pub trait SessionObserver: Send {
    /// An example for `label` was added; `total` counts that class so far
    fn example_added(&mut self, label: usize, total: usize, image: &DenseTensor<f32>) {}

    /// Training progressed
    fn train_status(&mut self, status: &TrainStatus) {}

    /// The live loop classified a frame as `label`
    fn prediction(&mut self, label: usize, control: &str) {}

    /// A hold-to-collect gesture for `label` began
    fn collection_started(&mut self, label: usize) {}

    /// A hold-to-collect gesture for `label` ended after `added` examples
    fn collection_finished(&mut self, label: usize, added: usize) {}
}

/// Observer that reports every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl SessionObserver for LoggingObserver {
    fn example_added(&mut self, label: usize, total: usize, _image: &DenseTensor<f32>) {
        tracing::debug!(label, total, "example added");
    }

    fn train_status(&mut self, status: &TrainStatus) {
        match status {
            TrainStatus::Batch(logs) => {
                tracing::trace!(epoch = logs.epoch, batch = logs.batch, "{status}");
            }
            _ => tracing::info!("{status}"),
        }
    }

    fn prediction(&mut self, label: usize, control: &str) {
        tracing::debug!(label, control, "prediction");
    }

    fn collection_started(&mut self, label: usize) {
        tracing::info!(label, "collecting examples");
    }

    fn collection_finished(&mut self, label: usize, added: usize) {
        tracing::info!(label, added, "collection finished");
    }
}

/// Session state: frames in, examples collected, head trained, controls out
pub struct Session {
    config: SessionConfig,
    source: Box<dyn FrameSource>,
    display: DisplaySize,
    extractor: Box<dyn FeatureExtractor>,
    pool: Arc<TrackingMemoryPool>,
    dataset: ControllerDataset<f32>,
    head: Option<ClassifierHead>,
    totals: Vec<usize>,
    observer: Box<dyn SessionObserver>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("dataset", &self.dataset)
            .field("trained", &self.head.is_some())
            .field("totals", &self.totals)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session; fails if `config` does not validate
    pub fn new(
        config: SessionConfig,
        source: Box<dyn FrameSource>,
        extractor: Box<dyn FeatureExtractor>,
        observer: Box<dyn SessionObserver>,
    ) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(match config.memory_budget_bytes {
            Some(bytes) => TrackingMemoryPool::with_budget(Arc::new(MemoryBudget::new(bytes))),
            None => TrackingMemoryPool::new(),
        });
        let dataset = ControllerDataset::with_pool(config.num_classes, Some(pool.clone()))?;
        let (height, width) = source.dimensions();

        #[allow(clippy::cast_precision_loss)]
        let mut display = DisplaySize {
            width: config.capture.width as f64,
            height: config.capture.height as f64,
        };
        adjust_video_size(width, height, &mut display);

        let (display_width, display_height) = (display.width, display.height);
        tracing::info!(
            num_classes = config.num_classes,
            height,
            width,
            display_width,
            display_height,
            activation = ?extractor.output_shape(),
            "session created"
        );

        Ok(Self {
            totals: vec![0; config.num_classes],
            config,
            source,
            display,
            extractor,
            pool,
            dataset,
            head: None,
            observer,
        })
    }

    /// Run one frame through the extractor so the first real capture is fast
    pub fn warm_up(&mut self) -> Result<()> {
        let activation = self.activation()?;
        tracing::debug!(shape = ?activation.shape(), "extractor warmed up");
        Ok(())
    }

    /// Capture the current frame and add it as an example of `label`
    ///
    /// Returns the number of examples of that class collected so far. On
    /// failure neither the dataset nor the totals change.
    pub fn add_example_from_camera(&mut self, label: usize) -> Result<usize> {
        let pool = self.pool_handle();
        let image = capture_in(self.source.as_mut(), pool)?;
        let activation = self.extractor.extract(&image)?;
        self.dataset.add_example(activation, label)?;

        let total = match self.totals.get_mut(label) {
            Some(total) => {
                *total += 1;
                *total
            }
            None => 0,
        };
        self.observer.example_added(label, total, &image);
        Ok(total)
    }

    /// Add examples of `label` every frame for as long as `held` stays raised
    ///
    /// Returns the number of examples added. The observer sees the gesture
    /// finish even when a capture fails; examples added before the failure
    /// are kept.
    pub async fn collect_while_held(
        &mut self,
        label: usize,
        held: &CancellationFlag,
    ) -> Result<usize> {
        self.observer.collection_started(label);
        let interval = self.config.capture.frame_interval();

        let mut added = 0;
        let outcome = loop {
            if !held.is_raised() {
                break Ok(());
            }
            if let Err(e) = self.add_example_from_camera(label) {
                tracing::warn!(label, added, error = %e, "collection aborted");
                break Err(e);
            }
            added += 1;
            next_frame(interval).await;
        };

        self.observer.collection_finished(label, added);
        outcome.map(|()| added)
    }

    /// Train a fresh head on every example collected so far
    ///
    /// The previous head, if any, is replaced only when training succeeds.
    pub async fn train(&mut self) -> Result<TrainingHistory> {
        if self.dataset.is_empty() {
            return Err(Error::EmptyDataset);
        }

        let training = &self.config.training;
        let mut head = ClassifierHead::new(
            &self.extractor.output_shape(),
            training.hidden_units,
            self.config.num_classes,
            training.seed,
        )?;

        let observer = &mut self.observer;
        observer.train_status(&TrainStatus::Started {
            examples: self.dataset.len(),
        });
        let history = fit_dataset(&mut head, &self.dataset, training, |logs| {
            observer.train_status(&TrainStatus::Batch(*logs));
        })
        .await?;

        if let Some(loss) = history.final_loss() {
            observer.train_status(&TrainStatus::Finished { loss });
        }
        self.head = Some(head);
        Ok(history)
    }

    /// Classify the current frame
    pub fn predict_once(&mut self) -> Result<usize> {
        if self.head.is_none() {
            return Err(Error::ModelNotTrained);
        }
        let activation = self.activation()?;
        let head = self.head.as_ref().ok_or(Error::ModelNotTrained)?;
        let label = head.predict(&activation)?;

        let control = self.config.control_name(label).unwrap_or_default();
        self.observer.prediction(label, control);
        Ok(label)
    }

    /// Classify a frame every tick for as long as `running` stays raised
    ///
    /// Returns the number of frames classified.
    pub async fn predict_while_running(&mut self, running: &CancellationFlag) -> Result<usize> {
        if self.head.is_none() {
            return Err(Error::ModelNotTrained);
        }
        let interval = self.config.capture.frame_interval();

        let mut predictions = 0;
        while running.is_raised() {
            self.predict_once()?;
            predictions += 1;
            next_frame(interval).await;
        }
        Ok(predictions)
    }

    /// Examples collected per class
    pub fn totals(&self) -> &[usize] {
        &self.totals
    }

    /// The accumulated examples
    pub fn dataset(&self) -> &ControllerDataset<f32> {
        &self.dataset
    }

    /// The trained head, if any
    pub fn head(&self) -> Option<&ClassifierHead> {
        self.head.as_ref()
    }

    /// Size at which to show the video so its centred square fills the element
    pub fn display_size(&self) -> DisplaySize {
        self.display
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Buffer accounting for everything captured into this session
    pub fn memory_stats(&self) -> MemoryPoolStats {
        self.pool.usage_stats()
    }

    /// Drop all examples and the trained head
    pub fn reset(&mut self) {
        self.dataset.reset();
        self.head = None;
        self.totals.iter_mut().for_each(|total| *total = 0);
        tracing::info!("session reset");
    }

    fn pool_handle(&self) -> Option<Arc<dyn MemoryPool>> {
        Some(self.pool.clone())
    }

    fn activation(&mut self) -> Result<DenseTensor<f32>> {
        let pool = self.pool_handle();
        let image = capture_in(self.source.as_mut(), pool)?;
        self.extractor.extract(&image)
    }
}
