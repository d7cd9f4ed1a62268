//! Incremental accumulator of labeled examples
//!
//! [`ControllerDataset`] keeps the examples collected during a session as two
//! aligned tensors: the stacked features and their one-hot labels. Each
//! append builds new tensors by concatenation and drops the ones they
//! replace before returning, so at any time exactly one features buffer and
//! one labels buffer are owned by the dataset.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::memory::MemoryPool;
use crate::tensor::{DenseTensor, TensorType};

/// Fill state of a [`ControllerDataset`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DatasetState {
    /// No example has been added yet
    Empty,
    /// Holds this many example rows
    NonEmpty(usize),
}

/// The features and labels owned by a non-empty dataset
#[derive(Debug)]
struct Examples<T: TensorType> {
    /// `[N, ...feature_dims]`
    features: DenseTensor<T>,
    /// `[N, num_classes]`, one-hot rows
    labels: DenseTensor<f32>,
}

/// Growing, aligned pair of feature and one-hot label tensors
#[derive(Debug)]
pub struct ControllerDataset<T: TensorType = f32> {
    /// Width of every label row; labels must be below this
    num_classes: usize,

    /// Present iff at least one example was added
    examples: Option<Examples<T>>,

    /// Pool in which label tensors are accounted
    memory_pool: Option<Arc<dyn MemoryPool>>,
}

impl<T: TensorType> ControllerDataset<T> {
    /// Create an empty dataset for `num_classes` classes
    pub fn new(num_classes: usize) -> Result<Self> {
        Self::with_pool(num_classes, None)
    }

    /// Create an empty dataset whose label tensors are accounted in `pool`
    pub fn with_pool(num_classes: usize, pool: Option<Arc<dyn MemoryPool>>) -> Result<Self> {
        if num_classes == 0 {
            return Err(Error::InvalidArgument(
                "A dataset needs at least one class".into(),
            ));
        }

        Ok(Self {
            num_classes,
            examples: None,
            memory_pool: pool,
        })
    }

    /// Append `example` with class `label`
    ///
    /// `example` must be a single row, `[1, ...feature_dims]`, so every call
    /// grows the dataset by exactly one row. The dataset takes ownership of
    /// the tensor: the first example is stored as is, later ones are
    /// concatenated onto the accumulated features along axis 0.
    ///
    /// Fails with [`Error::LabelOutOfRange`] if `label >= num_classes` and
    /// with [`Error::ShapeMismatch`] if the example is not one row or its
    /// feature dimensions differ from the accumulated ones. On failure the
    /// dataset is unchanged.
    pub fn add_example(&mut self, example: DenseTensor<T>, label: usize) -> Result<()> {
        let shape = example.shape();
        if shape.is_empty() {
            return Err(Error::InvalidArgument(
                "Examples need a leading batch dimension".into(),
            ));
        }
        if shape[0] != 1 {
            let mut expected = shape.to_vec();
            expected[0] = 1;
            tracing::warn!(label, shape = ?shape, "example rejected, not a single row");
            return Err(Error::shape_mismatch(&expected, shape));
        }

        let y = DenseTensor::one_hot(&[label], self.num_classes, self.memory_pool.clone())?;

        match &self.examples {
            None => {
                tracing::debug!(
                    label,
                    shape = ?example.shape(),
                    "first example, taking ownership"
                );
                self.examples = Some(Examples {
                    features: example,
                    labels: y,
                });
            }
            Some(current) => {
                let features = DenseTensor::concat(&[&current.features, &example], 0)
                    .inspect_err(|e| tracing::warn!(label, error = %e, "example rejected"))?;
                let labels = DenseTensor::concat(&[&current.labels, &y], 0)?;

                let superseded = self.examples.replace(Examples { features, labels });
                drop(superseded);
                drop(y);
                drop(example);

                tracing::debug!(label, rows = self.len(), "example appended");
            }
        }

        Ok(())
    }

    /// Release both tensors and return to the empty state
    pub fn reset(&mut self) {
        if let Some(examples) = self.examples.take() {
            tracing::debug!(rows = examples.features.shape()[0], "dataset reset");
        }
    }

    /// Number of classes labels are encoded against
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Number of example rows accumulated so far
    pub fn len(&self) -> usize {
        self.examples
            .as_ref()
            .map_or(0, |examples| examples.features.shape()[0])
    }

    /// Whether no example has been added
    pub fn is_empty(&self) -> bool {
        self.examples.is_none()
    }

    /// Current fill state
    pub fn state(&self) -> DatasetState {
        match self.len() {
            0 => DatasetState::Empty,
            n => DatasetState::NonEmpty(n),
        }
    }

    /// Accumulated features, `[N, ...feature_dims]`
    pub fn features(&self) -> Option<&DenseTensor<T>> {
        self.examples.as_ref().map(|examples| &examples.features)
    }

    /// Accumulated one-hot labels, `[N, num_classes]`
    pub fn labels(&self) -> Option<&DenseTensor<f32>> {
        self.examples.as_ref().map(|examples| &examples.labels)
    }

    /// Both tensors at once, as consumed by a training call
    pub fn training_batch(&self) -> Option<(&DenseTensor<T>, &DenseTensor<f32>)> {
        self.examples
            .as_ref()
            .map(|examples| (&examples.features, &examples.labels))
    }

    /// Shape of a single example without the batch dimension
    pub fn feature_shape(&self) -> Option<&[usize]> {
        self.features().map(|features| &features.shape()[1..])
    }

    /// Class of row `index`
    pub fn label_of(&self, index: usize) -> Result<usize> {
        let labels = self.labels().ok_or(Error::IndexOutOfBounds)?;
        let row = labels.row(index)?;
        row.iter()
            .position(|&v| v == 1.0)
            .ok_or_else(|| Error::InvalidArgument(format!("Row {index} is not one-hot")))
    }

    /// Bytes held by the features and labels tensors
    pub fn memory_usage(&self) -> usize {
        self.examples.as_ref().map_or(0, |examples| {
            examples.features.size_bytes() + examples.labels.size_bytes()
        })
    }
}
