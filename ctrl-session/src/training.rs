//! Training driver for the classifier head
//!
//! Reads the accumulated features and labels as one training set, picks a
//! batch size as a fraction of it, and runs Adam over shuffled mini-batches,
//! yielding to the scheduler after every batch.

use ctrl_core::{ControllerDataset, DenseTensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::classifier::ClassifierHead;
use crate::config::TrainingConfig;
use crate::error::{Error, Result};

/// Loss reported at the end of a mini-batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchLogs {
    /// Zero-based epoch
    pub epoch: usize,
    /// Zero-based batch within the epoch
    pub batch: usize,
    /// Mean loss over the batch
    pub loss: f32,
}

/// Losses recorded during a `fit` call
#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    /// Loss of every mini-batch in order
    pub batch_losses: Vec<f32>,
    /// Mean batch loss per epoch
    pub epoch_losses: Vec<f32>,
    /// Batch size that was used
    pub batch_size: usize,
}

impl TrainingHistory {
    /// Loss of the final epoch
    pub fn final_loss(&self) -> Option<f32> {
        self.epoch_losses.last().copied()
    }
}

/// Batch size for `examples` rows at `fraction` of the dataset
///
/// Fails with [`Error::InvalidBatchSize`] when `floor(examples * fraction)`
/// is zero or the fraction is not a finite positive number.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn batch_size(examples: usize, fraction: f64) -> Result<usize> {
    let size = (examples as f64 * fraction).floor();
    if !size.is_finite() || size < 1.0 {
        return Err(Error::InvalidBatchSize { examples, fraction });
    }
    Ok((size as usize).min(examples))
}

/// Adam optimiser state for the head's parameter groups
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: i32,
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
}

impl Adam {
    /// Create an optimiser with the usual moment decay rates
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            step: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Apply one update to `params` given matching `grads`
    pub fn step(&mut self, params: [&mut [f32]; 3], grads: [&[f32]; 3]) {
        if self.m.is_empty() {
            self.m = grads.iter().map(|g| vec![0.0; g.len()]).collect();
            self.v = grads.iter().map(|g| vec![0.0; g.len()]).collect();
        }
        self.step += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step);
        let bias2 = 1.0 - self.beta2.powi(self.step);

        for (group, (param, grad)) in params.into_iter().zip(grads).enumerate() {
            let m = &mut self.m[group];
            let v = &mut self.v[group];
            for i in 0..param.len() {
                let g = grad[i];
                m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g;
                v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g * g;
                let m_hat = m[i] / bias1;
                let v_hat = v[i] / bias2;
                param[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
            }
        }
    }
}

/// Train `head` on aligned `features` / `labels`
///
/// Rows are reshuffled every epoch; `on_batch_end` sees the loss of every
/// mini-batch, after which control is yielded to the scheduler.
pub async fn fit<F>(
    head: &mut ClassifierHead,
    features: &DenseTensor<f32>,
    labels: &DenseTensor<f32>,
    config: &TrainingConfig,
    mut on_batch_end: F,
) -> Result<TrainingHistory>
where
    F: FnMut(&BatchLogs),
{
    let examples = head.check_input(features)?;
    if examples == 0 {
        return Err(Error::EmptyDataset);
    }
    let num_classes = head.num_classes();
    if labels.shape() != [examples, num_classes] {
        return Err(ctrl_core::Error::ShapeMismatch {
            expected: vec![examples, num_classes],
            actual: labels.shape().to_vec(),
        }
        .into());
    }

    let batch_size = batch_size(examples, config.batch_size_fraction)?;
    let feature_len = features.len() / examples;
    let x = features.as_slice();
    let y = labels.as_slice();

    tracing::info!(
        examples,
        batch_size,
        epochs = config.epochs,
        learning_rate = config.learning_rate,
        "training head"
    );

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut optimizer = Adam::new(config.learning_rate);
    let mut order: Vec<usize> = (0..examples).collect();
    let mut history = TrainingHistory {
        batch_size,
        ..TrainingHistory::default()
    };

    let mut batch_x = Vec::with_capacity(batch_size * feature_len);
    let mut batch_y = Vec::with_capacity(batch_size * num_classes);

    for epoch in 0..config.epochs {
        order.shuffle(&mut rng);
        let mut epoch_loss = 0.0f32;
        let mut batches = 0usize;

        for (batch, indices) in order.chunks(batch_size).enumerate() {
            batch_x.clear();
            batch_y.clear();
            for &row in indices {
                batch_x.extend_from_slice(&x[row * feature_len..(row + 1) * feature_len]);
                batch_y.extend_from_slice(&y[row * num_classes..(row + 1) * num_classes]);
            }

            let (loss, grads) = head.loss_and_gradients(&batch_x, &batch_y, indices.len());
            optimizer.step(head.parameters_mut(), [&grads.w1, &grads.b1, &grads.w2]);

            let logs = BatchLogs { epoch, batch, loss };
            tracing::trace!(epoch, batch, loss, "batch end");
            on_batch_end(&logs);
            history.batch_losses.push(loss);
            epoch_loss += loss;
            batches += 1;

            tokio::task::yield_now().await;
        }

        #[allow(clippy::cast_precision_loss)]
        let mean = epoch_loss / batches as f32;
        tracing::debug!(epoch = epoch + 1, loss = mean, "epoch end");
        history.epoch_losses.push(mean);
    }

    if let Some(loss) = history.final_loss() {
        tracing::info!(loss, "training finished");
    }
    Ok(history)
}

/// Train `head` on everything accumulated in `dataset`
///
/// Fails with [`Error::EmptyDataset`] if no example has been added.
pub async fn fit_dataset<F>(
    head: &mut ClassifierHead,
    dataset: &ControllerDataset<f32>,
    config: &TrainingConfig,
    on_batch_end: F,
) -> Result<TrainingHistory>
where
    F: FnMut(&BatchLogs),
{
    let (features, labels) = dataset.training_batch().ok_or(Error::EmptyDataset)?;
    fit(head, features, labels, config, on_batch_end).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case(100, 0.05, 5 ; "default fraction")]
    #[test_case(39, 0.05, 1 ; "rounds down")]
    #[test_case(4, 1.0, 4 ; "whole dataset")]
    fn test_batch_size(examples: usize, fraction: f64, expected: usize) {
        assert_eq!(batch_size(examples, fraction).unwrap(), expected);
    }

    #[test_case(19, 0.05 ; "rounds to zero")]
    #[test_case(10, 0.0 ; "zero fraction")]
    #[test_case(10, f64::NAN ; "nan fraction")]
    fn test_invalid_batch_size(examples: usize, fraction: f64) {
        assert!(matches!(
            batch_size(examples, fraction),
            Err(Error::InvalidBatchSize { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_batch_size_is_floor_of_fraction(
            examples in 1usize..2000,
            fraction in 0.001f64..=1.0,
        ) {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
            let expected = (examples as f64 * fraction).floor() as usize;
            match batch_size(examples, fraction) {
                Ok(size) => {
                    prop_assert_eq!(size, expected);
                    prop_assert!((1..=examples).contains(&size));
                }
                Err(Error::InvalidBatchSize { .. }) => prop_assert_eq!(expected, 0),
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
        }

        #[test]
        fn prop_history_covers_every_batch(
            examples in 2usize..20,
            fraction in 0.1f64..=1.0,
            epochs in 1usize..4,
        ) {
            let Ok(size) = batch_size(examples, fraction) else {
                return Ok(());
            };
            let mut dataset = ControllerDataset::new(2).unwrap();
            for i in 0..examples {
                #[allow(clippy::cast_precision_loss)]
                let row = vec![i as f32, 1.0];
                dataset
                    .add_example(DenseTensor::from_vec(row, vec![1, 2]).unwrap(), i % 2)
                    .unwrap();
            }
            let mut head = ClassifierHead::new(&[2], 3, 2, 1).unwrap();
            let config = TrainingConfig::new()
                .epochs(epochs)
                .batch_size_fraction(fraction);

            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let history = runtime
                .block_on(fit_dataset(&mut head, &dataset, &config, |_| {}))
                .unwrap();

            prop_assert_eq!(history.batch_size, size);
            prop_assert_eq!(history.epoch_losses.len(), epochs);
            prop_assert_eq!(history.batch_losses.len(), epochs * examples.div_ceil(size));
        }
    }

    fn separable_dataset() -> ControllerDataset<f32> {
        let mut dataset = ControllerDataset::new(2).unwrap();
        for i in 0..8 {
            let label = i % 2;
            let jitter = 0.05 * (i / 2) as f32;
            let row = if label == 0 {
                vec![1.0 + jitter, 0.0, 1.0, 0.0]
            } else {
                vec![0.0, 1.0, 0.0, 1.0 - jitter]
            };
            let example = DenseTensor::from_vec(row, vec![1, 4]).unwrap();
            dataset.add_example(example, label).unwrap();
        }
        dataset
    }

    #[tokio::test]
    async fn test_fit_learns_separable_classes() {
        let dataset = separable_dataset();
        let mut head = ClassifierHead::new(&[4], 8, 2, 3).unwrap();
        let config = TrainingConfig::new()
            .learning_rate(0.05)
            .epochs(50)
            .batch_size_fraction(0.25);

        let mut seen = 0usize;
        let history = fit_dataset(&mut head, &dataset, &config, |_| seen += 1)
            .await
            .unwrap();

        assert_eq!(history.batch_size, 2);
        assert_eq!(seen, 50 * 4);
        assert_eq!(history.epoch_losses.len(), 50);
        assert!(history.final_loss().unwrap() < history.epoch_losses[0]);

        let a = DenseTensor::from_vec(vec![1.0f32, 0.0, 1.0, 0.0], vec![1, 4]).unwrap();
        let b = DenseTensor::from_vec(vec![0.0f32, 1.0, 0.0, 1.0], vec![1, 4]).unwrap();
        assert_eq!(head.predict(&a).unwrap(), 0);
        assert_eq!(head.predict(&b).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fit_empty_dataset() {
        let dataset = ControllerDataset::new(2).unwrap();
        let mut head = ClassifierHead::new(&[4], 8, 2, 3).unwrap();
        let err = fit_dataset(&mut head, &dataset, &TrainingConfig::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyDataset));
    }

    #[tokio::test]
    async fn test_fit_small_dataset_default_fraction() {
        let dataset = separable_dataset();
        let mut head = ClassifierHead::new(&[4], 8, 2, 3).unwrap();
        let err = fit_dataset(&mut head, &dataset, &TrainingConfig::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidBatchSize { examples: 8, .. }
        ));
    }

    #[tokio::test]
    async fn test_fit_rejects_feature_shape_of_other_head() {
        let dataset = separable_dataset();
        let mut head = ClassifierHead::new(&[5], 8, 2, 3).unwrap();
        let err = fit_dataset(&mut head, &dataset, &TrainingConfig::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Core(ctrl_core::Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_adam_moves_against_gradient() {
        let mut a = vec![1.0f32];
        let mut b = vec![0.0f32];
        let mut c = vec![-1.0f32];
        let mut adam = Adam::new(0.1);
        adam.step([&mut a, &mut b, &mut c], [&[1.0], &[0.0], &[-1.0]]);
        assert!(a[0] < 1.0);
        assert!((b[0]).abs() < f32::EPSILON);
        assert!(c[0] > -1.0);
    }
}
