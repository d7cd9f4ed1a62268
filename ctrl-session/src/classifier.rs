//! Trainable classifier head
//!
//! Two dense layers on top of the frozen activations: flatten, a ReLU hidden
//! layer with bias, and a softmax output layer without bias. Training only
//! ever touches these weights, which is what keeps the backbone frozen.

use ctrl_core::DenseTensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::Result;

/// Small dense classifier over flattened activations
#[derive(Debug, Clone)]
pub struct ClassifierHead {
    input_shape: Vec<usize>,
    input_dim: usize,
    hidden_units: usize,
    num_classes: usize,
    /// `[input_dim, hidden_units]`
    w1: Vec<f32>,
    /// `[hidden_units]`
    b1: Vec<f32>,
    /// `[hidden_units, num_classes]`
    w2: Vec<f32>,
}

/// Gradients of the loss with respect to each parameter group
#[derive(Debug, Clone)]
pub(crate) struct Gradients {
    pub w1: Vec<f32>,
    pub b1: Vec<f32>,
    pub w2: Vec<f32>,
}

struct Forward {
    /// Post-ReLU hidden activations, `[batch, hidden_units]`
    hidden: Vec<f32>,
    /// Softmax probabilities, `[batch, num_classes]`
    probs: Vec<f32>,
}

impl ClassifierHead {
    /// Create a head for activations of `input_shape` (without batch axis)
    ///
    /// Weights use fan-in variance scaling drawn from a seeded generator, so
    /// two heads built with the same seed are identical.
    pub fn new(
        input_shape: &[usize],
        hidden_units: usize,
        num_classes: usize,
        seed: u64,
    ) -> Result<Self> {
        let input_dim: usize = input_shape.iter().product();
        if input_dim == 0 || hidden_units == 0 || num_classes == 0 {
            return Err(ctrl_core::Error::InvalidArgument(format!(
                "head needs non-empty layers, got input {input_shape:?}, {hidden_units} hidden, {num_classes} classes"
            ))
            .into());
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let w1 = variance_scaling(&mut rng, input_dim, input_dim * hidden_units);
        let w2 = variance_scaling(&mut rng, hidden_units, hidden_units * num_classes);

        Ok(Self {
            input_shape: input_shape.to_vec(),
            input_dim,
            hidden_units,
            num_classes,
            w1,
            b1: vec![0.0; hidden_units],
            w2,
        })
    }

    /// Activation shape the head accepts (without batch axis)
    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    /// Number of output classes
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Total number of trainable parameters
    pub fn parameter_count(&self) -> usize {
        self.w1.len() + self.b1.len() + self.w2.len()
    }

    /// Class probabilities for a batch of activations, `[batch, num_classes]`
    pub fn predict_proba(&self, activations: &DenseTensor<f32>) -> Result<DenseTensor<f32>> {
        let batch = self.check_input(activations)?;
        let forward = self.forward(activations.as_slice(), batch);
        Ok(DenseTensor::from_vec_in(
            forward.probs,
            vec![batch, self.num_classes],
            activations.memory_pool(),
        )?)
    }

    /// Most probable class for a single activation
    pub fn predict(&self, activation: &DenseTensor<f32>) -> Result<usize> {
        let probs = self.predict_proba(activation)?;
        let first = probs.slice(&[0..1, 0..self.num_classes])?;
        first.argmax().ok_or_else(|| {
            ctrl_core::Error::InvalidArgument("cannot classify an empty batch".into()).into()
        })
    }

    /// Validate `[batch, ...input_shape]` and return the batch size
    pub(crate) fn check_input(&self, activations: &DenseTensor<f32>) -> Result<usize> {
        let shape = activations.shape();
        if shape.len() != self.input_shape.len() + 1 || shape[1..] != self.input_shape[..] {
            let mut expected = vec![shape.first().copied().unwrap_or(1)];
            expected.extend_from_slice(&self.input_shape);
            return Err(ctrl_core::Error::ShapeMismatch {
                expected,
                actual: shape.to_vec(),
            }
            .into());
        }
        Ok(shape[0])
    }

    fn forward(&self, x: &[f32], batch: usize) -> Forward {
        let (d, h, c) = (self.input_dim, self.hidden_units, self.num_classes);

        let mut hidden = vec![0.0f32; batch * h];
        for b in 0..batch {
            let row = &x[b * d..(b + 1) * d];
            let out = &mut hidden[b * h..(b + 1) * h];
            out.copy_from_slice(&self.b1);
            for (i, &xi) in row.iter().enumerate() {
                if xi == 0.0 {
                    continue;
                }
                let weights = &self.w1[i * h..(i + 1) * h];
                for (o, &w) in out.iter_mut().zip(weights) {
                    *o += xi * w;
                }
            }
            for o in out.iter_mut() {
                *o = o.max(0.0);
            }
        }

        let mut probs = vec![0.0f32; batch * c];
        for b in 0..batch {
            let hrow = &hidden[b * h..(b + 1) * h];
            let logits = &mut probs[b * c..(b + 1) * c];
            for (j, &hj) in hrow.iter().enumerate() {
                let weights = &self.w2[j * c..(j + 1) * c];
                for (z, &w) in logits.iter_mut().zip(weights) {
                    *z += hj * w;
                }
            }
            softmax_in_place(logits);
        }

        Forward { hidden, probs }
    }

    /// Mean categorical cross-entropy of a batch and its parameter gradients
    pub(crate) fn loss_and_gradients(&self, x: &[f32], y: &[f32], batch: usize) -> (f32, Gradients) {
        let (d, h, c) = (self.input_dim, self.hidden_units, self.num_classes);
        let forward = self.forward(x, batch);
        let loss = categorical_cross_entropy(&forward.probs, y, c);

        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / batch as f32;

        // Softmax + cross-entropy: dL/dz = (p - y) / batch
        let dz: Vec<f32> = forward
            .probs
            .iter()
            .zip(y)
            .map(|(p, t)| (p - t) * scale)
            .collect();

        let mut w2 = vec![0.0f32; h * c];
        let mut dh = vec![0.0f32; batch * h];
        for b in 0..batch {
            let hrow = &forward.hidden[b * h..(b + 1) * h];
            let dzrow = &dz[b * c..(b + 1) * c];
            for j in 0..h {
                let weights = &self.w2[j * c..(j + 1) * c];
                let grads = &mut w2[j * c..(j + 1) * c];
                let mut back = 0.0f32;
                for k in 0..c {
                    grads[k] += hrow[j] * dzrow[k];
                    back += dzrow[k] * weights[k];
                }
                // ReLU passes gradient only where the unit was active
                dh[b * h + j] = if hrow[j] > 0.0 { back } else { 0.0 };
            }
        }

        let mut w1 = vec![0.0f32; d * h];
        let mut b1 = vec![0.0f32; h];
        for b in 0..batch {
            let xrow = &x[b * d..(b + 1) * d];
            let dhrow = &dh[b * h..(b + 1) * h];
            for (bias, &g) in b1.iter_mut().zip(dhrow) {
                *bias += g;
            }
            for (i, &xi) in xrow.iter().enumerate() {
                if xi == 0.0 {
                    continue;
                }
                let grads = &mut w1[i * h..(i + 1) * h];
                for (gw, &g) in grads.iter_mut().zip(dhrow) {
                    *gw += xi * g;
                }
            }
        }

        (loss, Gradients { w1, b1, w2 })
    }

    /// Mutable parameter groups in the same order as [`Gradients`]
    pub(crate) fn parameters_mut(&mut self) -> [&mut [f32]; 3] {
        [
            self.w1.as_mut_slice(),
            self.b1.as_mut_slice(),
            self.w2.as_mut_slice(),
        ]
    }
}

/// Mean categorical cross-entropy between probability rows and one-hot rows
#[allow(clippy::cast_precision_loss)]
pub fn categorical_cross_entropy(probs: &[f32], targets: &[f32], num_classes: usize) -> f32 {
    const EPSILON: f32 = 1e-7;
    let rows = (targets.len() / num_classes.max(1)).max(1);
    let total: f32 = probs
        .iter()
        .zip(targets)
        .map(|(p, t)| -*t * p.clamp(EPSILON, 1.0 - EPSILON).ln())
        .sum();
    total / rows as f32
}

fn softmax_in_place(logits: &mut [f32]) {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for z in logits.iter_mut() {
        *z = (*z - max).exp();
        sum += *z;
    }
    for z in logits.iter_mut() {
        *z /= sum;
    }
}

#[allow(clippy::cast_precision_loss)]
fn variance_scaling(rng: &mut StdRng, fan_in: usize, count: usize) -> Vec<f32> {
    // Uniform with the variance of N(0, 1 / fan_in)
    let limit = (3.0 / fan_in as f32).sqrt();
    (0..count).map(|_| rng.random_range(-limit..limit)).collect()
}
