//! Frozen feature extraction
//!
//! The pretrained image model is an opaque collaborator: anything that maps a
//! `[1, size, size, 3]` image to a fixed-shape activation can drive a session.

use ctrl_core::DenseTensor;

use crate::error::{Error, Result};

/// A frozen image-to-embedding function
pub trait FeatureExtractor: Send {
    /// Compute the activation for a batched image; the output keeps the batch axis
    fn extract(&self, image: &DenseTensor<f32>) -> Result<DenseTensor<f32>>;

    /// Shape of one activation without the batch axis
    fn output_shape(&self) -> Vec<usize>;
}

/// Parameter-free embedding: average pooling onto a `grid x grid` map per channel
///
/// Usable where no pretrained network is wired in; its output plays the role
/// of the internal activation a pretrained backbone would produce.
#[derive(Debug, Clone)]
pub struct PoolingExtractor {
    grid: usize,
    channels: usize,
}

impl PoolingExtractor {
    /// Create an extractor producing `[grid, grid, channels]` activations
    pub fn new(grid: usize, channels: usize) -> Self {
        Self { grid, channels }
    }
}

impl FeatureExtractor for PoolingExtractor {
    #[allow(clippy::cast_precision_loss)]
    fn extract(&self, image: &DenseTensor<f32>) -> Result<DenseTensor<f32>> {
        let (batch, height, width) = match image.shape() {
            &[b, h, w, c] if c == self.channels => (b, h, w),
            shape => {
                return Err(Error::Capture(format!(
                    "expected [batch, height, width, {}] image, got {shape:?}",
                    self.channels
                )))
            }
        };
        if height < self.grid || width < self.grid {
            return Err(Error::Capture(format!(
                "image {height}x{width} is smaller than the {0}x{0} pooling grid",
                self.grid
            )));
        }

        let pixels = image.as_slice();
        let mut out = Vec::with_capacity(batch * self.grid * self.grid * self.channels);
        for b in 0..batch {
            for gy in 0..self.grid {
                let (y0, y1) = (gy * height / self.grid, (gy + 1) * height / self.grid);
                for gx in 0..self.grid {
                    let (x0, x1) = (gx * width / self.grid, (gx + 1) * width / self.grid);
                    let count = ((y1 - y0) * (x1 - x0)) as f32;
                    for c in 0..self.channels {
                        let mut sum = 0.0f32;
                        for y in y0..y1 {
                            for x in x0..x1 {
                                sum += pixels[((b * height + y) * width + x) * self.channels + c];
                            }
                        }
                        out.push(sum / count);
                    }
                }
            }
        }

        Ok(DenseTensor::from_vec_in(
            out,
            vec![batch, self.grid, self.grid, self.channels],
            image.memory_pool(),
        )?)
    }

    fn output_shape(&self) -> Vec<usize> {
        vec![self.grid, self.grid, self.channels]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pooling_averages_cells() {
        // 1x2x2x1 image pooled to a 1x1 grid
        let image = DenseTensor::from_vec(vec![1.0f32, 2.0, 3.0, 6.0], vec![1, 2, 2, 1]).unwrap();
        let extractor = PoolingExtractor::new(1, 1);
        let activation = extractor.extract(&image).unwrap();
        assert_eq!(activation.shape(), &[1, 1, 1, 1]);
        assert_relative_eq!(activation.as_slice()[0], 3.0);
    }

    #[test]
    fn test_pooling_keeps_channels_apart() {
        let mut data = Vec::new();
        for _ in 0..16 {
            data.extend_from_slice(&[0.5f32, -0.5, 1.0]);
        }
        let image = DenseTensor::from_vec(data, vec![1, 4, 4, 3]).unwrap();
        let extractor = PoolingExtractor::new(2, 3);
        let activation = extractor.extract(&image).unwrap();
        assert_eq!(activation.shape(), &[1, 2, 2, 3]);
        assert_eq!(extractor.output_shape(), vec![2, 2, 3]);
        assert_eq!(&activation.as_slice()[..3], &[0.5, -0.5, 1.0]);
    }

    #[test]
    fn test_rejects_wrong_channels_or_small_image() {
        let extractor = PoolingExtractor::new(4, 3);
        let gray = DenseTensor::<f32>::zeros(vec![1, 8, 8, 1]).unwrap();
        assert!(extractor.extract(&gray).is_err());
        let small = DenseTensor::<f32>::zeros(vec![1, 2, 2, 3]).unwrap();
        assert!(extractor.extract(&small).is_err());
    }
}
