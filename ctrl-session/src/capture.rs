//! Frame sources and the capture pipeline
//!
//! A frame is an `[height, width, 3]` tensor of `u8` pixels. [`capture`]
//! turns the next frame of a source into a model input: the centred square
//! crop, with a batch axis, scaled to roughly `[-1, 1]`. Intermediate tensors
//! live only inside the call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ctrl_core::budget::MemoryPool;
use ctrl_core::DenseTensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};

/// Channels per pixel
pub const CHANNELS: usize = 3;

/// A source of camera frames
pub trait FrameSource: Send {
    /// Read the current frame as `[height, width, 3]`
    fn next_frame(&mut self) -> Result<DenseTensor<u8>>;

    /// Frame dimensions as `(height, width)`
    fn dimensions(&self) -> (usize, usize);
}

/// Read a frame and turn it into a normalised `[1, size, size, 3]` input
pub fn capture(source: &mut dyn FrameSource) -> Result<DenseTensor<f32>> {
    capture_in(source, None)
}

/// Like [`capture`], with the model input accounted in `pool`
pub fn capture_in(
    source: &mut dyn FrameSource,
    pool: Option<Arc<dyn MemoryPool>>,
) -> Result<DenseTensor<f32>> {
    let frame = source.next_frame()?;
    let cropped = crop_center_square(&frame)?;
    let pixels = cropped.as_slice().iter().copied().map(normalise).collect();
    let mut shape = vec![1];
    shape.extend_from_slice(cropped.shape());
    Ok(DenseTensor::from_vec_in(pixels, shape, pool)?)
}

fn normalise(px: u8) -> f32 {
    f32::from(px) / 127.0 - 1.0
}

/// Crop the centred square of side `min(height, width)`
pub fn crop_center_square(frame: &DenseTensor<u8>) -> Result<DenseTensor<u8>> {
    let (height, width) = frame_dimensions(frame)?;
    let size = height.min(width);
    let top = (height - size) / 2;
    let left = (width - size) / 2;
    Ok(frame.slice(&[top..top + size, left..left + size, 0..CHANNELS])?)
}

fn frame_dimensions(frame: &DenseTensor<u8>) -> Result<(usize, usize)> {
    match frame.shape() {
        [height, width, CHANNELS] => Ok((*height, *width)),
        shape => Err(Error::Capture(format!(
            "expected [height, width, {CHANNELS}] frame, got {shape:?}"
        ))),
    }
}

/// Displayed size of the video element
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplaySize {
    /// Displayed width
    pub width: f64,
    /// Displayed height
    pub height: f64,
}

/// Grow the display so a centred square crop contains no whitespace
///
/// Landscape video widens the element, portrait video makes it taller,
/// both preserving the video's aspect ratio.
#[allow(clippy::cast_precision_loss)]
pub fn adjust_video_size(video_width: usize, video_height: usize, display: &mut DisplaySize) {
    if video_height == 0 {
        return;
    }
    let aspect_ratio = video_width as f64 / video_height as f64;
    if video_width >= video_height {
        display.width = aspect_ratio * display.height;
    } else {
        display.height = display.width / aspect_ratio;
    }
}

/// Frame source that cycles through preloaded frames
#[derive(Debug)]
pub struct MemoryFrameSource {
    frames: Vec<DenseTensor<u8>>,
    position: usize,
}

impl MemoryFrameSource {
    /// Create a source over `frames`; all must share one shape
    pub fn new(frames: Vec<DenseTensor<u8>>) -> Result<Self> {
        let first = frames
            .first()
            .ok_or_else(|| Error::Capture("memory source needs at least one frame".into()))?;
        frame_dimensions(first)?;
        if frames.iter().any(|f| f.shape() != first.shape()) {
            return Err(Error::Capture("frames differ in shape".into()));
        }
        Ok(Self {
            frames,
            position: 0,
        })
    }

    /// Source that returns a single uniform frame forever
    pub fn uniform(height: usize, width: usize, value: u8) -> Result<Self> {
        let frame = DenseTensor::from_vec(
            vec![value; height * width * CHANNELS],
            vec![height, width, CHANNELS],
        )?;
        Self::new(vec![frame])
    }
}

impl FrameSource for MemoryFrameSource {
    fn next_frame(&mut self) -> Result<DenseTensor<u8>> {
        let frame = self.frames[self.position].clone();
        self.position = (self.position + 1) % self.frames.len();
        Ok(frame)
    }

    fn dimensions(&self) -> (usize, usize) {
        let shape = self.frames[0].shape();
        (shape[0], shape[1])
    }
}

/// Renders a distinct noisy pattern for whichever pose is currently held
///
/// Stands in for a camera in the demo: the pose handle plays the role of the
/// person in front of the lens.
#[derive(Debug)]
pub struct SyntheticFrameSource {
    height: usize,
    width: usize,
    pose: Arc<AtomicUsize>,
    rng: StdRng,
}

impl SyntheticFrameSource {
    /// Create a synthetic camera of the given size
    pub fn new(height: usize, width: usize, seed: u64) -> Self {
        Self {
            height,
            width,
            pose: Arc::new(AtomicUsize::new(0)),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Shared handle used to change the pose while the source is in use
    pub fn pose_handle(&self) -> Arc<AtomicUsize> {
        self.pose.clone()
    }
}

impl FrameSource for SyntheticFrameSource {
    fn next_frame(&mut self) -> Result<DenseTensor<u8>> {
        let pose = self.pose.load(Ordering::Relaxed);
        let mut data = Vec::with_capacity(self.height * self.width * CHANNELS);
        for y in 0..self.height {
            for x in 0..self.width {
                // Each pose lights up a different quadrant
                let quadrant = usize::from(y * 2 >= self.height) * 2 + usize::from(x * 2 >= self.width);
                let base: u8 = if quadrant == pose % 4 { 200 } else { 40 };
                for channel in 0..CHANNELS {
                    let tint = if channel == pose % CHANNELS { 30 } else { 0 };
                    let noise: u8 = self.rng.random_range(0..16);
                    data.push(base.saturating_add(tint).saturating_add(noise));
                }
            }
        }
        Ok(DenseTensor::from_vec(
            data,
            vec![self.height, self.width, CHANNELS],
        )?)
    }

    fn dimensions(&self) -> (usize, usize) {
        (self.height, self.width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp_frame(height: usize, width: usize) -> DenseTensor<u8> {
        let mut data = Vec::new();
        for y in 0..height {
            for x in 0..width {
                for _ in 0..CHANNELS {
                    data.push(u8::try_from(y * 10 + x).unwrap());
                }
            }
        }
        DenseTensor::from_vec(data, vec![height, width, CHANNELS]).unwrap()
    }

    #[test]
    fn test_crop_landscape_takes_center_columns() {
        let frame = ramp_frame(2, 4);
        let cropped = crop_center_square(&frame).unwrap();
        assert_eq!(cropped.shape(), &[2, 2, 3]);
        assert_eq!(cropped.get(&[0, 0, 0]).unwrap(), 1);
        assert_eq!(cropped.get(&[1, 1, 2]).unwrap(), 12);
    }

    #[test]
    fn test_crop_portrait_takes_center_rows() {
        let frame = ramp_frame(4, 2);
        let cropped = crop_center_square(&frame).unwrap();
        assert_eq!(cropped.shape(), &[2, 2, 3]);
        assert_eq!(cropped.get(&[0, 0, 0]).unwrap(), 10);
    }

    #[test]
    fn test_capture_normalises_and_batches() {
        let mut source = MemoryFrameSource::uniform(4, 6, 254).unwrap();
        let image = capture(&mut source).unwrap();
        assert_eq!(image.shape(), &[1, 4, 4, 3]);
        assert!(image.as_slice().iter().all(|&v| (v - 1.0).abs() < 1e-6));

        let mut dark = MemoryFrameSource::uniform(2, 2, 0).unwrap();
        let image = capture(&mut dark).unwrap();
        assert_relative_eq!(image.as_slice()[0], -1.0);
    }

    #[test]
    fn test_capture_in_pool_matches_capture() {
        use ctrl_core::budget::TrackingMemoryPool;

        let pool = Arc::new(TrackingMemoryPool::new());
        let mut source = MemoryFrameSource::uniform(3, 5, 100).unwrap();
        let pooled = capture_in(&mut source, Some(pool.clone())).unwrap();
        let plain = capture(&mut source).unwrap();

        assert_eq!(pooled, plain);
        assert_eq!(pool.usage_stats().allocation_count, 1);
        drop(pooled);
        assert_eq!(pool.usage_stats().allocation_count, 0);
    }

    #[test]
    fn test_bad_frame_shape_rejected() {
        let frame = DenseTensor::from_vec(vec![0u8; 8], vec![2, 4]).unwrap();
        assert!(matches!(MemoryFrameSource::new(vec![frame]), Err(Error::Capture(_))));
        assert!(matches!(MemoryFrameSource::new(Vec::new()), Err(Error::Capture(_))));
    }

    #[test]
    fn test_memory_source_cycles() {
        let a = DenseTensor::from_vec(vec![1u8; 3], vec![1, 1, 3]).unwrap();
        let b = DenseTensor::from_vec(vec![2u8; 3], vec![1, 1, 3]).unwrap();
        let mut source = MemoryFrameSource::new(vec![a, b]).unwrap();
        let seen: Vec<u8> = (0..3).map(|_| source.next_frame().unwrap().as_slice()[0]).collect();
        assert_eq!(seen, vec![1, 2, 1]);
        assert_eq!(source.dimensions(), (1, 1));
    }

    #[test]
    fn test_adjust_video_size() {
        let mut display = DisplaySize { width: 224.0, height: 224.0 };
        adjust_video_size(640, 480, &mut display);
        assert_relative_eq!(display.width, 224.0 * 640.0 / 480.0);
        assert_relative_eq!(display.height, 224.0);

        let mut display = DisplaySize { width: 224.0, height: 224.0 };
        adjust_video_size(480, 640, &mut display);
        assert_relative_eq!(display.width, 224.0);
        assert_relative_eq!(display.height, 224.0 * 640.0 / 480.0);
    }

    #[test]
    fn test_synthetic_source_follows_pose() {
        let mut source = SyntheticFrameSource::new(8, 8, 7);
        let pose = source.pose_handle();

        pose.store(0, Ordering::Relaxed);
        let top_left = source.next_frame().unwrap();
        pose.store(3, Ordering::Relaxed);
        let bottom_right = source.next_frame().unwrap();

        assert!(top_left.get(&[0, 0, 1]).unwrap() >= 200);
        assert!(top_left.get(&[7, 7, 1]).unwrap() < 100);
        assert!(bottom_right.get(&[7, 7, 1]).unwrap() >= 200);
    }
}
