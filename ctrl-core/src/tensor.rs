//! Dense tensors over reference-counted buffers
//!
//! Every operation that produces data writes a fresh buffer; no operation
//! mutates an existing one. Results are accounted in the memory pool of the
//! (first) input tensor so temporaries and their replacements show up in the
//! same pool statistics.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ops::Range;
use std::sync::Arc;

use bytemuck::Pod;

use crate::buffer::{Buffer, BUFFER_ALIGNMENT};
use crate::error::{Error, Result};
use crate::memory::MemoryPool;

/// Trait for types that can be used in tensors
pub trait TensorType: Pod + Send + Sync + 'static {}

impl<T: Pod + Send + Sync + 'static> TensorType for T {}

/// A dense, contiguous, row-major multidimensional tensor
#[derive(Clone)]
pub struct DenseTensor<T: TensorType> {
    /// Underlying storage, shared between clones and reshaped views
    buffer: Buffer,

    /// Shape of the tensor (dimensions)
    shape: Vec<usize>,

    /// Phantom data for the element type
    _phantom: PhantomData<T>,
}

impl<T: TensorType> DenseTensor<T> {
    /// Create a zero-filled tensor with the given shape
    pub fn zeros(shape: Vec<usize>) -> Result<Self> {
        Self::zeros_in(shape, None)
    }

    /// Create a zero-filled tensor accounted in `pool`
    pub fn zeros_in(shape: Vec<usize>, pool: Option<Arc<dyn MemoryPool>>) -> Result<Self> {
        Self::check_alignment()?;
        let size: usize = shape.iter().product();
        let buffer = Buffer::zeroed(size * size_of::<T>(), pool)?;
        Ok(Self::wrap(buffer, shape))
    }

    /// Create a tensor from a slice
    pub fn from_slice(data: &[T], shape: Vec<usize>) -> Result<Self> {
        Self::from_slice_in(data, shape, None)
    }

    /// Create a tensor from a slice, accounted in `pool`
    pub fn from_slice_in(
        data: &[T],
        shape: Vec<usize>,
        pool: Option<Arc<dyn MemoryPool>>,
    ) -> Result<Self> {
        let expected_size: usize = shape.iter().product();
        if data.len() != expected_size {
            return Err(Error::InvalidArgument(format!(
                "Slice length {} does not match shape product {}",
                data.len(),
                expected_size
            )));
        }

        let buffer = Buffer::from_slice_in(data, pool)?;
        Ok(Self::wrap(buffer, shape))
    }

    /// Create a tensor from a vector
    pub fn from_vec(data: Vec<T>, shape: Vec<usize>) -> Result<Self> {
        Self::from_slice(&data, shape)
    }

    /// Create a tensor from a vector, accounted in `pool`
    pub fn from_vec_in(
        data: Vec<T>,
        shape: Vec<usize>,
        pool: Option<Arc<dyn MemoryPool>>,
    ) -> Result<Self> {
        Self::from_slice_in(&data, shape, pool)
    }

    /// Interpret an existing buffer as a tensor of the given shape
    pub fn from_buffer(buffer: Buffer, shape: Vec<usize>) -> Result<Self> {
        Self::check_alignment()?;
        let elements = buffer.typed_slice::<T>()?.len();
        let expected_size: usize = shape.iter().product();
        if elements != expected_size {
            return Err(Error::InvalidArgument(format!(
                "Buffer holds {elements} elements, shape {shape:?} needs {expected_size}"
            )));
        }
        Ok(Self::wrap(buffer, shape))
    }

    fn wrap(buffer: Buffer, shape: Vec<usize>) -> Self {
        Self {
            buffer,
            shape,
            _phantom: PhantomData,
        }
    }

    fn check_alignment() -> Result<()> {
        if align_of::<T>() > BUFFER_ALIGNMENT || size_of::<T>() == 0 {
            return Err(Error::LayoutError(format!(
                "unsupported tensor element type {}",
                std::any::type_name::<T>()
            )));
        }
        Ok(())
    }

    /// Get the shape of this tensor
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the size of one dimension
    pub fn dim(&self, axis: usize) -> Result<usize> {
        self.shape.get(axis).copied().ok_or(Error::IndexOutOfBounds)
    }

    /// Get the number of dimensions in this tensor
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get the total number of elements in this tensor
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Check if this tensor is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element strides of this tensor
    pub fn strides(&self) -> Vec<usize> {
        compute_strides(&self.shape)
    }

    /// Calculate the size in bytes of this tensor
    pub fn size_bytes(&self) -> usize {
        self.len() * size_of::<T>()
    }

    /// Get the underlying buffer
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Get the memory pool this tensor is accounted in
    pub fn memory_pool(&self) -> Option<Arc<dyn MemoryPool>> {
        self.buffer.memory_pool().cloned()
    }

    /// Get the elements in row-major order
    pub fn as_slice(&self) -> &[T] {
        // Element alignment and buffer length were validated on construction
        bytemuck::cast_slice(self.buffer.as_bytes())
    }

    /// Copy the elements into a vector
    pub fn to_vec(&self) -> Vec<T> {
        self.as_slice().to_vec()
    }

    /// Get row `index` along axis 0 as a flat slice
    pub fn row(&self, index: usize) -> Result<&[T]> {
        let rows = self.dim(0)?;
        if index >= rows {
            return Err(Error::IndexOutOfBounds);
        }
        let row_len = self.shape[1..].iter().product::<usize>();
        Ok(&self.as_slice()[index * row_len..(index + 1) * row_len])
    }

    /// Get the value at the specified indices
    pub fn get(&self, indices: &[usize]) -> Result<T> {
        if indices.len() != self.shape.len() {
            return Err(Error::InvalidArgument(
                "Number of indices must match number of dimensions".into(),
            ));
        }

        if indices.iter().zip(&self.shape).any(|(&idx, &dim)| idx >= dim) {
            return Err(Error::IndexOutOfBounds);
        }

        let offset: usize = indices
            .iter()
            .zip(self.strides())
            .map(|(idx, stride)| idx * stride)
            .sum();

        Ok(self.as_slice()[offset])
    }

    /// Reshape this tensor to a new shape without copying
    pub fn reshape(&self, new_shape: Vec<usize>) -> Result<Self> {
        let new_size: usize = new_shape.iter().product();
        if new_size != self.len() {
            return Err(Error::InvalidArgument(format!(
                "Cannot reshape tensor of size {} to size {}",
                self.len(),
                new_size
            )));
        }

        Ok(Self::wrap(self.buffer.clone(), new_shape))
    }

    /// Insert a dimension of size 1 at `axis` without copying
    pub fn expand_dims(&self, axis: usize) -> Result<Self> {
        if axis > self.ndim() {
            return Err(Error::InvalidArgument(format!(
                "Axis {axis} out of range for tensor of rank {}",
                self.ndim()
            )));
        }
        let mut shape = self.shape.clone();
        shape.insert(axis, 1);
        self.reshape(shape)
    }

    /// Copy out the sub-tensor selected by `ranges`, one range per dimension
    pub fn slice(&self, ranges: &[Range<usize>]) -> Result<Self> {
        if ranges.len() != self.shape.len() {
            return Err(Error::InvalidArgument(
                "Number of ranges must match number of dimensions".into(),
            ));
        }

        for (range, &dim) in ranges.iter().zip(&self.shape) {
            if range.start > range.end || range.end > dim {
                return Err(Error::IndexOutOfBounds);
            }
        }

        let new_shape: Vec<usize> = ranges.iter().map(|r| r.end - r.start).collect();
        let new_size: usize = new_shape.iter().product();
        let src_strides = self.strides();
        let src = self.as_slice();

        let mut data = Vec::with_capacity(new_size);
        let mut index = vec![0usize; new_shape.len()];
        for _ in 0..new_size {
            let offset: usize = index
                .iter()
                .zip(ranges)
                .zip(&src_strides)
                .map(|((i, range), stride)| (range.start + i) * stride)
                .sum();
            data.push(src[offset]);

            // Advance the odometer, last dimension fastest
            for axis in (0..index.len()).rev() {
                index[axis] += 1;
                if index[axis] < new_shape[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }

        Self::from_vec_in(data, new_shape, self.memory_pool())
    }

    /// Apply `f` to every element, producing a new tensor of the same shape
    pub fn map<U: TensorType>(&self, f: impl Fn(T) -> U) -> Result<DenseTensor<U>> {
        let data: Vec<U> = self.as_slice().iter().map(|&x| f(x)).collect();
        DenseTensor::from_vec_in(data, self.shape.clone(), self.memory_pool())
    }

    /// Concatenate tensors along `axis`
    ///
    /// All parts must have the same rank and agree on every dimension except
    /// `axis`; otherwise the call fails with [`Error::ShapeMismatch`]. The
    /// inputs are left untouched and the result is a new buffer in the pool
    /// of the first part.
    pub fn concat(parts: &[&DenseTensor<T>], axis: usize) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| Error::InvalidArgument("Cannot concatenate zero tensors".into()))?;

        if axis >= first.ndim() {
            return Err(Error::InvalidArgument(format!(
                "Axis {axis} out of range for tensor of rank {}",
                first.ndim()
            )));
        }

        for part in &parts[1..] {
            let compatible = part.ndim() == first.ndim()
                && part
                    .shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !compatible {
                return Err(Error::shape_mismatch(&first.shape, &part.shape));
            }
        }

        let mut new_shape = first.shape.clone();
        new_shape[axis] = parts.iter().map(|p| p.shape[axis]).sum();

        let outer: usize = first.shape[..axis].iter().product();
        let inner: usize = first.shape[axis + 1..].iter().product();

        let mut data = Vec::with_capacity(new_shape.iter().product());
        for block in 0..outer {
            for part in parts {
                let chunk = part.shape[axis] * inner;
                data.extend_from_slice(&part.as_slice()[block * chunk..(block + 1) * chunk]);
            }
        }

        Self::from_vec_in(data, new_shape, first.memory_pool())
    }
}

impl DenseTensor<f32> {
    /// One-hot encode `indices` into a `[indices.len(), depth]` tensor
    ///
    /// Fails with [`Error::LabelOutOfRange`] if any index is not below `depth`.
    pub fn one_hot(
        indices: &[usize],
        depth: usize,
        pool: Option<Arc<dyn MemoryPool>>,
    ) -> Result<Self> {
        if depth == 0 {
            return Err(Error::InvalidArgument("One-hot depth must be positive".into()));
        }

        let mut data = vec![0.0f32; indices.len() * depth];
        for (row, &index) in indices.iter().enumerate() {
            if index >= depth {
                return Err(Error::LabelOutOfRange {
                    label: index,
                    num_classes: depth,
                });
            }
            data[row * depth + index] = 1.0;
        }

        Self::from_vec_in(data, vec![indices.len(), depth], pool)
    }
}

impl<T: TensorType + PartialOrd> DenseTensor<T> {
    /// Index of the largest element in row-major order (first wins on ties)
    pub fn argmax(&self) -> Option<usize> {
        let data = self.as_slice();
        let mut best: Option<usize> = None;
        for (i, value) in data.iter().enumerate() {
            match best {
                Some(b) if data[b] >= *value => {}
                _ => best = Some(i),
            }
        }
        best
    }
}

/// Row-major element strides for `shape`
fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; shape.len()];
    let mut stride = 1;
    for i in (0..shape.len()).rev() {
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}

impl<T: TensorType + PartialEq> PartialEq for DenseTensor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.as_slice() == other.as_slice()
    }
}

impl<T: TensorType + fmt::Debug> fmt::Debug for DenseTensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DenseTensor<{}>{{ shape: {:?}, size: {} }}",
            std::any::type_name::<T>(),
            self.shape,
            self.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::TrackingMemoryPool;
    use test_case::test_case;

    fn arange(shape: Vec<usize>) -> DenseTensor<f32> {
        let n: usize = shape.iter().product();
        #[allow(clippy::cast_precision_loss)]
        let data: Vec<f32> = (0..n).map(|i| i as f32).collect();
        DenseTensor::from_vec(data, shape).unwrap()
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        let err = DenseTensor::from_slice(&[1.0f32, 2.0], vec![3]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_get_and_row() {
        let t = arange(vec![2, 3]);
        assert_eq!(t.get(&[1, 2]).unwrap(), 5.0);
        assert_eq!(t.row(1).unwrap(), &[3.0, 4.0, 5.0]);
        assert_eq!(t.row(2), Err(Error::IndexOutOfBounds));
        assert_eq!(t.get(&[2, 0]), Err(Error::IndexOutOfBounds));
    }

    #[test]
    fn test_concat_axis0_appends_rows() {
        let a = arange(vec![2, 3]);
        let b = DenseTensor::from_slice(&[9.0f32, 9.0, 9.0], vec![1, 3]).unwrap();
        let c = DenseTensor::concat(&[&a, &b], 0).unwrap();

        assert_eq!(c.shape(), &[3, 3]);
        assert_eq!(c.to_vec(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 9.0, 9.0, 9.0]);
        // Inputs are untouched and not aliased
        assert_eq!(a.shape(), &[2, 3]);
        assert!(!c.buffer().ptr_eq(a.buffer()));
    }

    #[test]
    fn test_concat_axis1_interleaves_blocks() {
        let a = arange(vec![2, 2]);
        let b = DenseTensor::from_slice(&[10.0f32, 11.0], vec![2, 1]).unwrap();
        let c = DenseTensor::concat(&[&a, &b], 1).unwrap();

        assert_eq!(c.shape(), &[2, 3]);
        assert_eq!(c.to_vec(), vec![0.0, 1.0, 10.0, 2.0, 3.0, 11.0]);
    }

    #[test_case(vec![1, 4] ; "different trailing dimension")]
    #[test_case(vec![1, 3, 1] ; "different rank")]
    #[test_case(vec![3] ; "lower rank")]
    fn test_concat_shape_mismatch(shape: Vec<usize>) {
        let a = arange(vec![2, 3]);
        let b = DenseTensor::<f32>::zeros(shape.clone()).unwrap();
        let err = DenseTensor::concat(&[&a, &b], 0).unwrap_err();
        assert_eq!(
            err,
            Error::ShapeMismatch {
                expected: vec![2, 3],
                actual: shape
            }
        );
    }

    #[test]
    fn test_concat_allocates_in_first_pool() {
        let pool = Arc::new(TrackingMemoryPool::new());
        let a = DenseTensor::from_slice_in(&[1.0f32; 4], vec![2, 2], Some(pool.clone())).unwrap();
        let b = DenseTensor::from_slice(&[2.0f32; 2], vec![1, 2]).unwrap();
        let c = DenseTensor::concat(&[&a, &b], 0).unwrap();

        let stats = pool.usage_stats();
        assert_eq!(stats.allocation_count, 2);
        assert_eq!(stats.current_bytes, a.size_bytes() + c.size_bytes());
    }

    #[test]
    fn test_one_hot() {
        let y = DenseTensor::one_hot(&[2, 0], 4, None).unwrap();
        assert_eq!(y.shape(), &[2, 4]);
        assert_eq!(y.to_vec(), vec![0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test_case(4, 4 ; "equal to depth")]
    #[test_case(5, 4 ; "above depth")]
    fn test_one_hot_out_of_range(label: usize, depth: usize) {
        let err = DenseTensor::one_hot(&[label], depth, None).unwrap_err();
        assert_eq!(
            err,
            Error::LabelOutOfRange {
                label,
                num_classes: depth
            }
        );
    }

    #[test]
    fn test_reshape_shares_buffer() {
        let t = arange(vec![2, 3]);
        let r = t.reshape(vec![3, 2]).unwrap();
        assert!(r.buffer().ptr_eq(t.buffer()));
        assert!(t.reshape(vec![4]).is_err());

        let e = t.expand_dims(0).unwrap();
        assert_eq!(e.shape(), &[1, 2, 3]);
    }

    #[test]
    fn test_slice_copies_window() {
        let t = arange(vec![3, 4]);
        let s = t.slice(&[1..3, 1..3]).unwrap();
        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.to_vec(), vec![5.0, 6.0, 9.0, 10.0]);
        assert_eq!(t.slice(&[0..4, 0..1]).unwrap_err(), Error::IndexOutOfBounds);
    }

    #[test]
    fn test_map_and_argmax() {
        let t = DenseTensor::from_slice(&[0u8, 127, 254], vec![3]).unwrap();
        let f = t.map(|x| f32::from(x) / 127.0 - 1.0).unwrap();
        assert_eq!(f.to_vec(), vec![-1.0, 0.0, 1.0]);
        assert_eq!(f.argmax(), Some(2));

        let ties = DenseTensor::from_slice(&[1.0f32, 3.0, 3.0], vec![3]).unwrap();
        assert_eq!(ties.argmax(), Some(1));
        assert_eq!(DenseTensor::<f32>::zeros(vec![0]).unwrap().argmax(), None);
    }
}
