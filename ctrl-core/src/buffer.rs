//! Immutable, reference-counted numeric storage
//!
//! A [`Buffer`] is written exactly once, when it is created, and is read-only
//! afterwards. Cloning a buffer shares the storage; the storage is released
//! (and its pool notified) synchronously when the last handle is dropped.

use std::fmt;
use std::mem::{align_of, size_of};
use std::sync::Arc;

use bytemuck::Pod;
use static_assertions::assert_impl_all;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::memory::MemoryPool;

/// Storage is kept in machine words so typed views up to this alignment are valid
pub const BUFFER_ALIGNMENT: usize = align_of::<u64>();

const WORD_SIZE: usize = size_of::<u64>();

/// Shared handle to immutable byte storage
#[derive(Clone)]
pub struct Buffer {
    storage: Arc<Storage>,
}

assert_impl_all!(Buffer: Send, Sync);

struct Storage {
    /// Backing words; only the first `size` bytes are meaningful
    words: Box<[u64]>,

    /// Size of the buffer in bytes
    size: usize,

    /// Identifier used in logs
    id: Uuid,

    /// Memory pool this buffer is accounted in, if any
    memory_pool: Option<Arc<dyn MemoryPool>>,
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Some(pool) = &self.memory_pool {
            pool.deallocate(self.size);
        }
        tracing::trace!(id = %self.id, size = self.size, "buffer released");
    }
}

impl Buffer {
    /// Create a zero-filled buffer of `size` bytes
    pub fn zeroed(size: usize, pool: Option<Arc<dyn MemoryPool>>) -> Result<Self> {
        Self::build(size, pool, |_| {})
    }

    /// Create a new buffer by copying the data from a slice
    pub fn from_slice<T: Pod>(data: &[T]) -> Result<Self> {
        Self::from_slice_in(data, None)
    }

    /// Create a new buffer by copying a slice, accounted in `pool`
    pub fn from_slice_in<T: Pod>(data: &[T], pool: Option<Arc<dyn MemoryPool>>) -> Result<Self> {
        if align_of::<T>() > BUFFER_ALIGNMENT {
            return Err(Error::LayoutError(format!(
                "element alignment {} exceeds buffer alignment {BUFFER_ALIGNMENT}",
                align_of::<T>()
            )));
        }

        let src: &[u8] = bytemuck::cast_slice(data);
        Self::build(src.len(), pool, |dst| dst.copy_from_slice(src))
    }

    fn build(
        size: usize,
        pool: Option<Arc<dyn MemoryPool>>,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<Self> {
        if let Some(pool) = &pool {
            pool.allocate(size)?;
        }

        let mut words = vec![0u64; size.div_ceil(WORD_SIZE)].into_boxed_slice();
        fill(&mut bytemuck::cast_slice_mut::<u64, u8>(&mut words)[..size]);

        let id = Uuid::new_v4();
        tracing::trace!(id = %id, size, "buffer allocated");

        Ok(Self {
            storage: Arc::new(Storage {
                words,
                size,
                id,
                memory_pool: pool,
            }),
        })
    }

    /// Get the raw bytes of the buffer
    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.storage.words)[..self.storage.size]
    }

    /// Get the buffer contents as a typed slice
    pub fn typed_slice<T: Pod>(&self) -> Result<&[T]> {
        bytemuck::try_cast_slice(self.as_bytes())
            .map_err(|e| Error::LayoutError(format!("cannot view buffer as {}: {e}", std::any::type_name::<T>())))
    }

    /// Get the size of the buffer in bytes
    pub fn size(&self) -> usize {
        self.storage.size
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.storage.size == 0
    }

    /// Get the identifier of the underlying storage
    pub fn id(&self) -> Uuid {
        self.storage.id
    }

    /// Get the current number of handles sharing this storage
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.storage)
    }

    /// Get the memory pool this buffer is accounted in
    pub fn memory_pool(&self) -> Option<&Arc<dyn MemoryPool>> {
        self.storage.memory_pool.as_ref()
    }

    /// Check whether two handles share the same storage
    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.storage.id)
            .field("size", &self.storage.size)
            .field("ref_count", &self.ref_count())
            .field("pooled", &self.storage.memory_pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::TrackingMemoryPool;

    #[test]
    fn test_from_slice_roundtrips_typed_data() {
        let buffer = Buffer::from_slice(&[1.5f32, -2.0, 3.25]).unwrap();
        assert_eq!(buffer.size(), 12);
        assert_eq!(buffer.typed_slice::<f32>().unwrap(), &[1.5, -2.0, 3.25]);
    }

    #[test]
    fn test_odd_sized_buffer_rejects_wider_view() {
        let buffer = Buffer::from_slice(&[1u8, 2, 3]).unwrap();
        assert!(matches!(
            buffer.typed_slice::<f32>(),
            Err(Error::LayoutError(_))
        ));
    }

    #[test]
    fn test_clone_shares_storage() {
        let buffer = Buffer::from_slice(&[0u8; 16]).unwrap();
        let shared = buffer.clone();
        assert!(buffer.ptr_eq(&shared));
        assert_eq!(buffer.ref_count(), 2);
        drop(shared);
        assert_eq!(buffer.ref_count(), 1);
    }

    #[test]
    fn test_pool_sees_release_of_last_handle_only() {
        let pool = Arc::new(TrackingMemoryPool::new());
        let buffer = Buffer::from_slice_in(&[7i32; 4], Some(pool.clone())).unwrap();
        let shared = buffer.clone();
        assert_eq!(pool.usage_stats().allocation_count, 1);
        assert_eq!(pool.usage_stats().current_bytes, 16);

        drop(buffer);
        assert_eq!(pool.usage_stats().allocation_count, 1);

        drop(shared);
        let stats = pool.usage_stats();
        assert_eq!(stats.allocation_count, 0);
        assert_eq!(stats.current_bytes, 0);
        assert_eq!(stats.total_deallocations, 1);
    }

    #[test]
    fn test_zeroed_buffer() {
        let buffer = Buffer::zeroed(10, None).unwrap();
        assert_eq!(buffer.as_bytes(), &[0u8; 10]);
        assert!(Buffer::zeroed(0, None).unwrap().is_empty());
    }
}
