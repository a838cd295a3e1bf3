//! Device memory handles.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

struct Allocation {
    id: u64,
    data: RwLock<Vec<f32>>,
}

/// A reference-counted handle to an f32 allocation owned by a backend.
///
/// A buffer carries only its size. Consumers derive the logical shape from the element
/// count and their own weight dimensions. Cloning shares the allocation; it is freed when
/// the last handle is dropped, including handles held by queued kernel calls.
#[derive(Clone)]
pub struct DeviceBuffer {
    inner: Arc<Allocation>,
    len: usize,
}

impl DeviceBuffer {
    pub(crate) fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0.0; len])
    }

    pub(crate) fn from_vec(data: Vec<f32>) -> Self {
        let len = data.len();
        Self {
            inner: Arc::new(Allocation {
                id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
                data: RwLock::new(data),
            }),
            len,
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Number of f32 elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<f32>()
    }

    /// True when both handles refer to the same allocation.
    pub fn same(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Live handles to this allocation, queued calls included.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub(crate) fn host_read(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.inner.data.read_recursive()
    }

    pub(crate) fn host_write(&self) -> RwLockWriteGuard<'_, Vec<f32>> {
        self.inner.data.write()
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer").field("id", &self.id()).field("bytes", &self.size_bytes()).finish()
    }
}

#[cfg(test)]
mod buffer_test {
    use super::*;

    #[test]
    fn test_clones_share_allocation() {
        let a = DeviceBuffer::from_vec(vec![1.0, 2.0, 3.0]);
        let b = a.clone();
        assert!(a.same(&b));
        assert_eq!(a.handle_count(), 2);
        assert_eq!(b.size_bytes(), 12);
        b.host_write()[0] = 7.0;
        assert_eq!(a.host_read()[0], 7.0);
        drop(b);
        assert_eq!(a.handle_count(), 1);
    }

    #[test]
    fn test_fresh_buffers_are_distinct() {
        let a = DeviceBuffer::zeroed(4);
        let b = DeviceBuffer::zeroed(4);
        assert!(!a.same(&b));
        assert_ne!(a.id(), b.id());
        assert!(DeviceBuffer::zeroed(0).is_empty());
    }
}
