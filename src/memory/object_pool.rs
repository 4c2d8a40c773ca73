//! Recyclable object pool.
//!
//! One fixed-size entity with very high churn gets its own lists, parallel to
//! the size-class buckets: a per-thread list, one shared list behind one lock,
//! and batches bulk-allocated from the provider. Objects carry no header; a
//! free object's first word is its link. Batches are never returned before
//! the allocator is dropped.

use super::config::BucketConfig;
use crate::sync::Mutex;
use crate::sync::atomic::{AtomicUsize, Ordering};
use std::ptr::NonNull;
use std::sync::PoisonError;

#[repr(C)]
struct ObjectSlot {
    next: Option<NonNull<ObjectSlot>>,
}

/// Object pool dimensions derived from [`BucketConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ObjectGeometry {
    pub(crate) stride: usize,
    pub(crate) batch: usize,
    pub(crate) high_water: usize,
}

impl ObjectGeometry {
    pub(crate) fn from_config(config: &BucketConfig) -> Self {
        Self {
            stride: config.object_stride(),
            batch: config.object_batch,
            high_water: config.object_high_water,
        }
    }

    /// Bytes of one bulk allocation. Bounded by `BucketConfig::validate`.
    pub(crate) fn batch_bytes(&self) -> usize {
        self.stride * self.batch
    }
}

#[derive(Debug, Default)]
pub(crate) struct ObjectList {
    first: Option<NonNull<ObjectSlot>>,
    last: Option<NonNull<ObjectSlot>>,
    len: usize,
}

// Safety: ObjectList exclusively owns the objects it links.
unsafe impl Send for ObjectList {}

fn next_of(slot: NonNull<ObjectSlot>) -> Option<NonNull<ObjectSlot>> {
    // Safety: every linked slot is a free object owned by the list.
    unsafe { slot.as_ptr().read().next }
}

fn set_next(slot: NonNull<ObjectSlot>, next: Option<NonNull<ObjectSlot>>) {
    // Safety: as above.
    unsafe { slot.as_ptr().write(ObjectSlot { next }) }
}

impl ObjectList {
    pub(crate) const fn new() -> Self {
        Self {
            first: None,
            last: None,
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// `obj` is a free object of this pool, 16-aligned, owned by the caller.
    #[inline]
    pub(crate) unsafe fn push_front(&mut self, obj: NonNull<u8>) {
        let slot = obj.cast::<ObjectSlot>();
        set_next(slot, self.first);
        if self.last.is_none() {
            self.last = Some(slot);
        }
        self.first = Some(slot);
        self.len += 1;
    }

    #[inline]
    pub(crate) fn pop_front(&mut self) -> Option<NonNull<u8>> {
        let slot = self.first?;
        self.first = next_of(slot);
        if self.first.is_none() {
            self.last = None;
        }
        self.len -= 1;
        Some(slot.cast())
    }

    pub(crate) fn take_front(&mut self, n: usize) -> ObjectList {
        if n >= self.len {
            return std::mem::take(self);
        }
        let Some(first) = self.first.filter(|_| n > 0) else {
            return ObjectList::new();
        };
        let mut last = first;
        for _ in 1..n {
            match next_of(last) {
                Some(next) => last = next,
                None => break,
            }
        }
        self.first = next_of(last);
        self.len -= n;
        set_next(last, None);
        ObjectList {
            first: Some(first),
            last: Some(last),
            len: n,
        }
    }

    pub(crate) fn splice(&mut self, other: ObjectList) {
        let (Some(first), Some(last)) = (other.first, other.last) else {
            return;
        };
        set_next(last, self.first);
        if self.last.is_none() {
            self.last = Some(last);
        }
        self.first = Some(first);
        self.len += other.len;
    }

    pub(crate) fn take_all(&mut self) -> ObjectList {
        std::mem::take(self)
    }

    /// Link `count` objects of `stride` bytes starting at `base`.
    ///
    /// # Safety
    /// `base` is 16-aligned and writable for `count * stride` bytes, owned by
    /// the caller.
    pub(crate) unsafe fn carve(base: NonNull<u8>, count: usize, stride: usize) -> ObjectList {
        let mut list = ObjectList::new();
        for i in (0..count).rev() {
            // Safety: within the region (caller contract).
            unsafe { list.push_front(base.add(i * stride)) };
        }
        list
    }
}

/// The shared free-object list. One lock for the whole list.
pub(crate) struct SharedObjects {
    list: Mutex<ObjectList>,
    free: AtomicUsize,
}

impl SharedObjects {
    pub(crate) fn new() -> Self {
        Self {
            list: Mutex::new(ObjectList::new()),
            free: AtomicUsize::new(0),
        }
    }

    /// Possibly stale.
    #[inline]
    pub(crate) fn free_objects(&self) -> usize {
        self.free.load(Ordering::Relaxed)
    }

    /// Move up to `n` objects out. Decided under the lock; the free count
    /// may be stale.
    pub(crate) fn take(&self, n: usize) -> ObjectList {
        let mut list = self.list.lock().unwrap_or_else(PoisonError::into_inner);
        let taken = list.take_front(n);
        self.free.store(list.len(), Ordering::Relaxed);
        taken
    }

    pub(crate) fn give(&self, objects: ObjectList) {
        if objects.is_empty() {
            return;
        }
        let mut list = self.list.lock().unwrap_or_else(PoisonError::into_inner);
        list.splice(objects);
        self.free.store(list.len(), Ordering::Relaxed);
    }

    pub(crate) fn pop(&self) -> Option<NonNull<u8>> {
        self.take(1).pop_front()
    }

    /// # Safety
    /// Same contract as [`ObjectList::push_front`].
    pub(crate) unsafe fn push(&self, obj: NonNull<u8>) {
        let mut one = ObjectList::new();
        // Safety: forwarded.
        unsafe { one.push_front(obj) };
        self.give(one);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn carve(buf: &mut Vec<u128>, count: usize, stride: usize) -> ObjectList {
        buf.resize(count * stride / 16, 0);
        let base = NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap();
        // Safety: Test code, buffer sized above.
        unsafe { ObjectList::carve(base, count, stride) }
    }

    #[test]
    fn test_geometry_from_config() {
        let config = BucketConfig {
            object_size: 40,
            object_batch: 8,
            object_high_water: 16,
            ..BucketConfig::default()
        };
        let geometry = ObjectGeometry::from_config(&config);
        assert_eq!(geometry.stride, 48);
        assert_eq!(geometry.batch_bytes(), 48 * 8);
    }

    #[test]
    fn test_carve_pop_in_address_order() {
        let mut buf = Vec::new();
        let mut list = carve(&mut buf, 4, 32);
        let base = buf.as_ptr().addr();
        let popped: Vec<usize> = std::iter::from_fn(|| list.pop_front())
            .map(|p| p.as_ptr().addr() - base)
            .collect();
        assert_eq!(popped, vec![0, 32, 64, 96]);
        assert!(list.is_empty());
    }

    #[test]
    fn test_take_front_and_splice() {
        let mut buf = Vec::new();
        let mut list = carve(&mut buf, 10, 16);
        let batch = list.take_front(3);
        assert_eq!((batch.len(), list.len()), (3, 7));

        let mut other = ObjectList::new();
        other.splice(batch);
        other.splice(list.take_all());
        assert_eq!(other.len(), 10);
        assert_eq!(std::iter::from_fn(|| other.pop_front()).count(), 10);
    }

    #[test]
    fn test_shared_objects_roundtrip() {
        let mut buf = Vec::new();
        let list = carve(&mut buf, 6, 16);
        let shared = SharedObjects::new();
        assert_eq!(shared.pop(), None);

        shared.give(list);
        assert_eq!(shared.free_objects(), 6);
        let batch = shared.take(4);
        assert_eq!(batch.len(), 4);
        assert_eq!(shared.free_objects(), 2);

        let obj = shared.pop().unwrap();
        assert_eq!(shared.free_objects(), 1);
        // Safety: Test code, obj came from this pool.
        unsafe { shared.push(obj) };
        shared.give(batch);
        assert_eq!(shared.free_objects(), 6);
    }

    #[test]
    fn test_take_ignores_stale_count() {
        let mut buf = Vec::new();
        let list = carve(&mut buf, 2, 16);
        let shared = SharedObjects::new();
        shared.give(list);
        shared.free.store(0, Ordering::Relaxed);
        assert_eq!(shared.take(4).len(), 2);
        assert_eq!(shared.free_objects(), 0);
    }
}
