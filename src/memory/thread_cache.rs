use super::allocator::BucketAllocator;
use super::cache::{CacheNode, Home};
use super::error::AllocError;
use super::provider::{MemoryProvider, SystemProvider};
use std::marker::PhantomData;
use std::ptr::NonNull;

/// A registered per-thread cache.
///
/// Alloc and free touch only this cache's own buckets; the shared cache is
/// locked only to refill an empty bucket or drain a full one. The handle
/// cannot leave its thread. Dropping it drains every cached block and object
/// to the shared cache and unregisters it.
///
/// Blocks may be freed through any cache of the same allocator, or without
/// one; they need not go back to the cache that served them.
pub struct ThreadCache<'a, P: MemoryProvider = SystemProvider> {
    allocator: &'a BucketAllocator<P>,
    node: NonNull<CacheNode>,
    _not_send: PhantomData<*mut ()>,
}

impl<'a, P: MemoryProvider> ThreadCache<'a, P> {
    pub(crate) fn new(allocator: &'a BucketAllocator<P>, node: NonNull<CacheNode>) -> Self {
        Self {
            allocator,
            node,
            _not_send: PhantomData,
        }
    }

    fn node(&self) -> &CacheNode {
        // Safety: the node lives until this handle is dropped.
        unsafe { self.node.as_ref() }
    }

    fn with_home<R>(&mut self, op: impl FnOnce(&BucketAllocator<P>, &mut Home<'_>) -> R) -> R {
        // Safety: the node lives until this handle is dropped.
        let node = unsafe { self.node.as_ref() };
        // Safety: `&mut self` is the only way to reach the local state.
        let local = crate::sync::unsafe_cell_get_mut!(node.local);
        op(self.allocator, &mut Home::Thread(node, local))
    }

    /// Allocate `size` bytes, 16-byte aligned. `size` may be zero.
    ///
    /// # Errors
    ///
    /// [`AllocError::AllocationTooLarge`] if `size` plus block overhead
    /// overflows, [`AllocError::OutOfMemory`] if the provider fails.
    #[inline]
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.with_home(|a, home| a.alloc_from(home, size))
    }

    /// Return a block to this cache.
    ///
    /// # Safety
    /// `ptr` was returned by `alloc`/`realloc` on the same allocator (through
    /// any cache or none) and is not used afterwards.
    #[inline]
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        // Safety: forwarded.
        self.with_home(|a, home| unsafe { a.free_from(home, ptr) });
    }

    /// Resize a block. `None` behaves as `alloc`.
    ///
    /// Shrinking within the block's class, or to the class below, keeps the
    /// pointer. Otherwise the contents move to a new block.
    ///
    /// # Safety
    /// Same contract as [`free`](Self::free) for `ptr`. On success the old
    /// pointer must not be used again.
    ///
    /// # Errors
    ///
    /// As [`alloc`](Self::alloc). On error the original block is untouched
    /// and still owned by the caller.
    pub unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // Safety: forwarded.
        self.with_home(|a, home| unsafe { a.realloc_from(home, ptr, size) })
    }

    /// Take one recyclable object.
    ///
    /// # Errors
    ///
    /// [`AllocError::OutOfMemory`] if a fresh batch cannot be allocated.
    #[inline]
    pub fn obj_alloc(&mut self) -> Result<NonNull<u8>, AllocError> {
        self.with_home(|a, home| a.obj_alloc_from(home))
    }

    /// # Safety
    /// `obj` came from `obj_alloc` on the same allocator and is not used
    /// afterwards.
    #[inline]
    pub unsafe fn obj_free(&mut self, obj: NonNull<u8>) {
        // Safety: forwarded.
        self.with_home(|a, home| unsafe { a.obj_free_from(home, obj) });
    }

    /// Give every cached block and object to the shared cache. The cache
    /// stays registered.
    pub fn flush(&mut self) {
        self.with_home(|a, home| {
            if let Home::Thread(node, local) = home {
                a.flush_in(node, local);
            }
        });
    }

    /// Free blocks cached locally for `class`. Zero for a class outside
    /// the ladder.
    pub fn free_blocks(&self, class: usize) -> usize {
        if class >= self.allocator.state().table.len() {
            return 0;
        }
        self.node().counters[class].free()
    }

    pub fn free_objects(&self) -> usize {
        self.node()
            .free_objects
            .load(crate::sync::atomic::Ordering::Relaxed)
    }

    /// Identifier this cache reports in stats and diagnostics.
    pub fn thread_id(&self) -> u64 {
        self.node().owner
    }

    pub fn allocator(&self) -> &'a BucketAllocator<P> {
        self.allocator
    }

    /// Drain and unregister now. Same as dropping the handle.
    pub fn teardown(self) {}
}

impl<P: MemoryProvider> Drop for ThreadCache<'_, P> {
    fn drop(&mut self) {
        // Safety: the node came from `create_cache` on this allocator and
        // this handle is its only user.
        unsafe { self.allocator.teardown(self.node) };
    }
}
