//! Process-wide front-end.
//!
//! One lazily built [`BucketAllocator`] plus a native thread-local slot that
//! remembers each thread's cache. The cache is created on a thread's first
//! request and torn down when the thread exits. While the slot is unusable
//! (the thread is exiting, or the allocator re-entered itself, e.g. from a
//! tracing subscriber) requests go straight to the shared cache.

use super::allocator::BucketAllocator;
use super::block::BLOCK_ALIGN;
use super::cache::{CacheNode, Home};
use super::config::BucketConfig;
use super::error::{AllocError, ConfigError};
use crate::sync::OnceLock;
use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::ptr::{self, NonNull};

static GLOBAL_INSTANCE: OnceLock<BucketAllocator> = OnceLock::new();

thread_local! {
    static CURRENT_CACHE: CacheSlot = const { CacheSlot::new() };
}

/// The calling thread's cache, if it has one yet.
struct CacheSlot {
    node: Cell<Option<NonNull<CacheNode>>>,
    /// Set while an operation is using the node.
    busy: Cell<bool>,
}

impl CacheSlot {
    const fn new() -> Self {
        Self {
            node: Cell::new(None),
            busy: Cell::new(false),
        }
    }

    /// Mark the slot busy and return its node, creating it on first use.
    fn claim(&self, allocator: &BucketAllocator) -> Option<SlotClaim> {
        if self.busy.replace(true) {
            return None;
        }
        let node = match self.node.get() {
            Some(node) => node,
            None => match allocator.create_cache() {
                Ok(node) => {
                    self.node.set(Some(node));
                    node
                }
                Err(_) => {
                    self.busy.set(false);
                    return None;
                }
            },
        };
        Some(SlotClaim { node })
    }
}

impl Drop for CacheSlot {
    fn drop(&mut self) {
        if let (Some(node), Some(allocator)) = (self.node.take(), GLOBAL_INSTANCE.get()) {
            // Safety: the node belongs to the global instance and the thread
            // is exiting, so nothing else uses it.
            unsafe { allocator.teardown(node) };
        }
    }
}

/// Clears the busy flag when the operation ends.
struct SlotClaim {
    node: NonNull<CacheNode>,
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        let _ = CURRENT_CACHE.try_with(|slot| slot.busy.set(false));
    }
}

/// Front-end over the process-wide allocator. Install it with
/// `#[global_allocator]` or call its functions directly.
pub struct GlobalBucketAllocator;

impl GlobalBucketAllocator {
    /// Build the process-wide instance from `config`.
    ///
    /// Must run before anything else touches the instance.
    ///
    /// # Errors
    ///
    /// [`ConfigError::AlreadyInitialized`] if the instance exists already,
    /// or the validation error for `config`.
    pub fn init(config: BucketConfig) -> Result<(), ConfigError> {
        let allocator = BucketAllocator::with_config(config)?;
        GLOBAL_INSTANCE
            .set(allocator)
            .map_err(|_| ConfigError::AlreadyInitialized)
    }

    /// The process-wide instance, built with the default config on first use.
    pub fn get() -> &'static BucketAllocator {
        GLOBAL_INSTANCE.get_or_init(BucketAllocator::new)
    }

    fn with_cache<R>(op: impl FnOnce(&BucketAllocator, &mut Home<'_>) -> R) -> R {
        let allocator = Self::get();
        let claim = CURRENT_CACHE
            .try_with(|slot| slot.claim(allocator))
            .ok()
            .flatten();
        match claim {
            Some(claim) => {
                // Safety: the node lives until the thread exits, and the busy
                // flag keeps this the only borrow of its local state.
                let node = unsafe { claim.node.as_ref() };
                let local = crate::sync::unsafe_cell_get_mut!(node.local);
                op(allocator, &mut Home::Thread(node, local))
            }
            None => op(allocator, &mut Home::Shared),
        }
    }

    /// # Errors
    ///
    /// As [`ThreadCache::alloc`](super::ThreadCache::alloc).
    pub fn alloc(size: usize) -> Result<NonNull<u8>, AllocError> {
        Self::with_cache(|a, home| a.alloc_from(home, size))
    }

    /// # Safety
    /// `ptr` came from this front-end and is not used afterwards.
    pub unsafe fn free(ptr: NonNull<u8>) {
        // Safety: forwarded.
        Self::with_cache(|a, home| unsafe { a.free_from(home, ptr) });
    }

    /// # Safety
    /// As [`free`](Self::free) for `ptr`.
    ///
    /// # Errors
    ///
    /// As [`ThreadCache::realloc`](super::ThreadCache::realloc).
    pub unsafe fn realloc(ptr: Option<NonNull<u8>>, size: usize) -> Result<NonNull<u8>, AllocError> {
        // Safety: forwarded.
        Self::with_cache(|a, home| unsafe { a.realloc_from(home, ptr, size) })
    }

    /// # Errors
    ///
    /// As [`ThreadCache::obj_alloc`](super::ThreadCache::obj_alloc).
    pub fn obj_alloc() -> Result<NonNull<u8>, AllocError> {
        Self::with_cache(|a, home| a.obj_alloc_from(home))
    }

    /// # Safety
    /// `obj` came from [`obj_alloc`](Self::obj_alloc) and is not used
    /// afterwards.
    pub unsafe fn obj_free(obj: NonNull<u8>) {
        // Safety: forwarded.
        Self::with_cache(|a, home| unsafe { a.obj_free_from(home, obj) });
    }

    /// Drain the calling thread's cache into the shared cache and release
    /// it. The next request from this thread creates a fresh one.
    pub fn teardown_current_cache() {
        let Some(allocator) = GLOBAL_INSTANCE.get() else {
            return;
        };
        let _ = CURRENT_CACHE.try_with(|slot| {
            if slot.busy.get() {
                return;
            }
            if let Some(node) = slot.node.take() {
                // Safety: the node is this thread's and not in use.
                unsafe { allocator.teardown(node) };
            }
        });
    }

    /// Stats of the process-wide instance as text.
    pub fn dump_stats() -> String {
        // Make sure this thread has its cache before the registry is
        // walked, so the report's own allocations never register one.
        Self::with_cache(|_, _| ());
        Self::get().dump_stats()
    }
}

// Safety: every pointer handed out is at least 16-aligned and sized for the
// layout; larger alignments are delegated to `System` in every method.
unsafe impl GlobalAlloc for GlobalBucketAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > BLOCK_ALIGN {
            // Safety: forwarded layout.
            return unsafe { System.alloc(layout) };
        }
        Self::alloc(layout.size()).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.align() > BLOCK_ALIGN {
            // Safety: allocated by System with this layout.
            return unsafe { System.dealloc(ptr, layout) };
        }
        if let Some(ptr) = NonNull::new(ptr) {
            // Safety: allocated by this front-end.
            unsafe { Self::free(ptr) };
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > BLOCK_ALIGN {
            // Safety: allocated by System with this layout.
            return unsafe { System.realloc(ptr, layout, new_size) };
        }
        // Safety: allocated by this front-end.
        unsafe { Self::realloc(NonNull::new(ptr), new_size) }.map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}
