//! Boundary with the OS memory provider.
//!
//! The allocator only ever asks for three things: a fresh region, its
//! release, and a resize. Everything else (pooling, carving, rebalancing) is
//! built on top. Implementations must be thread-safe and return memory aligned
//! to at least [`MIN_PROVIDER_ALIGN`].

use super::error::ProviderError;
use super::stats;
use crate::sync::atomic::{AtomicUsize, Ordering};
use std::ptr::NonNull;

/// Minimum alignment every provider must honour. Block payloads inherit it.
pub const MIN_PROVIDER_ALIGN: usize = 16;

/// Raw, unpooled memory source.
pub trait MemoryProvider: Send + Sync {
    /// Obtain `size` bytes (`size > 0`).
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when the request cannot be satisfied.
    fn system_alloc(&self, size: usize) -> Result<NonNull<u8>, ProviderError>;

    /// Release a region obtained from this provider.
    ///
    /// # Safety
    /// `ptr` came from `system_alloc`/`system_realloc` on this provider with
    /// `size` as its current size, and is not used afterwards.
    unsafe fn system_free(&self, ptr: NonNull<u8>, size: usize);

    /// Resize a region, moving it if needed. On failure the original region
    /// is untouched.
    ///
    /// # Safety
    /// Same requirements on `ptr` and `old_size` as [`system_free`](Self::system_free).
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] when the new size cannot be satisfied.
    unsafe fn system_realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, ProviderError>;
}

impl<P: MemoryProvider + ?Sized> MemoryProvider for &P {
    fn system_alloc(&self, size: usize) -> Result<NonNull<u8>, ProviderError> {
        (**self).system_alloc(size)
    }

    unsafe fn system_free(&self, ptr: NonNull<u8>, size: usize) {
        // Safety: forwarded caller contract.
        unsafe { (**self).system_free(ptr, size) }
    }

    unsafe fn system_realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, ProviderError> {
        // Safety: forwarded caller contract.
        unsafe { (**self).system_realloc(ptr, old_size, new_size) }
    }
}

/// `malloc`/`free`/`realloc` from the platform C library.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl MemoryProvider for SystemProvider {
    fn system_alloc(&self, size: usize) -> Result<NonNull<u8>, ProviderError> {
        debug_assert!(size > 0, "zero-size provider request");
        // Safety: FFI call; any size is a valid argument.
        let ptr = unsafe { libc::malloc(size) }.cast::<u8>();
        let ptr = NonNull::new(ptr).ok_or(ProviderError { size })?;
        debug_assert!(ptr.as_ptr().addr().is_multiple_of(MIN_PROVIDER_ALIGN));
        stats::PROVIDER_BYTES.add(size);
        Ok(ptr)
    }

    unsafe fn system_free(&self, ptr: NonNull<u8>, size: usize) {
        // Safety: ptr came from malloc/realloc (caller contract).
        unsafe { libc::free(ptr.as_ptr().cast()) };
        stats::PROVIDER_BYTES.sub(size);
    }

    unsafe fn system_realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, ProviderError> {
        // Safety: ptr came from malloc/realloc (caller contract). On failure
        // realloc leaves the original allocation alone.
        let moved = unsafe { libc::realloc(ptr.as_ptr().cast(), new_size) }.cast::<u8>();
        let moved = NonNull::new(moved).ok_or(ProviderError { size: new_size })?;
        stats::PROVIDER_BYTES.sub(old_size);
        stats::PROVIDER_BYTES.add(new_size);
        Ok(moved)
    }
}

/// Provider wrapper that counts calls and can enforce a byte budget.
///
/// Useful to assert which paths reach the OS and to simulate exhaustion.
#[derive(Debug)]
pub struct CountingProvider<P = SystemProvider> {
    inner: P,
    budget: Option<usize>,
    live_bytes: AtomicUsize,
    allocs: AtomicUsize,
    frees: AtomicUsize,
    reallocs: AtomicUsize,
    last_alloc_size: AtomicUsize,
}

impl CountingProvider<SystemProvider> {
    #[must_use]
    pub fn new() -> Self {
        Self::wrap(SystemProvider, None)
    }

    /// Fail any request that would push live bytes above `bytes`.
    #[must_use]
    pub fn with_budget(bytes: usize) -> Self {
        Self::wrap(SystemProvider, Some(bytes))
    }
}

impl Default for CountingProvider<SystemProvider> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: MemoryProvider> CountingProvider<P> {
    pub fn wrap(inner: P, budget: Option<usize>) -> Self {
        Self {
            inner,
            budget,
            live_bytes: AtomicUsize::new(0),
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            reallocs: AtomicUsize::new(0),
            last_alloc_size: AtomicUsize::new(0),
        }
    }

    pub fn alloc_calls(&self) -> usize {
        self.allocs.load(Ordering::Relaxed)
    }

    pub fn free_calls(&self) -> usize {
        self.frees.load(Ordering::Relaxed)
    }

    pub fn realloc_calls(&self) -> usize {
        self.reallocs.load(Ordering::Relaxed)
    }

    /// Size of the most recent `system_alloc` request.
    pub fn last_alloc_size(&self) -> usize {
        self.last_alloc_size.load(Ordering::Relaxed)
    }

    /// Bytes handed out and not yet released.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    fn reserve(&self, size: usize) -> Result<(), ProviderError> {
        let Some(budget) = self.budget else {
            self.live_bytes.fetch_add(size, Ordering::Relaxed);
            return Ok(());
        };
        self.live_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |live| {
                live.checked_add(size).filter(|&next| next <= budget)
            })
            .map(drop)
            .map_err(|_| ProviderError { size })
    }
}

impl<P: MemoryProvider> MemoryProvider for CountingProvider<P> {
    fn system_alloc(&self, size: usize) -> Result<NonNull<u8>, ProviderError> {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        self.last_alloc_size.store(size, Ordering::Relaxed);
        self.reserve(size)?;
        self.inner.system_alloc(size).inspect_err(|_| {
            self.live_bytes.fetch_sub(size, Ordering::Relaxed);
        })
    }

    unsafe fn system_free(&self, ptr: NonNull<u8>, size: usize) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(size, Ordering::Relaxed);
        // Safety: forwarded caller contract.
        unsafe { self.inner.system_free(ptr, size) };
    }

    unsafe fn system_realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, ProviderError> {
        self.reallocs.fetch_add(1, Ordering::Relaxed);
        if new_size > old_size {
            self.reserve(new_size - old_size)?;
        }
        // Safety: forwarded caller contract.
        match unsafe { self.inner.system_realloc(ptr, old_size, new_size) } {
            Ok(moved) => {
                if new_size < old_size {
                    self.live_bytes.fetch_sub(old_size - new_size, Ordering::Relaxed);
                }
                Ok(moved)
            }
            Err(e) => {
                if new_size > old_size {
                    self.live_bytes.fetch_sub(new_size - old_size, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }
}
