//! Diagnostic counters and the stats snapshot behind `dump_stats`.
//!
//! All counters use `Relaxed` ordering. Individual values are eventually
//! consistent and cross-counter snapshots may disagree transiently. Nothing
//! in the allocator reads them to make a decision.

use crate::sync::atomic::{AtomicIsize, AtomicU64, AtomicUsize, Ordering};
use std::fmt;

/// Diagnostic-only gauge.
///
/// Frees may be recorded by a different cache than the matching allocation,
/// so a per-cache gauge can dip below zero. Readers go through `get()`/`load()`,
/// which clamp at zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Bytes currently held from `SystemProvider`, across every allocator instance.
crate::sync::static_atomic! {
    pub static PROVIDER_BYTES: Counter = Counter::new();
}
// Bytes held by direct (unpooled) blocks.
crate::sync::static_atomic! {
    pub static DIRECT_BYTES: Counter = Counter::new();
}
// Bytes of carveable chunks obtained for bucket refills.
crate::sync::static_atomic! {
    pub static CHUNK_BYTES: Counter = Counter::new();
}
// Bytes of bulk-allocated recyclable object batches.
crate::sync::static_atomic! {
    pub static OBJECT_BATCH_BYTES: Counter = Counter::new();
}

/// Per-bucket counters, for thread-cache buckets and shared buckets alike.
///
/// Owned by one cache but readable from any thread, hence atomics even where
/// only the owner writes.
pub(crate) struct BucketCounters {
    free: AtomicUsize,
    inserts: AtomicU64,
    removes: AtomicU64,
    lock_waits: AtomicU64,
    bytes_assigned: Counter,
}

impl BucketCounters {
    pub(crate) fn new() -> Self {
        Self {
            free: AtomicUsize::new(0),
            inserts: AtomicU64::new(0),
            removes: AtomicU64::new(0),
            lock_waits: AtomicU64::new(0),
            bytes_assigned: Counter::new(),
        }
    }

    #[inline]
    pub(crate) fn set_free(&self, free: usize) {
        self.free.store(free, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn free(&self) -> usize {
        self.free.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn inserted(&self, blocks: usize) {
        self.inserts.fetch_add(blocks as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn removed(&self, blocks: usize) {
        self.removes.fetch_add(blocks as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn lock_waited(&self) {
        self.lock_waits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn assigned(&self, bytes: usize) {
        self.bytes_assigned.add(bytes);
    }

    #[inline]
    pub(crate) fn released(&self, bytes: usize) {
        self.bytes_assigned.sub(bytes);
    }

    pub(crate) fn snapshot(&self, class: usize, block_size: usize) -> BucketStats {
        BucketStats {
            class,
            block_size,
            free_blocks: self.free(),
            inserts: self.inserts.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            lock_waits: self.lock_waits.load(Ordering::Relaxed),
            bytes_assigned: self.bytes_assigned.get(),
        }
    }
}

/// One size class of one cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BucketStats {
    pub class: usize,
    pub block_size: usize,
    pub free_blocks: usize,
    /// Lifetime blocks pushed onto this bucket.
    pub inserts: u64,
    /// Lifetime blocks popped from this bucket.
    pub removes: u64,
    /// Times a shared-bucket lock was contended on behalf of this bucket.
    pub lock_waits: u64,
    /// Requested bytes currently handed out through this bucket.
    pub bytes_assigned: usize,
}

/// One cache: the shared cache (`thread == None`) or a thread's.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub thread: Option<u64>,
    pub buckets: Vec<BucketStats>,
    pub free_objects: usize,
    /// Bytes of direct blocks served through this cache and not yet freed.
    pub direct_bytes: usize,
}

impl CacheStats {
    /// Free blocks across every class.
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.buckets.iter().map(|b| b.free_blocks).sum()
    }
}

/// Snapshot of one allocator, taken by walking the cache registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocatorStats {
    pub shared: CacheStats,
    pub threads: Vec<CacheStats>,
    pub chunk_bytes: usize,
    pub chunk_regions: usize,
    pub object_batch_bytes: usize,
    pub object_batch_regions: usize,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.thread {
            Some(id) => writeln!(f, "cache thread={id}")?,
            None => writeln!(f, "cache shared")?,
        }
        writeln!(
            f,
            "  free_objects={} direct_bytes={}",
            self.free_objects, self.direct_bytes
        )?;
        for b in self.buckets.iter().filter(|b| b.inserts > 0 || b.removes > 0 || b.free_blocks > 0) {
            writeln!(
                f,
                "  class {:>2} ({:>6} B): free={:<6} inserts={:<8} removes={:<8} lock_waits={:<6} assigned={}",
                b.class, b.block_size, b.free_blocks, b.inserts, b.removes, b.lock_waits, b.bytes_assigned
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "bucketcache: {} thread cache(s), chunk_bytes={} ({} regions) object_batch_bytes={} ({} regions)",
            self.threads.len(),
            self.chunk_bytes,
            self.chunk_regions,
            self.object_batch_bytes,
            self.object_batch_regions
        )?;
        write!(f, "{}", self.shared)?;
        for cache in &self.threads {
            write!(f, "{cache}")?;
        }
        Ok(())
    }
}
