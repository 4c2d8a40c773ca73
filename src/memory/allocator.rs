use super::block::{self, DIRECT_CLASS, FreeBlock, LiveBlock};
use super::bucket::FreeList;
use super::cache::{CacheNode, Home, LocalCache, NodeSnapshot, Registry, SharedCache, current_thread_id};
use super::chunk::{ChunkLedger, LedgerKind};
use super::config::BucketConfig;
use super::error::{AllocError, ClassLabel, ConfigError, FatalError, fatal};
use super::object_pool::{ObjectGeometry, ObjectList};
use super::provider::{MemoryProvider, SystemProvider};
use super::size_class::{SizeClass, SizeClassTable};
use super::stats::{self, AllocatorStats, BucketCounters, CacheStats, Counter};
use super::thread_cache::ThreadCache;
use crate::sync::OnceLock;
use crate::sync::atomic::Ordering;
use std::ptr::NonNull;
use tracing::{debug, error, trace};

/// Size-class table and shared cache, built together on first use.
pub(crate) struct SharedState {
    pub(crate) table: SizeClassTable,
    pub(crate) shared: SharedCache,
}

/// A thread-caching bucket allocator.
///
/// Owns everything the allocator needs: configuration, the memory provider,
/// the lazily built size-class table and shared cache, the registry of thread
/// caches and the ledgers of carved provider regions. Instances are
/// independent of each other.
///
/// Allocation goes through a [`ThreadCache`] (lock-free on the hot path) or,
/// without one, straight to the shared cache under the class lock.
///
/// Pooled memory is returned to the provider when the allocator is dropped,
/// so pointers it handed out must not outlive it.
pub struct BucketAllocator<P: MemoryProvider = SystemProvider> {
    config: BucketConfig,
    provider: P,
    objects: ObjectGeometry,
    state: OnceLock<SharedState>,
    registry: Registry,
    chunks: ChunkLedger,
    object_batches: ChunkLedger,
}

impl BucketAllocator<SystemProvider> {
    /// Default configuration over `malloc`.
    #[must_use]
    pub fn new() -> Self {
        Self::build(BucketConfig::default(), SystemProvider)
    }

    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn with_config(config: BucketConfig) -> Result<Self, ConfigError> {
        Self::with_provider(config, SystemProvider)
    }
}

impl Default for BucketAllocator<SystemProvider> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: MemoryProvider> BucketAllocator<P> {
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    pub fn with_provider(config: BucketConfig, provider: P) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config, provider))
    }

    fn build(config: BucketConfig, provider: P) -> Self {
        Self {
            objects: ObjectGeometry::from_config(&config),
            config,
            provider,
            state: OnceLock::new(),
            registry: Registry::new(),
            chunks: ChunkLedger::new(LedgerKind::Chunks),
            object_batches: ChunkLedger::new(LedgerKind::ObjectBatches),
        }
    }

    /// Table and shared cache. Built once; later calls are a single atomic
    /// load.
    #[inline]
    pub(crate) fn state(&self) -> &SharedState {
        self.state.get_or_init(|| SharedState {
            table: SizeClassTable::from_config(&self.config),
            shared: SharedCache::new(),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.state.get().is_some()
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn size_classes(&self) -> &[SizeClass] {
        self.state().table.classes()
    }

    /// Largest request served from a size class. Anything bigger goes to
    /// the provider directly.
    pub fn max_pooled_size(&self) -> usize {
        self.state().table.max_block_size() - block::overhead(self.config.guard_bytes)
    }

    /// Free blocks in the shared bucket of `class`. Zero for a class outside
    /// the ladder.
    pub fn shared_free_blocks(&self, class: usize) -> usize {
        let state = self.state();
        if class >= state.table.len() {
            return 0;
        }
        state.shared.buckets[class].free_blocks()
    }

    /// Free blocks in the shared cache across every class.
    pub fn shared_free_blocks_total(&self) -> usize {
        let state = self.state();
        state.shared.free_blocks(state.table.len())
    }

    pub fn shared_free_objects(&self) -> usize {
        self.state().shared.objects.free_objects()
    }

    /// Registered thread caches.
    pub fn thread_caches(&self) -> usize {
        self.registry.len()
    }

    /// Create and register a cache for the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfMemory`] if the provider cannot supply the
    /// cache itself.
    pub fn thread_cache(&self) -> Result<ThreadCache<'_, P>, AllocError> {
        let node = self.create_cache()?;
        Ok(ThreadCache::new(self, node))
    }

    pub(crate) fn create_cache(&self) -> Result<NonNull<CacheNode>, AllocError> {
        self.state();
        let owner = current_thread_id();
        let node = self
            .provider
            .system_alloc(size_of::<CacheNode>())?
            .cast::<CacheNode>();
        debug_assert!(node.as_ptr().is_aligned());
        // Safety: fresh provider memory sized for a CacheNode.
        unsafe { node.write(CacheNode::new(owner)) };
        self.registry.register(node);
        debug!(thread = owner, "registered thread cache");
        Ok(node)
    }

    /// Drain a thread cache into the shared cache, unregister it and give
    /// its memory back.
    ///
    /// # Safety
    /// `node` came from `create_cache` on this allocator, is not in use and
    /// is not used afterwards.
    pub(crate) unsafe fn teardown(&self, node: NonNull<CacheNode>) {
        // Safety: caller contract.
        let node_ref = unsafe { node.as_ref() };
        let local = crate::sync::unsafe_cell_get_mut!(node_ref.local);
        let (blocks, objects) = self.flush_in(node_ref, local);
        let owner = node_ref.owner;
        if !self.registry.unregister(node) {
            self.invariant_violation("thread cache missing from the registry");
        }
        // Safety: unlinked and empty; nothing else can reach it.
        unsafe {
            node.drop_in_place();
            self.provider.system_free(node.cast(), size_of::<CacheNode>());
        }
        debug!(thread = owner, blocks, objects, "tore down thread cache");
    }

    #[cold]
    fn invariant_violation(&self, what: &'static str) {
        if cfg!(debug_assertions) {
            fatal(self.config.on_corruption, &FatalError::InvariantViolation(what));
        }
        error!(what, "allocator invariant violated");
    }

    // ---------------------------------------------------------------------
    // Unbound entry points
    // ---------------------------------------------------------------------

    /// Allocate without a thread cache.
    ///
    /// # Errors
    ///
    /// See [`ThreadCache::alloc`].
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.alloc_from(&mut Home::Shared, size)
    }

    /// Free without a thread cache.
    ///
    /// # Safety
    /// See [`ThreadCache::free`].
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        // Safety: forwarded.
        unsafe { self.free_from(&mut Home::Shared, ptr) }
    }

    /// Resize without a thread cache.
    ///
    /// # Safety
    /// See [`ThreadCache::realloc`].
    ///
    /// # Errors
    ///
    /// See [`ThreadCache::realloc`].
    pub unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // Safety: forwarded.
        unsafe { self.realloc_from(&mut Home::Shared, ptr, size) }
    }

    /// # Errors
    ///
    /// See [`ThreadCache::obj_alloc`].
    pub fn obj_alloc(&self) -> Result<NonNull<u8>, AllocError> {
        self.obj_alloc_from(&mut Home::Shared)
    }

    /// # Safety
    /// See [`ThreadCache::obj_free`].
    pub unsafe fn obj_free(&self, obj: NonNull<u8>) {
        // Safety: forwarded.
        unsafe { self.obj_free_from(&mut Home::Shared, obj) }
    }

    // ---------------------------------------------------------------------
    // Block allocator
    // ---------------------------------------------------------------------

    fn total_size(&self, requested: usize) -> Result<usize, AllocError> {
        let overhead = block::overhead(self.config.guard_bytes);
        requested
            .checked_add(overhead)
            .ok_or(AllocError::AllocationTooLarge { requested, overhead })
    }

    fn counters<'a>(state: &'a SharedState, home: &'a Home<'_>, class: usize) -> &'a BucketCounters {
        match home {
            Home::Thread(node, _) => &node.counters[class],
            Home::Shared => &state.shared.buckets[class].counters,
        }
    }

    fn direct_gauge<'a>(state: &'a SharedState, home: &'a Home<'_>) -> &'a Counter {
        match home {
            Home::Thread(node, _) => &node.direct_bytes,
            Home::Shared => &state.shared.direct_bytes,
        }
    }

    pub(crate) fn alloc_from(&self, home: &mut Home<'_>, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = self.total_size(size)?;
        let state = self.state();
        let Some(class) = state.table.class_for(total) else {
            return self.alloc_direct(state, home, size, total);
        };
        let free = match home {
            Home::Thread(node, local) => self.pop_local(state, node, local, class)?,
            Home::Shared => self.pop_shared(state, class)?,
        };
        Self::counters(state, home, class).assigned(size);
        Ok(free.into_live(class as u32, size, self.config.guard_bytes).payload())
    }

    fn pop_local(
        &self,
        state: &SharedState,
        node: &CacheNode,
        local: &mut LocalCache,
        class: usize,
    ) -> Result<FreeBlock, AllocError> {
        if local.buckets[class].is_empty() {
            self.refill(state, node, local, class)?;
        }
        let bucket = &mut local.buckets[class];
        let Some(block) = bucket.pop_front() else {
            fatal(
                self.config.on_corruption,
                &FatalError::InvariantViolation("refill left the bucket empty"),
            );
        };
        node.counters[class].removed(1);
        node.counters[class].set_free(bucket.len());
        Ok(block)
    }

    /// Give an empty local bucket new blocks: shared bucket first, then a
    /// larger local block split down, then a fresh provider chunk. Carved
    /// blocks beyond the class's `max_free_blocks` land in the shared bucket.
    fn refill(
        &self,
        state: &SharedState,
        node: &CacheNode,
        local: &mut LocalCache,
        class: usize,
    ) -> Result<(), AllocError> {
        let size_class = state.table.get(class);
        let shared = &state.shared.buckets[class];

        // The hint may be stale; `take` re-checks under the lock.
        if !shared.looks_empty() {
            let batch = shared.take(size_class.move_count);
            if !batch.is_empty() {
                let moved = batch.len();
                Self::adopt(node, local, class, batch);
                trace!(class, moved, "refilled from shared cache");
                return Ok(());
            }
        }

        for larger in class + 1..state.table.len() {
            let bucket = &mut local.buckets[larger];
            if let Some(big) = bucket.pop_front() {
                node.counters[larger].removed(1);
                node.counters[larger].set_free(bucket.len());
                let span = state.table.get(larger).block_size;
                // Safety: `big` was a free block of `span` bytes owned by
                // this thread.
                let carved = unsafe {
                    FreeList::carve(big.base(), span / size_class.block_size, size_class.block_size, class as u32)
                };
                let blocks = carved.len();
                Self::adopt_capped(state, node, local, class, carved);
                trace!(class, from = larger, blocks, "split larger local block");
                return Ok(());
            }
        }

        let span = state.table.max_block_size();
        let base = self.chunks.acquire(&self.provider, span)?;
        // Safety: fresh chunk of `span` carveable bytes.
        let carved =
            unsafe { FreeList::carve(base, span / size_class.block_size, size_class.block_size, class as u32) };
        let blocks = carved.len();
        Self::adopt_capped(state, node, local, class, carved);
        debug!(class, bytes = span, blocks, "refilled bucket from provider");
        Ok(())
    }

    /// Adopt freshly carved blocks, keeping at most `max_free_blocks` of
    /// them locally. The surplus goes to the shared bucket in one splice.
    fn adopt_capped(
        state: &SharedState,
        node: &CacheNode,
        local: &mut LocalCache,
        class: usize,
        mut blocks: FreeList,
    ) {
        let limit = state.table.get(class).max_free_blocks;
        if blocks.len() > limit {
            let keep = blocks.take_front(limit);
            let surplus = blocks.len();
            state.shared.buckets[class].give(blocks);
            trace!(class, surplus, "carved surplus sent to shared cache");
            blocks = keep;
        }
        Self::adopt(node, local, class, blocks);
    }

    fn adopt(node: &CacheNode, local: &mut LocalCache, class: usize, blocks: FreeList) {
        let moved = blocks.len();
        let bucket = &mut local.buckets[class];
        bucket.splice(blocks);
        node.counters[class].inserted(moved);
        node.counters[class].set_free(bucket.len());
    }

    /// Move up to `count` blocks from the local bucket to the shared one.
    fn drain(&self, state: &SharedState, node: &CacheNode, local: &mut LocalCache, class: usize, count: usize) {
        let bucket = &mut local.buckets[class];
        let batch = bucket.take_front(count);
        let moved = batch.len();
        node.counters[class].removed(moved);
        node.counters[class].set_free(bucket.len());
        state.shared.buckets[class].give(batch);
        trace!(class, moved, "drained to shared cache");
    }

    fn pop_shared(&self, state: &SharedState, class: usize) -> Result<FreeBlock, AllocError> {
        let shared = &state.shared.buckets[class];
        if let Some(block) = shared.pop() {
            return Ok(block);
        }
        let block_size = state.table.get(class).block_size;
        let span = state.table.max_block_size();
        let base = self.chunks.acquire(&self.provider, span)?;
        // Safety: fresh chunk of `span` carveable bytes.
        let mut carved = unsafe { FreeList::carve(base, span / block_size, block_size, class as u32) };
        let Some(first) = carved.pop_front() else {
            fatal(
                self.config.on_corruption,
                &FatalError::InvariantViolation("chunk smaller than its size class"),
            );
        };
        let blocks = carved.len();
        shared.give(carved);
        debug!(class, bytes = span, blocks, "refilled shared bucket from provider");
        Ok(first)
    }

    fn alloc_direct(
        &self,
        state: &SharedState,
        home: &Home<'_>,
        size: usize,
        total: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let base = self.provider.system_alloc(total)?;
        // Safety: fresh provider memory of `total` bytes.
        let live = unsafe { LiveBlock::stamp(base, DIRECT_CLASS, size, self.config.guard_bytes) };
        stats::DIRECT_BYTES.add(total);
        Self::direct_gauge(state, home).add(total);
        debug!(bytes = total, "served direct block");
        Ok(live.payload())
    }

    fn free_direct(&self, state: &SharedState, home: &Home<'_>, live: LiveBlock) {
        let total = live.requested_size() + block::overhead(self.config.guard_bytes);
        // Safety: direct blocks are whole provider regions of `total` bytes.
        unsafe { self.provider.system_free(live.base(), total) };
        stats::DIRECT_BYTES.sub(total);
        Self::direct_gauge(state, home).sub(total);
        debug!(bytes = total, "released direct block");
    }

    /// Recover and check the block behind `ptr`. Corruption is fatal.
    ///
    /// # Safety
    /// `ptr` was returned by this allocator.
    unsafe fn recover(&self, state: &SharedState, ptr: NonNull<u8>) -> LiveBlock {
        // Safety: caller contract.
        let live = unsafe { LiveBlock::from_payload(ptr) };
        if let Err(kind) = live.verify(self.config.guard_bytes, state.table.len()) {
            let raw = live.size_class();
            let class = match raw {
                DIRECT_CLASS => ClassLabel::Direct,
                c if (c as usize) < state.table.len() => ClassLabel::Pooled(c as usize),
                c => ClassLabel::Unknown(c),
            };
            fatal(
                self.config.on_corruption,
                &FatalError::CorruptionDetected {
                    thread: current_thread_id(),
                    class,
                    addr: live.addr(),
                    kind,
                },
            );
        }
        live
    }

    /// # Safety
    /// `ptr` was returned by this allocator and is live.
    pub(crate) unsafe fn free_from(&self, home: &mut Home<'_>, ptr: NonNull<u8>) {
        let state = self.state();
        // Safety: forwarded.
        let live = unsafe { self.recover(state, ptr) };
        let class = live.size_class();
        if class == DIRECT_CLASS {
            return self.free_direct(state, home, live);
        }
        let class = class as usize;
        Self::counters(state, home, class).released(live.requested_size());
        let free = live.into_free(self.config.guard_bytes);
        match home {
            Home::Thread(node, local) => {
                let bucket = &mut local.buckets[class];
                bucket.push_front(free);
                let len = bucket.len();
                node.counters[class].inserted(1);
                node.counters[class].set_free(len);
                let size_class = state.table.get(class);
                if len > size_class.max_free_blocks {
                    self.drain(state, node, local, class, size_class.move_count);
                }
            }
            Home::Shared => state.shared.buckets[class].push(free),
        }
    }

    /// # Safety
    /// `ptr`, if any, was returned by this allocator and is live.
    pub(crate) unsafe fn realloc_from(
        &self,
        home: &mut Home<'_>,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let Some(ptr) = ptr else {
            return self.alloc_from(home, size);
        };
        let total = self.total_size(size)?;
        let state = self.state();
        let guards = self.config.guard_bytes;
        // Safety: forwarded.
        let mut live = unsafe { self.recover(state, ptr) };
        let old_size = live.requested_size();

        match live.size_class() {
            DIRECT_CLASS => {
                if total > state.table.max_block_size() {
                    let old_total = old_size + block::overhead(guards);
                    // Safety: direct block of `old_total` bytes from this
                    // provider. On failure it is left untouched.
                    let moved = unsafe { self.provider.system_realloc(live.base(), old_total, total) }?;
                    // Safety: the provider returned `total` bytes holding the
                    // old header.
                    let live = unsafe { LiveBlock::stamp(moved, DIRECT_CLASS, size, guards) };
                    stats::DIRECT_BYTES.sub(old_total);
                    stats::DIRECT_BYTES.add(total);
                    let gauge = Self::direct_gauge(state, home);
                    gauge.sub(old_total);
                    gauge.add(total);
                    return Ok(live.payload());
                }
            }
            current => {
                let current = current as usize;
                // Stay put if the block fits and is at most one class too big.
                let fits = state
                    .table
                    .class_for(total)
                    .is_some_and(|target| target <= current && current - target <= 1);
                if fits {
                    let counters = Self::counters(state, home, current);
                    counters.released(old_size);
                    counters.assigned(size);
                    live.set_requested_size(size, guards);
                    return Ok(live.payload());
                }
            }
        }

        let fresh = self.alloc_from(home, size)?;
        // Safety: both regions are live and distinct, each holds at least
        // the copied length.
        unsafe { std::ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_size.min(size)) };
        // Safety: `ptr` is still live; it is not used again.
        unsafe { self.free_from(home, ptr) };
        Ok(fresh)
    }

    // ---------------------------------------------------------------------
    // Recyclable objects
    // ---------------------------------------------------------------------

    fn object_batch(&self) -> Result<ObjectList, AllocError> {
        let bytes = self.objects.batch_bytes();
        let base = self.object_batches.acquire(&self.provider, bytes)?;
        debug!(objects = self.objects.batch, bytes, "allocated object batch");
        // Safety: fresh batch region of `bytes` bytes.
        Ok(unsafe { ObjectList::carve(base, self.objects.batch, self.objects.stride) })
    }

    pub(crate) fn obj_alloc_from(&self, home: &mut Home<'_>) -> Result<NonNull<u8>, AllocError> {
        let shared = &self.state().shared.objects;
        let mut list = match home {
            Home::Thread(node, local) => {
                if local.objects.is_empty() {
                    let batch = shared.take(self.objects.batch);
                    let batch = if batch.is_empty() { self.object_batch()? } else { batch };
                    local.objects.splice(batch);
                }
                let obj = local.objects.pop_front();
                node.free_objects.store(local.objects.len(), Ordering::Relaxed);
                return obj.ok_or_else(|| self.empty_object_list());
            }
            Home::Shared => {
                if let Some(obj) = shared.pop() {
                    return Ok(obj);
                }
                self.object_batch()?
            }
        };
        let obj = list.pop_front().ok_or_else(|| self.empty_object_list())?;
        shared.give(list);
        Ok(obj)
    }

    #[cold]
    fn empty_object_list(&self) -> AllocError {
        fatal(
            self.config.on_corruption,
            &FatalError::InvariantViolation("object batch came back empty"),
        )
    }

    /// # Safety
    /// `obj` came from `obj_alloc` on this allocator and is not used again.
    pub(crate) unsafe fn obj_free_from(&self, home: &mut Home<'_>, obj: NonNull<u8>) {
        let shared = &self.state().shared.objects;
        match home {
            Home::Thread(node, local) => {
                // Safety: caller contract.
                unsafe { local.objects.push_front(obj) };
                if local.objects.len() > self.objects.high_water {
                    let batch = local.objects.take_front(self.objects.batch);
                    shared.give(batch);
                }
                node.free_objects.store(local.objects.len(), Ordering::Relaxed);
            }
            // Safety: caller contract.
            Home::Shared => unsafe { shared.push(obj) },
        }
    }

    // ---------------------------------------------------------------------
    // Flush, stats
    // ---------------------------------------------------------------------

    /// Move every locally cached block and object to the shared cache.
    /// Returns `(blocks, objects)` moved.
    pub(crate) fn flush_in(&self, node: &CacheNode, local: &mut LocalCache) -> (usize, usize) {
        let state = self.state();
        let mut blocks = 0;
        for class in 0..state.table.len() {
            let batch = local.buckets[class].take_all();
            if batch.is_empty() {
                continue;
            }
            let moved = batch.len();
            node.counters[class].removed(moved);
            node.counters[class].set_free(0);
            state.shared.buckets[class].give(batch);
            blocks += moved;
        }
        let objects = local.objects.take_all();
        let moved_objects = objects.len();
        state.shared.objects.give(objects);
        node.free_objects.store(0, Ordering::Relaxed);
        (blocks, moved_objects)
    }

    /// Snapshot of the shared cache and every registered thread cache.
    pub fn stats(&self) -> AllocatorStats {
        let state = self.state();
        let classes = state.table.classes();
        // Reserve outside the registry lock; caches registered in between
        // and beyond the slack are left out of this snapshot.
        let mut raw: Vec<NodeSnapshot> = Vec::with_capacity(self.registry.len() + 4);
        self.registry.snapshot_into(classes, &mut raw);
        AllocatorStats {
            shared: state.shared.stats(classes),
            threads: raw.into_iter().map(CacheStats::from).collect(),
            chunk_bytes: self.chunks.bytes(),
            chunk_regions: self.chunks.regions(),
            object_batch_bytes: self.object_batches.bytes(),
            object_batch_regions: self.object_batches.regions(),
        }
    }

    /// Human-readable [`stats`](Self::stats).
    pub fn dump_stats(&self) -> String {
        self.stats().to_string()
    }
}

impl<P: MemoryProvider> Drop for BucketAllocator<P> {
    fn drop(&mut self) {
        if !self.registry.is_empty() {
            self.invariant_violation("allocator dropped with thread caches still registered");
            while let Some(node) = self.registry.pop_first() {
                // Safety: leaked caches can no longer be used; the borrow
                // they held has ended.
                unsafe {
                    node.drop_in_place();
                    self.provider.system_free(node.cast(), size_of::<CacheNode>());
                }
            }
        }
        let chunks = self.chunks.release_all(&self.provider);
        let batches = self.object_batches.release_all(&self.provider);
        if chunks + batches > 0 {
            debug!(chunks, batches, "released pooled memory");
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::config::{ClassLimits, FatalAction};
    use crate::memory::provider::CountingProvider;

    static SCENARIO_LIMITS: [ClassLimits; 4] = [
        ClassLimits { max_free_blocks: 8, move_count: 4 },
        ClassLimits { max_free_blocks: 8, move_count: 4 },
        ClassLimits { max_free_blocks: 4, move_count: 2 },
        ClassLimits { max_free_blocks: 4, move_count: 2 },
    ];

    fn scenario(guard_bytes: bool) -> BucketAllocator<CountingProvider> {
        let config = BucketConfig {
            base_block_size: 32,
            class_count: 4,
            class_limits: Some(&SCENARIO_LIMITS),
            guard_bytes,
            on_corruption: FatalAction::Panic,
            object_size: 48,
            object_batch: 4,
            object_high_water: 6,
            ..BucketConfig::default()
        };
        BucketAllocator::with_provider(config, CountingProvider::new()).unwrap()
    }

    #[test]
    fn test_lazy_init() {
        let allocator = scenario(true);
        assert!(!allocator.is_initialized());
        assert_eq!(allocator.size_classes().len(), 4);
        assert!(allocator.is_initialized());
        assert_eq!(allocator.max_pooled_size(), 256 - 17);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = BucketConfig { class_count: 0, ..BucketConfig::default() };
        assert!(BucketAllocator::with_config(config).is_err());
    }

    #[test]
    fn test_unbound_alloc_free_roundtrip() {
        let allocator = scenario(true);
        let p = allocator.alloc(40).unwrap();
        assert!(p.as_ptr().addr().is_multiple_of(16));
        // Safety: Test code.
        unsafe {
            p.as_ptr().write_bytes(0xCC, 40);
            allocator.free(p);
        }
        // One chunk of 256 bytes carved into four 64-byte blocks.
        assert_eq!(allocator.provider().alloc_calls(), 1);
        assert_eq!(allocator.shared_free_blocks(1), 4);
        assert_eq!(allocator.shared_free_blocks(4), 0);
        assert_eq!(allocator.shared_free_blocks(1000), 0);

        let q = allocator.alloc(40).unwrap();
        assert_eq!(allocator.provider().alloc_calls(), 1);
        // Safety: Test code.
        unsafe { allocator.free(q) };
    }

    #[test]
    fn test_allocation_too_large() {
        let allocator = scenario(false);
        assert_eq!(
            allocator.alloc(usize::MAX - 4),
            Err(AllocError::AllocationTooLarge {
                requested: usize::MAX - 4,
                overhead: 16
            })
        );
        assert_eq!(allocator.provider().alloc_calls(), 0);
    }

    #[test]
    fn test_out_of_memory_is_returned() {
        let config = BucketConfig {
            base_block_size: 32,
            class_count: 4,
            class_limits: Some(&SCENARIO_LIMITS),
            ..BucketConfig::default()
        };
        let allocator = BucketAllocator::with_provider(config, CountingProvider::with_budget(128)).unwrap();
        assert!(matches!(allocator.alloc(8), Err(AllocError::OutOfMemory(_))));
        assert!(matches!(allocator.alloc(4096), Err(AllocError::OutOfMemory(_))));
        assert!(matches!(allocator.obj_alloc(), Err(AllocError::OutOfMemory(_))));
    }

    #[test]
    fn test_unbound_realloc_moves_and_copies() {
        let allocator = scenario(true);
        let p = allocator.alloc(10).unwrap();
        // Safety: Test code.
        unsafe {
            for i in 0..10 {
                p.as_ptr().add(i).write(i as u8);
            }
            let q = allocator.realloc(Some(p), 200).unwrap();
            assert_ne!(p, q);
            for i in 0..10 {
                assert_eq!(q.as_ptr().add(i).read(), i as u8);
            }
            allocator.free(q);
        }
    }

    #[test]
    fn test_direct_realloc_uses_provider_resize() {
        let allocator = scenario(false);
        let p = allocator.alloc(1000).unwrap();
        assert_eq!(allocator.provider().last_alloc_size(), 1016);
        // Safety: Test code.
        unsafe {
            p.as_ptr().write_bytes(0x42, 1000);
            let q = allocator.realloc(Some(p), 5000).unwrap();
            assert_eq!(allocator.provider().realloc_calls(), 1);
            assert_eq!(q.as_ptr().add(999).read(), 0x42);
            assert_eq!(allocator.provider().live_bytes(), 5016);

            // Shrinking into the pooled range moves it into a bucket.
            let r = allocator.realloc(Some(q), 100).unwrap();
            assert_eq!(r.as_ptr().read(), 0x42);
            assert_eq!(allocator.provider().free_calls(), 1);
            allocator.free(r);
        }
    }

    #[test]
    fn test_unbound_objects_batch_through_shared_list() {
        let allocator = scenario(true);
        let a = allocator.obj_alloc().unwrap();
        assert_eq!(allocator.shared_free_objects(), 3);
        assert_eq!(allocator.provider().last_alloc_size(), 4 * 48 + 16);
        // Safety: Test code.
        unsafe {
            a.as_ptr().write_bytes(0x77, 48);
            allocator.obj_free(a);
        }
        assert_eq!(allocator.shared_free_objects(), 4);
    }

    #[test]
    fn test_drop_returns_every_chunk() {
        let provider = CountingProvider::new();
        {
            let config = scenario(true).config().clone();
            let allocator = BucketAllocator::with_provider(config, &provider).unwrap();
            let p = allocator.alloc(8).unwrap();
            let big = allocator.alloc(4096).unwrap();
            let obj = allocator.obj_alloc().unwrap();
            // Safety: Test code.
            unsafe {
                allocator.free(p);
                allocator.free(big);
                allocator.obj_free(obj);
            }
            assert_eq!(allocator.stats().chunk_bytes, 256 + 16);
            assert_eq!(allocator.stats().object_batch_bytes, 4 * 48 + 16);
            assert_eq!(allocator.stats().chunk_regions, 1);
            assert_eq!(allocator.stats().object_batch_regions, 1);
            assert_eq!(provider.alloc_calls(), 3);
            assert_eq!(provider.free_calls(), 1);
        }
        assert_eq!(provider.free_calls(), 3);
        assert_eq!(provider.live_bytes(), 0);
    }

    #[test]
    #[should_panic(expected = "tail guard")]
    fn test_overrun_is_fatal() {
        let allocator = scenario(true);
        let p = allocator.alloc(20).unwrap();
        // Safety: Test code, deliberately writes past the requested size.
        unsafe {
            p.as_ptr().add(20).write(0);
            allocator.free(p);
        }
    }

    #[test]
    #[should_panic(expected = "already freed")]
    fn test_double_free_is_fatal() {
        let allocator = scenario(true);
        let keep = allocator.alloc(20).unwrap();
        let p = allocator.alloc(20).unwrap();
        // Safety: Test code, deliberately frees twice.
        unsafe {
            allocator.free(p);
            allocator.free(p);
            allocator.free(keep);
        }
    }

    #[test]
    fn test_stats_report_shared_cache() {
        let allocator = scenario(true);
        let p = allocator.alloc(100).unwrap();
        let stats = allocator.stats();
        assert!(stats.threads.is_empty());
        assert_eq!(stats.shared.buckets.len(), 4);
        assert_eq!(stats.shared.buckets[2].bytes_assigned, 100);
        assert_eq!(stats.shared.buckets[2].free_blocks, 1);
        // Safety: Test code.
        unsafe { allocator.free(p) };
        let text = allocator.dump_stats();
        assert!(text.contains("cache shared"), "{text}");
        assert!(text.contains("class  2 (   128 B): free=2"), "{text}");
    }
}
