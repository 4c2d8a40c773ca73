//! Cache structures: the shared cache, per-thread cache nodes and the
//! registry that links every live thread cache.

use super::bucket::{FreeList, SharedBucket};
use super::config::MAX_SIZE_CLASSES;
use super::object_pool::{ObjectList, SharedObjects};
use super::size_class::SizeClass;
use super::stats::{BucketCounters, BucketStats, CacheStats, Counter};
use crate::sync::Mutex;
use crate::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use crate::sync::cell::UnsafeCell;
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::PoisonError;

crate::sync::static_atomic! {
    static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
}

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Small dense identifier of the calling thread, used in diagnostics.
///
/// Does not allocate, so it is usable from inside the global allocator.
/// Returns 0 once the thread's TLS is being destroyed.
pub(crate) fn current_thread_id() -> u64 {
    THREAD_ID
        .try_with(|id| {
            if id.get() == 0 {
                id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
            }
            id.get()
        })
        .unwrap_or(0)
}

/// The overflow pool every thread can reach.
pub(crate) struct SharedCache {
    pub(crate) buckets: [SharedBucket; MAX_SIZE_CLASSES],
    pub(crate) objects: SharedObjects,
    /// Direct blocks served without a thread cache.
    pub(crate) direct_bytes: Counter,
}

impl SharedCache {
    pub(crate) fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| SharedBucket::new()),
            objects: SharedObjects::new(),
            direct_bytes: Counter::new(),
        }
    }

    pub(crate) fn free_blocks(&self, classes: usize) -> usize {
        self.buckets[..classes].iter().map(SharedBucket::free_blocks).sum()
    }

    pub(crate) fn stats(&self, classes: &[SizeClass]) -> CacheStats {
        CacheStats {
            thread: None,
            buckets: classes
                .iter()
                .enumerate()
                .map(|(i, c)| self.buckets[i].counters.snapshot(i, c.block_size))
                .collect(),
            free_objects: self.objects.free_objects(),
            direct_bytes: self.direct_bytes.get(),
        }
    }
}

/// State only the owning thread touches. No locks.
pub(crate) struct LocalCache {
    pub(crate) buckets: [FreeList; MAX_SIZE_CLASSES],
    pub(crate) objects: ObjectList,
}

/// One registered thread cache.
///
/// Lives in memory obtained from the provider directly, never from the
/// allocator it belongs to.
pub(crate) struct CacheNode {
    pub(crate) owner: u64,
    /// Registry link. Only read or written under the registry lock.
    next: UnsafeCell<Option<NonNull<CacheNode>>>,
    /// Mirrors of the local state for `dump_stats`, readable from any thread.
    pub(crate) counters: [BucketCounters; MAX_SIZE_CLASSES],
    pub(crate) free_objects: AtomicUsize,
    pub(crate) direct_bytes: Counter,
    pub(crate) local: UnsafeCell<LocalCache>,
}

impl CacheNode {
    pub(crate) fn new(owner: u64) -> Self {
        Self {
            owner,
            next: UnsafeCell::new(None),
            counters: std::array::from_fn(|_| BucketCounters::new()),
            free_objects: AtomicUsize::new(0),
            direct_bytes: Counter::new(),
            local: UnsafeCell::new(LocalCache {
                buckets: std::array::from_fn(|_| FreeList::new()),
                objects: ObjectList::new(),
            }),
        }
    }

    fn snapshot(&self, classes: &[SizeClass]) -> NodeSnapshot {
        let mut buckets = [BucketStats::default(); MAX_SIZE_CLASSES];
        for (i, class) in classes.iter().enumerate() {
            buckets[i] = self.counters[i].snapshot(i, class.block_size);
        }
        NodeSnapshot {
            thread: self.owner,
            buckets,
            classes: classes.len(),
            free_objects: self.free_objects.load(Ordering::Relaxed),
            direct_bytes: self.direct_bytes.get(),
        }
    }
}

/// Fixed-size copy of one node's counters, taken under the registry lock
/// without allocating.
#[derive(Clone, Copy)]
pub(crate) struct NodeSnapshot {
    thread: u64,
    buckets: [BucketStats; MAX_SIZE_CLASSES],
    classes: usize,
    free_objects: usize,
    direct_bytes: usize,
}

impl From<NodeSnapshot> for CacheStats {
    fn from(snap: NodeSnapshot) -> Self {
        CacheStats {
            thread: Some(snap.thread),
            buckets: snap.buckets[..snap.classes].to_vec(),
            free_objects: snap.free_objects,
            direct_bytes: snap.direct_bytes,
        }
    }
}

/// Where an operation takes blocks from and returns them to.
pub(crate) enum Home<'c> {
    /// A registered thread cache, with exclusive access to its local state.
    Thread(&'c CacheNode, &'c mut LocalCache),
    /// No thread cache: go straight to the shared cache.
    Shared,
}

struct NodeList {
    first: Option<NonNull<CacheNode>>,
    len: usize,
}

// Safety: the nodes are only reached through the registry mutex.
unsafe impl Send for NodeList {}

/// Singly linked list of every registered thread cache.
///
/// Touched on cache creation, teardown and stats walks only.
pub(crate) struct Registry {
    list: Mutex<NodeList>,
}

fn next_of(node: NonNull<CacheNode>) -> Option<NonNull<CacheNode>> {
    // Safety: registered nodes stay valid until unregistered; callers hold
    // the registry lock.
    let node = unsafe { node.as_ref() };
    *crate::sync::unsafe_cell_get_mut!(node.next)
}

fn set_next(node: NonNull<CacheNode>, next: Option<NonNull<CacheNode>>) {
    // Safety: as above.
    let node = unsafe { node.as_ref() };
    *crate::sync::unsafe_cell_get_mut!(node.next) = next;
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            list: Mutex::new(NodeList {
                first: None,
                len: 0,
            }),
        }
    }

    fn lock(&self) -> crate::sync::MutexGuard<'_, NodeList> {
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `node` at the tail.
    pub(crate) fn register(&self, node: NonNull<CacheNode>) {
        let mut list = self.lock();
        set_next(node, None);
        match list.first {
            None => list.first = Some(node),
            Some(mut tail) => {
                while let Some(next) = next_of(tail) {
                    tail = next;
                }
                set_next(tail, Some(node));
            }
        }
        list.len += 1;
    }

    /// Unlink `node`. Returns `false` if it was not registered.
    pub(crate) fn unregister(&self, node: NonNull<CacheNode>) -> bool {
        let mut list = self.lock();
        let Some(first) = list.first else {
            return false;
        };
        if first == node {
            list.first = next_of(first);
            list.len -= 1;
            return true;
        }
        let mut prev = first;
        while let Some(cur) = next_of(prev) {
            if cur == node {
                set_next(prev, next_of(cur));
                list.len -= 1;
                return true;
            }
            prev = cur;
        }
        false
    }

    /// Unlink and return the first node, if any.
    pub(crate) fn pop_first(&self) -> Option<NonNull<CacheNode>> {
        let mut list = self.lock();
        let first = list.first?;
        list.first = next_of(first);
        list.len -= 1;
        Some(first)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy every node's counters into `out`, up to its spare capacity.
    /// Never grows `out`: nothing allocates while the registry lock is held.
    pub(crate) fn snapshot_into(&self, classes: &[SizeClass], out: &mut Vec<NodeSnapshot>) {
        let list = self.lock();
        let mut cursor = list.first;
        while let Some(node) = cursor {
            if out.len() == out.capacity() {
                break;
            }
            // Safety: registered node, registry lock held.
            out.push(unsafe { node.as_ref() }.snapshot(classes));
            cursor = next_of(node);
        }
    }

    #[cfg(test)]
    pub(crate) fn owners(&self) -> Vec<u64> {
        let list = self.lock();
        std::iter::successors(list.first, |n| next_of(*n))
            // Safety: Test code, registry lock held.
            .map(|n| unsafe { n.as_ref() }.owner)
            .collect()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    struct Nodes(Vec<Box<CacheNode>>);

    impl Nodes {
        fn new(owners: &[u64]) -> Self {
            Self(owners.iter().map(|&o| Box::new(CacheNode::new(o))).collect())
        }

        fn ptr(&mut self, i: usize) -> NonNull<CacheNode> {
            NonNull::from(&mut *self.0[i])
        }
    }

    #[test]
    fn test_register_appends_in_order() {
        let mut nodes = Nodes::new(&[1, 2, 3]);
        let registry = Registry::new();
        for i in 0..3 {
            registry.register(nodes.ptr(i));
        }
        assert_eq!(registry.owners(), vec![1, 2, 3]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_unregister_head_middle_tail() {
        let mut nodes = Nodes::new(&[1, 2, 3, 4]);
        let registry = Registry::new();
        for i in 0..4 {
            registry.register(nodes.ptr(i));
        }
        assert!(registry.unregister(nodes.ptr(1)));
        assert_eq!(registry.owners(), vec![1, 3, 4]);
        assert!(registry.unregister(nodes.ptr(0)));
        assert_eq!(registry.owners(), vec![3, 4]);
        assert!(registry.unregister(nodes.ptr(3)));
        assert_eq!(registry.owners(), vec![3]);
        assert!(!registry.unregister(nodes.ptr(3)));
        assert_eq!(registry.pop_first(), Some(nodes.ptr(2)));
        assert!(registry.is_empty());
        assert_eq!(registry.pop_first(), None);
    }

    #[test]
    fn test_snapshot_respects_capacity() {
        let mut nodes = Nodes::new(&[7, 8, 9]);
        let registry = Registry::new();
        for i in 0..3 {
            registry.register(nodes.ptr(i));
        }
        nodes.0[1].counters[0].set_free(5);
        let classes = [SizeClass { block_size: 32, max_free_blocks: 8, move_count: 4 }];

        let mut out = Vec::with_capacity(2);
        registry.snapshot_into(&classes, &mut out);
        assert_eq!(out.len(), 2);
        let stats: Vec<CacheStats> = out.into_iter().map(CacheStats::from).collect();
        assert_eq!(stats[0].thread, Some(7));
        assert_eq!(stats[1].buckets.len(), 1);
        assert_eq!(stats[1].free_blocks(), 5);
    }

    #[test]
    fn test_thread_ids_are_stable_and_distinct() {
        let here = current_thread_id();
        assert_ne!(here, 0);
        assert_eq!(here, current_thread_id());
        let there = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, there);
    }
}
