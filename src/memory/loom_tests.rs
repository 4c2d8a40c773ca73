/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// Exercise the Mutex-protected shared structures and the registry under
/// the interleavings loom can explore.
///
/// # Design notes
///
/// Loom exhaustively enumerates thread interleavings, so:
///   - Thread counts kept to 2 (state space is exponential).
///   - Loop iterations minimised to 1-2 per thread.
///   - Tests that use BucketAllocator create a fresh instance per iteration
///     with a 2-class ladder, so one chunk is only two blocks.
///   - GlobalBucketAllocator NOT tested: its static OnceLock and the native
///     thread-local slot do not reset between loom iterations. Everything
///     it reaches (registry, shared buckets, refill/drain) is reachable
///     through instance-based tests.
///   - Free-list memory in the bucket tests is a plain `Vec<u128>`; the
///     links inside it are owned by whoever holds the list, and hand-over
///     always goes through a loom Mutex.
#[cfg(loom)]
mod tests {
    use crate::memory::allocator::BucketAllocator;
    use crate::memory::config::{BucketConfig, ClassLimits, FatalAction};
    use crate::sync::Arc;
    use std::ptr::NonNull;

    // =====================================================================
    // Helpers
    // =====================================================================

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut b = loom::model::Builder::new();
        b.preemption_bound = Some(preemption);
        b
    }

    static TINY_LIMITS: [ClassLimits; 2] = [
        ClassLimits { max_free_blocks: 2, move_count: 1 },
        ClassLimits { max_free_blocks: 2, move_count: 1 },
    ];

    /// 32 and 64 byte classes, guards on.
    fn tiny_allocator() -> BucketAllocator {
        let config = BucketConfig {
            base_block_size: 32,
            class_count: 2,
            class_limits: Some(&TINY_LIMITS),
            guard_bytes: true,
            on_corruption: FatalAction::Panic,
            object_size: 16,
            object_batch: 2,
            object_high_water: 2,
            ..BucketConfig::default()
        };
        BucketAllocator::with_config(config).unwrap()
    }

    fn slab(blocks: usize, block_size: usize) -> Vec<u128> {
        vec![0u128; blocks * block_size / 16]
    }

    fn slab_base(buf: &mut [u128]) -> NonNull<u8> {
        NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap()
    }

    // =====================================================================
    // 1. stats::Counter
    // =====================================================================

    #[test]
    fn loom_counter_concurrent_add_sub() {
        use crate::memory::stats::Counter;

        loom::model(|| {
            let counter = Arc::new(Counter::new());
            let c1 = counter.clone();
            let c2 = counter.clone();

            let t1 = loom::thread::spawn(move || {
                c1.add(10);
                c1.add(5);
            });

            let t2 = loom::thread::spawn(move || {
                c2.sub(3);
                c2.add(8);
            });

            t1.join().unwrap();
            t2.join().unwrap();

            // 10 + 5 - 3 + 8 = 20
            assert_eq!(counter.get(), 20);
        });
    }

    // =====================================================================
    // 2. SharedBucket: batch take/give against single pop/push
    // =====================================================================

    #[test]
    fn loom_shared_bucket_take_give_vs_pop_push() {
        use crate::memory::bucket::{FreeList, SharedBucket};

        bounded(2).check(|| {
            let mut buf = slab(4, 32);
            // Safety: Test code, the slab holds four 32-byte blocks.
            let list = unsafe { FreeList::carve(slab_base(&mut buf), 4, 32, 0) };
            let bucket = Arc::new(SharedBucket::new());
            bucket.give(list);

            let b1 = bucket.clone();
            let b2 = bucket.clone();

            let t1 = loom::thread::spawn(move || {
                let batch = b1.take(2);
                assert!(batch.len() <= 2);
                b1.give(batch);
            });

            let t2 = loom::thread::spawn(move || {
                if let Some(block) = b2.pop() {
                    b2.push(block);
                }
            });

            t1.join().unwrap();
            t2.join().unwrap();

            // Nothing lost, nothing duplicated.
            assert_eq!(bucket.free_blocks(), 4);
            assert_eq!(bucket.take(8).len(), 4);
        });
    }

    // =====================================================================
    // 3. SharedObjects: two threads trading batches
    // =====================================================================

    #[test]
    fn loom_shared_objects_concurrent_batches() {
        use crate::memory::object_pool::{ObjectList, SharedObjects};

        bounded(2).check(|| {
            let mut buf = slab(4, 16);
            // Safety: Test code, the slab holds four 16-byte objects.
            let list = unsafe { ObjectList::carve(slab_base(&mut buf), 4, 16) };
            let shared = Arc::new(SharedObjects::new());
            shared.give(list);

            let s1 = shared.clone();
            let s2 = shared.clone();

            let t1 = loom::thread::spawn(move || {
                let batch = s1.take(2);
                s1.give(batch);
            });

            let t2 = loom::thread::spawn(move || {
                let batch = s2.take(3);
                s2.give(batch);
            });

            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(shared.free_objects(), 4);
        });
    }

    // =====================================================================
    // 4. BucketAllocator: two thread caches racing on lazy init,
    //    registration, refill and teardown
    // =====================================================================

    #[test]
    fn loom_thread_caches_alloc_free_teardown() {
        bounded(2).check(|| {
            let allocator = Arc::new(tiny_allocator());
            let a1 = allocator.clone();
            let a2 = allocator.clone();

            let t1 = loom::thread::spawn(move || {
                let mut cache = a1.thread_cache().unwrap();
                let p = cache.alloc(8).unwrap();
                // Safety: Test code.
                unsafe {
                    p.as_ptr().write(0xAA);
                    assert_eq!(p.as_ptr().read(), 0xAA);
                    cache.free(p);
                }
            });

            let t2 = loom::thread::spawn(move || {
                let mut cache = a2.thread_cache().unwrap();
                let p = cache.alloc(40).unwrap();
                // Safety: Test code.
                unsafe {
                    p.as_ptr().write(0xBB);
                    assert_eq!(p.as_ptr().read(), 0xBB);
                    cache.free(p);
                }
            });

            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(allocator.thread_caches(), 0);
            // Each thread carved one 64-byte chunk and drained it on exit.
            assert_eq!(allocator.shared_free_blocks(0), 2);
            assert_eq!(allocator.shared_free_blocks(1), 1);
        });
    }

    // =====================================================================
    // 5. Cross-thread free: block served by one cache, freed by another
    // =====================================================================

    #[test]
    fn loom_cross_thread_free() {
        bounded(2).check(|| {
            let allocator = Arc::new(tiny_allocator());
            let a1 = allocator.clone();

            let t = loom::thread::spawn(move || {
                let mut cache = a1.thread_cache().unwrap();
                cache.alloc(8).unwrap().as_ptr() as usize
            });

            let addr = t.join().unwrap();
            let ptr = NonNull::new(addr as *mut u8).unwrap();
            let mut cache = allocator.thread_cache().unwrap();
            // Safety: Test code, the block is live and owned by nobody else.
            unsafe { cache.free(ptr) };
            assert_eq!(cache.free_blocks(0), 1);
        });
    }

    // =====================================================================
    // 6. Unbound path against a thread cache on the same bucket
    // =====================================================================

    #[test]
    fn loom_unbound_and_cached_share_a_bucket() {
        bounded(2).check(|| {
            let allocator = Arc::new(tiny_allocator());
            let a1 = allocator.clone();
            let a2 = allocator.clone();

            let t1 = loom::thread::spawn(move || {
                let p = a1.alloc(8).unwrap();
                // Safety: Test code.
                unsafe { a1.free(p) };
            });

            let t2 = loom::thread::spawn(move || {
                let mut cache = a2.thread_cache().unwrap();
                let o = cache.obj_alloc().unwrap();
                let p = cache.alloc(8).unwrap();
                // Safety: Test code.
                unsafe {
                    cache.free(p);
                    cache.obj_free(o);
                }
            });

            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(allocator.thread_caches(), 0);
            assert_eq!(allocator.shared_free_objects(), 2);
        });
    }
}
