//! Runs the whole test binary on top of the bucket allocator.

use bucketcache::GlobalBucketAllocator;
use std::collections::HashMap;
use std::thread;

#[global_allocator]
static GLOBAL: GlobalBucketAllocator = GlobalBucketAllocator;

#[test]
fn test_collections_churn() {
    let mut map: HashMap<String, Vec<u64>> = HashMap::new();
    for i in 0..2_000u64 {
        map.entry(format!("key-{}", i % 97))
            .or_default()
            .push(i);
    }
    assert_eq!(map.len(), 97);
    assert_eq!(map.values().map(Vec::len).sum::<usize>(), 2_000);

    let mut text = String::new();
    for i in 0..500 {
        text.push_str(&i.to_string());
    }
    text.shrink_to_fit();
    assert!(text.starts_with("0123"));
}

#[test]
fn test_large_and_growing_buffers() {
    let mut big = vec![0u8; 1 << 20];
    big[(1 << 20) - 1] = 7;
    big.resize(3 << 20, 1);
    assert_eq!(big[(1 << 20) - 1], 7);
    assert_eq!(big[(3 << 20) - 1], 1);

    let mut grow = Vec::new();
    for i in 0..100_000u32 {
        grow.push(i);
    }
    assert_eq!(grow.iter().map(|&x| u64::from(x)).sum::<u64>(), 4_999_950_000);
}

#[test]
fn test_thread_churn_hands_memory_across_threads() {
    let handles: Vec<_> = (0..8)
        .map(|t| {
            thread::spawn(move || {
                (0..1_000)
                    .map(|i| vec![t as u8; 1 + (i * 13) % 700])
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    // Blocks from exited threads are freed here, on another thread's cache.
    for (t, h) in handles.into_iter().enumerate() {
        let vecs = h.join().unwrap();
        assert!(vecs.iter().all(|v| v.iter().all(|&b| b == t as u8)));
    }
}

#[test]
fn test_objects_and_stats_report() {
    let objs: Vec<_> = (0..300).map(|_| GlobalBucketAllocator::obj_alloc().unwrap()).collect();
    for obj in objs {
        // Safety: each object came from obj_alloc above.
        unsafe { GlobalBucketAllocator::obj_free(obj) };
    }

    let report = GlobalBucketAllocator::dump_stats();
    assert!(report.starts_with("bucketcache:"));
    assert!(report.contains("cache shared"));
    assert!(report.contains("cache thread="));
}
