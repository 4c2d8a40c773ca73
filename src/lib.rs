#[cfg(not(target_pointer_width = "64"))]
compile_error!("bucketcache supports only 64-bit targets.");

pub(crate) mod sync;

// public module: implementation details stay pub(crate), the process-wide
// gauges in `memory::stats` are public
pub mod memory;

// allocators
pub use memory::allocator::BucketAllocator;
pub use memory::global::GlobalBucketAllocator;
pub use memory::thread_cache::ThreadCache;

// config/providers
pub use memory::config::{BucketConfig, ClassLimits, FatalAction, MAX_SIZE_CLASSES};
pub use memory::provider::{CountingProvider, MIN_PROVIDER_ALIGN, MemoryProvider, SystemProvider};
pub use memory::size_class::SizeClass;

// stats
pub use memory::stats::{AllocatorStats, BucketStats, CacheStats, Counter};

// errors
pub use memory::error::{
    AllocError, ClassLabel, ConfigError, CorruptionKind, FatalError, ProviderError,
};
