pub(crate) mod allocator;
pub(crate) mod block;
pub(crate) mod bucket;
pub(crate) mod cache;
pub(crate) mod chunk;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod global;
pub(crate) mod loom_tests;
pub(crate) mod object_pool;
pub(crate) mod provider;
pub(crate) mod size_class;
// public: the process-wide byte gauges live here
pub mod stats;
pub(crate) mod thread_cache;

pub use allocator::BucketAllocator;
pub use thread_cache::ThreadCache;
