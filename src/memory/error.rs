//! Error taxonomy.
//!
//! `AllocError` and `ConfigError` are ordinary results the caller decides
//! about. `FatalError` is never returned: corruption and broken invariants go
//! through [`fatal`], which reports and then terminates.

use super::config::FatalAction;
use std::fmt;
use thiserror::Error;

/// The memory provider could not satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("memory provider could not supply {size} bytes")]
pub struct ProviderError {
    pub size: usize,
}

/// Recoverable allocation failure.
#[must_use = "allocation failures should be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The provider failed, directly or while refilling a bucket or
    /// bulk-allocating objects.
    #[error("out of memory: {0}")]
    OutOfMemory(#[from] ProviderError),

    /// `requested + overhead` does not fit in `usize`.
    #[error("allocation of {requested} bytes overflows once {overhead} bytes of block overhead are added")]
    AllocationTooLarge { requested: usize, overhead: usize },
}

/// Rejected allocator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("base block size {size} must be a power of two larger than {min} bytes")]
    InvalidBaseBlockSize { size: usize, min: usize },

    #[error("class count {count} outside 1..={max}")]
    InvalidClassCount { count: usize, max: usize },

    #[error("class limits table has {given} entries, expected {expected}")]
    LimitsLengthMismatch { given: usize, expected: usize },

    #[error("size class {class}: move count {move_count} must be in 1..={upper}")]
    InvalidMoveCount {
        class: usize,
        move_count: usize,
        upper: usize,
    },

    #[error("free-block clamp is empty: min {min} > max {max}")]
    InvalidFreeBlockClamp { min: usize, max: usize },

    #[error("object pool: {0}")]
    InvalidObjectPool(&'static str),

    #[error("global allocator already initialized")]
    AlreadyInitialized,
}

/// What a guard check found wrong with a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    HeadGuard { found: u32 },
    TailGuard { found: u8 },
    AlreadyFreed,
    ForeignBlock { class: u32 },
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptionKind::HeadGuard { found } => {
                write!(f, "head guard mismatch (found {found:#010x})")
            }
            CorruptionKind::TailGuard { found } => {
                write!(f, "tail guard mismatch (found {found:#04x})")
            }
            CorruptionKind::AlreadyFreed => f.write_str("block already freed"),
            CorruptionKind::ForeignBlock { class } => {
                write!(f, "foreign block (size class index {class})")
            }
        }
    }
}

/// Unrecoverable allocator state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("heap corruption on thread {thread}: {kind} (size class {class}, block {addr:#x})")]
    CorruptionDetected {
        thread: u64,
        class: ClassLabel,
        addr: usize,
        kind: CorruptionKind,
    },

    #[error("allocator invariant violated: {0}")]
    InvariantViolation(&'static str),
}

/// Size class as printed in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassLabel {
    Pooled(usize),
    Direct,
    Unknown(u32),
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassLabel::Pooled(idx) => write!(f, "{idx}"),
            ClassLabel::Direct => f.write_str("direct"),
            ClassLabel::Unknown(raw) => write!(f, "?{raw}"),
        }
    }
}

/// Report `err` and terminate.
#[cold]
#[inline(never)]
pub(crate) fn fatal(action: FatalAction, err: &FatalError) -> ! {
    tracing::error!(error = %err, "unrecoverable allocator state");
    match action {
        FatalAction::Panic => panic!("{err}"),
        FatalAction::Abort => {
            eprintln!("bucketcache: {err}");
            std::process::abort()
        }
    }
}
