use super::block::{BLOCK_ALIGN, HEADER_SIZE, TAIL_GUARD_SIZE};
use super::error::ConfigError;

/// Upper bound on the size-class ladder. Caches keep fixed arrays of this
/// length so building one never goes through the global allocator.
pub const MAX_SIZE_CLASSES: usize = 24;

/// Rebalancing thresholds for one size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassLimits {
    /// Free blocks a thread may hold before a drain is triggered.
    pub max_free_blocks: usize,
    /// Blocks moved per drain or refill.
    pub move_count: usize,
}

/// What to do once heap integrity can no longer be trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatalAction {
    /// Print the diagnostic and abort the process.
    Abort,
    /// Panic with the diagnostic. Lets tests observe the failure.
    Panic,
}

/// Configuration for `BucketAllocator`. All fields have sensible defaults.
#[derive(Clone, Debug)]
pub struct BucketConfig {
    /// Block size of class 0, header included. Class `i` is `base << i`.
    /// Default: 32.
    pub base_block_size: usize,

    /// Number of size classes. Default: 12 (32 B .. 64 KiB).
    pub class_count: usize,

    /// Bytes a thread may keep cached per class; divided by the block size
    /// and clamped to `min_free_blocks..=max_free_blocks`. Default: 64 KiB.
    pub cache_bytes_per_class: usize,

    /// Default: 4.
    pub min_free_blocks: usize,

    /// Default: 1024.
    pub max_free_blocks: usize,

    /// Explicit per-class thresholds, one entry per class. Overrides the
    /// byte-budget derivation when set.
    pub class_limits: Option<&'static [ClassLimits]>,

    /// Write and check guard values around every block. Default: on in
    /// debug builds.
    pub guard_bytes: bool,

    /// Default: [`FatalAction::Abort`].
    pub on_corruption: FatalAction,

    /// Size of a recyclable object, rounded up to 16. Default: 64.
    pub object_size: usize,

    /// Objects per bulk allocation and per shared-list transfer. Default: 64.
    pub object_batch: usize,

    /// Free objects a thread may hold before migrating a batch. Default: 256.
    pub object_high_water: usize,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            base_block_size: 32,
            class_count: 12,
            cache_bytes_per_class: 64 * 1024,
            min_free_blocks: 4,
            max_free_blocks: 1024,
            class_limits: None,
            guard_bytes: cfg!(debug_assertions),
            on_corruption: FatalAction::Abort,
            object_size: 64,
            object_batch: 64,
            object_high_water: 256,
        }
    }
}

impl BucketConfig {
    /// Thresholds for class `class` whose blocks are `block_size` bytes.
    #[must_use]
    pub fn limits_for(&self, class: usize, block_size: usize) -> ClassLimits {
        if let Some(table) = self.class_limits {
            return table[class];
        }
        let max_free_blocks = (self.cache_bytes_per_class / block_size)
            .clamp(self.min_free_blocks, self.max_free_blocks);
        ClassLimits {
            max_free_blocks,
            move_count: (max_free_blocks / 2).max(1),
        }
    }

    /// Physical size of one recyclable object.
    #[must_use]
    pub fn object_stride(&self) -> usize {
        self.object_size.max(BLOCK_ALIGN).next_multiple_of(BLOCK_ALIGN)
    }

    /// Check every field before an allocator is built.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let min = HEADER_SIZE + TAIL_GUARD_SIZE;
        if !self.base_block_size.is_power_of_two() || self.base_block_size <= min {
            return Err(ConfigError::InvalidBaseBlockSize {
                size: self.base_block_size,
                min,
            });
        }
        if self.class_count == 0 || self.class_count > MAX_SIZE_CLASSES {
            return Err(ConfigError::InvalidClassCount {
                count: self.class_count,
                max: MAX_SIZE_CLASSES,
            });
        }
        // Largest block stays below 2^61 so header arithmetic cannot wrap.
        let largest_shift = self.base_block_size.trailing_zeros() as usize + self.class_count - 1;
        if largest_shift > (usize::BITS - 3) as usize {
            return Err(ConfigError::InvalidClassCount {
                count: self.class_count,
                max: MAX_SIZE_CLASSES,
            });
        }
        match self.class_limits {
            Some(table) => {
                if table.len() != self.class_count {
                    return Err(ConfigError::LimitsLengthMismatch {
                        given: table.len(),
                        expected: self.class_count,
                    });
                }
                for (class, limits) in table.iter().enumerate() {
                    let upper = limits.max_free_blocks + 1;
                    if limits.move_count == 0 || limits.move_count > upper {
                        return Err(ConfigError::InvalidMoveCount {
                            class,
                            move_count: limits.move_count,
                            upper,
                        });
                    }
                }
            }
            None => {
                if self.min_free_blocks > self.max_free_blocks {
                    return Err(ConfigError::InvalidFreeBlockClamp {
                        min: self.min_free_blocks,
                        max: self.max_free_blocks,
                    });
                }
            }
        }
        if self.object_size == 0 || self.object_size > 64 * 1024 {
            return Err(ConfigError::InvalidObjectPool("object size outside 1..=65536"));
        }
        if self.object_batch == 0 {
            return Err(ConfigError::InvalidObjectPool("object batch must be non-zero"));
        }
        if self.object_stride().checked_mul(self.object_batch).is_none_or(|bytes| bytes > isize::MAX as usize / 2) {
            return Err(ConfigError::InvalidObjectPool("object batch does not fit in memory"));
        }
        if self.object_high_water < self.object_batch {
            return Err(ConfigError::InvalidObjectPool(
                "object high-water mark below the batch size",
            ));
        }
        Ok(())
    }
}
