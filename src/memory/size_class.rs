use super::config::{BucketConfig, MAX_SIZE_CLASSES};

/// Geometry of one size class. Immutable once the table is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClass {
    /// Physical block size, header included.
    pub block_size: usize,
    /// Free blocks a thread may hold before draining to the shared cache.
    pub max_free_blocks: usize,
    /// Blocks moved per drain or refill.
    pub move_count: usize,
}

const EMPTY: SizeClass = SizeClass {
    block_size: 0,
    max_free_blocks: 0,
    move_count: 0,
};

/// The power-of-two ladder `base << i`.
///
/// Kept in a fixed array so building it never allocates; the allocator
/// itself may be the global one.
pub(crate) struct SizeClassTable {
    classes: [SizeClass; MAX_SIZE_CLASSES],
    len: usize,
    base_shift: u32,
}

impl SizeClassTable {
    /// Build from a validated config.
    pub(crate) fn from_config(config: &BucketConfig) -> Self {
        let mut classes = [EMPTY; MAX_SIZE_CLASSES];
        for (index, slot) in classes.iter_mut().enumerate().take(config.class_count) {
            let block_size = config.base_block_size << index;
            let limits = config.limits_for(index, block_size);
            *slot = SizeClass {
                block_size,
                max_free_blocks: limits.max_free_blocks,
                move_count: limits.move_count,
            };
        }
        Self {
            classes,
            len: config.class_count,
            base_shift: config.base_block_size.trailing_zeros(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn get(&self, class: usize) -> &SizeClass {
        &self.classes[..self.len][class]
    }

    pub(crate) fn classes(&self) -> &[SizeClass] {
        &self.classes[..self.len]
    }

    /// Largest pooled block, header included.
    #[inline]
    pub(crate) fn max_block_size(&self) -> usize {
        self.classes[self.len - 1].block_size
    }

    /// Smallest class whose block holds `total` bytes, or `None` when the
    /// request must go to the provider directly.
    #[inline]
    pub(crate) fn class_for(&self, total: usize) -> Option<usize> {
        if total > self.max_block_size() {
            return None;
        }
        let rounded = total.max(1 << self.base_shift).next_power_of_two();
        Some((rounded.trailing_zeros() - self.base_shift) as usize)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::config::ClassLimits;

    fn scenario_config() -> BucketConfig {
        static LIMITS: [ClassLimits; 4] = [
            ClassLimits { max_free_blocks: 8, move_count: 4 },
            ClassLimits { max_free_blocks: 8, move_count: 4 },
            ClassLimits { max_free_blocks: 4, move_count: 2 },
            ClassLimits { max_free_blocks: 4, move_count: 2 },
        ];
        BucketConfig {
            base_block_size: 32,
            class_count: 4,
            class_limits: Some(&LIMITS),
            ..BucketConfig::default()
        }
    }

    #[test]
    fn test_ladder_doubles() {
        let table = SizeClassTable::from_config(&scenario_config());
        let sizes: Vec<usize> = table.classes().iter().map(|c| c.block_size).collect();
        assert_eq!(sizes, vec![32, 64, 128, 256]);
        assert_eq!(table.max_block_size(), 256);
        assert_eq!(table.get(2).max_free_blocks, 4);
        assert_eq!(table.get(2).move_count, 2);
    }

    #[test]
    fn test_class_for_boundaries() {
        let table = SizeClassTable::from_config(&scenario_config());
        assert_eq!(table.class_for(0), Some(0));
        assert_eq!(table.class_for(1), Some(0));
        assert_eq!(table.class_for(32), Some(0));
        assert_eq!(table.class_for(33), Some(1));
        assert_eq!(table.class_for(64), Some(1));
        assert_eq!(table.class_for(65), Some(2));
        assert_eq!(table.class_for(256), Some(3));
        assert_eq!(table.class_for(257), None);
        assert_eq!(table.class_for(usize::MAX), None);
    }

    #[test]
    fn test_default_ladder_is_smallest_fit() {
        let table = SizeClassTable::from_config(&BucketConfig::default());
        assert_eq!(table.len(), 12);
        assert_eq!(table.max_block_size(), 64 * 1024);
        for total in 1..=table.max_block_size() {
            let class = table.class_for(total).unwrap();
            assert!(table.get(class).block_size >= total);
            if class > 0 {
                assert!(table.get(class - 1).block_size < total);
            }
        }
    }
}
