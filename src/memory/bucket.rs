use super::block::FreeBlock;
use super::stats::BucketCounters;
use crate::sync::{Mutex, MutexGuard};
use std::ptr::NonNull;
use std::sync::{PoisonError, TryLockError};

/// Singly linked list of same-class free blocks.
///
/// `first`/`last` make splicing a whole batch O(1). Moving `n` blocks off the
/// front walks `n` links.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    first: Option<FreeBlock>,
    last: Option<FreeBlock>,
    len: usize,
}

// Safety: FreeList exclusively owns the blocks it links. Moving it to another
// thread moves that ownership with it.
unsafe impl Send for FreeList {}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self {
            first: None,
            last: None,
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub(crate) fn push_front(&mut self, block: FreeBlock) {
        block.set_next(self.first);
        if self.last.is_none() {
            self.last = Some(block);
        }
        self.first = Some(block);
        self.len += 1;
    }

    #[inline]
    pub(crate) fn pop_front(&mut self) -> Option<FreeBlock> {
        let block = self.first?;
        self.first = block.next();
        if self.first.is_none() {
            self.last = None;
        }
        self.len -= 1;
        Some(block)
    }

    /// Detach up to `n` blocks from the front.
    pub(crate) fn take_front(&mut self, n: usize) -> FreeList {
        if n >= self.len {
            return self.take_all();
        }
        if n == 0 {
            return FreeList::new();
        }
        let Some(first) = self.first else {
            return FreeList::new();
        };
        let mut last = first;
        for _ in 1..n {
            match last.next() {
                Some(next) => last = next,
                None => break,
            }
        }
        self.first = last.next();
        self.len -= n;
        last.set_next(None);
        FreeList {
            first: Some(first),
            last: Some(last),
            len: n,
        }
    }

    /// Put every block of `other` in front of this list.
    pub(crate) fn splice(&mut self, other: FreeList) {
        let (Some(first), Some(last)) = (other.first, other.last) else {
            return;
        };
        last.set_next(self.first);
        if self.last.is_none() {
            self.last = Some(last);
        }
        self.first = Some(first);
        self.len += other.len;
    }

    pub(crate) fn take_all(&mut self) -> FreeList {
        std::mem::take(self)
    }

    /// Cut `count` blocks of `block_size` bytes out of `base`, linked in
    /// address order.
    ///
    /// # Safety
    /// `base` is 16-byte aligned, writable for `count * block_size` bytes and
    /// owned by the caller, who gives it up to the returned list.
    pub(crate) unsafe fn carve(
        base: NonNull<u8>,
        count: usize,
        block_size: usize,
        class: u32,
    ) -> FreeList {
        let mut list = FreeList::new();
        for i in (0..count).rev() {
            // Safety: i * block_size < count * block_size (caller contract).
            let block = unsafe { FreeBlock::format(base.add(i * block_size), class) };
            list.push_front(block);
        }
        list
    }

    /// Iterate without detaching. Test and diagnostic use only.
    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = FreeBlock> + '_ {
        std::iter::successors(self.first, |b| b.next()).take(self.len)
    }
}

/// The shared cache's bucket for one class, guarded by its own lock.
pub(crate) struct SharedBucket {
    list: Mutex<FreeList>,
    pub(crate) counters: BucketCounters,
}

impl SharedBucket {
    pub(crate) fn new() -> Self {
        Self {
            list: Mutex::new(FreeList::new()),
            counters: BucketCounters::new(),
        }
    }

    /// Lock the list, counting contention. A poisoned lock is recovered: the
    /// list is only mutated through FreeList methods that cannot panic
    /// halfway.
    fn lock(&self) -> MutexGuard<'_, FreeList> {
        match self.list.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                self.counters.lock_waited();
                self.list.lock().unwrap_or_else(PoisonError::into_inner)
            }
        }
    }

    /// Lock-free, possibly stale view of the free count.
    #[inline]
    pub(crate) fn looks_empty(&self) -> bool {
        self.counters.free() == 0
    }

    #[inline]
    pub(crate) fn free_blocks(&self) -> usize {
        self.counters.free()
    }

    /// Move up to `n` blocks out. Empty if the bucket is empty once locked.
    pub(crate) fn take(&self, n: usize) -> FreeList {
        let mut list = self.lock();
        let taken = list.take_front(n);
        self.counters.set_free(list.len());
        drop(list);
        self.counters.removed(taken.len());
        taken
    }

    pub(crate) fn give(&self, blocks: FreeList) {
        let moved = blocks.len();
        if moved == 0 {
            return;
        }
        let mut list = self.lock();
        list.splice(blocks);
        self.counters.set_free(list.len());
        drop(list);
        self.counters.inserted(moved);
    }

    pub(crate) fn pop(&self) -> Option<FreeBlock> {
        self.take(1).pop_front()
    }

    pub(crate) fn push(&self, block: FreeBlock) {
        let mut one = FreeList::new();
        one.push_front(block);
        self.give(one);
    }
}
