//! Block headers and the free/live distinction.
//!
//! Every pooled or direct allocation starts with a 16-byte [`BlockHeader`].
//! While the block sits in a free list the first word is the list link; while
//! it is handed out the same word holds the requested size. The two states are
//! separate types so a live payload can never be walked as a free list.
//!
//! ```text
//!  free:  [ next ptr | class | guard=FREED ][ ............ ]
//!  live:  [ req size | class | guard=LIVE  ][ payload | FD ][ slack ]
//!                                          ^ pointer handed to callers
//! ```
//!
//! Recovering a header from a caller's pointer happens in exactly one place,
//! [`LiveBlock::from_payload`], and its inverse is [`LiveBlock::payload`].

use super::error::CorruptionKind;
use std::ptr::NonNull;

/// Alignment of every header and payload.
pub(crate) const BLOCK_ALIGN: usize = 16;

/// Size of [`BlockHeader`].
pub(crate) const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Bytes reserved after the payload for the tail guard when guards are on.
pub(crate) const TAIL_GUARD_SIZE: usize = 1;

/// Size-class tag of blocks served straight from the provider.
pub(crate) const DIRECT_CLASS: u32 = u32::MAX;

/// Bytes a block needs on top of the requested size.
#[inline]
pub(crate) const fn overhead(guards: bool) -> usize {
    if guards { HEADER_SIZE + TAIL_GUARD_SIZE } else { HEADER_SIZE }
}

pub(crate) const HEAD_GUARD_LIVE: u32 = 0xB10C_A11C;
pub(crate) const HEAD_GUARD_FREED: u32 = 0xF4EE_B10C;
pub(crate) const TAIL_GUARD: u8 = 0xFD;

#[repr(C)]
pub(crate) struct BlockHeader {
    /// Requested size while live. Overlaid by the free-list link while free.
    requested_size: usize,
    size_class: u32,
    guard: u32,
}

const _: () = assert!(HEADER_SIZE == 16);
const _: () = assert!(HEADER_SIZE % BLOCK_ALIGN == 0);

/// A block owned by a free list.
///
/// Holding a `FreeBlock` means holding the only reference to that memory:
/// it is in at most one list, and nobody else reads its header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct FreeBlock(NonNull<BlockHeader>);

impl FreeBlock {
    /// Write a fresh free header at `base`.
    ///
    /// # Safety
    /// `base` is 16-byte aligned, writable for at least one block of `class`
    /// and not referenced by anything else.
    pub(crate) unsafe fn format(base: NonNull<u8>, class: u32) -> Self {
        debug_assert!(base.as_ptr().addr().is_multiple_of(BLOCK_ALIGN));
        let header = base.cast::<BlockHeader>();
        // Safety: caller contract.
        unsafe {
            header.write(BlockHeader {
                requested_size: 0,
                size_class: class,
                guard: HEAD_GUARD_FREED,
            });
        }
        let block = Self(header);
        block.set_next(None);
        block
    }

    #[inline]
    pub(crate) fn next(self) -> Option<FreeBlock> {
        // Safety: a free block's first word is always a valid link (written by
        // `format`, `set_next` or `LiveBlock::into_free`).
        unsafe { self.0.cast::<Option<FreeBlock>>().read() }
    }

    #[inline]
    pub(crate) fn set_next(self, next: Option<FreeBlock>) {
        // Safety: the block is owned by the caller's list.
        unsafe { self.0.cast::<Option<FreeBlock>>().write(next) }
    }

    /// Start address of the block, header included.
    #[inline]
    pub(crate) fn base(self) -> NonNull<u8> {
        self.0.cast()
    }

    /// Hand the block out: stamp class, requested size and guards.
    ///
    /// The caller must have picked a class whose block size covers
    /// `requested_size` plus overhead.
    #[inline]
    pub(crate) fn into_live(self, class: u32, requested_size: usize, guards: bool) -> LiveBlock {
        // Safety: the block is owned by the caller and large enough.
        unsafe { LiveBlock::stamp(self.base(), class, requested_size, guards) }
    }
}

/// A block currently owned by a caller.
#[derive(Debug)]
pub(crate) struct LiveBlock(NonNull<BlockHeader>);

impl LiveBlock {
    /// Write a live header at `base`.
    ///
    /// # Safety
    /// `base` is 16-byte aligned and writable for
    /// `HEADER_SIZE + requested_size (+ TAIL_GUARD_SIZE if guards)` bytes.
    pub(crate) unsafe fn stamp(
        base: NonNull<u8>,
        class: u32,
        requested_size: usize,
        guards: bool,
    ) -> Self {
        debug_assert!(base.as_ptr().addr().is_multiple_of(BLOCK_ALIGN));
        let header = base.cast::<BlockHeader>();
        // Safety: caller contract.
        unsafe {
            header.write(BlockHeader {
                requested_size,
                size_class: class,
                guard: if guards { HEAD_GUARD_LIVE } else { 0 },
            });
        }
        let block = Self(header);
        if guards {
            block.write_tail_guard();
        }
        block
    }

    /// Pointer handed to callers.
    #[inline]
    pub(crate) fn payload(self) -> NonNull<u8> {
        // Safety: every block is at least HEADER_SIZE bytes, so one past the
        // header is within (or one past) the same allocation.
        unsafe { self.0.cast::<u8>().add(HEADER_SIZE) }
    }

    /// Recover the block from a pointer previously returned by
    /// [`payload`](Self::payload).
    ///
    /// # Safety
    /// `payload` came from `payload()` on a block that is still live.
    #[inline]
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        // Safety: caller contract; the header precedes the payload.
        Self(unsafe { payload.sub(HEADER_SIZE) }.cast())
    }

    /// Start address of the block, as obtained from the provider or carved.
    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.0.cast()
    }

    #[inline]
    pub(crate) fn size_class(&self) -> u32 {
        // Safety: live header.
        unsafe { (*self.0.as_ptr()).size_class }
    }

    #[inline]
    pub(crate) fn requested_size(&self) -> usize {
        // Safety: live header.
        unsafe { (*self.0.as_ptr()).requested_size }
    }

    /// Shrink or grow within the block. The caller checked the block is big
    /// enough.
    pub(crate) fn set_requested_size(&mut self, requested_size: usize, guards: bool) {
        // Safety: live header owned by the caller.
        unsafe { (*self.0.as_ptr()).requested_size = requested_size };
        if guards {
            self.write_tail_guard();
        }
    }

    /// Address reported in corruption diagnostics.
    pub(crate) fn addr(&self) -> usize {
        self.0.as_ptr().addr() + HEADER_SIZE
    }

    fn tail_guard_ptr(&self) -> *mut u8 {
        let payload = self.0.cast::<u8>().as_ptr().wrapping_add(HEADER_SIZE);
        payload.wrapping_add(self.requested_size())
    }

    fn write_tail_guard(&self) {
        // Safety: stamp/set_requested_size callers reserved the guard byte.
        unsafe { self.tail_guard_ptr().write(TAIL_GUARD) };
    }

    /// Check a block being freed or resized.
    ///
    /// `class_count` bounds the valid pooled indices. The class check always
    /// runs; guard checks only when `guards` is set.
    pub(crate) fn verify(&self, guards: bool, class_count: usize) -> Result<(), CorruptionKind> {
        if guards {
            // Safety: live (or supposedly live) header.
            let guard = unsafe { (*self.0.as_ptr()).guard };
            match guard {
                HEAD_GUARD_LIVE => {}
                HEAD_GUARD_FREED => return Err(CorruptionKind::AlreadyFreed),
                found => return Err(CorruptionKind::HeadGuard { found }),
            }
        }
        let class = self.size_class();
        if class != DIRECT_CLASS && class as usize >= class_count {
            return Err(CorruptionKind::ForeignBlock { class });
        }
        if guards {
            // Safety: the head guard matched, so requested_size is trusted.
            let found = unsafe { self.tail_guard_ptr().read() };
            if found != TAIL_GUARD {
                return Err(CorruptionKind::TailGuard { found });
            }
        }
        Ok(())
    }

    /// Return the block to free-list ownership.
    #[inline]
    pub(crate) fn into_free(self, guards: bool) -> FreeBlock {
        if guards {
            // Safety: owned header.
            unsafe { (*self.0.as_ptr()).guard = HEAD_GUARD_FREED };
        }
        let block = FreeBlock(self.0);
        block.set_next(None);
        block
    }
}
