//! Ledger of provider regions that were carved rather than handed out whole.
//!
//! Refill chunks and object batches are split into blocks that scatter across
//! every cache, so nothing else remembers where they came from. Each region
//! carries a small header linking it into its ledger, and the ledger gives
//! them all back when the allocator is dropped.

use super::error::ProviderError;
use super::provider::MemoryProvider;
use super::stats;
use crate::sync::Mutex;
use crate::sync::atomic::{AtomicUsize, Ordering};
use std::ptr::NonNull;
use std::sync::PoisonError;

#[repr(C)]
struct ChunkHeader {
    next: Option<NonNull<ChunkHeader>>,
    /// Full size requested from the provider, header included.
    size: usize,
}

/// Header in front of every ledger region. Keeps the carved area 16-aligned.
pub(crate) const CHUNK_HEADER_SIZE: usize = 16;

const _: () = assert!(size_of::<ChunkHeader>() == CHUNK_HEADER_SIZE);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LedgerKind {
    /// Chunks carved into size-class blocks.
    Chunks,
    /// Bulk-allocated recyclable objects.
    ObjectBatches,
}

struct ChunkList {
    head: Option<NonNull<ChunkHeader>>,
}

// Safety: the list owns the regions it links; access goes through the ledger
// mutex.
unsafe impl Send for ChunkList {}

pub(crate) struct ChunkLedger {
    kind: LedgerKind,
    list: Mutex<ChunkList>,
    bytes: AtomicUsize,
    regions: AtomicUsize,
}

impl ChunkLedger {
    pub(crate) fn new(kind: LedgerKind) -> Self {
        Self {
            kind,
            list: Mutex::new(ChunkList { head: None }),
            bytes: AtomicUsize::new(0),
            regions: AtomicUsize::new(0),
        }
    }

    /// Obtain a region with `payload` usable bytes and record it.
    pub(crate) fn acquire<P: MemoryProvider>(
        &self,
        provider: &P,
        payload: usize,
    ) -> Result<NonNull<u8>, ProviderError> {
        let size = payload
            .checked_add(CHUNK_HEADER_SIZE)
            .ok_or(ProviderError { size: payload })?;
        let base = provider.system_alloc(size)?;
        let header = base.cast::<ChunkHeader>();
        {
            let mut list = self.list.lock().unwrap_or_else(PoisonError::into_inner);
            // Safety: fresh provider memory, at least CHUNK_HEADER_SIZE bytes.
            unsafe { header.write(ChunkHeader { next: list.head, size }) };
            list.head = Some(header);
        }
        self.bytes.fetch_add(size, Ordering::Relaxed);
        self.regions.fetch_add(1, Ordering::Relaxed);
        self.gauge_add(size);
        // Safety: size > CHUNK_HEADER_SIZE, so the payload is in bounds.
        Ok(unsafe { base.add(CHUNK_HEADER_SIZE) })
    }

    /// Give every recorded region back to `provider`.
    ///
    /// Only sound once no block carved from these regions is reachable.
    pub(crate) fn release_all<P: MemoryProvider>(&self, provider: &P) -> usize {
        let mut next = self
            .list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .head
            .take();
        let mut released = 0;
        while let Some(header) = next {
            // Safety: every linked header was written by `acquire`.
            let ChunkHeader { next: following, size } = unsafe { header.read() };
            // Safety: the region came from this provider with this size.
            unsafe { provider.system_free(header.cast(), size) };
            self.gauge_sub(size);
            released += 1;
            next = following;
        }
        self.bytes.store(0, Ordering::Relaxed);
        self.regions.store(0, Ordering::Relaxed);
        released
    }

    /// Bytes currently held, headers included.
    pub(crate) fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn regions(&self) -> usize {
        self.regions.load(Ordering::Relaxed)
    }

    fn gauge_add(&self, size: usize) {
        match self.kind {
            LedgerKind::Chunks => stats::CHUNK_BYTES.add(size),
            LedgerKind::ObjectBatches => stats::OBJECT_BATCH_BYTES.add(size),
        }
    }

    fn gauge_sub(&self, size: usize) {
        match self.kind {
            LedgerKind::Chunks => stats::CHUNK_BYTES.sub(size),
            LedgerKind::ObjectBatches => stats::OBJECT_BATCH_BYTES.sub(size),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::provider::CountingProvider;

    #[test]
    fn test_acquire_records_and_release_all_frees() {
        let provider = CountingProvider::new();
        let ledger = ChunkLedger::new(LedgerKind::Chunks);
        for payload in [256, 1024, 4096] {
            let ptr = ledger.acquire(&provider, payload).unwrap();
            assert!(ptr.as_ptr().addr().is_multiple_of(16));
            // Safety: Test code, payload bytes are ours.
            unsafe { ptr.as_ptr().write_bytes(0xAB, payload) };
            assert_eq!(provider.last_alloc_size(), payload + CHUNK_HEADER_SIZE);
        }
        assert_eq!(ledger.regions(), 3);
        assert_eq!(ledger.bytes(), 256 + 1024 + 4096 + 3 * CHUNK_HEADER_SIZE);

        assert_eq!(ledger.release_all(&provider), 3);
        assert_eq!(provider.free_calls(), 3);
        assert_eq!(provider.live_bytes(), 0);
        assert_eq!(ledger.bytes(), 0);
        assert_eq!(ledger.release_all(&provider), 0);
    }

    #[test]
    fn test_acquire_propagates_provider_failure() {
        let provider = CountingProvider::with_budget(512);
        let ledger = ChunkLedger::new(LedgerKind::ObjectBatches);
        assert_eq!(
            ledger.acquire(&provider, 1024),
            Err(ProviderError { size: 1024 + CHUNK_HEADER_SIZE })
        );
        assert_eq!(ledger.regions(), 0);
        assert_eq!(ledger.release_all(&provider), 0);
    }
}
