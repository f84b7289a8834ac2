//! DMA page pool: one pinned contiguous block carved into fixed pages.
//!
//! The pool allocates a single aligned, zeroed block at construction; that
//! block is what gets registered with the DMA engine (`base_address()` /
//! `base_size()`). Pages are fixed-size slots inside it, handed out as
//! [`PageRef`] handles and reused for the lifetime of the pool.
//!
//! # Ownership
//!
//! A [`PageRef`] is a move-only handle: it carries the slot index and a
//! cached pointer to the page, and its `Drop` is the terminal release that
//! pushes the slot back on the free list. Because the handle cannot be
//! cloned, a page is owned by exactly one holder at any instant and double
//! release is unrepresentable.
//!
//! # Page layout
//!
//! ```text
//! [ header reserve ][ payload (usable DMA region) ][ tail padding ]
//! ```
//!
//! The usable region is `page_size - header_reserve` rounded down to a
//! 32 KiB multiple (hardware DMA granularity); a geometry where that
//! rounds to zero fails pool construction. The page tags themselves
//! ([`PageHeader`]) live typed in the handle, not serialized into the
//! reserve; the reserve only shapes the DMA offsets.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use readout_core::{PageHeader, PoolConfig, ReadoutError, ReadoutResult};
use tracing::info;

/// The single contiguous allocation backing all pages.
struct Block {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the block is plain memory; slot-level exclusivity is enforced by
// the free list (each index held by at most one PageRef).
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

struct PoolInner {
    block: Block,
    page_size: usize,
    page_count: usize,
    header_reserve: usize,
    usable_size: usize,
    /// Lock-free free list of slot indices.
    free: SegQueue<usize>,
    available: AtomicUsize,
    total_acquires: AtomicU64,
    total_releases: AtomicU64,
}

/// Shared handle to the page pool. Cheap to clone; all clones and all
/// outstanding [`PageRef`]s keep the block alive.
#[derive(Clone)]
pub struct PagePool {
    inner: Arc<PoolInner>,
}

impl PagePool {
    /// Allocate the block and populate the free list.
    ///
    /// Fails with a configuration error when the geometry leaves no usable
    /// DMA region or the block cannot be allocated.
    pub fn new(cfg: &PoolConfig) -> ReadoutResult<Self> {
        cfg.validate()?;
        let usable_size = cfg.usable_page_size();

        let block_size = cfg.page_count * cfg.page_size;
        let layout = Layout::from_size_align(block_size, cfg.alignment)
            .map_err(|e| ReadoutError::Config(format!("bad pool layout: {}", e)))?;
        // SAFETY: layout has nonzero size (validated above).
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            ReadoutError::Config(format!("failed to allocate {} byte pool block", block_size))
        })?;

        let free = SegQueue::new();
        for i in 0..cfg.page_count {
            free.push(i);
        }

        info!(
            page_count = cfg.page_count,
            page_size = cfg.page_size,
            usable_size,
            total_mb = block_size as f64 / (1024.0 * 1024.0),
            "page pool created"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                block: Block { ptr, layout },
                page_size: cfg.page_size,
                page_count: cfg.page_count,
                header_reserve: cfg.header_reserve,
                usable_size,
                free,
                available: AtomicUsize::new(cfg.page_count),
                total_acquires: AtomicU64::new(0),
                total_releases: AtomicU64::new(0),
            }),
        })
    }

    /// Start of the contiguous block registered with the DMA engine.
    pub fn base_address(&self) -> *const u8 {
        self.inner.block.ptr.as_ptr()
    }

    /// Size of the registered block in bytes.
    pub fn base_size(&self) -> usize {
        self.inner.page_count * self.inner.page_size
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    pub fn page_count(&self) -> usize {
        self.inner.page_count
    }

    pub fn header_reserve(&self) -> usize {
        self.inner.header_reserve
    }

    /// Usable DMA bytes per page (32 KiB aligned).
    pub fn usable_page_size(&self) -> usize {
        self.inner.usable_size
    }

    /// Take a free page, `None` when the pool is exhausted. O(1).
    pub fn acquire(&self) -> Option<PageRef> {
        let index = self.inner.free.pop()?;
        self.inner.available.fetch_sub(1, Ordering::Relaxed);
        self.inner.total_acquires.fetch_add(1, Ordering::Relaxed);
        // SAFETY: index < page_count, so the offset stays inside the block.
        let ptr = unsafe { self.inner.block.ptr.as_ptr().add(index * self.inner.page_size) };
        Some(PageRef {
            inner: Arc::clone(&self.inner),
            index,
            ptr,
            header: PageHeader::default(),
        })
    }

    /// Check that a handle really belongs to this pool.
    ///
    /// Guards against a driver returning a stray page.
    pub fn is_valid(&self, page: &PageRef) -> bool {
        Arc::ptr_eq(&self.inner, &page.inner) && page.index < self.inner.page_count
    }

    /// Number of pages currently on the free list.
    pub fn available(&self) -> usize {
        self.inner.available.load(Ordering::Relaxed)
    }

    pub fn total_acquires(&self) -> u64 {
        self.inner.total_acquires.load(Ordering::Relaxed)
    }

    pub fn total_releases(&self) -> u64 {
        self.inner.total_releases.load(Ordering::Relaxed)
    }
}

/// Move-only handle to one pooled page.
///
/// Dropping the handle is the terminal release: the slot returns to the
/// free list. The handle also carries the page tags ([`PageHeader`])
/// populated by the equipment producer.
pub struct PageRef {
    inner: Arc<PoolInner>,
    index: usize,
    /// Cached page base pointer, valid for the life of the handle: the
    /// block is never moved or freed while any handle holds the Arc.
    ptr: *mut u8,
    header: PageHeader,
}

// SAFETY: the handle has exclusive ownership of its slot (the index is off
// the free list until Drop), so moving it across threads is sound; shared
// references only permit reads of slot memory and tags.
unsafe impl Send for PageRef {}
unsafe impl Sync for PageRef {}

impl PageRef {
    pub fn header(&self) -> &PageHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut PageHeader {
        &mut self.header
    }

    /// Slot index within the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Byte offset of the usable region from the pool base address, as
    /// submitted to the DMA engine.
    pub fn dma_offset(&self) -> usize {
        self.index * self.inner.page_size + self.inner.header_reserve
    }

    /// The full usable DMA region.
    pub fn payload(&self) -> &[u8] {
        // SAFETY: exclusive slot ownership; region stays inside the block.
        unsafe {
            std::slice::from_raw_parts(
                self.ptr.add(self.inner.header_reserve),
                self.inner.usable_size,
            )
        }
    }

    /// Mutable access to the usable DMA region.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: exclusive slot ownership via &mut self.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ptr.add(self.inner.header_reserve),
                self.inner.usable_size,
            )
        }
    }

    /// The payload bytes actually written, per the `data_size` tag.
    pub fn data(&self) -> &[u8] {
        let len = (self.header.data_size as usize).min(self.inner.usable_size);
        &self.payload()[..len]
    }

    /// Zero the usable region (`cleanPageBeforeUse`).
    pub fn zero_payload(&mut self) {
        self.payload_mut().fill(0);
    }
}

impl std::fmt::Debug for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRef")
            .field("index", &self.index)
            .field("header", &self.header)
            .finish()
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        self.inner.free.push(self.index);
        self.inner.available.fetch_add(1, Ordering::Relaxed);
        self.inner.total_releases.fetch_add(1, Ordering::Relaxed);
    }
}
