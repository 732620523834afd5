//! General-purpose heap with segregated free bins.
//!
//! The heap manages one or more caller-supplied memory pools. Every pool is
//! tiled by blocks, each starting with an in-band header (see the `block`
//! module) that records the block size, the size of the preceding block, a
//! magic value, a caller-visible tag and the allocation state.
//!
//! # Algorithm
//!
//! - **Bins**: free blocks are kept in [`ilist::List`]s indexed by payload
//!   size class. Bin `i` holds blocks whose payload lies in `[2^i, 2^(i+1))`.
//!   A bitmask records which bins are non-empty.
//! - **Allocation**: the request is rounded up to the heap alignment. The
//!   first block of the lowest non-empty bin whose every member fits is taken
//!   in O(1). If no such bin exists, the request's own size class is scanned
//!   first-fit. Oversized blocks are split and the remainder returns to its
//!   bin.
//! - **Deallocation**: the header is validated, the block is merged with a
//!   free successor and a free predecessor, and the result is appended to the
//!   back of its bin.
//! - **Reallocation**: shrinking splits in place, growing absorbs a free
//!   successor when it is large enough, and otherwise the payload moves to a
//!   fresh block.
//!
//! At no point are two free blocks adjacent, and every free block is in
//! exactly one bin.
//!
//! # Contract violations
//!
//! Freeing a pointer that the heap never handed out, freeing a block twice or
//! freeing through a corrupted header is reported through [`fault::fatal`],
//! which halts the system.
//!
//! # Concurrency
//!
//! All state lives behind a [`ksync::Mutex`]. Every operation may therefore
//! block and must not be called from interrupt context.
//!
//! # Usage Example
//!
//! ```rust
//! use allocator::heap::Heap;
//!
//! let heap = Heap::new(8);
//! let pool: &'static mut [u8] = Box::leak(vec![0_u8; 4096].into_boxed_slice());
//! heap.add_pool(pool).unwrap();
//!
//! let a = heap.alloc(100).unwrap();
//! unsafe { heap.tag(a, 7) };
//! let a = unsafe { heap.realloc(Some(a), 400) }.unwrap();
//! unsafe { heap.free(a) };
//!
//! assert_eq!(heap.bytes_free(), heap.biggest_available_chunk());
//! ```

use core::{fmt, ptr::NonNull};

use arrayvec::ArrayVec;
use fault::Location;
use ilist::List;
use ksync::{Mutex, MutexGuard};
use snafu::{OptionExt as _, Snafu, ensure};

use self::block::{BLOCK_MAGIC, Block, BlockFlags, Geometry, STALE_MAGIC};

mod block;
mod global;

/// Maximum number of pools a single heap can manage.
pub const MAX_POOLS: usize = 8;

const BIN_COUNT: usize = usize::BITS as usize;

/// Errors reported by the heap.
///
/// Pool registration errors are returned to the caller. The remaining
/// variants describe contract violations and are passed to [`fault::fatal`].
#[derive(Debug, Snafu)]
pub enum HeapError {
    #[snafu(display("heap already manages {max} pools"))]
    TooManyPools {
        max: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("pool of {size} bytes cannot hold a single block"))]
    PoolTooSmall {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("pool {start:#x}..{end:#x} overlaps a registered pool"))]
    PoolOverlap {
        start: usize,
        end: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("pointer {addr:#x} was not allocated from this heap"))]
    ForeignPointer {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block header for {addr:#x} is corrupted"))]
    CorruptHeader {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {addr:#x} freed twice"))]
    DoubleFree {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap invariant violated: {what}"))]
    Inconsistent {
        what: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
}

/// One block reported by [`Heap::walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkEntry {
    /// Payload pointer of an allocated block, `None` for a free block.
    pub block: Option<NonNull<u8>>,
    /// Tag of an allocated block, `0` for a free block.
    pub tag: u16,
    /// Payload size in bytes.
    pub size: usize,
}

/// Snapshot of the heap's accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub total_bytes: usize,
    pub bytes_free: usize,
    pub min_bytes_free: usize,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    pub largest_free: usize,
}

#[derive(Debug, Clone, Copy)]
struct Pool {
    start: NonNull<u8>,
    end: usize,
}

impl Pool {
    fn start_addr(&self) -> usize {
        self.start.addr().get()
    }

    fn len(&self) -> usize {
        self.end - self.start_addr()
    }

    fn contains(&self, addr: usize) -> bool {
        (self.start_addr()..self.end).contains(&addr)
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.start_addr() < other.end && other.start_addr() < self.end
    }

    fn first_block(&self) -> Block {
        unsafe { Block::at(self.start) }
    }
}

fn bin_index(payload: usize) -> usize {
    debug_assert!(payload > 0);
    (usize::BITS - 1 - payload.leading_zeros()) as usize
}

/// Returns the lowest bin whose every member can hold `payload` bytes.
fn fit_bin(payload: usize) -> Option<usize> {
    let floor = bin_index(payload);
    if payload.is_power_of_two() {
        return Some(floor);
    }
    (floor + 1 < BIN_COUNT).then_some(floor + 1)
}

struct HeapState {
    geometry: Geometry,
    pools: ArrayVec<Pool, MAX_POOLS>,
    bins: [List; BIN_COUNT],
    bin_mask: usize,
    total_bytes: usize,
    bytes_free: usize,
    min_bytes_free: usize,
}

// Pools and bin links are raw pointers into memory owned exclusively by the
// heap.
unsafe impl Send for HeapState {}

impl HeapState {
    const fn new(alignment: usize) -> Self {
        Self {
            geometry: Geometry::new(alignment),
            pools: ArrayVec::new_const(),
            bins: [const { List::new() }; BIN_COUNT],
            bin_mask: 0,
            total_bytes: 0,
            bytes_free: 0,
            min_bytes_free: 0,
        }
    }

    fn payload_size(&self, block: Block) -> usize {
        block.size() - self.geometry.header
    }

    fn bin_insert(&mut self, block: Block) {
        let payload = self.payload_size(block);
        let index = bin_index(payload);
        block.reset_link();
        unsafe { self.bins[index].push_back(block.link()) };
        self.bin_mask |= 1 << index;
        self.bytes_free += payload;
    }

    fn bin_remove(&mut self, block: Block) {
        let payload = self.payload_size(block);
        let index = bin_index(payload);
        unsafe { self.bins[index].remove(block.link()) };
        if self.bins[index].is_empty() {
            self.bin_mask &= !(1 << index);
        }
        self.bytes_free -= payload;
    }

    fn note_low_water(&mut self) {
        self.min_bytes_free = self.min_bytes_free.min(self.bytes_free);
    }

    fn add_pool(&mut self, start: NonNull<u8>, len: usize) -> Result<Pool, HeapError> {
        let Geometry {
            align, min_block, ..
        } = self.geometry;
        let offset = start.as_ptr().align_offset(align);
        let size = len.saturating_sub(offset) & !(align - 1);
        ensure!(
            offset != usize::MAX && size >= min_block,
            PoolTooSmallSnafu { size: len }
        );
        ensure!(!self.pools.is_full(), TooManyPoolsSnafu { max: MAX_POOLS });

        let start = unsafe { start.byte_add(offset) };
        let pool = Pool {
            start,
            end: start.addr().get() + size,
        };
        ensure!(
            self.pools.iter().all(|p| !p.overlaps(&pool)),
            PoolOverlapSnafu {
                start: pool.start_addr(),
                end: pool.end,
            }
        );

        let index = self.pools.partition_point(|p| p.end <= pool.start_addr());
        self.pools.insert(index, pool);

        let block = unsafe { Block::format(start, size, 0, BlockFlags::LAST) };
        self.total_bytes += size;
        self.bin_insert(block);
        // The mark is seeded by the first pool and only ever falls after that.
        if self.pools.len() == 1 {
            self.min_bytes_free = self.bytes_free;
        }
        Ok(pool)
    }

    fn find_fit(&self, payload: usize) -> Option<Block> {
        if let Some(first) = fit_bin(payload) {
            let candidates = self.bin_mask & (usize::MAX << first);
            if candidates != 0 {
                let index = candidates.trailing_zeros() as usize;
                let link = self.bins[index].front()?;
                return Some(unsafe { Block::from_link(link) });
            }
        }
        self.bins[bin_index(payload)]
            .iter()
            .map(|link| unsafe { Block::from_link(link) })
            .find(|&block| self.payload_size(block) >= payload)
    }

    /// Shrinks `block` to `payload` bytes and returns the cut-off tail.
    ///
    /// The tail is formatted as a free block but not binned. Returns `None`
    /// when the tail would be smaller than a minimal block.
    fn split(&self, block: Block, payload: usize) -> Option<Block> {
        let keep = self.geometry.header + payload;
        let rest = block.size() - keep;
        if rest < self.geometry.min_block {
            return None;
        }

        let flags = block.flags() & BlockFlags::LAST;
        let tail = unsafe { Block::format(block.start().byte_add(keep), rest, keep, flags) };
        if let Some(next) = tail.next() {
            next.set_prev_size(rest);
        }
        block.set_size(keep);
        block.set_flags(block.flags() - BlockFlags::LAST);
        Some(tail)
    }

    /// Absorbs `next`, the successor of `block`, into `block`.
    fn merge(block: Block, next: Block) {
        debug_assert_eq!(block.next(), Some(next));
        block.set_size(block.size() + next.size());
        if next.is_last() {
            block.set_flags(block.flags() | BlockFlags::LAST);
        } else if let Some(after) = block.next() {
            after.set_prev_size(block.size());
        }
        next.retire();
    }

    /// Returns a free, unbinned block to the bins, coalescing with its
    /// neighbors.
    fn release(&mut self, mut block: Block) {
        if let Some(next) = block.next().filter(|b| !b.is_allocated()) {
            self.bin_remove(next);
            Self::merge(block, next);
        }
        if let Some(prev) = block.prev().filter(|b| !b.is_allocated()) {
            self.bin_remove(prev);
            Self::merge(prev, block);
            block = prev;
        }
        self.bin_insert(block);
    }

    /// Checks that `ptr` is the payload of a live allocated block.
    #[track_caller]
    fn validate(&self, ptr: NonNull<u8>) -> Result<Block, HeapError> {
        let Geometry {
            align,
            header,
            min_block,
        } = self.geometry;
        let addr = ptr.addr().get();
        ensure!(addr % align == 0, ForeignPointerSnafu { addr });
        let block_addr = addr
            .checked_sub(header)
            .context(ForeignPointerSnafu { addr })?;
        let pool = self
            .pools
            .iter()
            .find(|pool| pool.contains(block_addr) && addr <= pool.end)
            .context(ForeignPointerSnafu { addr })?;

        let block = unsafe { Block::from_payload(ptr, header) };
        match block.magic() {
            BLOCK_MAGIC => {}
            STALE_MAGIC => return DoubleFreeSnafu { addr }.fail(),
            _ => return CorruptHeaderSnafu { addr }.fail(),
        }
        ensure!(block.is_allocated(), DoubleFreeSnafu { addr });

        let size = block.size();
        let end = block_addr.checked_add(size);
        ensure!(
            size >= min_block
                && size % align == 0
                && end.is_some_and(|end| end <= pool.end)
                && block.is_last() == (end == Some(pool.end)),
            CorruptHeaderSnafu { addr }
        );
        Ok(block)
    }

    fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let payload = self.geometry.payload_for(size)?;
        let block = self.find_fit(payload)?;
        self.bin_remove(block);
        block.set_flags(block.flags() | BlockFlags::ALLOCATED);
        block.set_tag(0);
        if let Some(tail) = self.split(block, payload) {
            self.release(tail);
        }
        self.note_low_water();
        Some(block.payload(self.geometry.header))
    }

    fn free_block(&mut self, block: Block) {
        block.set_flags(block.flags() - BlockFlags::ALLOCATED);
        block.set_tag(0);
        self.release(block);
    }

    fn realloc(&mut self, block: Block, size: usize) -> Option<NonNull<u8>> {
        let payload = self.geometry.payload_for(size)?;
        let ptr = block.payload(self.geometry.header);
        let old_payload = self.payload_size(block);

        if payload <= old_payload {
            if let Some(tail) = self.split(block, payload) {
                self.release(tail);
            }
            return Some(ptr);
        }

        if let Some(next) = block.next().filter(|b| !b.is_allocated()) {
            if old_payload + next.size() >= payload {
                self.bin_remove(next);
                Self::merge(block, next);
                if let Some(tail) = self.split(block, payload) {
                    self.release(tail);
                }
                self.note_low_water();
                return Some(ptr);
            }
        }

        let new_ptr = self.alloc(size)?;
        let new_block = unsafe { Block::from_payload(new_ptr, self.geometry.header) };
        new_block.set_tag(block.tag());
        unsafe { new_ptr.copy_from_nonoverlapping(ptr, old_payload) };
        self.free_block(block);
        Some(new_ptr)
    }

    fn walk(&self, f: &mut impl FnMut(WalkEntry)) {
        for pool in &self.pools {
            let mut block = pool.first_block();
            loop {
                let allocated = block.is_allocated();
                f(WalkEntry {
                    block: allocated.then(|| block.payload(self.geometry.header)),
                    tag: block.tag(),
                    size: self.payload_size(block),
                });
                match block.next() {
                    Some(next) => block = next,
                    None => break,
                }
            }
        }
    }

    fn biggest_available_chunk(&self) -> usize {
        if self.bin_mask == 0 {
            return 0;
        }
        let top = BIN_COUNT - 1 - self.bin_mask.leading_zeros() as usize;
        self.bins[top]
            .iter()
            .map(|link| self.payload_size(unsafe { Block::from_link(link) }))
            .max()
            .unwrap_or(0)
    }

    fn check_integrity(&self) -> Result<(), HeapError> {
        let mut free_bytes = 0;
        let mut free_blocks = 0;
        let mut covered_total = 0;

        for pool in &self.pools {
            let mut block = pool.first_block();
            let mut expected_prev = 0;
            let mut prev_free = false;
            let mut covered = 0;
            loop {
                ensure!(
                    block.magic() == BLOCK_MAGIC,
                    InconsistentSnafu {
                        what: "block header lost its magic",
                    }
                );
                ensure!(
                    block.prev_size() == expected_prev,
                    InconsistentSnafu {
                        what: "prev_size does not match the preceding block",
                    }
                );
                ensure!(
                    block.size() >= self.geometry.min_block
                        && block.addr() + block.size() <= pool.end,
                    InconsistentSnafu {
                        what: "block size out of range",
                    }
                );
                let free = !block.is_allocated();
                ensure!(
                    !(free && prev_free),
                    InconsistentSnafu {
                        what: "two adjacent free blocks",
                    }
                );
                if free {
                    ensure!(
                        block.is_binned(),
                        InconsistentSnafu {
                            what: "free block missing from its bin",
                        }
                    );
                    free_bytes += self.payload_size(block);
                    free_blocks += 1;
                }
                covered += block.size();
                expected_prev = block.size();
                prev_free = free;
                match block.next() {
                    Some(next) => block = next,
                    None => break,
                }
            }
            ensure!(
                covered == pool.len(),
                InconsistentSnafu {
                    what: "blocks do not tile the pool",
                }
            );
            covered_total += covered;
        }

        let mut binned = 0;
        for (index, bin) in self.bins.iter().enumerate() {
            ensure!(
                bin.is_empty() == ((self.bin_mask & (1 << index)) == 0),
                InconsistentSnafu {
                    what: "bin mask out of sync",
                }
            );
            for link in bin.iter() {
                let block = unsafe { Block::from_link(link) };
                ensure!(
                    !block.is_allocated() && bin_index(self.payload_size(block)) == index,
                    InconsistentSnafu {
                        what: "bin holds a block of the wrong class",
                    }
                );
                binned += 1;
            }
        }

        ensure!(
            binned == free_blocks,
            InconsistentSnafu {
                what: "bins hold blocks that are not in any pool",
            }
        );
        ensure!(
            free_bytes == self.bytes_free && covered_total == self.total_bytes,
            InconsistentSnafu {
                what: "byte accounting drifted",
            }
        );
        ensure!(
            self.min_bytes_free <= self.bytes_free,
            InconsistentSnafu {
                what: "low-water mark above free bytes",
            }
        );
        Ok(())
    }
}

/// A general-purpose heap over caller-supplied pools.
pub struct Heap {
    alignment: usize,
    state: Mutex<HeapState>,
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("alignment", &self.alignment())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Heap {
    /// Creates a heap with no pools.
    ///
    /// Payloads are aligned to `alignment`, raised to at least the alignment
    /// of `usize`.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two.
    #[must_use]
    pub const fn new(alignment: usize) -> Self {
        assert!(
            alignment.is_power_of_two(),
            "heap alignment must be a power of two"
        );
        let state = HeapState::new(alignment);
        Self {
            alignment: state.geometry.align,
            state: Mutex::new(state),
        }
    }

    /// Returns the payload alignment guaranteed by [`Heap::alloc`].
    #[must_use]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Locks the heap and resolves `ptr` to its live block.
    ///
    /// The lock is released before halting on a bad pointer, so a log sink
    /// that allocates can still report the failure.
    #[track_caller]
    fn lock_live(&self, ptr: NonNull<u8>) -> (MutexGuard<'_, HeapState>, Block) {
        let state = self.state.lock();
        match state.validate(ptr) {
            Ok(block) => (state, block),
            Err(err) => {
                drop(state);
                fault::fatal(err)
            }
        }
    }

    /// Registers a pool.
    pub fn add_pool(&self, pool: &'static mut [u8]) -> Result<(), HeapError> {
        let len = pool.len();
        unsafe { self.add_pool_raw(NonNull::from(pool).cast(), len) }
    }

    /// Registers `len` bytes starting at `start` as a pool.
    ///
    /// The region is trimmed to the heap alignment and must fit at least one
    /// minimal block.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes and must not be used by
    /// anything but this heap for as long as the heap lives.
    pub unsafe fn add_pool_raw(&self, start: NonNull<u8>, len: usize) -> Result<(), HeapError> {
        let pool = self.state.lock().add_pool(start, len)?;
        log::debug!(
            "heap pool added: {:#x}..{:#x} ({} bytes)",
            pool.start_addr(),
            pool.end,
            pool.len()
        );
        Ok(())
    }

    /// Allocates at least `size` bytes.
    ///
    /// Returns `None` when no free block is large enough. A zero-sized
    /// request yields a minimal block.
    #[must_use]
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        // Log only after unlocking: the sink may allocate from this heap.
        let (ptr, bytes_free) = {
            let mut state = self.state.lock();
            (state.alloc(size), state.bytes_free)
        };
        match ptr {
            Some(ptr) => log::trace!("heap alloc: {size} bytes at {ptr:p}"),
            None => log::warn!("heap exhausted: {size} bytes requested, {bytes_free} bytes free"),
        }
        ptr
    }

    /// Allocates `count * size` zeroed bytes.
    #[must_use]
    pub fn calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let bytes = count.checked_mul(size)?;
        let ptr = self.alloc(bytes)?;
        unsafe { ptr.write_bytes(0, bytes) };
        Some(ptr)
    }

    /// Resizes an allocation.
    ///
    /// `None` behaves like [`Heap::alloc`]; a zero `size` frees the block and
    /// returns `None`. On success the leading bytes are preserved and the
    /// block may have moved. On failure `None` is returned and the original
    /// block is untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this heap. It is invalid after a
    /// successful call that returns a different pointer.
    #[track_caller]
    pub unsafe fn realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.alloc(size);
        };
        if size == 0 {
            unsafe { self.free(ptr) };
            return None;
        }
        let new_ptr = {
            let (mut state, block) = self.lock_live(ptr);
            state.realloc(block, size)
        };
        match new_ptr {
            Some(new_ptr) => log::trace!("heap realloc: {ptr:p} -> {new_ptr:p} ({size} bytes)"),
            None => log::warn!("heap realloc of {ptr:p} to {size} bytes failed"),
        }
        new_ptr
    }

    /// Returns a block to the heap.
    ///
    /// Halts through [`fault::fatal`] when `ptr` is not a live allocation of
    /// this heap.
    ///
    /// # Safety
    ///
    /// The payload must not be accessed after this call.
    #[track_caller]
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        {
            let (mut state, block) = self.lock_live(ptr);
            state.free_block(block);
        }
        log::trace!("heap free: {ptr:p}");
    }

    /// Attaches a caller-defined tag to a live block.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this heap.
    #[track_caller]
    pub unsafe fn tag(&self, ptr: NonNull<u8>, tag: u16) {
        let (_state, block) = self.lock_live(ptr);
        block.set_tag(tag);
    }

    /// Returns the usable payload size of a live block.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this heap.
    #[track_caller]
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let (state, block) = self.lock_live(ptr);
        state.payload_size(block)
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// Alignments above [`Heap::alignment`] over-allocate and store the
    /// offset to the underlying block in the word before the returned
    /// pointer. Such blocks must be released with [`Heap::free_aligned`].
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[must_use]
    pub fn alloc_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        if align <= self.alignment() {
            return self.alloc(size);
        }
        let word = size_of::<usize>();
        let raw = self.alloc(size.checked_add(align)?.checked_add(word)?)?;
        let addr = raw.addr().get();
        let offset = (addr + word).next_multiple_of(align) - addr;
        unsafe {
            let aligned = raw.byte_add(offset);
            aligned.byte_sub(word).cast::<usize>().write(offset);
            Some(aligned)
        }
    }

    /// Releases a block obtained from [`Heap::alloc_aligned`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Heap::alloc_aligned`] with the same `align`.
    #[track_caller]
    pub unsafe fn free_aligned(&self, ptr: NonNull<u8>, align: usize) {
        if align <= self.alignment() {
            unsafe { self.free(ptr) };
            return;
        }
        unsafe {
            let offset = ptr.byte_sub(size_of::<usize>()).cast::<usize>().read();
            self.free(ptr.byte_sub(offset));
        }
    }

    /// Visits every block of every pool in address order.
    ///
    /// The heap stays locked while `f` runs; `f` must not call back into the
    /// heap.
    pub fn walk(&self, mut f: impl FnMut(WalkEntry)) {
        self.state.lock().walk(&mut f);
    }

    /// Returns the largest payload a single allocation can currently get.
    #[must_use]
    pub fn biggest_available_chunk(&self) -> usize {
        self.state.lock().biggest_available_chunk()
    }

    /// Returns the sum of free payload bytes.
    #[must_use]
    pub fn bytes_free(&self) -> usize {
        self.state.lock().bytes_free
    }

    /// Returns the lowest value [`Heap::bytes_free`] has reached.
    #[must_use]
    pub fn min_bytes_free(&self) -> usize {
        self.state.lock().min_bytes_free
    }

    /// Returns the combined size of all registered pools.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let state = self.state.lock();
        let mut stats = HeapStats {
            total_bytes: state.total_bytes,
            bytes_free: state.bytes_free,
            min_bytes_free: state.min_bytes_free,
            ..HeapStats::default()
        };
        state.walk(&mut |entry| {
            if entry.block.is_some() {
                stats.allocated_blocks += 1;
            } else {
                stats.free_blocks += 1;
                stats.largest_free = stats.largest_free.max(entry.size);
            }
        });
        stats
    }

    /// Verifies every structural invariant of the heap.
    pub fn check_integrity(&self) -> Result<(), HeapError> {
        self.state.lock().check_integrity()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::{alloc::Layout, thread};

    use proptest::prelude::*;

    use super::*;

    fn with_test_heap<F>(pool_size: usize, alignment: usize, test_fn: F)
    where
        F: FnOnce(&Heap),
    {
        unsafe {
            let layout = Layout::from_size_align(pool_size, 64).unwrap();
            let pool = std::alloc::alloc(layout);
            pool.write_bytes(0x11, pool_size);
            let heap = Heap::new(alignment);
            heap.add_pool_raw(NonNull::new(pool).unwrap(), pool_size)
                .unwrap();
            test_fn(&heap);
            drop(heap);
            std::alloc::dealloc(pool, layout);
        }
    }

    fn entries(heap: &Heap) -> Vec<WalkEntry> {
        let mut entries = Vec::new();
        heap.walk(|entry| entries.push(entry));
        entries
    }

    unsafe fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
        unsafe { ptr.write_bytes(byte, len) };
    }

    unsafe fn assert_filled(ptr: NonNull<u8>, len: usize, byte: u8) {
        let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), len) };
        assert!(bytes.iter().all(|&b| b == byte));
    }

    #[test]
    fn test_fresh_pool_is_one_free_block() {
        with_test_heap(1024, 8, |heap| {
            assert_eq!(heap.total_bytes(), 1024);
            assert_eq!(heap.bytes_free(), heap.min_bytes_free());
            assert_eq!(heap.bytes_free(), heap.biggest_available_chunk());
            let entries = entries(heap);
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].block, None);
            assert_eq!(entries[0].size, heap.bytes_free());
            heap.check_integrity().unwrap();
        });
    }

    #[test]
    fn test_alloc_free_restores_accounting() {
        with_test_heap(4096, 8, |heap| unsafe {
            let initial = heap.bytes_free();
            let a = heap.alloc(64).unwrap();
            assert_eq!(a.addr().get() % heap.alignment(), 0);
            assert!(heap.bytes_free() < initial);
            assert!(heap.usable_size(a) >= 64);
            fill(a, 64, 0x33);
            heap.free(a);
            assert_eq!(heap.bytes_free(), initial);
            assert_eq!(heap.biggest_available_chunk(), initial);
            heap.check_integrity().unwrap();
        });
    }

    #[test]
    fn test_freed_block_is_reused_first() {
        with_test_heap(1024, 8, |heap| unsafe {
            let a = heap.alloc(100).unwrap();
            let b = heap.alloc(200).unwrap();
            heap.free(a);
            let c = heap.alloc(50).unwrap();
            assert_eq!(c, a);

            let free: Vec<usize> = entries(heap)
                .iter()
                .filter(|e| e.block.is_none())
                .map(|e| e.size)
                .collect();
            assert_eq!(
                heap.biggest_available_chunk(),
                free.iter().copied().max().unwrap()
            );
            assert_eq!(entries(heap).last().unwrap().block, None);
            heap.check_integrity().unwrap();

            heap.free(b);
            heap.free(c);
            assert_eq!(entries(heap).len(), 1);
        });
    }

    #[test]
    fn test_neighbors_coalesce_in_any_order() {
        with_test_heap(4096, 16, |heap| unsafe {
            let initial = heap.bytes_free();
            for order in [[1, 2, 0, 3], [3, 2, 1, 0], [0, 3, 1, 2]] {
                let blocks: Vec<_> = (0..4).map(|_| heap.alloc(128).unwrap()).collect();
                for index in order {
                    heap.free(blocks[index]);
                    heap.check_integrity().unwrap();
                }
                assert_eq!(heap.bytes_free(), initial);
                assert_eq!(entries(heap).len(), 1);
            }
        });
    }

    #[test]
    fn test_exhaustion_returns_none() {
        with_test_heap(512, 8, |heap| unsafe {
            assert_eq!(heap.alloc(4096), None);
            let all = heap.alloc(heap.biggest_available_chunk()).unwrap();
            assert_eq!(heap.bytes_free(), 0);
            assert_eq!(heap.biggest_available_chunk(), 0);
            assert_eq!(heap.alloc(1), None);
            heap.free(all);
            heap.check_integrity().unwrap();
        });
    }

    #[test]
    fn test_non_power_of_two_request_scans_its_own_class() {
        with_test_heap(1000, 8, |heap| unsafe {
            // The only free block sits in the request's size class.
            let size = heap.biggest_available_chunk();
            assert!(!size.is_power_of_two());
            let ptr = heap.alloc(size).unwrap();
            heap.free(ptr);
        });
    }

    #[test]
    fn test_min_bytes_free_tracks_low_water() {
        with_test_heap(4096, 8, |heap| unsafe {
            let initial = heap.bytes_free();
            let a = heap.alloc(1000).unwrap();
            let low = heap.bytes_free();
            assert_eq!(heap.min_bytes_free(), low);
            heap.free(a);
            assert_eq!(heap.bytes_free(), initial);
            assert_eq!(heap.min_bytes_free(), low);
            let b = heap.alloc(16).unwrap();
            assert_eq!(heap.min_bytes_free(), low);
            heap.free(b);
        });
    }

    #[test]
    fn test_added_pool_keeps_low_water() {
        with_test_heap(1024, 8, |heap| unsafe {
            let a = heap.alloc(800).unwrap();
            let low = heap.min_bytes_free();
            assert_eq!(low, heap.bytes_free());

            let second: &'static mut [u8] = Box::leak(vec![0_u8; 4096].into_boxed_slice());
            heap.add_pool(second).unwrap();
            assert!(heap.bytes_free() > 4000);
            assert_eq!(heap.min_bytes_free(), low);
            assert_eq!(heap.stats().min_bytes_free, low);

            heap.free(a);
            assert_eq!(heap.min_bytes_free(), low);
            heap.check_integrity().unwrap();
        });
    }

    #[test]
    fn test_realloc_grows_in_place_into_free_successor() {
        with_test_heap(4096, 8, |heap| unsafe {
            let a = heap.alloc(64).unwrap();
            fill(a, 64, 0x33);
            let grown = heap.realloc(Some(a), 512).unwrap();
            assert_eq!(grown, a);
            assert!(heap.usable_size(grown) >= 512);
            assert_filled(grown, 64, 0x33);
            heap.check_integrity().unwrap();
            heap.free(grown);
        });
    }

    #[test]
    fn test_realloc_moves_when_successor_is_busy() {
        with_test_heap(4096, 8, |heap| unsafe {
            let a = heap.alloc(64).unwrap();
            let b = heap.alloc(64).unwrap();
            heap.tag(a, 9);
            fill(a, 64, 0x33);
            let moved = heap.realloc(Some(a), 256).unwrap();
            assert_ne!(moved, a);
            assert_filled(moved, 64, 0x33);
            let tagged = entries(heap)
                .into_iter()
                .find(|e| e.block == Some(moved))
                .unwrap();
            assert_eq!(tagged.tag, 9);
            heap.check_integrity().unwrap();
            heap.free(moved);
            heap.free(b);
        });
    }

    #[test]
    fn test_realloc_shrink_releases_tail() {
        with_test_heap(4096, 8, |heap| unsafe {
            let a = heap.alloc(1024).unwrap();
            // Take everything behind `a` so only the released tail can serve
            // the next request.
            let rest = heap.alloc(heap.biggest_available_chunk()).unwrap();
            assert_eq!(heap.bytes_free(), 0);
            fill(a, 1024, 0x33);

            let shrunk = heap.realloc(Some(a), 100).unwrap();
            assert_eq!(shrunk, a);
            assert_filled(shrunk, 100, 0x33);
            assert!(heap.bytes_free() >= 700);
            heap.check_integrity().unwrap();

            let reused = heap.alloc(700).unwrap();
            let a_range = a.addr().get()..a.addr().get() + 1024;
            assert!(a_range.contains(&reused.addr().get()));
            assert!(a_range.contains(&(reused.addr().get() + 699)));
            assert_filled(shrunk, 100, 0x33);

            heap.free(reused);
            heap.free(shrunk);
            heap.free(rest);
            assert_eq!(entries(heap).len(), 1);
        });
    }

    #[test]
    fn test_realloc_failure_keeps_block() {
        with_test_heap(1024, 8, |heap| unsafe {
            let a = heap.alloc(128).unwrap();
            fill(a, 128, 0x33);
            let before = heap.stats();
            assert_eq!(heap.realloc(Some(a), 1 << 20), None);
            assert_eq!(heap.realloc(Some(a), usize::MAX), None);
            assert_filled(a, 128, 0x33);
            assert_eq!(heap.stats(), before);
            heap.check_integrity().unwrap();
            heap.free(a);
        });
    }

    #[test]
    fn test_realloc_null_and_zero() {
        with_test_heap(1024, 8, |heap| unsafe {
            let initial = heap.bytes_free();
            let a = heap.realloc(None, 32).unwrap();
            assert!(heap.bytes_free() < initial);
            assert_eq!(heap.realloc(Some(a), 0), None);
            assert_eq!(heap.bytes_free(), initial);
        });
    }

    #[test]
    fn test_walk_reports_tags_in_address_order() {
        with_test_heap(2048, 8, |heap| unsafe {
            let a = heap.alloc(40).unwrap();
            let b = heap.alloc(80).unwrap();
            let c = heap.alloc(120).unwrap();
            heap.tag(a, 1);
            heap.tag(c, 3);
            heap.free(b);

            let entries = entries(heap);
            assert_eq!(entries.len(), 4);
            assert_eq!(entries[0].block, Some(a));
            assert_eq!(entries[0].tag, 1);
            assert_eq!(entries[1].block, None);
            assert_eq!(entries[1].tag, 0);
            assert_eq!(entries[2].block, Some(c));
            assert_eq!(entries[2].tag, 3);
            assert_eq!(entries[3].block, None);

            let stats = heap.stats();
            assert_eq!(stats.allocated_blocks, 2);
            assert_eq!(stats.free_blocks, 2);
            assert_eq!(stats.largest_free, heap.biggest_available_chunk());
        });
    }

    #[test]
    fn test_calloc_zeroes_and_checks_overflow() {
        with_test_heap(1024, 8, |heap| unsafe {
            let ptr = heap.calloc(10, 12).unwrap();
            assert_filled(ptr, 120, 0);
            assert_eq!(heap.calloc(usize::MAX, 2), None);
            heap.free(ptr);
        });
    }

    #[test]
    fn test_alloc_aligned() {
        with_test_heap(8192, 8, |heap| unsafe {
            let initial = heap.bytes_free();
            for align in [8, 64, 256, 1024] {
                let ptr = heap.alloc_aligned(100, align).unwrap();
                assert_eq!(ptr.addr().get() % align, 0);
                fill(ptr, 100, 0x33);
                heap.free_aligned(ptr, align);
                heap.check_integrity().unwrap();
            }
            assert_eq!(heap.bytes_free(), initial);
        });
    }

    #[test]
    fn test_multiple_pools() {
        with_test_heap(1024, 8, |heap| unsafe {
            let second: &'static mut [u8] = Box::leak(vec![0_u8; 2048].into_boxed_slice());
            heap.add_pool(second).unwrap();
            assert!(heap.total_bytes() > 2048);

            let big = heap.alloc(1500).unwrap();
            let small = heap.alloc(500).unwrap();
            assert_eq!(heap.alloc(1500), None);
            heap.check_integrity().unwrap();

            let free_entries = entries(heap).iter().filter(|e| e.block.is_none()).count();
            assert_eq!(free_entries, 2);

            heap.free(big);
            heap.free(small);
            assert_eq!(heap.stats().free_blocks, 2);
            heap.check_integrity().unwrap();
        });
    }

    #[test]
    fn test_pool_registration_errors() {
        let heap = Heap::new(8);
        let tiny: &'static mut [u8] = Box::leak(vec![0_u8; 16].into_boxed_slice());
        assert!(matches!(
            heap.add_pool(tiny),
            Err(HeapError::PoolTooSmall { size: 16, .. })
        ));

        let region = Box::leak(vec![0_u8; 1024].into_boxed_slice());
        let start = NonNull::from(&mut *region).cast::<u8>();
        unsafe {
            heap.add_pool_raw(start, 512).unwrap();
            assert!(matches!(
                heap.add_pool_raw(start.byte_add(256), 512),
                Err(HeapError::PoolOverlap { .. })
            ));
        }

        for _ in 1..MAX_POOLS {
            let pool: &'static mut [u8] = Box::leak(vec![0_u8; 256].into_boxed_slice());
            heap.add_pool(pool).unwrap();
        }
        let extra: &'static mut [u8] = Box::leak(vec![0_u8; 256].into_boxed_slice());
        let err = heap.add_pool(extra).unwrap_err();
        assert!(matches!(err, HeapError::TooManyPools { max: MAX_POOLS, .. }));
        assert_eq!(err.to_string(), "heap already manages 8 pools");
        heap.check_integrity().unwrap();
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn test_double_free_is_fatal() {
        with_test_heap(1024, 8, |heap| unsafe {
            let a = heap.alloc(64).unwrap();
            let _b = heap.alloc(64).unwrap();
            heap.free(a);
            heap.free(a);
        });
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn test_double_free_of_coalesced_block_is_fatal() {
        with_test_heap(1024, 8, |heap| unsafe {
            let a = heap.alloc(64).unwrap();
            let b = heap.alloc(64).unwrap();
            heap.free(a);
            heap.free(b);
            heap.free(b);
        });
    }

    #[test]
    #[should_panic(expected = "was not allocated from this heap")]
    fn test_foreign_pointer_is_fatal() {
        with_test_heap(1024, 8, |heap| unsafe {
            let mut outside = [0_u64; 4];
            heap.free(NonNull::from(&mut outside).cast());
        });
    }

    #[test]
    #[should_panic(expected = "was not allocated from this heap")]
    fn test_pointer_just_past_pool_end_is_fatal() {
        unsafe {
            let layout = Layout::from_size_align(2048, 64).unwrap();
            let region = NonNull::new(std::alloc::alloc_zeroed(layout)).unwrap();
            let heap = Heap::new(8);
            heap.add_pool_raw(region, 1024).unwrap();
            // Its header would straddle the end of the pool.
            heap.free(region.byte_add(1024 + heap.alignment()));
        }
    }

    #[test]
    #[should_panic(expected = "is corrupted")]
    fn test_corrupt_header_is_fatal() {
        with_test_heap(1024, 8, |heap| unsafe {
            let a = heap.alloc(64).unwrap();
            let header = Geometry::new(heap.alignment()).header;
            a.byte_sub(header).write_bytes(0x5a, header);
            heap.free(a);
        });
    }

    #[test]
    #[should_panic(expected = "blocking operation called from interrupt context")]
    fn test_alloc_from_isr_panics() {
        with_test_heap(1024, 8, |heap| {
            let _isr = ksync::interrupt::enter_isr();
            let _ = heap.alloc(16);
        });
    }

    #[test]
    fn test_concurrent_alloc_free() {
        with_test_heap(64 * 1024, 16, |heap| {
            let initial = heap.bytes_free();
            thread::scope(|s| {
                for id in 0..4_u8 {
                    s.spawn(move || unsafe {
                        let mut live = Vec::new();
                        for round in 0..200_usize {
                            if let Some(ptr) = heap.alloc(16 + (round * 7) % 200) {
                                fill(ptr, 16, id);
                                live.push(ptr);
                            }
                            if round % 3 == 0 {
                                if let Some(ptr) = live.pop() {
                                    assert_filled(ptr, 16, id);
                                    heap.free(ptr);
                                }
                            }
                        }
                        for ptr in live {
                            assert_filled(ptr, 16, id);
                            heap.free(ptr);
                        }
                    });
                }
            });
            assert_eq!(heap.bytes_free(), initial);
            heap.check_integrity().unwrap();
        });
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc(usize),
        Free(usize),
        Realloc(usize, usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0_usize..600).prop_map(Op::Alloc),
            any::<usize>().prop_map(Op::Free),
            (any::<usize>(), 0_usize..900).prop_map(|(i, size)| Op::Realloc(i, size)),
        ]
    }

    proptest! {
        #[test]
        fn test_invariants_hold_under_random_ops(ops in prop::collection::vec(op(), 0..80)) {
            with_test_heap(8192, 8, |heap| unsafe {
                let initial = heap.bytes_free();
                let mut low = heap.min_bytes_free();
                let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
                for (step, op) in ops.into_iter().enumerate() {
                    let byte = u8::try_from(step % 251).unwrap();
                    match op {
                        Op::Alloc(size) => {
                            if let Some(ptr) = heap.alloc(size) {
                                fill(ptr, size, byte);
                                live.push((ptr, size, byte));
                            }
                        }
                        Op::Free(i) if !live.is_empty() => {
                            let (ptr, size, byte) = live.swap_remove(i % live.len());
                            assert_filled(ptr, size, byte);
                            heap.free(ptr);
                        }
                        Op::Realloc(i, new_size) if !live.is_empty() && new_size > 0 => {
                            let index = i % live.len();
                            let (ptr, size, old) = live[index];
                            match heap.realloc(Some(ptr), new_size) {
                                Some(new_ptr) => {
                                    assert_filled(new_ptr, size.min(new_size), old);
                                    fill(new_ptr, new_size, byte);
                                    live[index] = (new_ptr, new_size, byte);
                                }
                                None => assert_filled(ptr, size, old),
                            }
                        }
                        _ => {}
                    }
                    heap.check_integrity().unwrap();
                    assert!(heap.min_bytes_free() <= heap.bytes_free());
                    assert!(heap.min_bytes_free() <= low);
                    low = heap.min_bytes_free();
                }
                for (ptr, size, byte) in live {
                    assert_filled(ptr, size, byte);
                    heap.free(ptr);
                }
                assert_eq!(heap.bytes_free(), initial);
                assert_eq!(heap.stats().free_blocks, 1);
            });
        }
    }
}
