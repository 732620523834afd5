//! Fixed-size block allocator layered over a [`Heap`].
//!
//! A [`SlabPool`] hands out blocks of one size. Blocks are carved out of
//! slabs, bulk allocations obtained from the backing heap ahead of time with
//! [`SlabPool::add_slabs`]. Each slab sits in exactly one of three queues:
//!
//! - `free`: no block of the slab is allocated; candidates for
//!   [`SlabPool::free_unallocated_slabs`].
//! - `partial`: some blocks are allocated.
//! - `full`: every block is allocated.
//!
//! A slab changes queue only when its free-block count crosses `0` or
//! `blocks_per_slab`.
//!
//! # Interrupt safety
//!
//! [`SlabPool::alloc`] and [`SlabPool::free`] never touch the heap. They run
//! under a [`ksync::SpinMutex`], which keeps interrupts disabled for the
//! duration of the splice, and may be called from interrupt handlers.
//! Provisioning and releasing slabs goes through the heap and is restricted
//! to thread context.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────────┬─────┬────────┬─────┬────────┬─────┬────────┐
//! │ SlabHeader │ pad │ prefix │ blk │ prefix │ blk │  ...   │
//! └────────────┴─────┴────────┴─────┴────────┴─────┴────────┘
//! ```
//!
//! The word in front of every block points back at its slab header. Its low
//! bit is set while the block is free, which makes double frees and blocks
//! of other pools detectable in O(1). A free block stores the next free block
//! of the same slab in its first word.

use core::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use derive_more::Display;
use fault::Location;
use ilist::{Link, List};
use ksync::SpinMutex;
use snafu::{Snafu, ensure};

use crate::heap::Heap;

const WORD: usize = size_of::<usize>();
const FREE_BIT: usize = 1;
const SLAB_MAGIC: u32 = 0x51ab_c0de;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// Process-unique identity of a [`SlabPool`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("#{_0}")]
pub struct PoolId(usize);

#[derive(Debug, Snafu)]
pub enum SlabError {
    #[snafu(display("invalid slab geometry: {reason}"))]
    InvalidGeometry {
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {addr:#x} does not belong to slab pool {pool}"))]
    ForeignBlock {
        addr: usize,
        pool: PoolId,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {addr:#x} freed twice"))]
    DoubleFree {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("slab {addr:#x} has a corrupted free list"))]
    CorruptSlab {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Shape of the blocks served by a [`SlabPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabGeometry {
    pub blocks_per_slab: usize,
    pub block_size: usize,
    /// Block alignment; must be a power of two.
    pub alignment: usize,
}

/// Snapshot of a pool's occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlabStats {
    pub slabs: usize,
    pub free_slabs: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
}

#[derive(Debug, Clone, Copy)]
struct SlabLayout {
    align: usize,
    stride: usize,
    first_block: usize,
    bytes: usize,
}

impl SlabLayout {
    fn new(geometry: &SlabGeometry) -> Result<Self, SlabError> {
        let SlabGeometry {
            blocks_per_slab,
            block_size,
            alignment,
        } = *geometry;
        ensure!(
            blocks_per_slab > 0,
            InvalidGeometrySnafu {
                reason: "a slab needs at least one block",
            }
        );
        ensure!(
            block_size > 0,
            InvalidGeometrySnafu {
                reason: "block size must be non-zero",
            }
        );
        ensure!(
            alignment.is_power_of_two(),
            InvalidGeometrySnafu {
                reason: "alignment must be a power of two",
            }
        );

        let align = alignment.max(align_of::<SlabHeader>());
        let block = block_size.max(WORD);
        let stride = block
            .checked_add(WORD)
            .and_then(|size| size.checked_next_multiple_of(align));
        let first_block = (size_of::<SlabHeader>() + WORD).checked_next_multiple_of(align);
        let bytes = stride.zip(first_block).and_then(|(stride, first_block)| {
            stride
                .checked_mul(blocks_per_slab - 1)?
                .checked_add(first_block)?
                .checked_add(block)
        });
        let (Some(stride), Some(first_block), Some(bytes)) = (stride, first_block, bytes) else {
            return InvalidGeometrySnafu {
                reason: "slab size overflows",
            }
            .fail();
        };
        Ok(Self {
            align,
            stride,
            first_block,
            bytes,
        })
    }
}

#[repr(C)]
struct SlabHeader {
    link: Link,
    pool: PoolId,
    magic: u32,
    free_count: usize,
    free_head: Option<NonNull<u8>>,
}

/// A handle to the header at the start of a slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slab(NonNull<SlabHeader>);

impl Slab {
    unsafe fn from_link(link: NonNull<Link>) -> Self {
        Self(unsafe { ilist::container_of!(link, SlabHeader, link) })
    }

    fn base(self) -> NonNull<u8> {
        self.0.cast()
    }

    fn link(self) -> NonNull<Link> {
        // `link` is the first field of a `#[repr(C)]` header.
        self.0.cast()
    }

    fn free_count(self) -> usize {
        unsafe { self.0.as_ref() }.free_count
    }

    fn retire(mut self) {
        unsafe { self.0.as_mut() }.magic = 0;
    }

    /// Takes the first block off the slab's free list.
    fn pop_block(mut self) -> Option<NonNull<u8>> {
        let header = unsafe { self.0.as_mut() };
        let block = header.free_head?;
        unsafe {
            header.free_head = block.cast::<Option<NonNull<u8>>>().read();
            let prefix = block.byte_sub(WORD).cast::<usize>();
            prefix.write(prefix.read() & !FREE_BIT);
        }
        header.free_count -= 1;
        Some(block)
    }

    fn push_block(mut self, block: NonNull<u8>) {
        let header = unsafe { self.0.as_mut() };
        unsafe {
            block.cast::<Option<NonNull<u8>>>().write(header.free_head);
            let prefix = block.byte_sub(WORD).cast::<usize>();
            prefix.write(prefix.read() | FREE_BIT);
        }
        header.free_head = Some(block);
        header.free_count += 1;
    }
}

struct SlabQueues {
    free: List,
    partial: List,
    full: List,
    allocated_blocks: usize,
}

// Slab links point into heap memory owned by the pool.
unsafe impl Send for SlabQueues {}

/// Pool of fixed-size blocks backed by a [`Heap`].
pub struct SlabPool<'h> {
    heap: &'h Heap,
    id: PoolId,
    geometry: SlabGeometry,
    layout: SlabLayout,
    queues: SpinMutex<SlabQueues>,
}

impl fmt::Debug for SlabPool<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabPool")
            .field("id", &self.id)
            .field("geometry", &self.geometry)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<'h> SlabPool<'h> {
    /// Creates an empty pool. No memory is taken from `heap` until
    /// [`SlabPool::add_slabs`] is called.
    pub fn new(heap: &'h Heap, geometry: SlabGeometry) -> Result<Self, SlabError> {
        let layout = SlabLayout::new(&geometry)?;
        Ok(Self {
            heap,
            id: PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)),
            geometry,
            layout,
            queues: SpinMutex::new(SlabQueues {
                free: List::new(),
                partial: List::new(),
                full: List::new(),
                allocated_blocks: 0,
            }),
        })
    }

    #[must_use]
    pub fn id(&self) -> PoolId {
        self.id
    }

    #[must_use]
    pub fn geometry(&self) -> SlabGeometry {
        self.geometry
    }

    /// Returns the number of heap bytes consumed by one slab.
    #[must_use]
    pub fn slab_bytes(&self) -> usize {
        self.layout.bytes
    }

    /// Allocates up to `max` slabs from the heap and queues them as free.
    ///
    /// Returns the number of slabs actually added, which is lower than `max`
    /// when the heap runs out of memory. Must be called from thread context.
    pub fn add_slabs(&self, max: usize) -> usize {
        let mut added = 0;
        while added < max {
            let Some(base) = self.heap.alloc_aligned(self.layout.bytes, self.layout.align) else {
                log::warn!(
                    "slab pool {}: heap exhausted after {added} of {max} slabs",
                    self.id
                );
                break;
            };
            let slab = unsafe { self.format(base) };
            unsafe { self.queues.lock().free.push_back(slab.link()) };
            added += 1;
        }
        if added > 0 {
            log::debug!("slab pool {}: added {added} slabs", self.id);
        }
        added
    }

    /// Returns up to `max` wholly free slabs to the heap.
    ///
    /// Slabs holding any allocated block are never released. Must be called
    /// from thread context.
    pub fn free_unallocated_slabs(&self, max: usize) -> usize {
        let mut released = List::new();
        {
            let mut queues = self.queues.lock();
            while released.len() < max {
                let Some(link) = queues.free.pop_front() else {
                    break;
                };
                unsafe { released.push_back(link) };
            }
        }

        let count = released.len();
        while let Some(link) = released.pop_front() {
            let slab = unsafe { Slab::from_link(link) };
            slab.retire();
            unsafe { self.heap.free_aligned(slab.base(), self.layout.align) };
        }
        if count > 0 {
            log::debug!("slab pool {}: released {count} slabs", self.id);
        }
        count
    }

    /// Takes one block, or returns `None` if every slab is full.
    ///
    /// Interrupt-safe.
    #[track_caller]
    #[must_use]
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        let mut guard = self.queues.lock();
        let queues = &mut *guard;
        let (link, from_free) = match queues.partial.front() {
            Some(link) => (link, false),
            None => (queues.free.front()?, true),
        };

        let slab = unsafe { Slab::from_link(link) };
        let Some(block) = slab.pop_block() else {
            fault::fatal(
                CorruptSlabSnafu {
                    addr: slab.base().addr().get(),
                }
                .build(),
            );
        };

        if slab.free_count() == 0 {
            let from = if from_free {
                &mut queues.free
            } else {
                &mut queues.partial
            };
            unsafe { queues.full.transfer_to_back(from, link) };
        } else if from_free {
            unsafe { queues.partial.transfer_to_back(&mut queues.free, link) };
        }
        queues.allocated_blocks += 1;
        Some(block)
    }

    /// Returns a block to its slab.
    ///
    /// Interrupt-safe. Halts through [`fault::fatal`] when `block` was not
    /// allocated from this pool or is already free.
    ///
    /// # Safety
    ///
    /// `block` must not be accessed after this call.
    #[track_caller]
    pub unsafe fn free(&self, block: NonNull<u8>) {
        let mut guard = self.queues.lock();
        let slab = match self.owner(block) {
            Ok(slab) => slab,
            Err(err) => fault::fatal(err),
        };

        let previous = slab.free_count();
        slab.push_block(block);

        let queues = &mut *guard;
        let link = slab.link();
        if previous + 1 == self.geometry.blocks_per_slab {
            let from = if previous == 0 {
                &mut queues.full
            } else {
                &mut queues.partial
            };
            unsafe { queues.free.transfer_to_back(from, link) };
        } else if previous == 0 {
            unsafe { queues.partial.transfer_to_back(&mut queues.full, link) };
        }
        queues.allocated_blocks -= 1;
    }

    #[must_use]
    pub fn stats(&self) -> SlabStats {
        let queues = self.queues.lock();
        let slabs = queues.free.len() + queues.partial.len() + queues.full.len();
        SlabStats {
            slabs,
            free_slabs: queues.free.len(),
            partial_slabs: queues.partial.len(),
            full_slabs: queues.full.len(),
            allocated_blocks: queues.allocated_blocks,
            free_blocks: slabs * self.geometry.blocks_per_slab - queues.allocated_blocks,
        }
    }

    /// Lays out a fresh slab with every block on its free list.
    unsafe fn format(&self, base: NonNull<u8>) -> Slab {
        let SlabLayout {
            stride,
            first_block,
            ..
        } = self.layout;
        let header = base.cast::<SlabHeader>();
        let mut free_head = None;
        for index in (0..self.geometry.blocks_per_slab).rev() {
            unsafe {
                let block = base.byte_add(first_block + index * stride);
                block
                    .byte_sub(WORD)
                    .cast::<usize>()
                    .write(header.addr().get() | FREE_BIT);
                block.cast::<Option<NonNull<u8>>>().write(free_head);
                free_head = Some(block);
            }
        }
        unsafe {
            header.write(SlabHeader {
                link: Link::new(),
                pool: self.id,
                magic: SLAB_MAGIC,
                free_count: self.geometry.blocks_per_slab,
                free_head,
            });
        }
        Slab(header)
    }

    /// Resolves the slab that owns an allocated `block`.
    #[track_caller]
    fn owner(&self, block: NonNull<u8>) -> Result<Slab, SlabError> {
        let SlabLayout {
            align,
            stride,
            first_block,
            bytes,
        } = self.layout;
        let addr = block.addr().get();
        let foreign = ForeignBlockSnafu {
            addr,
            pool: self.id,
        };
        ensure!(addr % align == 0, foreign);

        let prefix = unsafe { block.byte_sub(WORD).cast::<usize>().read() };
        let slab_addr = prefix & !FREE_BIT;
        let distance = addr.wrapping_sub(slab_addr);
        ensure!(
            slab_addr != 0 && slab_addr < addr && (first_block..bytes).contains(&distance),
            foreign
        );
        let slab = Slab(unsafe { block.byte_sub(distance) }.cast());
        let header = unsafe { slab.0.as_ref() };
        ensure!(
            header.magic == SLAB_MAGIC && header.pool == self.id,
            foreign
        );
        let offset = distance - first_block;
        ensure!(
            offset % stride == 0 && offset / stride < self.geometry.blocks_per_slab,
            foreign
        );
        ensure!(prefix & FREE_BIT == 0, DoubleFreeSnafu { addr });
        Ok(slab)
    }
}

impl Drop for SlabPool<'_> {
    fn drop(&mut self) {
        self.free_unallocated_slabs(usize::MAX);
        let queues = self.queues.lock();
        let leaked = queues.partial.len() + queues.full.len();
        if leaked > 0 {
            log::warn!(
                "slab pool {} dropped with {} blocks outstanding; leaking {leaked} slabs",
                self.id,
                queues.allocated_blocks
            );
        }
    }
}
