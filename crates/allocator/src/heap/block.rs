//! In-band block headers.
//!
//! Every block in a pool starts with a [`BlockHeader`]. Blocks tile the pool
//! without gaps: the header of the next block lives `size` bytes after the
//! current one, and `prev_size` walks back. The block that ends at the pool
//! boundary carries [`BlockFlags::LAST`], so neighbor lookup never needs to
//! consult the pool table.
//!
//! ```text
//! Allocated block:                  Free block:
//! ┌──────────────┬───────────────┐  ┌──────────────┬──────┬───────────┐
//! │ BlockHeader  │ payload       │  │ BlockHeader  │ Link │ unused    │
//! └──────────────┴───────────────┘  └──────────────┴──────┴───────────┘
//! ```

use core::{mem, ptr::NonNull};

use bitflags::bitflags;
use ilist::Link;

/// Magic value stored in every live header.
pub(super) const BLOCK_MAGIC: u16 = 0xb10c;

/// Magic value left behind in a header that was absorbed by coalescing.
pub(super) const STALE_MAGIC: u16 = 0xdead;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(super) struct BlockFlags: u16 {
        /// The payload is owned by a caller.
        const ALLOCATED = 1 << 0;
        /// The block ends at its pool's boundary.
        const LAST = 1 << 1;
    }
}

#[repr(C)]
#[derive(Debug)]
pub(super) struct BlockHeader {
    /// Total block size including this header.
    size: usize,
    /// Size of the preceding block, `0` for the first block of a pool.
    prev_size: usize,
    magic: u16,
    flags: BlockFlags,
    tag: u16,
    _reserved: u16,
}

#[repr(C)]
struct FreeBlock {
    header: BlockHeader,
    link: Link,
}

/// Size and alignment rules derived from the heap alignment.
#[derive(Debug, Clone, Copy)]
pub(super) struct Geometry {
    pub(super) align: usize,
    /// Header size rounded up so that payloads stay aligned.
    pub(super) header: usize,
    /// Smallest block that can exist on its own, free or allocated.
    pub(super) min_block: usize,
}

impl Geometry {
    pub(super) const fn new(alignment: usize) -> Self {
        let align = if alignment < mem::align_of::<FreeBlock>() {
            mem::align_of::<FreeBlock>()
        } else {
            alignment
        };
        let header = mem::size_of::<BlockHeader>().next_multiple_of(align);
        let free = mem::size_of::<FreeBlock>().next_multiple_of(align);
        let min_block = if free > header + align {
            free
        } else {
            header + align
        };
        Self {
            align,
            header,
            min_block,
        }
    }

    /// Returns the payload size that serves a request of `size` bytes.
    pub(super) fn payload_for(&self, size: usize) -> Option<usize> {
        let payload = size.max(1).checked_next_multiple_of(self.align)?;
        payload.checked_add(self.header)?;
        Some(payload.max(self.min_block - self.header))
    }
}

/// A handle to a formatted block header inside a registered pool.
///
/// Handles are only created by the heap for addresses it has formatted or
/// validated, which is what makes the safe accessors sound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Block(NonNull<BlockHeader>);

impl Block {
    /// Writes a fresh free header at `at`.
    ///
    /// # Safety
    ///
    /// `at` must be aligned to the heap alignment and `size` bytes starting
    /// at `at` must belong to a pool owned by the heap.
    pub(super) unsafe fn format(
        at: NonNull<u8>,
        size: usize,
        prev_size: usize,
        flags: BlockFlags,
    ) -> Self {
        let header = at.cast::<BlockHeader>();
        unsafe {
            header.write(BlockHeader {
                size,
                prev_size,
                magic: BLOCK_MAGIC,
                flags,
                tag: 0,
                _reserved: 0,
            });
        }
        Self(header)
    }

    /// Reinterprets an already formatted header.
    ///
    /// # Safety
    ///
    /// `at` must hold a header written by [`Block::format`].
    pub(super) unsafe fn at(at: NonNull<u8>) -> Self {
        Self(at.cast())
    }

    /// Reinterprets the header in front of a payload pointer.
    ///
    /// # Safety
    ///
    /// `payload - header_size` must lie inside a registered pool. The header
    /// contents are not checked.
    pub(super) unsafe fn from_payload(payload: NonNull<u8>, header_size: usize) -> Self {
        Self(unsafe { payload.byte_sub(header_size) }.cast())
    }

    /// Recovers the block that embeds a bin link.
    ///
    /// # Safety
    ///
    /// `link` must be the link of a free block.
    pub(super) unsafe fn from_link(link: NonNull<Link>) -> Self {
        Self(unsafe { ilist::container_of!(link, FreeBlock, link) }.cast())
    }

    pub(super) fn addr(self) -> usize {
        self.0.addr().get()
    }

    pub(super) fn start(self) -> NonNull<u8> {
        self.0.cast()
    }

    pub(super) fn size(self) -> usize {
        unsafe { (*self.0.as_ptr()).size }
    }

    pub(super) fn set_size(self, size: usize) {
        unsafe { (*self.0.as_ptr()).size = size }
    }

    pub(super) fn prev_size(self) -> usize {
        unsafe { (*self.0.as_ptr()).prev_size }
    }

    pub(super) fn set_prev_size(self, prev_size: usize) {
        unsafe { (*self.0.as_ptr()).prev_size = prev_size }
    }

    pub(super) fn magic(self) -> u16 {
        unsafe { (*self.0.as_ptr()).magic }
    }

    /// Marks the header as absorbed into its predecessor.
    pub(super) fn retire(self) {
        unsafe { (*self.0.as_ptr()).magic = STALE_MAGIC }
    }

    pub(super) fn flags(self) -> BlockFlags {
        unsafe { (*self.0.as_ptr()).flags }
    }

    pub(super) fn set_flags(self, flags: BlockFlags) {
        unsafe { (*self.0.as_ptr()).flags = flags }
    }

    pub(super) fn is_allocated(self) -> bool {
        self.flags().contains(BlockFlags::ALLOCATED)
    }

    pub(super) fn is_last(self) -> bool {
        self.flags().contains(BlockFlags::LAST)
    }

    pub(super) fn tag(self) -> u16 {
        unsafe { (*self.0.as_ptr()).tag }
    }

    pub(super) fn set_tag(self, tag: u16) {
        unsafe { (*self.0.as_ptr()).tag = tag }
    }

    pub(super) fn payload(self, header_size: usize) -> NonNull<u8> {
        unsafe { self.start().byte_add(header_size) }
    }

    pub(super) fn next(self) -> Option<Self> {
        if self.is_last() {
            return None;
        }
        Some(Self(unsafe { self.0.byte_add(self.size()) }))
    }

    pub(super) fn prev(self) -> Option<Self> {
        match self.prev_size() {
            0 => None,
            prev_size => Some(Self(unsafe { self.0.byte_sub(prev_size) })),
        }
    }

    /// Returns the bin link of a free block.
    pub(super) fn link(self) -> NonNull<Link> {
        unsafe { self.0.byte_add(mem::offset_of!(FreeBlock, link)) }.cast()
    }

    /// Resets the bin link before the block is handed to a bin.
    pub(super) fn reset_link(self) {
        unsafe { self.link().write(Link::new()) }
    }

    pub(super) fn is_binned(self) -> bool {
        unsafe { self.link().as_ref() }.is_linked()
    }
}
