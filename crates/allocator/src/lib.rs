//! Memory allocators for the real-time core.
//!
//! # Available Allocators
//!
//! ## [`Heap`](heap::Heap)
//!
//! A general-purpose allocator over one or more caller-supplied pools. Free
//! blocks are kept in segregated size-class bins, so selecting a block is a
//! bit scan plus a list pop. Adjacent free blocks are merged on every free.
//! Best suited for:
//!
//! - Variable-sized allocations made from thread context
//! - Long uptimes where fragmentation has to stay bounded
//!
//! Heap operations lock a mutex and must not be called from interrupt
//! handlers.
//!
//! ## [`SlabPool`](slab::SlabPool)
//!
//! A fixed-size block allocator whose slabs are provisioned from a `Heap`
//! ahead of time. Best suited for:
//!
//! - Allocation inside interrupt handlers
//! - Frequently recycled objects of one size
//!
//! **Performance**: O(1) allocation and deallocation; neither path touches
//! the heap.
//!
//! # Usage Example
//!
//! ```rust
//! use allocator::{
//!     heap::Heap,
//!     slab::{SlabGeometry, SlabPool},
//! };
//!
//! let heap = Heap::new(16);
//! heap.add_pool(Box::leak(vec![0_u8; 16 * 1024].into_boxed_slice()))
//!     .unwrap();
//!
//! let pool = SlabPool::new(
//!     &heap,
//!     SlabGeometry {
//!         blocks_per_slab: 32,
//!         block_size: 48,
//!         alignment: 8,
//!     },
//! )
//! .unwrap();
//! assert_eq!(pool.add_slabs(2), 2);
//!
//! let block = pool.alloc().unwrap();
//! unsafe { pool.free(block) };
//! ```
//!
//! # Contract violations
//!
//! Double frees and pointers that an allocator never handed out are detected
//! from block headers and reported through [`fault::fatal`].

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod heap;
pub mod slab;
