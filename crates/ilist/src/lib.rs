//! Intrusive doubly-linked circular lists.
//!
//! This crate provides the linkage primitive shared by the heap bins and the
//! slab queues of the allocator crate. A [`Link`] is embedded in a larger
//! record (typically at a known field offset) and a [`List`] threads those
//! records into a circular `prev`/`next` cycle without allocating.
//!
//! # Representation
//!
//! The list head is kept *outside* the element cycle: a [`List`] only records
//! the first element and the element count, so the head itself may be moved
//! freely (for example as part of a larger allocator state struct). The
//! elements form a cycle in which `prev` and `next` are mutual inverses:
//!
//! ```text
//!            first
//!              │
//!              ▼
//!   ┌──────► ┌───┐ ──next──► ┌───┐ ──next──► ┌───┐ ──┐
//!   │        │ A │           │ B │           │ C │   │
//!   │   ┌─── └───┘ ◄──prev── └───┘ ◄──prev── └───┘   │
//!   │   │                                      ▲     │
//!   │   └──────────────prev────────────────────┘     │
//!   └─────────────────────next───────────────────────┘
//! ```
//!
//! A [`Link`] that is not a member of any list is in the *detached* state,
//! which makes [`Link::is_linked`] an O(1) membership test.
//!
//! # Safety
//!
//! The list stores raw pointers to its elements. Callers of the `unsafe`
//! mutators guarantee that every linked element stays alive and does not move
//! while it is linked, and that a given element is only manipulated through
//! the list it belongs to. The list performs no internal locking; callers
//! exclude concurrent mutators of the same list (interrupt masking suffices on
//! a single core).
//!
//! # Examples
//!
//! ```
//! use core::ptr::NonNull;
//!
//! use ilist::{Link, List, container_of};
//!
//! struct Item {
//!     value: u32,
//!     link: Link,
//! }
//!
//! let mut a = Item { value: 1, link: Link::new() };
//! let mut b = Item { value: 2, link: Link::new() };
//!
//! let mut list = List::new();
//! unsafe {
//!     list.push_back(NonNull::from(&mut a.link));
//!     list.push_front(NonNull::from(&mut b.link));
//! }
//!
//! let values: Vec<u32> = list
//!     .iter()
//!     .map(|link| unsafe { container_of!(link, Item, link).as_ref().value })
//!     .collect();
//! assert_eq!(values, [2, 1]);
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use core::{fmt, iter::FusedIterator, marker::PhantomData, ptr::NonNull};

/// Recovers a pointer to the record that embeds a [`Link`].
///
/// Expands to a `NonNull<$type>`; must be used inside an `unsafe` context and
/// `$ptr` must point at the `$field` member of a live `$type`.
#[macro_export]
macro_rules! container_of {
    ($ptr:expr, $type:ty, $field:ident) => {
        ::core::ptr::NonNull::<$crate::Link>::byte_sub($ptr, ::core::mem::offset_of!($type, $field))
            .cast::<$type>()
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Detached,
    Linked {
        prev: NonNull<Link>,
        next: NonNull<Link>,
    },
}

/// A list node embedded in a larger record.
#[derive(Debug)]
pub struct Link {
    state: LinkState,
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

impl Link {
    /// Creates a detached link.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: LinkState::Detached,
        }
    }

    /// Returns `true` if this link is currently a member of some list.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        matches!(self.state, LinkState::Linked { .. })
    }

    /// Returns `(prev, next)` of a linked node.
    ///
    /// # Panics
    ///
    /// Panics if the node is detached.
    unsafe fn neighbors(node: NonNull<Self>) -> (NonNull<Self>, NonNull<Self>) {
        match unsafe { (*node.as_ptr()).state } {
            LinkState::Linked { prev, next } => (prev, next),
            LinkState::Detached => panic!("node is not linked"),
        }
    }

    unsafe fn set_prev(node: NonNull<Self>, new_prev: NonNull<Self>) {
        match unsafe { &mut (*node.as_ptr()).state } {
            LinkState::Linked { prev, .. } => *prev = new_prev,
            LinkState::Detached => panic!("node is not linked"),
        }
    }

    unsafe fn set_next(node: NonNull<Self>, new_next: NonNull<Self>) {
        match unsafe { &mut (*node.as_ptr()).state } {
            LinkState::Linked { next, .. } => *next = new_next,
            LinkState::Detached => panic!("node is not linked"),
        }
    }
}

/// Head of an intrusive circular list.
pub struct List {
    first: Option<NonNull<Link>>,
    len: usize,
}

impl Default for List {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl List {
    /// Creates an empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            first: None,
            len: 0,
        }
    }

    /// Returns `true` if the list has no elements.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Returns the number of linked elements.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns the first element.
    #[must_use]
    pub const fn front(&self) -> Option<NonNull<Link>> {
        self.first
    }

    /// Returns the last element.
    #[must_use]
    pub fn back(&self) -> Option<NonNull<Link>> {
        self.first.map(|first| unsafe { Link::neighbors(first).0 })
    }

    /// Returns `true` if `node` is the last element of this list.
    #[must_use]
    pub fn is_last(&self, node: NonNull<Link>) -> bool {
        self.back() == Some(node)
    }

    /// Returns an iterator over the elements, front to back.
    #[must_use]
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.first,
            remaining: self.len,
            _list: PhantomData,
        }
    }

    /// Links `node` at the end of the list.
    ///
    /// # Safety
    ///
    /// `node` must point to a live [`Link`] that stays in place while linked.
    ///
    /// # Panics
    ///
    /// Panics if `node` is already linked.
    pub unsafe fn push_back(&mut self, node: NonNull<Link>) {
        unsafe {
            assert!(!(*node.as_ptr()).is_linked(), "node is already linked");
            match self.first {
                None => {
                    (*node.as_ptr()).state = LinkState::Linked {
                        prev: node,
                        next: node,
                    };
                    self.first = Some(node);
                }
                Some(first) => {
                    let (last, _) = Link::neighbors(first);
                    Self::splice(node, last, first);
                }
            }
        }
        self.len += 1;
    }

    /// Links `node` at the front of the list.
    ///
    /// # Safety
    ///
    /// Same as [`push_back`](Self::push_back).
    pub unsafe fn push_front(&mut self, node: NonNull<Link>) {
        unsafe { self.push_back(node) };
        // the cycle is unchanged; only the head moves.
        self.first = Some(node);
    }

    /// Links `node` immediately after `existing`.
    ///
    /// # Safety
    ///
    /// `existing` must be a member of this list and `node` must satisfy the
    /// requirements of [`push_back`](Self::push_back).
    ///
    /// # Panics
    ///
    /// Panics if `existing` is detached or `node` is already linked.
    pub unsafe fn insert_after(&mut self, existing: NonNull<Link>, node: NonNull<Link>) {
        unsafe {
            assert!(!(*node.as_ptr()).is_linked(), "node is already linked");
            let (_, next) = Link::neighbors(existing);
            Self::splice(node, existing, next);
        }
        self.len += 1;
    }

    /// Unlinks `node` and resets it to the detached state.
    ///
    /// # Safety
    ///
    /// `node` must be a member of this list.
    ///
    /// # Panics
    ///
    /// Panics if `node` is detached.
    pub unsafe fn remove(&mut self, node: NonNull<Link>) {
        unsafe {
            let (prev, next) = Link::neighbors(node);
            if prev == node {
                debug_assert_eq!(self.len, 1);
                self.first = None;
            } else {
                Link::set_next(prev, next);
                Link::set_prev(next, prev);
                if self.first == Some(node) {
                    self.first = Some(next);
                }
            }
            (*node.as_ptr()).state = LinkState::Detached;
        }
        self.len -= 1;
    }

    /// Unlinks and returns the first element.
    pub fn pop_front(&mut self) -> Option<NonNull<Link>> {
        let first = self.first?;
        unsafe { self.remove(first) };
        Some(first)
    }

    /// Moves a member of this list to its end.
    ///
    /// # Safety
    ///
    /// `node` must be a member of this list.
    pub unsafe fn move_to_back(&mut self, node: NonNull<Link>) {
        unsafe {
            self.remove(node);
            self.push_back(node);
        }
    }

    /// Moves `node` from `from` to the end of this list.
    ///
    /// # Safety
    ///
    /// `node` must be a member of `from`.
    pub unsafe fn transfer_to_back(&mut self, from: &mut Self, node: NonNull<Link>) {
        unsafe {
            from.remove(node);
            self.push_back(node);
        }
    }

    /// Links `prev -> node -> next`, where `prev` and `next` are adjacent.
    unsafe fn splice(node: NonNull<Link>, prev: NonNull<Link>, next: NonNull<Link>) {
        unsafe {
            (*node.as_ptr()).state = LinkState::Linked { prev, next };
            Link::set_next(prev, node);
            Link::set_prev(next, node);
        }
    }
}

/// Iterator over the elements of a [`List`].
#[derive(Debug)]
pub struct Iter<'a> {
    next: Option<NonNull<Link>>,
    remaining: usize,
    _list: PhantomData<&'a List>,
}

impl Iterator for Iter<'_> {
    type Item = NonNull<Link>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let node = self.next?;
        self.remaining -= 1;
        self.next = Some(unsafe { Link::neighbors(node).1 });
        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Iter<'_> {}
impl FusedIterator for Iter<'_> {}
