//! Interrupt masking and interrupt-context tracking.
//!
//! [`disable`] masks interrupts and returns a [`Guard`]; guards nest, and the
//! interrupt state saved by the outermost one is restored when it is dropped.
//!
//! The trap prologue calls [`enter_isr`] so that code running inside an
//! interrupt handler can be told apart from thread code. Operations that may
//! suspend the caller call [`assert_may_block`] before doing so.

use core::{cell::Cell, marker::PhantomData};

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "std"))] {
        #[path = "imp/host.rs"]
        mod imp;
    } else if #[cfg(target_arch = "riscv64")] {
        #[path = "imp/riscv64.rs"]
        mod imp;
    } else {
        #[path = "imp/unsupported.rs"]
        mod imp;
    }
}

/// Masks interrupts until the returned guard is dropped.
pub fn disable() -> Guard {
    let state = imp::read_and_disable();
    imp::with_context(|cx| cx.push_state(state));
    Guard {
        _not_send: PhantomData,
    }
}

#[must_use]
pub fn is_enabled() -> bool {
    imp::is_enabled()
}

#[derive(Debug)]
pub struct Guard {
    _not_send: PhantomData<*mut ()>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(initial_state) = imp::with_context(Context::pop_state) {
            imp::restore(initial_state);
        }
    }
}

/// Marks the current execution context as an interrupt handler.
///
/// Called by the trap entry path; the marker is cleared when the guard is
/// dropped. Handlers may nest.
pub fn enter_isr() -> IsrGuard {
    imp::with_context(Context::enter_isr);
    IsrGuard {
        _not_send: PhantomData,
    }
}

#[derive(Debug)]
pub struct IsrGuard {
    _not_send: PhantomData<*mut ()>,
}

impl Drop for IsrGuard {
    fn drop(&mut self) {
        imp::with_context(Context::exit_isr);
    }
}

/// Returns `true` while running inside an interrupt handler.
#[must_use]
pub fn in_isr() -> bool {
    imp::with_context(|cx| cx.isr_depth.get() > 0)
}

/// Rejects a call that may suspend the caller when made from an interrupt
/// handler.
///
/// # Panics
///
/// Panics if called from interrupt context.
#[track_caller]
pub fn assert_may_block() {
    assert!(
        !in_isr(),
        "blocking operation called from interrupt context"
    );
}

/// Context storage for bare-metal targets with a single hart.
#[cfg(any(test, not(feature = "std")))]
struct SingleCore(Context);

// Only touched with interrupts masked or from the interrupt handler itself,
// and there is exactly one hart.
#[cfg(any(test, not(feature = "std")))]
unsafe impl Sync for SingleCore {}

#[cfg(any(test, not(feature = "std")))]
impl SingleCore {
    const fn new() -> Self {
        Self(Context::new())
    }
}

#[derive(Debug)]
struct Context {
    disabled_depth: Cell<usize>,
    initial_state: Cell<imp::State>,
    isr_depth: Cell<usize>,
}

impl Context {
    const fn new() -> Self {
        Self {
            disabled_depth: Cell::new(0),
            initial_state: Cell::new(imp::State::new()),
            isr_depth: Cell::new(0),
        }
    }

    fn push_state(&self, state: imp::State) {
        assert!(!is_enabled());
        let depth = self.disabled_depth.get();
        if depth == 0 {
            self.initial_state.set(state);
        }
        self.disabled_depth.set(depth + 1);
    }

    fn pop_state(&self) -> Option<imp::State> {
        assert!(!is_enabled());
        let depth = self.disabled_depth.get();
        assert!(depth > 0, "interrupt guard dropped more often than taken");
        self.disabled_depth.set(depth - 1);
        (depth == 1).then(|| self.initial_state.get())
    }

    fn enter_isr(&self) {
        self.isr_depth.set(self.isr_depth.get() + 1);
    }

    fn exit_isr(&self) {
        let depth = self.isr_depth.get();
        assert!(depth > 0, "interrupt context exited more often than entered");
        self.isr_depth.set(depth - 1);
    }
}
