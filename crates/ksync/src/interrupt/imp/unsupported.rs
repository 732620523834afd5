//! Fallback for targets without an interrupt backend.
//!
//! Interrupt masking is unavailable, but the interrupt-context marker still
//! works, so thread-context primitives such as the heap mutex remain usable.

use super::{Context, SingleCore};

#[derive(Debug, Clone, Copy)]
pub struct State();

impl State {
    pub const fn new() -> Self {
        Self()
    }
}

static CONTEXT: SingleCore = SingleCore::new();

pub fn read_and_disable() -> State {
    unimplemented!("interrupt masking on an unsupported architecture");
}

pub fn is_enabled() -> bool {
    unimplemented!("interrupt masking on an unsupported architecture");
}

pub fn restore(_state: State) {
    unimplemented!("interrupt masking on an unsupported architecture");
}

pub fn with_context<R>(f: impl FnOnce(&Context) -> R) -> R {
    f(&CONTEXT.0)
}
