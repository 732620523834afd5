//! Hosted backend: each host thread behaves like an independent execution
//! context with its own interrupt-enable flag.

use core::cell::Cell;

use super::Context;

#[derive(Debug, Clone, Copy)]
pub struct State {
    enabled: bool,
}

impl State {
    pub const fn new() -> Self {
        Self { enabled: true }
    }
}

std::thread_local! {
    static ENABLED: Cell<bool> = const { Cell::new(true) };
    static CONTEXT: Context = const { Context::new() };
}

pub fn read_and_disable() -> State {
    State {
        enabled: ENABLED.with(|enabled| enabled.replace(false)),
    }
}

pub fn is_enabled() -> bool {
    ENABLED.with(Cell::get)
}

pub fn restore(state: State) {
    assert!(!is_enabled());
    if state.enabled {
        ENABLED.with(|enabled| enabled.set(true));
    }
}

pub fn with_context<R>(f: impl FnOnce(&Context) -> R) -> R {
    CONTEXT.with(f)
}
