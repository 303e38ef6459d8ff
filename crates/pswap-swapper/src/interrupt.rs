//! Cooperative thread interrupt status.
//!
//! The enclosing cache's interruption machinery closes swap channels out
//! from under in-flight I/O and marks the victim thread as interrupted. The
//! swapper's retry loops clear the flag around each reopen attempt and
//! reassert it once the operation completes, so callers still observe the
//! interruption after their I/O has been transparently finished.

use std::cell::Cell;

thread_local! {
    static INTERRUPTED: Cell<bool> = const { Cell::new(false) };
}

/// Mark the current thread as interrupted.
pub fn interrupt() {
    INTERRUPTED.with(|flag| flag.set(true));
}

/// Clear and return the current thread's interrupt status.
#[must_use]
pub fn take() -> bool {
    INTERRUPTED.with(|flag| flag.replace(false))
}

/// Current interrupt status, without clearing it.
#[must_use]
pub fn is_interrupted() -> bool {
    INTERRUPTED.with(Cell::get)
}
