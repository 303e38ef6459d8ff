#![forbid(unsafe_code)]
//! Public API facade for the page swapper workspace.
//!
//! Re-exports the swapper core through a stable external interface. This is
//! the crate that an enclosing page cache depends on.

pub use pswap_swapper::*;
