//! Integration tests for `arcane-updater`.
//!
//! This crate doesn't contain any actual functionality. It's just a container for
//! integration tests that drive the built binary end to end.

// This function only exists to satisfy the compiler, as this crate doesn't have any real functionality
#[doc(hidden)]
pub fn _dummy() {}
