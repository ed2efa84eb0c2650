//! Thin wrappers around Linux kernel primitives.
//!
//! All `sigaction` and `flock` calls are concentrated here.

pub mod flock;
pub mod signal;
