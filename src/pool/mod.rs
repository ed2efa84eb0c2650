//! Sandbox slot pool
//!
//! A fixed set of slots, each owning one guest launcher and a private working
//! directory, plus extraction of results from a finished guest.

pub mod output;
#[allow(clippy::module_inception)]
pub mod pool;
pub mod slot;
pub mod workspace;

pub use pool::{PoolStatus, SandboxPool};
pub use slot::{Notifier, SandboxSlot};
