//! guestvisor: supervises disposable guest-kernel sandboxes
//!
//! A fixed pool of slots runs untrusted task artifacts inside user-mode guest
//! kernels. Every run is a process group raced against a wall-clock timeout
//! and torn down completely, descendants included, whichever way it ends.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::signal`]: Process-wide signal dispatch registry
//! - [`kernel::flock`]: Advisory locks on disk backing files
//!
//! ## Supervision ([`core`])
//! - [`core::supervisor`]: Owner side of a supervised process group
//! - [`core::coordinator`]: Coordinator and sentinel re-exec roles
//! - [`core::types`]: Owner/coordinator wire contract
//!
//! ## Guest Launch ([`guest`])
//! - [`guest::launch`]: Launch specification and argument construction
//! - [`guest::exec`]: Pre-exec setup inside the worker
//! - [`guest::network`]: Per-slot tap devices
//!
//! ## Slot Pool ([`pool`])
//! - [`pool::slot`]: One sandbox slot and its run lifecycle
//! - [`pool::workspace`]: Per-slot working directory
//! - [`pool::output`]: Result extraction from the output disk
//!
//! ## Plugins ([`plugins`])
//! - Hooks run before each guest launch and extra disk images
//!
//! ## Configuration ([`config`])
//! - [`config::settings`]: Layered JSON settings
//! - [`config::types`]: Shared error and status types
//!
//! ## Utilities ([`utils`])
//! - [`utils::fd_closure`]: FD closure before exec
//! - [`utils::size`]: Byte size parsing

// Kernel Primitives
pub mod kernel;

// Process-group supervision
pub mod core;

// Guest kernel launch
pub mod guest;

// Slot pool
pub mod pool;

// Launch hooks
pub mod plugins;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint wiring for the guestvisor binary.
pub mod cli;

pub use config::types::*;
