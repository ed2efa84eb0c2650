//! Guest kernel launch
//!
//! Launch specifications, the worker-side exec role and tap device
//! descriptors.

pub mod exec;
pub mod launch;
pub mod network;
