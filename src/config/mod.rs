//! Configuration
//!
//! Typed settings and the shared error taxonomy.

pub mod settings;
pub mod types;
