//! Utilities
//!
//! Cross-cutting helpers for descriptor hygiene and size parsing.

pub mod fd_closure;
pub mod size;
