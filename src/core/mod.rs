//! Supervised process groups.
//!
//! Core owns the process model: the owner-side handle, the coordinator and
//! sentinel roles it re-executes, and the wire types between them.

pub mod coordinator;
pub mod supervisor;
pub mod types;
