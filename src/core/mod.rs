//! Core domain types and graph algorithms.
//!
//! Everything in here is synchronous and free of I/O.

pub mod cycle;
pub mod graph;
pub mod plan;
pub mod stack;
pub mod time;
pub mod topo;
pub mod types;
