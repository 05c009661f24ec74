//! Deterministic, pure logic shared by the supervision core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures (time is passed in) and return deterministic outputs
//! suitable for tests.

pub mod circuit;
pub mod classifier;
pub mod graph;
pub mod orchestration;
pub mod retry;
pub mod signature;
pub mod types;
