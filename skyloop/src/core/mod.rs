//! Deterministic, pure logic for the inside-out pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod overlay;
pub mod pattern;
pub mod plan;
pub mod reconcile;
pub mod types;
