//! I/O helpers for the inside-out pipeline.

pub mod artifacts;
pub mod config;
pub mod iteration_log;
pub mod process;
pub mod scratch;
pub mod tasks;
