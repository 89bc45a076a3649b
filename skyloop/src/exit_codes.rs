//! Stable exit codes for the `skyloop` command.

/// All iterations completed and post-processing ran.
pub const OK: i32 = 0;
/// A parameter was rejected before any external task ran.
pub const INVALID: i32 = 1;
/// An external task or a file operation failed part-way through the run.
pub const FAILED: i32 = 2;
