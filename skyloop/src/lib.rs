//! Inside-out iterative map-making driver.
//!
//! Runs an external map-maker once per iteration, each call performing a
//! single iteration and taking the previous call's map as its initial sky
//! estimate. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (configuration overlays, the
//!   iteration plan, artifact reconciliation decisions). No I/O.
//! - **[`io`]**: Side-effecting operations (scratch area, process execution,
//!   working-directory artifacts). Behind traits where tests need to fake them.
//!
//! [`driver`] coordinates the two to implement a full run.

pub mod core;
pub mod driver;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
