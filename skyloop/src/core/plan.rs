//! Deterministic iteration plan for the inside-out loop.

use crate::core::overlay::Phase;

/// Where one iteration reads its time-series data from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    /// The raw input group supplied by the user.
    Raw,
    /// The cleaned time-series exported by iteration 1.
    Cleaned,
}

/// Everything the loop needs to know about one iteration before running it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationStep {
    /// 1-indexed iteration number.
    pub iter: u32,
    pub phase: Phase,
    pub input: InputSource,
    /// Whether the previous iteration's map is passed as the sky estimate.
    pub uses_previous_map: bool,
    /// Whether the output goes to the user's final map instead of a scratch slot.
    pub writes_final: bool,
}

/// Lay out `niter` iterations: first, then recurring, then last.
///
/// With `niter == 1` the only iteration is a first-phase run that writes the
/// final map directly; no recurring or last phase is planned.
pub fn plan_iterations(niter: u32) -> Vec<IterationStep> {
    (1..=niter)
        .map(|iter| {
            let phase = if iter == 1 {
                Phase::First
            } else if iter == niter {
                Phase::Last
            } else {
                Phase::Recurring
            };
            IterationStep {
                iter,
                phase,
                input: if phase == Phase::First {
                    InputSource::Raw
                } else {
                    InputSource::Cleaned
                },
                uses_previous_map: phase != Phase::First,
                writes_final: iter == niter,
            }
        })
        .collect()
}
