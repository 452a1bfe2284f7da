// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-photoacoustic project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Matchable failure kinds for the core (spec.md §7).
//!
//! `ModelDivergence` (the capped sensor correction in [`crate::model`]) is
//! deliberately absent here — spec.md §7 treats it as non-fatal and handled
//! inline; it is logged at `warn!` level rather than surfaced as an error.

use thiserror::Error;

/// Domain-specific errors raised at control-flow boundaries.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A configuration value fell outside its documented bound (spec.md §6).
    /// Fatal at construction time.
    #[error("configuration rejected: {key} = {value} ({reason})")]
    ConfigRejected {
        key: String,
        value: String,
        reason: String,
    },

    /// The recording state machine did not reach `done` before the host
    /// gave up; no config can be emitted.
    #[error("autotune aborted: phase '{last_phase}' never completed ({reason})")]
    AutotunePhaseFailure { last_phase: String, reason: String },

    /// The steady-state gradient solver's estimated gradient was `>= 1`, or
    /// bisection failed to converge within its iteration budget.
    #[error("degenerate fit: {0}")]
    DegenerateFit(String),

    /// A trace file line didn't match any of the three documented forms.
    #[error("invalid trace line {line_no}: {content:?} ({reason})")]
    InvalidTrace {
        line_no: usize,
        content: String,
        reason: String,
    },
}
