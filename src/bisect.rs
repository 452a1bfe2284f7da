// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-photoacoustic project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Stateful binary search over a scalar parameter, driven by a signed error
//! function.
//!
//! The original implementation is a Python generator that `yield`s a
//! candidate and receives feedback through `send()`. Per spec.md §9's
//! Design Notes this is re-architected as a plain driver struct holding
//! `(lower, upper, stage)`, with a `feedback` method instead of coroutine
//! semantics — no `Generator`/`Coroutine` trait needed.

use crate::error::CoreError;

/// Default convergence tolerance for parameter searches (spec.md §4.4).
pub const DEFAULT_EPS: f64 = 5e-4;

/// Safety cap on the bracket-expansion phase; if the upper bound hasn't
/// bracketed the root after this many doublings the search is degenerate.
const MAX_EXPANSIONS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    /// Still doubling `upper` looking for a sign change.
    Expanding,
    /// Bisecting within a known bracket.
    Bisecting,
}

/// Drives a binary search: call [`BinarySearch::candidate`] for the value to
/// evaluate next, evaluate the caller's error function at it, and pass the
/// signed result to [`BinarySearch::feedback`]. A positive error means the
/// candidate is too low (the target lies higher); `feedback` returns
/// `Some(value)` once the search has converged to within `eps`.
#[derive(Debug, Clone)]
pub struct BinarySearch {
    lower: f64,
    upper: f64,
    eps: f64,
    stage: Stage,
    candidate: f64,
    expansions: u32,
}

impl BinarySearch {
    /// Start a search over `[lower, upper]`, converging once the bracket is
    /// narrower than `eps`.
    pub fn new(lower: f64, upper: f64, eps: f64) -> Self {
        Self {
            lower,
            upper,
            eps,
            stage: Stage::Expanding,
            candidate: upper,
            expansions: 0,
        }
    }

    /// The next value to evaluate the error function at.
    pub fn candidate(&self) -> f64 {
        self.candidate
    }

    /// Report the signed error at the last candidate. Returns `Ok(Some(x))`
    /// once converged, `Ok(None)` if another candidate is needed, or
    /// `Err` if the bracket never closed (non-monotone error function, or a
    /// root outside the doubling range).
    pub fn feedback(&mut self, error: f64) -> Result<Option<f64>, CoreError> {
        match self.stage {
            Stage::Expanding => {
                if error > 0.0 {
                    self.expansions += 1;
                    if self.expansions > MAX_EXPANSIONS {
                        return Err(CoreError::DegenerateFit(format!(
                            "bracket expansion exceeded {MAX_EXPANSIONS} doublings without finding a sign change"
                        )));
                    }
                    self.lower = self.upper;
                    self.upper *= 2.0;
                    self.candidate = self.upper;
                    Ok(None)
                } else {
                    self.stage = Stage::Bisecting;
                    self.candidate = (self.lower + self.upper) / 2.0;
                    Ok(None)
                }
            }
            Stage::Bisecting => {
                if error > 0.0 {
                    self.lower = self.candidate;
                } else {
                    self.upper = self.candidate;
                }
                if (self.upper - self.lower).abs() < self.eps {
                    Ok(Some((self.lower + self.upper) / 2.0))
                } else {
                    self.candidate = (self.lower + self.upper) / 2.0;
                    Ok(None)
                }
            }
        }
    }
}

/// Drive a [`BinarySearch`] to convergence against `error_fn`, which must be
/// monotonically non-increasing in its argument and return a positive value
/// when the candidate is too low.
pub fn bin_search_float(
    lower: f64,
    upper: f64,
    eps: f64,
    mut error_fn: impl FnMut(f64) -> f64,
) -> Result<f64, CoreError> {
    let mut search = BinarySearch::new(lower, upper, eps);
    loop {
        let x = search.candidate();
        let err = error_fn(x);
        if let Some(result) = search.feedback(err)? {
            return Ok(result);
        }
    }
}
