// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-photoacoustic project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Signal smoothing and differentiation for autotune traces.
//!
//! Grounded on the teacher's `src/preprocessing/filters.rs` (a small
//! dependency-free filter implementation with a `with_*` builder style)
//! and `src/preprocessing/differential.rs` (function-plus-doc-test
//! texture). The Savitzky-Golay coefficient derivation itself has no
//! direct corpus analogue; it is a from-scratch least-squares solve, see
//! below.

/// Minimum gap, in seconds, a derivative estimate's neighbour samples must
/// straddle (spec.md §4.4).
pub const DELTA_T: f64 = 0.5;

const POLY_ORDER: usize = 3;
const POLY_COEFFS: usize = POLY_ORDER + 1;

/// Window length for the Savitzky-Golay filter: `clamp(len/5, 20, 100)`,
/// rounded to the nearest odd number, and never wider than the signal
/// itself (short synthetic traces in tests fall back to the largest odd
/// window that fits).
pub fn window_length(len: usize) -> usize {
    let raw = ((len as f64 / 5.0).round() as i64).clamp(20, 100) as usize;
    let odd = if raw % 2 == 0 { raw + 1 } else { raw };
    if odd <= len {
        odd
    } else {
        let fit = if len % 2 == 0 { len.saturating_sub(1) } else { len };
        fit.max(1)
    }
}

/// Invert a 4x4 matrix via Gauss-Jordan elimination. Used once per window
/// length to turn the fixed Vandermonde normal-equation matrix into the
/// smoothing kernel; `ata` is always symmetric positive-definite for a
/// non-degenerate window so this never hits a singular pivot in practice.
fn invert4(mut ata: [[f64; POLY_COEFFS]; POLY_COEFFS]) -> [[f64; POLY_COEFFS]; POLY_COEFFS] {
    let n = POLY_COEFFS;
    let mut inv = [[0.0; POLY_COEFFS]; POLY_COEFFS];
    for i in 0..n {
        inv[i][i] = 1.0;
    }
    for col in 0..n {
        let mut pivot_row = col;
        for row in (col + 1)..n {
            if ata[row][col].abs() > ata[pivot_row][col].abs() {
                pivot_row = row;
            }
        }
        ata.swap(col, pivot_row);
        inv.swap(col, pivot_row);

        let pivot = ata[col][col];
        for j in 0..n {
            ata[col][j] /= pivot;
            inv[col][j] /= pivot;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = ata[row][col];
            for j in 0..n {
                ata[row][j] -= factor * ata[col][j];
                inv[row][j] -= factor * inv[col][j];
            }
        }
    }
    inv
}

/// `(A^T A)^-1` for a window of `half_width` points on each side of center,
/// offsets `-half_width..=half_width`, fit with a degree-3 polynomial.
fn normal_equations_inverse(half_width: i64) -> [[f64; POLY_COEFFS]; POLY_COEFFS] {
    let mut ata = [[0.0; POLY_COEFFS]; POLY_COEFFS];
    for o in -half_width..=half_width {
        let o = o as f64;
        let powers: [f64; POLY_COEFFS] = [1.0, o, o * o, o * o * o];
        for r in 0..POLY_COEFFS {
            for c in 0..POLY_COEFFS {
                ata[r][c] += powers[r] * powers[c];
            }
        }
    }
    invert4(ata)
}

/// Weight vector for evaluating the least-squares polynomial fit of a
/// window at offset `o_eval` from that window's own center, given the
/// window's precomputed `(A^T A)^-1`.
fn weights_for_offset(ata_inv: &[[f64; POLY_COEFFS]; POLY_COEFFS], half_width: i64, o_eval: f64) -> Vec<f64> {
    let v: [f64; POLY_COEFFS] = [1.0, o_eval, o_eval * o_eval, o_eval * o_eval * o_eval];
    let mut r = [0.0; POLY_COEFFS];
    for i in 0..POLY_COEFFS {
        for j in 0..POLY_COEFFS {
            r[i] += ata_inv[i][j] * v[j];
        }
    }
    let width = (2 * half_width + 1) as usize;
    let mut w = Vec::with_capacity(width);
    for j in 0..width {
        let o = (j as i64 - half_width) as f64;
        let powers = [1.0, o, o * o, o * o * o];
        w.push(powers.iter().zip(r.iter()).map(|(p, ri)| p * ri).sum());
    }
    w
}

/// Savitzky-Golay smoothing, order 3, window length per [`window_length`].
///
/// Interior points use a centered window; points within `half_width` of
/// either edge reuse the nearest fully-in-bounds window of the same width,
/// evaluating the fitted polynomial at that point's true (non-zero) offset
/// from the window's center rather than shrinking the window — this keeps
/// one precomputed coefficient set for the whole signal.
pub fn savitzky_golay(samples: &[f64]) -> Vec<f64> {
    let len = samples.len();
    if len == 0 {
        return Vec::new();
    }
    let window = window_length(len).min(len);
    if window < 3 {
        return samples.to_vec();
    }
    let half = (window / 2) as i64;
    let ata_inv = normal_equations_inverse(half);

    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let i = i as i64;
        let center = i.clamp(half, len as i64 - 1 - half);
        let start = (center - half) as usize;
        let end = (center + half) as usize;
        let o_eval = (i - center) as f64;
        let weights = weights_for_offset(&ata_inv, half, o_eval);
        let value: f64 = weights.iter().zip(&samples[start..=end]).map(|(w, s)| w * s).sum();
        out.push(value);
    }
    out
}

/// Derivative at `i`, via symmetric finite difference: find the nearest
/// samples at least [`DELTA_T`] seconds before and after `i`, take the two
/// one-sided slopes, and blend them weighted by the *other* side's share of
/// the total interval (so the slope computed over the shorter gap — the
/// more locally accurate one — dominates).
pub fn derivative_at(timestamps: &[f64], smoothed: &[f64], i: usize) -> f64 {
    debug_assert_eq!(timestamps.len(), smoothed.len());
    let t_i = timestamps[i];

    let mut before = i;
    while before > 0 && t_i - timestamps[before - 1] < DELTA_T {
        before -= 1;
    }
    if before > 0 {
        before -= 1;
    }

    let mut after = i;
    while after + 1 < timestamps.len() && timestamps[after + 1] - t_i < DELTA_T {
        after += 1;
    }
    if after + 1 < timestamps.len() {
        after += 1;
    }

    if before == i && after == i {
        return 0.0;
    }
    if before == i {
        return (smoothed[after] - smoothed[i]) / (timestamps[after] - t_i);
    }
    if after == i {
        return (smoothed[i] - smoothed[before]) / (t_i - timestamps[before]);
    }

    let h1 = t_i - timestamps[before];
    let h2 = timestamps[after] - t_i;
    let slope_before = (smoothed[i] - smoothed[before]) / h1;
    let slope_after = (smoothed[after] - smoothed[i]) / h2;
    let total = h1 + h2;
    slope_before * (h2 / total) + slope_after * (h1 / total)
}
