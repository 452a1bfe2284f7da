// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-photoacoustic project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Lumped shell thermal model of a heater block.
//!
//! The hotend is discretised into `metal_cells + 1` cells: cell `0` is the
//! innermost shell, co-located with the heater; cell `N-2` is the shell the
//! sensor is attached to; cell `N-1` is a pseudo-cell clamped to ambient
//! temperature. Heat flow between adjacent cells is simulated as a cellular
//! automaton, intentionally crude — the autotuner absorbs geometry error
//! into `thermal_conductivity`.

use std::collections::VecDeque;

use log::warn;

/// Length of the egress ring buffer (spec: "length 3").
const EGRESS_SAMPLES: usize = 3;

/// Maximum number of degrees a single sensor correction is allowed to pull
/// a cell by, before the correction is considered exaggerated.
const MAX_EXAGGERATION: f64 = 5.0;

/// Parameters that define a hotend's physical behaviour.
///
/// Immutable once the model is constructed; re-tuning means building a new
/// `Model`, not mutating one in place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelParams {
    /// Degrees per second applied to cell 0 at full PWM.
    pub heater_power: f64,
    /// Metal-to-metal per-pass exchange fraction, in `[0, 1]`.
    pub thermal_conductivity: f64,
    /// Metal-to-ambient exchange fraction at zero fan, in `[0, 1]`.
    pub base_cooling: f64,
    /// Additional metal-to-ambient exchange at full fan, in `[0, 1 - base_cooling]`.
    pub fan_cooling: f64,
    /// Number of metal cells (`N - 1`). Must be `>= 2` so `N - 1 >= 3`.
    pub metal_cells: usize,
    /// Minimum number of dissipation sub-passes to run per simulated second.
    pub passes_per_sec: u32,
}

impl ModelParams {
    /// Validate the invariants spec.md §3 places on model parameters.
    ///
    /// Returns the violated bound as `Err(String)` on failure so callers can
    /// wrap it into `CoreError::ConfigRejected`.
    pub fn validate(&self) -> Result<(), String> {
        if self.heater_power <= 0.0 {
            return Err(format!("heater_power must be > 0, got {}", self.heater_power));
        }
        if !(0.0..=1.0).contains(&self.thermal_conductivity) {
            return Err(format!(
                "thermal_conductivity must be in [0, 1], got {}",
                self.thermal_conductivity
            ));
        }
        if self.base_cooling < 0.0 || self.base_cooling > 1.0 {
            return Err(format!("base_cooling must be in [0, 1], got {}", self.base_cooling));
        }
        if self.fan_cooling < 0.0 || self.base_cooling + self.fan_cooling > 1.0 {
            return Err(format!(
                "fan_cooling must be in [0, 1 - base_cooling] ({}), got {}",
                1.0 - self.base_cooling,
                self.fan_cooling
            ));
        }
        if self.metal_cells < 2 {
            return Err(format!("metal_cells must be >= 2, got {}", self.metal_cells));
        }
        if self.passes_per_sec < 1 {
            return Err(format!("passes_per_sec must be >= 1, got {}", self.passes_per_sec));
        }
        Ok(())
    }
}

/// Simulated state of a hotend: cell temperatures, accumulated time, and the
/// short history of unmodelled heat loss ("egress").
#[derive(Debug, Clone)]
pub struct Model {
    params: ModelParams,
    cells: Vec<f64>,
    time: f64,
    env_temp: f64,
    egress_samples: VecDeque<f64>,
}

impl Model {
    /// Construct a model with every cell initialised to `initial_temp` and
    /// `env_temp` seeded to the same value (it only ever drops from there,
    /// per spec.md §3's monotonicity invariant).
    pub fn new(params: ModelParams, initial_temp: f64, env_temp: f64) -> Self {
        let cell_count = params.metal_cells + 1;
        let mut egress_samples = VecDeque::with_capacity(EGRESS_SAMPLES);
        egress_samples.extend(std::iter::repeat(0.0).take(EGRESS_SAMPLES));
        Self {
            params,
            cells: vec![initial_temp; cell_count],
            time: 0.0,
            env_temp,
            egress_samples,
        }
    }

    /// Number of cells (`N`), including the heater cell and the ambient pseudo-cell.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Index of the ambient pseudo-cell (`N - 1`).
    fn ambient_idx(&self) -> usize {
        self.cells.len() - 1
    }

    /// Index of the sensor cell (`N - 2`).
    fn sensor_idx(&self) -> usize {
        self.cells.len() - 2
    }

    /// Current cell temperatures (`cells[0..N]`).
    pub fn cells(&self) -> &[f64] {
        &self.cells
    }

    /// Accumulated simulated seconds.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Current ambient estimate, monotonically non-increasing across ticks.
    pub fn env_temp(&self) -> f64 {
        self.env_temp
    }

    pub fn params(&self) -> ModelParams {
        self.params
    }

    /// Mean per-second unmodelled heat loss, in °C·s⁻¹.
    pub fn egress_p_sec(&self) -> f64 {
        self.egress_samples.iter().sum::<f64>() / self.egress_samples.len() as f64
    }

    /// Mean temperature of the metal cells (`cells[0..N-1]`), excluding ambient.
    pub fn avg_metal_temp(&self) -> f64 {
        let n = self.ambient_idx();
        self.cells[..n].iter().sum::<f64>() / n as f64
    }

    /// Current sensor-cell (`N-2`) reading, without correcting against a
    /// measurement.
    pub fn sensor_temp(&self) -> f64 {
        self.cells[self.sensor_idx()]
    }

    /// Add `delta` degrees directly to `cell`, bypassing dissipation and
    /// sensor correction. Used by the steady-state gradient solver to
    /// reinject energy a perfect energy-conserving controller would have
    /// supplied (spec.md §4.5).
    pub fn nudge_cell(&mut self, cell: usize, delta: f64) {
        self.cells[cell] += delta;
    }

    /// Advance the model by `dt` seconds under the given PWM/fan drive with
    /// no sensor correction, used by the autotune fitter to replay a
    /// recorded PWM schedule as a pure forward simulation (spec.md §4.4) and
    /// by the gradient solver (spec.md §4.5), neither of which has a live
    /// measurement to correct against.
    pub fn step_without_correction(&mut self, dt: f64, pwm: f64, fan_power: f64) {
        let passes = ((dt * 3.0).floor() as i64).max(1) as u32;
        let sub_dt = dt / passes as f64;
        for _ in 0..passes {
            self.dissipate(sub_dt, pwm, fan_power);
        }
        self.time += dt;
    }

    /// conductivity(i, src): `base_cooling + fan * fan_cooling` if either
    /// index touches the ambient pseudo-cell, else `thermal_conductivity`.
    fn conductivity(&self, a: usize, b: usize, fan_power: f64) -> f64 {
        let ambient = self.ambient_idx();
        if a == ambient || b == ambient {
            self.params.base_cooling + fan_power * self.params.fan_cooling
        } else {
            self.params.thermal_conductivity
        }
    }

    /// One dissipation sub-pass of length `delta` seconds.
    fn dissipate(&mut self, delta: f64, pwm: f64, fan_power: f64) {
        let n = self.cells.len();
        let mut new_cells = self.cells.clone();
        for i in 0..n {
            let mut contribution = 0.0;
            if i > 0 {
                let src = i - 1;
                contribution += self.conductivity(i, src, fan_power) * (self.cells[src] - self.cells[i]);
            }
            if i + 1 < n {
                let src = i + 1;
                contribution += self.conductivity(i, src, fan_power) * (self.cells[src] - self.cells[i]);
            }
            if i == 0 {
                contribution += pwm * self.params.heater_power;
            }
            new_cells[i] = self.cells[i] + delta * contribution;
        }
        new_cells[n - 1] = self.env_temp;
        self.cells = new_cells;
    }

    /// Advance the model by `dt` seconds under the given PWM/fan drive, then
    /// correct it against the measured sensor temperature. Returns the
    /// post-correction sensor-cell temperature.
    ///
    /// See spec.md §4.1 for the exact contract; this is the only mutator of
    /// `Model` besides construction.
    pub fn advance(&mut self, dt: f64, pwm: f64, sensor_temp: f64, fan_power: f64) -> f64 {
        if sensor_temp < self.env_temp {
            self.env_temp = sensor_temp;
        }

        let passes = ((dt * 3.0).floor() as i64).max(1) as u32;
        let sub_dt = dt / passes as f64;
        for _ in 0..passes {
            self.dissipate(sub_dt, pwm, fan_power);
        }
        self.time += dt;

        let new_avg_energy =
            self.avg_metal_temp() - (dt * pwm * self.params.heater_power) / self.params.metal_cells as f64;
        self.egress_samples.pop_front();
        self.egress_samples.push_back((new_avg_energy - sensor_temp) / dt);

        self.correct(sensor_temp);

        self.cells[self.sensor_idx()]
    }

    /// Pull the sensor cell (and, absent a spurious reading, the one behind
    /// it) toward the measurement. A single bad sample is capped so it can't
    /// destabilise the model.
    fn correct(&mut self, sensor_temp: f64) {
        let sensor_idx = self.sensor_idx();
        let delta = self.cells[sensor_idx] - sensor_temp;
        if (1.3 * delta).abs() > MAX_EXAGGERATION {
            warn!("sensor correction capped: raw delta={delta:.3} exceeds {MAX_EXAGGERATION} degrees");
            let sign = if delta < 0.0 { -1.0 } else { 1.0 };
            self.cells[sensor_idx] -= sign * delta.abs().max(MAX_EXAGGERATION);
        } else {
            self.cells[sensor_idx] -= 1.3 * delta;
            self.cells[sensor_idx - 1] -= 0.7 * delta;
        }
    }
}
