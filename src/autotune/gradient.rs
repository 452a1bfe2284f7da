// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-photoacoustic project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Steady-state gradient solver (spec.md §4.5).
//!
//! After the fitter recovers the model's physical constants, the controller
//! still needs to know the gap between the sensor and the block average at
//! equilibrium. This runs the tuned model closed-loop at `calibrate_temp`
//! under a perfect energy-conserving controller and reads that gap off
//! directly, once with the fan off and once at full fan.

use log::info;

use crate::error::CoreError;
use crate::model::{Model, ModelParams};

const GRADIENT_TICKS: u32 = 500;
const GRADIENT_DT: f64 = 0.2;

/// The two offsets configuration key `model_steadystate_offset_base` /
/// `_fans` persist.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SteadyStateOffsets {
    pub offset_base: f64,
    pub offset_fans: f64,
}

/// Run the fixed-energy simulation once at a given fan power and report the
/// resulting `(calibrate_temp − sensor) / (calibrate_temp − env_temp)` ratio.
fn solve_one(params: ModelParams, calibrate_temp: f64, env_temp: f64, fan_power: f64) -> f64 {
    let mut model = Model::new(params, calibrate_temp, env_temp);
    let metal_cells = params.metal_cells;
    let initial_energy: f64 = model.cells()[..metal_cells].iter().sum();

    for _ in 0..GRADIENT_TICKS {
        model.step_without_correction(GRADIENT_DT, 0.0, fan_power);
        let current_energy: f64 = model.cells()[..metal_cells].iter().sum();
        model.nudge_cell(0, initial_energy - current_energy);
    }

    (calibrate_temp - model.sensor_temp()) / (calibrate_temp - env_temp)
}

/// Solve both offsets for a tuned model. Fails only if `calibrate_temp`
/// coincides with `env_temp`, which would make the ratio undefined.
pub fn solve(params: ModelParams, calibrate_temp: f64, env_temp: f64) -> Result<SteadyStateOffsets, CoreError> {
    if (calibrate_temp - env_temp).abs() < 1e-9 {
        return Err(CoreError::DegenerateFit(
            "steady-state solver needs calibrate_temp != env_temp".to_string(),
        ));
    }
    let offset_base = solve_one(params, calibrate_temp, env_temp, 0.0);
    let offset_fans = solve_one(params, calibrate_temp, env_temp, 1.0);
    info!("steady-state offsets: base={offset_base:.4} fans={offset_fans:.4}");
    Ok(SteadyStateOffsets { offset_base, offset_fans })
}
