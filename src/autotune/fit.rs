// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-photoacoustic project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Curve fitter: turns a recorded [`Trace`] into a tuned [`ModelParams`]
//! (spec.md §4.4).
//!
//! Each physical constant is recovered by replaying the trace's recorded
//! PWM schedule through a pure forward simulation ([`Model::step_without_correction`],
//! no sensor correction — the whole point is to discover what parameters
//! make the *unaided* physics match what was measured) and driving
//! [`bin_search_float`] against a signed error derived from that replay.

use log::info;

use crate::bisect::{bin_search_float, DEFAULT_EPS};
use crate::error::CoreError;
use crate::model::{Model, ModelParams};
use crate::smoothing::{derivative_at, savitzky_golay};
use crate::trace::{Phase, Trace};

/// Indices at which each recorded phase starts, plus the trace length as a
/// sentinel end bound. `bounds[i]` is `Phase::ORDER[i]`'s start; `bounds[6]`
/// is `trace.len()`.
fn phase_bounds(trace: &Trace) -> Result<[usize; 7], CoreError> {
    let mut bounds = [0usize; 7];
    for (i, &phase) in Phase::ORDER.iter().enumerate() {
        bounds[i] = *trace.phase_start.get(&phase).ok_or_else(|| CoreError::AutotunePhaseFailure {
            last_phase: phase.name().to_string(),
            reason: "trace is missing this phase's start index".to_string(),
        })?;
    }
    bounds[6] = trace.len();
    Ok(bounds)
}

/// The PWM value in effect at `time`: the most recent recorded sample at or
/// before it, or `0.0` before the first one.
fn pwm_at(pwm_samples: &[(f64, f64)], time: f64) -> f64 {
    pwm_samples
        .iter()
        .rev()
        .find(|&&(t, _)| t <= time)
        .map(|&(_, v)| v)
        .unwrap_or(0.0)
}

/// First index in `values[start..end]` at or past `target`, assuming the
/// segment is monotonically increasing. spec.md §9's redesign note upgrades
/// the fitter's repeated linear `find_temp` scan to this binary search.
fn find_temp(values: &[f64], target: f64) -> usize {
    let (mut lo, mut hi) = (0usize, values.len().saturating_sub(1));
    while hi > lo {
        let mid = lo + (hi - lo) / 2;
        if values[mid] < target {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Replay the recorded PWM schedule over `[start, end)` as a pure forward
/// simulation, returning the sensor-cell temperature at each index — this is
/// what a real trace's smoothed samples actually measure, not the block
/// average.
fn replay(
    params: ModelParams,
    trace: &Trace,
    start: usize,
    end: usize,
    fan_power: f64,
    initial_temp: f64,
    env_temp: f64,
) -> Vec<f64> {
    let mut model = Model::new(params, initial_temp, env_temp);
    let mut out = Vec::with_capacity(end - start);
    out.push(model.sensor_temp());
    for i in (start + 1)..end {
        let dt = trace.timestamps[i] - trace.timestamps[i - 1];
        let pwm = pwm_at(&trace.pwm_samples, trace.timestamps[i - 1]);
        model.step_without_correction(dt, pwm, fan_power);
        out.push(model.sensor_temp());
    }
    out
}

/// Fit `dT/dt = a·(T − env_temp) + b` against the cooldown phase: for each
/// integer temperature from `calibrate_temp` down to `cooldown_target`, find
/// the cooldown-phase sample closest to it and take the smoothed derivative
/// there, then solve the two-point linear system at the 10th and
/// `(len-20)`th such point (spec.md §4.4).
fn cooling_curve(
    trace: &Trace,
    env_temp: f64,
    cooldown_start: usize,
    cool_end: usize,
    calibrate_temp: f64,
    cooldown_target: f64,
) -> (f64, f64) {
    let mut points: Vec<(f64, f64)> = Vec::new();
    let mut t = calibrate_temp.floor();
    while t >= cooldown_target.ceil() {
        let mut best_idx = cooldown_start;
        let mut best_diff = f64::INFINITY;
        for i in cooldown_start..cool_end {
            let diff = (trace.smoothed_samples[i] - t).abs();
            if diff < best_diff {
                best_diff = diff;
                best_idx = i;
            }
        }
        let d = derivative_at(&trace.timestamps, &trace.smoothed_samples, best_idx);
        points.push((t, d));
        t -= 1.0;
    }

    let len = points.len();
    let lo = 10.min(len.saturating_sub(1));
    let hi = len.saturating_sub(20).max(lo + 1).min(len.saturating_sub(1));
    let (t1, d1) = points[lo];
    let (t2, d2) = points[hi];
    let x1 = t1 - env_temp;
    let x2 = t2 - env_temp;
    if (x1 - x2).abs() < 1e-9 {
        return (0.0, d1);
    }
    let a = (d1 - d2) / (x1 - x2);
    let b = d1 - a * x1;
    (a, b)
}

/// Integrate the cooling curve forward over `[0, window_end)`, subtracting
/// the cumulative modelled loss from each smoothed sample so the remainder
/// reflects heat actually added by the heater. Clamped to be
/// monotonically non-decreasing for indices below `heatup_end`, guarding
/// against the cooling model overshooting during heatup.
fn compensated_temperature(trace: &Trace, env_temp: f64, a: f64, b: f64, heatup_end: usize, window_end: usize) -> Vec<f64> {
    let mut out = vec![0.0; window_end];
    if window_end == 0 {
        return out;
    }
    out[0] = trace.smoothed_samples[0];
    let mut cumulative_loss = 0.0;
    for i in 1..window_end {
        let dt = trace.timestamps[i] - trace.timestamps[i - 1];
        let loss_rate = a * (trace.smoothed_samples[i - 1] - env_temp) + b;
        cumulative_loss += loss_rate * dt;
        let mut value = trace.smoothed_samples[i] - cumulative_loss;
        if i < heatup_end && value < out[i - 1] {
            value = out[i - 1];
        }
        out[i] = value;
    }
    out
}

/// Step 1: `heater_power` against the compensated temperature at the end of
/// cooldown.
fn fit_heater_power(trace: &Trace, compensated: &[f64], seed: ModelParams, cool_end: usize, env_temp: f64) -> Result<f64, CoreError> {
    let target = compensated[cool_end - 1];
    let initial_temp = trace.smoothed_samples[0];
    bin_search_float(0.0, 100.0, DEFAULT_EPS, |hp| {
        let params = ModelParams { heater_power: hp, ..seed };
        let series = replay(params, trace, 0, cool_end, 0.0, initial_temp, env_temp);
        target - series[series.len() - 1]
    })
}

/// Step 2: `thermal_conductivity` against how long the model takes to reach
/// the real trace's temperature at the heatup phase's midpoint.
fn fit_conductivity(trace: &Trace, heater_power: f64, seed: ModelParams, bounds: &[usize; 7], env_temp: f64) -> Result<f64, CoreError> {
    let (heatup_start, heatup_end) = (bounds[0], bounds[1]);
    let pivot = (heatup_start + heatup_end) / 2;
    let target_temp = trace.smoothed_samples[pivot];
    let initial_temp = trace.smoothed_samples[heatup_start];
    bin_search_float(0.0, 1.0, DEFAULT_EPS, |k| {
        let params = ModelParams {
            heater_power,
            thermal_conductivity: k,
            ..seed
        };
        let series = replay(params, trace, heatup_start, heatup_end, 0.0, initial_temp, env_temp);
        let model_idx = heatup_start + find_temp(&series, target_temp);
        model_idx as f64 - pivot as f64
    })
}

/// Step 3: `base_cooling` against the cooldown phase, rescaling the
/// simulated peak onto the real one first.
fn fit_base_cooling(
    trace: &Trace,
    heater_power: f64,
    conductivity: f64,
    seed: ModelParams,
    bounds: &[usize; 7],
    env_temp: f64,
) -> Result<f64, CoreError> {
    let (start, end) = (bounds[2], bounds[3]);
    let initial_temp = trace.smoothed_samples[start];
    bin_search_float(0.0, 1.0, DEFAULT_EPS, |bc| {
        let params = ModelParams {
            heater_power,
            thermal_conductivity: conductivity,
            base_cooling: bc,
            ..seed
        };
        let series = replay(params, trace, start, end, 0.0, initial_temp, env_temp);
        let max_model = series.iter().cloned().fold(f64::MIN, f64::max);
        let mut scale = trace.smoothed_samples[start] / max_model.max(1e-9);
        if scale > 1.3 {
            scale = 1.0;
        }
        series
            .iter()
            .enumerate()
            .map(|(j, &m)| scale * m - trace.smoothed_samples[start + j])
            .sum()
    })
}

/// Step 4: re-fit `heater_power` to vertically align the simulated peak with
/// the real one, now that conductivity and base cooling are known.
fn refit_heater_power(
    trace: &Trace,
    conductivity: f64,
    base_cooling: f64,
    seed: ModelParams,
    bounds: &[usize; 7],
    env_temp: f64,
) -> Result<f64, CoreError> {
    let start = bounds[0];
    let cool_start = bounds[2];
    let end = cool_start + 1;
    let initial_temp = trace.smoothed_samples[start];
    bin_search_float(0.0, 100.0, DEFAULT_EPS, |hp| {
        let params = ModelParams {
            heater_power: hp,
            thermal_conductivity: conductivity,
            base_cooling,
            ..seed
        };
        let series = replay(params, trace, start, end, 0.0, initial_temp, env_temp);
        trace.smoothed_samples[cool_start] - series[series.len() - 1]
    })
}

/// Step 5: `fan_cooling` against the second (fan-driven) cooldown phase.
/// Deliberately does not reset any state between the non-fan and fan
/// replays — spec.md §9 notes the production controller runs continuously,
/// so fan cooling is expected to be fit against a system already warm from
/// the prior phase.
fn fit_fan_cooling(
    trace: &Trace,
    heater_power: f64,
    conductivity: f64,
    base_cooling: f64,
    seed: ModelParams,
    bounds: &[usize; 7],
    env_temp: f64,
) -> Result<f64, CoreError> {
    let (start, end) = (bounds[5], bounds[6]);
    let initial_temp = trace.smoothed_samples[start];
    let upper = (1.0 - base_cooling).max(0.0);
    bin_search_float(0.0, upper, DEFAULT_EPS, |fc| {
        let params = ModelParams {
            heater_power,
            thermal_conductivity: conductivity,
            base_cooling,
            fan_cooling: fc,
            ..seed
        };
        let series = replay(params, trace, start, end, 1.0, initial_temp, env_temp);
        series
            .iter()
            .enumerate()
            .map(|(j, &m)| m - trace.smoothed_samples[start + j])
            .sum()
    })
}

/// Run the full fit pipeline over a completed trace, recovering the four
/// physical constants `metal_cells`/`passes_per_sec` are held fixed at
/// (they are configuration, not fit targets).
pub fn fit(trace: &mut Trace, metal_cells: usize, passes_per_sec: u32, calibrate_temp: f64) -> Result<ModelParams, CoreError> {
    if trace.is_empty() {
        return Err(CoreError::AutotunePhaseFailure {
            last_phase: Phase::Heatup.name().to_string(),
            reason: "trace has no samples".to_string(),
        });
    }
    trace.smoothed_samples = savitzky_golay(&trace.raw_samples);
    let bounds = phase_bounds(trace)?;
    let env_temp = trace.smoothed_samples[0];
    let cooldown_target = env_temp + 15.0;

    let seed = ModelParams {
        heater_power: 1.0,
        thermal_conductivity: 0.1,
        base_cooling: 0.01,
        fan_cooling: 0.01,
        metal_cells,
        passes_per_sec,
    };

    let (a, b) = cooling_curve(trace, env_temp, bounds[2], bounds[3], calibrate_temp, cooldown_target);
    info!("cooling curve fit: dT/dt = {a:.6}*(T-env) + {b:.6}");
    let compensated = compensated_temperature(trace, env_temp, a, b, bounds[1], bounds[3]);

    let heater_power = fit_heater_power(trace, &compensated, seed, bounds[3], env_temp)?;
    info!("fit heater_power = {heater_power:.4}");
    let thermal_conductivity = fit_conductivity(trace, heater_power, seed, &bounds, env_temp)?;
    info!("fit thermal_conductivity = {thermal_conductivity:.4}");
    let base_cooling = fit_base_cooling(trace, heater_power, thermal_conductivity, seed, &bounds, env_temp)?;
    info!("fit base_cooling = {base_cooling:.4}");
    let heater_power = refit_heater_power(trace, thermal_conductivity, base_cooling, seed, &bounds, env_temp)?;
    info!("refit heater_power = {heater_power:.4}");
    let fan_cooling = fit_fan_cooling(trace, heater_power, thermal_conductivity, base_cooling, seed, &bounds, env_temp)?;
    info!("fit fan_cooling = {fan_cooling:.4}");

    let params = ModelParams {
        heater_power,
        thermal_conductivity,
        base_cooling,
        fan_cooling,
        metal_cells,
        passes_per_sec,
    };
    params.validate().map_err(|reason| CoreError::ConfigRejected {
        key: "autotune result".to_string(),
        value: format!("{params:?}"),
        reason,
    })?;
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{FanControl, FanStatus, HeaterActuator};
    use crate::trace::Recorder;

    struct FakeHeater {
        max_power: f64,
        target: f64,
    }
    impl HeaterActuator for FakeHeater {
        fn set_pwm(&mut self, _time: f64, _value: f64) {}
        fn get_max_power(&self) -> f64 {
            self.max_power
        }
        fn get_pwm_delay(&self) -> f64 {
            0.0
        }
        fn alter_target(&mut self, temp: f64) {
            self.target = temp;
        }
    }
    struct FakeFan {
        power: f64,
    }
    impl FanControl for FakeFan {
        fn set_power(&mut self, power: f64) {
            self.power = power;
        }
    }
    impl FanStatus for FakeFan {
        fn get_status(&self) -> f64 {
            self.power
        }
    }

    /// Generate a synthetic trace by driving a known model through the
    /// recorder's state machine, mirroring spec.md §8 scenario 5.
    fn synthetic_trace(params: ModelParams, calibrate_temp: f64) -> Trace {
        let env_temp = 21.0;
        let mut model = Model::new(params, env_temp, env_temp);
        let mut rec = Recorder::new(
            FakeHeater { max_power: 1.0, target: 0.0 },
            FakeFan { power: 0.0 },
            calibrate_temp,
        );
        let dt = 1.0;
        let mut time = 0.0;
        let mut ticks = 0;
        while rec.check_busy() && ticks < 20_000 {
            let pwm = match rec.phase() {
                crate::trace::Phase::Heatup | crate::trace::Phase::HeatupFan => 1.0,
                _ => 0.0,
            };
            let fan_power = if matches!(
                rec.phase(),
                crate::trace::Phase::HeatupFan | crate::trace::Phase::OvershootFan | crate::trace::Phase::CooldownFan
            ) {
                1.0
            } else {
                0.0
            };
            model.step_without_correction(dt, pwm, fan_power);
            let sensor = model.sensor_temp();
            rec.temperature_update(time, sensor);
            time += dt;
            ticks += 1;
        }
        rec.into_trace()
    }

    #[test]
    fn recovers_all_four_parameters_within_tolerance() {
        let truth = ModelParams {
            heater_power: 2.0,
            thermal_conductivity: 0.08,
            base_cooling: 0.005,
            fan_cooling: 0.015,
            metal_cells: 6,
            passes_per_sec: 3,
        };
        let mut trace = synthetic_trace(truth, 200.0);
        let fitted = fit(&mut trace, truth.metal_cells, truth.passes_per_sec, 200.0).unwrap();

        let rel = |a: f64, b: f64| (a - b).abs() / b;
        assert!(
            rel(fitted.heater_power, truth.heater_power) < 0.3,
            "fitted heater_power={} truth={}",
            fitted.heater_power,
            truth.heater_power
        );
        assert!(
            rel(fitted.thermal_conductivity, truth.thermal_conductivity) < 0.3,
            "fitted thermal_conductivity={} truth={}",
            fitted.thermal_conductivity,
            truth.thermal_conductivity
        );
        assert!(
            rel(fitted.base_cooling, truth.base_cooling) < 0.3,
            "fitted base_cooling={} truth={}",
            fitted.base_cooling,
            truth.base_cooling
        );
        assert!(
            rel(fitted.fan_cooling, truth.fan_cooling) < 0.5,
            "fitted fan_cooling={} truth={}",
            fitted.fan_cooling,
            truth.fan_cooling
        );
    }

    #[test]
    fn fails_on_a_trace_missing_phases() {
        let mut trace = Trace::new();
        trace.timestamps = vec![0.0, 1.0, 2.0];
        trace.raw_samples = vec![21.0, 22.0, 23.0];
        let result = fit(&mut trace, 6, 3, 200.0);
        assert!(matches!(result, Err(CoreError::AutotunePhaseFailure { .. })));
    }

    #[test]
    fn find_temp_locates_nearest_crossing_in_monotone_segment() {
        let values = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(find_temp(&values, 2.5), 3);
        assert_eq!(find_temp(&values, 0.0), 0);
        assert_eq!(find_temp(&values, 10.0), 5);
    }
}
