// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-photoacoustic project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! End-to-end scenarios from spec.md §8, run against the public API rather
//! than any single module's internals.

use hotend_mpc::autotune;
use hotend_mpc::bisect::{bin_search_float, DEFAULT_EPS};
use hotend_mpc::controller::Controller;
use hotend_mpc::hardware::{FanControl, FanStatus, HeaterActuator};
use hotend_mpc::model::{Model, ModelParams};
use hotend_mpc::trace::{Phase, Recorder};

struct FakeHeater {
    max_power: f64,
}
impl HeaterActuator for FakeHeater {
    fn set_pwm(&mut self, _time: f64, _value: f64) {}
    fn get_max_power(&self) -> f64 {
        self.max_power
    }
    fn get_pwm_delay(&self) -> f64 {
        0.0
    }
    fn alter_target(&mut self, _temp: f64) {}
}

struct FixedFan(f64);
impl FanStatus for FixedFan {
    fn get_status(&self) -> f64 {
        self.0
    }
}
impl FanControl for FixedFan {
    fn set_power(&mut self, _power: f64) {}
}

fn reference_params() -> ModelParams {
    ModelParams {
        heater_power: 2.0,
        thermal_conductivity: 0.05,
        base_cooling: 0.004,
        fan_cooling: 0.01,
        metal_cells: 6,
        passes_per_sec: 3,
    }
}

/// spec.md §8 scenario 3: a controller driven against a physically
/// consistent plant (a second `Model` instance with the same parameters,
/// fed the controller's own PWM decisions) should settle near the setpoint.
#[test]
fn equilibrium_settles_near_target() {
    let params = reference_params();
    let env_temp = 21.0;
    let target = 200.0;
    let dt = 0.833;

    let mut plant = Model::new(params, env_temp, env_temp);
    let mut controller = Controller::new(Model::new(params, env_temp, env_temp), FakeHeater { max_power: 1.0 }, FixedFan(0.0));

    let mut sensor = env_temp;
    let mut time = 0.0;
    for _ in 0..1000 {
        let pwm = controller.temperature_update(time, sensor, target);
        sensor = plant.advance(dt, pwm, sensor, 0.0);
        time += dt;
    }

    assert!((sensor - target).abs() < 5.0, "final sensor temperature {sensor}");
}

/// spec.md §8 scenario 1: with no heat input and every cell already at
/// ambient, nothing should happen.
#[test]
fn zero_input_scenario_holds_steady() {
    let params = ModelParams {
        heater_power: 2.0,
        thermal_conductivity: 0.05,
        base_cooling: 0.004,
        fan_cooling: 0.01,
        metal_cells: 6,
        passes_per_sec: 3,
    };
    let mut model = Model::new(params, 21.0, 21.0);
    for _ in 0..100 {
        model.advance(1.0, 0.0, 21.0, 0.0);
    }
    for &cell in model.cells() {
        assert!((cell - 21.0).abs() < 1e-9, "cell drifted to {cell}");
    }
}

/// spec.md §8 scenario 2: with no losses, the mean metal temperature rises
/// linearly at `heater_power / metal_cells`.
#[test]
fn pure_heating_scenario_matches_expected_slope() {
    let params = ModelParams {
        heater_power: 1.0,
        thermal_conductivity: 1.0,
        base_cooling: 0.0,
        fan_cooling: 0.0,
        metal_cells: 6,
        passes_per_sec: 3,
    };
    let mut model = Model::new(params, 21.0, 21.0);
    let start = model.avg_metal_temp();
    let mut sensor = model.sensor_temp();
    for _ in 0..60 {
        sensor = model.advance(1.0, 1.0, sensor, 0.0);
    }
    let _ = sensor;
    let expected = 60.0 * params.heater_power / params.metal_cells as f64;
    let actual = model.avg_metal_temp() - start;
    assert!((actual - expected).abs() / expected < 0.1, "actual={actual} expected={expected}");
}

/// A noisy sensor shouldn't be able to destabilise the model: the capped
/// correction in `Model::advance` must keep every cell inside a physically
/// plausible band even under persistent, randomized measurement noise.
#[test]
fn noisy_sensor_never_destabilises_the_model() {
    use rand::Rng;

    let params = reference_params();
    let mut model = Model::new(params, 21.0, 21.0);
    let mut rng = rand::rng();
    let mut true_temp = 21.0;

    for _ in 0..500 {
        true_temp = (true_temp + 0.05).min(220.0);
        let noisy = true_temp + rng.random_range(-1.5..1.5);
        model.advance(1.0, 0.3, noisy, 0.0);
        for &cell in model.cells() {
            assert!(cell.is_finite(), "model diverged to a non-finite temperature");
            assert!(cell < 500.0, "model cell {cell} exceeded a physically plausible bound");
        }
    }
}

/// spec.md §8 scenario 4: `bin_search_float(0, 1)` against `x - 0.3141593`
/// converges to within the default tolerance.
#[test]
fn bisection_converges_on_a_known_root() {
    let target = 0.3141593;
    let result = bin_search_float(0.0, 1.0, DEFAULT_EPS, |x| target - x).unwrap();
    assert!((result - target).abs() <= DEFAULT_EPS, "result={result}");
}

struct RecordingFan {
    power: f64,
}
impl FanStatus for RecordingFan {
    fn get_status(&self) -> f64 {
        self.power
    }
}
impl FanControl for RecordingFan {
    fn set_power(&mut self, power: f64) {
        self.power = power;
    }
}

struct RecordingHeater {
    max_power: f64,
}
impl HeaterActuator for RecordingHeater {
    fn set_pwm(&mut self, _time: f64, _value: f64) {}
    fn get_max_power(&self) -> f64 {
        self.max_power
    }
    fn get_pwm_delay(&self) -> f64 {
        0.0
    }
    fn alter_target(&mut self, _temp: f64) {}
}

/// Drive a [`Recorder`] against a known model by pure open-loop replay,
/// mirroring how `record` would produce a trace from a real hotend.
fn record_trace(params: ModelParams, calibrate_temp: f64) -> hotend_mpc::trace::Trace {
    let env_temp = 21.0;
    let mut model = Model::new(params, env_temp, env_temp);
    let mut rec = Recorder::new(RecordingHeater { max_power: 1.0 }, RecordingFan { power: 0.0 }, calibrate_temp);
    let dt = 1.0;
    let mut time = 0.0;
    let mut ticks = 0;
    while rec.check_busy() && ticks < 20_000 {
        let pwm = match rec.phase() {
            Phase::Heatup | Phase::HeatupFan => 1.0,
            _ => 0.0,
        };
        let fan_power = match rec.phase() {
            Phase::HeatupFan | Phase::OvershootFan | Phase::CooldownFan => 1.0,
            _ => 0.0,
        };
        model.step_without_correction(dt, pwm, fan_power);
        rec.temperature_update(time, model.sensor_temp());
        time += dt;
        ticks += 1;
    }
    rec.into_trace()
}

/// spec.md §8 scenario 5: fit a synthetic trace generated by a known model
/// and recover its parameters within tolerance.
#[test]
fn autotune_recovers_known_parameters_from_a_recorded_trace() {
    let truth = reference_params();
    let mut trace = record_trace(truth, 200.0);
    let fitted = autotune::fit(&mut trace, truth.metal_cells, truth.passes_per_sec, 200.0).unwrap();

    let rel = |a: f64, b: f64| (a - b).abs() / b;
    assert!(rel(fitted.heater_power, truth.heater_power) < 0.3);
    assert!(rel(fitted.thermal_conductivity, truth.thermal_conductivity) < 0.3);
    assert!(rel(fitted.base_cooling, truth.base_cooling) < 0.3);
    assert!(rel(fitted.fan_cooling, truth.fan_cooling) < 0.5);
}

/// spec.md §8 scenario 6: a monotonically increasing temperature transitions
/// `heatup -> overshoot` at the first sample `>= target`; a subsequent
/// decrease then transitions `overshoot -> cooldown` at the first sample
/// strictly below the previous one.
#[test]
fn phase_state_machine_transitions_at_documented_thresholds() {
    let mut rec = Recorder::new(RecordingHeater { max_power: 1.0 }, RecordingFan { power: 0.0 }, 200.0);
    let mut time = 0.0;
    let mut temp = 21.0;
    while temp < 200.0 {
        rec.temperature_update(time, temp);
        assert_eq!(rec.phase(), Phase::Heatup, "must stay in heatup until target is reached");
        temp += 10.0;
        time += 1.0;
    }
    rec.temperature_update(time, temp);
    assert_eq!(rec.phase(), Phase::Overshoot, "first sample >= target must enter overshoot");
    time += 1.0;

    let peak = temp;
    rec.temperature_update(time, peak);
    assert_eq!(rec.phase(), Phase::Overshoot, "an equal reading must not transition yet");
    time += 1.0;

    rec.temperature_update(time, peak - 0.1);
    assert_eq!(rec.phase(), Phase::Cooldown, "first strictly decreasing sample must enter cooldown");
}
