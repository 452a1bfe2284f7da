// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-photoacoustic project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};

use hotend_mpc::autotune;
use hotend_mpc::config::Config;
use hotend_mpc::controller::{check_busy, Controller};
use hotend_mpc::hardware::{FanControl, FanStatus, HeaterActuator};
use hotend_mpc::model::{Model, ModelParams};
use hotend_mpc::trace::{Phase, Recorder, Trace};

/// Reference hotend used by `record`/`simulate` when no `--config` is given,
/// grounded in the original implementation's simulator constants.
fn reference_params() -> ModelParams {
    ModelParams {
        heater_power: 2.0166,
        thermal_conductivity: 0.05,
        base_cooling: 0.004345,
        fan_cooling: 0.02,
        metal_cells: 6,
        passes_per_sec: 3,
    }
}

/// Model-based thermal controller and offline autotuner for a hotend.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive the scripted heat/cool state machine against a synthetic plant
    /// and write the resulting trace file.
    Record {
        /// Calibrate (test setpoint) temperature, in °C.
        #[arg(long, default_value_t = 200.0)]
        target: f64,
        /// Path to an optional YAML config describing the plant to simulate.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Where to write the trace file.
        #[arg(long, default_value = "trace.txt")]
        output: PathBuf,
    },
    /// Fit model parameters from a recorded trace and emit a config.
    Fit {
        /// Path to a trace file written by `record`.
        trace_file: PathBuf,
        /// Calibrate temperature the trace was recorded at.
        #[arg(long, default_value_t = 200.0)]
        target: f64,
        #[arg(long, default_value_t = 6)]
        metal_cells: usize,
        #[arg(long, default_value_t = 3)]
        passes_per_sec: u32,
        /// Write the fitted configuration here as YAML instead of printing
        /// the flat-map text form to stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run the controller closed-loop against a synthetic plant and report
    /// settle time and overshoot.
    Simulate {
        #[arg(long, default_value_t = 200.0)]
        target: f64,
        #[arg(long, default_value_t = 1000)]
        ticks: u32,
        #[arg(long, default_value_t = 0.833)]
        dt: f64,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

struct SimHeater {
    max_power: f64,
    pwm_delay: f64,
    target: f64,
}
impl HeaterActuator for SimHeater {
    fn set_pwm(&mut self, _time: f64, _value: f64) {}
    fn get_max_power(&self) -> f64 {
        self.max_power
    }
    fn get_pwm_delay(&self) -> f64 {
        self.pwm_delay
    }
    fn alter_target(&mut self, temp: f64) {
        self.target = temp;
    }
}

struct SimFan {
    power: f64,
}
impl FanControl for SimFan {
    fn set_power(&mut self, power: f64) {
        self.power = power;
    }
}
impl FanStatus for SimFan {
    fn get_status(&self) -> f64 {
        self.power
    }
}

fn load_params(config: Option<PathBuf>) -> Result<ModelParams> {
    match config {
        Some(path) => Ok(Config::from_file(&path)?.model_params()),
        None => Ok(reference_params()),
    }
}

fn cmd_record(target: f64, config: Option<PathBuf>, output: PathBuf) -> Result<()> {
    let params = load_params(config)?;
    let env_temp = 21.0;
    let mut plant = Model::new(params, env_temp, env_temp);
    let mut recorder = Recorder::new(
        SimHeater {
            max_power: 1.0,
            pwm_delay: 0.0,
            target: 0.0,
        },
        SimFan { power: 0.0 },
        target,
    );

    let dt = 1.0;
    let mut time = 0.0;
    let mut ticks = 0u64;
    while recorder.check_busy() {
        ticks += 1;
        if ticks > 200_000 {
            anyhow::bail!("recording did not reach 'done' within 200000 ticks");
        }
        let fan_power = match recorder.phase() {
            Phase::HeatupFan | Phase::OvershootFan | Phase::CooldownFan => 1.0,
            _ => 0.0,
        };
        let pwm = match recorder.phase() {
            Phase::Heatup | Phase::HeatupFan => 1.0,
            _ => 0.0,
        };
        plant.step_without_correction(dt, pwm, fan_power);
        recorder.temperature_update(time, plant.sensor_temp());
        time += dt;
    }
    info!("recording finished after {ticks} ticks, phases: {:?}", recorder.trace().phase_start);
    recorder.into_trace().save_to_file(&output)?;
    println!("wrote trace to {}", output.display());
    Ok(())
}

fn cmd_fit(trace_file: PathBuf, target: f64, metal_cells: usize, passes_per_sec: u32, output: Option<PathBuf>) -> Result<()> {
    let mut trace = Trace::load(&trace_file).with_context(|| format!("loading trace from {trace_file:?}"))?;
    let fitted = autotune::fit(&mut trace, metal_cells, passes_per_sec, target)?;
    let env_temp = trace.smoothed_samples[0];
    let offsets = autotune::solve_gradient(fitted, target, env_temp)?;

    let config = Config {
        model_heater_power: fitted.heater_power,
        model_metal_cells: fitted.metal_cells as i64,
        model_passes_per_sec: fitted.passes_per_sec as i64,
        model_thermal_conductivity: fitted.thermal_conductivity,
        model_base_cooling: fitted.base_cooling,
        model_fan_cooling: fitted.fan_cooling,
        model_initial_temp: env_temp,
        model_env_temp: env_temp,
        model_steadystate_offset_base: offsets.offset_base,
        model_steadystate_offset_fans: offsets.offset_fans,
    };

    match output {
        Some(path) => {
            config.save_to_file(&path)?;
            println!("wrote config to {}", path.display());
        }
        None => {
            for (key, value) in config.to_flat_map() {
                println!("{key}: {value:?}");
            }
        }
    }
    Ok(())
}

fn cmd_simulate(target: f64, ticks: u32, dt: f64, config: Option<PathBuf>) -> Result<()> {
    let params = load_params(config)?;
    let env_temp = 21.0;

    let mut plant = Model::new(params, env_temp, env_temp);
    let mut controller = Controller::new(
        Model::new(params, env_temp, env_temp),
        SimHeater {
            max_power: 1.0,
            pwm_delay: 0.0,
            target: 0.0,
        },
        SimFan { power: 0.0 },
    );

    let mut time = 0.0;
    let mut sensor = env_temp;
    let mut overshoot = 0.0_f64;
    let mut settle_tick = None;
    for tick in 0..ticks {
        let pwm = controller.temperature_update(time, sensor, target);
        sensor = plant.advance(dt, pwm, sensor, 0.0);
        overshoot = overshoot.max(sensor - target);
        if settle_tick.is_none() && !check_busy(sensor, target) {
            settle_tick = Some(tick);
        }
        time += dt;
    }

    println!("final temperature: {sensor:.2} C (target {target:.2} C)");
    println!("peak overshoot: {:.2} C", overshoot.max(0.0));
    match settle_tick {
        Some(tick) => println!("settled at tick {tick} ({:.1} s)", tick as f64 * dt),
        None => println!("did not settle within {ticks} ticks"),
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let result = match args.command {
        Command::Record { target, config, output } => cmd_record(target, config, output),
        Command::Fit {
            trace_file,
            target,
            metal_cells,
            passes_per_sec,
            output,
        } => cmd_fit(trace_file, target, metal_cells, passes_per_sec, output),
        Command::Simulate { target, ticks, dt, config } => cmd_simulate(target, ticks, dt, config),
    };

    if let Err(err) = &result {
        error!("{err:#}");
    }
    result
}
