// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-photoacoustic project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Recorded heat-up/cool-down traces, and the recording state machine that
//! produces them.
//!
//! Grounded on `examples/original_source/shell_autotune.py`'s
//! `ControlAutoTune` (phase state machine, `write_file`) and `Trace`
//! (sample storage), re-architected per spec.md §3/§9 as parallel typed
//! sequences rather than a list of tuples.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::error::CoreError;
use crate::hardware::{FanControl, HeaterActuator};

/// Phases of the recording state machine, in the fixed order spec.md §4.3
/// defines them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Heatup,
    Overshoot,
    Cooldown,
    HeatupFan,
    OvershootFan,
    CooldownFan,
    Done,
}

impl Phase {
    /// Canonical name, matching the trace file's `phase <name> start:` lines.
    pub fn name(self) -> &'static str {
        match self {
            Phase::Heatup => "heatup",
            Phase::Overshoot => "overshoot",
            Phase::Cooldown => "cooldown",
            Phase::HeatupFan => "heatup_fan",
            Phase::OvershootFan => "overshoot_fan",
            Phase::CooldownFan => "cooldown_fan",
            Phase::Done => "done",
        }
    }

    /// All phases in recording order, `Done` excluded (it has no data of
    /// its own, just a terminal marker).
    pub const ORDER: [Phase; 6] = [
        Phase::Heatup,
        Phase::Overshoot,
        Phase::Cooldown,
        Phase::HeatupFan,
        Phase::OvershootFan,
        Phase::CooldownFan,
    ];

    fn from_name(name: &str) -> Option<Phase> {
        Some(match name {
            "heatup" => Phase::Heatup,
            "overshoot" => Phase::Overshoot,
            "cooldown" => Phase::Cooldown,
            "heatup_fan" => Phase::HeatupFan,
            "overshoot_fan" => Phase::OvershootFan,
            "cooldown_fan" => Phase::CooldownFan,
            "done" => Phase::Done,
            _ => return None,
        })
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A recorded heat-up/cool-down trace: parallel sequences plus phase
/// boundary indices, as spec.md §3 describes.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    pub timestamps: Vec<f64>,
    pub raw_samples: Vec<f64>,
    pub smoothed_samples: Vec<f64>,
    pub pwm_samples: Vec<(f64, f64)>,
    pub phase_start: HashMap<Phase, usize>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    fn push_sample(&mut self, time: f64, temp: f64) {
        self.timestamps.push(time);
        self.raw_samples.push(temp);
    }

    /// Record a PWM transition only if it differs from the last emitted
    /// value, timestamped `time + pwm_delay`, matching the original's
    /// `set_pwm` wrapper.
    fn push_pwm_if_changed(&mut self, time: f64, value: f64, pwm_delay: f64) {
        let changed = self.pwm_samples.last().map(|&(_, v)| v) != Some(value);
        if changed {
            self.pwm_samples.push((time + pwm_delay, value));
        }
    }

    /// Serialize to the line-oriented trace file format of spec.md §6.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut lines = Vec::with_capacity(self.pwm_samples.len() + self.timestamps.len() + self.phase_start.len());
        for &(time, value) in &self.pwm_samples {
            lines.push(format!("pwm: {time:.6} {value:.6}"));
        }
        for (&time, &temp) in self.timestamps.iter().zip(self.raw_samples.iter()) {
            lines.push(format!("{time:.6} {temp:.6}"));
        }
        let mut phases: Vec<_> = self.phase_start.iter().collect();
        phases.sort_by_key(|&(_, idx)| *idx);
        for (phase, idx) in phases {
            lines.push(format!("phase {} start: {}", phase.name(), idx));
        }
        fs::write(path.as_ref(), lines.join("\n")).with_context(|| {
            format!("failed to write trace file at {:?}", path.as_ref())
        })
    }

    /// Parse a trace file written by [`Trace::save_to_file`] (or the
    /// recorder directly). Samples are sorted by timestamp on load since
    /// the file interleaves PWM/sample/phase lines in emission order, not
    /// necessarily chronological order within each kind.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read trace file at {:?}", path))?;

        let mut trace = Trace::new();
        let mut samples: Vec<(f64, f64)> = Vec::new();

        for (line_no, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("pwm:") {
                let (time, value) = parse_two_floats(rest).ok_or_else(|| CoreError::InvalidTrace {
                    line_no,
                    content: line.to_string(),
                    reason: "expected 'pwm: <time> <value>'".to_string(),
                })?;
                trace.pwm_samples.push((time, value));
            } else if let Some(rest) = line.strip_prefix("phase ") {
                let (name, idx_str) = rest.split_once(" start:").ok_or_else(|| CoreError::InvalidTrace {
                    line_no,
                    content: line.to_string(),
                    reason: "expected 'phase <name> start: <index>'".to_string(),
                })?;
                let phase = Phase::from_name(name.trim()).ok_or_else(|| CoreError::InvalidTrace {
                    line_no,
                    content: line.to_string(),
                    reason: format!("unknown phase name {name:?}"),
                })?;
                let idx: usize = idx_str.trim().parse().map_err(|_| CoreError::InvalidTrace {
                    line_no,
                    content: line.to_string(),
                    reason: "phase index is not an integer".to_string(),
                })?;
                trace.phase_start.insert(phase, idx);
            } else {
                let (time, temp) = parse_two_floats(line).ok_or_else(|| CoreError::InvalidTrace {
                    line_no,
                    content: line.to_string(),
                    reason: "expected '<time> <temp>'".to_string(),
                })?;
                samples.push((time, temp));
            }
        }

        samples.sort_by(|a, b| a.0.total_cmp(&b.0));
        for (time, temp) in samples {
            trace.push_sample(time, temp);
        }
        trace.pwm_samples.sort_by(|a, b| a.0.total_cmp(&b.0));

        Ok(trace)
    }
}

fn parse_two_floats(s: &str) -> Option<(f64, f64)> {
    let mut parts = s.split_whitespace();
    let a: f64 = parts.next()?.parse().ok()?;
    let b: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((a, b))
}

/// Drives a heater through the scripted heat/cool sequence of spec.md §4.3,
/// recording samples as it goes. Installed as the heater's control strategy
/// for the duration of the test.
pub struct Recorder<H, F> {
    heater: H,
    fan: F,
    calibrate_temp: f64,
    cooldown_target: Option<f64>,
    env_temp: Option<f64>,
    phase: Phase,
    last_pwm: f64,
    last_temp: Option<f64>,
    trace: Trace,
}

impl<H: HeaterActuator, F: FanControl> Recorder<H, F> {
    pub fn new(heater: H, fan: F, calibrate_temp: f64) -> Self {
        let mut trace = Trace::new();
        trace.phase_start.insert(Phase::Heatup, 0);
        Self {
            heater,
            fan,
            calibrate_temp,
            cooldown_target: None,
            env_temp: None,
            phase: Phase::Heatup,
            last_pwm: -1.0,
            last_temp: None,
            trace,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn into_trace(self) -> Trace {
        self.trace
    }

    /// `true` once all six phases have completed.
    pub fn done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Abort the recording early; samples recorded so far are only valid
    /// for fitting if all six phases completed (spec.md §5).
    pub fn abort(&mut self) {
        self.phase = Phase::Done;
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.trace.phase_start.entry(phase).or_insert(self.trace.len());
    }

    fn set_pwm(&mut self, time: f64, value: f64) {
        let delay = self.heater.get_pwm_delay();
        self.trace.push_pwm_if_changed(time, value, delay);
        self.last_pwm = value;
        self.heater.set_pwm(time, value);
    }

    /// Advance the state machine by one sample. Transitions are checked in
    /// reverse phase order so that two thresholds crossed in the same tick
    /// cannot skip a phase silently.
    pub fn temperature_update(&mut self, read_time: f64, temp: f64) {
        let last_temp = self.last_temp.unwrap_or(temp);
        if self.env_temp.is_none() {
            self.env_temp = Some(temp);
        }
        let env_temp = self.env_temp.unwrap();
        let cooldown_target = *self.cooldown_target.get_or_insert(env_temp + 15.0);

        if self.phase == Phase::CooldownFan && temp < cooldown_target {
            self.heater.alter_target(0.0);
            self.fan.set_power(0.0);
            self.enter(Phase::Done);
        }
        if self.phase == Phase::OvershootFan && temp < last_temp {
            self.enter(Phase::CooldownFan);
        }
        if self.phase == Phase::HeatupFan && temp >= self.calibrate_temp {
            self.cooldown_target = Some(env_temp + 15.0);
            self.heater.alter_target(cooldown_target);
            self.enter(Phase::OvershootFan);
        }
        if self.phase == Phase::Cooldown && temp < cooldown_target {
            self.heater.alter_target(self.calibrate_temp);
            self.fan.set_power(1.0);
            self.enter(Phase::HeatupFan);
        }
        if self.phase == Phase::Overshoot && temp < last_temp {
            self.enter(Phase::Cooldown);
        }
        if self.phase == Phase::Heatup && temp >= self.calibrate_temp {
            self.heater.alter_target(cooldown_target);
            self.enter(Phase::Overshoot);
        }

        let pwm = match self.phase {
            Phase::Heatup | Phase::HeatupFan => self.heater.get_max_power(),
            _ => 0.0,
        };
        self.set_pwm(read_time, pwm);

        self.trace.push_sample(read_time, temp);
        self.last_temp = Some(temp);
    }

    /// spec.md §4.2's busy predicate convention, inverted: recording is
    /// "busy" (not yet done) until the `Done` phase is reached.
    pub fn check_busy(&self) -> bool {
        self.phase != Phase::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeHeater {
        max_power: f64,
        pwm_delay: f64,
        target: f64,
    }

    impl HeaterActuator for FakeHeater {
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

    struct FakeFan {
        power: f64,
    }

    impl FanControl for FakeFan {
        fn set_power(&mut self, power: f64) {
            self.power = power;
        }
    }
    impl crate::hardware::FanStatus for FakeFan {
        fn get_status(&self) -> f64 {
            self.power
        }
    }

    fn recorder() -> Recorder<FakeHeater, FakeFan> {
        Recorder::new(
            FakeHeater {
                max_power: 1.0,
                pwm_delay: 0.0,
                target: 0.0,
            },
            FakeFan { power: 0.0 },
            200.0,
        )
    }

    #[test]
    fn heatup_transitions_at_first_sample_at_or_above_target() {
        let mut rec = recorder();
        for t in [21.0, 50.0, 199.9] {
            rec.temperature_update(0.0, t);
            assert_eq!(rec.phase(), Phase::Heatup);
        }
        rec.temperature_update(0.0, 200.0);
        assert_eq!(rec.phase(), Phase::Overshoot);
    }

    #[test]
    fn overshoot_transitions_at_first_strictly_decreasing_sample() {
        let mut rec = recorder();
        rec.temperature_update(0.0, 200.0);
        assert_eq!(rec.phase(), Phase::Overshoot);
        rec.temperature_update(1.0, 200.0);
        assert_eq!(rec.phase(), Phase::Overshoot, "equal temp must not transition");
        rec.temperature_update(2.0, 199.9);
        assert_eq!(rec.phase(), Phase::Cooldown);
    }

    #[test]
    fn full_six_phase_cycle_reaches_done() {
        let mut rec = recorder();
        let mut time = 0.0;
        let mut temp = 21.0;
        // heatup
        while rec.phase() == Phase::Heatup {
            temp += 5.0;
            rec.temperature_update(time, temp);
            time += 1.0;
        }
        // overshoot -> cooldown
        temp -= 1.0;
        rec.temperature_update(time, temp);
        time += 1.0;
        assert_eq!(rec.phase(), Phase::Cooldown);
        // cooldown down to env+15
        while rec.phase() == Phase::Cooldown {
            temp -= 5.0;
            rec.temperature_update(time, temp);
            time += 1.0;
        }
        assert_eq!(rec.phase(), Phase::HeatupFan);
        while rec.phase() == Phase::HeatupFan {
            temp += 5.0;
            rec.temperature_update(time, temp);
            time += 1.0;
        }
        temp -= 1.0;
        rec.temperature_update(time, temp);
        time += 1.0;
        assert_eq!(rec.phase(), Phase::CooldownFan);
        while rec.phase() == Phase::CooldownFan {
            temp -= 5.0;
            rec.temperature_update(time, temp);
            time += 1.0;
        }
        assert!(rec.done());
        assert_eq!(rec.trace().phase_start.len(), 6);
    }

    #[test]
    fn trace_round_trips_through_file() {
        let mut rec = recorder();
        let mut time = 0.0;
        let mut temp = 21.0;
        for _ in 0..5 {
            temp += 10.0;
            rec.temperature_update(time, temp);
            time += 1.0;
        }
        let trace = rec.into_trace();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.txt");
        trace.save_to_file(&path).unwrap();
        let loaded = Trace::load(&path).unwrap();

        assert_eq!(loaded.timestamps, trace.timestamps);
        assert_eq!(loaded.raw_samples, trace.raw_samples);
        assert_eq!(loaded.phase_start, trace.phase_start);
    }
}
