// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-photoacoustic project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! On-disk and wire configuration for a tuned hotend (spec.md §6).
//!
//! [`Config`] is the human-editable YAML form; [`Config::to_flat_map`] and
//! [`Config::from_flat_map`] convert to and from the flat
//! `string -> ConfigValue` shape a host's config-save facility actually
//! exchanges.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::ModelParams;

fn default_metal_cells() -> i64 {
    6
}
fn default_passes_per_sec() -> i64 {
    3
}
fn default_initial_temp() -> f64 {
    21.4
}
fn default_env_temp() -> f64 {
    21.4
}
fn default_offset() -> f64 {
    0.0
}

/// A single configuration value as exchanged over the flat map interface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Float(f64),
    Int(i64),
}

impl ConfigValue {
    fn as_f64(&self) -> f64 {
        match *self {
            ConfigValue::Float(v) => v,
            ConfigValue::Int(v) => v as f64,
        }
    }

    fn as_i64(&self) -> i64 {
        match *self {
            ConfigValue::Float(v) => v.round() as i64,
            ConfigValue::Int(v) => v,
        }
    }
}

/// Human-editable configuration, matching spec.md §6's key table one field
/// at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub model_heater_power: f64,
    #[serde(default = "default_metal_cells")]
    pub model_metal_cells: i64,
    #[serde(default = "default_passes_per_sec")]
    pub model_passes_per_sec: i64,
    pub model_thermal_conductivity: f64,
    pub model_base_cooling: f64,
    /// Defaults to `model_base_cooling` at construction time if absent from
    /// the source file; `#[serde(default)]` alone can't see sibling fields,
    /// so [`Config::from_file`]/[`Config::from_flat_map`] backfill it.
    #[serde(default = "default_offset")]
    pub model_fan_cooling: f64,
    #[serde(default = "default_initial_temp")]
    pub model_initial_temp: f64,
    #[serde(default = "default_env_temp")]
    pub model_env_temp: f64,
    #[serde(default = "default_offset")]
    pub model_steadystate_offset_base: f64,
    #[serde(default = "default_offset")]
    pub model_steadystate_offset_fans: f64,
}

/// Mirrors [`Config`] but leaves `model_fan_cooling` as `Option<f64>` so
/// [`Config::from_file`] can tell "absent from the file" apart from "present
/// and zero" and backfill it to `model_base_cooling`, matching
/// [`Config::from_flat_map`].
#[derive(Debug, Deserialize)]
struct RawConfig {
    model_heater_power: f64,
    #[serde(default = "default_metal_cells")]
    model_metal_cells: i64,
    #[serde(default = "default_passes_per_sec")]
    model_passes_per_sec: i64,
    model_thermal_conductivity: f64,
    model_base_cooling: f64,
    model_fan_cooling: Option<f64>,
    #[serde(default = "default_initial_temp")]
    model_initial_temp: f64,
    #[serde(default = "default_env_temp")]
    model_env_temp: f64,
    #[serde(default = "default_offset")]
    model_steadystate_offset_base: f64,
    #[serde(default = "default_offset")]
    model_steadystate_offset_fans: f64,
}

impl From<RawConfig> for Config {
    fn from(raw: RawConfig) -> Self {
        Config {
            model_heater_power: raw.model_heater_power,
            model_metal_cells: raw.model_metal_cells,
            model_passes_per_sec: raw.model_passes_per_sec,
            model_thermal_conductivity: raw.model_thermal_conductivity,
            model_base_cooling: raw.model_base_cooling,
            model_fan_cooling: raw.model_fan_cooling.unwrap_or(raw.model_base_cooling),
            model_initial_temp: raw.model_initial_temp,
            model_env_temp: raw.model_env_temp,
            model_steadystate_offset_base: raw.model_steadystate_offset_base,
            model_steadystate_offset_fans: raw.model_steadystate_offset_fans,
        }
    }
}

impl Config {
    /// Validate every bound in spec.md §6's table, reporting the first
    /// violation found.
    pub fn validate(&self) -> Result<(), CoreError> {
        let reject = |key: &str, value: String, reason: &str| CoreError::ConfigRejected {
            key: key.to_string(),
            value,
            reason: reason.to_string(),
        };
        if self.model_heater_power <= 0.0 {
            return Err(reject(
                "model_heater_power",
                self.model_heater_power.to_string(),
                "must be > 0",
            ));
        }
        if self.model_metal_cells < 2 {
            return Err(reject(
                "model_metal_cells",
                self.model_metal_cells.to_string(),
                "must be >= 2",
            ));
        }
        if self.model_passes_per_sec < 1 {
            return Err(reject(
                "model_passes_per_sec",
                self.model_passes_per_sec.to_string(),
                "must be >= 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.model_thermal_conductivity) {
            return Err(reject(
                "model_thermal_conductivity",
                self.model_thermal_conductivity.to_string(),
                "must be in [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.model_base_cooling) {
            return Err(reject(
                "model_base_cooling",
                self.model_base_cooling.to_string(),
                "must be in [0, 1]",
            ));
        }
        let fan_bound = 1.0 - self.model_base_cooling;
        if self.model_fan_cooling < 0.0 || self.model_fan_cooling > fan_bound {
            return Err(reject(
                "model_fan_cooling",
                self.model_fan_cooling.to_string(),
                &format!("must be in [0, {fan_bound}]"),
            ));
        }
        if self.model_initial_temp < 0.0 {
            return Err(reject(
                "model_initial_temp",
                self.model_initial_temp.to_string(),
                "must be >= 0",
            ));
        }
        if self.model_env_temp < 0.0 {
            return Err(reject("model_env_temp", self.model_env_temp.to_string(), "must be >= 0"));
        }
        Ok(())
    }

    /// The model parameters this configuration describes, independent of
    /// the steady-state offsets the controller also needs.
    pub fn model_params(&self) -> ModelParams {
        ModelParams {
            heater_power: self.model_heater_power,
            thermal_conductivity: self.model_thermal_conductivity,
            base_cooling: self.model_base_cooling,
            fan_cooling: self.model_fan_cooling,
            metal_cells: self.model_metal_cells as usize,
            passes_per_sec: self.model_passes_per_sec as u32,
        }
    }

    /// Load and validate a YAML configuration file. A missing
    /// `model_fan_cooling` key backfills to `model_base_cooling`, matching
    /// [`Config::from_flat_map`] rather than defaulting to zero.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).with_context(|| format!("failed to read config at {path:?}"))?;
        let raw: RawConfig =
            serde_yml::from_str(&contents).with_context(|| format!("failed to parse config at {path:?}"))?;
        let config: Config = raw.into();
        config.validate().with_context(|| format!("config at {path:?} failed validation"))?;
        Ok(config)
    }

    /// Serialize as YAML.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yml::to_string(self).context("failed to serialize config")?;
        fs::write(path.as_ref(), yaml).with_context(|| format!("failed to write config at {:?}", path.as_ref()))
    }

    /// The flat `string -> ConfigValue` shape a host's config-save facility
    /// exchanges (spec.md §6).
    pub fn to_flat_map(&self) -> HashMap<String, ConfigValue> {
        let mut map = HashMap::with_capacity(10);
        map.insert("model_heater_power".to_string(), ConfigValue::Float(self.model_heater_power));
        map.insert("model_metal_cells".to_string(), ConfigValue::Int(self.model_metal_cells));
        map.insert(
            "model_passes_per_sec".to_string(),
            ConfigValue::Int(self.model_passes_per_sec),
        );
        map.insert(
            "model_thermal_conductivity".to_string(),
            ConfigValue::Float(self.model_thermal_conductivity),
        );
        map.insert("model_base_cooling".to_string(), ConfigValue::Float(self.model_base_cooling));
        map.insert("model_fan_cooling".to_string(), ConfigValue::Float(self.model_fan_cooling));
        map.insert("model_initial_temp".to_string(), ConfigValue::Float(self.model_initial_temp));
        map.insert("model_env_temp".to_string(), ConfigValue::Float(self.model_env_temp));
        map.insert(
            "model_steadystate_offset_base".to_string(),
            ConfigValue::Float(self.model_steadystate_offset_base),
        );
        map.insert(
            "model_steadystate_offset_fans".to_string(),
            ConfigValue::Float(self.model_steadystate_offset_fans),
        );
        map
    }

    /// Build a `Config` from the flat map, applying the same defaults
    /// `#[serde(default = ...)]` applies on YAML load.
    pub fn from_flat_map(map: &HashMap<String, ConfigValue>) -> Result<Self, CoreError> {
        let get_f64 = |key: &str| map.get(key).map(ConfigValue::as_f64);
        let get_i64 = |key: &str, default: i64| map.get(key).map(ConfigValue::as_i64).unwrap_or(default);

        let missing = |key: &str| CoreError::ConfigRejected {
            key: key.to_string(),
            value: "<missing>".to_string(),
            reason: "required key absent from flat map".to_string(),
        };

        let base_cooling = get_f64("model_base_cooling").ok_or_else(|| missing("model_base_cooling"))?;
        let config = Config {
            model_heater_power: get_f64("model_heater_power").ok_or_else(|| missing("model_heater_power"))?,
            model_metal_cells: get_i64("model_metal_cells", default_metal_cells()),
            model_passes_per_sec: get_i64("model_passes_per_sec", default_passes_per_sec()),
            model_thermal_conductivity: get_f64("model_thermal_conductivity")
                .ok_or_else(|| missing("model_thermal_conductivity"))?,
            model_base_cooling: base_cooling,
            model_fan_cooling: get_f64("model_fan_cooling").unwrap_or(base_cooling),
            model_initial_temp: get_f64("model_initial_temp").unwrap_or_else(default_initial_temp),
            model_env_temp: get_f64("model_env_temp").unwrap_or_else(default_env_temp),
            model_steadystate_offset_base: get_f64("model_steadystate_offset_base").unwrap_or_else(default_offset),
            model_steadystate_offset_fans: get_f64("model_steadystate_offset_fans").unwrap_or_else(default_offset),
        };
        config.validate()?;
        Ok(config)
    }
}
