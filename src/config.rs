// src/config.rs
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::{CommandError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub printer: PrinterConfig,
    #[serde(default)]
    pub mcu: McuConfig,
    #[serde(default)]
    pub steppers: HashMap<String, StepperConfig>,
    #[serde(default)]
    pub extruder: Option<ExtruderConfig>,
    #[serde(default)]
    pub manual_stepper: HashMap<String, ManualStepperConfig>,
    #[serde(default)]
    pub probe: Option<ProbeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrinterConfig {
    pub kinematics: String,
    /// "XYZ" or "XYZABC".
    #[serde(default = "default_axis")]
    pub axis: String,
    pub max_velocity: f64,
    pub max_accel: f64,
    pub max_accel_to_decel: Option<f64>,
    #[serde(default = "default_square_corner_velocity")]
    pub square_corner_velocity: f64,
    pub max_z_velocity: Option<f64>,
    pub max_z_accel: Option<f64>,
    #[serde(default = "default_buffer_time_low")]
    pub buffer_time_low: f64,
    #[serde(default = "default_buffer_time_high")]
    pub buffer_time_high: f64,
    #[serde(default = "default_buffer_time_start")]
    pub buffer_time_start: f64,
    #[serde(default = "default_move_flush_time")]
    pub move_flush_time: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McuConfig {
    /// Serial device; absent means the in-process virtual MCU.
    pub serial: Option<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_mcu_freq")]
    pub frequency: f64,
}

impl Default for McuConfig {
    fn default() -> Self {
        Self {
            serial: None,
            baud: default_baud(),
            frequency: default_mcu_freq(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepperConfig {
    pub step_pin: String,
    pub dir_pin: String,
    #[serde(default)]
    pub enable_pin: Option<String>,
    pub rotation_distance: f64,
    pub microsteps: u32,
    #[serde(default = "default_full_steps")]
    pub full_steps_per_rotation: u32,
    #[serde(default)]
    pub gear_ratio: Option<(f64, f64)>,
    #[serde(default)]
    pub endstop_pin: Option<String>,
    #[serde(default)]
    pub position_min: f64,
    pub position_max: Option<f64>,
    pub position_endstop: Option<f64>,
    #[serde(default = "default_homing_speed")]
    pub homing_speed: f64,
    pub second_homing_speed: Option<f64>,
    pub homing_retract_speed: Option<f64>,
    #[serde(default = "default_homing_retract_dist")]
    pub homing_retract_dist: f64,
    pub homing_positive_dir: Option<bool>,
    #[serde(default = "default_step_pulse_duration")]
    pub step_pulse_duration: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtruderConfig {
    pub step_pin: String,
    pub dir_pin: String,
    #[serde(default)]
    pub enable_pin: Option<String>,
    pub rotation_distance: f64,
    pub microsteps: u32,
    #[serde(default = "default_full_steps")]
    pub full_steps_per_rotation: u32,
    #[serde(default)]
    pub gear_ratio: Option<(f64, f64)>,
    pub nozzle_diameter: f64,
    pub filament_diameter: f64,
    #[serde(default)]
    pub max_extrude_cross_section: Option<f64>,
    #[serde(default)]
    pub max_extrude_only_velocity: Option<f64>,
    #[serde(default)]
    pub max_extrude_only_accel: Option<f64>,
    #[serde(default = "default_max_extrude_only_distance")]
    pub max_extrude_only_distance: f64,
    #[serde(default = "default_instant_corner_velocity")]
    pub instantaneous_corner_velocity: f64,
    #[serde(default)]
    pub pressure_advance: f64,
    #[serde(default = "default_pa_smooth_time")]
    pub pressure_advance_smooth_time: f64,
    /// Optional endstop makes the extruder home-able (HOME_EXTRUDER).
    #[serde(default)]
    pub endstop_pin: Option<String>,
    #[serde(default)]
    pub position_endstop: Option<f64>,
    #[serde(default = "default_homing_speed")]
    pub homing_speed: f64,
    pub second_homing_speed: Option<f64>,
    pub homing_retract_speed: Option<f64>,
    #[serde(default)]
    pub homing_retract_dist: f64,
    #[serde(default = "default_step_pulse_duration")]
    pub step_pulse_duration: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManualStepperConfig {
    pub step_pin: String,
    pub dir_pin: String,
    #[serde(default)]
    pub enable_pin: Option<String>,
    pub rotation_distance: f64,
    pub microsteps: u32,
    #[serde(default = "default_full_steps")]
    pub full_steps_per_rotation: u32,
    #[serde(default)]
    pub gear_ratio: Option<(f64, f64)>,
    #[serde(default)]
    pub endstop_pin: Option<String>,
    #[serde(default)]
    pub position_endstop: Option<f64>,
    #[serde(default = "default_manual_velocity")]
    pub velocity: f64,
    #[serde(default)]
    pub accel: f64,
    #[serde(default = "default_step_pulse_duration")]
    pub step_pulse_duration: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    pub pin: String,
    #[serde(default = "default_probe_speed")]
    pub speed: f64,
    #[serde(default = "default_recovery_time")]
    pub recovery_time: f64,
}

fn default_axis() -> String {
    "XYZ".to_string()
}
fn default_square_corner_velocity() -> f64 {
    5.0
}
fn default_buffer_time_low() -> f64 {
    1.0
}
fn default_buffer_time_high() -> f64 {
    2.0
}
fn default_buffer_time_start() -> f64 {
    0.250
}
fn default_move_flush_time() -> f64 {
    0.050
}
fn default_baud() -> u32 {
    250_000
}
fn default_mcu_freq() -> f64 {
    16_000_000.0
}
fn default_full_steps() -> u32 {
    200
}
fn default_homing_speed() -> f64 {
    5.0
}
fn default_homing_retract_dist() -> f64 {
    5.0
}
fn default_max_extrude_only_distance() -> f64 {
    50.0
}
fn default_instant_corner_velocity() -> f64 {
    1.0
}
fn default_pa_smooth_time() -> f64 {
    0.040
}
fn default_manual_velocity() -> f64 {
    5.0
}
fn default_probe_speed() -> f64 {
    5.0
}
fn default_recovery_time() -> f64 {
    0.4
}
fn default_step_pulse_duration() -> f64 {
    0.000_002
}

pub fn load_config(path: &str) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| CommandError::config(format!("unable to read config {path}: {e}")))?;
    parse_config(&contents)
}

pub fn parse_config(text: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(text).map_err(|e| CommandError::config(format!("invalid config: {e}")))?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let printer = &config.printer;
    if printer.kinematics != "cartesian" {
        return Err(CommandError::config(format!(
            "unsupported kinematics '{}'",
            printer.kinematics
        )));
    }
    match printer.axis.as_str() {
        "XYZ" | "XYZABC" => {}
        other => {
            return Err(CommandError::config(format!(
                "unsupported axis set '{other}' (expected XYZ or XYZABC)"
            )))
        }
    }
    if printer.max_velocity <= 0.0 || printer.max_accel <= 0.0 {
        return Err(CommandError::config(
            "max_velocity and max_accel must be above zero",
        ));
    }
    if printer.buffer_time_high <= printer.buffer_time_low {
        return Err(CommandError::config(
            "buffer_time_high must be above buffer_time_low",
        ));
    }
    for axis in printer.axis.to_lowercase().chars() {
        if !config.steppers.contains_key(&axis.to_string()) {
            return Err(CommandError::config(format!(
                "missing [steppers.{axis}] section for configured axis"
            )));
        }
    }
    for (name, stepper) in &config.steppers {
        if stepper.full_steps_per_rotation % 4 != 0 {
            return Err(CommandError::config(format!(
                "full_steps_per_rotation invalid in [steppers.{name}]"
            )));
        }
        if stepper.rotation_distance <= 0.0 {
            return Err(CommandError::config(format!(
                "rotation_distance must be above zero in [steppers.{name}]"
            )));
        }
    }
    Ok(())
}

/// Gearing multiplier applied to steps per rotation.
pub fn gear_ratio_factor(gear_ratio: &Option<(f64, f64)>) -> f64 {
    match gear_ratio {
        Some((g1, g2)) if *g2 != 0.0 => g1 / g2,
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[printer]
kinematics = "cartesian"
max_velocity = 300.0
max_accel = 3000.0

[steppers.x]
step_pin = "PA0"
dir_pin = "PA1"
rotation_distance = 40.0
microsteps = 16
endstop_pin = "PB0"
position_max = 200.0
position_endstop = 0.0

[steppers.y]
step_pin = "PA2"
dir_pin = "PA3"
rotation_distance = 40.0
microsteps = 16
endstop_pin = "PB1"
position_max = 200.0
position_endstop = 0.0

[steppers.z]
step_pin = "PA4"
dir_pin = "PA5"
rotation_distance = 8.0
microsteps = 16
endstop_pin = "PB2"
position_max = 180.0
position_endstop = 0.0
"#;

    #[test]
    fn loads_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(SAMPLE.as_bytes()).expect("write");
        let config = load_config(file.path().to_str().expect("path")).expect("load");
        assert_eq!(config.printer.axis, "XYZ");
        assert_eq!(config.printer.square_corner_velocity, 5.0);
        assert_eq!(config.steppers["x"].full_steps_per_rotation, 200);
        assert!(config.extruder.is_none());
    }

    #[test]
    fn rejects_missing_axis_section() {
        let mut config: Config = toml::from_str(SAMPLE).expect("parse");
        config.steppers.remove("z");
        let err = validate(&config).expect_err("must fail");
        assert!(err.to_string().contains("steppers.z"));
    }

    #[test]
    fn rejects_bad_full_steps() {
        let mut config: Config = toml::from_str(SAMPLE).expect("parse");
        config
            .steppers
            .get_mut("x")
            .expect("x stepper")
            .full_steps_per_rotation = 123;
        assert!(validate(&config).is_err());
    }
}
