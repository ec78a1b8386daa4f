// src/kinematics/extruder.rs
//
// The extruder is its own single-axis kinematic: it shares each move's
// trapezoid shape, scaled by the extruder's ratio of the move, and owns a
// separate trapq so extruder steps stay in sync with head motion purely
// through the shared print clock.
use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::ExtruderConfig;
use crate::error::{CommandError, Result};
use crate::events::EventBus;
use crate::guard;
use crate::itersolve::ExtruderSolver;
use crate::mcu::Mcu;
use crate::motion::Move;
use crate::rail::{Rail, RailParams};
use crate::stepper::{Stepper, StepperParams};
use crate::trapq::Trapq;

/// External heater interface: the only fact the motion core needs.
#[derive(Clone, Default)]
pub struct HeaterHandle {
    cold: Arc<AtomicBool>,
}

impl HeaterHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_extrude(&self) -> bool {
        !self.cold.load(Ordering::Relaxed)
    }

    pub fn set_can_extrude(&self, can: bool) {
        self.cold.store(!can, Ordering::Relaxed);
    }
}

pub struct Extruder {
    name: String,
    axis_idx: usize,
    trapq: Arc<Mutex<Trapq>>,
    stepper: Arc<Mutex<Stepper>>,
    /// Present when an endstop makes this extruder home-able.
    rail: Option<Rail>,
    heater: HeaterHandle,
    nozzle_diameter: f64,
    filament_area: f64,
    max_extrude_ratio: f64,
    max_e_velocity: f64,
    max_e_accel: f64,
    max_e_dist: f64,
    instant_corner_v: f64,
    pressure_advance: f64,
    pressure_advance_smooth_time: f64,
    last_position: f64,
}

impl Extruder {
    pub fn new(
        name: &str,
        cfg: &ExtruderConfig,
        axis_idx: usize,
        max_velocity: f64,
        max_accel: f64,
        heater: HeaterHandle,
        mcu: Arc<Mcu>,
        events: EventBus,
    ) -> Result<Self> {
        let filament_area = PI * (cfg.filament_diameter * 0.5).powi(2);
        let def_max_cross_section = 4.0 * cfg.nozzle_diameter.powi(2);
        let def_max_extrude_ratio = def_max_cross_section / filament_area;
        let max_cross_section = cfg.max_extrude_cross_section.unwrap_or(def_max_cross_section);
        if max_cross_section <= 0.0 {
            return Err(CommandError::config(format!(
                "max_extrude_cross_section must be above zero in [{name}]"
            )));
        }
        let max_extrude_ratio = max_cross_section / filament_area;
        tracing::info!("extruder {name} max_extrude_ratio={max_extrude_ratio:.6}");

        let trapq = Arc::new(Mutex::new(Trapq::new()));
        let stepper_params = StepperParams {
            name: name.to_string(),
            step_pin: cfg.step_pin.clone(),
            dir_pin: cfg.dir_pin.clone(),
            rotation_distance: cfg.rotation_distance,
            microsteps: cfg.microsteps,
            full_steps_per_rotation: cfg.full_steps_per_rotation,
            gear_ratio: cfg.gear_ratio,
            step_pulse_duration: cfg.step_pulse_duration,
        };
        let solver = Box::new(ExtruderSolver {
            pressure_advance: cfg.pressure_advance,
        });

        let (stepper, rail) = if cfg.endstop_pin.is_some() {
            let params = RailParams {
                stepper: stepper_params,
                endstop_pin: cfg.endstop_pin.clone(),
                position_min: 0.0,
                position_max: None,
                position_endstop: cfg.position_endstop,
                homing_speed: cfg.homing_speed,
                second_homing_speed: cfg.second_homing_speed,
                homing_retract_speed: cfg.homing_retract_speed,
                homing_retract_dist: cfg.homing_retract_dist,
                homing_positive_dir: None,
                need_position_minmax: false,
                default_position_endstop: Some(0.0),
            };
            let rail = Rail::new(params, solver, axis_idx, mcu, events)?;
            (rail.get_steppers()[0].clone(), Some(rail))
        } else {
            let stepper = Arc::new(Mutex::new(Stepper::new(
                stepper_params,
                solver,
                axis_idx,
                mcu,
                events,
            )));
            (stepper, None)
        };
        {
            let mut s = guard(&stepper);
            s.set_trapq(Some(trapq.clone()));
            if cfg.pressure_advance > 0.0 {
                let half_smooth = cfg.pressure_advance_smooth_time * 0.5;
                s.set_scan_windows(half_smooth, half_smooth);
            }
        }
        if let Some(rail) = &rail {
            rail.set_trapq(Some(trapq.clone()));
        }

        Ok(Self {
            name: name.to_string(),
            axis_idx,
            trapq,
            stepper,
            rail,
            heater,
            nozzle_diameter: cfg.nozzle_diameter,
            filament_area,
            max_extrude_ratio,
            max_e_velocity: cfg
                .max_extrude_only_velocity
                .unwrap_or(max_velocity * def_max_extrude_ratio),
            max_e_accel: cfg
                .max_extrude_only_accel
                .unwrap_or(max_accel * def_max_extrude_ratio),
            max_e_dist: cfg.max_extrude_only_distance,
            instant_corner_v: cfg.instantaneous_corner_velocity,
            pressure_advance: cfg.pressure_advance,
            pressure_advance_smooth_time: cfg.pressure_advance_smooth_time,
            last_position: 0.0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stepper_name(&self) -> String {
        guard(&self.stepper).name().to_string()
    }

    pub fn heater(&self) -> &HeaterHandle {
        &self.heater
    }

    pub fn trapq(&self) -> Arc<Mutex<Trapq>> {
        self.trapq.clone()
    }

    pub fn stepper(&self) -> Arc<Mutex<Stepper>> {
        self.stepper.clone()
    }

    pub fn can_home(&self) -> bool {
        self.rail.is_some()
    }

    pub fn rail(&self) -> Option<&Rail> {
        self.rail.as_ref()
    }

    pub fn last_position(&self) -> f64 {
        self.last_position
    }

    pub fn pressure_advance(&self) -> (f64, f64) {
        (self.pressure_advance, self.pressure_advance_smooth_time)
    }

    /// Additional kinematic scan window this extruder needs.
    pub fn scan_time(&self) -> f64 {
        if self.pressure_advance > 0.0 {
            self.pressure_advance_smooth_time * 0.5
        } else {
            0.0
        }
    }

    /// Validate the extruder component of a move, tightening its caps for
    /// extrude-only motion.
    pub fn check_move(&self, m: &mut Move, e_axis: usize) -> Result<()> {
        let axis_r = m.axes_r[e_axis];
        if !self.heater.can_extrude() {
            return Err(CommandError::ColdExtrude);
        }
        if (m.axes_d[0] == 0.0 && m.axes_d[1] == 0.0) || axis_r < 0.0 {
            // Extrude only (or retraction): limit velocity and accel.
            if m.axes_d[e_axis].abs() > self.max_e_dist {
                return Err(CommandError::ExtrudeLimit(format!(
                    "Extrude only move too long ({:.3}mm vs {:.3}mm)\n\
                     See the 'max_extrude_only_distance' config option for details",
                    m.axes_d[e_axis], self.max_e_dist
                )));
            }
            let inv_extrude_r = 1.0 / axis_r.abs();
            m.limit_speed(
                self.max_e_velocity * inv_extrude_r,
                self.max_e_accel * inv_extrude_r,
            );
        } else if axis_r > self.max_extrude_ratio {
            if m.axes_d[e_axis] <= self.nozzle_diameter * self.max_extrude_ratio {
                // A tiny absolute amount of filament is always allowed.
                return Ok(());
            }
            let area = axis_r * self.filament_area;
            tracing::debug!(
                "overextrude: {axis_r} vs {} (area={area:.3} dist={:.3})",
                self.max_extrude_ratio,
                m.move_d
            );
            return Err(CommandError::ExtrudeLimit(format!(
                "Move exceeds maximum extrusion ({:.3}mm^2 vs {:.3}mm^2)\n\
                 See the 'max_extrude_cross_section' config option for details",
                area,
                self.max_extrude_ratio * self.filament_area
            )));
        }
        Ok(())
    }

    /// Junction bound from the instantaneous corner velocity when the
    /// extruder ratio changes across the junction.
    pub fn calc_junction(&self, prev: &Move, m: &Move) -> f64 {
        let diff_r = m.axes_r[self.axis_idx] - prev.axes_r[self.axis_idx];
        if diff_r != 0.0 {
            let v = self.instant_corner_v / diff_r.abs();
            v * v
        } else {
            m.max_cruise_v2
        }
    }

    /// Queue the extruder side of a planned move on the extruder trapq.
    pub fn queue_move(&mut self, print_time: f64, m: &Move) {
        let axis_r = m.axes_r[self.axis_idx];
        let can_pressure_advance =
            axis_r > 0.0 && (m.axes_d[0] != 0.0 || m.axes_d[1] != 0.0);
        guard(&self.trapq).append(
            print_time,
            m.accel_t,
            m.cruise_t,
            m.decel_t,
            [m.start_pos[self.axis_idx], 0.0, 0.0],
            [1.0, if can_pressure_advance { 1.0 } else { 0.0 }, 0.0],
            m.start_v * axis_r,
            m.cruise_v * axis_r,
            m.accel * axis_r,
        );
        self.last_position = m.end_pos[self.axis_idx];
    }

    /// Expire extruder trapq segments older than `flush_time`.
    pub fn update_move_time(&self, flush_time: f64) {
        guard(&self.trapq).finalize_moves(flush_time);
    }

    pub fn set_position(&mut self, newpos_e: f64, print_time: f64) {
        guard(&self.trapq).set_position(print_time, [newpos_e, 0.0, 0.0]);
        guard(&self.stepper).set_position([newpos_e, 0.0, 0.0]);
        self.last_position = newpos_e;
    }

    pub fn find_past_position(&self, print_time: f64) -> f64 {
        guard(&self.stepper).get_past_commanded_position(print_time)
    }

    /// Inverse map for homing reconstruction (single axis).
    pub fn calc_position(&self, stepper_positions: &HashMap<String, f64>) -> f64 {
        stepper_positions
            .get(guard(&self.stepper).name())
            .copied()
            .unwrap_or(self.last_position)
    }
}
