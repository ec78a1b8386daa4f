// src/kinematics/cartesian.rs
//
// Cartesian kinematics for one three-axis group. The XYZ group and the ABC
// group run the same code; only the offset into the toolhead coordinate
// vector differs. Each rail maps one axis directly onto its steppers.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::error::{CommandError, Result};
use crate::events::EventBus;
use crate::itersolve::CartesianSolver;
use crate::mcu::Mcu;
use crate::motion::Move;
use crate::rail::{Rail, RailParams};
use crate::stepper::Stepper;
use crate::trapq::Trapq;

pub struct CartKinematics {
    axis_names: String,
    group_offset: usize,
    rails: Vec<Rail>,
    trapq: Arc<Mutex<Trapq>>,
    /// Per-rail motion limits; `(1, -1)` means not homed.
    limits: Vec<(f64, f64)>,
    max_z_velocity: f64,
    max_z_accel: f64,
}

impl CartKinematics {
    pub fn new(
        axis_names: &str,
        group_offset: usize,
        config: &Config,
        mcu: Arc<Mcu>,
        events: EventBus,
    ) -> Result<Self> {
        let trapq = Arc::new(Mutex::new(Trapq::new()));
        let mut rails = Vec::new();
        for (axis_in_group, letter) in axis_names.to_lowercase().chars().enumerate() {
            let key = letter.to_string();
            let cfg = config.steppers.get(&key).ok_or_else(|| {
                CommandError::config(format!("missing [steppers.{key}] section"))
            })?;
            let params = RailParams::from_stepper_config(&format!("stepper_{letter}"), cfg);
            let mut rail = Rail::new(
                params,
                Box::new(CartesianSolver::new(axis_in_group)),
                group_offset,
                mcu.clone(),
                events.clone(),
            )?;
            // Follower sections (e.g. [steppers.x1]) join the same rail and
            // endstop group.
            for i in 1..99 {
                let follower_key = format!("{letter}{i}");
                let Some(extra) = config.steppers.get(&follower_key) else {
                    break;
                };
                let extra_params =
                    RailParams::from_stepper_config(&format!("stepper_{follower_key}"), extra);
                rail.add_extra_stepper(
                    extra_params.stepper,
                    Box::new(CartesianSolver::new(axis_in_group)),
                    group_offset,
                    extra.endstop_pin.as_deref(),
                    mcu.clone(),
                    events.clone(),
                );
            }
            rail.set_trapq(Some(trapq.clone()));
            rails.push(rail);
        }

        let max_velocity = config.printer.max_velocity;
        let max_accel = config.printer.max_accel;
        let limits = vec![(1.0, -1.0); rails.len()];
        Ok(Self {
            axis_names: axis_names.to_string(),
            group_offset,
            rails,
            trapq,
            limits,
            max_z_velocity: config.printer.max_z_velocity.unwrap_or(max_velocity),
            max_z_accel: config.printer.max_z_accel.unwrap_or(max_accel),
        })
    }

    pub fn axis_names(&self) -> &str {
        &self.axis_names
    }

    pub fn group_offset(&self) -> usize {
        self.group_offset
    }

    /// Global axis ids covered by this group.
    pub fn axes(&self) -> std::ops::Range<usize> {
        self.group_offset..self.group_offset + self.rails.len()
    }

    pub fn rails(&self) -> &[Rail] {
        &self.rails
    }

    pub fn rail(&self, idx: usize) -> &Rail {
        &self.rails[idx]
    }

    pub fn trapq(&self) -> Arc<Mutex<Trapq>> {
        self.trapq.clone()
    }

    pub fn get_steppers(&self) -> Vec<Arc<Mutex<Stepper>>> {
        self.rails.iter().flat_map(|r| r.get_steppers()).collect()
    }

    /// Inverse map: per-stepper positions to this group's cartesian coords.
    pub fn calc_position(&self, stepper_positions: &HashMap<String, f64>) -> Vec<f64> {
        self.rails
            .iter()
            .map(|rail| stepper_positions.get(rail.name()).copied().unwrap_or(0.0))
            .collect()
    }

    pub fn set_position(&mut self, newpos: &[f64], homing_axes: &[usize]) {
        let go = self.group_offset;
        let local = [newpos[go], newpos[go + 1], newpos[go + 2]];
        for (i, rail) in self.rails.iter().enumerate() {
            rail.set_position(local);
            if homing_axes.contains(&(go + i)) {
                self.limits[i] = rail.get_range();
            }
        }
    }

    pub fn note_z_not_homed(&mut self) {
        if self.group_offset == 0 {
            self.limits[2] = (1.0, -1.0);
        } else {
            // The ABC group has no safe-Z notion; nothing to invalidate.
            tracing::debug!("note_z_not_homed ignored on {} group", self.axis_names);
        }
    }

    pub fn clear_homed(&mut self) {
        for limit in &mut self.limits {
            *limit = (1.0, -1.0);
        }
    }

    fn check_endstops(&self, m: &Move) -> Result<()> {
        for (i, _rail) in self.rails.iter().enumerate() {
            let axis = self.group_offset + i;
            let pos = m.end_pos[axis];
            if m.axes_d[axis] != 0.0 && (pos < self.limits[i].0 || pos > self.limits[i].1) {
                if self.limits[i].0 > self.limits[i].1 {
                    let letter = self.axis_names.chars().nth(i).unwrap_or('?');
                    return Err(CommandError::MustHomeFirst(letter.to_string()));
                }
                return Err(CommandError::MoveOutOfRange(m.format_end_pos()));
            }
        }
        Ok(())
    }

    /// Validate the move against soft limits; clamp speed on Z motion.
    pub fn check_move(&self, m: &mut Move) -> Result<()> {
        let go = self.group_offset;
        let mut outside = false;
        for i in 0..self.rails.len() {
            let pos = m.end_pos[go + i];
            if pos < self.limits[i].0 || pos > self.limits[i].1 {
                outside = true;
            }
        }
        if outside {
            self.check_endstops(m)?;
        }
        if self.group_offset == 0 && m.axes_d[2] != 0.0 {
            // Moves with Z are paced to the slower Z axis.
            let z_ratio = m.move_d / m.axes_d[2].abs();
            m.limit_speed(self.max_z_velocity * z_ratio, self.max_z_accel * z_ratio);
        }
        Ok(())
    }

    /// Letters of the currently homed axes, for status reporting.
    pub fn homed_axes(&self) -> String {
        self.axis_names
            .chars()
            .zip(self.limits.iter())
            .filter(|(_, (lo, hi))| lo <= hi)
            .map(|(c, _)| c)
            .collect()
    }
}
