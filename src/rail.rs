// src/rail.rs
//
// A rail is the unit of axis configuration: one or more steppers moving in
// lockstep, one endstop group, and the homing parameters for the axis.
use std::sync::{Arc, Mutex};

use crate::config::StepperConfig;
use crate::endstop::Endstop;
use crate::error::{CommandError, Result};
use crate::events::EventBus;
use crate::guard;
use crate::itersolve::SolverKinematics;
use crate::mcu::Mcu;
use crate::stepper::{Stepper, StepperParams};
use crate::trapq::Trapq;

#[derive(Debug, Clone, Copy)]
pub struct HomingInfo {
    pub speed: f64,
    pub position_endstop: f64,
    pub retract_speed: f64,
    pub retract_dist: f64,
    pub positive_dir: bool,
    pub second_homing_speed: f64,
}

pub struct RailParams {
    pub stepper: StepperParams,
    pub endstop_pin: Option<String>,
    pub position_min: f64,
    pub position_max: Option<f64>,
    pub position_endstop: Option<f64>,
    pub homing_speed: f64,
    pub second_homing_speed: Option<f64>,
    pub homing_retract_speed: Option<f64>,
    pub homing_retract_dist: f64,
    pub homing_positive_dir: Option<bool>,
    /// False for rails whose travel is bounded by the endstop alone
    /// (extruders, manual steppers).
    pub need_position_minmax: bool,
    pub default_position_endstop: Option<f64>,
}

impl RailParams {
    pub fn from_stepper_config(name: &str, cfg: &StepperConfig) -> Self {
        Self {
            stepper: StepperParams {
                name: name.to_string(),
                step_pin: cfg.step_pin.clone(),
                dir_pin: cfg.dir_pin.clone(),
                rotation_distance: cfg.rotation_distance,
                microsteps: cfg.microsteps,
                full_steps_per_rotation: cfg.full_steps_per_rotation,
                gear_ratio: cfg.gear_ratio,
                step_pulse_duration: cfg.step_pulse_duration,
            },
            endstop_pin: cfg.endstop_pin.clone(),
            position_min: cfg.position_min,
            position_max: cfg.position_max,
            position_endstop: cfg.position_endstop,
            homing_speed: cfg.homing_speed,
            second_homing_speed: cfg.second_homing_speed,
            homing_retract_speed: cfg.homing_retract_speed,
            homing_retract_dist: cfg.homing_retract_dist,
            homing_positive_dir: cfg.homing_positive_dir,
            need_position_minmax: true,
            default_position_endstop: None,
        }
    }
}

pub struct Rail {
    name: String,
    steppers: Vec<Arc<Mutex<Stepper>>>,
    endstops: Vec<(Arc<Endstop>, String)>,
    position_min: f64,
    position_max: f64,
    position_endstop: f64,
    homing: HomingInfo,
}

impl Rail {
    pub fn new(
        params: RailParams,
        solver: Box<dyn SolverKinematics>,
        group_offset: usize,
        mcu: Arc<Mcu>,
        events: EventBus,
    ) -> Result<Self> {
        let name = params.stepper.name.clone();
        let stepper = Arc::new(Mutex::new(Stepper::new(
            params.stepper.clone(),
            solver,
            group_offset,
            mcu.clone(),
            events,
        )));

        let endstop_pin = params.endstop_pin.as_deref().ok_or_else(|| {
            CommandError::config(format!("rail {name} requires an endstop_pin"))
        })?;
        let endstop = Endstop::new(endstop_pin, mcu);
        endstop.add_stepper(stepper.clone());
        let short_name = name.strip_prefix("stepper_").unwrap_or(&name).to_string();

        let position_endstop = params
            .position_endstop
            .or(params.default_position_endstop)
            .ok_or_else(|| {
                CommandError::config(format!("rail {name} requires position_endstop"))
            })?;

        let (position_min, position_max) = if params.need_position_minmax {
            let max = params.position_max.ok_or_else(|| {
                CommandError::config(format!("rail {name} requires position_max"))
            })?;
            if max <= params.position_min {
                return Err(CommandError::config(format!(
                    "position_max must be above position_min on rail {name}"
                )));
            }
            (params.position_min, max)
        } else {
            (0.0, position_endstop)
        };

        if position_endstop < position_min || position_endstop > position_max {
            return Err(CommandError::config(format!(
                "position_endstop on rail {name} must be between position_min and position_max"
            )));
        }

        let axis_len = position_max - position_min;
        let positive_dir = match params.homing_positive_dir {
            Some(dir) => {
                if (dir && position_endstop == position_min)
                    || (!dir && position_endstop == position_max)
                {
                    return Err(CommandError::config(format!(
                        "invalid homing_positive_dir / position_endstop on rail {name}"
                    )));
                }
                dir
            }
            None => {
                if position_endstop <= position_min + axis_len / 4.0 {
                    false
                } else if position_endstop >= position_max - axis_len / 4.0 {
                    true
                } else {
                    return Err(CommandError::config(format!(
                        "unable to infer homing_positive_dir on rail {name}"
                    )));
                }
            }
        };

        let homing = HomingInfo {
            speed: params.homing_speed,
            position_endstop,
            retract_speed: params
                .homing_retract_speed
                .unwrap_or(params.homing_speed),
            retract_dist: params.homing_retract_dist,
            positive_dir,
            second_homing_speed: params
                .second_homing_speed
                .unwrap_or(params.homing_speed / 2.0),
        };

        Ok(Self {
            name,
            steppers: vec![stepper],
            endstops: vec![(endstop, short_name)],
            position_min,
            position_max,
            position_endstop,
            homing,
        })
    }

    /// Attach a follower stepper. Without its own endstop pin it joins the
    /// primary endstop group and halts in lockstep on trigger.
    pub fn add_extra_stepper(
        &mut self,
        params: StepperParams,
        solver: Box<dyn SolverKinematics>,
        group_offset: usize,
        endstop_pin: Option<&str>,
        mcu: Arc<Mcu>,
        events: EventBus,
    ) {
        let stepper = Arc::new(Mutex::new(Stepper::new(
            params,
            solver,
            group_offset,
            mcu.clone(),
            events,
        )));
        match endstop_pin {
            None => {
                self.endstops[0].0.add_stepper(stepper.clone());
            }
            Some(pin) => {
                let endstop = Endstop::new(pin, mcu);
                endstop.add_stepper(stepper.clone());
                let short = guard(&stepper).name().to_string();
                self.endstops.push((endstop, short));
            }
        }
        self.steppers.push(stepper);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_range(&self) -> (f64, f64) {
        (self.position_min, self.position_max)
    }

    pub fn position_endstop(&self) -> f64 {
        self.position_endstop
    }

    pub fn get_homing_info(&self) -> HomingInfo {
        self.homing
    }

    pub fn get_steppers(&self) -> Vec<Arc<Mutex<Stepper>>> {
        self.steppers.clone()
    }

    pub fn get_endstops(&self) -> Vec<(Arc<Endstop>, String)> {
        self.endstops.clone()
    }

    pub fn set_trapq(&self, trapq: Option<Arc<Mutex<Trapq>>>) {
        for stepper in &self.steppers {
            guard(stepper).set_trapq(trapq.clone());
        }
    }

    pub fn set_position(&self, coord: [f64; 3]) {
        for stepper in &self.steppers {
            guard(stepper).set_position(coord);
        }
    }

    pub fn generate_steps(&self, flush_time: f64) -> Result<()> {
        for stepper in &self.steppers {
            guard(stepper).generate_steps(flush_time)?;
        }
        Ok(())
    }

    pub fn get_commanded_position(&self) -> f64 {
        guard(&self.steppers[0]).get_commanded_position()
    }
}
