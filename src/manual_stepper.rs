// src/manual_stepper.rs
//
// Independently commanded stepper with its own trapq and print-time cursor.
// Moves are fenced against the toolhead through `sync_print_time`; homing
// reuses the standard coordinator with this stepper acting as the motion
// surface.
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::ManualStepperConfig;
use crate::error::{CommandError, Result};
use crate::events::EventBus;
use crate::guard;
use crate::homing::{HomingTarget, PrinterHoming};
use crate::itersolve::CartesianSolver;
use crate::mcu::Mcu;
use crate::rail::{Rail, RailParams};
use crate::reactor::Completion;
use crate::stepper::{Stepper, StepperParams};
use crate::toolhead::Toolhead;
use crate::trapq::Trapq;

/// Kinematics of a one-shot constant-accel move (accelerate, cruise,
/// decelerate symmetric): returns (axis_r, accel_t, cruise_t, cruise_v).
pub fn calc_move_time(dist: f64, speed: f64, accel: f64) -> (f64, f64, f64, f64) {
    let mut axis_r = 1.0;
    let mut dist = dist;
    if dist < 0.0 {
        axis_r = -1.0;
        dist = -dist;
    }
    if accel == 0.0 || dist == 0.0 {
        let cruise_t = if speed > 0.0 { dist / speed } else { 0.0 };
        return (axis_r, 0.0, cruise_t, speed);
    }
    let max_cruise_v2 = dist * accel;
    let mut speed = speed;
    if max_cruise_v2 < speed * speed {
        speed = max_cruise_v2.sqrt();
    }
    let accel_t = speed / accel;
    let accel_decel_d = accel_t * speed;
    let cruise_t = (dist - accel_decel_d) / speed;
    (axis_r, accel_t, cruise_t, speed)
}

pub struct ManualStepper {
    name: String,
    rail: Option<Rail>,
    stepper: Arc<Mutex<Stepper>>,
    steppers: Vec<Arc<Mutex<Stepper>>>,
    can_home: bool,
    velocity: f64,
    accel: f64,
    homing_accel: f64,
    next_cmd_time: f64,
    trapq: Arc<Mutex<Trapq>>,
    events: EventBus,
}

impl ManualStepper {
    pub fn new(
        name: &str,
        cfg: &ManualStepperConfig,
        mcu: Arc<Mcu>,
        events: EventBus,
    ) -> Result<Self> {
        let trapq = Arc::new(Mutex::new(Trapq::new()));
        let stepper_name = format!("manual_stepper {name}");
        let params = StepperParams {
            name: stepper_name,
            step_pin: cfg.step_pin.clone(),
            dir_pin: cfg.dir_pin.clone(),
            rotation_distance: cfg.rotation_distance,
            microsteps: cfg.microsteps,
            full_steps_per_rotation: cfg.full_steps_per_rotation,
            gear_ratio: cfg.gear_ratio,
            step_pulse_duration: cfg.step_pulse_duration,
        };
        let solver = Box::new(CartesianSolver::new(0));
        let (stepper, rail, can_home) = if cfg.endstop_pin.is_some() {
            let rail_params = RailParams {
                stepper: params,
                endstop_pin: cfg.endstop_pin.clone(),
                position_min: 0.0,
                position_max: None,
                position_endstop: cfg.position_endstop,
                homing_speed: cfg.velocity,
                second_homing_speed: None,
                homing_retract_speed: None,
                homing_retract_dist: 0.0,
                homing_positive_dir: None,
                need_position_minmax: false,
                default_position_endstop: Some(0.0),
            };
            let rail = Rail::new(rail_params, solver, 0, mcu, events.clone())?;
            (rail.get_steppers()[0].clone(), Some(rail), true)
        } else {
            let stepper = Arc::new(Mutex::new(Stepper::new(
                params,
                solver,
                0,
                mcu,
                events.clone(),
            )));
            (stepper, None, false)
        };
        guard(&stepper).set_trapq(Some(trapq.clone()));
        if let Some(rail) = &rail {
            rail.set_trapq(Some(trapq.clone()));
        }
        let steppers = match &rail {
            Some(rail) => rail.get_steppers(),
            None => vec![stepper.clone()],
        };
        Ok(Self {
            name: name.to_string(),
            rail,
            stepper,
            steppers,
            can_home,
            velocity: cfg.velocity,
            accel: cfg.accel,
            homing_accel: cfg.accel,
            next_cmd_time: 0.0,
            trapq,
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_speed(&self) -> f64 {
        self.velocity
    }

    pub fn default_accel(&self) -> f64 {
        self.accel
    }

    pub fn commanded_position(&self) -> f64 {
        guard(&self.stepper).get_commanded_position()
    }

    pub fn rail(&self) -> Option<&Rail> {
        self.rail.as_ref()
    }

    /// Fence this stepper's command stream against the toolhead clock.
    pub async fn sync_print_time(&mut self, th: &mut Toolhead) -> Result<()> {
        let print_time = th.get_last_move_time()?;
        if self.next_cmd_time > print_time {
            th.dwell(self.next_cmd_time - print_time).await?;
        } else {
            self.next_cmd_time = print_time;
        }
        Ok(())
    }

    pub fn do_set_position(&mut self, setpos: f64) {
        match &self.rail {
            Some(rail) => rail.set_position([setpos, 0.0, 0.0]),
            None => guard(&self.stepper).set_position([setpos, 0.0, 0.0]),
        }
    }

    pub async fn do_move(
        &mut self,
        th: &mut Toolhead,
        movepos: f64,
        speed: f64,
        accel: f64,
        sync: bool,
    ) -> Result<()> {
        self.sync_print_time(th).await?;
        let cp = self.commanded_position();
        let dist = movepos - cp;
        let (axis_r, accel_t, cruise_t, cruise_v) = calc_move_time(dist, speed, accel);
        guard(&self.trapq).append(
            self.next_cmd_time,
            accel_t,
            cruise_t,
            accel_t,
            [cp, 0.0, 0.0],
            [axis_r, 0.0, 0.0],
            0.0,
            cruise_v,
            accel,
        );
        self.next_cmd_time += accel_t + cruise_t + accel_t;
        for stepper in &self.steppers {
            guard(stepper).generate_steps(self.next_cmd_time)?;
        }
        guard(&self.trapq).finalize_moves(self.next_cmd_time + 99999.9);
        th.note_kinematic_activity(self.next_cmd_time);
        if sync {
            self.sync_print_time(th).await?;
        }
        Ok(())
    }

    /// STOP_ON_ENDSTOP: home against this stepper's endstop, with this
    /// stepper standing in as the homing surface.
    pub async fn do_homing_move(
        &mut self,
        th: &mut Toolhead,
        phoming: &PrinterHoming,
        movepos: f64,
        speed: f64,
        accel: f64,
        triggered: bool,
        check_trigger: bool,
    ) -> Result<()> {
        if !self.can_home {
            return Err(CommandError::config("No endstop for this manual stepper"));
        }
        self.homing_accel = accel;
        let pos = vec![movepos, 0.0, 0.0, 0.0];
        let endstops = match &self.rail {
            Some(rail) => rail.get_endstops(),
            None => return Err(CommandError::config("No endstop for this manual stepper")),
        };
        let shutdown = th.shutdown_state();
        let mut target = ManualHomingTarget { ms: self, th };
        phoming
            .manual_home(
                &mut target,
                &shutdown,
                endstops,
                pos,
                speed,
                triggered,
                check_trigger,
            )
            .await
    }
}

/// Manual stepper playing the toolhead role during its own homing move.
struct ManualHomingTarget<'a> {
    ms: &'a mut ManualStepper,
    th: &'a mut Toolhead,
}

#[async_trait]
impl<'a> HomingTarget for ManualHomingTarget<'a> {
    fn axis_count(&self) -> usize {
        3
    }

    fn events(&self) -> EventBus {
        self.ms.events.clone()
    }

    async fn flush_step_generation(&mut self) -> Result<()> {
        self.ms.sync_print_time(self.th).await
    }

    fn get_position(&self) -> Vec<f64> {
        vec![self.ms.commanded_position(), 0.0, 0.0, 0.0]
    }

    fn set_position_homing(&mut self, pos: &[f64]) -> Result<()> {
        self.ms.do_set_position(pos[0]);
        Ok(())
    }

    async fn get_last_move_time(&mut self) -> Result<f64> {
        self.ms.sync_print_time(self.th).await?;
        Ok(self.ms.next_cmd_time)
    }

    async fn dwell(&mut self, delay: f64) -> Result<()> {
        self.ms.next_cmd_time += delay.max(0.0);
        Ok(())
    }

    async fn drip_move(
        &mut self,
        pos: &[f64],
        speed: f64,
        _completion: Completion<()>,
    ) -> Result<()> {
        let accel = self.ms.homing_accel;
        self.ms.do_move(self.th, pos[0], speed, accel, true).await
    }

    fn homing_steppers(&self) -> Vec<Arc<Mutex<Stepper>>> {
        self.ms.steppers.clone()
    }

    fn calc_toolhead_pos(
        &self,
        kin_spos: &HashMap<String, f64>,
        offsets: &HashMap<String, i64>,
    ) -> Vec<f64> {
        let stepper = guard(&self.ms.stepper);
        let name = stepper.name();
        let mut value = kin_spos.get(name).copied().unwrap_or(0.0);
        value += offsets.get(name).copied().unwrap_or(0) as f64 * stepper.step_dist();
        vec![value, 0.0, 0.0, 0.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_time_trapezoid() {
        let (axis_r, accel_t, cruise_t, cruise_v) = calc_move_time(100.0, 50.0, 1000.0);
        assert_eq!(axis_r, 1.0);
        assert!((cruise_v - 50.0).abs() < 1e-12);
        assert!((accel_t - 0.05).abs() < 1e-12);
        let dist = cruise_v * accel_t + cruise_v * cruise_t;
        assert!((dist - 100.0).abs() < 1e-9);
    }

    #[test]
    fn move_time_short_move_is_triangular() {
        let (_, accel_t, cruise_t, cruise_v) = calc_move_time(1.0, 100.0, 1000.0);
        // Cannot reach 100mm/s over 1mm at 1000mm/s^2.
        assert!(cruise_v < 100.0);
        assert!((cruise_v - (1000.0f64).sqrt()).abs() < 1e-9);
        assert!(cruise_t.abs() < 1e-9);
        assert!(accel_t > 0.0);
    }

    #[test]
    fn move_time_negative_direction() {
        let (axis_r, _, _, cruise_v) = calc_move_time(-10.0, 20.0, 500.0);
        assert_eq!(axis_r, -1.0);
        assert!(cruise_v > 0.0);
    }
}
