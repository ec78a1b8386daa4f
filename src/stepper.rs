// src/stepper.rs
//
// Logical stepper: owns its step queue and solver state, holds a handle to
// the trapq it currently follows. The commanded position lives in the
// solver; `mcu_position_offset` maps it onto the MCU's integer step count
// and is re-synced from a position query after homing.
use std::sync::{Arc, Mutex};

use crate::config::gear_ratio_factor;
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::guard;
use crate::itersolve::{SolverKinematics, StepGenerator};
use crate::mcu::{Mcu, McuCommand};
use crate::stepcompress::StepCompress;
use crate::trapq::Trapq;

/// Pin name with an optional `!` invert prefix.
pub fn parse_pin(pin: &str) -> (String, bool) {
    match pin.strip_prefix('!') {
        Some(rest) => (rest.to_string(), true),
        None => (pin.to_string(), false),
    }
}

#[derive(Debug, Clone)]
pub struct StepperParams {
    pub name: String,
    pub step_pin: String,
    pub dir_pin: String,
    pub rotation_distance: f64,
    pub microsteps: u32,
    pub full_steps_per_rotation: u32,
    pub gear_ratio: Option<(f64, f64)>,
    pub step_pulse_duration: f64,
}

pub struct Stepper {
    name: String,
    oid: u32,
    rotation_dist: f64,
    steps_per_rotation: f64,
    step_dist: f64,
    invert_dir: bool,
    mcu_position_offset: f64,
    /// Index of this stepper's group in the full toolhead coordinate vector
    /// (0 for XYZ, 3 for ABC, axis_count for the extruder).
    group_offset: usize,
    gen: StepGenerator,
    stepqueue: Arc<Mutex<StepCompress>>,
    trapq: Option<Arc<Mutex<Trapq>>>,
    mcu: Arc<Mcu>,
    events: EventBus,
    active_callbacks: Vec<Box<dyn FnOnce(f64) + Send>>,
}

impl Stepper {
    pub fn new(
        params: StepperParams,
        solver: Box<dyn SolverKinematics>,
        group_offset: usize,
        mcu: Arc<Mcu>,
        events: EventBus,
    ) -> Self {
        let gearing = gear_ratio_factor(&params.gear_ratio);
        let steps_per_rotation =
            params.full_steps_per_rotation as f64 * params.microsteps as f64 * gearing;
        let step_dist = params.rotation_distance / steps_per_rotation;

        let (step_pin, invert_step) = parse_pin(&params.step_pin);
        let (dir_pin, invert_dir) = parse_pin(&params.dir_pin);

        let oid = mcu.create_oid();
        let stepqueue = Arc::new(Mutex::new(StepCompress::new(
            oid,
            mcu.seconds_to_clock(mcu.max_stepper_error()),
            mcu.transport(),
        )));
        guard(&stepqueue).set_invert_dir(invert_dir);
        mcu.register_step_queue(stepqueue.clone());

        mcu.send(McuCommand::ConfigStepper {
            oid,
            step_pin,
            dir_pin,
            invert_step,
            step_pulse_ticks: mcu.seconds_to_clock(params.step_pulse_duration) as u32,
        });
        mcu.send(McuCommand::ResetStepClock { oid, clock: 0 });

        Self {
            name: params.name,
            oid,
            rotation_dist: params.rotation_distance,
            steps_per_rotation,
            step_dist,
            invert_dir,
            mcu_position_offset: 0.0,
            group_offset,
            gen: StepGenerator::new(step_dist, solver),
            stepqueue,
            trapq: None,
            mcu,
            events,
            active_callbacks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn oid(&self) -> u32 {
        self.oid
    }

    pub fn step_dist(&self) -> f64 {
        self.step_dist
    }

    pub fn rotation_distance(&self) -> (f64, f64) {
        (self.rotation_dist, self.steps_per_rotation)
    }

    pub fn group_offset(&self) -> usize {
        self.group_offset
    }

    pub fn set_trapq(&mut self, trapq: Option<Arc<Mutex<Trapq>>>) -> Option<Arc<Mutex<Trapq>>> {
        std::mem::replace(&mut self.trapq, trapq)
    }

    pub fn trapq(&self) -> Option<Arc<Mutex<Trapq>>> {
        self.trapq.clone()
    }

    pub fn set_scan_windows(&mut self, pre_active: f64, post_active: f64) {
        self.gen.set_scan_windows(pre_active, post_active);
    }

    pub fn is_active_axis(&self, axis: char) -> bool {
        self.gen.is_active_axis(axis)
    }

    pub fn add_active_callback(&mut self, cb: Box<dyn FnOnce(f64) + Send>) {
        self.active_callbacks.push(cb);
    }

    /// Stepper coordinate for a full toolhead position vector.
    pub fn calc_position_from_coord(&self, pos: &[f64]) -> f64 {
        let mut local = [0.0; 3];
        for (i, slot) in local.iter_mut().enumerate() {
            *slot = pos.get(self.group_offset + i).copied().unwrap_or(0.0);
        }
        self.gen.calc_position_from_coord(local)
    }

    /// Write the solver's commanded position, preserving the MCU step count.
    pub fn set_position(&mut self, coord: [f64; 3]) {
        let mcu_pos = self.get_mcu_position();
        self.gen.set_position(coord);
        self.set_mcu_position(mcu_pos);
    }

    pub fn get_commanded_position(&self) -> f64 {
        self.gen.commanded_pos()
    }

    /// Integer MCU step position, rounding half away from zero.
    pub fn get_mcu_position(&self) -> i64 {
        let pos = (self.gen.commanded_pos() + self.mcu_position_offset) / self.step_dist;
        if pos >= 0.0 {
            (pos + 0.5) as i64
        } else {
            (pos - 0.5) as i64
        }
    }

    fn set_mcu_position(&mut self, mcu_pos: i64) {
        self.mcu_position_offset = mcu_pos as f64 * self.step_dist - self.gen.commanded_pos();
    }

    pub fn mcu_to_commanded_position(&self, mcu_pos: i64) -> f64 {
        mcu_pos as f64 * self.step_dist - self.mcu_position_offset
    }

    /// Position at a past print time, from the transmitted step history.
    pub fn get_past_mcu_position(&self, print_time: f64) -> i64 {
        let clock = self.mcu.print_time_to_clock(print_time);
        guard(&self.stepqueue).find_past_position(clock)
    }

    pub fn get_past_commanded_position(&self, print_time: f64) -> f64 {
        self.mcu_to_commanded_position(self.get_past_mcu_position(print_time))
    }

    /// Produce step events for all trapq segments up to `flush_time`.
    pub fn generate_steps(&mut self, flush_time: f64) -> Result<()> {
        let Some(trapq) = self.trapq.clone() else {
            return Ok(());
        };
        if !self.active_callbacks.is_empty() {
            let first_active = {
                let tq = guard(&trapq);
                self.gen.check_active(&tq, flush_time)
            };
            if let Some(time) = first_active {
                for cb in std::mem::take(&mut self.active_callbacks) {
                    cb(time);
                }
            }
        }
        let tq = guard(&trapq);
        let mut sq = guard(&self.stepqueue);
        self.gen.generate_steps(&mut sq, &tq, flush_time)?;
        Ok(())
    }

    /// After a homing move: restart the step clock and re-sync the host's
    /// notion of the MCU position from a position query.
    pub fn note_homing_end(&mut self) -> Result<()> {
        guard(&self.stepqueue).reset(0)?;
        self.mcu.send(McuCommand::ResetStepClock {
            oid: self.oid,
            clock: 0,
        });
        self.mcu.send(McuCommand::StepperGetPosition { oid: self.oid });
        let mut pos = self.mcu.transport().query_stepper_position(self.oid);
        if self.invert_dir {
            pos = -pos;
        }
        let print_time = self.mcu.estimated_print_time_now();
        let clock = self.mcu.print_time_to_clock(print_time);
        guard(&self.stepqueue).set_last_position(clock, pos)?;
        self.set_mcu_position(pos);
        self.events.send(Event::SyncMcuPosition {
            stepper: self.name.clone(),
        });
        Ok(())
    }

    pub fn set_dir_inverted(&mut self, invert: bool) {
        if invert == self.invert_dir {
            return;
        }
        self.invert_dir = invert;
        guard(&self.stepqueue).set_invert_dir(invert);
        self.events.send(Event::SetDirInverted {
            stepper: self.name.clone(),
        });
    }
}
