// src/endstop.rs
//
// Handle to an MCU-side endstop. Arming hands the MCU a trigger condition
// and yields a completion that fires on contact; every stepper attached to
// the endstop is halted synchronously by the MCU when it fires.
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::guard;
use crate::mcu::{EndstopArm, EndstopState, Mcu};
use crate::reactor::Completion;
use crate::stepper::{parse_pin, Stepper};

/// Extra reactor time allowed for the trigger report to arrive after the
/// move has ended.
const HOME_WAIT_MARGIN: f64 = 0.250;

pub struct Endstop {
    oid: u32,
    pin: String,
    pin_invert: bool,
    mcu: Arc<Mcu>,
    steppers: Mutex<Vec<Arc<Mutex<Stepper>>>>,
    armed: Mutex<Option<Completion<bool>>>,
}

impl Endstop {
    pub fn new(pin: &str, mcu: Arc<Mcu>) -> Arc<Self> {
        let (pin, pin_invert) = parse_pin(pin);
        Arc::new(Self {
            oid: mcu.create_oid(),
            pin,
            pin_invert,
            mcu,
            steppers: Mutex::new(Vec::new()),
            armed: Mutex::new(None),
        })
    }

    pub fn oid(&self) -> u32 {
        self.oid
    }

    pub fn pin(&self) -> &str {
        &self.pin
    }

    pub fn add_stepper(&self, stepper: Arc<Mutex<Stepper>>) {
        let oid = guard(&stepper).oid();
        self.mcu.transport().register_endstop_stepper(self.oid, oid);
        let mut steppers = guard(&self.steppers);
        if !steppers.iter().any(|s| Arc::ptr_eq(s, &stepper)) {
            steppers.push(stepper);
        }
    }

    pub fn get_steppers(&self) -> Vec<Arc<Mutex<Stepper>>> {
        guard(&self.steppers).clone()
    }

    /// Arm the trigger. The returned completion fires when the MCU reports
    /// contact (`false`) or a communication fault (`true`).
    pub fn home_start(
        &self,
        print_time: f64,
        sample_time: f64,
        sample_count: u16,
        rest_time: f64,
        triggered: bool,
    ) -> Completion<bool> {
        let completion: Completion<bool> = Completion::new();
        let arm = EndstopArm {
            oid: self.oid,
            clock: self.mcu.print_time_to_clock(print_time),
            sample_ticks: self.mcu.seconds_to_clock(sample_time),
            sample_count,
            rest_ticks: self.mcu.seconds_to_clock(rest_time),
            pin_value: triggered != self.pin_invert,
        };
        self.mcu.transport().arm_endstop(arm, completion.clone());
        *guard(&self.armed) = Some(completion.clone());
        completion
    }

    /// Wait out the homing move and report the trigger time: positive on
    /// trigger, `0.0` when the move ended untriggered, negative on a
    /// communication timeout. Steppers are re-synced in every case.
    pub async fn home_wait(&self, home_end_time: f64) -> Result<f64> {
        let armed = guard(&self.armed).take();
        if let Some(completion) = armed {
            let deadline = self.mcu.event_time_for_print_time(home_end_time) + HOME_WAIT_MARGIN;
            let _ = completion
                .wait_until(self.mcu.reactor(), deadline)
                .await;
        }
        let state = self.mcu.transport().stop_endstop(self.oid);
        for stepper in self.get_steppers() {
            guard(&stepper).note_homing_end()?;
        }
        Ok(match state {
            EndstopState::CommTimeout => -1.0,
            EndstopState::NotTriggered => 0.0,
            EndstopState::Triggered { clock } => self.mcu.clock_to_print_time(clock),
        })
    }
}
