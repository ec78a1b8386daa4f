// src/probe.rs
//
// G38-style probing front-end. The probe is one endstop wired to every
// motion stepper, so contact on any commanded axis halts the machine; the
// trigger position is reconstructed by the homing coordinator.
//
// Variants map onto (error_out, trigger_invert):
//   G38.2 probe toward workpiece, error on failure   -> (true, true)
//   G38.3 probe toward workpiece                     -> (false, true)
//   G38.4 probe away from workpiece, error on failure-> (true, false)
//   G38.5 probe away from workpiece                  -> (false, false)
use std::sync::Arc;

use crate::config::ProbeConfig;
use crate::endstop::Endstop;
use crate::error::Result;
use crate::homing::PrinterHoming;
use crate::toolhead::Toolhead;

pub struct ProbeG38 {
    endstop: Arc<Endstop>,
    speed: f64,
    recovery_time: f64,
}

impl ProbeG38 {
    pub fn new(cfg: &ProbeConfig, th: &Toolhead) -> Self {
        let endstop = Endstop::new(&cfg.pin, th.mcu());
        // Contact must halt every stepper the probe can be driven by.
        for stepper in th.kin_steppers() {
            endstop.add_stepper(stepper);
        }
        Self {
            endstop,
            speed: cfg.speed,
            recovery_time: cfg.recovery_time,
        }
    }

    pub fn default_speed(&self) -> f64 {
        self.speed
    }

    pub fn endstop(&self) -> Arc<Endstop> {
        self.endstop.clone()
    }

    /// Run one probing move toward `pos`. Returns the trigger position (or
    /// the commanded endpoint when no contact and no error requested).
    pub async fn probe(
        &self,
        th: &mut Toolhead,
        homing: &PrinterHoming,
        pos: Vec<f64>,
        speed: f64,
        error_out: bool,
        trigger_invert: bool,
        probe_axes: Vec<String>,
    ) -> Result<Vec<f64>> {
        if self.recovery_time > 0.0 {
            th.dwell(self.recovery_time).await?;
        }
        homing
            .probing_move(
                th,
                self.endstop.clone(),
                pos,
                speed,
                error_out,
                trigger_invert,
                Some(probe_axes),
            )
            .await
    }
}
