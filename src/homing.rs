// src/homing.rs
//
// Homing and probing coordination. A `HomingMove` runs one endstop-gated
// drip move and reconstructs where the toolhead actually stopped from
// per-stepper step counts; `PrinterHoming` provides the G28 / manual-home /
// probing entry points including the precision second pass after retract.
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::endstop::Endstop;
use crate::error::{CommandError, Result, ShutdownState};
use crate::events::{Event, EventBus};
use crate::guard;
use crate::rail::HomingInfo;
use crate::reactor::{multi_complete, Completion};
use crate::stepper::Stepper;
use crate::toolhead::Toolhead;

pub const HOMING_START_DELAY: f64 = 0.001;
pub const ENDSTOP_SAMPLE_TIME: f64 = 0.000_015;
pub const ENDSTOP_SAMPLE_COUNT: u16 = 4;

/// The motion surface a homing move drives. The toolhead implements this;
/// a manual stepper provides its own implementation to reuse the same
/// coordinator.
#[async_trait]
pub trait HomingTarget: Send {
    fn axis_count(&self) -> usize;
    fn events(&self) -> EventBus;
    async fn flush_step_generation(&mut self) -> Result<()>;
    fn get_position(&self) -> Vec<f64>;
    fn set_position_homing(&mut self, pos: &[f64]) -> Result<()>;
    async fn get_last_move_time(&mut self) -> Result<f64>;
    async fn dwell(&mut self, delay: f64) -> Result<()>;
    async fn drip_move(
        &mut self,
        pos: &[f64],
        speed: f64,
        completion: Completion<()>,
    ) -> Result<()>;
    fn homing_steppers(&self) -> Vec<Arc<Mutex<Stepper>>>;
    fn calc_toolhead_pos(
        &self,
        kin_spos: &HashMap<String, f64>,
        offsets: &HashMap<String, i64>,
    ) -> Vec<f64>;
}

#[async_trait]
impl HomingTarget for Toolhead {
    fn axis_count(&self) -> usize {
        Toolhead::axis_count(self)
    }

    fn events(&self) -> EventBus {
        Toolhead::events(self)
    }

    async fn flush_step_generation(&mut self) -> Result<()> {
        Toolhead::flush_step_generation(self)
    }

    fn get_position(&self) -> Vec<f64> {
        Toolhead::get_position(self)
    }

    fn set_position_homing(&mut self, pos: &[f64]) -> Result<()> {
        Toolhead::set_position(self, pos.to_vec(), &[])
    }

    async fn get_last_move_time(&mut self) -> Result<f64> {
        Toolhead::get_last_move_time(self)
    }

    async fn dwell(&mut self, delay: f64) -> Result<()> {
        Toolhead::dwell(self, delay).await
    }

    async fn drip_move(
        &mut self,
        pos: &[f64],
        speed: f64,
        completion: Completion<()>,
    ) -> Result<()> {
        Toolhead::drip_move(self, pos.to_vec(), speed, completion).await
    }

    fn homing_steppers(&self) -> Vec<Arc<Mutex<Stepper>>> {
        Toolhead::kin_steppers(self)
    }

    fn calc_toolhead_pos(
        &self,
        kin_spos: &HashMap<String, f64>,
        offsets: &HashMap<String, i64>,
    ) -> Vec<f64> {
        Toolhead::calc_toolhead_pos(self, kin_spos, offsets)
    }
}

/// Stepper position bookkeeping across one homing/probing move.
pub struct StepperPosition {
    stepper: Arc<Mutex<Stepper>>,
    pub stepper_name: String,
    pub endstop_name: String,
    pub start_pos: i64,
    pub halt_pos: Option<i64>,
    pub trig_pos: Option<i64>,
}

impl StepperPosition {
    fn new(stepper: Arc<Mutex<Stepper>>, endstop_name: String) -> Self {
        let (stepper_name, start_pos) = {
            let s = guard(&stepper);
            (s.name().to_string(), s.get_mcu_position())
        };
        Self {
            stepper,
            stepper_name,
            endstop_name,
            start_pos,
            halt_pos: None,
            trig_pos: None,
        }
    }

    fn note_home_end(&mut self, trigger_time: f64) {
        let s = guard(&self.stepper);
        self.halt_pos = Some(s.get_mcu_position());
        self.trig_pos = Some(s.get_past_mcu_position(trigger_time));
    }
}

/// One homing or probing attempt over a set of endstops.
pub struct HomingMove<'a> {
    th: &'a mut dyn HomingTarget,
    endstops: Vec<(Arc<Endstop>, String)>,
    pub stepper_positions: Vec<StepperPosition>,
}

impl<'a> HomingMove<'a> {
    pub fn new(th: &'a mut dyn HomingTarget, endstops: Vec<(Arc<Endstop>, String)>) -> Self {
        Self {
            th,
            endstops,
            stepper_positions: Vec::new(),
        }
    }

    /// Endstop rescheduling budget: the expected time per step, so the MCU
    /// never checks the pin slower than the step rate requires.
    fn calc_endstop_rate(&self, endstop: &Endstop, movepos: &[f64], speed: f64) -> f64 {
        let startpos = self.th.get_position();
        let axis_count = self.th.axis_count();
        let axes_d: Vec<f64> = movepos
            .iter()
            .zip(startpos.iter())
            .map(|(m, s)| m - s)
            .collect();
        let mut move_d = axes_d[..axis_count]
            .iter()
            .map(|d| d * d)
            .sum::<f64>()
            .sqrt();
        if move_d < 1e-9 {
            // Extruder-only homing move.
            move_d = axes_d.get(axis_count).copied().unwrap_or(0.0).abs();
        }
        let move_t = move_d / speed;
        let max_steps = endstop
            .get_steppers()
            .iter()
            .map(|s| {
                let s = guard(s);
                (s.calc_position_from_coord(&startpos) - s.calc_position_from_coord(movepos)).abs()
                    / s.step_dist()
            })
            .fold(0.0, f64::max);
        if max_steps <= 0.0 {
            return 0.001;
        }
        move_t / max_steps
    }

    fn endstop_names(&self) -> Vec<String> {
        self.endstops.iter().map(|(_, n)| n.clone()).collect()
    }

    pub fn trigger_mcu_positions(&self) -> HashMap<String, i64> {
        self.stepper_positions
            .iter()
            .map(|sp| (sp.stepper_name.clone(), sp.trig_pos.unwrap_or(sp.start_pos)))
            .collect()
    }

    /// Run the move, watching the endstops. Returns the toolhead position
    /// at the instant of trigger (`trigpos`).
    pub async fn homing_move(
        &mut self,
        movepos: Vec<f64>,
        speed: f64,
        probe_pos: bool,
        triggered: bool,
        check_triggered: bool,
    ) -> Result<Vec<f64>> {
        self.th.events().send(Event::HomingMoveBegin {
            endstops: self.endstop_names(),
        });
        // Note start location.
        self.th.flush_step_generation().await?;
        let kin_spos: HashMap<String, f64> = self
            .th
            .homing_steppers()
            .iter()
            .map(|s| {
                let s = guard(s);
                (s.name().to_string(), s.get_commanded_position())
            })
            .collect();
        self.stepper_positions = self
            .endstops
            .iter()
            .flat_map(|(es, name)| {
                es.get_steppers()
                    .into_iter()
                    .map(|s| StepperPosition::new(s, name.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        // Start endstop checking.
        let print_time = self.th.get_last_move_time().await?;
        let mut endstop_triggers = Vec::new();
        for (endstop, _) in &self.endstops {
            let rest_time = self.calc_endstop_rate(endstop, &movepos, speed);
            endstop_triggers.push(endstop.home_start(
                print_time,
                ENDSTOP_SAMPLE_TIME,
                ENDSTOP_SAMPLE_COUNT,
                rest_time,
                triggered,
            ));
        }
        let all_endstop_trigger = multi_complete(endstop_triggers);
        self.th.dwell(HOMING_START_DELAY).await?;

        // Issue the move.
        let mut error: Option<CommandError> = None;
        if let Err(e) = self
            .th
            .drip_move(&movepos, speed, all_endstop_trigger)
            .await
        {
            error = Some(CommandError::HomingFailed(format!(
                "Error during homing move: {e}"
            )));
        }

        // Wait for the endstops to report.
        let move_end_print_time = self.th.get_last_move_time().await?;
        let mut trigger_times: HashMap<String, f64> = HashMap::new();
        for (endstop, name) in &self.endstops {
            let trigger_time = endstop.home_wait(move_end_print_time).await?;
            tracing::debug!("homing {name}: trigger_time={trigger_time:.6}");
            if trigger_time > 0.0 {
                trigger_times.insert(name.clone(), trigger_time);
            } else if trigger_time < 0.0 && error.is_none() {
                error = Some(CommandError::EndstopCommTimeout(name.clone()));
            } else if trigger_time == 0.0 && check_triggered && error.is_none() {
                error = Some(CommandError::EndstopNoTrigger(name.clone()));
            }
        }

        // Determine the stepper halt positions.
        self.th.flush_step_generation().await?;
        for sp in &mut self.stepper_positions {
            let tt = trigger_times
                .get(&sp.endstop_name)
                .copied()
                .unwrap_or(move_end_print_time);
            sp.note_home_end(tt);
        }

        let trigpos;
        let mut haltpos;
        if probe_pos {
            let halt_steps: HashMap<String, i64> = self
                .stepper_positions
                .iter()
                .map(|sp| {
                    (
                        sp.stepper_name.clone(),
                        sp.halt_pos.unwrap_or(sp.start_pos) - sp.start_pos,
                    )
                })
                .collect();
            let trig_steps: HashMap<String, i64> = self
                .stepper_positions
                .iter()
                .map(|sp| {
                    (
                        sp.stepper_name.clone(),
                        sp.trig_pos.unwrap_or(sp.start_pos) - sp.start_pos,
                    )
                })
                .collect();
            trigpos = self.th.calc_toolhead_pos(&kin_spos, &trig_steps);
            if trig_steps != halt_steps {
                haltpos = self.th.calc_toolhead_pos(&kin_spos, &halt_steps);
            } else {
                haltpos = trigpos.clone();
            }
        } else {
            trigpos = movepos.clone();
            haltpos = movepos.clone();
            // Overshoot accumulated between trigger and motor halt.
            let over_steps: HashMap<String, i64> = self
                .stepper_positions
                .iter()
                .map(|sp| {
                    (
                        sp.stepper_name.clone(),
                        sp.halt_pos.unwrap_or(sp.start_pos) - sp.trig_pos.unwrap_or(sp.start_pos),
                    )
                })
                .collect();
            if over_steps.values().any(|v| *v != 0) {
                self.th.set_position_homing(&movepos)?;
                let halt_kin_spos: HashMap<String, f64> = self
                    .th
                    .homing_steppers()
                    .iter()
                    .map(|s| {
                        let s = guard(s);
                        (s.name().to_string(), s.get_commanded_position())
                    })
                    .collect();
                haltpos = self.th.calc_toolhead_pos(&halt_kin_spos, &over_steps);
            }
        }
        self.th.set_position_homing(&haltpos)?;

        self.th.events().send(Event::HomingMoveEnd {
            endstops: self.endstop_names(),
        });
        match error {
            Some(e) => Err(e),
            None => Ok(trigpos),
        }
    }

    /// Name of an endstop whose stepper never moved before triggering, if
    /// any. `axes` filters to the steppers commanded by a probing move.
    pub fn check_no_movement(&self, axes: Option<&[String]>) -> Option<String> {
        for sp in &self.stepper_positions {
            if sp.trig_pos != Some(sp.start_pos) {
                continue;
            }
            let name = sp.stepper_name.to_lowercase();
            match axes {
                None => return Some(sp.endstop_name.clone()),
                Some(axes) => {
                    if name.starts_with("extruder") {
                        if axes.iter().any(|a| a.to_lowercase() == name) {
                            return Some(sp.endstop_name.clone());
                        }
                    } else if axes
                        .iter()
                        .filter(|a| a.len() == 1)
                        .any(|a| name.contains(&a.to_lowercase()))
                    {
                        return Some(sp.endstop_name.clone());
                    }
                }
            }
        }
        None
    }
}

/// State of one homing request, shared with `home_rails_end` adjusters.
#[derive(Default)]
pub struct Homing {
    changed_axes: Vec<usize>,
    trigger_mcu_pos: HashMap<String, i64>,
    adjust_pos: HashMap<String, f64>,
}

impl Homing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_axes(&mut self, axes: Vec<usize>) {
        self.changed_axes = axes;
    }

    pub fn get_axes(&self) -> &[usize] {
        &self.changed_axes
    }

    pub fn get_trigger_position(&self, stepper_name: &str) -> Option<i64> {
        self.trigger_mcu_pos.get(stepper_name).copied()
    }

    /// Request a post-home adjustment, in stepper distance units.
    pub fn set_stepper_adjustment(&mut self, stepper_name: &str, adjustment: f64) {
        self.adjust_pos.insert(stepper_name.to_string(), adjustment);
    }

    /// Fill `None` entries with the current toolhead position.
    fn fill_coord(&self, th: &Toolhead, coord: &[Option<f64>]) -> Vec<f64> {
        let mut filled = th.get_position();
        for (i, value) in coord.iter().enumerate() {
            if let Some(v) = value {
                filled[i] = *v;
            }
        }
        filled
    }

    pub fn set_homed_position(&self, th: &mut Toolhead, pos: &[Option<f64>]) -> Result<()> {
        let filled = self.fill_coord(th, pos);
        th.set_position(filled, &[])
    }
}

#[derive(Clone, Copy, Debug)]
pub enum RailHandle {
    Kin { kin: usize, rail: usize },
    Extruder,
}

fn rail_endstops(th: &Toolhead, handle: RailHandle) -> Result<Vec<(Arc<Endstop>, String)>> {
    match handle {
        RailHandle::Kin { kin, rail } => Ok(th.kin(kin).rail(rail).get_endstops()),
        RailHandle::Extruder => th
            .extruder()
            .and_then(|e| e.rail())
            .map(|r| r.get_endstops())
            .ok_or_else(|| CommandError::config("extruder is not configured for homing")),
    }
}

fn rail_homing_info(th: &Toolhead, handle: RailHandle) -> Result<(HomingInfo, (f64, f64))> {
    match handle {
        RailHandle::Kin { kin, rail } => {
            let rail = th.kin(kin).rail(rail);
            Ok((rail.get_homing_info(), rail.get_range()))
        }
        RailHandle::Extruder => th
            .extruder()
            .and_then(|e| e.rail())
            .map(|r| (r.get_homing_info(), r.get_range()))
            .ok_or_else(|| CommandError::config("extruder is not configured for homing")),
    }
}

type Adjuster = Box<dyn Fn(&mut Homing, &Toolhead) + Send + Sync>;

/// High-level homing entry points.
#[derive(Default)]
pub struct PrinterHoming {
    adjusters: Vec<Adjuster>,
}

impl PrinterHoming {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook consulted at `home_rails_end` to request post-home
    /// position adjustments (e.g. safe-Z, skew correction).
    pub fn register_adjuster(&mut self, adjuster: Adjuster) {
        self.adjusters.push(adjuster);
    }

    /// Home against externally supplied endstops (manual steppers, probes
    /// acting as endstops).
    pub async fn manual_home(
        &self,
        th: &mut dyn HomingTarget,
        shutdown: &ShutdownState,
        endstops: Vec<(Arc<Endstop>, String)>,
        pos: Vec<f64>,
        speed: f64,
        triggered: bool,
        check_triggered: bool,
    ) -> Result<()> {
        let mut hmove = HomingMove::new(th, endstops);
        match hmove
            .homing_move(pos, speed, false, triggered, check_triggered)
            .await
        {
            Ok(_) => Ok(()),
            Err(_) if shutdown.is_shutdown() => Err(CommandError::Shutdown(
                "Homing failed due to printer shutdown".to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    /// Probing move: reports the trigger position and rejects probes that
    /// were already triggered before any movement.
    pub async fn probing_move(
        &self,
        th: &mut Toolhead,
        mcu_probe: Arc<Endstop>,
        pos: Vec<f64>,
        speed: f64,
        check_triggered: bool,
        triggered: bool,
        probe_axes: Option<Vec<String>>,
    ) -> Result<Vec<f64>> {
        let shutdown = th.shutdown_state();
        let mut hmove = HomingMove::new(th, vec![(mcu_probe, "probe".to_string())]);
        let epos = match hmove
            .homing_move(pos, speed, true, triggered, check_triggered)
            .await
        {
            Ok(p) => p,
            Err(_) if shutdown.is_shutdown() => {
                return Err(CommandError::Shutdown(
                    "Probing failed due to printer shutdown".to_string(),
                ))
            }
            Err(e) => return Err(e),
        };
        if hmove.check_no_movement(probe_axes.as_deref()).is_some() {
            return Err(CommandError::EndstopEarlyTrigger);
        }
        Ok(epos)
    }

    /// Home a set of rails: teleport to the force position, first contact
    /// pass, then an optional retract and slow second pass.
    pub async fn home_rails(
        &self,
        th: &mut Toolhead,
        homing: &mut Homing,
        rails: &[RailHandle],
        forcepos: Vec<Option<f64>>,
        movepos: Vec<Option<f64>>,
    ) -> Result<()> {
        th.events().send(Event::HomeRailsBegin {
            axes: homing.get_axes().to_vec(),
        });
        let axis_count = th.axis_count();
        let homing_axes: Vec<usize> = (0..axis_count)
            .filter(|i| forcepos[*i].is_some())
            .collect();
        let startpos = homing.fill_coord(th, &forcepos);
        let homepos = homing.fill_coord(th, &movepos);
        tracing::debug!("home_rails: forcepos={startpos:?} homepos={homepos:?}");
        th.set_position(startpos, &homing_axes)?;

        let mut endstops = Vec::new();
        for handle in rails {
            endstops.extend(rail_endstops(th, *handle)?);
        }
        let (hi, _) = rail_homing_info(th, rails[0])?;

        // First home.
        let mut hmove = HomingMove::new(&mut *th, endstops.clone());
        hmove.homing_move(homepos.clone(), hi.speed, false, true, true).await?;
        let mut trigger_mcu_pos = hmove.trigger_mcu_positions();

        // Second home at reduced speed after a retract.
        if hi.retract_dist > 0.0 {
            let startpos = homing.fill_coord(th, &forcepos);
            let homepos = homing.fill_coord(th, &movepos);
            let axes_d: Vec<f64> = homepos
                .iter()
                .zip(startpos.iter())
                .map(|(h, s)| h - s)
                .collect();
            let mut move_d = axes_d[..axis_count]
                .iter()
                .map(|d| d * d)
                .sum::<f64>()
                .sqrt();
            if move_d < 1e-9 {
                move_d = axes_d[axis_count].abs();
            }
            let retract_r = (hi.retract_dist / move_d).min(1.0);
            let retractpos: Vec<f64> = homepos
                .iter()
                .zip(axes_d.iter())
                .map(|(h, d)| h - d * retract_r)
                .collect();
            th.move_to(retractpos.clone(), hi.retract_speed).await?;
            let startpos: Vec<f64> = retractpos
                .iter()
                .zip(axes_d.iter())
                .map(|(r, d)| r - d * retract_r)
                .collect();
            th.set_position(startpos, &[])?;
            let mut hmove = HomingMove::new(&mut *th, endstops);
            hmove
                .homing_move(homepos, hi.second_homing_speed, false, true, true)
                .await?;
            if let Some(name) = hmove.check_no_movement(None) {
                return Err(CommandError::EndstopStillTriggered(name));
            }
            trigger_mcu_pos = hmove.trigger_mcu_positions();
        }

        // Signal the home operation complete.
        th.flush_step_generation()?;
        homing.trigger_mcu_pos = trigger_mcu_pos;
        homing.adjust_pos.clear();
        th.events().send(Event::HomeRailsEnd {
            axes: homing.get_axes().to_vec(),
            trigger_mcu_pos: homing.trigger_mcu_pos.clone(),
        });
        for adjuster in &self.adjusters {
            adjuster(homing, th);
        }
        if homing.adjust_pos.values().any(|v| *v != 0.0) {
            // Apply homing offsets via a fresh inverse-kinematic resolve.
            let mut kin_spos: HashMap<String, f64> = HashMap::new();
            for stepper in th.kin_steppers() {
                let s = guard(&stepper);
                let adjust = homing.adjust_pos.get(s.name()).copied().unwrap_or(0.0);
                kin_spos.insert(s.name().to_string(), s.get_commanded_position() + adjust);
            }
            let mut homepos = th.get_position();
            for kin in th.kinematics() {
                let local = kin.calc_position(&kin_spos);
                for (i, axis) in kin.axes().enumerate() {
                    if homing_axes.contains(&axis) {
                        homepos[axis] = local[i];
                    }
                }
            }
            th.set_position(homepos, &[])?;
        }
        Ok(())
    }

    /// G28: home the requested axes (all when none given), group by group.
    pub async fn cmd_g28(&self, th: &mut Toolhead, requested: &[usize]) -> Result<()> {
        let axes: Vec<usize> = if requested.is_empty() {
            (0..th.axis_count()).collect()
        } else {
            requested.to_vec()
        };
        tracing::info!("homing axes {axes:?}");
        for kin_idx in 0..th.kin_count() {
            let group_axes: Vec<usize> = axes
                .iter()
                .copied()
                .filter(|a| th.kin(kin_idx).axes().contains(a))
                .collect();
            if group_axes.is_empty() {
                continue;
            }
            self.home_axes(th, kin_idx, &group_axes).await?;
        }
        Ok(())
    }

    async fn home_axes(&self, th: &mut Toolhead, kin_idx: usize, axes: &[usize]) -> Result<()> {
        let shutdown = th.shutdown_state();
        let mut homing = Homing::new();
        homing.set_axes(axes.to_vec());
        // Each axis is homed independently and in order.
        for &axis in axes {
            let result = self.home_axis(th, &mut homing, kin_idx, axis).await;
            if let Err(e) = result {
                if shutdown.is_shutdown() {
                    return Err(CommandError::Shutdown(
                        "Homing failed due to printer shutdown".to_string(),
                    ));
                }
                return Err(e);
            }
        }
        Ok(())
    }

    async fn home_axis(
        &self,
        th: &mut Toolhead,
        homing: &mut Homing,
        kin_idx: usize,
        axis: usize,
    ) -> Result<()> {
        let rail_idx = axis - th.kin(kin_idx).group_offset();
        let handle = RailHandle::Kin {
            kin: kin_idx,
            rail: rail_idx,
        };
        let (hi, (position_min, position_max)) = rail_homing_info(th, handle)?;
        let axis_count = th.axis_count();
        let mut homepos: Vec<Option<f64>> = vec![None; axis_count + 1];
        homepos[axis] = Some(hi.position_endstop);
        let mut forcepos = homepos.clone();
        if hi.positive_dir {
            forcepos[axis] = Some(hi.position_endstop - 1.5 * (hi.position_endstop - position_min));
        } else {
            forcepos[axis] = Some(hi.position_endstop + 1.5 * (position_max - hi.position_endstop));
        }
        self.home_rails(th, homing, &[handle], forcepos, homepos)
            .await
    }

    /// HOME_EXTRUDER: home the extruder's own rail along the extruder slot.
    pub async fn home_extruder(&self, th: &mut Toolhead) -> Result<()> {
        let axis = th.axis_count();
        let handle = RailHandle::Extruder;
        let (hi, (position_min, position_max)) = rail_homing_info(th, handle)?;
        let mut homepos: Vec<Option<f64>> = vec![None; axis + 1];
        homepos[axis] = Some(hi.position_endstop);
        let mut forcepos = homepos.clone();
        if hi.positive_dir {
            forcepos[axis] = Some(hi.position_endstop - 1.5 * (hi.position_endstop - position_min));
        } else {
            forcepos[axis] = Some(hi.position_endstop + 1.5 * (position_max - hi.position_endstop));
        }
        let shutdown = th.shutdown_state();
        let mut homing = Homing::new();
        homing.set_axes(vec![axis]);
        th.set_extruder_homing(true);
        let result = self
            .home_rails(th, &mut homing, &[handle], forcepos, homepos)
            .await;
        th.set_extruder_homing(false);
        match result {
            Ok(()) => Ok(()),
            Err(_) if shutdown.is_shutdown() => Err(CommandError::Shutdown(
                "Homing failed due to printer shutdown".to_string(),
            )),
            Err(e) => Err(e),
        }
    }
}
