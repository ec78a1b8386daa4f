// src/toolhead.rs
//
// Coordinates everything that happens on the print clock: accepts moves,
// runs the look-ahead queue, feeds planned trapezoids to the kinematic
// groups and the extruder, drives step generation, and paces the host
// against the MCU's estimated print time.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{CommandError, Result, ShutdownState};
use crate::events::{Event, EventBus};
use crate::guard;
use crate::kinematics::{CartKinematics, Extruder};
use crate::mcu::Mcu;
use crate::motion::{Move, MoveQueue, PlannerLimits};
use crate::reactor::{Completion, Reactor, NEVER};
use crate::stepper::Stepper;

/// Granularity of print-time advancement.
pub const MOVE_BATCH_TIME: f64 = 0.500;
/// Max print-time slice released per drip iteration.
pub const DRIP_SEGMENT_TIME: f64 = 0.050;
/// Margin between print time and estimated MCU time while dripping.
pub const DRIP_TIME: f64 = 0.100;
/// Step+dir+step filter window baseline.
pub const SDS_CHECK_TIME: f64 = 0.001;
/// Minimum lead time when resyncing to the MCU clock.
pub const MIN_KIN_TIME: f64 = 0.100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuingState {
    /// Steady pipelined execution; stall detection active.
    Main,
    /// Just left an idle gap; a flush is scheduled shortly.
    Priming,
    /// Queue drained; the next submission resyncs the print time.
    Flushed,
    /// Homing/probing; moves released in small gated time slices.
    Drip,
}

/// Explicit result of the drip pump (replaces an exception-as-signal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DripOutcome {
    MoveEnded,
    CompletionFired,
}

pub struct ToolheadStatus {
    pub print_time: f64,
    pub estimated_print_time: f64,
    pub position: Vec<f64>,
    pub homed_axes: String,
    pub max_velocity: f64,
    pub max_accel: f64,
    pub max_accel_to_decel: f64,
    pub square_corner_velocity: f64,
    pub stalls: u64,
    pub extruder: Option<String>,
}

pub struct Toolhead {
    reactor: Reactor,
    mcu: Arc<Mcu>,
    events: EventBus,
    shutdown: ShutdownState,
    axis_names: String,
    axis_count: usize,
    commanded_pos: Vec<f64>,
    kinematics: Vec<CartKinematics>,
    extruder: Option<Extruder>,
    move_queue: MoveQueue,
    step_generators: Vec<Arc<Mutex<Stepper>>>,
    // Velocity and acceleration control
    max_velocity: f64,
    max_accel: f64,
    requested_accel_to_decel: f64,
    max_accel_to_decel: f64,
    square_corner_velocity: f64,
    junction_deviation: f64,
    // Print time tracking
    buffer_time_low: f64,
    buffer_time_high: f64,
    buffer_time_start: f64,
    move_flush_time: f64,
    print_time: f64,
    queuing_state: QueuingState,
    need_check_stall: f64,
    flush_deadline: f64,
    idle_flush_print_time: f64,
    print_stall: u64,
    drip_completion: Option<Completion<()>>,
    can_pause: bool,
    /// Set while the extruder rail is being homed: extrusion checks do not
    /// apply to homing motion.
    extruder_homing: bool,
    // Kinematic step generation scan window tracking
    kin_flush_delay: f64,
    kin_flush_times: Vec<f64>,
    force_flush_time: f64,
    last_kin_move_time: f64,
}

impl Toolhead {
    pub fn new(
        config: &crate::config::Config,
        mcu: Arc<Mcu>,
        reactor: Reactor,
        events: EventBus,
        shutdown: ShutdownState,
    ) -> Result<Self> {
        let axis_names = config.printer.axis.clone();
        let axis_count = axis_names.len();
        tracing::info!("toolhead setup with axes {axis_names}");

        let mut kinematics = Vec::new();
        kinematics.push(CartKinematics::new(
            "XYZ",
            0,
            config,
            mcu.clone(),
            events.clone(),
        )?);
        if axis_count == 6 {
            kinematics.push(CartKinematics::new(
                "ABC",
                3,
                config,
                mcu.clone(),
                events.clone(),
            )?);
        }

        let extruder = match &config.extruder {
            Some(cfg) => Some(Extruder::new(
                "extruder",
                cfg,
                axis_count,
                config.printer.max_velocity,
                config.printer.max_accel,
                crate::kinematics::HeaterHandle::new(),
                mcu.clone(),
                events.clone(),
            )?),
            None => None,
        };

        let mut step_generators: Vec<Arc<Mutex<Stepper>>> = Vec::new();
        for kin in &kinematics {
            step_generators.extend(kin.get_steppers());
        }
        let mut kin_flush_times = Vec::new();
        if let Some(e) = &extruder {
            step_generators.push(e.stepper());
            let scan = e.scan_time();
            if scan > 0.0 {
                kin_flush_times.push(scan);
            }
        }
        let kin_flush_delay = kin_flush_times
            .iter()
            .fold(SDS_CHECK_TIME, |acc: f64, t| acc.max(*t));

        let max_accel = config.printer.max_accel;
        let requested_accel_to_decel =
            config.printer.max_accel_to_decel.unwrap_or(max_accel * 0.5);
        let mut move_queue = MoveQueue::new();
        move_queue.set_flush_time(config.printer.buffer_time_high);

        let mut toolhead = Self {
            reactor,
            mcu,
            events,
            shutdown,
            axis_names,
            axis_count,
            commanded_pos: vec![0.0; axis_count + 1],
            kinematics,
            extruder,
            move_queue,
            step_generators,
            max_velocity: config.printer.max_velocity,
            max_accel,
            requested_accel_to_decel,
            max_accel_to_decel: requested_accel_to_decel,
            square_corner_velocity: config.printer.square_corner_velocity,
            junction_deviation: 0.0,
            buffer_time_low: config.printer.buffer_time_low,
            buffer_time_high: config.printer.buffer_time_high,
            buffer_time_start: config.printer.buffer_time_start,
            move_flush_time: config.printer.move_flush_time,
            print_time: 0.0,
            queuing_state: QueuingState::Flushed,
            need_check_stall: -1.0,
            flush_deadline: NEVER,
            idle_flush_print_time: 0.0,
            print_stall: 0,
            drip_completion: None,
            can_pause: true,
            extruder_homing: false,
            kin_flush_delay,
            kin_flush_times,
            force_flush_time: 0.0,
            last_kin_move_time: 0.0,
        };
        toolhead.calc_junction_deviation();
        Ok(toolhead)
    }

    // -- accessors --

    pub fn axis_count(&self) -> usize {
        self.axis_count
    }

    pub fn axis_names(&self) -> &str {
        &self.axis_names
    }

    pub fn reactor(&self) -> Reactor {
        self.reactor.clone()
    }

    pub fn mcu(&self) -> Arc<Mcu> {
        self.mcu.clone()
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.shutdown.clone()
    }

    pub fn print_time(&self) -> f64 {
        self.print_time
    }

    pub fn queuing_state(&self) -> QueuingState {
        self.queuing_state
    }

    pub fn print_stall_count(&self) -> u64 {
        self.print_stall
    }

    pub fn lookahead_len(&self) -> usize {
        self.move_queue.len()
    }

    pub fn get_position(&self) -> Vec<f64> {
        self.commanded_pos.clone()
    }

    pub fn get_max_velocity(&self) -> (f64, f64) {
        (self.max_velocity, self.max_accel)
    }

    pub fn kin_count(&self) -> usize {
        self.kinematics.len()
    }

    pub fn kin(&self, idx: usize) -> &CartKinematics {
        &self.kinematics[idx]
    }

    pub fn kin_mut(&mut self, idx: usize) -> &mut CartKinematics {
        &mut self.kinematics[idx]
    }

    pub fn kinematics(&self) -> &[CartKinematics] {
        &self.kinematics
    }

    pub fn extruder(&self) -> Option<&Extruder> {
        self.extruder.as_ref()
    }

    pub fn extruder_mut(&mut self) -> Option<&mut Extruder> {
        self.extruder.as_mut()
    }

    /// Kinematic group and rail index owning a global axis id.
    pub fn lookup_rail(&self, axis: usize) -> Option<(usize, usize)> {
        for (k, kin) in self.kinematics.iter().enumerate() {
            if kin.axes().contains(&axis) {
                return Some((k, axis - kin.group_offset()));
            }
        }
        None
    }

    /// Every stepper homing needs to snapshot: kinematic groups plus the
    /// extruder's stepper.
    pub fn kin_steppers(&self) -> Vec<Arc<Mutex<Stepper>>> {
        let mut steppers: Vec<Arc<Mutex<Stepper>>> = Vec::new();
        for kin in &self.kinematics {
            steppers.extend(kin.get_steppers());
        }
        if let Some(e) = &self.extruder {
            steppers.push(e.stepper());
        }
        steppers
    }

    fn planner_limits(&self) -> PlannerLimits {
        PlannerLimits {
            max_velocity: self.max_velocity,
            max_accel: self.max_accel,
            max_accel_to_decel: self.max_accel_to_decel,
            junction_deviation: self.junction_deviation,
            axis_count: self.axis_count,
        }
    }

    fn calc_junction_deviation(&mut self) {
        let scv2 = self.square_corner_velocity * self.square_corner_velocity;
        self.junction_deviation = scv2 * (2f64.sqrt() - 1.0) / self.max_accel;
        self.max_accel_to_decel = self.requested_accel_to_decel.min(self.max_accel);
    }

    // -- print time tracking --

    fn update_move_time(&mut self, next_print_time: f64) -> Result<()> {
        let next_print_time = next_print_time.max(self.print_time);
        let kin_flush_delay = self.kin_flush_delay;
        let fft = self.force_flush_time;
        loop {
            self.print_time = (self.print_time + MOVE_BATCH_TIME).min(next_print_time);
            let sg_flush_time = fft.max(self.print_time - kin_flush_delay);
            for stepper in &self.step_generators {
                guard(stepper).generate_steps(sg_flush_time)?;
            }
            let free_time = fft.max(sg_flush_time - kin_flush_delay);
            for kin in &self.kinematics {
                let tq = kin.trapq();
                guard(&tq).finalize_moves(free_time);
            }
            if let Some(e) = &self.extruder {
                e.update_move_time(free_time);
            }
            let mcu_flush_time = fft.max(sg_flush_time - self.move_flush_time);
            self.mcu.flush_moves(mcu_flush_time)?;
            if self.print_time >= next_print_time {
                break;
            }
        }
        Ok(())
    }

    /// Resync the print time to the MCU clock when leaving a special state.
    fn calc_print_time(&mut self) {
        let curtime = self.reactor.monotonic();
        let est_print_time = self.mcu.estimated_print_time(curtime);
        let kin_time =
            (est_print_time + MIN_KIN_TIME).max(self.force_flush_time) + self.kin_flush_delay;
        let min_print_time = (est_print_time + self.buffer_time_start).max(kin_time);
        if min_print_time > self.print_time {
            self.print_time = min_print_time;
            tracing::debug!(
                "sync print time: est={est_print_time:.4} print_time={:.4}",
                self.print_time
            );
            self.events.send(Event::SyncPrintTime {
                eventtime: curtime,
                est_print_time,
                print_time: self.print_time,
            });
        }
    }

    fn append_to_trapqs(&mut self, m: &Move, next_move_time: f64) {
        if m.is_kinematic_move {
            for kin in &self.kinematics {
                let go = kin.group_offset();
                let tq = kin.trapq();
                guard(&tq).append(
                    next_move_time,
                    m.accel_t,
                    m.cruise_t,
                    m.decel_t,
                    [m.start_pos[go], m.start_pos[go + 1], m.start_pos[go + 2]],
                    [m.axes_r[go], m.axes_r[go + 1], m.axes_r[go + 2]],
                    m.start_v,
                    m.cruise_v,
                    m.accel,
                );
            }
        }
        if m.axes_d[self.axis_count] != 0.0 {
            if let Some(e) = self.extruder.as_mut() {
                e.queue_move(next_move_time, m);
            }
        }
    }

    fn process_moves_sync(&mut self, moves: Vec<Move>) -> Result<()> {
        debug_assert!(self.queuing_state != QueuingState::Drip);
        if self.queuing_state != QueuingState::Main {
            self.queuing_state = QueuingState::Main;
            self.need_check_stall = -1.0;
            self.flush_deadline = self.reactor.monotonic();
            self.calc_print_time();
        }
        let mut next_move_time = self.print_time;
        for mut m in moves {
            self.append_to_trapqs(&m, next_move_time);
            next_move_time += m.total_time();
            for cb in m.timing_callbacks.drain(..) {
                cb(next_move_time);
            }
        }
        self.update_move_time(next_move_time)?;
        self.last_kin_move_time = self.last_kin_move_time.max(next_move_time);
        Ok(())
    }

    async fn process_moves_drip(&mut self, moves: Vec<Move>) -> Result<DripOutcome> {
        self.calc_print_time();
        let mut next_move_time = self.print_time;
        for mut m in moves {
            self.append_to_trapqs(&m, next_move_time);
            next_move_time += m.total_time();
            for cb in m.timing_callbacks.drain(..) {
                cb(next_move_time);
            }
        }
        let outcome = self.update_drip_move_time(next_move_time).await?;
        if outcome == DripOutcome::MoveEnded {
            self.update_move_time(next_move_time)?;
            self.last_kin_move_time = self.last_kin_move_time.max(next_move_time);
        }
        Ok(outcome)
    }

    fn flush_lookahead_sync(&mut self) -> Result<()> {
        let moves = self.move_queue.flush(false);
        if !moves.is_empty() {
            self.process_moves_sync(moves)?;
        }
        Ok(())
    }

    /// Drain the look-ahead queue and step generation, returning to the
    /// Flushed state.
    pub fn flush_step_generation(&mut self) -> Result<()> {
        self.flush_lookahead_sync()?;
        self.queuing_state = QueuingState::Flushed;
        self.need_check_stall = -1.0;
        self.flush_deadline = NEVER;
        self.move_queue.set_flush_time(self.buffer_time_high);
        self.idle_flush_print_time = 0.0;
        // Flush the kinematic scan windows and the step buffers.
        let lastf = self.print_time - self.kin_flush_delay;
        let flush_time = lastf.max(self.last_kin_move_time + self.kin_flush_delay);
        if flush_time > self.print_time {
            self.update_move_time(flush_time)?;
        }
        self.force_flush_time = self.force_flush_time.max(flush_time);
        self.update_move_time(self.print_time.max(self.force_flush_time))?;
        Ok(())
    }

    fn flush_lookahead(&mut self) -> Result<()> {
        if self.queuing_state != QueuingState::Main {
            return self.flush_step_generation();
        }
        self.flush_lookahead_sync()
    }

    pub fn get_last_move_time(&mut self) -> Result<f64> {
        self.flush_lookahead()?;
        if self.queuing_state != QueuingState::Main {
            self.calc_print_time();
        }
        Ok(self.print_time)
    }

    /// Periodic idle flush, standing in for the reactor flush timer: call
    /// from the command loop; flushes once the buffered time runs low.
    pub fn run_pending_flush(&mut self) {
        let eventtime = self.reactor.monotonic();
        if eventtime < self.flush_deadline {
            return;
        }
        let print_time = self.print_time;
        let buffer_time = print_time - self.mcu.estimated_print_time(eventtime);
        if buffer_time > self.buffer_time_low {
            self.flush_deadline = eventtime + buffer_time - self.buffer_time_low;
            return;
        }
        if let Err(e) = self.flush_step_generation() {
            self.shutdown.invoke(format!("error in flush handler: {e}"));
            return;
        }
        if print_time != self.print_time {
            self.idle_flush_print_time = self.print_time;
        }
        self.flush_deadline = NEVER;
    }

    async fn check_stall(&mut self) -> Result<()> {
        let mut eventtime = self.reactor.monotonic();
        if self.queuing_state != QueuingState::Main {
            if self.idle_flush_print_time != 0.0 {
                // Was in "Flushed" state and got there from idle input.
                let est_print_time = self.mcu.estimated_print_time(eventtime);
                if est_print_time < self.idle_flush_print_time {
                    self.print_stall += 1;
                }
                self.idle_flush_print_time = 0.0;
            }
            self.queuing_state = QueuingState::Priming;
            self.need_check_stall = -1.0;
            self.flush_deadline = eventtime + 0.100;
        }
        let est_print_time;
        loop {
            let est = self.mcu.estimated_print_time(eventtime);
            let buffer_time = self.print_time - est;
            let stall_time = buffer_time - self.buffer_time_high;
            if stall_time <= 0.0 {
                est_print_time = est;
                break;
            }
            if !self.can_pause || self.shutdown.is_shutdown() {
                self.need_check_stall = NEVER;
                return Ok(());
            }
            eventtime = self.reactor.pause(eventtime + stall_time.min(1.0)).await;
        }
        if self.queuing_state == QueuingState::Main {
            // Defer the next check until the buffer could be high again.
            self.need_check_stall = est_print_time + self.buffer_time_high + 0.100;
        }
        Ok(())
    }

    // -- movement commands --

    /// Teleport the commanded position; limits become valid for any axis
    /// listed in `homing_axes`.
    pub fn set_position(&mut self, newpos: Vec<f64>, homing_axes: &[usize]) -> Result<()> {
        tracing::debug!("set_position {newpos:?} homing_axes={homing_axes:?}");
        self.flush_step_generation()?;
        for kin in &self.kinematics {
            let go = kin.group_offset();
            let tq = kin.trapq();
            guard(&tq).set_position(
                self.print_time,
                [newpos[go], newpos[go + 1], newpos[go + 2]],
            );
        }
        let print_time = self.print_time;
        let e_pos = newpos[self.axis_count];
        if let Some(e) = self.extruder.as_mut() {
            e.set_position(e_pos, print_time);
        }
        self.commanded_pos.clone_from(&newpos);
        for kin in &mut self.kinematics {
            kin.set_position(&newpos, homing_axes);
        }
        self.events.send(Event::SetPosition);
        Ok(())
    }

    fn create_checked_move(&mut self, newpos: Vec<f64>, speed: f64) -> Result<Option<Move>> {
        let mut m = Move::new(
            self.commanded_pos.clone(),
            newpos,
            speed,
            &self.planner_limits(),
        );
        if m.move_d == 0.0 {
            return Ok(None);
        }
        if m.is_kinematic_move {
            for kin in &self.kinematics {
                kin.check_move(&mut m)?;
            }
        }
        if m.axes_d[self.axis_count] != 0.0 && !self.extruder_homing {
            match self.extruder.as_ref() {
                Some(e) => e.check_move(&mut m, self.axis_count)?,
                None => {
                    return Err(CommandError::ExtrudeLimit(
                        "Extrude when no extruder present".to_string(),
                    ))
                }
            }
        }
        Ok(Some(m))
    }

    fn add_to_lookahead(&mut self, mut m: Move) -> Result<()> {
        if let Some(prev) = self.move_queue.last() {
            let extruder_v2 = match &self.extruder {
                Some(e) => e.calc_junction(prev, &m),
                None => m.max_cruise_v2,
            };
            m.calc_junction(prev, extruder_v2);
        }
        if self.move_queue.add_move(m) {
            let moves = self.move_queue.flush(true);
            if !moves.is_empty() {
                self.process_moves_sync(moves)?;
            }
        }
        Ok(())
    }

    /// Plan and enqueue a move to `newpos` at `speed` (mm/s).
    pub async fn move_to(&mut self, newpos: Vec<f64>, speed: f64) -> Result<()> {
        if self.shutdown.is_shutdown() {
            return Err(CommandError::Shutdown("Printer is shutdown".to_string()));
        }
        self.run_pending_flush();
        if let Some(m) = self.create_checked_move(newpos, speed)? {
            self.commanded_pos.clone_from(&m.end_pos);
            self.add_to_lookahead(m)?;
        }
        if self.print_time > self.need_check_stall {
            self.check_stall().await?;
        }
        Ok(())
    }

    /// Move with optional per-axis targets (None keeps the current value).
    pub async fn manual_move(&mut self, coord: &[Option<f64>], speed: f64) -> Result<()> {
        let mut curpos = self.commanded_pos.clone();
        for (i, value) in coord.iter().enumerate() {
            if let Some(v) = value {
                curpos[i] = *v;
            }
        }
        self.move_to(curpos, speed).await?;
        self.events.send(Event::ManualMove);
        Ok(())
    }

    pub async fn dwell(&mut self, delay: f64) -> Result<()> {
        let next_print_time = self.get_last_move_time()? + delay.max(0.0);
        self.update_move_time(next_print_time)?;
        self.check_stall().await
    }

    /// Block until all queued motion has executed on the MCU.
    pub async fn wait_moves(&mut self) -> Result<()> {
        self.flush_lookahead()?;
        let mut eventtime = self.reactor.monotonic();
        while self.queuing_state == QueuingState::Main
            || self.print_time >= self.mcu.estimated_print_time(eventtime)
        {
            if !self.can_pause || self.shutdown.is_shutdown() {
                break;
            }
            eventtime = self.reactor.pause(eventtime + 0.100).await;
            // Stand-in for the reactor flush timer: drain the pipeline once
            // the buffered time runs low so the wait can finish.
            self.run_pending_flush();
        }
        Ok(())
    }

    // -- homing drip moves --

    async fn update_drip_move_time(&mut self, next_print_time: f64) -> Result<DripOutcome> {
        let completion = match &self.drip_completion {
            Some(c) => c.clone(),
            None => return Ok(DripOutcome::MoveEnded),
        };
        let flush_delay = DRIP_TIME + self.move_flush_time + self.kin_flush_delay;
        while self.print_time < next_print_time {
            if self.shutdown.is_shutdown() {
                return Err(CommandError::Shutdown("Printer is shutdown".to_string()));
            }
            if completion.test() {
                return Ok(DripOutcome::CompletionFired);
            }
            let curtime = self.reactor.monotonic();
            let est_print_time = self.mcu.estimated_print_time(curtime);
            let wait_time = self.print_time - est_print_time - flush_delay;
            if wait_time > 0.0 && self.can_pause {
                // Pause before sending more steps.
                let _ = completion
                    .wait_until(&self.reactor, curtime + wait_time)
                    .await;
                continue;
            }
            let npt = (self.print_time + DRIP_SEGMENT_TIME).min(next_print_time);
            self.update_move_time(npt)?;
        }
        Ok(DripOutcome::MoveEnded)
    }

    /// Run one move in drip mode: print time is released in small slices
    /// gated by `completion` so an endstop event can truncate the move.
    pub async fn drip_move(
        &mut self,
        newpos: Vec<f64>,
        speed: f64,
        completion: Completion<()>,
    ) -> Result<()> {
        self.dwell(self.kin_flush_delay).await?;
        self.flush_lookahead_sync()?;
        self.queuing_state = QueuingState::Drip;
        self.need_check_stall = NEVER;
        self.flush_deadline = NEVER;
        self.move_queue.set_flush_time(self.buffer_time_high);
        self.idle_flush_print_time = 0.0;
        self.drip_completion = Some(completion);

        let m = match self.create_checked_move(newpos, speed) {
            Ok(m) => m,
            Err(e) => {
                self.drip_completion = None;
                self.flush_step_generation()?;
                return Err(e);
            }
        };
        let mut outcome = DripOutcome::MoveEnded;
        if let Some(m) = m {
            self.commanded_pos.clone_from(&m.end_pos);
            self.add_to_lookahead(m)?;
            let moves = self.move_queue.flush(false);
            if !moves.is_empty() {
                match self.process_moves_drip(moves).await {
                    Ok(o) => outcome = o,
                    Err(e) => {
                        self.drip_completion = None;
                        self.move_queue.reset();
                        self.flush_step_generation()?;
                        return Err(e);
                    }
                }
            }
        }
        if outcome == DripOutcome::CompletionFired {
            tracing::debug!("drip move interrupted; purging pending motion");
            self.move_queue.reset();
            for kin in &self.kinematics {
                let tq = kin.trapq();
                guard(&tq).finalize_moves(NEVER);
            }
            if let Some(e) = &self.extruder {
                e.update_move_time(NEVER);
            }
        }
        self.drip_completion = None;
        self.flush_step_generation()
    }

    // -- callbacks and bookkeeping --

    pub fn register_lookahead_callback(
        &mut self,
        callback: Box<dyn FnOnce(f64) + Send>,
    ) -> Result<()> {
        match self.move_queue.last_mut() {
            Some(last) => {
                last.timing_callbacks.push(callback);
                Ok(())
            }
            None => {
                let time = self.get_last_move_time()?;
                callback(time);
                Ok(())
            }
        }
    }

    pub fn note_kinematic_activity(&mut self, kin_time: f64) {
        self.last_kin_move_time = self.last_kin_move_time.max(kin_time);
    }

    pub(crate) fn set_extruder_homing(&mut self, homing: bool) {
        self.extruder_homing = homing;
    }

    /// Track the widest kinematic scan window of any attached stepper.
    pub fn note_step_generation_scan_time(&mut self, delay: f64, old_delay: f64) -> Result<()> {
        self.flush_step_generation()?;
        if old_delay != 0.0 {
            if let Some(pos) = self.kin_flush_times.iter().position(|t| *t == old_delay) {
                self.kin_flush_times.remove(pos);
            }
        }
        if delay != 0.0 {
            self.kin_flush_times.push(delay);
        }
        self.kin_flush_delay = self
            .kin_flush_times
            .iter()
            .fold(SDS_CHECK_TIME, |acc: f64, t| acc.max(*t));
        Ok(())
    }

    // -- limit adjustment (SET_VELOCITY_LIMIT / M204) --

    pub fn set_velocity_limit(
        &mut self,
        max_velocity: Option<f64>,
        max_accel: Option<f64>,
        square_corner_velocity: Option<f64>,
        accel_to_decel: Option<f64>,
    ) -> String {
        if let Some(v) = max_velocity {
            self.max_velocity = v;
        }
        if let Some(a) = max_accel {
            self.max_accel = a;
        }
        if let Some(scv) = square_corner_velocity {
            self.square_corner_velocity = scv;
        }
        if let Some(atd) = accel_to_decel {
            self.requested_accel_to_decel = atd;
        }
        self.calc_junction_deviation();
        format!(
            "max_velocity: {:.6}\nmax_accel: {:.6}\nmax_accel_to_decel: {:.6}\nsquare_corner_velocity: {:.6}",
            self.max_velocity,
            self.max_accel,
            self.requested_accel_to_decel,
            self.square_corner_velocity
        )
    }

    pub fn set_max_accel(&mut self, accel: f64) {
        self.max_accel = accel;
        self.calc_junction_deviation();
    }

    // -- status --

    pub fn get_status(&self, eventtime: f64) -> ToolheadStatus {
        let homed_axes = self
            .kinematics
            .iter()
            .map(|k| k.homed_axes())
            .collect::<Vec<_>>()
            .join("");
        ToolheadStatus {
            print_time: self.print_time,
            estimated_print_time: self.mcu.estimated_print_time(eventtime),
            position: self.commanded_pos.clone(),
            homed_axes,
            max_velocity: self.max_velocity,
            max_accel: self.max_accel,
            max_accel_to_decel: self.requested_accel_to_decel,
            square_corner_velocity: self.square_corner_velocity,
            stalls: self.print_stall,
            extruder: self.extruder.as_ref().map(|e| e.name().to_string()),
        }
    }

    pub fn stats(&self, eventtime: f64) -> (bool, String) {
        let mut buffer_time = self.print_time - self.mcu.estimated_print_time(eventtime);
        let is_active = buffer_time > -60.0 || self.queuing_state == QueuingState::Main;
        if self.queuing_state == QueuingState::Drip {
            buffer_time = 0.0;
        }
        (
            is_active,
            format!(
                "print_time={:.3} buffer_time={:.3} print_stall={}",
                self.print_time,
                buffer_time.max(0.0),
                self.print_stall
            ),
        )
    }

    /// Toolhead cartesian position reconstructed from stepper positions
    /// (`kin_spos`) adjusted by per-stepper step offsets.
    pub fn calc_toolhead_pos(
        &self,
        kin_spos: &HashMap<String, f64>,
        offsets: &HashMap<String, i64>,
    ) -> Vec<f64> {
        let mut spos = kin_spos.clone();
        for stepper in self.kin_steppers() {
            let stepper = guard(&stepper);
            if let Some(value) = spos.get_mut(stepper.name()) {
                *value +=
                    offsets.get(stepper.name()).copied().unwrap_or(0) as f64 * stepper.step_dist();
            }
        }
        let mut result: Vec<f64> = Vec::with_capacity(self.axis_count + 1);
        for kin in &self.kinematics {
            result.extend(kin.calc_position(&spos));
        }
        match &self.extruder {
            Some(e) => result.push(e.calc_position(&spos)),
            None => result.push(self.commanded_pos[self.axis_count]),
        }
        result
    }
}
