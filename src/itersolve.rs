// src/itersolve.rs
//
// Converts the trapq's position-vs-time function into integer step times.
// The generator guesses a time for the next step, evaluates the kinematic
// position there, and refines with the secant method (falling back to
// bisection once a bracket exists). Direction reversals move the target by
// a full step and restart the bracket.
use crate::stepcompress::{Result as StepResult, StepCompress};
use crate::trapq::{TrapSegment, Trapq};

const SEEK_TIME_RESET: f64 = 0.000_100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AxisFlags(u8);

impl AxisFlags {
    pub const fn none() -> Self {
        Self(0)
    }

    pub const fn axis(idx: usize) -> Self {
        Self(1 << (idx as u8))
    }

    pub const fn has(self, idx: usize) -> bool {
        self.0 & (1 << (idx as u8)) != 0
    }
}

/// Kinematic position function for one stepper.
pub trait SolverKinematics: Send {
    /// Stepper coordinate at `move_time` within the segment.
    fn position(&self, seg: &TrapSegment, move_time: f64) -> f64;
    /// Axes whose motion moves this stepper.
    fn active_axes(&self) -> AxisFlags;
}

/// Cartesian stepper: follows one axis of its group directly.
pub struct CartesianSolver {
    axis: usize,
}

impl CartesianSolver {
    pub fn new(axis: usize) -> Self {
        Self { axis }
    }
}

impl SolverKinematics for CartesianSolver {
    fn position(&self, seg: &TrapSegment, move_time: f64) -> f64 {
        seg.start_pos[self.axis] + seg.axes_r[self.axis] * seg.dist_at(move_time)
    }

    fn active_axes(&self) -> AxisFlags {
        AxisFlags::axis(self.axis)
    }
}

/// Extruder stepper. The segment's second ratio slot carries the
/// pressure-advance enable flag set by the extruder when queueing the move.
pub struct ExtruderSolver {
    pub pressure_advance: f64,
}

impl SolverKinematics for ExtruderSolver {
    fn position(&self, seg: &TrapSegment, move_time: f64) -> f64 {
        let mut pos = seg.start_pos[0] + seg.axes_r[0] * seg.dist_at(move_time);
        if seg.axes_r[1] != 0.0 && self.pressure_advance != 0.0 {
            let velocity = seg.start_v + 2.0 * seg.half_accel * move_time;
            pos += self.pressure_advance * velocity;
        }
        pos
    }

    fn active_axes(&self) -> AxisFlags {
        AxisFlags::axis(0)
    }
}

#[derive(Clone, Copy)]
struct Guess {
    time: f64,
    pos: f64,
}

/// Per-stepper step generation state. Generation is idempotent: each call
/// resumes at the previous flush time.
pub struct StepGenerator {
    step_dist: f64,
    commanded_pos: f64,
    last_flush_time: f64,
    last_move_time: f64,
    pre_active: f64,
    post_active: f64,
    solver: Box<dyn SolverKinematics>,
}

impl StepGenerator {
    pub fn new(step_dist: f64, solver: Box<dyn SolverKinematics>) -> Self {
        Self {
            step_dist,
            commanded_pos: 0.0,
            last_flush_time: 0.0,
            last_move_time: 0.0,
            pre_active: 0.0,
            post_active: 0.0,
            solver,
        }
    }

    pub fn step_dist(&self) -> f64 {
        self.step_dist
    }

    pub fn set_step_dist(&mut self, step_dist: f64) {
        self.step_dist = step_dist;
    }

    /// Widen the generation window around active segments (pressure advance
    /// smoothing needs steps slightly before and after axis activity).
    pub fn set_scan_windows(&mut self, pre_active: f64, post_active: f64) {
        self.pre_active = pre_active;
        self.post_active = post_active;
    }

    pub fn commanded_pos(&self) -> f64 {
        self.commanded_pos
    }

    pub fn calc_position_from_coord(&self, coord: [f64; 3]) -> f64 {
        // Probe the position function with a synthetic stationary segment.
        let seg = TrapSegment {
            print_time: 0.0,
            move_t: 1000.0,
            start_v: 0.0,
            half_accel: 0.0,
            start_pos: coord,
            axes_r: [0.0; 3],
        };
        self.solver.position(&seg, 500.0)
    }

    pub fn set_position(&mut self, coord: [f64; 3]) {
        self.commanded_pos = self.calc_position_from_coord(coord);
    }

    pub fn is_active_axis(&self, axis: char) -> bool {
        let flags = self.solver.active_axes();
        match axis.to_ascii_lowercase() {
            'x' => flags.has(0),
            'y' => flags.has(1),
            'z' => flags.has(2),
            _ => false,
        }
    }

    fn segment_moves_stepper(&self, seg: &TrapSegment) -> bool {
        let flags = self.solver.active_axes();
        (flags.has(0) && seg.axes_r[0] != 0.0)
            || (flags.has(1) && seg.axes_r[1] != 0.0)
            || (flags.has(2) && seg.axes_r[2] != 0.0)
    }

    /// First print time at which this stepper becomes active, if any,
    /// scanning segments not yet flushed.
    pub fn check_active(&self, tq: &Trapq, flush_time: f64) -> Option<f64> {
        let mut idx = 0;
        let segs = tq.segments();
        while idx < segs.len() {
            if self.last_flush_time < segs[idx].end_time() {
                break;
            }
            idx += 1;
        }
        while idx < segs.len() {
            let seg = &segs[idx];
            if self.segment_moves_stepper(seg) {
                return Some(seg.print_time);
            }
            if flush_time <= seg.end_time() {
                return None;
            }
            idx += 1;
        }
        None
    }

    /// Generate step times for all trapq segments up to `flush_time`.
    pub fn generate_steps(
        &mut self,
        sc: &mut StepCompress,
        tq: &Trapq,
        flush_time: f64,
    ) -> StepResult<()> {
        let last_flush_time = self.last_flush_time;
        self.last_flush_time = flush_time;

        let segs: Vec<TrapSegment> = tq.segments().iter().copied().collect();
        if segs.is_empty() {
            return Ok(());
        }

        let mut idx = 0;
        while idx < segs.len() && last_flush_time >= segs[idx].end_time() {
            idx += 1;
        }
        if idx >= segs.len() {
            return Ok(());
        }

        let mut force_steps_time = self.last_move_time + self.post_active;
        let mut skipped = 0usize;

        while idx < segs.len() {
            let seg = segs[idx];
            let seg_end = seg.end_time();

            if self.segment_moves_stepper(&seg) {
                if skipped > 0 && self.pre_active > 0.0 {
                    // Generate the lead-in steps for previously skipped
                    // segments inside the pre-active window.
                    let mut lead_start = seg.print_time - self.pre_active;
                    lead_start = lead_start.max(last_flush_time).max(force_steps_time);
                    let mut back = idx;
                    while skipped > 0 && back > 0 {
                        back -= 1;
                        if segs[back].print_time <= lead_start {
                            back += 1;
                            break;
                        }
                        skipped -= 1;
                    }
                    while back < idx {
                        self.generate_range(sc, &segs[back], lead_start, flush_time)?;
                        back += 1;
                    }
                }

                self.generate_range(sc, &seg, last_flush_time, flush_time)?;
                if seg_end >= flush_time {
                    self.last_move_time = flush_time;
                    return Ok(());
                }
                skipped = 0;
                self.last_move_time = seg_end;
                force_steps_time = self.last_move_time + self.post_active;
            } else {
                if seg.print_time < force_steps_time {
                    // Trail out just past the last activity.
                    let tail_end = force_steps_time.min(flush_time);
                    self.generate_range(sc, &seg, last_flush_time, tail_end)?;
                    skipped = 1;
                } else {
                    skipped += 1;
                }
                if flush_time + self.pre_active <= seg_end {
                    return Ok(());
                }
            }
            idx += 1;
        }
        Ok(())
    }

    /// Emit steps for one segment between absolute times, via secant search.
    fn generate_range(
        &mut self,
        sc: &mut StepCompress,
        seg: &TrapSegment,
        abs_start: f64,
        abs_end: f64,
    ) -> StepResult<()> {
        let half_step = 0.5 * self.step_dist;
        let start = (abs_start - seg.print_time).max(0.0);
        let end = (abs_end - seg.print_time).min(seg.move_t);
        if end <= start {
            return Ok(());
        }

        let mut old_guess = Guess {
            time: start,
            pos: self.commanded_pos,
        };
        let mut guess = old_guess;
        let mut dir = sc.last_dir();
        let mut dir_changed = false;
        let mut have_bracket = false;
        let mut check_oscillate = false;
        let mut target = self.commanded_pos + if dir { half_step } else { -half_step };
        let mut last_time = start;
        let mut low_time = start;
        let mut high_time = (start + SEEK_TIME_RESET).min(end);

        loop {
            // Secant step from the previous two evaluations.
            let guess_dist = guess.pos - target;
            let old_dist = old_guess.pos - target;
            let mut next_time =
                (old_guess.time * guess_dist - guess.time * old_dist) / (guess_dist - old_dist);

            if !(next_time > low_time && next_time < high_time) {
                if have_bracket {
                    // Poor guess; bisect the bracket instead.
                    next_time = (low_time + high_time) * 0.5;
                    check_oscillate = false;
                } else if guess.time >= end {
                    // No further steps inside the requested range.
                    break;
                } else {
                    // Expand the search window exponentially.
                    next_time = high_time;
                    high_time = (2.0 * high_time - last_time).min(end);
                }
            }

            old_guess = guess;
            guess.time = next_time;
            guess.pos = self.solver.position(seg, next_time);
            let guess_dist = guess.pos - target;

            if guess_dist.abs() > 1e-9 {
                let rel_dist = if dir { guess_dist } else { -guess_dist };
                if rel_dist > 0.0 {
                    // Past the target: a step definitely lies in the bracket.
                    if have_bracket && old_guess.time <= low_time {
                        if check_oscillate {
                            old_guess = guess;
                        }
                        check_oscillate = true;
                    }
                    high_time = guess.time;
                    have_bracket = true;
                } else if rel_dist < -(self.step_dist + 1e-8) {
                    // Position moved a full step the other way: reversal.
                    dir = !dir;
                    target += if dir {
                        self.step_dist
                    } else {
                        -self.step_dist
                    };
                    low_time = last_time;
                    high_time = guess.time;
                    dir_changed = true;
                    have_bracket = true;
                    check_oscillate = false;
                } else {
                    low_time = guess.time;
                }

                if !have_bracket || high_time - low_time > 1e-9 {
                    if !dir_changed && rel_dist >= -half_step {
                        // Step fully reached; protect it from rollback.
                        sc.commit()?;
                    }
                    continue;
                }
            }

            // Converged on the next step time.
            sc.append(dir, seg.print_time, guess.time)?;
            target += if dir {
                self.step_dist
            } else {
                -self.step_dist
            };

            let mut seek_delta = 1.5 * (guess.time - last_time);
            if seek_delta < 1e-9 {
                seek_delta = 1e-9;
            }
            if dir_changed && seek_delta > SEEK_TIME_RESET {
                seek_delta = SEEK_TIME_RESET;
            }
            last_time = guess.time;
            low_time = guess.time;
            high_time = (guess.time + seek_delta).min(end);
            dir_changed = false;
            have_bracket = false;
            check_oscillate = false;
        }

        self.commanded_pos = target - if dir { half_step } else { -half_step };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcu::{EndstopArm, EndstopState, McuCommand, McuTransport};
    use crate::reactor::Completion;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingLink {
        commands: Mutex<Vec<McuCommand>>,
    }

    impl RecordingLink {
        fn commands(&self) -> Vec<McuCommand> {
            self.commands
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        }
    }

    impl McuTransport for RecordingLink {
        fn send(&self, cmd: McuCommand) {
            self.commands
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(cmd);
        }
        fn query_stepper_position(&self, _oid: u32) -> i64 {
            0
        }
        fn arm_endstop(&self, _arm: EndstopArm, _completion: Completion<bool>) {}
        fn stop_endstop(&self, _oid: u32) -> EndstopState {
            EndstopState::NotTriggered
        }
        fn register_endstop_stepper(&self, _endstop_oid: u32, _stepper_oid: u32) {}
    }

    fn step_counts(commands: &[McuCommand]) -> (u32, u32) {
        let mut steps = 0u32;
        let mut dir_changes = 0u32;
        for cmd in commands {
            match cmd {
                McuCommand::QueueStep { count, .. } => steps += *count as u32,
                McuCommand::SetNextStepDir { .. } => dir_changes += 1,
                _ => {}
            }
        }
        (steps, dir_changes)
    }

    #[test]
    fn linear_move_emits_expected_step_count() {
        let link = Arc::new(RecordingLink::default());
        let mut sc = StepCompress::new(0, 1000, link.clone());
        sc.set_time(0.0, 1_000_000.0);
        let mut gen = StepGenerator::new(0.1, Box::new(CartesianSolver::new(0)));

        let mut tq = Trapq::new();
        // 10mm/s cruise for 1s: 10mm of travel at 0.1mm/step.
        tq.append(
            0.0,
            0.0,
            1.0,
            0.0,
            [0.0; 3],
            [1.0, 0.0, 0.0],
            10.0,
            10.0,
            0.0,
        );
        gen.generate_steps(&mut sc, &tq, 2.0).expect("generate");
        sc.flush(u64::MAX).expect("flush");
        let (steps, _) = step_counts(&link.commands());
        assert!((99..=100).contains(&steps), "got {steps} steps");
        assert!((gen.commanded_pos() - 10.0).abs() < 0.1 + 1e-9);
    }

    #[test]
    fn inactive_axis_generates_nothing() {
        let link = Arc::new(RecordingLink::default());
        let mut sc = StepCompress::new(0, 1000, link.clone());
        sc.set_time(0.0, 1_000_000.0);
        let mut gen = StepGenerator::new(0.1, Box::new(CartesianSolver::new(1)));

        let mut tq = Trapq::new();
        tq.append(
            0.0,
            0.5,
            0.5,
            0.5,
            [0.0; 3],
            [10.0, 0.0, 0.0],
            0.0,
            10.0,
            20.0,
        );
        gen.generate_steps(&mut sc, &tq, 2.0).expect("generate");
        sc.flush(u64::MAX).expect("flush");
        assert!(link.commands().is_empty());
    }

    #[test]
    fn reversal_emits_direction_change() {
        let link = Arc::new(RecordingLink::default());
        let mut sc = StepCompress::new(0, 1000, link.clone());
        sc.set_time(0.0, 1_000_000.0);
        let mut gen = StepGenerator::new(0.1, Box::new(CartesianSolver::new(0)));

        let mut tq = Trapq::new();
        // Out at 10mm/s then back: decelerate through zero.
        tq.append(
            0.0,
            0.0,
            0.5,
            0.0,
            [0.0; 3],
            [1.0, 0.0, 0.0],
            10.0,
            10.0,
            0.0,
        );
        tq.append(
            0.5,
            0.0,
            0.5,
            0.0,
            [5.0, 0.0, 0.0],
            [-1.0, 0.0, 0.0],
            10.0,
            10.0,
            0.0,
        );
        gen.generate_steps(&mut sc, &tq, 2.0).expect("generate");
        sc.flush(u64::MAX).expect("flush");
        let (steps, dir_changes) = step_counts(&link.commands());
        assert!(steps >= 98, "got {steps} steps");
        assert!(dir_changes >= 2, "got {dir_changes} direction changes");
        assert!(gen.commanded_pos().abs() < 0.2);
    }

    #[test]
    fn generation_is_idempotent_across_flushes() {
        let link = Arc::new(RecordingLink::default());
        let mut sc = StepCompress::new(0, 1000, link.clone());
        sc.set_time(0.0, 1_000_000.0);
        let mut gen = StepGenerator::new(0.1, Box::new(CartesianSolver::new(0)));

        let mut tq = Trapq::new();
        tq.append(
            0.0,
            0.0,
            1.0,
            0.0,
            [0.0; 3],
            [1.0, 0.0, 0.0],
            10.0,
            10.0,
            0.0,
        );
        gen.generate_steps(&mut sc, &tq, 0.5).expect("first half");
        gen.generate_steps(&mut sc, &tq, 0.5).expect("repeat");
        gen.generate_steps(&mut sc, &tq, 2.0).expect("second half");
        sc.flush(u64::MAX).expect("flush");
        let (steps, _) = step_counts(&link.commands());
        assert!((99..=100).contains(&steps), "got {steps} steps");
    }

    #[test]
    fn pressure_advance_shifts_steps_earlier() {
        let seg = TrapSegment {
            print_time: 0.0,
            move_t: 1.0,
            start_v: 10.0,
            half_accel: 0.0,
            start_pos: [0.0; 3],
            axes_r: [1.0, 1.0, 0.0],
        };
        let plain = ExtruderSolver {
            pressure_advance: 0.0,
        };
        let advanced = ExtruderSolver {
            pressure_advance: 0.05,
        };
        let base = plain.position(&seg, 0.5);
        let shifted = advanced.position(&seg, 0.5);
        assert!((shifted - base - 0.5).abs() < 1e-12);
    }
}
