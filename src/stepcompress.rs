// src/stepcompress.rs
//
// Per-stepper queue of future step clocks. Queued steps are compressed into
// `queue_step` chunks (interval/count/add) and handed to the MCU link, while
// a history of transmitted chunks answers past-position queries during
// homing. The compression search mirrors the classic bisect-on-add scheme:
// for a window of pending steps it looks for the longest chunk whose
// per-step error stays inside the configured budget.
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

use crate::mcu::{McuCommand, McuTransport};

/// Pending steps beyond this are a host-side stall; the printer must shut down.
const QUEUE_MAX_PENDING: usize = 1 << 20;
/// Steps further than this from the last flush go out as single commands.
const CLOCK_DIFF_MAX: u64 = 3 << 28;
/// Quadratic error growth divisor (6 + 4*sqrt(2), truncated as upstream).
const QUADRATIC_DEV: i64 = 11;
/// Minimum spacing for a step, dir flip, step sequence (750us).
const SDS_FILTER_TIME: f64 = 0.000_750;

#[derive(Debug, Clone, Error)]
pub enum StepCompressError {
    #[error("step queue overflow on oid {oid}: {pending} steps pending")]
    Overflow { oid: u32, pending: usize },
    #[error("desynced step clock on oid {oid}: step at {print_time:.6} precedes flushed clock {last_clock}")]
    DesyncedClock {
        oid: u32,
        print_time: f64,
        last_clock: u64,
    },
    #[error("invalid step sequence on oid {oid}: interval={interval} count={count} add={add}")]
    InvalidSequence {
        oid: u32,
        interval: u32,
        count: u16,
        add: i16,
    },
    #[error("step point {index} out of range on oid {oid}: {value} not in {min}..={max}")]
    PointOutOfRange {
        oid: u32,
        index: u16,
        value: i64,
        min: i64,
        max: i64,
    },
}

pub type Result<T> = std::result::Result<T, StepCompressError>;

#[derive(Copy, Clone, Debug)]
struct Chunk {
    interval: u32,
    count: u16,
    add: i16,
}

#[derive(Copy, Clone, Debug)]
struct Bounds {
    lo: i64,
    hi: i64,
}

#[derive(Clone, Debug)]
struct HistoryChunk {
    first_clock: u64,
    last_clock: u64,
    start_position: i64,
    step_count: i32,
    interval: u32,
    add: i16,
}

fn idiv_up(n: i64, d: i64) -> i64 {
    if n >= 0 {
        (n + d - 1) / d
    } else {
        n / d
    }
}

fn idiv_down(n: i64, d: i64) -> i64 {
    if n >= 0 {
        n / d
    } else {
        (n - d + 1) / d
    }
}

pub struct StepCompress {
    oid: u32,
    max_error_ticks: u64,
    mcu_time_offset: f64,
    mcu_freq: f64,
    last_step_print_time: f64,
    last_step_clock: u64,
    // Direction state: None until the first commanded step.
    step_dir: Option<bool>,
    invert_dir: bool,
    pending_clock: Option<u64>,
    pending_dir: bool,
    queue: Vec<u64>,
    queue_pos: usize,
    last_position: i64,
    history: VecDeque<HistoryChunk>,
    transport: Arc<dyn McuTransport>,
}

impl StepCompress {
    pub fn new(oid: u32, max_error_ticks: u64, transport: Arc<dyn McuTransport>) -> Self {
        Self {
            oid,
            max_error_ticks,
            mcu_time_offset: 0.0,
            mcu_freq: 1.0,
            last_step_print_time: -0.5,
            last_step_clock: 0,
            step_dir: None,
            invert_dir: false,
            pending_clock: None,
            pending_dir: false,
            queue: Vec::with_capacity(1024),
            queue_pos: 0,
            last_position: 0,
            history: VecDeque::new(),
            transport,
        }
    }

    pub fn oid(&self) -> u32 {
        self.oid
    }

    pub fn set_time(&mut self, time_offset: f64, mcu_freq: f64) {
        self.mcu_time_offset = time_offset;
        self.mcu_freq = mcu_freq;
        self.update_last_step_print_time();
    }

    pub fn set_invert_dir(&mut self, invert: bool) {
        if self.invert_dir != invert {
            self.invert_dir = invert;
            if let Some(dir) = self.step_dir {
                self.step_dir = Some(!dir);
            }
        }
    }

    pub fn last_dir(&self) -> bool {
        self.step_dir.unwrap_or(false)
    }

    pub fn last_step_clock(&self) -> u64 {
        self.last_step_clock
    }

    pub fn last_position(&self) -> i64 {
        self.last_position
    }

    /// Schedule one step. `print_time` anchors the move; `step_time` is the
    /// offset within it. Steps are staged one deep so a direction flip can
    /// roll the previous one back (step, dir, step filtering).
    pub fn append(&mut self, dir: bool, print_time: f64, step_time: f64) -> Result<()> {
        let offset = print_time - self.last_step_print_time;
        let rel_clock = (step_time + offset) * self.mcu_freq;
        if rel_clock < 0.0 {
            return Err(StepCompressError::DesyncedClock {
                oid: self.oid,
                print_time: print_time + step_time,
                last_clock: self.last_step_clock,
            });
        }
        let step_clock = self.last_step_clock + rel_clock as u64;

        if let Some(prev_clock) = self.pending_clock {
            if dir != self.pending_dir {
                let diff = step_clock as i64 - prev_clock as i64;
                if (diff as f64) < SDS_FILTER_TIME * self.mcu_freq {
                    // Rapid step, dir, step: cancel both.
                    self.pending_clock = None;
                    self.pending_dir = dir;
                    return Ok(());
                }
            }
            self.commit_pending()?;
        }
        self.pending_clock = Some(step_clock);
        self.pending_dir = dir;
        Ok(())
    }

    /// Commit the staged step, fixing it against rollback.
    pub fn commit(&mut self) -> Result<()> {
        if self.pending_clock.is_some() {
            self.commit_pending()?;
        }
        Ok(())
    }

    /// Convert queued steps up to `move_clock` into MCU commands.
    pub fn flush(&mut self, move_clock: u64) -> Result<()> {
        if let Some(pending) = self.pending_clock {
            if move_clock >= pending {
                self.commit_pending()?;
            }
        }
        self.drain_queue(move_clock)
    }

    /// Discard pending state and restart the clock origin. Used after
    /// homing; the matching `reset_step_clock` command is sent by the owner.
    pub fn reset(&mut self, last_step_clock: u64) -> Result<()> {
        self.flush(u64::MAX)?;
        self.last_step_clock = last_step_clock;
        self.step_dir = None;
        self.update_last_step_print_time();
        Ok(())
    }

    /// Record the MCU-confirmed position after a `stepper_get_position`.
    pub fn set_last_position(&mut self, clock: u64, position: i64) -> Result<()> {
        self.flush(u64::MAX)?;
        self.last_position = position;
        self.history.push_front(HistoryChunk {
            first_clock: clock,
            last_clock: clock,
            start_position: position,
            step_count: 0,
            interval: 0,
            add: 0,
        });
        Ok(())
    }

    /// Binary-search history for the stepper's position at `clock`.
    pub fn find_past_position(&self, clock: u64) -> i64 {
        let mut fallback = self.last_position;
        for chunk in &self.history {
            if clock < chunk.first_clock {
                fallback = chunk.start_position;
                continue;
            }
            if clock >= chunk.last_clock {
                return chunk.start_position + chunk.step_count as i64;
            }
            let interval = chunk.interval as i64;
            let add = chunk.add as i64;
            let ticks = (clock as i64 - chunk.first_clock as i64) + interval;
            let offset = if add == 0 {
                (ticks as f64 / interval as f64) as i64
            } else {
                // Invert the quadratic reach formula for the chunk.
                let a = 0.5 * add as f64;
                let b = interval as f64 - 0.5 * add as f64;
                let c = -(ticks as f64);
                (((b * b - 4.0 * a * c).sqrt() - b) / (2.0 * a)) as i64
            };
            return if chunk.step_count < 0 {
                chunk.start_position - offset
            } else {
                chunk.start_position + offset
            };
        }
        fallback
    }

    pub fn expire_history(&mut self, before_clock: u64) {
        while let Some(oldest) = self.history.back() {
            if oldest.last_clock > before_clock {
                break;
            }
            self.history.pop_back();
        }
    }

    // -- internals --

    fn update_last_step_print_time(&mut self) {
        let lsc = self.last_step_clock as f64;
        self.last_step_print_time = self.mcu_time_offset + (lsc - 0.5) / self.mcu_freq;
    }

    fn commit_pending(&mut self) -> Result<()> {
        if self.step_dir != Some(self.pending_dir) {
            self.flush_and_set_dir(self.pending_dir)?;
        }
        let step_clock = match self.pending_clock.take() {
            Some(clock) => clock,
            None => return Ok(()),
        };
        if step_clock >= self.last_step_clock + CLOCK_DIFF_MAX {
            return self.push_far_step(step_clock);
        }
        if self.queue.len() - self.queue_pos >= QUEUE_MAX_PENDING {
            return Err(StepCompressError::Overflow {
                oid: self.oid,
                pending: self.queue.len() - self.queue_pos,
            });
        }
        if self.queue.len() == self.queue.capacity() {
            self.compact_queue()?;
        }
        self.queue.push(step_clock);
        Ok(())
    }

    fn push_far_step(&mut self, step_clock: u64) -> Result<()> {
        self.drain_queue(step_clock.saturating_sub(CLOCK_DIFF_MAX).saturating_add(1))?;
        if step_clock >= self.last_step_clock + CLOCK_DIFF_MAX {
            let chunk = Chunk {
                interval: (step_clock - self.last_step_clock) as u32,
                count: 1,
                add: 0,
            };
            self.emit_chunk(step_clock, &chunk);
            self.update_last_step_print_time();
            return Ok(());
        }
        self.queue.push(step_clock);
        Ok(())
    }

    fn compact_queue(&mut self) -> Result<()> {
        let in_use = self.queue.len() - self.queue_pos;
        if in_use > 65_535 + 2_000 {
            // Far more steps than one chunk can cover; force partial flush.
            let flush = self.queue[self.queue.len() - 65_535] - self.last_step_clock;
            self.drain_queue(self.last_step_clock + flush)?;
        }
        if self.queue_pos > 0 {
            self.queue.drain(0..self.queue_pos);
            self.queue_pos = 0;
        } else {
            let grow = self.queue.capacity().max(1024);
            self.queue.reserve(grow);
        }
        Ok(())
    }

    fn flush_and_set_dir(&mut self, dir: bool) -> Result<()> {
        if self.step_dir == Some(dir) {
            return Ok(());
        }
        self.drain_queue(u64::MAX)?;
        self.step_dir = Some(dir);
        self.transport.send(McuCommand::SetNextStepDir {
            oid: self.oid,
            dir: dir != self.invert_dir,
        });
        Ok(())
    }

    fn drain_queue(&mut self, move_clock: u64) -> Result<()> {
        if self.queue_pos >= self.queue.len() {
            return Ok(());
        }
        while self.last_step_clock < move_clock {
            let chunk = self.best_fit_chunk();
            self.verify_chunk(&chunk)?;
            let first_clock = self.last_step_clock + chunk.interval as u64;
            self.emit_chunk(first_clock, &chunk);
            let advance = chunk.count as usize;
            if self.queue_pos + advance >= self.queue.len() {
                self.queue.clear();
                self.queue_pos = 0;
                break;
            }
            self.queue_pos += advance;
        }
        self.update_last_step_print_time();
        if self.queue_pos > 0 && self.queue_pos * 2 > self.queue.len() {
            self.queue.drain(0..self.queue_pos);
            self.queue_pos = 0;
        }
        Ok(())
    }

    /// Acceptable clock window for the queued step at `idx`.
    fn step_bounds(&self, idx: usize) -> Bounds {
        let lsc = self.last_step_clock as i64;
        let point = self.queue[idx] as i64 - lsc;
        let prev = if idx > self.queue_pos {
            self.queue[idx - 1] as i64 - lsc
        } else {
            0
        };
        let max_error = ((point - prev) / 2).min(self.max_error_ticks as i64);
        Bounds {
            lo: point - max_error,
            hi: point,
        }
    }

    /// Search for the chunk covering the most queued steps. The outer loop
    /// bisects on `add`; the inner loop extends the count while an interval
    /// satisfying every step's window still exists.
    fn best_fit_chunk(&self) -> Chunk {
        let queue_len = self.queue.len();
        let window_end = (self.queue_pos + 65_535).min(queue_len);
        let first = self.step_bounds(self.queue_pos);
        let mut outer_lo = first.lo;
        let mut outer_hi = first.hi;
        let mut add: i64 = 0;
        let mut min_add: i64 = -0x8000;
        let mut max_add: i64 = 0x7fff;
        let mut best_interval: i64 = 0;
        let mut best_count: i64 = 1;
        let mut best_add: i64 = 1;
        let mut best_reach: i64 = i64::MIN;
        let mut zero_interval: i64 = 0;
        let mut zero_count: i64 = 0;

        loop {
            let mut next_bounds;
            let mut next_lo = outer_lo;
            let mut next_hi = outer_hi;
            let mut interval = next_hi;
            let mut next_count: i64 = 1;
            loop {
                next_count += 1;
                if self.queue_pos + (next_count as usize) > window_end {
                    let count = next_count - 1;
                    return Chunk {
                        interval: interval as u32,
                        count: count as u16,
                        add: add as i16,
                    };
                }
                next_bounds = self.step_bounds(self.queue_pos + next_count as usize - 1);
                let next_add_factor = next_count * (next_count - 1) / 2;
                let c = add * next_add_factor;
                if next_lo * next_count < next_bounds.lo - c {
                    next_lo = idiv_up(next_bounds.lo - c, next_count);
                }
                if next_hi * next_count > next_bounds.hi - c {
                    next_hi = idiv_down(next_bounds.hi - c, next_count);
                }
                if next_lo > next_hi {
                    break;
                }
                interval = next_hi;
            }

            let count = next_count - 1;
            let add_factor = count * (count - 1) / 2;
            let reach = add * add_factor + interval * count;
            if reach > best_reach || (reach == best_reach && interval > best_interval) {
                best_interval = interval;
                best_count = count;
                best_add = add;
                best_reach = reach;
                if add == 0 {
                    zero_interval = interval;
                    zero_count = count;
                }
                if count > 0x200 {
                    break;
                }
            }

            let next_add_factor = next_count * (next_count - 1) / 2;
            let next_reach = add * next_add_factor + interval * next_count;
            if next_reach < next_bounds.lo {
                min_add = add + 1;
                outer_hi = next_hi;
            } else {
                max_add = add - 1;
                outer_lo = next_lo;
            }

            if count > 1 {
                let err_delta = self.max_error_ticks as i64 * QUADRATIC_DEV / (count * count);
                min_add = min_add.max(add - err_delta);
                max_add = max_add.min(add + err_delta);
            }

            let c = outer_hi * next_count;
            if min_add * next_add_factor < next_bounds.lo - c {
                min_add = idiv_up(next_bounds.lo - c, next_add_factor);
            }
            let c2 = outer_lo * next_count;
            if max_add * next_add_factor > next_bounds.hi - c2 {
                max_add = idiv_down(next_bounds.hi - c2, next_add_factor);
            }

            if min_add > max_add {
                break;
            }
            add = max_add - (max_add - min_add) / 4;
        }

        // Prefer a plain constant-interval chunk when it is nearly as long.
        if zero_count + zero_count / 16 >= best_count {
            return Chunk {
                interval: zero_interval as u32,
                count: zero_count as u16,
                add: 0,
            };
        }
        Chunk {
            interval: best_interval as u32,
            count: best_count as u16,
            add: best_add as i16,
        }
    }

    fn verify_chunk(&self, chunk: &Chunk) -> Result<()> {
        if chunk.count == 0
            || (chunk.interval == 0 && chunk.add == 0 && chunk.count > 1)
            || chunk.interval >= 0x8000_0000
        {
            return Err(StepCompressError::InvalidSequence {
                oid: self.oid,
                interval: chunk.interval,
                count: chunk.count,
                add: chunk.add,
            });
        }
        let mut interval = chunk.interval as i64;
        let mut p: i64 = 0;
        for i in 0..chunk.count {
            let bounds = self.step_bounds(self.queue_pos + i as usize);
            p += interval;
            if p < bounds.lo || p > bounds.hi {
                return Err(StepCompressError::PointOutOfRange {
                    oid: self.oid,
                    index: i + 1,
                    value: p,
                    min: bounds.lo,
                    max: bounds.hi,
                });
            }
            if !(0..0x8000_0000).contains(&interval) {
                return Err(StepCompressError::InvalidSequence {
                    oid: self.oid,
                    interval: chunk.interval,
                    count: chunk.count,
                    add: chunk.add,
                });
            }
            interval += chunk.add as i64;
        }
        Ok(())
    }

    fn emit_chunk(&mut self, first_clock: u64, chunk: &Chunk) {
        let add_factor = chunk.count as u64 * (chunk.count as u64 - 1) / 2;
        let ticks =
            chunk.add as i64 * add_factor as i64 + chunk.interval as i64 * (chunk.count as i64 - 1);
        let last_clock = first_clock.saturating_add(ticks.max(0) as u64);

        self.transport.send(McuCommand::QueueStep {
            oid: self.oid,
            interval: chunk.interval,
            count: chunk.count,
            add: chunk.add,
        });
        self.last_step_clock = last_clock;

        let step_count = if self.step_dir.unwrap_or(true) {
            chunk.count as i32
        } else {
            -(chunk.count as i32)
        };
        self.history.push_front(HistoryChunk {
            first_clock,
            last_clock,
            start_position: self.last_position,
            step_count,
            interval: chunk.interval,
            add: chunk.add,
        });
        self.last_position += step_count as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcu::{EndstopArm, EndstopState};
    use crate::reactor::Completion;
    use std::sync::Mutex;

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

    fn compressor() -> (StepCompress, Arc<RecordingLink>) {
        let link = Arc::new(RecordingLink::default());
        let mut sc = StepCompress::new(1, 10, link.clone());
        sc.set_time(0.0, 1000.0);
        (sc, link)
    }

    #[test]
    fn constant_interval_steps_compress() {
        let (mut sc, link) = compressor();
        for i in 0..5 {
            sc.append(true, 0.0, i as f64 * 0.001).expect("append");
            sc.commit().expect("commit");
        }
        sc.flush(u64::MAX).expect("flush");
        let commands = link.commands();
        assert!(matches!(commands[0], McuCommand::SetNextStepDir { .. }));
        let total: u32 = commands
            .iter()
            .filter_map(|c| match c {
                McuCommand::QueueStep { count, .. } => Some(*count as u32),
                _ => None,
            })
            .sum();
        assert_eq!(total, 5);
        assert_eq!(sc.last_position(), 5);
    }

    #[test]
    fn sds_filter_cancels_rapid_reversal() {
        let (mut sc, link) = compressor();
        sc.append(false, 0.0, 0.0).expect("append");
        sc.append(true, 0.0, 0.0).expect("append");
        sc.commit().expect("commit");
        sc.flush(u64::MAX).expect("flush");
        let total: u32 = link
            .commands()
            .iter()
            .filter_map(|c| match c {
                McuCommand::QueueStep { count, .. } => Some(*count as u32),
                _ => None,
            })
            .sum();
        assert_eq!(total, 0);
    }

    #[test]
    fn past_position_tracks_history() {
        let (mut sc, _link) = compressor();
        sc.append(true, 0.0, 0.0).expect("append");
        sc.commit().expect("commit");
        sc.append(true, 0.0, 0.001).expect("append");
        sc.commit().expect("commit");
        sc.flush(u64::MAX).expect("flush");
        assert_eq!(sc.last_position(), 2);
        assert_eq!(sc.find_past_position(sc.last_step_clock()), 2);
        assert_eq!(sc.find_past_position(0), 0);
    }

    #[test]
    fn reset_preserves_history() {
        let (mut sc, _link) = compressor();
        sc.append(true, 0.0, 0.010).expect("append");
        sc.commit().expect("commit");
        sc.flush(u64::MAX).expect("flush");
        let clock = sc.last_step_clock();
        sc.reset(0).expect("reset");
        assert_eq!(sc.last_step_clock(), 0);
        assert_eq!(sc.find_past_position(clock), 1);
    }

    #[test]
    fn backwards_step_is_desync() {
        let (mut sc, _link) = compressor();
        sc.append(true, 1.0, 0.0).expect("append");
        sc.commit().expect("commit");
        sc.flush(u64::MAX).expect("flush");
        let err = sc.append(true, 0.0, 0.0).expect_err("must desync");
        assert!(matches!(err, StepCompressError::DesyncedClock { .. }));
    }
}
