// src/trapq.rs
//
// Trapezoid motion queue: the time-ordered list of constant-acceleration
// segments a kinematic group (or an extruder) is committed to. Step
// generators read segments; the toolhead appends and expires them. Gaps
// between appended moves are bridged with zero-velocity segments so the
// solver always sees a contiguous position function.
use std::collections::VecDeque;

use crate::reactor::NEVER;

/// Longest zero-velocity bridge synthesized before the first move.
const MAX_NULL_MOVE: f64 = 1.0;
/// Expired segments kept for diagnostics, in seconds.
const HISTORY_RETENTION: f64 = 30.0;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TrapSegment {
    pub print_time: f64,
    pub move_t: f64,
    pub start_v: f64,
    pub half_accel: f64,
    pub start_pos: [f64; 3],
    pub axes_r: [f64; 3],
}

impl TrapSegment {
    pub fn end_time(&self) -> f64 {
        self.print_time + self.move_t
    }

    /// Distance travelled along the segment at `move_time` (segment-local).
    pub fn dist_at(&self, move_time: f64) -> f64 {
        (self.start_v + self.half_accel * move_time) * move_time
    }

    pub fn pos_at(&self, move_time: f64) -> [f64; 3] {
        let d = self.dist_at(move_time);
        [
            self.start_pos[0] + self.axes_r[0] * d,
            self.start_pos[1] + self.axes_r[1] * d,
            self.start_pos[2] + self.axes_r[2] * d,
        ]
    }

    fn is_null(&self) -> bool {
        self.start_v == 0.0 && self.half_accel == 0.0
    }
}

#[derive(Default)]
pub struct Trapq {
    segments: VecDeque<TrapSegment>,
    history: VecDeque<TrapSegment>,
    /// End time of the most recently appended segment, if any was ever seen.
    last_end: Option<f64>,
}

impl Trapq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &VecDeque<TrapSegment> {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Pending motion before `time` (testing aid).
    pub fn pending_before(&self, time: f64) -> usize {
        self.segments
            .iter()
            .filter(|s| !s.is_null() && s.print_time < time)
            .count()
    }

    fn push_segment(&mut self, seg: TrapSegment) {
        let prev_end = self.last_end;
        match prev_end {
            Some(end) if seg.print_time - end > 1e-12 => {
                self.segments.push_back(TrapSegment {
                    print_time: end,
                    move_t: seg.print_time - end,
                    start_pos: seg.start_pos,
                    ..TrapSegment::default()
                });
            }
            None if seg.print_time > 0.0 => {
                let bridge_start = if seg.print_time > MAX_NULL_MOVE {
                    seg.print_time - MAX_NULL_MOVE
                } else {
                    0.0
                };
                self.segments.push_back(TrapSegment {
                    print_time: bridge_start,
                    move_t: seg.print_time - bridge_start,
                    start_pos: seg.start_pos,
                    ..TrapSegment::default()
                });
            }
            _ => {}
        }
        self.last_end = Some(seg.end_time());
        self.segments.push_back(seg);
    }

    /// Append one planned trapezoid, splitting it into up to three segments.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        print_time: f64,
        accel_t: f64,
        cruise_t: f64,
        decel_t: f64,
        start_pos: [f64; 3],
        axes_r: [f64; 3],
        start_v: f64,
        cruise_v: f64,
        accel: f64,
    ) {
        let mut time = print_time;
        let mut pos = start_pos;
        if accel_t > 0.0 {
            let seg = TrapSegment {
                print_time: time,
                move_t: accel_t,
                start_v,
                half_accel: 0.5 * accel,
                start_pos: pos,
                axes_r,
            };
            self.push_segment(seg);
            time += accel_t;
            pos = seg.pos_at(accel_t);
        }
        if cruise_t > 0.0 {
            let seg = TrapSegment {
                print_time: time,
                move_t: cruise_t,
                start_v: cruise_v,
                half_accel: 0.0,
                start_pos: pos,
                axes_r,
            };
            self.push_segment(seg);
            time += cruise_t;
            pos = seg.pos_at(cruise_t);
        }
        if decel_t > 0.0 {
            let seg = TrapSegment {
                print_time: time,
                move_t: decel_t,
                start_v: cruise_v,
                half_accel: -0.5 * accel,
                start_pos: pos,
                axes_r,
            };
            self.push_segment(seg);
        }
    }

    /// Expire segments fully completed before `before_time`.
    pub fn finalize_moves(&mut self, before_time: f64) {
        while let Some(front) = self.segments.front().copied() {
            if front.end_time() > before_time {
                break;
            }
            self.segments.pop_front();
            if !front.is_null() {
                self.history.push_front(front);
            }
        }
        let horizon = before_time.min(NEVER) - HISTORY_RETENTION;
        while self.history.len() > 1 {
            match self.history.back() {
                Some(oldest) if oldest.end_time() <= horizon => {
                    self.history.pop_back();
                }
                _ => break,
            }
        }
    }

    /// Zero-duration teleport: subsequent segments start from `pos`.
    pub fn set_position(&mut self, print_time: f64, pos: [f64; 3]) {
        self.finalize_moves(NEVER);
        while let Some(first) = self.history.front_mut() {
            if first.print_time < print_time {
                if first.end_time() > print_time {
                    first.move_t = print_time - first.print_time;
                }
                break;
            }
            self.history.pop_front();
        }
        self.history.push_front(TrapSegment {
            print_time,
            start_pos: pos,
            ..TrapSegment::default()
        });
        self.last_end = Some(print_time);
    }

    /// Position at `print_time`, consulting live segments then history.
    pub fn position_at(&self, print_time: f64) -> Option<[f64; 3]> {
        for seg in &self.segments {
            if print_time >= seg.print_time && print_time <= seg.end_time() {
                return Some(seg.pos_at(print_time - seg.print_time));
            }
        }
        for seg in &self.history {
            if print_time >= seg.print_time {
                let t = (print_time - seg.print_time).min(seg.move_t);
                return Some(seg.pos_at(t));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trapezoid_splits_into_three_segments() {
        let mut tq = Trapq::new();
        tq.append(
            0.0,
            1.0,
            2.0,
            1.0,
            [0.0; 3],
            [1.0, 0.0, 0.0],
            0.0,
            2.0,
            2.0,
        );
        assert_eq!(tq.segments().len(), 3);
        let total: f64 = tq.segments().iter().map(|s| s.move_t).sum();
        assert!((total - 4.0).abs() < 1e-12);
        // accel covers 1mm, cruise 4mm, decel 1mm
        let last = tq.segments().back().expect("decel segment");
        assert!((last.start_pos[0] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn gap_is_bridged_with_null_segment() {
        let mut tq = Trapq::new();
        tq.append(0.0, 0.0, 0.5, 0.0, [0.0; 3], [1.0, 0.0, 0.0], 1.0, 1.0, 0.0);
        tq.append(2.0, 0.0, 0.5, 0.0, [0.5; 3], [1.0, 0.0, 0.0], 1.0, 1.0, 0.0);
        assert_eq!(tq.segments().len(), 3);
        let bridge = &tq.segments()[1];
        assert!(bridge.is_null());
        assert!((bridge.print_time - 0.5).abs() < 1e-12);
        assert!((bridge.move_t - 1.5).abs() < 1e-12);
    }

    #[test]
    fn finalize_expires_into_history() {
        let mut tq = Trapq::new();
        tq.append(0.0, 1.0, 0.0, 0.0, [0.0; 3], [1.0, 0.0, 0.0], 0.5, 0.0, 1.0);
        tq.finalize_moves(2.0);
        assert!(tq.is_empty());
        assert!(tq.position_at(0.5).is_some());
    }

    #[test]
    fn set_position_pins_future_lookups() {
        let mut tq = Trapq::new();
        tq.append(0.0, 0.5, 0.0, 0.0, [0.0; 3], [1.0, 0.0, 0.0], 1.0, 0.0, 1.0);
        tq.finalize_moves(2.0);
        tq.set_position(0.25, [9.0, 8.0, 7.0]);
        let pos = tq.position_at(0.30).expect("pinned position");
        assert_eq!(pos, [9.0, 8.0, 7.0]);
    }

    #[test]
    fn purge_at_never_drops_everything() {
        let mut tq = Trapq::new();
        tq.append(0.0, 1.0, 1.0, 1.0, [0.0; 3], [1.0, 0.0, 0.0], 0.0, 3.0, 3.0);
        tq.finalize_moves(NEVER);
        assert!(tq.is_empty());
        assert_eq!(tq.pending_before(NEVER), 0);
    }
}
