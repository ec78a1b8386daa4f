// src/motion/planner.rs
//
// Look-ahead motion planning. A `Move` is one commanded motion with its
// junction limits; the `MoveQueue` delays trapezoid assignment until enough
// moves are buffered to know how fast each junction can safely be taken.
//
// Naming follows the usual conventions: `_d` distance (mm), `_v` velocity
// (mm/s), `_v2` velocity squared, `_t` time (s), `_r` ratio.

/// Queue enough moves to cover this much motion time before planning.
pub const LOOKAHEAD_FLUSH_TIME: f64 = 0.250;

/// Acceleration used for extrude-only moves (effectively unbounded).
const EXTRUDE_ONLY_ACCEL: f64 = 99_999_999.9;

/// Planner-wide limits captured at move construction time.
#[derive(Debug, Clone, Copy)]
pub struct PlannerLimits {
    pub max_velocity: f64,
    pub max_accel: f64,
    pub max_accel_to_decel: f64,
    pub junction_deviation: f64,
    /// Kinematic axes (3 or 6); the extruder slot follows them.
    pub axis_count: usize,
}

pub struct Move {
    pub start_pos: Vec<f64>,
    pub end_pos: Vec<f64>,
    pub axes_d: Vec<f64>,
    pub axes_r: Vec<f64>,
    pub move_d: f64,
    pub accel: f64,
    pub junction_deviation: f64,
    pub is_kinematic_move: bool,
    pub axis_count: usize,
    pub min_move_t: f64,
    pub max_start_v2: f64,
    pub max_cruise_v2: f64,
    pub delta_v2: f64,
    pub max_smoothed_v2: f64,
    pub smooth_delta_v2: f64,
    pub start_v: f64,
    pub cruise_v: f64,
    pub end_v: f64,
    pub accel_t: f64,
    pub cruise_t: f64,
    pub decel_t: f64,
    /// Invoked with the print time at which the move ends.
    pub timing_callbacks: Vec<Box<dyn FnOnce(f64) + Send>>,
}

impl Move {
    pub fn new(start_pos: Vec<f64>, end_pos: Vec<f64>, speed: f64, limits: &PlannerLimits) -> Self {
        let axis_count = limits.axis_count;
        let mut end_pos = end_pos;
        let mut axes_d: Vec<f64> = (0..=axis_count)
            .map(|i| end_pos[i] - start_pos[i])
            .collect();
        let mut move_d = axes_d[..axis_count]
            .iter()
            .map(|d| d * d)
            .sum::<f64>()
            .sqrt();

        let mut accel = limits.max_accel;
        let mut velocity = speed.min(limits.max_velocity);
        let mut is_kinematic_move = true;
        if move_d < 1e-9 {
            // Extrude-only: the head stays put, only the extruder slot moves.
            for (i, d) in axes_d.iter_mut().enumerate().take(axis_count) {
                end_pos[i] = start_pos[i];
                *d = 0.0;
            }
            move_d = axes_d[axis_count].abs();
            accel = EXTRUDE_ONLY_ACCEL;
            velocity = speed;
            is_kinematic_move = false;
        }
        let inv_move_d = if move_d > 0.0 { 1.0 / move_d } else { 0.0 };
        let axes_r: Vec<f64> = axes_d.iter().map(|d| d * inv_move_d).collect();
        let min_move_t = if velocity > 0.0 { move_d / velocity } else { 0.0 };

        let max_cruise_v2 = velocity * velocity;
        let delta_v2 = 2.0 * move_d * accel;
        Self {
            start_pos,
            end_pos,
            axes_d,
            axes_r,
            move_d,
            accel,
            junction_deviation: limits.junction_deviation,
            is_kinematic_move,
            axis_count,
            min_move_t,
            max_start_v2: 0.0,
            max_cruise_v2,
            delta_v2,
            max_smoothed_v2: 0.0,
            smooth_delta_v2: 2.0 * move_d * limits.max_accel_to_decel,
            start_v: 0.0,
            cruise_v: 0.0,
            end_v: 0.0,
            accel_t: 0.0,
            cruise_t: 0.0,
            decel_t: 0.0,
            timing_callbacks: Vec::new(),
        }
    }

    /// Monotonically tighten the speed and acceleration caps.
    pub fn limit_speed(&mut self, speed: f64, accel: f64) {
        let speed2 = speed * speed;
        if speed2 < self.max_cruise_v2 {
            self.max_cruise_v2 = speed2;
            self.min_move_t = self.move_d / speed;
        }
        self.accel = self.accel.min(accel);
        self.delta_v2 = 2.0 * self.move_d * self.accel;
        self.smooth_delta_v2 = self.smooth_delta_v2.min(self.delta_v2);
    }

    /// Render the offending end position for a range error message.
    pub fn format_end_pos(&self) -> String {
        let kin: Vec<String> = self.end_pos[..self.axis_count]
            .iter()
            .map(|p| format!("{p:.3}"))
            .collect();
        format!("{} [{:.3}]", kin.join(" "), self.end_pos[self.axis_count])
    }

    /// Compute the maximum junction speed with the previous move.
    /// `extruder_v2` is the extruder's own instantaneous-corner bound.
    pub fn calc_junction(&mut self, prev: &Move, extruder_v2: f64) {
        if !self.is_kinematic_move || !prev.is_kinematic_move {
            return;
        }
        // Approximated centripetal velocity from the direction cosine.
        let mut junction_cos_theta = 0.0;
        for i in 0..self.axis_count {
            junction_cos_theta -= self.axes_r[i] * prev.axes_r[i];
        }
        if junction_cos_theta > 0.999999 {
            // Near-collinear: geometry places no limit on the junction.
            return;
        }
        let junction_cos_theta = junction_cos_theta.max(-0.999999);
        let sin_theta_d2 = (0.5 * (1.0 - junction_cos_theta)).sqrt();
        let r_jd = sin_theta_d2 / (1.0 - sin_theta_d2);
        // The approximated circle must contact each move no further away
        // than mid-move.
        let tan_theta_d2 = sin_theta_d2 / (0.5 * (1.0 + junction_cos_theta)).sqrt();
        let move_centripetal_v2 = 0.5 * self.move_d * tan_theta_d2 * self.accel;
        let prev_centripetal_v2 = 0.5 * prev.move_d * tan_theta_d2 * prev.accel;

        self.max_start_v2 = (r_jd * self.junction_deviation * self.accel)
            .min(r_jd * prev.junction_deviation * prev.accel)
            .min(move_centripetal_v2)
            .min(prev_centripetal_v2)
            .min(extruder_v2)
            .min(self.max_cruise_v2)
            .min(prev.max_cruise_v2)
            .min(prev.max_start_v2 + prev.delta_v2);
        self.max_smoothed_v2 = self
            .max_start_v2
            .min(prev.max_smoothed_v2 + prev.smooth_delta_v2);
    }

    /// Assign the trapezoid for the chosen junction speeds.
    pub fn set_junction(&mut self, start_v2: f64, cruise_v2: f64, end_v2: f64) {
        let half_inv_accel = 0.5 / self.accel;
        let accel_d = (cruise_v2 - start_v2) * half_inv_accel;
        let decel_d = (cruise_v2 - end_v2) * half_inv_accel;
        let cruise_d = self.move_d - accel_d - decel_d;
        self.start_v = start_v2.sqrt();
        self.cruise_v = cruise_v2.sqrt();
        self.end_v = end_v2.sqrt();
        self.accel_t = accel_d / ((self.start_v + self.cruise_v) * 0.5);
        self.cruise_t = cruise_d / self.cruise_v;
        self.decel_t = decel_d / ((self.end_v + self.cruise_v) * 0.5);
    }

    pub fn total_time(&self) -> f64 {
        self.accel_t + self.cruise_t + self.decel_t
    }
}

/// Ordered queue of pending moves awaiting junction planning.
#[derive(Default)]
pub struct MoveQueue {
    queue: Vec<Move>,
    junction_flush: f64,
}

impl MoveQueue {
    pub fn new() -> Self {
        Self {
            queue: Vec::new(),
            junction_flush: LOOKAHEAD_FLUSH_TIME,
        }
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.junction_flush = LOOKAHEAD_FLUSH_TIME;
    }

    pub fn set_flush_time(&mut self, flush_time: f64) {
        self.junction_flush = flush_time;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn last(&self) -> Option<&Move> {
        self.queue.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut Move> {
        self.queue.last_mut()
    }

    /// Append a move whose junction speeds are already computed against the
    /// previous queue entry. Returns true once enough motion time is queued
    /// to run a lazy flush.
    pub fn add_move(&mut self, m: Move) -> bool {
        let min_move_t = m.min_move_t;
        self.queue.push(m);
        if self.queue.len() == 1 {
            return false;
        }
        self.junction_flush -= min_move_t;
        self.junction_flush <= 0.0
    }

    /// Determine start/end velocities for queued moves. Walks the queue
    /// backward assuming a full stop after the last move, delaying any move
    /// whose peak cruise speed is not yet provable. In lazy mode only the
    /// provably-planned prefix is released.
    pub fn flush(&mut self, lazy: bool) -> Vec<Move> {
        self.junction_flush = LOOKAHEAD_FLUSH_TIME;
        let mut update_flush_count = lazy;
        let queue = &mut self.queue;
        let mut flush_count = queue.len();
        // (index, start_v2, next_end_v2) of moves awaiting peak_cruise_v2.
        let mut delayed: Vec<(usize, f64, f64)> = Vec::new();
        let mut next_end_v2 = 0.0;
        let mut next_smoothed_v2 = 0.0;
        let mut peak_cruise_v2 = 0.0;

        for i in (0..queue.len()).rev() {
            let reachable_start_v2 = next_end_v2 + queue[i].delta_v2;
            let start_v2 = queue[i].max_start_v2.min(reachable_start_v2);
            let reachable_smoothed_v2 = next_smoothed_v2 + queue[i].smooth_delta_v2;
            let smoothed_v2 = queue[i].max_smoothed_v2.min(reachable_smoothed_v2);
            if smoothed_v2 < reachable_smoothed_v2 {
                // This move can accelerate.
                if smoothed_v2 + queue[i].smooth_delta_v2 > next_smoothed_v2 || !delayed.is_empty()
                {
                    // It also decelerates (or follows a full decel); its
                    // peak pins the cruise speed of the delayed tail.
                    if update_flush_count && peak_cruise_v2 != 0.0 {
                        flush_count = i;
                        update_flush_count = false;
                    }
                    peak_cruise_v2 = queue[i]
                        .max_cruise_v2
                        .min((smoothed_v2 + reachable_smoothed_v2) * 0.5);
                    if !delayed.is_empty() {
                        if !update_flush_count && i < flush_count {
                            let mut mc_v2 = peak_cruise_v2;
                            for &(j, ms_v2, me_v2) in delayed.iter().rev() {
                                mc_v2 = mc_v2.min(ms_v2);
                                queue[j].set_junction(ms_v2.min(mc_v2), mc_v2, me_v2.min(mc_v2));
                            }
                        }
                        delayed.clear();
                    }
                }
                if !update_flush_count && i < flush_count {
                    let cruise_v2 = ((start_v2 + reachable_start_v2) * 0.5)
                        .min(queue[i].max_cruise_v2)
                        .min(peak_cruise_v2);
                    queue[i].set_junction(
                        start_v2.min(cruise_v2),
                        cruise_v2,
                        next_end_v2.min(cruise_v2),
                    );
                }
            } else {
                // Peak cruise speed still unknown; finalize later.
                delayed.push((i, start_v2, next_end_v2));
            }
            next_end_v2 = start_v2;
            next_smoothed_v2 = smoothed_v2;
        }

        if update_flush_count || flush_count == 0 {
            return Vec::new();
        }
        queue.drain(..flush_count).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> PlannerLimits {
        let max_accel = 3000.0;
        let scv: f64 = 5.0;
        PlannerLimits {
            max_velocity: 300.0,
            max_accel,
            max_accel_to_decel: max_accel * 0.5,
            junction_deviation: scv.powi(2) * (2f64.sqrt() - 1.0) / max_accel,
            axis_count: 3,
        }
    }

    fn pos(x: f64, y: f64) -> Vec<f64> {
        vec![x, y, 0.0, 0.0]
    }

    fn plan(targets: &[(f64, f64)], speed: f64) -> Vec<Move> {
        let limits = limits();
        let mut queue = MoveQueue::new();
        let mut current = pos(0.0, 0.0);
        for &(x, y) in targets {
            let mut m = Move::new(current.clone(), pos(x, y), speed, &limits);
            if let Some(prev) = queue.last() {
                let v2 = m.max_cruise_v2;
                m.calc_junction(prev, v2);
            }
            current = m.end_pos.clone();
            queue.add_move(m);
        }
        queue.flush(false)
    }

    fn integral(m: &Move) -> f64 {
        0.5 * (m.start_v + m.cruise_v) * m.accel_t
            + m.cruise_v * m.cruise_t
            + 0.5 * (m.end_v + m.cruise_v) * m.decel_t
    }

    #[test]
    fn collinear_moves_share_junction_speed() {
        let moves = plan(&[(100.0, 0.0), (200.0, 0.0), (300.0, 0.0)], 100.0);
        assert_eq!(moves.len(), 3);
        assert_eq!(moves[0].start_v, 0.0);
        assert!((moves[0].end_v - 100.0).abs() < 1e-6);
        assert!((moves[1].start_v - 100.0).abs() < 1e-6);
        assert!((moves[1].end_v - 100.0).abs() < 1e-6);
        assert!((moves[2].start_v - 100.0).abs() < 1e-6);
        assert_eq!(moves[2].end_v, 0.0);
    }

    #[test]
    fn right_angle_junction_is_square_corner_velocity() {
        let moves = plan(&[(10.0, 0.0), (10.0, 10.0)], 100.0);
        assert_eq!(moves.len(), 2);
        // 90 degree corner with square_corner_velocity = 5mm/s.
        assert!((moves[1].start_v - 5.0).abs() < 1e-6, "{}", moves[1].start_v);
        assert!((moves[0].end_v - 5.0).abs() < 1e-6);
    }

    #[test]
    fn velocity_profile_integrates_to_distance() {
        let moves = plan(&[(7.0, 3.0), (11.0, 3.0), (11.0, 20.0), (0.0, 0.0)], 180.0);
        for m in &moves {
            assert!((integral(m) - m.move_d).abs() < 1e-6);
        }
    }

    #[test]
    fn trapezoids_are_valid() {
        let moves = plan(&[(5.0, 0.0), (5.0, 5.0), (25.0, 5.0)], 250.0);
        for m in &moves {
            assert!(m.start_v >= 0.0 && m.end_v >= 0.0);
            assert!(m.cruise_v >= m.start_v && m.cruise_v >= m.end_v);
            assert!(m.accel_t >= 0.0 && m.cruise_t >= -1e-12 && m.decel_t >= 0.0);
        }
    }

    #[test]
    fn junctions_stay_reachable() {
        let moves = plan(
            &[(3.0, 0.0), (3.5, 0.2), (9.0, 4.0), (9.0, 0.0), (0.1, 0.1)],
            200.0,
        );
        for pair in moves.windows(2) {
            let p = &pair[0];
            let c = &pair[1];
            let start_v2 = c.start_v * c.start_v;
            let end_v2 = p.end_v * p.end_v;
            assert!(start_v2 <= end_v2 + 2.0 * c.accel * c.move_d + 1e-6);
        }
    }

    #[test]
    fn reversed_path_mirrors_trapezoids() {
        let forward = plan(&[(40.0, 0.0), (40.0, 30.0), (90.0, 30.0)], 150.0);
        // Reverse: same geometry walked backward from the far end.
        let limits = limits();
        let mut queue = MoveQueue::new();
        let points = [
            pos(90.0, 30.0),
            pos(40.0, 30.0),
            pos(40.0, 0.0),
            pos(0.0, 0.0),
        ];
        for pair in points.windows(2) {
            let mut m = Move::new(pair[0].clone(), pair[1].clone(), 150.0, &limits);
            if let Some(prev) = queue.last() {
                let v2 = m.max_cruise_v2;
                m.calc_junction(prev, v2);
            }
            queue.add_move(m);
        }
        let backward = queue.flush(false);
        assert_eq!(forward.len(), backward.len());
        for (f, b) in forward.iter().zip(backward.iter().rev()) {
            assert!((f.start_v - b.end_v).abs() < 1e-6);
            assert!((f.end_v - b.start_v).abs() < 1e-6);
            assert!((f.cruise_v - b.cruise_v).abs() < 1e-6);
            assert!((f.accel_t - b.decel_t).abs() < 1e-6);
            assert!((f.decel_t - b.accel_t).abs() < 1e-6);
        }
    }

    #[test]
    fn extrude_only_move_is_not_kinematic() {
        let limits = limits();
        let m = Move::new(vec![5.0, 5.0, 0.0, 1.0], vec![5.0, 5.0, 0.0, 4.0], 30.0, &limits);
        assert!(!m.is_kinematic_move);
        assert!((m.move_d - 3.0).abs() < 1e-12);
        assert_eq!(m.axes_d[0], 0.0);
        assert!((m.axes_r[3] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn limit_speed_only_tightens() {
        let limits = limits();
        let mut m = Move::new(pos(0.0, 0.0), pos(100.0, 0.0), 100.0, &limits);
        m.limit_speed(250.0, 9000.0);
        assert!((m.max_cruise_v2 - 100.0 * 100.0).abs() < 1e-9);
        assert!((m.accel - 3000.0).abs() < 1e-9);
        m.limit_speed(50.0, 1000.0);
        assert!((m.max_cruise_v2 - 2500.0).abs() < 1e-9);
        assert!((m.accel - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn lazy_flush_holds_back_unprovable_tail() {
        let limits = limits();
        let mut queue = MoveQueue::new();
        let mut current = pos(0.0, 0.0);
        // A long accelerating run: without a known deceleration point the
        // lazy flush cannot release anything.
        for i in 1..=4 {
            let mut m = Move::new(current.clone(), pos(i as f64 * 2.0, 0.0), 300.0, &limits);
            if let Some(prev) = queue.last() {
                let v2 = m.max_cruise_v2;
                m.calc_junction(prev, v2);
            }
            current = m.end_pos.clone();
            queue.add_move(m);
        }
        let released = queue.flush(true);
        assert!(released.len() < 4);
        let rest = queue.flush(false);
        assert_eq!(released.len() + rest.len(), 4);
    }
}
