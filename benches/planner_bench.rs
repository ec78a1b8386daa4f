use criterion::{black_box, criterion_group, criterion_main, Criterion};
use stepflow::{Move, MoveQueue, PlannerLimits};

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

/// A zigzag toolpath: every junction forces real planning work.
fn zigzag(n: usize) -> Vec<Vec<f64>> {
    let mut points = Vec::with_capacity(n + 1);
    let mut x = 0.0;
    let mut y = 0.0;
    points.push(vec![x, y, 0.0, 0.0]);
    for i in 0..n {
        if i % 2 == 0 {
            x += 5.0;
        } else {
            y += 2.5;
        }
        points.push(vec![x, y, 0.0, 0.0]);
    }
    points
}

fn plan_path(points: &[Vec<f64>]) -> usize {
    let limits = limits();
    let mut queue = MoveQueue::new();
    let mut planned = 0;
    for pair in points.windows(2) {
        let mut m = Move::new(pair[0].clone(), pair[1].clone(), 150.0, &limits);
        if let Some(prev) = queue.last() {
            let v2 = m.max_cruise_v2;
            m.calc_junction(prev, v2);
        }
        if queue.add_move(m) {
            planned += queue.flush(true).len();
        }
    }
    planned + queue.flush(false).len()
}

fn bench_lookahead(c: &mut Criterion) {
    let path = zigzag(256);
    c.bench_function("lookahead_flush_256_zigzag", |b| {
        b.iter(|| {
            let planned = plan_path(black_box(&path));
            assert_eq!(planned, 256);
            planned
        })
    });
}

criterion_group!(benches, bench_lookahead);
criterion_main!(benches);
