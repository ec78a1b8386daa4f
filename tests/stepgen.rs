// Step stream invariants observed at the MCU boundary.
mod common;

use common::build_rig;
use std::collections::HashMap;
use stepflow::mcu::McuCommand;

/// Expand the queue_step stream into absolute step clocks per stepper,
/// split into runs at each reset_step_clock.
fn step_clock_runs(commands: &[McuCommand]) -> HashMap<u32, Vec<Vec<u64>>> {
    let mut runs: HashMap<u32, Vec<Vec<u64>>> = HashMap::new();
    let mut last_clock: HashMap<u32, u64> = HashMap::new();
    for cmd in commands {
        match cmd {
            McuCommand::ConfigStepper { oid, .. } => {
                runs.entry(*oid).or_default().push(Vec::new());
                last_clock.insert(*oid, 0);
            }
            McuCommand::ResetStepClock { oid, clock } => {
                runs.entry(*oid).or_default().push(Vec::new());
                last_clock.insert(*oid, *clock);
            }
            McuCommand::QueueStep {
                oid,
                interval,
                count,
                add,
            } => {
                let clock = last_clock.entry(*oid).or_insert(0);
                let run = runs.entry(*oid).or_default();
                if run.is_empty() {
                    run.push(Vec::new());
                }
                let current = run.last_mut().expect("run exists");
                let mut interval = *interval as i64;
                for _ in 0..*count {
                    *clock = clock.saturating_add(interval.max(0) as u64);
                    current.push(*clock);
                    interval += *add as i64;
                }
            }
            _ => {}
        }
    }
    runs
}

#[tokio::test(start_paused = true)]
async fn step_clocks_increase_monotonically() {
    let mut rig = build_rig();
    rig.vmcu.plan_trigger_after(rig.endstop_oid(0), 0.5);
    rig.run("G28 X").await.expect("home x");
    for line in [
        "G1 X80 F6000",
        "G1 X20 F6000",
        "G1 X120 Y0 F9000",
        "M400",
    ] {
        rig.run(line).await.expect(line);
    }

    let runs = step_clock_runs(&rig.vmcu.commands());
    assert!(!runs.is_empty());
    let mut total_steps = 0usize;
    for (oid, oid_runs) in runs {
        for run in oid_runs {
            total_steps += run.len();
            for pair in run.windows(2) {
                assert!(
                    pair[1] > pair[0],
                    "stepper {oid}: step clock {} not after {}",
                    pair[1],
                    pair[0]
                );
            }
        }
    }
    assert!(total_steps > 1000, "only {total_steps} steps generated");
}

#[tokio::test(start_paused = true)]
async fn executed_steps_match_commanded_distance() {
    let mut rig = build_rig();
    rig.vmcu.plan_trigger_after(rig.endstop_oid(0), 0.5);
    rig.run("G28 X").await.expect("home x");
    rig.run("G1 X100 F6000").await.expect("move");
    rig.run("M400").await.expect("wait");

    let th = rig.dispatcher.toolhead();
    let stepper = &th.kin(0).rail(0).get_steppers()[0];
    let stepper = stepper
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    assert!(
        (stepper.get_commanded_position() - 100.0).abs() < stepper.step_dist() + 1e-9,
        "commanded {}",
        stepper.get_commanded_position()
    );
    // The host's view of the MCU step counter matches what the MCU
    // actually executed.
    let executed = rig.vmcu.stepper_position_at(stepper.oid(), u64::MAX);
    let host_view = stepper.get_mcu_position();
    assert!(
        (host_view - executed).abs() <= 1,
        "host={host_view} mcu={executed}"
    );
}
