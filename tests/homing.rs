// Homing and probing flows: G28 retract sequences, G38 variants, drip
// cancellation, and halt/trigger position reconstruction.
mod common;

use common::{build_rig, build_rig_with};
use stepflow::mcu::McuCommand;
use stepflow::CommandError;

fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[tokio::test(start_paused = true)]
async fn g28_runs_two_passes_with_retract() {
    let mut rig = build_rig();
    let x_oid = rig.endstop_oid(0);
    rig.vmcu.plan_trigger_after(x_oid, 0.5);
    rig.run("G28 X").await.expect("home x");

    // Final position is the endstop position.
    assert!((rig.position()[0] - 0.0).abs() < 1e-9);
    // Two arming commands: first pass and the precision pass.
    let arms = rig
        .vmcu
        .commands()
        .iter()
        .filter(|c| matches!(c, McuCommand::EndstopHome { oid, .. } if *oid == x_oid))
        .count();
    assert_eq!(arms, 2);
    // The step clock was restarted after each pass.
    let th = rig.dispatcher.toolhead();
    let stepper = &th.kin(0).rail(0).get_steppers()[0];
    let stepper_oid = lock(stepper).oid();
    let resets = rig
        .vmcu
        .commands()
        .iter()
        .filter(|c| matches!(c, McuCommand::ResetStepClock { oid, .. } if *oid == stepper_oid))
        .count();
    assert!(resets >= 2);
}

#[tokio::test(start_paused = true)]
async fn homing_set_position_is_consistent() {
    let mut rig = build_rig();
    rig.vmcu.plan_trigger_after(rig.endstop_oid(0), 0.5);
    rig.run("G28 X").await.expect("home x");

    let th = rig.dispatcher.toolhead();
    assert!((th.get_position()[0] - 0.0).abs() < 1e-9);
    let stepper = &th.kin(0).rail(0).get_steppers()[0];
    let commanded = lock(stepper).get_commanded_position();
    assert!((commanded - 0.0).abs() < 1e-9);
    // Look-ahead and trapq hold no residue from the interrupted drip move.
    assert_eq!(th.lookahead_len(), 0);
    let tq = th.kin(0).trapq();
    assert!(lock(&tq).is_empty());
}

#[tokio::test(start_paused = true)]
async fn homing_without_trigger_reports_no_trigger() {
    let mut rig = build_rig();
    // No trigger plan: the pin never fires.
    let err = rig.run("G28 Y").await.expect_err("must fail");
    match err {
        CommandError::EndstopNoTrigger(name) => assert_eq!(name, "y"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn homing_comm_timeout_is_fatal() {
    let mut rig = build_rig();
    rig.vmcu.fail_homing(rig.endstop_oid(1));
    let err = rig.run("G28 Y").await.expect_err("must fail");
    match err {
        CommandError::EndstopCommTimeout(name) => assert_eq!(name, "y"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn endstop_still_triggered_after_retract() {
    let mut rig = build_rig();
    // Fires the instant it is armed, on both passes.
    rig.vmcu.plan_trigger_after(rig.endstop_oid(0), 0.0);
    let err = rig.run("G28 X").await.expect_err("must fail");
    assert!(matches!(err, CommandError::EndstopStillTriggered(_)));
}

#[tokio::test(start_paused = true)]
async fn overshoot_after_trigger_is_reconstructed() {
    let retractless = common::BASE_CONFIG.replace(
        "homing_retract_dist = 5.0",
        "homing_retract_dist = 0.0",
    );
    let mut rig = build_rig_with(&retractless);
    let x_oid = rig.endstop_oid(0);
    rig.vmcu.plan_trigger_after(x_oid, 0.5);
    // 10ms of motor halt latency at 50mm/s homing speed: ~0.5mm overshoot.
    rig.vmcu.set_stop_latency(x_oid, 0.010);
    rig.run("G28 X").await.expect("home x");
    let x = rig.position()[0];
    assert!(x < 0.0, "expected overshoot below endstop, got {x}");
    assert!((-0.7..=-0.3).contains(&x), "overshoot {x} out of range");
}

#[tokio::test(start_paused = true)]
async fn g38_2_without_contact_errors_at_endpoint() {
    let mut rig = build_rig();
    rig.vmcu.plan_trigger_after(rig.endstop_oid(0), 0.5);
    rig.run("G28 X").await.expect("home x");

    let err = rig.run("G38.2 X50 F600").await.expect_err("no contact");
    assert!(matches!(err, CommandError::EndstopNoTrigger(_)));
    // The toolhead still ends at the commanded endpoint.
    assert!((rig.position()[0] - 50.0).abs() < 0.02);
}

#[tokio::test(start_paused = true)]
async fn g38_3_without_contact_succeeds() {
    let mut rig = build_rig();
    rig.vmcu.plan_trigger_after(rig.endstop_oid(0), 0.5);
    rig.run("G28 X").await.expect("home x");

    let before = rig.dispatcher.toolhead().print_time();
    let msg = rig.run("G38.3 X50 F600").await.expect("probe");
    assert!(msg.starts_with("probe trigger at"));
    let reported: f64 = msg
        .split_whitespace()
        .nth(3)
        .expect("x value")
        .parse()
        .expect("float");
    assert!((reported - 50.0).abs() < 0.02);
    assert!(rig.dispatcher.toolhead().print_time() >= before);
}

#[tokio::test(start_paused = true)]
async fn g38_contact_reports_trigger_position() {
    let mut rig = build_rig();
    rig.vmcu.plan_trigger_after(rig.endstop_oid(0), 0.5);
    rig.run("G28 X").await.expect("home x");

    // Probe moving 0 -> 50 at 10mm/s; contact after two seconds (~20mm).
    let arm_time = rig.dispatcher.toolhead_mut().get_last_move_time().expect("time");
    rig.vmcu.plan_trigger_at(rig.probe_oid(), arm_time + 2.0);
    let msg = rig.run("G38.2 X50 F600").await.expect("probe");
    let reported: f64 = msg
        .split_whitespace()
        .nth(3)
        .expect("x value")
        .parse()
        .expect("float");
    assert!(
        reported > 1.0 && reported < 49.0,
        "trigger position {reported} not inside the move"
    );
    // The toolhead position matches the reconstructed trigger position.
    assert!((rig.position()[0] - reported).abs() < 0.05);
}

#[tokio::test(start_paused = true)]
async fn probe_triggered_before_movement_errors() {
    let mut rig = build_rig();
    rig.vmcu.plan_trigger_after(rig.endstop_oid(0), 0.5);
    rig.run("G28 X").await.expect("home x");

    // Pin already active: fires the moment it is armed.
    rig.vmcu.plan_trigger_at(rig.probe_oid(), 0.001);
    let err = rig.run("G38.2 X50 F600").await.expect_err("early trigger");
    assert!(matches!(err, CommandError::EndstopEarlyTrigger));
}

#[tokio::test(start_paused = true)]
async fn manual_stepper_moves_and_homes() {
    let mut rig = build_rig();
    rig.run("MANUAL_STEPPER STEPPER=feeder SET_POSITION=0")
        .await
        .expect("set position");
    rig.run("MANUAL_STEPPER STEPPER=feeder MOVE=10 SPEED=20")
        .await
        .expect("move");
    let commanded = rig
        .dispatcher
        .manual_stepper("feeder")
        .expect("feeder")
        .commanded_position();
    assert!((commanded - 10.0).abs() < 0.01, "commanded={commanded}");

    let feeder_oid = rig
        .dispatcher
        .manual_stepper("feeder")
        .expect("feeder")
        .rail()
        .expect("feeder rail")
        .get_endstops()[0]
        .0
        .oid();
    rig.vmcu.plan_trigger_after(feeder_oid, 0.3);
    rig.run("MANUAL_STEPPER STEPPER=feeder MOVE=-5 SPEED=5 STOP_ON_ENDSTOP=1")
        .await
        .expect("homing move");
    let commanded = rig
        .dispatcher
        .manual_stepper("feeder")
        .expect("feeder")
        .commanded_position();
    assert!((commanded - (-5.0)).abs() < 0.01, "commanded={commanded}");
}

#[tokio::test(start_paused = true)]
async fn abc_axes_home_through_second_group() {
    let mut config = String::from(common::BASE_CONFIG);
    config = config.replace(
        "kinematics = \"cartesian\"",
        "kinematics = \"cartesian\"\naxis = \"XYZABC\"",
    );
    config.push_str(
        r#"
[steppers.a]
step_pin = "PE0"
dir_pin = "PE1"
rotation_distance = 40.0
microsteps = 16
endstop_pin = "PF0"
position_max = 100.0
position_endstop = 0.0
homing_speed = 25.0

[steppers.b]
step_pin = "PE2"
dir_pin = "PE3"
rotation_distance = 40.0
microsteps = 16
endstop_pin = "PF1"
position_max = 100.0
position_endstop = 0.0
homing_speed = 25.0

[steppers.c]
step_pin = "PE4"
dir_pin = "PE5"
rotation_distance = 40.0
microsteps = 16
endstop_pin = "PF2"
position_max = 100.0
position_endstop = 0.0
homing_speed = 25.0
"#,
    );
    let mut rig = build_rig_with(&config);
    assert_eq!(rig.dispatcher.toolhead().axis_count(), 6);
    rig.vmcu.plan_trigger_after(rig.endstop_oid(3), 0.5);
    rig.run("G28 A").await.expect("home a");
    assert!((rig.position()[3] - 0.0).abs() < 1e-9);
    let status = rig
        .dispatcher
        .toolhead()
        .get_status(rig.reactor.monotonic());
    assert_eq!(status.homed_axes, "A");
}

#[tokio::test(start_paused = true)]
async fn home_extruder_homes_the_extruder_rail() {
    let config = common::BASE_CONFIG.replace(
        "nozzle_diameter = 0.4",
        "nozzle_diameter = 0.4\nendstop_pin = \"PD2\"\nposition_endstop = 100.0\nhoming_speed = 20.0",
    );
    let mut rig = build_rig_with(&config);
    let th = rig.dispatcher.toolhead();
    let e_oid = th
        .extruder()
        .expect("extruder")
        .rail()
        .expect("extruder rail")
        .get_endstops()[0]
        .0
        .oid();
    rig.vmcu.plan_trigger_after(e_oid, 0.5);
    rig.run("HOME_EXTRUDER").await.expect("home extruder");
    assert!((rig.position()[3] - 100.0).abs() < 1e-9);
}
