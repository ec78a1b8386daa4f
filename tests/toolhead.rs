// Toolhead-level behavior against the virtual MCU.
mod common;

use common::build_rig;
use stepflow::CommandError;

#[tokio::test(start_paused = true)]
async fn move_after_homing_lands_on_target() {
    let mut rig = build_rig();
    rig.vmcu.plan_trigger_after(rig.endstop_oid(0), 0.5);
    rig.run("G28 X").await.expect("home x");
    assert!((rig.position()[0] - 0.0).abs() < 1e-9);

    rig.run("G1 X100 F6000").await.expect("move");
    rig.run("M400").await.expect("wait");
    assert!((rig.position()[0] - 100.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn print_time_never_decreases() {
    let mut rig = build_rig();
    rig.vmcu.plan_trigger_after(rig.endstop_oid(0), 0.5);
    let mut last = rig.dispatcher.toolhead().print_time();
    for line in [
        "G28 X",
        "G1 X50 F6000",
        "G4 P100",
        "G1 X20 F3000",
        "M400",
        "G4 P5",
    ] {
        rig.run(line).await.expect(line);
        let now = rig.dispatcher.toolhead().print_time();
        assert!(now >= last, "print_time went backwards after {line}");
        last = now;
    }
}

#[tokio::test(start_paused = true)]
async fn dwell_advances_print_time() {
    let mut rig = build_rig();
    let before = rig.dispatcher.toolhead_mut().get_last_move_time().expect("time");
    rig.run("G4 P250").await.expect("dwell");
    let after = rig.dispatcher.toolhead().print_time();
    assert!(after >= before + 0.25 - 1e-9);
}

#[tokio::test(start_paused = true)]
async fn unhomed_axis_is_rejected() {
    let mut rig = build_rig();
    let err = rig.run("G1 X10 F6000").await.expect_err("must fail");
    match err {
        CommandError::MustHomeFirst(axis) => assert_eq!(axis, "X"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn out_of_range_move_is_rejected() {
    let mut rig = build_rig();
    rig.vmcu.plan_trigger_after(rig.endstop_oid(0), 0.5);
    rig.run("G28 X").await.expect("home x");
    let err = rig.run("G1 X250 F6000").await.expect_err("must fail");
    assert!(matches!(err, CommandError::MoveOutOfRange(_)));
    // The failed move does not change the commanded position.
    rig.run("G1 X50 F6000").await.expect("valid move");
    rig.run("M400").await.expect("wait");
    assert!((rig.position()[0] - 50.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn cold_extruder_rejects_extrusion() {
    let mut rig = build_rig();
    rig.vmcu.plan_trigger_after(rig.endstop_oid(0), 0.5);
    rig.run("G28 X").await.expect("home x");
    rig.dispatcher
        .toolhead()
        .extruder()
        .expect("extruder")
        .heater()
        .set_can_extrude(false);
    let err = rig.run("G1 X60 E5 F6000").await.expect_err("cold extrude");
    assert!(matches!(err, CommandError::ColdExtrude));
}

#[tokio::test(start_paused = true)]
async fn overlong_extrude_only_move_is_rejected() {
    let mut rig = build_rig();
    let err = rig.run("G1 E60 F300").await.expect_err("too long");
    match err {
        CommandError::ExtrudeLimit(msg) => assert!(msg.contains("Extrude only move too long")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn extruder_tracks_coordinated_moves() {
    let mut rig = build_rig();
    rig.vmcu.plan_trigger_after(rig.endstop_oid(0), 0.5);
    rig.run("G28 X").await.expect("home x");
    rig.run("G1 X50 E2.5 F6000").await.expect("print move");
    rig.run("M400").await.expect("wait");
    assert!((rig.position()[3] - 2.5).abs() < 1e-9);
    let extruder = rig.dispatcher.toolhead().extruder().expect("extruder");
    assert!((extruder.last_position() - 2.5).abs() < 1e-9);
    let stepper = extruder.stepper();
    let commanded = stepper
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .get_commanded_position();
    // Step generation quantizes to whole steps.
    assert!((commanded - 2.5).abs() < 0.02, "commanded={commanded}");
}

#[tokio::test(start_paused = true)]
async fn velocity_limits_are_adjustable() {
    let mut rig = build_rig();
    let msg = rig
        .run("SET_VELOCITY_LIMIT VELOCITY=200 ACCEL=1500 SQUARE_CORNER_VELOCITY=8")
        .await
        .expect("set limits");
    assert!(msg.contains("max_velocity: 200.000000"));
    let status = rig
        .dispatcher
        .toolhead()
        .get_status(rig.reactor.monotonic());
    assert_eq!(status.max_velocity, 200.0);
    assert_eq!(status.max_accel, 1500.0);
    assert_eq!(status.square_corner_velocity, 8.0);

    rig.run("M204 S4000").await.expect("m204");
    let status = rig
        .dispatcher
        .toolhead()
        .get_status(rig.reactor.monotonic());
    assert_eq!(status.max_accel, 4000.0);
}

#[tokio::test(start_paused = true)]
async fn homed_axes_reported_in_status() {
    let mut rig = build_rig();
    rig.vmcu.plan_trigger_after(rig.endstop_oid(0), 0.5);
    rig.vmcu.plan_trigger_after(rig.endstop_oid(1), 0.5);
    let status = rig
        .dispatcher
        .toolhead()
        .get_status(rig.reactor.monotonic());
    assert_eq!(status.homed_axes, "");
    rig.run("G28 X Y").await.expect("home xy");
    let status = rig
        .dispatcher
        .toolhead()
        .get_status(rig.reactor.monotonic());
    assert_eq!(status.homed_axes, "XY");
}

#[tokio::test(start_paused = true)]
async fn wait_moves_catches_up_to_mcu_clock() {
    let mut rig = build_rig();
    rig.vmcu.plan_trigger_after(rig.endstop_oid(0), 0.5);
    rig.run("G28 X").await.expect("home x");
    rig.run("G1 X120 F6000").await.expect("move");
    rig.run("M400").await.expect("wait");
    let th = rig.dispatcher.toolhead();
    let est = th.mcu().estimated_print_time(rig.reactor.monotonic());
    assert!(est >= th.print_time() - 1e-6);
}

#[tokio::test(start_paused = true)]
async fn shutdown_latches_and_rejects_commands() {
    let mut rig = build_rig();
    rig.shutdown.invoke("test shutdown");
    let err = rig.run("G4 P10").await.expect_err("must fail");
    assert!(matches!(err, CommandError::Shutdown(_)));
}
