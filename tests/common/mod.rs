// Shared fixture: a full motion pipeline wired to the in-process MCU.
use std::sync::Arc;

use stepflow::config::parse_config;
use stepflow::mcu::{Mcu, McuTransport, VirtualMcu};
use stepflow::{CommandDispatcher, EventBus, GCodeCommand, Reactor, ShutdownState};

pub const BASE_CONFIG: &str = r#"
[printer]
kinematics = "cartesian"
max_velocity = 300.0
max_accel = 3000.0

[steppers.x]
step_pin = "PA0"
dir_pin = "PA1"
rotation_distance = 40.0
microsteps = 16
endstop_pin = "PB0"
position_max = 200.0
position_endstop = 0.0
homing_speed = 50.0
second_homing_speed = 10.0
homing_retract_dist = 5.0

[steppers.y]
step_pin = "PA2"
dir_pin = "PA3"
rotation_distance = 40.0
microsteps = 16
endstop_pin = "PB1"
position_max = 200.0
position_endstop = 0.0
homing_speed = 50.0

[steppers.z]
step_pin = "PA4"
dir_pin = "PA5"
rotation_distance = 8.0
microsteps = 16
endstop_pin = "PB2"
position_max = 180.0
position_endstop = 0.0
homing_speed = 10.0

[extruder]
step_pin = "PC0"
dir_pin = "PC1"
rotation_distance = 22.678
microsteps = 16
nozzle_diameter = 0.4
filament_diameter = 1.75

[probe]
pin = "PD0"
speed = 5.0
recovery_time = 0.0

[manual_stepper.feeder]
step_pin = "PC4"
dir_pin = "PC5"
rotation_distance = 20.0
microsteps = 16
endstop_pin = "PD1"
velocity = 5.0
accel = 500.0
"#;

pub struct TestRig {
    pub dispatcher: CommandDispatcher,
    pub vmcu: Arc<VirtualMcu>,
    pub reactor: Reactor,
    pub shutdown: ShutdownState,
}

pub fn build_rig() -> TestRig {
    build_rig_with(BASE_CONFIG)
}

pub fn build_rig_with(config_text: &str) -> TestRig {
    let config = parse_config(config_text).expect("test config");
    let reactor = Reactor::new();
    let shutdown = ShutdownState::new();
    let events = EventBus::default();
    let vmcu = Arc::new(VirtualMcu::new(config.mcu.frequency, reactor.clone()));
    let transport: Arc<dyn McuTransport> = vmcu.clone();
    let mcu = Arc::new(Mcu::new(
        config.mcu.frequency,
        reactor.clone(),
        transport,
        shutdown.clone(),
    ));
    let dispatcher =
        CommandDispatcher::build(&config, mcu, reactor.clone(), events, shutdown.clone())
            .expect("build dispatcher");
    TestRig {
        dispatcher,
        vmcu,
        reactor,
        shutdown,
    }
}

impl TestRig {
    /// Oid of the primary endstop on a kinematic axis.
    pub fn endstop_oid(&self, axis: usize) -> u32 {
        let th = self.dispatcher.toolhead();
        let (kin, rail) = th.lookup_rail(axis).expect("axis rail");
        th.kin(kin).rail(rail).get_endstops()[0].0.oid()
    }

    pub fn probe_oid(&self) -> u32 {
        self.dispatcher.probe().expect("probe").endstop().oid()
    }

    pub fn position(&self) -> Vec<f64> {
        self.dispatcher.toolhead().get_position()
    }

    pub async fn run(&mut self, line: &str) -> stepflow::Result<String> {
        let cmd = GCodeCommand::parse(line).expect("command line");
        self.dispatcher.execute(&cmd).await
    }
}
