// src/mcu.rs
//
// Host side of the MCU link. The wire format is out of scope here: the link
// is a typed channel carrying the commands below plus a position query and
// an endstop arming handshake. `VirtualMcu` implements the whole contract in
// process (it "executes" queued steps on the shared print clock) and backs
// both the test suite and the demo binary; `SerialTransport` forwards the
// same commands as text lines for hardware bring-up.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{CommandError, Result, ShutdownState};
use crate::guard;
use crate::reactor::{Completion, Reactor};
use crate::stepcompress::StepCompress;

/// Maximum stepcompress scheduling error, in seconds (25us).
const MAX_STEPPER_ERROR: f64 = 0.000_025;
/// Transmitted step history kept for past-position queries, in seconds.
const HISTORY_RETENTION: f64 = 30.0;

#[derive(Debug, Clone, PartialEq)]
pub enum McuCommand {
    ConfigStepper {
        oid: u32,
        step_pin: String,
        dir_pin: String,
        invert_step: bool,
        step_pulse_ticks: u32,
    },
    ResetStepClock {
        oid: u32,
        clock: u64,
    },
    QueueStep {
        oid: u32,
        interval: u32,
        count: u16,
        add: i16,
    },
    SetNextStepDir {
        oid: u32,
        dir: bool,
    },
    StepperGetPosition {
        oid: u32,
    },
    EndstopHome {
        oid: u32,
        clock: u64,
        sample_ticks: u64,
        sample_count: u16,
        rest_ticks: u64,
        pin_value: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EndstopState {
    Triggered { clock: u64 },
    NotTriggered,
    CommTimeout,
}

pub struct EndstopArm {
    pub oid: u32,
    pub clock: u64,
    pub sample_ticks: u64,
    pub sample_count: u16,
    pub rest_ticks: u64,
    pub pin_value: bool,
}

/// The transport behind the typed channel.
pub trait McuTransport: Send + Sync {
    fn send(&self, cmd: McuCommand);
    /// Round-trip for `stepper_get_position`.
    fn query_stepper_position(&self, oid: u32) -> i64;
    /// Arm an endstop; the completion fires on trigger (posting `false`) or
    /// on a communication fault (posting `true`).
    fn arm_endstop(&self, arm: EndstopArm, completion: Completion<bool>);
    /// Disarm and report the observed trigger state.
    fn stop_endstop(&self, oid: u32) -> EndstopState;
    /// Steppers halted synchronously when the endstop fires.
    fn register_endstop_stepper(&self, endstop_oid: u32, stepper_oid: u32);
}

pub struct Mcu {
    freq: f64,
    reactor: Reactor,
    boot_eventtime: f64,
    transport: Arc<dyn McuTransport>,
    stepqueues: Mutex<Vec<Arc<Mutex<StepCompress>>>>,
    oid_counter: AtomicU32,
    shutdown: ShutdownState,
}

impl Mcu {
    pub fn new(
        freq: f64,
        reactor: Reactor,
        transport: Arc<dyn McuTransport>,
        shutdown: ShutdownState,
    ) -> Self {
        let boot_eventtime = reactor.monotonic();
        Self {
            freq,
            reactor,
            boot_eventtime,
            transport,
            stepqueues: Mutex::new(Vec::new()),
            oid_counter: AtomicU32::new(0),
            shutdown,
        }
    }

    pub fn create_oid(&self) -> u32 {
        self.oid_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn freq(&self) -> f64 {
        self.freq
    }

    pub fn transport(&self) -> Arc<dyn McuTransport> {
        self.transport.clone()
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.shutdown.clone()
    }

    pub fn max_stepper_error(&self) -> f64 {
        MAX_STEPPER_ERROR
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn estimated_print_time(&self, eventtime: f64) -> f64 {
        eventtime - self.boot_eventtime
    }

    pub fn estimated_print_time_now(&self) -> f64 {
        self.estimated_print_time(self.reactor.monotonic())
    }

    pub fn event_time_for_print_time(&self, print_time: f64) -> f64 {
        self.boot_eventtime + print_time
    }

    pub fn print_time_to_clock(&self, print_time: f64) -> u64 {
        let clock = print_time * self.freq;
        if clock <= 0.0 {
            0
        } else {
            clock as u64
        }
    }

    pub fn clock_to_print_time(&self, clock: u64) -> f64 {
        clock as f64 / self.freq
    }

    pub fn seconds_to_clock(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.freq) as u64
    }

    pub fn register_step_queue(&self, queue: Arc<Mutex<StepCompress>>) {
        guard(&queue).set_time(0.0, self.freq);
        guard(&self.stepqueues).push(queue);
    }

    pub fn send(&self, cmd: McuCommand) {
        self.transport.send(cmd);
    }

    /// Find and transmit any scheduled steps prior to `flush_time`.
    pub fn flush_moves(&self, flush_time: f64) -> Result<()> {
        if self.shutdown.is_shutdown() {
            return Ok(());
        }
        let clock = self.print_time_to_clock(flush_time);
        let history_clock = clock.saturating_sub(self.seconds_to_clock(HISTORY_RETENTION));
        let queues = guard(&self.stepqueues).clone();
        for queue in queues {
            let mut queue = guard(&queue);
            if let Err(e) = queue.flush(clock) {
                drop(queue);
                self.shutdown.invoke(e.to_string());
                return Err(CommandError::StepCompress(e));
            }
            queue.expire_history(history_clock);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Virtual MCU

#[derive(Debug, Clone, Copy)]
enum TriggerPlan {
    /// Fire a fixed delay (print seconds) after each arming.
    AfterArm(f64),
    /// Fire at an absolute print time (immediately if already past).
    AtTime(f64),
    /// Simulate a lost link during homing.
    CommFail,
}

#[derive(Default)]
struct VirtualStepper {
    last_clock: u64,
    dir: bool,
    /// Executed step events as (clock, +1/-1).
    steps: Vec<(u64, i8)>,
    /// Steps after this clock were discarded by the endstop halt.
    halt_clock: Option<u64>,
}

struct ArmedEndstop {
    seq: u64,
    completion: Completion<bool>,
}

#[derive(Default)]
struct VirtualEndstop {
    steppers: Vec<u32>,
    plan: Option<TriggerPlan>,
    armed: Option<ArmedEndstop>,
    result: EndstopState,
    stop_latency: f64,
}

impl Default for EndstopState {
    fn default() -> Self {
        EndstopState::NotTriggered
    }
}

#[derive(Default)]
struct VirtualState {
    commands: Vec<McuCommand>,
    steppers: HashMap<u32, VirtualStepper>,
    endstops: HashMap<u32, VirtualEndstop>,
}

/// In-process MCU: consumes the typed command stream, "executes" steps at
/// their scheduled clocks, and emulates endstop tri-sync halts.
pub struct VirtualMcu {
    freq: f64,
    reactor: Reactor,
    boot_eventtime: f64,
    arm_seq: AtomicU64,
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualMcu {
    pub fn new(freq: f64, reactor: Reactor) -> Self {
        let boot_eventtime = reactor.monotonic();
        Self {
            freq,
            reactor,
            boot_eventtime,
            arm_seq: AtomicU64::new(0),
            state: Arc::new(Mutex::new(VirtualState::default())),
        }
    }

    fn now_clock(&self) -> u64 {
        let t = self.reactor.monotonic() - self.boot_eventtime;
        if t <= 0.0 {
            0
        } else {
            (t * self.freq) as u64
        }
    }

    fn clock_for(&self, print_time: f64) -> u64 {
        if print_time <= 0.0 {
            0
        } else {
            (print_time * self.freq) as u64
        }
    }

    /// All commands observed so far (testing aid).
    pub fn commands(&self) -> Vec<McuCommand> {
        guard(self.state.as_ref()).commands.clone()
    }

    /// Program an endstop to trigger `delay` print seconds after each arm.
    pub fn plan_trigger_after(&self, oid: u32, delay: f64) {
        guard(self.state.as_ref()).endstops.entry(oid).or_default().plan =
            Some(TriggerPlan::AfterArm(delay));
    }

    /// Program an endstop to trigger at an absolute print time.
    pub fn plan_trigger_at(&self, oid: u32, print_time: f64) {
        guard(self.state.as_ref()).endstops.entry(oid).or_default().plan =
            Some(TriggerPlan::AtTime(print_time));
    }

    /// Drop the trigger plan; the pin never fires.
    pub fn plan_no_trigger(&self, oid: u32) {
        guard(self.state.as_ref()).endstops.entry(oid).or_default().plan = None;
    }

    /// Simulate a communication fault on the next homing attempt.
    pub fn fail_homing(&self, oid: u32) {
        guard(self.state.as_ref()).endstops.entry(oid).or_default().plan = Some(TriggerPlan::CommFail);
    }

    /// Extra motion (print seconds) executed between trigger and motor halt.
    pub fn set_stop_latency(&self, oid: u32, latency: f64) {
        guard(self.state.as_ref()).endstops.entry(oid).or_default().stop_latency = latency;
    }

    /// Executed step position of a stepper at the given clock.
    pub fn stepper_position_at(&self, oid: u32, clock: u64) -> i64 {
        let state = guard(self.state.as_ref());
        let Some(stepper) = state.steppers.get(&oid) else {
            return 0;
        };
        stepper
            .steps
            .iter()
            .take_while(|(c, _)| *c <= clock)
            .map(|(_, d)| *d as i64)
            .sum()
    }

    fn fire_trigger(&self, oid: u32, seq: u64, trigger_pt: f64) {
        let state = self.state.clone();
        let reactor = self.reactor.clone();
        let freq = self.freq;
        let deadline = self.boot_eventtime + trigger_pt;
        let clock_for = move |pt: f64| if pt <= 0.0 { 0 } else { (pt * freq) as u64 };
        tokio::spawn(async move {
            reactor.pause(deadline).await;
            let completion = {
                let mut state = state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                let clock = clock_for(trigger_pt);
                let Some(endstop) = state.endstops.get_mut(&oid) else {
                    return;
                };
                match &endstop.armed {
                    Some(armed) if armed.seq == seq => {}
                    _ => return,
                }
                endstop.result = EndstopState::Triggered { clock };
                let latency = endstop.stop_latency;
                let halt_clock = clock_for(trigger_pt + latency);
                let halted: Vec<u32> = endstop.steppers.clone();
                for stepper_oid in halted {
                    let stepper = state.steppers.entry(stepper_oid).or_default();
                    stepper.halt_clock = Some(halt_clock);
                    // Tri-sync: queued steps past the halt never execute.
                    stepper.steps.retain(|(c, _)| *c <= halt_clock);
                }
                state
                    .endstops
                    .get(&oid)
                    .and_then(|e| e.armed.as_ref().map(|a| a.completion.clone()))
            };
            if let Some(completion) = completion {
                completion.complete(false);
            }
        });
    }
}

impl McuTransport for VirtualMcu {
    fn send(&self, cmd: McuCommand) {
        let mut state = guard(self.state.as_ref());
        match &cmd {
            McuCommand::ConfigStepper { oid, .. } => {
                state.steppers.entry(*oid).or_default();
            }
            McuCommand::ResetStepClock { oid, clock } => {
                let stepper = state.steppers.entry(*oid).or_default();
                stepper.last_clock = *clock;
                stepper.halt_clock = None;
            }
            McuCommand::SetNextStepDir { oid, dir } => {
                state.steppers.entry(*oid).or_default().dir = *dir;
            }
            McuCommand::QueueStep {
                oid,
                interval,
                count,
                add,
            } => {
                let stepper = state.steppers.entry(*oid).or_default();
                let sign = if stepper.dir { 1 } else { -1 };
                let mut clock = stepper.last_clock;
                let mut interval = *interval as i64;
                for _ in 0..*count {
                    clock = clock.saturating_add(interval.max(0) as u64);
                    let executed = stepper.halt_clock.map_or(true, |halt| clock <= halt);
                    if executed {
                        stepper.steps.push((clock, sign));
                    }
                    interval += *add as i64;
                }
                stepper.last_clock = clock;
            }
            _ => {}
        }
        state.commands.push(cmd);
    }

    fn query_stepper_position(&self, oid: u32) -> i64 {
        let now = self.now_clock();
        self.stepper_position_at(oid, now)
    }

    fn arm_endstop(&self, arm: EndstopArm, completion: Completion<bool>) {
        let seq = self.arm_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.send(McuCommand::EndstopHome {
            oid: arm.oid,
            clock: arm.clock,
            sample_ticks: arm.sample_ticks,
            sample_count: arm.sample_count,
            rest_ticks: arm.rest_ticks,
            pin_value: arm.pin_value,
        });
        let plan;
        {
            let mut state = guard(self.state.as_ref());
            let endstop = state.endstops.entry(arm.oid).or_default();
            endstop.result = EndstopState::NotTriggered;
            endstop.armed = Some(ArmedEndstop {
                seq,
                completion: completion.clone(),
            });
            plan = endstop.plan;
        }
        match plan {
            Some(TriggerPlan::CommFail) => {
                guard(self.state.as_ref())
                    .endstops
                    .entry(arm.oid)
                    .or_default()
                    .result = EndstopState::CommTimeout;
                completion.complete(true);
            }
            Some(TriggerPlan::AfterArm(delay)) => {
                let arm_pt = arm.clock as f64 / self.freq;
                self.fire_trigger(arm.oid, seq, arm_pt + delay);
            }
            Some(TriggerPlan::AtTime(pt)) => {
                self.fire_trigger(arm.oid, seq, pt);
            }
            None => {}
        }
    }

    fn stop_endstop(&self, oid: u32) -> EndstopState {
        let mut state = guard(self.state.as_ref());
        let Some(endstop) = state.endstops.get_mut(&oid) else {
            return EndstopState::NotTriggered;
        };
        endstop.armed = None;
        endstop.result
    }

    fn register_endstop_stepper(&self, endstop_oid: u32, stepper_oid: u32) {
        let mut state = guard(self.state.as_ref());
        let endstop = state.endstops.entry(endstop_oid).or_default();
        if !endstop.steppers.contains(&stepper_oid) {
            endstop.steppers.push(stepper_oid);
        }
    }
}

// ---------------------------------------------------------------------------
// Serial line transport

/// Best-effort line protocol for bring-up on real hardware. Commands are
/// rendered as single text lines; queries and endstop handshakes are not
/// round-tripped on this transport.
pub struct SerialTransport {
    tx: tokio::sync::mpsc::UnboundedSender<String>,
}

impl SerialTransport {
    pub fn open(device: &str, baud: u32) -> Result<Arc<Self>> {
        let port = serial2_tokio::SerialPort::open(device, baud)
            .map_err(|e| CommandError::config(format!("unable to open {device}: {e}")))?;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = port.write(line.as_bytes()).await {
                    tracing::warn!("serial write failed: {e}");
                    break;
                }
            }
        });
        Ok(Arc::new(Self { tx }))
    }

    fn render(cmd: &McuCommand) -> String {
        match cmd {
            McuCommand::ConfigStepper {
                oid,
                step_pin,
                dir_pin,
                invert_step,
                step_pulse_ticks,
            } => format!(
                "config_stepper oid={oid} step_pin={step_pin} dir_pin={dir_pin} invert_step={} step_pulse_ticks={step_pulse_ticks}\n",
                *invert_step as u8
            ),
            McuCommand::ResetStepClock { oid, clock } => {
                format!("reset_step_clock oid={oid} clock={clock}\n")
            }
            McuCommand::QueueStep {
                oid,
                interval,
                count,
                add,
            } => format!("queue_step oid={oid} interval={interval} count={count} add={add}\n"),
            McuCommand::SetNextStepDir { oid, dir } => {
                format!("set_next_step_dir oid={oid} dir={}\n", *dir as u8)
            }
            McuCommand::StepperGetPosition { oid } => {
                format!("stepper_get_position oid={oid}\n")
            }
            McuCommand::EndstopHome {
                oid,
                clock,
                sample_ticks,
                sample_count,
                rest_ticks,
                pin_value,
            } => format!(
                "endstop_home oid={oid} clock={clock} sample_ticks={sample_ticks} sample_count={sample_count} rest_ticks={rest_ticks} pin_value={}\n",
                *pin_value as u8
            ),
        }
    }
}

impl McuTransport for SerialTransport {
    fn send(&self, cmd: McuCommand) {
        let _ = self.tx.send(Self::render(&cmd));
    }

    fn query_stepper_position(&self, _oid: u32) -> i64 {
        0
    }

    fn arm_endstop(&self, arm: EndstopArm, _completion: Completion<bool>) {
        self.send(McuCommand::EndstopHome {
            oid: arm.oid,
            clock: arm.clock,
            sample_ticks: arm.sample_ticks,
            sample_count: arm.sample_count,
            rest_ticks: arm.rest_ticks,
            pin_value: arm.pin_value,
        });
    }

    fn stop_endstop(&self, _oid: u32) -> EndstopState {
        EndstopState::NotTriggered
    }

    fn register_endstop_stepper(&self, _endstop_oid: u32, _stepper_oid: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn virtual_mcu_counts_steps() {
        let reactor = Reactor::new();
        let mcu = VirtualMcu::new(1_000_000.0, reactor);
        mcu.send(McuCommand::ConfigStepper {
            oid: 0,
            step_pin: "PA0".into(),
            dir_pin: "PA1".into(),
            invert_step: false,
            step_pulse_ticks: 32,
        });
        mcu.send(McuCommand::SetNextStepDir { oid: 0, dir: true });
        mcu.send(McuCommand::QueueStep {
            oid: 0,
            interval: 100,
            count: 5,
            add: 0,
        });
        assert_eq!(mcu.stepper_position_at(0, 1_000_000), 5);
        assert_eq!(mcu.stepper_position_at(0, 250), 2);
        mcu.send(McuCommand::SetNextStepDir { oid: 0, dir: false });
        mcu.send(McuCommand::QueueStep {
            oid: 0,
            interval: 100,
            count: 2,
            add: 0,
        });
        assert_eq!(mcu.stepper_position_at(0, 1_000_000), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn virtual_endstop_triggers_on_schedule() {
        let reactor = Reactor::new();
        let mcu = VirtualMcu::new(1_000_000.0, reactor.clone());
        mcu.plan_trigger_at(7, 0.25);
        let completion: Completion<bool> = Completion::new();
        mcu.arm_endstop(
            EndstopArm {
                oid: 7,
                clock: 0,
                sample_ticks: 15,
                sample_count: 4,
                rest_ticks: 1000,
                pin_value: true,
            },
            completion.clone(),
        );
        assert!(!completion.test());
        assert!(!completion.wait().await);
        match mcu.stop_endstop(7) {
            EndstopState::Triggered { clock } => assert_eq!(clock, 250_000),
            other => panic!("unexpected endstop state {other:?}"),
        }
    }
}
