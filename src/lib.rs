// src/lib.rs
//
// Host-side motion core: look-ahead planning, trapezoid queues, iterative
// step generation and homing/probing coordination on a shared print clock.
pub mod config;
pub mod endstop;
pub mod error;
pub mod events;
pub mod gcode;
pub mod homing;
pub mod itersolve;
pub mod kinematics;
pub mod manual_stepper;
pub mod mcu;
pub mod motion;
pub mod probe;
pub mod rail;
pub mod reactor;
pub mod stepcompress;
pub mod stepper;
pub mod toolhead;
pub mod trapq;

pub use config::{load_config, Config};
pub use error::{CommandError, Result, ShutdownState};
pub use events::{Event, EventBus};
pub use gcode::{CommandDispatcher, GCodeCommand};
pub use homing::PrinterHoming;
pub use mcu::{Mcu, McuCommand, VirtualMcu};
pub use motion::{Move, MoveQueue, PlannerLimits};
pub use reactor::{Completion, Reactor};
pub use toolhead::{DripOutcome, QueuingState, Toolhead};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, shrugging off poisoning: pipeline state is guarded by the
/// single-owner discipline, so a panicked holder cannot leave partial
/// updates that matter here.
pub(crate) fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
