// src/error.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::stepcompress::StepCompressError;

/// Errors surfaced to the command layer. Every variant carries enough to
/// render the conventional "!!" message for the originating command.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error("{0}")]
    Config(String),
    #[error("Move out of range: {0}")]
    MoveOutOfRange(String),
    #[error("Must home axis {0} first")]
    MustHomeFirst(String),
    #[error("No trigger on {0} after full movement")]
    EndstopNoTrigger(String),
    #[error("Communication timeout during homing {0}")]
    EndstopCommTimeout(String),
    #[error("Probe triggered prior to movement")]
    EndstopEarlyTrigger,
    #[error("Endstop {0} still triggered after retract")]
    EndstopStillTriggered(String),
    #[error(transparent)]
    StepCompress(#[from] StepCompressError),
    #[error("Extrude below minimum temp\nSee the 'min_extrude_temp' config option for details")]
    ColdExtrude,
    #[error("{0}")]
    ExtrudeLimit(String),
    #[error("{0}")]
    Shutdown(String),
    #[error("{0}")]
    HomingFailed(String),
    #[error("Invalid command parameter: {0}")]
    InvalidParam(String),
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

pub type Result<T> = std::result::Result<T, CommandError>;

impl CommandError {
    pub fn config(msg: impl Into<String>) -> Self {
        CommandError::Config(msg.into())
    }
}

/// Latched shutdown flag shared by every component that talks to the MCU.
/// Once set, motion commands fail uniformly and step flushing stops.
#[derive(Clone, Default)]
pub struct ShutdownState {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    flag: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub fn invoke(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.inner.flag.swap(true, Ordering::SeqCst) {
            tracing::error!("printer shutdown: {reason}");
            let mut slot = self
                .inner
                .reason
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *slot = Some(reason);
        }
    }

    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}
