// src/events.rs
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Typed equivalents of the string events the pipeline publishes. Consumers
/// subscribe at startup; there is no name lookup on the hot path.
#[derive(Debug, Clone)]
pub enum Event {
    SyncPrintTime {
        eventtime: f64,
        est_print_time: f64,
        print_time: f64,
    },
    SetPosition,
    ManualMove,
    HomingMoveBegin {
        endstops: Vec<String>,
    },
    HomingMoveEnd {
        endstops: Vec<String>,
    },
    HomeRailsBegin {
        axes: Vec<usize>,
    },
    HomeRailsEnd {
        axes: Vec<usize>,
        trigger_mcu_pos: HashMap<String, i64>,
    },
    SyncMcuPosition {
        stepper: String,
    },
    SetDirInverted {
        stepper: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Lagging or absent subscribers never block the publisher.
    pub fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}
