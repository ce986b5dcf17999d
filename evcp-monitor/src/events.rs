//! Operator-facing event stream
//!
//! Everything an operator console wants to show as it happens. Loops emit
//! into a broadcast channel; a slow or absent subscriber never blocks them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::charging::StopOutcome;

/// Capacity of the broadcast channel; lagging subscribers skip ahead
pub const EVENT_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    SessionStarted {
        session_id: Uuid,
        driver_id: String,
        started_at: DateTime<Utc>,
        expected_duration: Duration,
    },
    Progress {
        session_id: Uuid,
        progress: u8,
        energy_kwh: f64,
    },
    ChargingComplete {
        session_id: Uuid,
        driver_id: String,
        energy_kwh: f64,
    },
    /// Session is complete but the driver has not unplugged yet
    UnplugReminder {
        driver_id: String,
    },
    SessionEnded {
        driver_id: String,
        outcome: StopOutcome,
        final_progress: u8,
        energy_kwh: f64,
    },
    EngineFaulted {
        consecutive_failures: u32,
    },
    EngineRecovered,
    ControllerLost,
    ControllerRestored,
    Fatal {
        reason: String,
    },
}

/// Sending half of the event stream
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: MonitorEvent) {
        trace!("event: {:?}", event);
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
