//! Shared monitor state
//!
//! Health and charging state live in one struct behind one mutex. Every
//! access goes through [`SharedState::with`], so no guard can be held across
//! an `.await`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::charging::{ChargeState, SessionTracker};
use crate::config::ChargingConfig;
use crate::health::HealthState;

#[derive(Debug)]
pub struct MonitorState {
    pub health: HealthState,
    pub charging: SessionTracker,
    /// Set once when the monitor hits an unrecoverable condition
    pub fatal: Option<String>,
}

/// Cloneable handle to the monitor state
#[derive(Debug, Clone)]
pub struct SharedState(Arc<Mutex<MonitorState>>);

impl SharedState {
    pub fn new(failure_threshold: u32, charging: &ChargingConfig) -> Self {
        Self(Arc::new(Mutex::new(MonitorState {
            health: HealthState::new(failure_threshold),
            charging: SessionTracker::new(charging),
            fatal: None,
        })))
    }

    /// Run `f` with the state locked
    pub fn with<R>(&self, f: impl FnOnce(&mut MonitorState) -> R) -> R {
        f(&mut self.0.lock())
    }

    pub fn is_healthy(&self) -> bool {
        self.with(|s| s.health.is_healthy())
    }

    pub fn charge_state(&self) -> ChargeState {
        self.with(|s| s.charging.state())
    }

    /// Record the first fatal cause; later ones are ignored
    pub fn set_fatal(&self, reason: impl Into<String>) -> bool {
        self.with(|s| {
            if s.fatal.is_some() {
                return false;
            }
            s.fatal = Some(reason.into());
            true
        })
    }

    pub fn fatal(&self) -> Option<String> {
        self.with(|s| s.fatal.clone())
    }

    /// Consistent copy of everything `status` shows
    pub fn snapshot(&self, cp_id: &str, authenticated: bool) -> StatusSnapshot {
        let now = Instant::now();
        self.with(|s| StatusSnapshot {
            cp_id: cp_id.to_string(),
            engine_healthy: s.health.is_healthy(),
            consecutive_failures: s.health.consecutive_failures(),
            failure_threshold: s.health.failure_threshold(),
            point: PointStatus::from(s.charging.state()),
            session: s.charging.session().map(|session| SessionStatus {
                driver_id: session.driver_id.clone(),
                started_at: session.started_at,
                expected_end: session.expected_end(),
                elapsed: session.elapsed(now),
                progress: session.progress,
                energy_kwh: session.energy_kwh(),
            }),
            authenticated,
            fatal: s.fatal.clone(),
        })
    }
}

/// What the charging point is doing, operator wording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointStatus {
    Available,
    Charging,
    WaitingForUnplug,
}

impl From<ChargeState> for PointStatus {
    fn from(state: ChargeState) -> Self {
        match state {
            ChargeState::Idle => PointStatus::Available,
            ChargeState::Charging => PointStatus::Charging,
            ChargeState::Complete => PointStatus::WaitingForUnplug,
        }
    }
}

impl PointStatus {
    pub fn label(&self) -> &'static str {
        match self {
            PointStatus::Available => "AVAILABLE",
            PointStatus::Charging => "CHARGING IN PROGRESS",
            PointStatus::WaitingForUnplug => "CHARGED TO 100% - WAITING FOR UNPLUG",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub driver_id: String,
    pub started_at: DateTime<Utc>,
    pub expected_end: DateTime<Utc>,
    pub elapsed: Duration,
    pub progress: u8,
    pub energy_kwh: f64,
}

/// Point-in-time status report
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub cp_id: String,
    pub engine_healthy: bool,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub point: PointStatus,
    pub session: Option<SessionStatus>,
    pub authenticated: bool,
    pub fatal: Option<String>,
}
