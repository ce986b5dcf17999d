//! Charging session tracker
//!
//! State machine for the single session a charging point can run:
//!
//! ```text
//!            DRIVER_START              progress == 100
//!   IDLE ------------------> CHARGING -----------------> COMPLETE
//!    ^                          |    CHARGING_COMPLETE       |
//!    |        DRIVER_STOP       |                            |
//!    +--------------------------+----------------------------+
//! ```
//!
//! Progress is simulated from wall-clock time since the start. A new
//! DRIVER_START replaces whatever session was running.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ChargingConfig;
use crate::events::{EventBus, MonitorEvent};
use crate::state::SharedState;

/// Point state as seen by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeState {
    Idle,
    Charging,
    Complete,
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Unplugged after reaching 100 %
    FullCompletion,
    /// Unplugged before reaching 100 %
    EarlyDisconnect,
}

/// Result of a DRIVER_STOP on an active session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub driver_id: String,
    pub outcome: StopOutcome,
    pub final_progress: u8,
    pub energy_kwh: f64,
    pub duration: Duration,
}

/// Result of one progress tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The session this tick belongs to is gone or was replaced
    Stale,
    /// Advanced, but by less than the reporting quantum
    Unchanged,
    Progress { progress: u8, energy_kwh: f64 },
    Completed { driver_id: String, energy_kwh: f64 },
    /// Already complete, waiting for the driver to unplug
    AwaitingUnplug { driver_id: String },
}

#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub session_id: Uuid,
    pub driver_id: String,
    pub started_at: DateTime<Utc>,
    started: Instant,
    /// Simulated time from 0 to 100 %
    pub expected_duration: Duration,
    pub target_kwh: f64,
    pub progress: u8,
    last_reported: u8,
    pub state: ChargeState,
}

impl ActiveSession {
    pub fn energy_kwh(&self) -> f64 {
        self.target_kwh * f64::from(self.progress) / 100.0
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Wall-clock time the session should reach 100 %
    pub fn expected_end(&self) -> DateTime<Utc> {
        match chrono::Duration::from_std(self.expected_duration) {
            Ok(d) => self.started_at + d,
            Err(_) => self.started_at,
        }
    }
}

/// Tracks the current session, if any
#[derive(Debug)]
pub struct SessionTracker {
    duration: Duration,
    target_kwh: f64,
    quantum: u8,
    current: Option<ActiveSession>,
}

impl SessionTracker {
    pub fn new(config: &ChargingConfig) -> Self {
        Self {
            duration: config.duration,
            target_kwh: config.target_kwh,
            quantum: config.reporting_quantum(),
            current: None,
        }
    }

    pub fn state(&self) -> ChargeState {
        self.current
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(ChargeState::Idle)
    }

    pub fn session(&self) -> Option<&ActiveSession> {
        self.current.as_ref()
    }

    pub fn progress(&self) -> u8 {
        self.current.as_ref().map(|s| s.progress).unwrap_or(0)
    }

    /// Begin a session for `driver_id`, replacing any running one
    pub fn start(&mut self, driver_id: &str, now: Instant) -> Uuid {
        if let Some(previous) = &self.current {
            warn!(
                "DRIVER_START for {} replaces session of {} at {}%",
                driver_id, previous.driver_id, previous.progress
            );
        }

        let session_id = Uuid::new_v4();
        self.current = Some(ActiveSession {
            session_id,
            driver_id: driver_id.to_string(),
            started_at: Utc::now(),
            started: now,
            expected_duration: self.duration,
            target_kwh: self.target_kwh,
            progress: 0,
            last_reported: 0,
            state: ChargeState::Charging,
        });

        info!("Charging session {} started for {}", session_id, driver_id);
        session_id
    }

    /// Advance the simulated clock for `session_id`
    pub fn on_tick(&mut self, session_id: Uuid, now: Instant) -> TickOutcome {
        let duration = self.duration;
        let quantum = self.quantum;

        let session = match self.current.as_mut() {
            Some(s) if s.session_id == session_id => s,
            _ => return TickOutcome::Stale,
        };

        if session.state == ChargeState::Complete {
            return TickOutcome::AwaitingUnplug {
                driver_id: session.driver_id.clone(),
            };
        }

        let ratio = if duration.is_zero() {
            1.0
        } else {
            session.elapsed(now).as_secs_f64() / duration.as_secs_f64()
        };
        let computed = (ratio * 100.0).floor().min(100.0) as u8;
        session.progress = session.progress.max(computed);

        if session.progress >= 100 {
            session.progress = 100;
            session.last_reported = 100;
            session.state = ChargeState::Complete;
            info!("Session {} reached 100%", session.session_id);
            return TickOutcome::Completed {
                driver_id: session.driver_id.clone(),
                energy_kwh: session.energy_kwh(),
            };
        }

        if session.progress - session.last_reported >= quantum {
            session.last_reported = session.progress;
            debug!("Session {} at {}%", session.session_id, session.progress);
            return TickOutcome::Progress {
                progress: session.progress,
                energy_kwh: session.energy_kwh(),
            };
        }

        TickOutcome::Unchanged
    }

    /// CHARGING_COMPLETE: force 100 %. Returns the session if it changed.
    pub fn complete(&mut self) -> Option<&ActiveSession> {
        let session = self.current.as_mut()?;
        if session.state == ChargeState::Complete {
            return None;
        }
        session.progress = 100;
        session.last_reported = 100;
        session.state = ChargeState::Complete;
        info!("Session {} marked complete by controller", session.session_id);
        Some(&*session)
    }

    /// DRIVER_STOP: end the session. No-op without one.
    pub fn stop(&mut self, now: Instant) -> Option<SessionSummary> {
        let session = self.current.take()?;
        let outcome = if session.progress >= 100 {
            StopOutcome::FullCompletion
        } else {
            StopOutcome::EarlyDisconnect
        };

        info!(
            "Session {} for {} ended at {}% ({:?})",
            session.session_id, session.driver_id, session.progress, outcome
        );

        Some(SessionSummary {
            session_id: session.session_id,
            outcome,
            final_progress: session.progress,
            energy_kwh: session.energy_kwh(),
            duration: session.elapsed(now),
            driver_id: session.driver_id,
        })
    }
}

/// Spawn the progress ticker for one session.
///
/// The task ends on its own once the session is stopped or replaced.
pub fn spawn_progress_task(
    state: SharedState,
    events: EventBus,
    session_id: Uuid,
    config: &ChargingConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let tick = config.tick;
    let reminder_every = config.reminder_every.max(1);

    tokio::spawn(async move {
        let mut idle_ticks = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(tick) => {}
            }

            let outcome = state.with(|s| s.charging.on_tick(session_id, Instant::now()));
            match outcome {
                TickOutcome::Stale => break,
                TickOutcome::Unchanged => {}
                TickOutcome::Progress { progress, energy_kwh } => {
                    events.emit(MonitorEvent::Progress {
                        session_id,
                        progress,
                        energy_kwh,
                    });
                }
                TickOutcome::Completed { driver_id, energy_kwh } => {
                    events.emit(MonitorEvent::Progress {
                        session_id,
                        progress: 100,
                        energy_kwh,
                    });
                    events.emit(MonitorEvent::ChargingComplete {
                        session_id,
                        driver_id,
                        energy_kwh,
                    });
                }
                TickOutcome::AwaitingUnplug { driver_id } => {
                    idle_ticks += 1;
                    if idle_ticks % reminder_every == 0 {
                        events.emit(MonitorEvent::UnplugReminder { driver_id });
                    }
                }
            }
        }

        debug!("Progress task for session {} finished", session_id);
    })
}
