//! Controller link task
//!
//! Owns the authenticated controller connection after startup. It pushes
//! session events from the controller into the tracker and writes queued
//! FAULT/RECOVERY notifications out. When the link drops, the session key is
//! discarded and the full handshake runs again; if that fails the monitor
//! shuts down.

use std::sync::Arc;

use evcp_core::{Link, LinkError, Message, MessageType, RetryPolicy};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::charging::spawn_progress_task;
use crate::config::{ChargingConfig, ControllerConfig};
use crate::events::{EventBus, MonitorEvent};
use crate::state::SharedState;

enum Step {
    Inbound(Result<Option<Message>, LinkError>),
    Outbound(Option<Message>),
    Cancelled,
}

pub struct ControllerLink {
    cp_id: String,
    link: Link,
    auth: Arc<Authenticator>,
    host: String,
    port: u16,
    retry: RetryPolicy,
    charging: ChargingConfig,
    state: SharedState,
    events: EventBus,
    outbound: mpsc::Receiver<Message>,
    /// Notification whose send failed; goes out first after reconnecting
    pending: Option<Message>,
}

impl ControllerLink {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cp_id: impl Into<String>,
        link: Link,
        auth: Arc<Authenticator>,
        controller: &ControllerConfig,
        charging: ChargingConfig,
        state: SharedState,
        events: EventBus,
        outbound: mpsc::Receiver<Message>,
    ) -> Self {
        Self {
            cp_id: cp_id.into(),
            link,
            auth,
            host: controller.host.clone(),
            port: controller.port,
            retry: controller.retry,
            charging,
            state,
            events,
            outbound,
            pending: None,
        }
    }

    /// Serve the controller link until cancelled or re-authentication fails
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Listening for controller messages on {}", self.link.peer());
        let mut outbound_open = true;

        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Cancelled,
                inbound = self.link.next_message() => Step::Inbound(inbound),
                outbound = self.outbound.recv(), if outbound_open => Step::Outbound(outbound),
            };

            match step {
                Step::Cancelled => break,
                Step::Inbound(Ok(Some(msg))) => self.dispatch(msg, &cancel),
                Step::Inbound(Ok(None)) => {
                    warn!("Controller closed the connection");
                    if !self.reconnect(&cancel).await {
                        break;
                    }
                }
                Step::Inbound(Err(e)) => {
                    warn!("Controller link failed: {}", e);
                    if !self.reconnect(&cancel).await {
                        break;
                    }
                }
                Step::Outbound(Some(msg)) => {
                    if let Err(e) = self.link.send(&msg).await {
                        warn!("Could not send {} to controller: {}", msg, e);
                        self.pending = Some(msg);
                        if !self.reconnect(&cancel).await {
                            break;
                        }
                    }
                }
                Step::Outbound(None) => {
                    debug!("Outbound queue closed");
                    outbound_open = false;
                }
            }
        }

        info!("Controller link task stopped for {}", self.cp_id);
    }

    /// Apply one controller-pushed message
    fn dispatch(&self, msg: Message, cancel: &CancellationToken) {
        if let Some(target) = msg.arg(0) {
            if target != self.cp_id {
                warn!("Ignoring {} addressed to {}", msg.kind(), target);
                return;
            }
        }

        match msg.kind() {
            MessageType::DriverStart => {
                let driver_id = match msg.arg(1) {
                    Some(id) if !id.is_empty() => id.to_string(),
                    _ => {
                        warn!("DRIVER_START without driver id: {}", msg);
                        return;
                    }
                };

                let started = self.state.with(|s| {
                    let session_id = s.charging.start(&driver_id, Instant::now());
                    s.charging.session().map(|session| {
                        (session_id, session.started_at, session.expected_duration)
                    })
                });
                let (session_id, started_at, expected_duration) = match started {
                    Some(started) => started,
                    None => return,
                };
                self.events.emit(MonitorEvent::SessionStarted {
                    session_id,
                    driver_id,
                    started_at,
                    expected_duration,
                });
                spawn_progress_task(
                    self.state.clone(),
                    self.events.clone(),
                    session_id,
                    &self.charging,
                    cancel.clone(),
                );
            }
            MessageType::ChargingComplete => {
                let completed = self.state.with(|s| {
                    s.charging.complete().map(|session| {
                        (
                            session.session_id,
                            session.driver_id.clone(),
                            session.energy_kwh(),
                        )
                    })
                });
                match completed {
                    Some((session_id, driver_id, energy_kwh)) => {
                        self.events.emit(MonitorEvent::ChargingComplete {
                            session_id,
                            driver_id,
                            energy_kwh,
                        });
                    }
                    None => debug!("CHARGING_COMPLETE with nothing charging"),
                }
            }
            MessageType::DriverStop => {
                match self.state.with(|s| s.charging.stop(Instant::now())) {
                    Some(summary) => {
                        self.events.emit(MonitorEvent::SessionEnded {
                            driver_id: summary.driver_id,
                            outcome: summary.outcome,
                            final_progress: summary.final_progress,
                            energy_kwh: summary.energy_kwh,
                        });
                    }
                    None => debug!("DRIVER_STOP with no active session"),
                }
            }
            MessageType::Unknown(tag) => warn!("Unknown controller message {}", tag),
            other => debug!("Ignoring {} from controller", other),
        }
    }

    /// Re-establish and re-authenticate. Returns false if the task must stop.
    async fn reconnect(&mut self, cancel: &CancellationToken) -> bool {
        self.auth.invalidate();
        self.events.emit(MonitorEvent::ControllerLost);
        info!("Re-authenticating {} with controller", self.cp_id);

        let result = tokio::select! {
            _ = cancel.cancelled() => return false,
            result = self.auth.establish(&self.host, self.port, self.retry) => result,
        };

        match result {
            Ok(link) => {
                self.link = link;
                self.events.emit(MonitorEvent::ControllerRestored);

                if let Some(msg) = self.pending.take() {
                    if let Err(e) = self.link.send(&msg).await {
                        error!("Could not resend {} after reconnect: {}", msg, e);
                    }
                }
                true
            }
            Err(e) => {
                let reason = format!("controller re-authentication failed: {}", e);
                error!("{}", reason);
                self.state.set_fatal(reason.clone());
                self.events.emit(MonitorEvent::Fatal { reason });
                cancel.cancel();
                false
            }
        }
    }
}
