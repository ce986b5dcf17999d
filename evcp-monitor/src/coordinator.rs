//! Coordinator
//!
//! Starts the monitor in dependency order and owns its tasks:
//!
//! 1. connect to the engine (failure aborts startup)
//! 2. resolve credentials, connect and authenticate with the controller
//! 3. spawn the controller link task
//! 4. spawn the health monitor
//!
//! Shutdown cancels one token shared by every loop and waits for them.
//! Dropping the coordinator cancels the same token without waiting.

use std::sync::Arc;

use evcp_core::{connect, Message};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::config::MonitorConfig;
use crate::controller::ControllerLink;
use crate::credentials::CredentialStore;
use crate::error::MonitorError;
use crate::events::{EventBus, MonitorEvent};
use crate::health::HealthMonitor;
use crate::registry::Registry;
use crate::state::{SharedState, StatusSnapshot};

/// Queue depth for FAULT/RECOVERY notifications
const OUTBOUND_CAPACITY: usize = 64;

pub struct Coordinator {
    cp_id: String,
    state: SharedState,
    events: EventBus,
    auth: Arc<Authenticator>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Coordinator {
    /// Connect both links, authenticate and start the loops
    pub async fn start(
        config: MonitorConfig,
        store: Arc<dyn CredentialStore>,
        registry: Arc<dyn Registry>,
    ) -> Result<Self, MonitorError> {
        let engine_port = config.engine_port()?;
        info!(
            "Starting monitor for {} (engine {}:{}, controller {}:{})",
            config.cp_id,
            config.engine.host,
            engine_port,
            config.controller.host,
            config.controller.port
        );

        let engine = connect(&config.engine.host, engine_port, config.engine.retry)
            .await
            .map_err(MonitorError::EngineUnavailable)?;

        let auth = Arc::new(Authenticator::new(&config, store, registry));
        let controller = auth
            .establish(
                &config.controller.host,
                config.controller.port,
                config.controller.retry,
            )
            .await?;

        let state = SharedState::new(config.health.failure_threshold, &config.charging);
        let events = EventBus::new();
        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);

        let controller_task = ControllerLink::new(
            config.cp_id.clone(),
            controller,
            auth.clone(),
            &config.controller,
            config.charging.clone(),
            state.clone(),
            events.clone(),
            outbound_rx,
        );

        let health = HealthMonitor::new(
            config.cp_id.clone(),
            config.health.clone(),
            state.clone(),
            outbound_tx,
            events.clone(),
        )
        .with_link(engine)
        .with_engine_addr(config.engine.host.clone(), engine_port);

        let tasks = vec![
            tokio::spawn(controller_task.run(cancel.clone())),
            tokio::spawn(health.run(cancel.clone())),
        ];

        info!("Monitor for {} running", config.cp_id);

        Ok(Self {
            cp_id: config.cp_id,
            state,
            events,
            auth,
            cancel,
            tasks,
        })
    }

    pub fn cp_id(&self) -> &str {
        &self.cp_id
    }

    /// Snapshot for the operator `status` command
    pub fn status(&self) -> StatusSnapshot {
        self.state.snapshot(&self.cp_id, self.auth.has_session_key())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Resolves once the monitor stops, by shutdown or a fatal error
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Stop every loop and close both links.
    ///
    /// Returns the fatal cause if the monitor had already failed.
    pub async fn shutdown(mut self) -> Option<String> {
        info!("Shutting down monitor for {}", self.cp_id);
        self.cancel.cancel();

        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!("Monitor task ended abnormally: {}", e);
            }
        }

        self.auth.invalidate();
        self.state.fatal()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            debug!("Monitor for {} dropped without shutdown", self.cp_id);
            self.cancel.cancel();
        }
    }
}
