//! Engine health monitoring
//!
//! Heartbeats the local engine and applies a consecutive-failure threshold
//! before declaring it faulty:
//!
//! ```text
//!            failures >= threshold
//!   HEALTHY ----------------------> FAULTY     (FAULT sent once)
//!      ^                              |
//!      +------------------------------+        (RECOVERY sent once)
//!               one success
//! ```
//!
//! A timeout, a closed or corrupt link, HEALTH_KO and an unreachable engine
//! all count as the same kind of failure. Any decoded reply other than
//! HEALTH_KO counts as success.
//!
//! A reply that misses its deadline must never answer a later check, so a
//! timeout drops the engine link and the next cycle re-dials a clean stream.

use std::fmt;

use evcp_core::{connect_once, Link, LinkError, Message, MessageType, Received};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HealthConfig;
use crate::events::{EventBus, MonitorEvent};
use crate::state::SharedState;

/// Healthy/faulty with a failure counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthState {
    healthy: bool,
    consecutive_failures: u32,
    failure_threshold: u32,
}

/// A change of health worth telling the controller about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Faulted,
    Recovered,
}

impl HealthState {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Reset the counter; returns `Recovered` if this ends a fault episode
    pub fn record_success(&mut self) -> Option<HealthTransition> {
        self.consecutive_failures = 0;
        if self.healthy {
            return None;
        }
        self.healthy = true;
        Some(HealthTransition::Recovered)
    }

    /// Count a failure; returns `Faulted` when the threshold is first crossed
    pub fn record_failure(&mut self) -> Option<HealthTransition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.healthy && self.consecutive_failures >= self.failure_threshold {
            self.healthy = false;
            return Some(HealthTransition::Faulted);
        }
        None
    }
}

/// Why a health check failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    Timeout,
    Closed,
    Corrupt,
    EngineKo,
    SendFailed,
    Unreachable,
}

impl FailureCause {
    /// Whether the engine link must be dropped after this failure
    pub fn drops_link(&self) -> bool {
        matches!(
            self,
            FailureCause::Timeout
                | FailureCause::Closed
                | FailureCause::Corrupt
                | FailureCause::SendFailed
        )
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureCause::Timeout => "no reply",
            FailureCause::Closed => "connection closed",
            FailureCause::Corrupt => "corrupt reply",
            FailureCause::EngineKo => "engine reported KO",
            FailureCause::SendFailed => "send failed",
            FailureCause::Unreachable => "engine unreachable",
        };
        f.write_str(text)
    }
}

/// Result of one heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Healthy,
    Failed(FailureCause),
    /// No engine to check
    Skipped,
}

/// Heartbeat loop against the engine
pub struct HealthMonitor {
    cp_id: String,
    config: HealthConfig,
    link: Option<Link>,
    /// Where to re-dial a lost engine link
    engine_addr: Option<(String, u16)>,
    state: SharedState,
    outbound: mpsc::Sender<Message>,
    events: EventBus,
}

impl HealthMonitor {
    pub fn new(
        cp_id: impl Into<String>,
        config: HealthConfig,
        state: SharedState,
        outbound: mpsc::Sender<Message>,
        events: EventBus,
    ) -> Self {
        Self {
            cp_id: cp_id.into(),
            config,
            link: None,
            engine_addr: None,
            state,
            outbound,
            events,
        }
    }

    /// Attach an established engine link
    pub fn with_link(mut self, link: Link) -> Self {
        self.link = Some(link);
        self
    }

    /// Re-dial `host:port` when the engine link is lost
    pub fn with_engine_addr(mut self, host: impl Into<String>, port: u16) -> Self {
        self.engine_addr = Some((host.into(), port));
        self
    }

    /// Heartbeat every interval until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Health monitor started for {} (every {:?}, threshold {})",
            self.cp_id, self.config.interval, self.config.failure_threshold
        );

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.check_once() => result,
            };
            self.apply(result).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        // Dropping the link closes the engine socket
        self.link = None;
        info!("Health monitor stopped for {}", self.cp_id);
    }

    /// Send one HEALTH_CHECK and classify the reply
    pub async fn check_once(&mut self) -> CheckResult {
        if self.link.is_none() {
            match self.redial().await {
                Some(link) => self.link = Some(link),
                None if self.engine_addr.is_none() => return CheckResult::Skipped,
                None => return CheckResult::Failed(FailureCause::Unreachable),
            }
        }

        let result = self.exchange().await;
        if let CheckResult::Failed(cause) = result {
            if cause.drops_link() && self.link.take().is_some() {
                warn!("Dropping engine link for {} ({})", self.cp_id, cause);
            }
        }
        result
    }

    async fn exchange(&mut self) -> CheckResult {
        let link = match self.link.as_mut() {
            Some(link) => link,
            None => return CheckResult::Skipped,
        };

        let ping = match Message::health_check(&self.cp_id) {
            Ok(msg) => msg,
            Err(e) => {
                error!("Cannot build HEALTH_CHECK for {}: {}", self.cp_id, e);
                return CheckResult::Skipped;
            }
        };

        match link.discard_pending().await {
            Ok(0) => {}
            Ok(n) => debug!("Discarded {} unsolicited engine messages", n),
            Err(LinkError::Frame(e)) if e.is_corruption() => {
                return CheckResult::Failed(FailureCause::Corrupt)
            }
            Err(e) => {
                debug!("Engine link lost before HEALTH_CHECK: {}", e);
                return CheckResult::Failed(FailureCause::Closed);
            }
        }

        if let Err(e) = link.send(&ping).await {
            debug!("HEALTH_CHECK send failed: {}", e);
            return CheckResult::Failed(FailureCause::SendFailed);
        }

        match link.receive(self.config.reply_timeout).await {
            Ok(Received::Message(reply)) => match reply.kind() {
                MessageType::HealthKo => CheckResult::Failed(FailureCause::EngineKo),
                MessageType::HealthOk => CheckResult::Healthy,
                other => {
                    debug!("Unexpected engine reply {}, counted as alive", other);
                    CheckResult::Healthy
                }
            },
            Ok(Received::Timeout) => CheckResult::Failed(FailureCause::Timeout),
            Ok(Received::Closed) => CheckResult::Failed(FailureCause::Closed),
            Err(LinkError::Frame(e)) if e.is_corruption() => {
                CheckResult::Failed(FailureCause::Corrupt)
            }
            Err(e) => {
                debug!("Engine read failed: {}", e);
                CheckResult::Failed(FailureCause::Closed)
            }
        }
    }

    async fn redial(&self) -> Option<Link> {
        let (host, port) = self.engine_addr.as_ref()?;
        match connect_once(host, *port, self.config.reply_timeout).await {
            Ok(link) => {
                info!("Engine link for {} re-established", self.cp_id);
                Some(link)
            }
            Err(e) => {
                debug!("Engine re-dial failed: {}", e);
                None
            }
        }
    }

    /// Fold a check result into the shared state and notify on transitions
    pub async fn apply(&self, result: CheckResult) {
        let (transition, failures) = match result {
            CheckResult::Skipped => return,
            CheckResult::Healthy => self.state.with(|s| {
                let t = s.health.record_success();
                (t, s.health.consecutive_failures())
            }),
            CheckResult::Failed(cause) => self.state.with(|s| {
                let t = s.health.record_failure();
                let failures = s.health.consecutive_failures();
                debug!(
                    "Health check failed for {} ({}), {}/{}",
                    self.cp_id,
                    cause,
                    failures,
                    s.health.failure_threshold()
                );
                (t, failures)
            }),
        };

        // Lock released; notify outside it
        match transition {
            Some(HealthTransition::Faulted) => {
                error!(
                    "Engine for {} faulted after {} consecutive failures",
                    self.cp_id, failures
                );
                self.notify(Message::fault(&self.cp_id)).await;
                self.events.emit(MonitorEvent::EngineFaulted {
                    consecutive_failures: failures,
                });
            }
            Some(HealthTransition::Recovered) => {
                info!("Engine for {} recovered", self.cp_id);
                self.notify(Message::recovery(&self.cp_id)).await;
                self.events.emit(MonitorEvent::EngineRecovered);
            }
            None => {}
        }
    }

    async fn notify(&self, msg: Result<Message, evcp_core::FrameError>) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                error!("Cannot build notification for {}: {}", self.cp_id, e);
                return;
            }
        };
        if self.outbound.send(msg).await.is_err() {
            warn!("Controller link task is gone, notification dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChargingConfig;
    use evcp_core::frame::encode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn monitor() -> (HealthMonitor, mpsc::Receiver<Message>, SharedState) {
        monitor_with_timeout(Duration::from_millis(50))
    }

    fn monitor_with_timeout(
        reply_timeout: Duration,
    ) -> (HealthMonitor, mpsc::Receiver<Message>, SharedState) {
        let state = SharedState::new(3, &ChargingConfig::default());
        let (tx, rx) = mpsc::channel(16);
        let monitor = HealthMonitor::new(
            "CP-001",
            HealthConfig {
                interval: Duration::from_millis(10),
                reply_timeout,
                failure_threshold: 3,
            },
            state.clone(),
            tx,
            EventBus::new(),
        );
        (monitor, rx, state)
    }

    /// How the loopback engine answers each HEALTH_CHECK
    #[derive(Debug, Clone, Copy)]
    enum Engine {
        /// Reply with this tag
        Answer(&'static str),
        /// HEALTH_OK after a delay
        Late(Duration),
        /// A HEALTH_OK frame with a broken checksum
        Garbage,
        /// Read the check, then close
        HangUp,
        /// Read the check, never answer
        Silent,
    }

    /// Loopback engine; the counter tracks accepted connections
    async fn spawn_engine(behaviour: Engine) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                        let reply = match behaviour {
                            Engine::Answer(tag) => {
                                encode(&Message::new(tag.parse().unwrap(), ["CP-001"]).unwrap())
                                    .to_vec()
                            }
                            Engine::Late(delay) => {
                                tokio::time::sleep(delay).await;
                                encode(&Message::new(MessageType::HealthOk, ["CP-001"]).unwrap())
                                    .to_vec()
                            }
                            Engine::Garbage => {
                                let mut frame = encode(
                                    &Message::new(MessageType::HealthOk, ["CP-001"]).unwrap(),
                                )
                                .to_vec();
                                let last = frame.len() - 1;
                                frame[last] ^= 0x55;
                                frame
                            }
                            Engine::HangUp => return,
                            Engine::Silent => continue,
                        };
                        if socket.write_all(&reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        (port, accepted)
    }

    async fn attached(monitor: HealthMonitor, port: u16) -> HealthMonitor {
        let link = connect_once("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        monitor.with_link(link).with_engine_addr("127.0.0.1", port)
    }

    fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<MessageType> {
        let mut kinds = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            kinds.push(msg.kind().clone());
        }
        kinds
    }

    #[test]
    fn test_hysteresis_state() {
        let mut h = HealthState::new(3);
        assert_eq!(h.record_failure(), None);
        assert_eq!(h.record_failure(), None);
        assert_eq!(h.record_success(), None);
        assert!(h.is_healthy());
        assert_eq!(h.consecutive_failures(), 0);

        assert_eq!(h.record_failure(), None);
        assert_eq!(h.record_failure(), None);
        assert_eq!(h.record_failure(), Some(HealthTransition::Faulted));
        assert_eq!(h.record_failure(), None);
        assert!(!h.is_healthy());

        assert_eq!(h.record_success(), Some(HealthTransition::Recovered));
        assert_eq!(h.record_success(), None);
    }

    #[tokio::test]
    async fn test_ko_ko_ok_sends_nothing() {
        let (monitor, mut rx, state) = monitor();
        let ko = CheckResult::Failed(FailureCause::EngineKo);

        monitor.apply(ko).await;
        monitor.apply(ko).await;
        monitor.apply(CheckResult::Healthy).await;

        assert!(drain(&mut rx).is_empty());
        assert!(state.with(|s| s.health.is_healthy()));
    }

    #[tokio::test]
    async fn test_one_fault_and_one_recovery_per_episode() {
        let (monitor, mut rx, state) = monitor();
        let mut events = monitor.events.subscribe();

        for _ in 0..5 {
            monitor.apply(CheckResult::Failed(FailureCause::Timeout)).await;
        }
        assert!(!state.with(|s| s.health.is_healthy()));

        monitor.apply(CheckResult::Healthy).await;
        monitor.apply(CheckResult::Healthy).await;

        assert_eq!(
            drain(&mut rx),
            vec![MessageType::Fault, MessageType::Recovery]
        );
        assert_eq!(
            events.try_recv().unwrap(),
            MonitorEvent::EngineFaulted {
                consecutive_failures: 3
            }
        );
        assert_eq!(events.try_recv().unwrap(), MonitorEvent::EngineRecovered);
    }

    #[tokio::test]
    async fn test_skipped_leaves_state_alone() {
        let (mut monitor, mut rx, state) = monitor();

        assert_eq!(monitor.check_once().await, CheckResult::Skipped);
        monitor.apply(CheckResult::Skipped).await;

        assert!(drain(&mut rx).is_empty());
        assert_eq!(state.with(|s| s.health.consecutive_failures()), 0);
    }

    #[tokio::test]
    async fn test_unreachable_engine_counts_as_failure() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (monitor, _rx, _state) = monitor();
        let mut monitor = monitor.with_engine_addr("127.0.0.1", port);

        assert_eq!(
            monitor.check_once().await,
            CheckResult::Failed(FailureCause::Unreachable)
        );
    }

    #[test]
    fn test_link_dropping_causes() {
        assert!(FailureCause::Closed.drops_link());
        assert!(FailureCause::Corrupt.drops_link());
        assert!(FailureCause::Timeout.drops_link());
        assert!(!FailureCause::EngineKo.drops_link());
    }

    #[tokio::test]
    async fn test_late_replies_never_answer_later_checks() {
        // Every reply lands 60 ms after the deadline of the check it answers
        let (port, accepted) = spawn_engine(Engine::Late(Duration::from_millis(260))).await;
        let (monitor, mut rx, state) = monitor_with_timeout(Duration::from_millis(200));
        let mut monitor = attached(monitor, port).await;

        for _ in 0..5 {
            let result = monitor.check_once().await;
            assert_eq!(result, CheckResult::Failed(FailureCause::Timeout));
            monitor.apply(result).await;
            tokio::time::sleep(Duration::from_millis(80)).await;
        }

        assert!(!state.is_healthy());
        assert_eq!(state.with(|s| s.health.consecutive_failures()), 5);
        assert_eq!(drain(&mut rx), vec![MessageType::Fault]);
        assert!(accepted.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test]
    async fn test_unexpected_reply_counts_as_alive() {
        let (port, _) = spawn_engine(Engine::Answer("DRIVER_STOP")).await;
        let (monitor, mut rx, state) = monitor_with_timeout(Duration::from_secs(1));
        let mut monitor = attached(monitor, port).await;

        state.with(|s| {
            s.health.record_failure();
            s.health.record_failure();
        });

        let result = monitor.check_once().await;
        assert_eq!(result, CheckResult::Healthy);
        monitor.apply(result).await;

        assert_eq!(state.with(|s| s.health.consecutive_failures()), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_engine_ko_keeps_link() {
        let (port, accepted) = spawn_engine(Engine::Answer("HEALTH_KO")).await;
        let (monitor, _rx, _state) = monitor_with_timeout(Duration::from_secs(1));
        let mut monitor = attached(monitor, port).await;

        for _ in 0..2 {
            assert_eq!(
                monitor.check_once().await,
                CheckResult::Failed(FailureCause::EngineKo)
            );
        }
        assert!(monitor.link.is_some());
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_silent_engine_times_out_and_drops_link() {
        let (port, _) = spawn_engine(Engine::Silent).await;
        let (monitor, _rx, _state) = monitor_with_timeout(Duration::from_millis(100));
        let mut monitor = attached(monitor, port).await;

        assert_eq!(
            monitor.check_once().await,
            CheckResult::Failed(FailureCause::Timeout)
        );
        assert!(monitor.link.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_reply_drops_link_and_redials() {
        let (port, accepted) = spawn_engine(Engine::Garbage).await;
        let (monitor, _rx, _state) = monitor_with_timeout(Duration::from_secs(1));
        let mut monitor = attached(monitor, port).await;

        assert_eq!(
            monitor.check_once().await,
            CheckResult::Failed(FailureCause::Corrupt)
        );
        assert!(monitor.link.is_none());

        assert_eq!(
            monitor.check_once().await,
            CheckResult::Failed(FailureCause::Corrupt)
        );
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closed_engine_is_failure_and_redialled() {
        let (port, accepted) = spawn_engine(Engine::HangUp).await;
        let (monitor, mut rx, state) = monitor_with_timeout(Duration::from_secs(1));
        let mut monitor = attached(monitor, port).await;

        for _ in 0..3 {
            let result = monitor.check_once().await;
            assert_eq!(result, CheckResult::Failed(FailureCause::Closed));
            assert!(monitor.link.is_none());
            monitor.apply(result).await;
        }

        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        assert!(!state.is_healthy());
        assert_eq!(drain(&mut rx), vec![MessageType::Fault]);
    }
}
