//! Controller authentication
//!
//! ```text
//! monitor                         controller
//!    | AUTHENTICATE#cp#user#pass      |
//!    |------------------------------->|
//!    |      AUTHENTICATED#cp#key      |
//!    |<-------------------------------|   or DENY#cp#reason
//!    | REGISTER#MONITOR#cp#cp         |
//!    |------------------------------->|
//! ```
//!
//! Credentials come from the local cache or, on a miss, from a one-time
//! registration. The session key lives only as long as the controller link.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use evcp_core::{connect, Link, Message, MessageType, Received, RetryPolicy};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::config::MonitorConfig;
use crate::credentials::{CredentialStore, Credentials};
use crate::error::{AuthError, CredentialError, MonitorError};
use crate::registry::{Registry, RegistrationRequest};

/// Role this node registers as
pub const MONITOR_ROLE: &str = "MONITOR";

/// Opaque post-authentication token
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey(<{} bytes>)", self.0.len())
    }
}

/// Runs the credential and handshake steps for one charging point
pub struct Authenticator {
    cp_id: String,
    store: Arc<dyn CredentialStore>,
    registry: Arc<dyn Registry>,
    price_per_kwh: f64,
    auth_timeout: Duration,
    credentials: Mutex<Option<Credentials>>,
    session_key: Mutex<Option<SessionKey>>,
}

impl Authenticator {
    pub fn new(
        config: &MonitorConfig,
        store: Arc<dyn CredentialStore>,
        registry: Arc<dyn Registry>,
    ) -> Self {
        Self {
            cp_id: config.cp_id.clone(),
            store,
            registry,
            price_per_kwh: config.registry.price_per_kwh,
            auth_timeout: config.controller.auth_timeout,
            credentials: Mutex::new(None),
            session_key: Mutex::new(None),
        }
    }

    pub fn cp_id(&self) -> &str {
        &self.cp_id
    }

    /// Cached credentials, or a fresh registration persisted to the store
    pub async fn resolve_credentials(&self) -> Result<Credentials, CredentialError> {
        let known = self.credentials.lock().clone();
        if let Some(creds) = known {
            return Ok(creds);
        }

        let cached = match self.store.load(&self.cp_id) {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Ignoring unreadable credential cache for {}: {}", self.cp_id, e);
                None
            }
        };

        let creds = match cached {
            Some(creds) => creds,
            None => {
                info!("No stored credentials for {}, registering", self.cp_id);
                let request = RegistrationRequest::for_cp(&self.cp_id, self.price_per_kwh);
                let issued = self.registry.register(&request).await?;
                let creds = Credentials::new(&self.cp_id, issued.username, issued.password);

                if let Err(e) = self.store.save(&creds) {
                    warn!("Could not persist credentials for {}: {}", self.cp_id, e);
                }
                creds
            }
        };

        *self.credentials.lock() = Some(creds.clone());
        Ok(creds)
    }

    /// Run the handshake on an open link.
    ///
    /// On success the session key (if the controller sent one) is cached and
    /// the monitor registration has been sent.
    pub async fn authenticate<S>(
        &self,
        link: &mut Link<S>,
        creds: &Credentials,
    ) -> Result<(), AuthError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = Message::authenticate(&creds.cp_id, &creds.username, &creds.password)?;
        link.send(&request).await?;

        let response = match link.receive(self.auth_timeout).await? {
            Received::Message(msg) => msg,
            Received::Timeout => return Err(AuthError::Timeout(self.auth_timeout)),
            Received::Closed => return Err(AuthError::ConnectionLost),
        };

        match response.kind() {
            MessageType::Authenticated => {
                match response.arg(1).filter(|key| !key.is_empty()) {
                    Some(key) => *self.session_key.lock() = Some(SessionKey::new(key)),
                    None => warn!("AUTHENTICATED for {} carried no session key", creds.cp_id),
                }
                info!("Authenticated {} with controller", creds.cp_id);

                link.send(&Message::register(MONITOR_ROLE, &creds.cp_id)?)
                    .await?;
                Ok(())
            }
            MessageType::Deny => {
                let reason = response.arg(1).unwrap_or("UNKNOWN").to_string();
                warn!("Controller denied {}: {}", creds.cp_id, reason);
                Err(AuthError::Denied { reason })
            }
            _ => Err(AuthError::ProtocolViolation(response.to_string())),
        }
    }

    /// Resolve credentials, connect to the controller and authenticate
    pub async fn establish(
        &self,
        host: &str,
        port: u16,
        retry: RetryPolicy,
    ) -> Result<Link, MonitorError> {
        let creds = self
            .resolve_credentials()
            .await
            .map_err(AuthError::from)?;

        let mut link = connect(host, port, retry)
            .await
            .map_err(MonitorError::ControllerUnavailable)?;

        self.authenticate(&mut link, &creds).await?;
        Ok(link)
    }

    pub fn session_key(&self) -> Option<SessionKey> {
        self.session_key.lock().clone()
    }

    pub fn has_session_key(&self) -> bool {
        self.session_key.lock().is_some()
    }

    /// Forget the session key once the controller link is gone
    pub fn invalidate(&self) {
        if self.session_key.lock().take().is_some() {
            info!("Session key for {} discarded", self.cp_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::error::RegistryError;
    use crate::registry::IssuedCredentials;
    use async_trait::async_trait;
    use evcp_core::frame::encode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubRegistry {
        calls: AtomicUsize,
        conflict: bool,
    }

    impl StubRegistry {
        fn issuing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                conflict: false,
            })
        }

        fn conflicting() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                conflict: true,
            })
        }
    }

    #[async_trait]
    impl Registry for StubRegistry {
        async fn register(
            &self,
            request: &RegistrationRequest,
        ) -> Result<IssuedCredentials, RegistryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.conflict {
                return Err(RegistryError::Conflict {
                    cp_id: request.cp_id.clone(),
                });
            }
            Ok(IssuedCredentials {
                username: "cp_001".to_string(),
                password: "issued-pw".to_string(),
            })
        }
    }

    fn authenticator(
        store: Arc<MemoryCredentialStore>,
        registry: Arc<StubRegistry>,
    ) -> Authenticator {
        let mut config = MonitorConfig::new("CP-001");
        config.controller.auth_timeout = Duration::from_millis(100);
        Authenticator::new(&config, store, registry)
    }

    fn creds() -> Credentials {
        Credentials::new("CP-001", "cp_001", "pw")
    }

    #[tokio::test]
    async fn test_authenticated_caches_key_and_registers() {
        let creds = creds();
        let mock = tokio_test::io::Builder::new()
            .write(&encode(&Message::authenticate("CP-001", "cp_001", "pw").unwrap()))
            .read(&encode(
                &Message::new(MessageType::Authenticated, ["CP-001", "abc"]).unwrap(),
            ))
            .write(&encode(&Message::register("MONITOR", "CP-001").unwrap()))
            .build();
        let mut link = Link::new("controller", mock);

        let auth = authenticator(Arc::new(MemoryCredentialStore::new()), StubRegistry::issuing());
        auth.authenticate(&mut link, &creds).await.unwrap();

        assert_eq!(auth.session_key(), Some(SessionKey::new("abc")));
        auth.invalidate();
        assert!(!auth.has_session_key());
    }

    #[tokio::test]
    async fn test_deny_carries_reason_and_skips_register() {
        let mock = tokio_test::io::Builder::new()
            .write(&encode(&Message::authenticate("CP-001", "cp_001", "pw").unwrap()))
            .read(&encode(
                &Message::new(MessageType::Deny, ["CP-001", "BAD_PASSWORD"]).unwrap(),
            ))
            .build();
        let mut link = Link::new("controller", mock);

        let auth = authenticator(Arc::new(MemoryCredentialStore::new()), StubRegistry::issuing());
        match auth.authenticate(&mut link, &creds()).await {
            Err(AuthError::Denied { reason }) => assert_eq!(reason, "BAD_PASSWORD"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!auth.has_session_key());
    }

    #[tokio::test]
    async fn test_deny_without_reason() {
        let mock = tokio_test::io::Builder::new()
            .write(&encode(&Message::authenticate("CP-001", "cp_001", "pw").unwrap()))
            .read(&encode(&Message::new(MessageType::Deny, ["CP-001"]).unwrap()))
            .build();
        let mut link = Link::new("controller", mock);

        let auth = authenticator(Arc::new(MemoryCredentialStore::new()), StubRegistry::issuing());
        match auth.authenticate(&mut link, &creds()).await {
            Err(AuthError::Denied { reason }) => assert_eq!(reason, "UNKNOWN"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unexpected_reply_is_protocol_violation() {
        let mock = tokio_test::io::Builder::new()
            .write(&encode(&Message::authenticate("CP-001", "cp_001", "pw").unwrap()))
            .read(&encode(
                &Message::new(MessageType::DriverStart, ["CP-001", "D1"]).unwrap(),
            ))
            .build();
        let mut link = Link::new("controller", mock);

        let auth = authenticator(Arc::new(MemoryCredentialStore::new()), StubRegistry::issuing());
        assert!(matches!(
            auth.authenticate(&mut link, &creds()).await,
            Err(AuthError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_controller_times_out() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut link = Link::new("controller", client);

        let auth = authenticator(Arc::new(MemoryCredentialStore::new()), StubRegistry::issuing());
        assert!(matches!(
            auth.authenticate(&mut link, &creds()).await,
            Err(AuthError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_controller_is_connection_lost() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let mut link = Link::new("controller", client);

        let auth = authenticator(Arc::new(MemoryCredentialStore::new()), StubRegistry::issuing());
        let result = auth.authenticate(&mut link, &creds()).await;
        // Writing into a dropped duplex fails before the read can observe EOF
        assert!(matches!(
            result,
            Err(AuthError::ConnectionLost) | Err(AuthError::Link(_))
        ));
    }

    #[tokio::test]
    async fn test_cached_credentials_skip_registry() {
        let store = Arc::new(MemoryCredentialStore::with(creds()));
        let registry = StubRegistry::issuing();
        let auth = authenticator(store, registry.clone());

        let resolved = auth.resolve_credentials().await.unwrap();
        assert_eq!(resolved.password, "pw");
        assert_eq!(registry.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_miss_registers_once_and_persists() {
        let store = Arc::new(MemoryCredentialStore::new());
        let registry = StubRegistry::issuing();
        let auth = authenticator(store.clone(), registry.clone());

        let first = auth.resolve_credentials().await.unwrap();
        let second = auth.resolve_credentials().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.password, "issued-pw");
        assert_eq!(registry.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.load("CP-001").unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_registry_conflict_is_fatal() {
        let auth = authenticator(
            Arc::new(MemoryCredentialStore::new()),
            StubRegistry::conflicting(),
        );

        assert!(matches!(
            auth.resolve_credentials().await,
            Err(CredentialError::Registry(RegistryError::Conflict { .. }))
        ));
    }
}
