//! Error types for the monitor

use std::io;

use evcp_core::{FrameError, LinkError};
use thiserror::Error;

/// Errors from the credential registry service
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The id is registered but this node holds no cached credentials.
    /// Only an operator can resolve this.
    #[error("{cp_id} is already registered and no local credentials exist; clear the registry entry and restart")]
    Conflict { cp_id: String },

    #[error("registry returned HTTP {status}")]
    UnexpectedStatus { status: u16 },

    #[error("registry request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Errors resolving credentials
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("credential cache I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("credential cache format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// Authentication handshake failures. None of these are retried by the
/// authenticator itself.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication denied: {reason}")]
    Denied { reason: String },

    #[error("no authentication response within {0:?}")]
    Timeout(std::time::Duration),

    #[error("controller closed the connection during authentication")]
    ConnectionLost,

    #[error("protocol violation: expected AUTHENTICATED or DENY, got {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Fatal monitor conditions
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("engine unavailable: {0}")]
    EngineUnavailable(#[source] LinkError),

    #[error("controller unavailable: {0}")]
    ControllerUnavailable(#[source] LinkError),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}
