//! # EVCP Monitor
//!
//! Node coordinator for one charging point. Sits between the local engine
//! (the charger hardware process) and the central controller.
//!
//! ## Architecture
//!
//! ```text
//!   Central controller
//!        ▲  AUTHENTICATE / REGISTER / FAULT / RECOVERY
//!        │  DRIVER_START / CHARGING_COMPLETE / DRIVER_STOP
//!        ▼
//! ┌──────────────────────────────────────────┐
//! │ evcp-monitor                             │
//! │  ┌───────────────┐   ┌────────────────┐  │
//! │  │ Authenticator │──►│ ControllerLink │  │
//! │  └───────────────┘   └───────┬────────┘  │
//! │                              │ sessions  │
//! │  ┌───────────────┐   ┌───────▼────────┐  │
//! │  │ HealthMonitor │──►│  SharedState   │  │
//! │  └───────┬───────┘   └────────────────┘  │
//! └──────────┼───────────────────────────────┘
//!            │ HEALTH_CHECK / HEALTH_OK / HEALTH_KO
//!            ▼
//!      Local engine
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use evcp_monitor::{Coordinator, FileCredentialStore, HttpRegistry, MonitorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MonitorConfig::new("CP-001").with_controller("localhost", 5000);
//!     let store = Arc::new(FileCredentialStore::new(&config.cache_dir));
//!     let registry = Arc::new(HttpRegistry::new(&config.registry)?);
//!
//!     let monitor = Coordinator::start(config, store, registry).await?;
//!     println!("{:?}", monitor.status());
//!     monitor.shutdown().await;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod credentials;
pub mod registry;
pub mod auth;
pub mod health;
pub mod charging;
pub mod state;
pub mod events;
pub mod controller;
pub mod coordinator;

pub use config::{
    ChargingConfig, ControllerConfig, EngineConfig, HealthConfig, MonitorConfig, RegistryConfig,
};
pub use error::{AuthError, CredentialError, MonitorError, RegistryError};
pub use credentials::{CredentialStore, Credentials, FileCredentialStore, MemoryCredentialStore};
pub use registry::{HttpRegistry, IssuedCredentials, Registry, RegistrationRequest};
pub use auth::{Authenticator, SessionKey};
pub use health::{HealthMonitor, HealthState, HealthTransition};
pub use charging::{ChargeState, SessionTracker, StopOutcome};
pub use state::{PointStatus, SharedState, StatusSnapshot};
pub use events::MonitorEvent;
pub use coordinator::Coordinator;
