//! Registry client
//!
//! The registry issues a username/password pair the first time a charging
//! point registers. A second registration for the same id is refused with
//! 409, since the password cannot be recovered.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{cp_number, RegistryConfig};
use crate::error::RegistryError;

/// Body of `POST /register`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationRequest {
    pub cp_id: String,
    pub latitude: String,
    pub longitude: String,
    pub price_per_kwh: f64,
}

impl RegistrationRequest {
    /// Build a request with a location derived from the CP number
    pub fn for_cp(cp_id: &str, price_per_kwh: f64) -> Self {
        let n = f64::from(cp_number(cp_id).unwrap_or(0));
        Self {
            cp_id: cp_id.to_string(),
            latitude: format!("{:.1}", 40.5 + n * 0.1),
            longitude: format!("{:.1}", -3.1 - n * 0.1),
            price_per_kwh,
        }
    }
}

/// Credentials returned by a successful registration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IssuedCredentials {
    pub username: String,
    pub password: String,
}

/// Credential-issuing service
#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<IssuedCredentials, RegistryError>;
}

/// HTTP registry client
pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRegistry {
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<IssuedCredentials, RegistryError> {
        let url = format!("{}/register", self.base_url);
        info!("Registering {} with {}", request.cp_id, url);

        let resp = self.client.post(&url).json(request).send().await?;

        match resp.status() {
            StatusCode::CREATED => {
                let issued: IssuedCredentials = resp.json().await?;
                info!("Registered {} as {}", request.cp_id, issued.username);
                Ok(issued)
            }
            StatusCode::CONFLICT => {
                warn!("{} is already registered", request.cp_id);
                Err(RegistryError::Conflict {
                    cp_id: request.cp_id.clone(),
                })
            }
            status => Err(RegistryError::UnexpectedStatus {
                status: status.as_u16(),
            }),
        }
    }
}
