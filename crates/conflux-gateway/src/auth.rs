use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use conflux_config::AuthSettings;

use crate::error::GatewayError;

/// The identity an external auth service hands back for a verified bearer
/// token (§6 "Authentication (external collaborator)"). `identity` becomes
/// the authoritative `participantId` the P2P Coordinator checks relay
/// payloads against; the gateway never mints or inspects the token itself.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifiedIdentity {
    pub identity: String,
    pub session_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub organization_id: Option<String>,
}

/// Thin HTTP client for the auth collaborator, the role the reference
/// stack's own `AuthService`/`extractors::auth` plays for locally-issued
/// JWTs — except here verification is entirely out-of-process.
#[derive(Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    verify_url: String,
}

impl AuthClient {
    pub fn new(settings: &AuthSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .expect("failed to build auth http client");

        Self {
            http,
            verify_url: settings.verify_url.clone(),
        }
    }

    pub async fn verify(&self, bearer_token: &str) -> Result<VerifiedIdentity, GatewayError> {
        let response = self
            .http
            .get(&self.verify_url)
            .bearer_auth(bearer_token)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "auth service unreachable");
                GatewayError::Unavailable("auth service unreachable".into())
            })?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(GatewayError::Unauthorized("invalid or expired token".into()));
        }

        if !response.status().is_success() {
            return Err(GatewayError::Unavailable(format!(
                "auth service returned {}",
                response.status()
            )));
        }

        response
            .json::<VerifiedIdentity>()
            .await
            .map_err(|e| GatewayError::Internal(format!("malformed auth response: {e}")))
    }
}
