use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Certificate, Client};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use tracing::{error, info, warn};

use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::identity::collect_identity;
use crate::masking::mask_token;
use crate::signing::{AuthRequest, DevicePrivateKey};

pub const AUTH_REQUEST_PATH: &str = "/api/devices/v1/authentication/auth_requests";
pub const SIGNATURE_HEADER: &str = "X-MEN-Signature";

/// Build the HTTP client used for the handshake. The configured server
/// certificate, if any, is trusted in addition to the system roots.
pub fn build_http_client(config: &AuthConfig) -> Result<ClientWithMiddleware> {
    let mut builder = Client::builder();
    if let Some(cert_path) = config.server_certificate() {
        let pem = std::fs::read(cert_path).map_err(|e| {
            AuthError::InvalidConfiguration(format!(
                "cannot read server certificate {}: {}",
                cert_path.display(),
                e
            ))
        })?;
        let cert = Certificate::from_pem(&pem).map_err(|e| {
            AuthError::InvalidConfiguration(format!(
                "invalid server certificate {}: {}",
                cert_path.display(),
                e
            ))
        })?;
        builder = builder.add_root_certificate(cert);
    }
    let client = builder
        .build()
        .map_err(|e| AuthError::InvalidConfiguration(format!("Failed to build HTTP client: {e}")))?;
    Ok(ClientBuilder::new(client).build())
}

/// Performs the device-to-server handshake. Holds no state between attempts
/// and never retries; each call is one independent attempt.
#[derive(Debug, Clone)]
pub struct DeviceAuthClient {
    client: Arc<ClientWithMiddleware>,
    tenant_token: Option<String>,
}

impl DeviceAuthClient {
    pub fn new(client: Arc<ClientWithMiddleware>) -> Self {
        Self {
            client,
            tenant_token: None,
        }
    }

    pub fn with_tenant_token(mut self, tenant_token: Option<String>) -> Self {
        self.tenant_token = tenant_token.filter(|t| !t.is_empty());
        self
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let client = build_http_client(config)?;
        Ok(Self::new(Arc::new(client)).with_tenant_token(config.tenant_token.clone()))
    }

    /// Collect identity, sign, POST, and return the raw token from a 2xx body.
    pub async fn fetch_token(
        &self,
        server_url: &str,
        private_key_path: &Path,
        identity_script_path: &Path,
    ) -> Result<String> {
        let identity = collect_identity(identity_script_path).await?;
        let key = DevicePrivateKey::load(private_key_path)?;
        let request = AuthRequest::build(&identity, &key, self.tenant_token.as_deref())?;
        self.submit(server_url, request).await
    }

    /// Continuation form of [`DeviceAuthClient::fetch_token`]. The attempt
    /// runs on a spawned task and `on_done` receives the outcome there.
    pub fn fetch_token_then<F>(
        &self,
        server_url: impl Into<String>,
        private_key_path: impl Into<PathBuf>,
        identity_script_path: impl Into<PathBuf>,
        on_done: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(Result<String>) + Send + 'static,
    {
        let this = self.clone();
        let server_url = server_url.into();
        let private_key_path = private_key_path.into();
        let identity_script_path = identity_script_path.into();
        tokio::spawn(async move {
            let result = this
                .fetch_token(&server_url, &private_key_path, &identity_script_path)
                .await;
            on_done(result);
        })
    }

    async fn submit(&self, server_url: &str, request: AuthRequest) -> Result<String> {
        let url = format!("{}{}", server_url.trim_end_matches('/'), AUTH_REQUEST_PATH);
        info!("Submitting authentication request to {}", url);

        let (body, signature) = request.into_parts();
        let mut builder = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body);
        if let Some(tenant_token) = &self.tenant_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {tenant_token}"));
        }

        let response = builder.send().await.map_err(|e| {
            error!("Authentication request to {} failed: {}", url, e);
            AuthError::from(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!("Authentication request rejected with status {}", status);
            return Err(AuthError::ServerRejected {
                status: status.as_u16(),
            });
        }

        let token = response.text().await?;
        info!("Received authentication token {}", mask_token(&token));
        Ok(token)
    }
}
