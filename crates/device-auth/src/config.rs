use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AuthError, Result};

pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 5000;
const DEFAULT_PRIVATE_KEY: &str = "/var/lib/device-auth/private.key";
const DEFAULT_IDENTITY_SCRIPT: &str = "/usr/share/device-auth/identity/device-identity";

/// Settings shared by the direct handshake and the token broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub server_url: String,
    /// Extra trust root; absent means the system trust store only.
    #[serde(default)]
    pub server_certificate: Option<PathBuf>,
    #[serde(default = "default_private_key")]
    pub private_key: PathBuf,
    #[serde(default = "default_identity_script")]
    pub identity_script: PathBuf,
    #[serde(default)]
    pub tenant_token: Option<String>,
    /// How long the broker waits for the daemon's token-changed signal.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,
}

fn default_private_key() -> PathBuf {
    PathBuf::from(DEFAULT_PRIVATE_KEY)
}

fn default_identity_script() -> PathBuf {
    PathBuf::from(DEFAULT_IDENTITY_SCRIPT)
}

fn default_fetch_timeout() -> u64 {
    DEFAULT_FETCH_TIMEOUT_MS
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            server_certificate: None,
            private_key: default_private_key(),
            identity_script: default_identity_script(),
            tenant_token: None,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
        }
    }
}

impl AuthConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    /// A file that is named but missing is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if !path.is_file() => {
                return Err(AuthError::InvalidConfiguration(format!(
                    "configuration file {} not found",
                    path.display()
                )))
            }
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str::<AuthConfig>(&content).map_err(|e| {
            AuthError::InvalidConfiguration(format!("{}: {}", path.display(), e))
        })?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DEVICE_AUTH_SERVER_URL") {
            self.server_url = url;
        }
        if let Some(cert) = lookup("DEVICE_AUTH_SERVER_CERT") {
            self.server_certificate = non_empty(cert).map(PathBuf::from);
        }
        if let Some(key) = lookup("DEVICE_AUTH_PRIVATE_KEY") {
            self.private_key = PathBuf::from(key);
        }
        if let Some(script) = lookup("DEVICE_AUTH_IDENTITY_SCRIPT") {
            self.identity_script = PathBuf::from(script);
        }
        if let Some(tenant) = lookup("DEVICE_AUTH_TENANT_TOKEN") {
            self.tenant_token = non_empty(tenant);
        }
        if let Some(timeout) = lookup("DEVICE_AUTH_FETCH_TIMEOUT_MS") {
            match timeout.trim().parse::<u64>() {
                Ok(ms) => self.fetch_timeout_ms = ms,
                Err(_) => tracing::warn!(
                    "Ignoring unparsable DEVICE_AUTH_FETCH_TIMEOUT_MS={:?}",
                    timeout
                ),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(AuthError::InvalidConfiguration(
                "server_url must not be empty".to_string(),
            ));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(AuthError::InvalidConfiguration(
                "fetch_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn server_certificate(&self) -> Option<&Path> {
        self.server_certificate
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }
}
