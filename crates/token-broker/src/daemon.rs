//! Daemon side of the bus interface, backed by the direct handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, error, info};

use device_auth::{mask_token, AuthConfig, AuthData, AuthError, DeviceAuthClient, Result};

use crate::bus::{encode_string_pair, LocalBus, FETCH_JWT_TOKEN, GET_JWT_TOKEN, JWT_TOKEN_STATE_CHANGE};

struct DaemonInner {
    bus: LocalBus,
    client: DeviceAuthClient,
    config: AuthConfig,
    current: Mutex<Option<AuthData>>,
    fetching: AtomicBool,
}

/// Answers `GetJwtToken` and `FetchJwtToken` on a [`LocalBus`] and announces
/// every new token with `JwtTokenStateChange`. A failed fetch is announced as
/// an empty pair.
#[derive(Clone)]
pub struct AuthDaemon {
    inner: Arc<DaemonInner>,
}

impl AuthDaemon {
    pub fn new(bus: LocalBus, client: DeviceAuthClient, config: AuthConfig) -> Self {
        Self {
            inner: Arc::new(DaemonInner {
                bus,
                client,
                config,
                current: Mutex::new(None),
                fetching: AtomicBool::new(false),
            }),
        }
    }

    /// Register the method handlers. Handlers only hold a weak reference, so
    /// dropping every `AuthDaemon` makes further calls fail with `BusCall`.
    pub fn serve(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.bus.register_method(GET_JWT_TOKEN, move |_| {
            let inner = upgrade(&weak)?;
            let current = inner
                .current
                .lock()
                .clone()
                .unwrap_or_else(|| AuthData::new("", ""));
            Ok(encode_string_pair(&current))
        });

        let weak = Arc::downgrade(&self.inner);
        self.inner.bus.register_method(FETCH_JWT_TOKEN, move |_| {
            let inner = upgrade(&weak)?;
            let runtime = Handle::try_current()
                .map_err(|_| AuthError::BusCall("no runtime to run the fetch on".to_string()))?;
            if inner.fetching.swap(true, Ordering::SeqCst) {
                debug!("Token fetch already running, coalescing trigger");
                return Ok(Value::Bool(true));
            }
            runtime.spawn(async move {
                let _ = inner.refresh().await;
            });
            Ok(Value::Bool(true))
        });
        info!("Authentication daemon serving on local bus");
    }

    pub fn current_token(&self) -> Option<AuthData> {
        self.inner.current.lock().clone()
    }

    /// Run one handshake now, store the result and announce it.
    pub async fn refresh(&self) -> Result<AuthData> {
        self.inner.fetching.store(true, Ordering::SeqCst);
        self.inner.refresh().await
    }
}

fn upgrade(weak: &Weak<DaemonInner>) -> Result<Arc<DaemonInner>> {
    weak.upgrade()
        .ok_or_else(|| AuthError::BusCall("authentication daemon stopped".to_string()))
}

impl DaemonInner {
    async fn refresh(&self) -> Result<AuthData> {
        let result = self
            .client
            .fetch_token(
                &self.config.server_url,
                &self.config.private_key,
                &self.config.identity_script,
            )
            .await;
        self.fetching.store(false, Ordering::SeqCst);

        match result {
            Ok(token) => {
                let data = AuthData::new(token, self.config.server_url.clone());
                *self.current.lock() = Some(data.clone());
                let reached = self.bus.emit(JWT_TOKEN_STATE_CHANGE, encode_string_pair(&data));
                info!(
                    "New token {} announced to {} subscribers",
                    mask_token(&data.token),
                    reached
                );
                Ok(data)
            }
            Err(e) => {
                error!("Token fetch against {} failed: {}", self.config.server_url, e);
                *self.current.lock() = None;
                // Waiting brokers learn of the failure from the empty pair.
                self.bus.emit(
                    JWT_TOKEN_STATE_CHANGE,
                    encode_string_pair(&AuthData::new("", "")),
                );
                Err(e)
            }
        }
    }
}
