use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};

use device_auth::{AuthData, AuthError, Result};

use super::BusClient;

pub const AUTH_SERVICE: &str = "io.mender.AuthenticationManager";

/// Returns `(token, server_url)`; empty strings when the daemon holds none.
pub const GET_JWT_TOKEN: &str = "io.mender.Authentication1.GetJwtToken";
/// Asks the daemon to start a fetch; replies with an acknowledgement only.
pub const FETCH_JWT_TOKEN: &str = "io.mender.Authentication1.FetchJwtToken";
/// Broadcast `(token, server_url)` whenever the daemon's token changes.
pub const JWT_TOKEN_STATE_CHANGE: &str = "io.mender.Authentication1.JwtTokenStateChange";

/// Encodes a token pair the way the daemon sends it.
pub fn encode_string_pair(data: &AuthData) -> Value {
    json!([data.token, data.server_url])
}

pub fn decode_string_pair(value: &Value) -> Result<AuthData> {
    match value.as_array().map(Vec::as_slice) {
        Some([Value::String(token), Value::String(server_url)]) => {
            Ok(AuthData::new(token.as_str(), server_url.as_str()))
        }
        _ => Err(AuthError::BusCall(format!(
            "expected a [token, server_url] string pair, got {value}"
        ))),
    }
}

/// Typed client for the authentication daemon's bus interface.
#[derive(Clone)]
pub struct AuthManagerProxy {
    bus: Arc<dyn BusClient>,
}

impl AuthManagerProxy {
    pub fn new(bus: Arc<dyn BusClient>) -> Self {
        Self { bus }
    }

    pub async fn get_jwt_token(&self) -> Result<AuthData> {
        let reply = self.bus.call(GET_JWT_TOKEN, Value::Null).await?;
        decode_string_pair(&reply)
    }

    pub async fn fetch_jwt_token(&self) -> Result<bool> {
        let reply = self.bus.call(FETCH_JWT_TOKEN, Value::Null).await?;
        reply.as_bool().ok_or_else(|| {
            AuthError::BusCall(format!("expected a boolean acknowledgement, got {reply}"))
        })
    }

    /// Stream of decoded token-changed signals. Malformed payloads surface as
    /// `Err` items so the consumer can log and carry on.
    pub async fn token_changes(&self) -> Result<BoxStream<'static, Result<AuthData>>> {
        let signals = self.bus.subscribe(JWT_TOKEN_STATE_CHANGE).await?;
        Ok(signals
            .map(|payload| decode_string_pair(&payload))
            .boxed())
    }
}

impl std::fmt::Debug for AuthManagerProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManagerProxy")
            .field("service", &AUTH_SERVICE)
            .finish()
    }
}
