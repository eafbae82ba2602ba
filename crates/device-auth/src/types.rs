use serde::{Deserialize, Serialize};

use crate::masking::mask_token;

/// A bearer token together with the server it was issued for.
///
/// Carries no expiry of its own; whoever caches it decides when it is stale.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthData {
    pub token: String,
    pub server_url: String,
}

impl AuthData {
    pub fn new(token: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            server_url: server_url.into(),
        }
    }

    /// The daemon reports "no token" as a pair of empty strings.
    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }
}

impl std::fmt::Debug for AuthData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthData")
            .field("token", &mask_token(&self.token))
            .field("server_url", &self.server_url)
            .finish()
    }
}
