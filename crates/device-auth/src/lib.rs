//! Device authentication handshake.
//!
//! Collects the device identity, signs it with the device private key and
//! exchanges it for a bearer token at the management server.

pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod masking;
pub mod signing;
pub mod types;

pub use client::{build_http_client, DeviceAuthClient, AUTH_REQUEST_PATH, SIGNATURE_HEADER};
pub use config::AuthConfig;
pub use error::{AuthError, Result};
pub use identity::{collect_identity, IdentityAttributes};
pub use masking::mask_token;
pub use signing::{AuthRequest, DevicePrivateKey};
pub use types::AuthData;
