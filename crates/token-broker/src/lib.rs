//! Token broker for components that need the device's current bearer token.
//!
//! The broker caches the token obtained from the authentication daemon over
//! the local bus, coalesces concurrent requests into a single fetch, and
//! follows the daemon's token-changed signal to keep the cache coherent.

pub mod authenticator;
pub mod bus;
pub mod cache;
pub mod daemon;

pub use authenticator::{Authenticator, BrokerState, ExpectedAuthData};
pub use bus::{AuthManagerProxy, BusClient, LocalBus, SignalStream};
pub use cache::{CacheState, TokenCache};
pub use daemon::AuthDaemon;
pub use device_auth::{AuthData, AuthError, Result};
