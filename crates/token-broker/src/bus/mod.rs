//! Narrow view of the local IPC bus: correlated method calls and broadcast
//! signal subscriptions. The authenticator only ever talks to this trait.

mod local;
mod proxy;

pub use local::LocalBus;
pub use proxy::*;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use device_auth::Result;

/// Signal payloads in arrival order. Ends when the bus connection goes away.
pub type SignalStream = BoxStream<'static, Value>;

#[async_trait]
pub trait BusClient: Send + Sync {
    /// Call `method` and wait for its reply. Calls are correlated by the
    /// adapter, so concurrent callers never see each other's replies.
    async fn call(&self, method: &str, args: Value) -> Result<Value>;

    /// Subscribe to every future emission of `signal`.
    async fn subscribe(&self, signal: &str) -> Result<SignalStream>;
}
