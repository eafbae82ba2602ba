use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{future, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use device_auth::{AuthError, Result};

use super::{BusClient, SignalStream};

const SIGNAL_CAPACITY: usize = 64;

type MethodHandler = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

struct LocalBusInner {
    methods: RwLock<HashMap<String, MethodHandler>>,
    signals: broadcast::Sender<(String, Value)>,
}

/// In-process bus: method handlers are plain closures and signals fan out
/// over a broadcast channel. Cloning shares the same bus.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<LocalBusInner>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            inner: Arc::new(LocalBusInner {
                methods: RwLock::new(HashMap::new()),
                signals,
            }),
        }
    }

    /// Install the handler for `method`, replacing any previous one.
    pub fn register_method<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        let method = method.into();
        debug!("Registering bus method {}", method);
        self.inner.methods.write().insert(method, Arc::new(handler));
    }

    /// Broadcast a signal. Returns how many subscribers were reached.
    pub fn emit(&self, signal: &str, payload: Value) -> usize {
        debug!("Emitting bus signal {}", signal);
        self.inner
            .signals
            .send((signal.to_string(), payload))
            .unwrap_or(0)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBus")
            .field("methods", &self.inner.methods.read().len())
            .field("subscribers", &self.inner.signals.receiver_count())
            .finish()
    }
}

#[async_trait]
impl BusClient for LocalBus {
    async fn call(&self, method: &str, args: Value) -> Result<Value> {
        // Clone out of the lock so handlers may emit or re-register.
        let handler = self.inner.methods.read().get(method).cloned();
        match handler {
            Some(handler) => handler(args),
            None => Err(AuthError::BusCall(format!("no handler for method {method}"))),
        }
    }

    async fn subscribe(&self, signal: &str) -> Result<SignalStream> {
        let name = signal.to_string();
        let stream = BroadcastStream::new(self.inner.signals.subscribe()).filter_map(move |item| {
            let payload = match item {
                Ok((signal, payload)) if signal == name => Some(payload),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("Subscriber for {} lagged, {} signals dropped", name, skipped);
                    None
                }
            };
            future::ready(payload)
        });
        Ok(stream.boxed())
    }
}
