//! Token broker.
//!
//! An [`Authenticator`] is a cheap handle onto an actor task that owns the
//! [`TokenCache`] and the queue of waiting requests. All state changes happen
//! on that task, one message at a time:
//!
//! ```text
//! Empty --with_token--> FetchInFlight --signal--> Valid
//!                                     --timeout/bus error/empty signal--> Empty
//! Valid --with_token--> Valid (served from cache)
//! Valid --expire_token--> Empty
//! ```
//!
//! A fetch cycle asks the daemon for its current token and, if it has none,
//! asks it to fetch one and waits for the token-changed signal. Every request
//! queued while a cycle is in flight receives that cycle's outcome.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use device_auth::{mask_token, AuthConfig, AuthData, AuthError, Result};

use crate::bus::{AuthManagerProxy, BusClient, GET_JWT_TOKEN};
use crate::cache::{CacheState, TokenCache};

pub type ExpectedAuthData = Result<AuthData>;

type Continuation = Box<dyn FnOnce(ExpectedAuthData) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Empty,
    FetchInFlight,
    Valid,
}

/// Someone waiting for a token.
enum Waiter {
    Reply(oneshot::Sender<ExpectedAuthData>),
    Then(Continuation),
}

enum Command {
    WithToken(Waiter),
    ExpireToken,
    State(oneshot::Sender<BrokerState>),
}

struct CycleResult {
    cycle: u64,
    outcome: ExpectedAuthData,
}

struct InFlightCycle {
    id: u64,
    task: JoinHandle<()>,
    /// Set once `FetchJwtToken` has been sent for this cycle.
    triggered: Arc<AtomicBool>,
}

/// Handle to the token broker. Dropping it shuts the broker down; requests
/// still waiting then receive [`AuthError::Cancelled`].
#[derive(Debug)]
pub struct Authenticator {
    commands: mpsc::UnboundedSender<Command>,
    runtime: Handle,
    fetch_timeout: Duration,
}

impl Authenticator {
    /// Start a broker on the current tokio runtime.
    pub fn new(bus: Arc<dyn BusClient>, fetch_timeout: Duration) -> Result<Self> {
        if fetch_timeout.is_zero() {
            return Err(AuthError::InvalidConfiguration(
                "token fetch timeout must be positive".to_string(),
            ));
        }
        let runtime = Handle::try_current().map_err(|_| {
            AuthError::InvalidConfiguration(
                "Authenticator must be created inside a tokio runtime".to_string(),
            )
        })?;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (continuations, continuations_rx) = mpsc::unbounded_channel();
        let actor = AuthenticatorActor {
            proxy: AuthManagerProxy::new(bus),
            fetch_timeout,
            cache: TokenCache::new(),
            pending: VecDeque::new(),
            in_flight: None,
            next_cycle: 0,
            daemon_token_stale: false,
            results_tx,
            continuations,
        };
        runtime.spawn(run_continuations(continuations_rx));
        runtime.spawn(actor.run(commands_rx, results_rx));

        Ok(Self {
            commands,
            runtime,
            fetch_timeout,
        })
    }

    pub fn from_config(bus: Arc<dyn BusClient>, config: &AuthConfig) -> Result<Self> {
        Self::new(bus, config.fetch_timeout())
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// Register interest in a valid token.
    ///
    /// The request is queued when this is called, not when the returned
    /// future is first polled, so call order is resolution order.
    pub fn with_token(&self) -> impl Future<Output = ExpectedAuthData> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        // If the actor is gone the sender is dropped here and `rx` reports it.
        let _ = self.commands.send(Command::WithToken(Waiter::Reply(tx)));
        async move { rx.await.unwrap_or(Err(AuthError::Cancelled)) }
    }

    /// Continuation form of [`Authenticator::with_token`]. `action` never
    /// runs inside this call. Continuations run one at a time on a single
    /// task, in the order they were registered.
    pub fn with_token_then<F>(&self, action: F)
    where
        F: FnOnce(ExpectedAuthData) + Send + 'static,
    {
        if let Err(mpsc::error::SendError(Command::WithToken(Waiter::Then(action)))) = self
            .commands
            .send(Command::WithToken(Waiter::Then(Box::new(action))))
        {
            // The actor is gone and so is the dispatcher.
            self.runtime.spawn(async move { action(Err(AuthError::Cancelled)) });
        }
    }

    /// Forget the cached token. The next [`Authenticator::with_token`]
    /// starts a new fetch; requests already waiting are unaffected.
    pub fn expire_token(&self) {
        let _ = self.commands.send(Command::ExpireToken);
    }

    pub async fn state(&self) -> BrokerState {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::State(tx));
        rx.await.unwrap_or(BrokerState::Empty)
    }
}

/// Runs continuations strictly one after another.
async fn run_continuations(mut jobs: mpsc::UnboundedReceiver<(Continuation, ExpectedAuthData)>) {
    while let Some((action, outcome)) = jobs.recv().await {
        action(outcome);
    }
}

struct AuthenticatorActor {
    proxy: AuthManagerProxy,
    fetch_timeout: Duration,
    cache: TokenCache,
    pending: VecDeque<Waiter>,
    in_flight: Option<InFlightCycle>,
    next_cycle: u64,
    /// Set by an explicit expire: the daemon still holds the token we just
    /// dropped, so asking for its current token would hand it straight back.
    daemon_token_stale: bool,
    results_tx: mpsc::UnboundedSender<CycleResult>,
    continuations: mpsc::UnboundedSender<(Continuation, ExpectedAuthData)>,
}

impl AuthenticatorActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut results: mpsc::UnboundedReceiver<CycleResult>,
    ) {
        let mut signals = match self.proxy.token_changes().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!("Cannot subscribe to token changes, fetches will time out: {}", e);
                None
            }
        };

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(result) = results.recv() => self.finish_cycle(result.cycle, result.outcome),
                signal = next_signal(&mut signals) => match signal {
                    Some(signal) => self.handle_signal(signal),
                    None => {
                        warn!("Token change subscription closed");
                        signals = None;
                    }
                },
            }
        }
        debug!("Authenticator handle dropped, shutting down");
    }

    fn state(&self) -> BrokerState {
        if self.in_flight.is_some() {
            return BrokerState::FetchInFlight;
        }
        match self.cache.state() {
            CacheState::Valid => BrokerState::Valid,
            CacheState::Empty => BrokerState::Empty,
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::WithToken(waiter) => {
                if let Some(data) = self.cache.get() {
                    let data = data.clone();
                    self.deliver(waiter, Ok(data));
                    return;
                }
                self.pending.push_back(waiter);
                if self.in_flight.is_none() {
                    self.start_cycle();
                } else {
                    debug!(
                        "Joining in-flight token fetch ({} waiting)",
                        self.pending.len()
                    );
                }
            }
            Command::ExpireToken => {
                if self.cache.expire() {
                    info!("Cached token expired");
                    self.daemon_token_stale = true;
                }
            }
            Command::State(reply) => {
                let _ = reply.send(self.state());
            }
        }
    }

    fn start_cycle(&mut self) {
        self.next_cycle += 1;
        let id = self.next_cycle;
        let proxy = self.proxy.clone();
        let results = self.results_tx.clone();
        let skip_query = self.daemon_token_stale;
        let fetch_timeout = self.fetch_timeout;
        let triggered = Arc::new(AtomicBool::new(false));
        let trigger_flag = triggered.clone();

        debug!("Starting token fetch cycle {} (skip query: {})", id, skip_query);
        let task = tokio::spawn(async move {
            let outcome = run_cycle(&proxy, skip_query, fetch_timeout, &trigger_flag).await;
            let _ = results.send(CycleResult { cycle: id, outcome });
        });
        self.in_flight = Some(InFlightCycle {
            id,
            task,
            triggered,
        });
    }

    fn finish_cycle(&mut self, id: u64, outcome: ExpectedAuthData) {
        if self.in_flight.as_ref().map(|cycle| cycle.id) != Some(id) {
            debug!("Ignoring result of superseded fetch cycle {}", id);
            return;
        }
        self.in_flight = None;

        match outcome {
            Ok(data) => {
                info!("Using daemon's current token {}", mask_token(&data.token));
                self.accept(data.clone());
                self.resolve_pending(Ok(data));
            }
            Err(e) => {
                warn!("Token fetch cycle {} failed: {}", id, e);
                self.resolve_pending(Err(e));
            }
        }
    }

    fn handle_signal(&mut self, signal: ExpectedAuthData) {
        let data = match signal {
            Ok(data) => data,
            Err(e) => {
                warn!("Ignoring malformed token change signal: {}", e);
                return;
            }
        };

        if data.is_empty() {
            debug!("Daemon reports it holds no token");
            self.cache.expire();
            self.daemon_token_stale = false;
            // After a trigger, an empty announcement is the daemon's fetch failing.
            let triggered = self
                .in_flight
                .as_ref()
                .is_some_and(|cycle| cycle.triggered.load(Ordering::SeqCst));
            if !triggered {
                return;
            }
            if let Some(cycle) = self.in_flight.take() {
                cycle.task.abort();
                warn!("Daemon failed to obtain a token in cycle {}", cycle.id);
                self.resolve_pending(Err(AuthError::BusCall(
                    "daemon reported a failed token fetch".to_string(),
                )));
            }
            return;
        }

        info!("Daemon announced new token {}", mask_token(&data.token));
        self.accept(data.clone());
        if let Some(cycle) = self.in_flight.take() {
            cycle.task.abort();
            self.resolve_pending(Ok(data));
        }
    }

    fn accept(&mut self, data: AuthData) {
        self.cache.store(data);
        self.daemon_token_stale = false;
    }

    fn deliver(&self, waiter: Waiter, outcome: ExpectedAuthData) {
        match waiter {
            Waiter::Reply(reply) => {
                let _ = reply.send(outcome);
            }
            Waiter::Then(action) => {
                let _ = self.continuations.send((action, outcome));
            }
        }
    }

    fn resolve_pending(&mut self, outcome: ExpectedAuthData) {
        while let Some(waiter) = self.pending.pop_front() {
            self.deliver(waiter, outcome.clone());
        }
    }
}

impl Drop for AuthenticatorActor {
    fn drop(&mut self) {
        if let Some(cycle) = self.in_flight.take() {
            cycle.task.abort();
        }
        if !self.pending.is_empty() {
            warn!(
                "Authenticator stopped with {} requests waiting",
                self.pending.len()
            );
        }
        self.resolve_pending(Err(AuthError::Cancelled));
    }
}

async fn next_signal(
    signals: &mut Option<BoxStream<'static, ExpectedAuthData>>,
) -> Option<ExpectedAuthData> {
    match signals {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// One fetch cycle up to the point where only the signal can still win.
/// Resolves with the daemon's current token, a bus error, or a timeout.
async fn run_cycle(
    proxy: &AuthManagerProxy,
    skip_query: bool,
    fetch_timeout: Duration,
    triggered: &AtomicBool,
) -> ExpectedAuthData {
    if !skip_query {
        let current = timeout_at(Instant::now() + fetch_timeout, proxy.get_jwt_token())
            .await
            .map_err(|_| {
                AuthError::BusCall(format!(
                    "no reply to {GET_JWT_TOKEN} within {fetch_timeout:?}"
                ))
            })??;
        if !current.is_empty() {
            return Ok(current);
        }
        debug!("Daemon holds no token, asking it to fetch one");
    }

    let deadline = Instant::now() + fetch_timeout;
    triggered.store(true, Ordering::SeqCst);
    let started = timeout_at(deadline, proxy.fetch_jwt_token())
        .await
        .map_err(|_| AuthError::TokenFetchTimeout(fetch_timeout))??;
    if !started {
        return Err(AuthError::BusCall(
            "daemon declined to start a token fetch".to_string(),
        ));
    }

    tokio::time::sleep_until(deadline).await;
    warn!("No new token announced within {:?}", fetch_timeout);
    Err(AuthError::TokenFetchTimeout(fetch_timeout))
}
