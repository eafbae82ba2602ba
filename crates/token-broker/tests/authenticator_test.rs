//! Broker behaviour against a scripted daemon


use std::time::Duration;

use token_broker::bus::{FETCH_JWT_TOKEN, GET_JWT_TOKEN};
use token_broker::{AuthData, AuthError, Authenticator, BrokerState, BusClient};
use test_utils::*;
use tokio::time::Instant;

const TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test(start_paused = true)]
async fn test_existing_daemon_token_is_used_without_fetch() {
    let daemon = FakeDaemon::new()
        .answers_get(JWT_TOKEN, SERVER_URL)
        .acks_fetch(true);
    let authenticator = Authenticator::new(daemon.client(), TIMEOUT).expect("authenticator");

    let data = authenticator.with_token().await.expect("token");
    assert_eq!(data, AuthData::new(JWT_TOKEN, SERVER_URL));
    assert_eq!(daemon.get_calls(), 1);
    assert_eq!(daemon.fetch_calls(), 0);
    assert_eq!(authenticator.state().await, BrokerState::Valid);
}

#[tokio::test(start_paused = true)]
async fn test_empty_daemon_token_triggers_fetch_and_waits_for_signal() {
    let daemon = FakeDaemon::new()
        .answers_get("", "")
        .signals_on_fetch(JWT_TOKEN, SERVER_URL);
    let authenticator = Authenticator::new(daemon.client(), TIMEOUT).expect("authenticator");

    let data = authenticator.with_token().await.expect("token");
    assert_eq!(data.token, JWT_TOKEN);
    assert_eq!(data.server_url, SERVER_URL);
    assert_eq!(daemon.get_calls(), 1);
    assert_eq!(daemon.fetch_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_share_one_fetch() {
    let daemon = FakeDaemon::new()
        .answers_get("", "")
        .signals_on_fetch(JWT_TOKEN, SERVER_URL);
    let authenticator = Authenticator::new(daemon.client(), TIMEOUT).expect("authenticator");

    let first = authenticator.with_token();
    let second = authenticator.with_token();
    let (first, second) = tokio::join!(first, second);

    let first = first.expect("first");
    let second = second.expect("second");
    assert_eq!(first, second);
    assert_eq!(first, AuthData::new(JWT_TOKEN, SERVER_URL));
    assert_eq!(daemon.get_calls(), 1);
    assert_eq!(daemon.fetch_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_requests_joining_in_flight_cycle_get_same_outcome() {
    let daemon = FakeDaemon::new().answers_get("", "").acks_fetch(true);
    let authenticator = Authenticator::new(daemon.client(), TIMEOUT).expect("authenticator");

    let first = authenticator.with_token();
    settle().await;
    assert_eq!(authenticator.state().await, BrokerState::FetchInFlight);
    let second = authenticator.with_token();
    let third = authenticator.with_token();
    settle().await;

    daemon.announce(JWT_TOKEN, SERVER_URL);
    let results = [first.await, second.await, third.await];
    for result in results {
        assert_eq!(result.expect("token"), AuthData::new(JWT_TOKEN, SERVER_URL));
    }
    assert_eq!(daemon.get_calls(), 1);
    assert_eq!(daemon.fetch_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cached_token_is_reused() {
    let daemon = FakeDaemon::new().answers_get(JWT_TOKEN, SERVER_URL);
    let authenticator = Authenticator::new(daemon.client(), TIMEOUT).expect("authenticator");

    for _ in 0..3 {
        authenticator.with_token().await.expect("token");
    }
    assert_eq!(daemon.get_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_expire_then_refetch_uses_new_token() {
    let token2 = format!("{JWT_TOKEN}2");
    let server2 = format!("{SERVER_URL}2");
    let daemon = FakeDaemon::new()
        .answers_get(JWT_TOKEN, SERVER_URL)
        .signals_on_fetch(&token2, &server2);
    let authenticator = Authenticator::new(daemon.client(), TIMEOUT).expect("authenticator");

    let first = authenticator.with_token().await.expect("first");
    assert_eq!(first.token, JWT_TOKEN);

    authenticator.expire_token();
    let second = authenticator.with_token().await.expect("second");
    assert_eq!(second, AuthData::new(token2, server2));

    // The daemon's stale token is not asked for again after an expire.
    assert_eq!(daemon.get_calls(), 1);
    assert_eq!(daemon.fetch_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_expire_then_silent_daemon_times_out_no_earlier_than_deadline() {
    let daemon = FakeDaemon::new()
        .answers_get(JWT_TOKEN, SERVER_URL)
        .acks_fetch(true);
    let authenticator = Authenticator::new(daemon.client(), TIMEOUT).expect("authenticator");

    authenticator.with_token().await.expect("first");
    authenticator.expire_token();

    let started = Instant::now();
    let pending = authenticator.with_token();
    tokio::pin!(pending);

    let early = tokio::time::timeout(TIMEOUT - Duration::from_millis(10), &mut pending).await;
    assert!(early.is_err(), "resolved before the deadline: {early:?}");

    let err = pending.await.unwrap_err();
    assert_eq!(err, AuthError::TokenFetchTimeout(TIMEOUT));
    assert!(started.elapsed() >= TIMEOUT);
    assert_eq!(daemon.get_calls(), 1);
    assert_eq!(daemon.fetch_calls(), 1);
    assert_eq!(authenticator.state().await, BrokerState::Empty);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_does_not_disable_broker() {
    let daemon = FakeDaemon::new().answers_get("", "").acks_fetch(true);
    let authenticator = Authenticator::new(daemon.client(), TIMEOUT).expect("authenticator");

    let err = authenticator.with_token().await.unwrap_err();
    assert!(matches!(err, AuthError::TokenFetchTimeout(_)));

    let retry = authenticator.with_token();
    settle().await;
    daemon.announce(JWT_TOKEN, SERVER_URL);
    assert_eq!(retry.await.expect("token").token, JWT_TOKEN);
    assert_eq!(daemon.get_calls(), 2);
    assert_eq!(daemon.fetch_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_external_token_update_refreshes_cache() {
    let token2 = format!("{JWT_TOKEN}2");
    let server2 = format!("{SERVER_URL}2");
    let daemon = FakeDaemon::new()
        .answers_get(JWT_TOKEN, SERVER_URL)
        .signals_on_fetch(&token2, &server2);
    let authenticator = Authenticator::new(daemon.client(), TIMEOUT).expect("authenticator");

    assert_eq!(authenticator.with_token().await.expect("first").token, JWT_TOKEN);

    // Another client asks the daemon for a new token.
    let other = daemon.client();
    let ack = other
        .call(FETCH_JWT_TOKEN, serde_json::Value::Null)
        .await
        .expect("ack");
    assert_eq!(ack, serde_json::Value::Bool(true));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = authenticator.with_token().await.expect("second");
    assert_eq!(second, AuthData::new(token2, server2));
    assert_eq!(daemon.get_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_signal_empties_cache() {
    let daemon = FakeDaemon::new().answers_get(JWT_TOKEN, SERVER_URL);
    let authenticator = Authenticator::new(daemon.client(), TIMEOUT).expect("authenticator");

    authenticator.with_token().await.expect("token");
    daemon.announce("", "");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(authenticator.state().await, BrokerState::Empty);
}

#[tokio::test(start_paused = true)]
async fn test_expire_on_empty_cache_is_noop() {
    let daemon = FakeDaemon::new().answers_get(JWT_TOKEN, SERVER_URL);
    let authenticator = Authenticator::new(daemon.client(), TIMEOUT).expect("authenticator");

    authenticator.expire_token();
    authenticator.expire_token();
    assert_eq!(authenticator.state().await, BrokerState::Empty);

    // Still asks for the daemon's current token first.
    authenticator.with_token().await.expect("token");
    assert_eq!(daemon.get_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_expire_mid_cycle_keeps_waiting_requests() {
    let daemon = FakeDaemon::new().answers_get("", "").acks_fetch(true);
    let authenticator = Authenticator::new(daemon.client(), TIMEOUT).expect("authenticator");

    let waiting = authenticator.with_token();
    settle().await;
    authenticator.expire_token();
    assert_eq!(authenticator.state().await, BrokerState::FetchInFlight);

    daemon.announce(JWT_TOKEN, SERVER_URL);
    assert_eq!(waiting.await.expect("token").token, JWT_TOKEN);
    // The latest outcome is kept.
    assert_eq!(authenticator.state().await, BrokerState::Valid);
}

#[tokio::test(start_paused = true)]
async fn test_missing_daemon_is_bus_error_and_cache_stays_empty() {
    let daemon = FakeDaemon::new();
    let authenticator = Authenticator::new(daemon.client(), TIMEOUT).expect("authenticator");

    let first = authenticator.with_token();
    let second = authenticator.with_token();
    assert!(matches!(first.await, Err(AuthError::BusCall(_))));
    assert!(matches!(second.await, Err(AuthError::BusCall(_))));
    assert_eq!(authenticator.state().await, BrokerState::Empty);
}

#[tokio::test(start_paused = true)]
async fn test_declined_fetch_is_bus_error() {
    let daemon = FakeDaemon::new().answers_get("", "").acks_fetch(false);
    let authenticator = Authenticator::new(daemon.client(), TIMEOUT).expect("authenticator");

    let started = Instant::now();
    let err = authenticator.with_token().await.unwrap_err();
    assert!(matches!(err, AuthError::BusCall(msg) if msg.contains("declined")));
    assert!(started.elapsed() < TIMEOUT);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_authenticator_cancels_waiting_requests() {
    let daemon = FakeDaemon::new().answers_get("", "").acks_fetch(true);
    let authenticator =
        Authenticator::new(daemon.client(), Duration::from_secs(60)).expect("authenticator");

    let waiting = authenticator.with_token();
    settle().await;
    drop(authenticator);

    assert_eq!(waiting.await.unwrap_err(), AuthError::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_with_token_then_runs_continuation_on_spawned_task() {
    let daemon = FakeDaemon::new().answers_get(JWT_TOKEN, SERVER_URL);
    let authenticator = Authenticator::new(daemon.client(), TIMEOUT).expect("authenticator");

    let (tx, rx) = tokio::sync::oneshot::channel();
    let called = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = called.clone();
    authenticator.with_token_then(move |result| {
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
        let _ = tx.send(result);
    });
    // Never invoked inline.
    assert!(!called.load(std::sync::atomic::Ordering::SeqCst));

    let data = rx.await.expect("continuation ran").expect("token");
    assert_eq!(data.token, JWT_TOKEN);
}

#[tokio::test(start_paused = true)]
async fn test_failed_daemon_fetch_fails_waiters_without_waiting_for_deadline() {
    let daemon = FakeDaemon::new().answers_get("", "").fails_fetch();
    let authenticator = Authenticator::new(daemon.client(), TIMEOUT).expect("authenticator");

    let started = Instant::now();
    let first = authenticator.with_token();
    let second = authenticator.with_token();
    let (first, second) = tokio::join!(first, second);

    assert!(matches!(first, Err(AuthError::BusCall(msg)) if msg.contains("failed token fetch")));
    assert!(matches!(second, Err(AuthError::BusCall(_))));
    assert!(started.elapsed() < TIMEOUT);
    assert_eq!(daemon.fetch_calls(), 1);
    assert_eq!(authenticator.state().await, BrokerState::Empty);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_get_is_bus_error_after_timeout() {
    let daemon = FakeDaemon::new().acks_fetch(true);
    let authenticator =
        Authenticator::new(daemon.unresponsive(GET_JWT_TOKEN), TIMEOUT).expect("authenticator");

    let started = Instant::now();
    let err = authenticator.with_token().await.unwrap_err();
    assert!(matches!(err, AuthError::BusCall(msg) if msg.contains(GET_JWT_TOKEN)));
    assert!(started.elapsed() >= TIMEOUT);
    assert_eq!(daemon.fetch_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_fetch_times_out() {
    let daemon = FakeDaemon::new().answers_get("", "");
    let authenticator =
        Authenticator::new(daemon.unresponsive(FETCH_JWT_TOKEN), TIMEOUT).expect("authenticator");

    let started = Instant::now();
    let err = authenticator.with_token().await.unwrap_err();
    assert_eq!(err, AuthError::TokenFetchTimeout(TIMEOUT));
    assert!(started.elapsed() >= TIMEOUT);
    assert_eq!(daemon.get_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_authenticator_cancels_waiting_continuations() {
    let daemon = FakeDaemon::new().answers_get("", "").acks_fetch(true);
    let authenticator =
        Authenticator::new(daemon.client(), Duration::from_secs(60)).expect("authenticator");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for _ in 0..2 {
        let tx = tx.clone();
        authenticator.with_token_then(move |result| {
            let _ = tx.send(result);
        });
    }
    settle().await;
    drop(authenticator);

    for _ in 0..2 {
        assert_eq!(rx.recv().await.expect("continuation ran"), Err(AuthError::Cancelled));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_continuations_run_in_registration_order() {
    const CALLERS: usize = 20;
    let daemon = FakeDaemon::new().answers_get("", "").acks_fetch(true);
    let authenticator =
        Authenticator::new(daemon.client(), Duration::from_secs(30)).expect("authenticator");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for index in 0..CALLERS {
        let tx = tx.clone();
        authenticator.with_token_then(move |result| {
            let _ = tx.send((index, result));
        });
    }
    // Replies after every registration above has been queued.
    assert_eq!(authenticator.state().await, BrokerState::FetchInFlight);
    daemon.announce(JWT_TOKEN, SERVER_URL);

    let mut order = Vec::with_capacity(CALLERS);
    for _ in 0..CALLERS {
        let (index, result) = rx.recv().await.expect("continuation ran");
        assert_eq!(result.expect("token").token, JWT_TOKEN);
        order.push(index);
    }
    assert_eq!(order, (0..CALLERS).collect::<Vec<_>>());
    assert!(daemon.fetch_calls() <= 1);
}
