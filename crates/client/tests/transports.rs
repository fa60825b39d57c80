//! Automatic transport fallback ordering and lock-in semantics.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::MockTransport;
use hubwire_client::{
    AutomaticTransport, ClientError, ClientTransport, Connection, DataCallback, HttpClient,
    StartMode, WaitError,
};

fn noop_callback() -> DataCallback {
    Arc::new(|_: &str| {})
}

fn automatic(
    transports: Vec<Arc<MockTransport>>,
) -> (AutomaticTransport, Vec<Arc<MockTransport>>) {
    let dyn_transports: Vec<Arc<dyn ClientTransport>> = transports
        .iter()
        .map(|t| t.clone() as Arc<dyn ClientTransport>)
        .collect();
    let auto = AutomaticTransport::with_transports(Arc::new(HttpClient::new()), dyn_transports);
    (auto, transports)
}

#[test]
fn falls_back_until_a_transport_starts() {
    let connection = Connection::new("http://example.test");
    let (auto, mocks) = automatic(vec![
        MockTransport::new("first"),
        MockTransport::new("second"),
        MockTransport::new("third"),
    ]);

    assert_eq!(auto.name(), "automatic");

    let outer = auto.start(&connection, StartMode::Initial, noop_callback());

    mocks[0]
        .last_start()
        .set_error(ClientError::Transport("no dice".into()));
    assert_eq!(mocks[1].start_count(), 1);

    mocks[1]
        .last_start()
        .set_error(ClientError::Http {
            status: 404,
            body: String::new(),
            headers: String::new(),
        });
    assert_eq!(mocks[2].start_count(), 1);

    mocks[2].last_start().set_result(());
    assert_eq!(outer.wait(Duration::from_millis(100)), Ok(()));

    // Locked in: identity and delegation now come from the real transport.
    assert_eq!(auto.name(), "third");
    assert!(auto.supports_keep_alive());

    auto.send(&connection, "data".into(), noop_callback());
    assert_eq!(mocks[2].sent(), vec!["data".to_string()]);
    assert!(mocks[0].sent().is_empty());

    auto.abort(&connection);
    assert_eq!(mocks[2].abort_count(), 1);
}

#[test]
fn fails_when_every_candidate_fails() {
    let connection = Connection::new("http://example.test");
    let (auto, mocks) = automatic(vec![
        MockTransport::new("first"),
        MockTransport::new("second"),
    ]);

    let outer = auto.start(&connection, StartMode::Initial, noop_callback());
    mocks[0]
        .last_start()
        .set_error(ClientError::Transport("a".into()));
    mocks[1]
        .last_start()
        .set_error(ClientError::Transport("b".into()));

    // The last attempt's error is the one reported.
    assert_eq!(
        outer.wait(Duration::from_millis(100)),
        Err(WaitError::Errored(ClientError::Transport("b".into())))
    );
    assert_eq!(auto.name(), "automatic");
}

#[test]
fn error_after_lock_in_is_forwarded_not_retried() {
    let connection = Connection::new("http://example.test");
    let (auto, mocks) = automatic(vec![
        MockTransport::new("first"),
        MockTransport::new("second"),
    ]);

    let outer = auto.start(&connection, StartMode::Initial, noop_callback());
    mocks[0].last_start().set_result(());
    assert_eq!(outer.wait(Duration::from_millis(100)), Ok(()));
    assert_eq!(auto.name(), "first");

    mocks[0]
        .last_start()
        .set_error(ClientError::ConnectionLost("stream broke".into()));

    // No fallback to the second transport; the error surfaces on the outer
    // operation.
    assert_eq!(mocks[1].start_count(), 0);
    assert!(outer.errored());
}

#[test]
fn cancellation_before_lock_in_is_a_synthetic_failure() {
    let connection = Connection::new("http://example.test");
    let (auto, mocks) = automatic(vec![
        MockTransport::new("first"),
        MockTransport::new("second"),
    ]);

    let outer = auto.start(&connection, StartMode::Initial, noop_callback());
    assert_eq!(mocks[0].start_count(), 1);

    outer.cancel();

    // The in-flight attempt was cancelled and treated as failed, which
    // advances the fallback.
    assert!(mocks[0].last_start().is_cancelled());
    assert_eq!(mocks[1].start_count(), 1);
}

#[test]
fn send_and_abort_before_lock_in_are_noops() {
    let connection = Connection::new("http://example.test");
    let (auto, mocks) = automatic(vec![MockTransport::new("only")]);

    let send = auto.send(&connection, "data".into(), noop_callback());
    assert_eq!(send.wait(Duration::from_millis(50)), Ok(()));
    assert!(mocks[0].sent().is_empty());

    let abort = auto.abort(&connection);
    assert_eq!(abort.wait(Duration::from_millis(50)), Ok(()));
    assert_eq!(mocks[0].abort_count(), 0);
    assert!(!auto.supports_keep_alive());
}
