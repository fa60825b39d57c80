//! Hub RPC layer: invocation correlation, event dispatch, hub state.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{negotiation, MockTransport};
use hubwire_client::{
    ClientError, ConnectionState, HubClient, HubError, HubInvocation, WaitError,
};
use serde_json::{json, Value};

/// Drive a client to Connected over the given mock transport.
fn start_client(client: &HubClient, transport: &Arc<MockTransport>) {
    common::init_tracing();
    client.start_with(transport.clone());
    transport.last_negotiation().set_result(negotiation(None));
    transport.last_start().set_result(());
    assert_eq!(client.connection().state(), ConnectionState::Connected);
}

fn sent_invocation(transport: &MockTransport, index: usize) -> HubInvocation {
    let sent = transport.sent();
    serde_json::from_str(&sent[index]).expect("sent payload was not a hub invocation")
}

#[test]
fn invoke_round_trip_completes_with_decoded_result() {
    let client = HubClient::new("http://example.test");
    let proxy = client.create_proxy("math").unwrap();
    let transport = MockTransport::new("mock");
    start_client(&client, &transport);

    let op = proxy.invoke_typed::<i64>("Add", vec![json!(2), json!(3)]);

    let envelope = sent_invocation(&transport, 0);
    assert_eq!(envelope.hub, "math");
    assert_eq!(envelope.method, "Add");
    assert_eq!(envelope.args, vec![json!(2), json!(3)]);
    assert_eq!(envelope.state, None);

    transport.feed(&format!(r#"{{"I":"{}","R":5}}"#, envelope.callback_id));
    assert_eq!(op.wait(Duration::from_millis(100)), Ok(5));
}

#[test]
fn mismatched_callback_id_does_not_complete() {
    let client = HubClient::new("http://example.test");
    let proxy = client.create_proxy("math").unwrap();
    let transport = MockTransport::new("mock");
    start_client(&client, &transport);

    let op = proxy.invoke("Add", vec![json!(1)]);
    transport.feed(r#"{"I":"999","R":1}"#);
    assert!(!op.is_done());
    assert!(!op.errored());
}

#[test]
fn callback_ids_are_sequential() {
    let client = HubClient::new("http://example.test");
    let proxy = client.create_proxy("math").unwrap();
    let transport = MockTransport::new("mock");
    start_client(&client, &transport);

    proxy.invoke("A", vec![]);
    proxy.invoke("B", vec![]);
    assert_eq!(sent_invocation(&transport, 0).callback_id, "0");
    assert_eq!(sent_invocation(&transport, 1).callback_id, "1");
}

#[test]
fn hub_exception_is_distinguished_from_remote_error() {
    let client = HubClient::new("http://example.test");
    let proxy = client.create_proxy("math").unwrap();
    let transport = MockTransport::new("mock");
    start_client(&client, &transport);

    let structured = proxy.invoke("Explode", vec![]);
    let generic = proxy.invoke("Fail", vec![]);

    transport.feed(r#"{"I":"0","E":"divide by zero","H":true,"D":{"code":9}}"#);
    transport.feed(r#"{"I":"1","E":"something went wrong"}"#);

    assert_eq!(
        structured.wait(Duration::from_millis(100)),
        Err(WaitError::Errored(HubError::HubException {
            message: "divide by zero".into(),
            data: Some(json!({"code": 9})),
        }))
    );
    assert_eq!(
        generic.wait(Duration::from_millis(100)),
        Err(WaitError::Errored(HubError::Remote(
            "something went wrong".into()
        )))
    );
}

#[test]
fn pending_invocations_fail_on_disconnect() {
    let client = HubClient::new("http://example.test");
    let proxy = client.create_proxy("math").unwrap();
    let transport = MockTransport::new("mock");
    start_client(&client, &transport);

    let op = proxy.invoke("Slow", vec![]);
    client.connection().disconnect();

    assert_eq!(
        op.wait(Duration::from_millis(100)),
        Err(WaitError::Errored(HubError::ConnectionClosed(
            "Connection closed".into()
        )))
    );
}

#[test]
fn pending_invocations_fail_on_reconnecting() {
    let client = HubClient::new("http://example.test");
    let proxy = client.create_proxy("math").unwrap();
    let transport = MockTransport::new("mock");
    start_client(&client, &transport);

    let op = proxy.invoke("Slow", vec![]);
    transport.feed(r#"{"T":1}"#);

    assert_eq!(
        op.wait(Duration::from_millis(100)),
        Err(WaitError::Errored(HubError::ConnectionClosed(
            "Reconnecting".into()
        )))
    );
}

#[test]
fn cancelled_invocation_ignores_a_late_reply() {
    let client = HubClient::new("http://example.test");
    let proxy = client.create_proxy("math").unwrap();
    let transport = MockTransport::new("mock");
    start_client(&client, &transport);

    let op = proxy.invoke("Add", vec![json!(1)]);
    op.cancel();
    transport.feed(r#"{"I":"0","R":2}"#);
    assert!(!op.is_done());
}

#[test]
fn server_invocation_dispatches_case_insensitively() {
    let client = HubClient::new("http://example.test");
    let proxy = client.create_proxy("chat").unwrap();
    let messages = Arc::new(Mutex::new(Vec::new()));
    {
        let messages = messages.clone();
        proxy.on1::<String>("broadcast", move |text| {
            messages.lock().unwrap().push(text);
        });
    }
    let transport = MockTransport::new("mock");
    start_client(&client, &transport);

    transport.feed(r#"{"M":[{"H":"Chat","M":"Broadcast","A":["hello"]}]}"#);
    assert_eq!(*messages.lock().unwrap(), vec!["hello".to_string()]);
}

#[test]
fn arity_mismatch_is_reported_as_advisory_error() {
    let client = HubClient::new("http://example.test");
    let proxy = client.create_proxy("chat").unwrap();
    proxy.on1::<String>("broadcast", |_| {});

    let errors = Arc::new(Mutex::new(Vec::new()));
    {
        let errors = errors.clone();
        client.connection().on_error(move |err| {
            errors.lock().unwrap().push(err.clone());
        });
    }

    let transport = MockTransport::new("mock");
    start_client(&client, &transport);

    transport.feed(r#"{"M":[{"H":"chat","M":"broadcast","A":[]}]}"#);
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], ClientError::Handler(_)));
    assert_eq!(client.connection().state(), ConnectionState::Connected);
}

#[test]
fn multiple_subscribers_share_one_subscription() {
    let client = HubClient::new("http://example.test");
    let proxy = client.create_proxy("chat").unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let calls = calls.clone();
        proxy.on1::<String>("broadcast", move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }

    let transport = MockTransport::new("mock");
    start_client(&client, &transport);

    transport.feed(r#"{"M":[{"H":"chat","M":"broadcast","A":["x"]}]}"#);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn hub_state_is_echoed_and_merged() {
    let client = HubClient::new("http://example.test");
    let proxy = client.create_proxy("game").unwrap();
    proxy.set_state("room", json!("lobby"));

    let transport = MockTransport::new("mock");
    start_client(&client, &transport);

    let op = proxy.invoke("Join", vec![]);
    let envelope = sent_invocation(&transport, 0);
    let state = envelope.state.expect("hub state should be echoed");
    assert_eq!(state.get("room"), Some(&json!("lobby")));

    // The result carries a state update that lands on the proxy.
    transport.feed(r#"{"I":"0","R":null,"S":{"room":"arena","score":10}}"#);
    assert_eq!(op.wait(Duration::from_millis(100)), Ok(Value::Null));
    assert_eq!(proxy.state_value("room"), Some(json!("arena")));
    assert_eq!(proxy.state_as::<i64>("score").unwrap(), Some(10));
}

#[test]
fn server_invocation_state_update_lands_on_proxy() {
    let client = HubClient::new("http://example.test");
    let proxy = client.create_proxy("game").unwrap();
    proxy.on("ping", || {});

    let transport = MockTransport::new("mock");
    start_client(&client, &transport);

    transport.feed(r#"{"M":[{"H":"game","M":"ping","A":[],"S":{"round":2}}]}"#);
    assert_eq!(proxy.state_value("round"), Some(json!(2)));
}

#[test]
fn connection_data_lists_registered_hubs() {
    let client = HubClient::new("http://example.test");
    client.create_proxy("chat").unwrap();
    client.create_proxy("Game").unwrap();

    let data = client
        .connection()
        .connection_data()
        .expect("hub connections always provide connection data");
    let parsed: Vec<Value> = serde_json::from_str(&data).unwrap();
    let mut names: Vec<String> = parsed
        .iter()
        .map(|v| v["name"].as_str().unwrap().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["chat".to_string(), "game".to_string()]);
}

#[test]
fn create_proxy_is_rejected_after_start() {
    let client = HubClient::new("http://example.test");
    let transport = MockTransport::new("mock");
    client.start_with(transport.clone());
    assert!(matches!(
        client.create_proxy("late"),
        Err(ClientError::InvalidState(_))
    ));
}

#[test]
fn create_proxy_is_case_insensitive_and_reused() {
    let client = HubClient::new("http://example.test");
    let a = client.create_proxy("Chat").unwrap();
    let b = client.create_proxy("chat").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}
