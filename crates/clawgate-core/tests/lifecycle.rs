//! Connection lifecycle against an in-process gateway.
//!
//! Each test plays the gateway through `MemoryConnector`: it accepts the
//! client's link, sends the challenge, answers requests and pushes events.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use clawgate_core::gateway::protocol::{EventFrame, RawFrame, ResponseFrame};
use clawgate_core::gateway::{Envelope, MemoryConnector, MemoryGateway, MemoryPeer};
use clawgate_core::{ClientConfig, ConnectionState, GatewayClient, GatewayError};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::timeout;

const STEP: Duration = Duration::from_secs(5);

fn setup() -> (GatewayClient, MemoryGateway) {
    let (connector, gateway) = MemoryConnector::pair();
    let client = GatewayClient::with_connector(
        ClientConfig::new("ws://gateway.test:18789", "test-token"),
        Arc::new(connector),
    )
    .unwrap();
    (client, gateway)
}

fn spawn_connect(client: &GatewayClient) -> tokio::task::JoinHandle<Result<(), GatewayError>> {
    let client = client.clone();
    tokio::spawn(async move { client.connect().await })
}

fn spawn_request(
    client: &GatewayClient,
    method: &'static str,
    params: Value,
) -> tokio::task::JoinHandle<Result<Value, GatewayError>> {
    let client = client.clone();
    tokio::spawn(async move { client.request(method, params).await })
}

async fn accept(gateway: &mut MemoryGateway) -> MemoryPeer {
    timeout(STEP, gateway.accept()).await.unwrap().unwrap()
}

/// Send the challenge and return the handshake request id.
async fn challenge(peer: &mut MemoryPeer) -> String {
    peer.push_envelope(&Envelope::Event(EventFrame::new(
        "connect.challenge",
        json!({"nonce": "abc"}),
    )));
    match timeout(STEP, peer.recv()).await.unwrap() {
        Some(Envelope::Request(req)) if req.method == "connect" => req.id,
        other => panic!("expected handshake request, got {other:?}"),
    }
}

async fn next_request(peer: &mut MemoryPeer) -> (String, String, Value) {
    match timeout(STEP, peer.recv()).await.unwrap() {
        Some(Envelope::Request(req)) => (req.id, req.method, req.params),
        other => panic!("expected request, got {other:?}"),
    }
}

async fn open(client: &GatewayClient, gateway: &mut MemoryGateway) -> MemoryPeer {
    let connecting = spawn_connect(client);
    let mut peer = accept(gateway).await;
    let id = challenge(&mut peer).await;
    peer.push_envelope(&Envelope::Response(ResponseFrame::success(id, json!({}))));
    timeout(STEP, connecting).await.unwrap().unwrap().unwrap();
    peer
}

#[tokio::test]
async fn concurrent_connects_share_one_handshake() {
    let (client, mut gateway) = setup();
    let first = spawn_connect(&client);
    let second = spawn_connect(&client);

    let mut peer = accept(&mut gateway).await;
    let handshake_id = challenge(&mut peer).await;
    let third = spawn_connect(&client);
    tokio::task::yield_now().await;

    peer.push_envelope(&Envelope::Response(ResponseFrame::success(
        handshake_id,
        json!({"protocol": 3}),
    )));
    for caller in [first, second, third] {
        timeout(STEP, caller).await.unwrap().unwrap().unwrap();
    }

    assert_eq!(gateway.opened(), 1);
    assert!(peer.try_recv().is_none(), "only one handshake may be sent");
    assert_eq!(client.state(), ConnectionState::Open);
}

#[tokio::test]
async fn concurrent_connects_share_one_rejection() {
    let (client, mut gateway) = setup();
    let callers: Vec<_> = (0..4).map(|_| spawn_connect(&client)).collect();
    let mut peer = accept(&mut gateway).await;
    let handshake_id = challenge(&mut peer).await;
    peer.push_envelope(&Envelope::Response(ResponseFrame::failure(
        handshake_id,
        "bad token",
    )));
    for caller in callers {
        assert_eq!(
            timeout(STEP, caller).await.unwrap().unwrap(),
            Err(GatewayError::Protocol {
                message: "bad token".into()
            })
        );
    }
    assert_eq!(gateway.opened(), 1);
}

#[tokio::test]
async fn challenge_then_accept_opens() {
    let (client, mut gateway) = setup();
    let mut states = client.state_changes();
    let connecting = spawn_connect(&client);
    let mut peer = accept(&mut gateway).await;
    assert_eq!(peer.url(), "ws://gateway.test:18789");
    assert_eq!(peer.origin(), "http://localhost:18789");

    let id = challenge(&mut peer).await;
    peer.push_envelope(&Envelope::Response(ResponseFrame::success(id, json!({}))));
    timeout(STEP, connecting).await.unwrap().unwrap().unwrap();

    assert!(client.is_connected());
    assert_eq!(*states.borrow_and_update(), ConnectionState::Open);
}

#[tokio::test]
async fn rejected_handshake_fails_connect_and_retry_starts_fresh() {
    let (client, mut gateway) = setup();
    let connecting = spawn_connect(&client);
    let mut peer = accept(&mut gateway).await;
    let id = challenge(&mut peer).await;
    peer.push_envelope(&Envelope::Response(ResponseFrame::failure(id, "bad token")));

    let err = timeout(STEP, connecting).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err.to_string(), "bad token");
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.pending_requests(), 0);

    let _peer = open(&client, &mut gateway).await;
    assert_eq!(gateway.opened(), 2);
    assert!(client.is_connected());
}

#[tokio::test]
async fn rejection_without_message_uses_default() {
    let (client, mut gateway) = setup();
    let connecting = spawn_connect(&client);
    let mut peer = accept(&mut gateway).await;
    let id = challenge(&mut peer).await;
    peer.push(RawFrame::from(format!(r#"{{"type":"res","id":"{id}","ok":false}}"#)));
    assert_eq!(
        timeout(STEP, connecting).await.unwrap().unwrap(),
        Err(GatewayError::Protocol {
            message: "Unknown error".into()
        })
    );
}

#[tokio::test]
async fn rejection_with_numeric_code_fails_connect() {
    let (client, mut gateway) = setup();
    let connecting = spawn_connect(&client);
    let mut peer = accept(&mut gateway).await;
    let id = challenge(&mut peer).await;
    peer.push(RawFrame::from(format!(
        r#"{{"type":"res","id":"{id}","ok":false,"error":{{"message":"forbidden","code":403}}}}"#
    )));
    assert_eq!(
        timeout(STEP, connecting).await.unwrap().unwrap(),
        Err(GatewayError::Protocol {
            message: "forbidden".into()
        })
    );
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn transport_error_during_handshake_closes() {
    let (client, mut gateway) = setup();
    let connecting = spawn_connect(&client);
    let mut peer = accept(&mut gateway).await;
    let _handshake_id = challenge(&mut peer).await;
    assert_eq!(client.state(), ConnectionState::AwaitingChallengeResponse);
    assert_eq!(client.pending_requests(), 1);

    peer.fail("connection reset");
    assert_eq!(
        timeout(STEP, connecting).await.unwrap().unwrap(),
        Err(GatewayError::Transport("connection reset".into()))
    );
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn request_resolves_with_body() {
    let (client, mut gateway) = setup();
    let mut peer = open(&client, &mut gateway).await;

    let call = spawn_request(&client, "foo", json!({"a": 1}));
    let (id, method, params) = next_request(&mut peer).await;
    assert_eq!(method, "foo");
    assert_eq!(params, json!({"a": 1}));
    peer.push_envelope(&Envelope::Response(ResponseFrame::success(id, json!({"b": 2}))));

    assert_eq!(timeout(STEP, call).await.unwrap().unwrap(), Ok(json!({"b": 2})));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn request_connects_first_when_idle() {
    let (client, mut gateway) = setup();
    let call = spawn_request(&client, "health", json!({}));

    let mut peer = accept(&mut gateway).await;
    let handshake_id = challenge(&mut peer).await;
    peer.push_envelope(&Envelope::Response(ResponseFrame::success(
        handshake_id,
        json!({}),
    )));
    let (id, method, _) = next_request(&mut peer).await;
    assert_eq!(method, "health");
    peer.push(RawFrame::from(format!(
        r#"{{"type":"res","id":"{id}","ok":true,"payload":{{"status":"ok"}}}}"#
    )));

    assert_eq!(
        timeout(STEP, call).await.unwrap().unwrap(),
        Ok(json!({"status": "ok"}))
    );
}

#[tokio::test]
async fn protocol_error_is_local_to_its_request() {
    let (client, mut gateway) = setup();
    let mut peer = open(&client, &mut gateway).await;

    let failing = spawn_request(&client, "projects.delete", json!({"id": 9}));
    let (failing_id, _, _) = next_request(&mut peer).await;
    let other = spawn_request(&client, "projects.list", json!({}));
    let (other_id, _, _) = next_request(&mut peer).await;
    assert_ne!(failing_id, other_id);

    peer.push_envelope(&Envelope::Response(ResponseFrame::failure(
        failing_id,
        "not found",
    )));
    assert_eq!(
        timeout(STEP, failing).await.unwrap().unwrap(),
        Err(GatewayError::Protocol {
            message: "not found".into()
        })
    );
    assert!(client.is_connected());
    assert_eq!(client.pending_requests(), 1);

    peer.push_envelope(&Envelope::Response(ResponseFrame::success(other_id, json!([]))));
    assert_eq!(timeout(STEP, other).await.unwrap().unwrap(), Ok(json!([])));
}

#[tokio::test]
async fn failed_response_with_numeric_code_rejects_request() {
    let (client, mut gateway) = setup();
    let mut peer = open(&client, &mut gateway).await;

    let call = spawn_request(&client, "foo", json!({}));
    let (id, _, _) = next_request(&mut peer).await;
    peer.push(RawFrame::from(format!(
        r#"{{"type":"res","id":"{id}","ok":false,"error":{{"message":"denied","code":403}}}}"#
    )));
    assert_eq!(
        timeout(STEP, call).await.unwrap().unwrap(),
        Err(GatewayError::Protocol {
            message: "denied".into()
        })
    );
    assert_eq!(client.pending_requests(), 0);
    assert!(client.is_connected());
}

#[tokio::test]
async fn responses_settle_out_of_order() {
    let (client, mut gateway) = setup();
    let mut peer = open(&client, &mut gateway).await;

    let mut calls = Vec::new();
    let mut ids = Vec::new();
    for n in 0..5 {
        calls.push(spawn_request(&client, "echo", json!(n)));
        let (id, _, params) = next_request(&mut peer).await;
        ids.push((id, params));
    }
    for (id, params) in ids.into_iter().rev() {
        peer.push_envelope(&Envelope::Response(ResponseFrame::success(id, params)));
    }
    for (n, call) in calls.into_iter().enumerate() {
        assert_eq!(timeout(STEP, call).await.unwrap().unwrap(), Ok(json!(n)));
    }
}

#[tokio::test]
async fn unmatched_and_duplicate_responses_have_no_effect() {
    let (client, mut gateway) = setup();
    let mut peer = open(&client, &mut gateway).await;

    let call = spawn_request(&client, "foo", json!({}));
    let (id, _, _) = next_request(&mut peer).await;
    peer.push_envelope(&Envelope::Response(ResponseFrame::success("nobody", json!(0))));
    peer.push_envelope(&Envelope::Response(ResponseFrame::success(id.clone(), json!(1))));
    peer.push_envelope(&Envelope::Response(ResponseFrame::failure(id, "late")));

    assert_eq!(timeout(STEP, call).await.unwrap().unwrap(), Ok(json!(1)));

    // The connection still serves requests afterwards.
    let next = spawn_request(&client, "bar", json!({}));
    let (id, _, _) = next_request(&mut peer).await;
    peer.push_envelope(&Envelope::Response(ResponseFrame::success(id, json!(2))));
    assert_eq!(timeout(STEP, next).await.unwrap().unwrap(), Ok(json!(2)));
    assert!(client.is_connected());
}

#[tokio::test]
async fn subscribed_handler_receives_events_until_unsubscribed() {
    let (client, mut gateway) = setup();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sub = client.subscribe("tick", {
        let seen = Arc::clone(&seen);
        move |payload: &Value| seen.lock().push(payload.clone())
    });
    let mut peer = open(&client, &mut gateway).await;

    peer.push_envelope(&Envelope::Event(EventFrame::new("tick", json!(42))));
    // A request round-trip orders us after the event on the connection task.
    let sync = spawn_request(&client, "sync", json!({}));
    let (id, _, _) = next_request(&mut peer).await;
    peer.push_envelope(&Envelope::Response(ResponseFrame::success(id, Value::Null)));
    timeout(STEP, sync).await.unwrap().unwrap().unwrap();
    assert_eq!(*seen.lock(), vec![json!(42)]);

    assert!(sub.unsubscribe());
    peer.push_envelope(&Envelope::Event(EventFrame::new("tick", json!(43))));
    let sync = spawn_request(&client, "sync", json!({}));
    let (id, _, _) = next_request(&mut peer).await;
    peer.push_envelope(&Envelope::Response(ResponseFrame::success(id, Value::Null)));
    timeout(STEP, sync).await.unwrap().unwrap().unwrap();
    assert_eq!(*seen.lock(), vec![json!(42)]);
}

#[tokio::test]
async fn panicking_handler_does_not_starve_siblings() {
    let (client, mut gateway) = setup();
    let hits = Arc::new(AtomicUsize::new(0));
    let _bad = client.subscribe("tick", |_: &Value| panic!("handler bug"));
    let _good = client.subscribe("tick", {
        let hits = Arc::clone(&hits);
        move |_: &Value| {
            hits.fetch_add(1, Ordering::SeqCst);
        }
    });
    let mut peer = open(&client, &mut gateway).await;

    peer.push_envelope(&Envelope::Event(EventFrame::new("tick", json!(1))));
    peer.push_envelope(&Envelope::Event(EventFrame::new("tick", json!(2))));
    let sync = spawn_request(&client, "sync", json!({}));
    let (id, _, _) = next_request(&mut peer).await;
    peer.push_envelope(&Envelope::Response(ResponseFrame::success(id, Value::Null)));
    timeout(STEP, sync).await.unwrap().unwrap().unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(client.is_connected());
}

#[tokio::test]
async fn malformed_frame_is_discarded() {
    let (client, mut gateway) = setup();
    let mut peer = open(&client, &mut gateway).await;

    let call = spawn_request(&client, "foo", json!({}));
    let (id, _, _) = next_request(&mut peer).await;
    peer.push(RawFrame::from("this is not json"));
    peer.push(RawFrame::from(r#"{"type":"mystery"}"#));
    peer.push(RawFrame::Buffer(vec![0xff, 0xfe, 0x00]));
    tokio::task::yield_now().await;

    assert!(client.is_connected());
    assert_eq!(client.pending_requests(), 1);

    peer.push_envelope(&Envelope::Response(ResponseFrame::success(id, json!("ok"))));
    assert_eq!(timeout(STEP, call).await.unwrap().unwrap(), Ok(json!("ok")));
}

#[tokio::test]
async fn binary_encodings_decode_like_text() {
    let (client, mut gateway) = setup();
    let mut peer = open(&client, &mut gateway).await;

    let mut calls = Vec::new();
    let mut ids = Vec::new();
    for _ in 0..3 {
        calls.push(spawn_request(&client, "echo", json!({})));
        ids.push(next_request(&mut peer).await.0);
    }
    let frame = |id: &str| format!(r#"{{"type":"res","id":"{id}","ok":true,"body":"héllo"}}"#);

    peer.push(RawFrame::Buffer(frame(&ids[0]).into_bytes()));
    peer.push(RawFrame::Block(Bytes::from(frame(&ids[1]))));
    let whole = frame(&ids[2]).into_bytes();
    let (head, tail) = whole.split_at(whole.len() / 2);
    peer.push(RawFrame::Chunks(vec![
        Bytes::copy_from_slice(head),
        Bytes::copy_from_slice(tail),
    ]));

    for call in calls {
        assert_eq!(timeout(STEP, call).await.unwrap().unwrap(), Ok(json!("héllo")));
    }
}

#[tokio::test]
async fn gateway_close_returns_to_idle_and_reconnect_works() {
    let (client, mut gateway) = setup();
    let mut peer = open(&client, &mut gateway).await;
    let mut states = client.state_changes();

    let pending = spawn_request(&client, "slow", json!({}));
    let _ = next_request(&mut peer).await;
    peer.close();

    assert_eq!(
        timeout(STEP, pending).await.unwrap().unwrap(),
        Err(GatewayError::ConnectionClosed)
    );
    timeout(STEP, states.wait_for(|s| *s == ConnectionState::Idle))
        .await
        .unwrap()
        .unwrap();

    let _peer = open(&client, &mut gateway).await;
    assert_eq!(gateway.opened(), 2);
}

#[tokio::test]
async fn close_before_challenge_rejects_connect() {
    let (client, mut gateway) = setup();
    let connecting = spawn_connect(&client);
    let peer = accept(&mut gateway).await;
    peer.close();
    assert_eq!(
        timeout(STEP, connecting).await.unwrap().unwrap(),
        Err(GatewayError::ConnectionClosed)
    );
    assert_eq!(client.state(), ConnectionState::Idle);
}

#[tokio::test]
async fn explicit_close_rejects_pending_requests() {
    let (client, mut gateway) = setup();
    let mut peer = open(&client, &mut gateway).await;
    let pending = spawn_request(&client, "slow", json!({}));
    let _ = next_request(&mut peer).await;

    client.close();
    assert_eq!(
        timeout(STEP, pending).await.unwrap().unwrap(),
        Err(GatewayError::ConnectionClosed)
    );
    assert_eq!(client.state(), ConnectionState::Idle);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn gateway_requests_are_ignored() {
    let (client, mut gateway) = setup();
    let mut peer = open(&client, &mut gateway).await;
    peer.push_envelope(&Envelope::request("srv-1", "client.ping", json!({})));

    let call = spawn_request(&client, "foo", json!({}));
    let (id, method, _) = next_request(&mut peer).await;
    assert_eq!(method, "foo");
    peer.push_envelope(&Envelope::Response(ResponseFrame::success(id, json!(true))));
    assert_eq!(timeout(STEP, call).await.unwrap().unwrap(), Ok(json!(true)));
    assert!(peer.try_recv().is_none());
}
