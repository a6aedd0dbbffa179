//! Cancellation and failure propagation tests.
//!
//! Tests:
//! - Repeated local cancellation reaches the transport once
//! - A consumer failure cancels the call with that cause
//! - Peer cancellation unblocks a waiting receiver
//! - Deadlines and parent tokens cancel the call
//! - Abandoning the inbound stream cancels a client call
//! - A failing server handler closes the call with its status
//! - On a multi-threaded runtime, a failed or locally cancelled server call
//!   is never reported to the peer as a normal half-close

mod common;

use std::time::Duration;

use backflow::call::serve_bidi;
use backflow::loopback::LoopbackTransport;
use backflow::{CallBuilder, FlowConfig, InboundStream, OutboundSink, Role};
use common::TIMEOUT;
use tokio_util::sync::CancellationToken;
use tonic::Code;

#[tokio::test]
async fn test_double_cancel_reaches_transport_once() {
    let (transport, call) = common::client_call();

    call.control().cancel();
    call.control().cancel();

    assert!(common::wait_for(TIMEOUT, || transport.cancel_count() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.cancel_count(), 1);
    assert_eq!(transport.cancellations()[0].code(), Code::Cancelled);

    drop(call);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.cancel_count(), 1);
}

#[tokio::test]
async fn test_consumer_error_cancels_with_cause() {
    let (transport, mut call) = common::client_call();
    let peer = common::spawn_peer(&transport, &["A", "B", "C"]);

    assert_eq!(call.recv().await.unwrap().as_deref(), Some("A"));
    let b = call.recv().await.unwrap();
    assert_eq!(b.as_deref(), Some("B"));
    call.inbound().fail(anyhow::anyhow!("cannot process B"));

    let status = call.recv().await.unwrap_err();
    assert_eq!(status.code(), Code::Unknown);
    assert_eq!(status.message(), "cannot process B");

    assert!(common::wait_for(TIMEOUT, || transport.cancel_count() == 1).await);
    let cause = &transport.cancellations()[0];
    assert_eq!(cause.code(), Code::Unknown);
    assert_eq!(cause.message(), "cannot process B");

    // No value after B ever reaches the consumer.
    assert!(call.recv().await.is_err());
    tokio::time::timeout(TIMEOUT, peer).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_peer_cancel_unblocks_receiver() {
    let (transport, call) = common::client_call();
    let (mut inbound, _outbound, control) = call.split();

    let receiver = tokio::spawn(async move { inbound.recv().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!receiver.is_finished());

    transport.cancel_from_peer();

    let result = tokio::time::timeout(TIMEOUT, receiver).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err().code(), Code::Cancelled);
    assert!(control.cancelled_by_peer());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.cancel_count(), 0, "peer cancellation is not echoed back");
}

#[tokio::test]
async fn test_peer_cancel_unblocks_sender() {
    let (transport, call) =
        common::start_call_on(LoopbackTransport::with_ready(false), Role::Client, FlowConfig::default());
    let (_inbound, outbound, _control) = call.split();

    // One value fills the queue; the second has to wait.
    outbound.send("first".to_string()).await.unwrap();
    let sender = {
        let outbound = outbound.clone();
        tokio::spawn(async move { outbound.send("second".to_string()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!sender.is_finished());

    transport.cancel_from_peer();
    let result = tokio::time::timeout(TIMEOUT, sender).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err().into_status().code(), Code::Cancelled);
    assert_eq!(transport.sent_count(), 0);
}

#[tokio::test]
async fn test_deadline_cancels_call() {
    let config = FlowConfig::default().deadline(Duration::from_millis(50));
    let (transport, mut call) = common::start_call(Role::Client, config);

    let status = tokio::time::timeout(TIMEOUT, call.recv())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);

    assert!(common::wait_for(TIMEOUT, || transport.cancel_count() == 1).await);
    assert_eq!(transport.cancellations()[0].code(), Code::DeadlineExceeded);
}

#[tokio::test]
async fn test_parent_token_cancels_call() {
    let shutdown = CancellationToken::new();
    let transport = LoopbackTransport::<String, String>::new();
    let mut call = CallBuilder::client()
        .parent(shutdown.clone())
        .bidi(transport.clone());

    shutdown.cancel();

    let status = tokio::time::timeout(TIMEOUT, call.recv())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(status.code(), Code::Cancelled);
    assert!(common::wait_for(TIMEOUT, || transport.cancel_count() == 1).await);
}

#[tokio::test]
async fn test_dropping_client_inbound_cancels_call() {
    let (transport, call) = common::client_call();
    let (inbound, _outbound, control) = call.split();

    drop(inbound);

    assert!(control.is_cancelled());
    assert!(common::wait_for(TIMEOUT, || transport.cancel_count() == 1).await);
}

#[tokio::test]
async fn test_dropping_drained_inbound_does_not_cancel() {
    let (transport, mut call) = common::client_call();
    let peer = common::spawn_peer(&transport, &["x"]);
    assert_eq!(common::drain(&mut call).await, vec!["x"]);
    peer.await.unwrap();

    drop(call);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.cancel_count(), 0);
}

#[tokio::test]
async fn test_server_handler_error_closes_call() {
    let transport = LoopbackTransport::<String, String>::new();
    let handler = |mut inbound: InboundStream<String>, _outbound: OutboundSink<String>| async move {
        let request = inbound.recv().await?;
        Err::<(), _>(anyhow::anyhow!("rejected request {request:?}"))
    };
    let control = serve_bidi(transport.clone(), FlowConfig::default(), handler);

    transport.deliver_with_credit("hello".to_string()).await;

    tokio::time::timeout(TIMEOUT, transport.finished()).await.unwrap();
    let status = transport.closed_status().expect("call closed with error");
    assert_eq!(status.code(), Code::Unknown);
    assert_eq!(status.message(), "rejected request Some(\"hello\")");
    assert_eq!(transport.cancel_count(), 0);
    assert!(control.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_error_never_half_closes() {
    for _ in 0..200 {
        let transport = LoopbackTransport::<String, String>::new();
        let handler = |_inbound: InboundStream<String>, _outbound: OutboundSink<String>| async move {
            Err::<(), _>(anyhow::anyhow!("handler failed"))
        };
        let control = serve_bidi(transport.clone(), FlowConfig::default(), handler);

        tokio::time::timeout(TIMEOUT, control.join()).await.unwrap();
        assert!(!transport.is_half_closed(), "handler error reported as success");
        let status = transport.closed_status().expect("call closed with error");
        assert_eq!(status.code(), Code::Unknown);
        assert_eq!(status.message(), "handler failed");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_cancel_then_sink_drop_never_half_closes() {
    for _ in 0..200 {
        let transport = LoopbackTransport::<String, String>::new();
        let call = CallBuilder::server().bidi(transport.clone());
        let (_inbound, outbound, control) = call.split();

        control.cancel();
        drop(outbound);

        tokio::time::timeout(TIMEOUT, control.join()).await.unwrap();
        assert!(!transport.is_half_closed(), "cancelled call reported as success");
        let status = transport.closed_status().expect("call closed with error");
        assert_eq!(status.code(), Code::Cancelled);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_cancel_then_sink_drop_cancels_once() {
    for _ in 0..200 {
        let (transport, call) = common::client_call();
        let (_inbound, outbound, control) = call.split();

        control.cancel();
        drop(outbound);

        tokio::time::timeout(TIMEOUT, control.join()).await.unwrap();
        assert!(!transport.is_half_closed());
        assert_eq!(transport.cancel_count(), 1);
    }
}
