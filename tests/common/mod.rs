//! Test utilities and loopback call harness for Backflow tests.
//!
//! Provides:
//! - Loopback-backed client and server calls
//! - Peer helpers that deliver against granted credit
//! - Polling helper for asynchronous conditions

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use backflow::loopback::LoopbackTransport;
use backflow::{BidiCall, CallBuilder, FlowConfig, Role};

/// Upper bound for any single wait in a test.
pub const TIMEOUT: Duration = Duration::from_secs(5);

pub type Transport = LoopbackTransport<String, String>;

/// Start a bidirectional call over a fresh loopback transport.
pub fn start_call(role: Role, config: FlowConfig) -> (Arc<Transport>, BidiCall<String, String>) {
    start_call_on(LoopbackTransport::new(), role, config)
}

/// Start a bidirectional call over the given transport.
pub fn start_call_on(
    transport: Arc<Transport>,
    role: Role,
    config: FlowConfig,
) -> (Arc<Transport>, BidiCall<String, String>) {
    let call = CallBuilder::new(role).config(config).bidi(transport.clone());
    (transport, call)
}

/// Client call with default (capacity 1) queues.
pub fn client_call() -> (Arc<Transport>, BidiCall<String, String>) {
    start_call(Role::Client, FlowConfig::default())
}

/// Spawn a peer that delivers `messages` one credit at a time, then
/// completes the call.
pub fn spawn_peer(
    transport: &Arc<Transport>,
    messages: &[&str],
) -> tokio::task::JoinHandle<()> {
    let transport = transport.clone();
    let messages: Vec<String> = messages.iter().map(ToString::to_string).collect();
    tokio::spawn(async move {
        for message in messages {
            transport.deliver_with_credit(message).await;
        }
        transport.complete();
    })
}

/// Receive everything until the stream ends, failing the test on error or
/// timeout.
pub async fn drain(call: &mut BidiCall<String, String>) -> Vec<String> {
    let mut received = Vec::new();
    loop {
        let next = tokio::time::timeout(TIMEOUT, call.recv())
            .await
            .expect("timed out waiting for inbound message")
            .expect("inbound stream failed");
        match next {
            Some(message) => received.push(message),
            None => return received,
        }
    }
}

/// Wait for a condition to become true with timeout.
///
/// # Arguments
///
/// * `timeout` - Maximum time to wait
/// * `condition` - Closure that returns true when condition is met
///
/// # Returns
///
/// `true` if condition was met, `false` if timeout expired
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
