//! Integration tests for the line session.
//!
//! Sessions are driven over in-memory reader/writer pairs: requests are
//! staged as newline-delimited frames and the written responses parsed
//! back.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::BufReader;

use capserve::builtin;
use capserve::dispatch::{DispatchOptions, Dispatcher};
use capserve::error::ErrorKind;
use capserve::metrics::MetricsRegistry;
use capserve::middleware::MiddlewareChain;
use capserve::protocol::{RequestId, ResponseEnvelope};
use capserve::registry::CapabilityRegistry;
use capserve::shutdown::ShutdownCoordinator;
use capserve::transport::line::{LineSession, LineTransport};

fn build_dispatcher() -> Arc<Dispatcher> {
    let mut registry = CapabilityRegistry::new();
    builtin::register_builtin(&mut registry).unwrap();
    let metrics = Arc::new(MetricsRegistry::new());
    let chain = MiddlewareChain::standard(Arc::clone(&metrics), "test");
    Arc::new(Dispatcher::new(
        Arc::new(registry),
        chain,
        metrics,
        "test",
        DispatchOptions::default(),
    ))
}

/// Runs a session over the given input until it ends, returning the parsed
/// response frames.
async fn run_session(input: &str, max_request_bytes: usize) -> Vec<ResponseEnvelope> {
    let mut output = Vec::new();
    let transport = LineTransport::new(BufReader::new(input.as_bytes()), &mut output);
    let session = LineSession::new(
        transport,
        build_dispatcher(),
        ShutdownCoordinator::new(),
        Duration::from_secs(5),
        max_request_bytes,
    );
    session.run().await.unwrap();

    String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn responses_are_sequential_and_ordered() {
    let input = concat!(
        "{\"capability\": \"echo\", \"arguments\": {\"text\": \"first\"}, \"id\": 1}\n",
        "{\"capability\": \"echo\", \"arguments\": {\"text\": \"second\"}, \"id\": 2}\n",
    );

    let responses = run_session(input, 1024 * 1024).await;

    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].id, Some(RequestId::Number(1)));
    assert_eq!(responses[0].output, Some(json!({"text": "first"})));
    assert_eq!(responses[1].id, Some(RequestId::Number(2)));
    assert_eq!(responses[1].output, Some(json!({"text": "second"})));
}

#[tokio::test]
async fn empty_lines_are_skipped() {
    let input = concat!(
        "\n",
        "   \n",
        "{\"capability\": \"echo\", \"arguments\": {\"text\": \"hi\"}, \"id\": 1}\n",
    );

    let responses = run_session(input, 1024 * 1024).await;
    assert_eq!(responses.len(), 1);
    assert!(responses[0].ok);
}

#[tokio::test]
async fn validation_failures_keep_the_session_alive() {
    let input = concat!(
        "{\"capability\": \"echo\", \"arguments\": {}, \"id\": 1}\n",
        "{\"capability\": \"echo\", \"arguments\": {\"text\": \"hi\"}, \"id\": 2}\n",
    );

    let responses = run_session(input, 1024 * 1024).await;

    assert_eq!(responses.len(), 2);
    assert!(!responses[0].ok);
    assert_eq!(
        responses[0].error.as_ref().unwrap().kind,
        ErrorKind::InvalidInput
    );
    assert!(responses[1].ok);
}

#[tokio::test]
async fn malformed_frame_ends_the_session_with_protocol_error() {
    let input = concat!(
        "{\"capability\": \"echo\", \"arguments\": {\"text\": \"hi\"}, \"id\": 1}\n",
        "this is not json\n",
        "{\"capability\": \"echo\", \"arguments\": {\"text\": \"never read\"}, \"id\": 3}\n",
    );

    let responses = run_session(input, 1024 * 1024).await;

    // The valid frame is answered, the malformed one draws a protocol
    // error, and the session ends before the third frame is read.
    assert_eq!(responses.len(), 2);
    assert!(responses[0].ok);
    assert!(!responses[1].ok);
    assert_eq!(
        responses[1].error.as_ref().unwrap().kind,
        ErrorKind::Protocol
    );
    assert!(responses[1].id.is_none());
}

#[tokio::test]
async fn oversized_frame_ends_the_session() {
    let input = concat!(
        "{\"capability\": \"echo\", \"arguments\": {\"text\": \"hi\"}, \"id\": 1}\n",
    );

    let responses = run_session(input, 8).await;

    assert_eq!(responses.len(), 1);
    assert!(!responses[0].ok);
    assert_eq!(
        responses[0].error.as_ref().unwrap().kind,
        ErrorKind::Protocol
    );
    assert!(responses[0]
        .error
        .as_ref()
        .unwrap()
        .message
        .contains("size limit"));
}
