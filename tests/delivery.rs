use std::sync::{Arc, Mutex};
use std::time::Duration;

use httpmock::prelude::*;
use posthog::{capture_errors, Client, ClientConfig, EnqueueError, Envelope, Error, Event, Scope};
use serde_json::json;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(server: &MockServer) -> ClientConfig {
    ClientConfig::new("phc_test")
        .with_host(server.base_url())
        .with_flush_interval(Duration::from_millis(50))
        .with_retry_backoff(Duration::from_millis(1))
}

#[test]
fn delivers_events_in_batches() {
    init_logger();
    let server = MockServer::start();
    let batch = server.mock(|when, then| {
        when.method(POST)
            .path("/batch/")
            .json_body_partial(r#"{"api_key": "phc_test"}"#);
        then.status(200).json_body(json!({"status": "Ok"}));
    });

    let client = Client::new(config(&server).with_flush_at(2)).unwrap();
    for i in 0..3 {
        client
            .capture(Event::new("page viewed", "user-1").with_property("page", i))
            .unwrap();
    }
    assert!(client.flush());

    batch.assert_hits(2);
    client.shutdown().unwrap();
}

#[test]
fn compresses_batches() {
    init_logger();
    let server = MockServer::start();
    let batch = server.mock(|when, then| {
        when.method(POST)
            .path("/batch/")
            .header("content-encoding", "gzip");
        then.status(200);
    });

    let client = Client::new(config(&server).with_gzip(true)).unwrap();
    client.identify("user-1", Default::default()).unwrap();
    client.shutdown().unwrap();

    batch.assert_hits(1);
}

#[test]
fn reports_dropped_batches() {
    init_logger();
    let server = MockServer::start();
    let batch = server.mock(|when, then| {
        when.method(POST).path("/batch/");
        then.status(400).json_body(json!({"detail": "invalid"}));
    });

    let dropped = Arc::new(Mutex::new(Vec::new()));
    let client = Client::new(config(&server).with_max_retries(3).with_on_error({
        let dropped = dropped.clone();
        move |err: &Error, batch: &[Envelope]| {
            dropped
                .lock()
                .unwrap()
                .extend(batch.iter().map(|e| (e.event().to_owned(), err.to_string())));
        }
    }))
    .unwrap();

    client.alias("user-1", "anonymous-1").unwrap();
    assert!(client.flush());

    // Client errors are not retried.
    batch.assert_hits(1);
    assert_eq!(
        dropped.lock().unwrap().as_slice(),
        [("$create_alias".to_owned(), "api error (400): invalid".to_owned())]
    );
}

#[test]
fn retries_server_errors() {
    init_logger();
    let server = MockServer::start();
    let batch = server.mock(|when, then| {
        when.method(POST).path("/batch/");
        then.status(503);
    });

    let client = Client::new(config(&server).with_max_retries(2)).unwrap();
    client.capture(Event::new("e", "user-1")).unwrap();
    assert!(client.flush());

    batch.assert_hits(3);
}

#[test]
fn sync_mode_delivers_before_returning() {
    init_logger();
    let server = MockServer::start();
    let batch = server.mock(|when, then| {
        when.method(POST)
            .path("/batch/")
            .body_contains("$groupidentify");
        then.status(200);
    });

    let client = Client::new(config(&server).with_sync_mode(true)).unwrap();
    client
        .group_identify("company", "acme", Default::default())
        .unwrap();

    batch.assert_hits(1);
}

#[test]
fn captures_errors_with_scope() {
    init_logger();
    let server = MockServer::start();
    let batch = server.mock(|when, then| {
        when.method(POST)
            .path("/batch/")
            .body_contains("$exception")
            .body_contains("payment failed")
            .body_contains("req-42");
        then.status(200);
    });

    #[derive(Debug, thiserror::Error)]
    #[error("payment failed")]
    struct PaymentError;

    let client = Client::new(config(&server).with_sync_mode(true)).unwrap();
    let scope = Scope::new()
        .with_distinct_id("user-1")
        .with_tag("request_id", "req-42");

    let result: Result<(), PaymentError> = capture_errors(&client, &scope, || Err(PaymentError));

    assert!(result.is_err());
    batch.assert_hits(1);
}

#[test]
fn rejects_events_after_shutdown() {
    let server = MockServer::start();
    let client = Client::new(config(&server)).unwrap();
    client.shutdown().unwrap();

    assert_eq!(
        client.capture(Event::new("late", "user-1")),
        Err(EnqueueError::ShutDown)
    );
}
