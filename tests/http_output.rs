#![cfg(feature = "http")]

mod common;

use common::{eventually, memory_pool};
use mockito::Matcher;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing_log_targets::http::{HttpOutput, HttpSettings};
use tracing_log_targets::output::Output;
use tracing_log_targets::store::TargetStore;
use tracing_log_targets::{FilterLevel, Level, LogRecord, Manager, OutputError, TargetConfig};
use tracing_subscriber::layer::SubscriberExt;

fn settings(url: &str, batch_size: usize, flush_interval: Duration) -> HttpSettings {
    HttpSettings {
        url: url.to_string(),
        auth_token: None,
        batch_size,
        flush_interval,
    }
}

/// Keeps the JSON body of every request the mock answers.
fn capture_bodies() -> (Arc<Mutex<Vec<Value>>>, impl Fn(&mockito::Request) -> bool + Send + Sync + 'static) {
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&bodies);
    let matcher = move |req: &mockito::Request| {
        if let Some(body) = req.body().ok().and_then(|b| serde_json::from_slice::<Value>(b).ok()) {
            sink.lock().push(body);
        }
        true
    };
    (bodies, matcher)
}

fn messages(bodies: &[Value]) -> BTreeSet<String> {
    bodies
        .iter()
        .flat_map(|b| b.as_array().cloned().unwrap_or_default())
        .filter_map(|r| r["message"].as_str().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn full_batch_flushes_before_the_timer() {
    let mut server = mockito::Server::new_async().await;
    let (bodies, matcher) = capture_bodies();
    let mock = server
        .mock("POST", "/ingest")
        .match_request(matcher)
        .with_status(200)
        .expect_at_least(1)
        .expect_at_most(2)
        .create_async()
        .await;

    let url = format!("{}/ingest", server.url());
    let output = HttpOutput::new(settings(&url, 3, Duration::from_secs(3600))).unwrap();
    for i in 0..5 {
        output
            .write(&LogRecord::new(Level::Info, format!("event {}", i)).with_field("seq", i))
            .await
            .unwrap();
    }

    assert!(
        eventually(Duration::from_secs(5), || !bodies.lock().is_empty()).await,
        "no batch was sent although batch size was reached"
    );
    output.close().await.unwrap();
    mock.assert_async().await;

    let expected: BTreeSet<String> = (0..5).map(|i| format!("event {}", i)).collect();
    assert_eq!(messages(&bodies.lock()), expected);
}

#[tokio::test]
async fn timer_flushes_a_partial_batch() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/ingest")
        .match_body(Matcher::PartialJson(serde_json::json!([{
            "level": "warn",
            "message": "lonely",
        }])))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let url = format!("{}/ingest", server.url());
    let output = HttpOutput::new(settings(&url, 100, Duration::from_millis(200))).unwrap();
    output.write(&LogRecord::new(Level::Warn, "lonely")).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !mock.matched_async().await && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(mock.matched_async().await, "timer never flushed the batch");
    assert_eq!(output.pending(), 0);

    output.close().await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn request_carries_json_content_type_and_bearer_token() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/ingest")
        .match_header("content-type", "application/json")
        .match_header("authorization", "Bearer s3cr3t")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let output = HttpOutput::new(HttpSettings {
        auth_token: Some("s3cr3t".into()),
        ..settings(&format!("{}/ingest", server.url()), 100, Duration::from_secs(3600))
    })
    .unwrap();
    output.write(&LogRecord::new(Level::Info, "hello")).await.unwrap();
    output.close().await.unwrap();

    mock.assert_async().await;
}

#[tokio::test]
async fn no_authorization_header_without_token() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/ingest")
        .match_header("content-type", "application/json")
        .match_header("authorization", Matcher::Missing)
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let url = format!("{}/ingest", server.url());
    let output = HttpOutput::new(settings(&url, 100, Duration::from_secs(3600))).unwrap();
    output.write(&LogRecord::new(Level::Info, "anonymous")).await.unwrap();
    output.flush().await.unwrap();

    mock.assert_async().await;
    output.close().await.unwrap();
}

#[tokio::test]
async fn rejected_batch_is_dropped() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/ingest")
        .with_status(500)
        .expect(1)
        .create_async()
        .await;

    let url = format!("{}/ingest", server.url());
    let output = HttpOutput::new(settings(&url, 100, Duration::from_secs(3600))).unwrap();
    output.write(&LogRecord::new(Level::Error, "lost")).await.unwrap();
    let err = output.flush().await.unwrap_err();
    assert!(matches!(err, OutputError::Status { status: 500 }), "{:?}", err);
    assert_eq!(output.pending(), 0);

    // nothing is retried on close
    output.close().await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn write_after_close_fails() {
    let mut server = mockito::Server::new_async().await;
    let mock = server.mock("POST", Matcher::Any).expect(0).create_async().await;

    let url = format!("{}/ingest", server.url());
    let output = HttpOutput::new(settings(&url, 100, Duration::from_secs(3600))).unwrap();
    output.close().await.unwrap();

    let err = output.write(&LogRecord::new(Level::Info, "late")).await.unwrap_err();
    assert!(matches!(err, OutputError::Closed));
    mock.assert_async().await;
}

#[tokio::test]
async fn idle_http_target_sends_nothing_after_its_batch() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/ingest")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(TargetStore::new(memory_pool().await));
    store.init_schema().await.unwrap();
    store
        .create(
            &TargetConfig::http("webhook", format!("{}/ingest", server.url()))
                .with_filter_level(FilterLevel::Debug)
                .with_batching(100, 1),
        )
        .await
        .unwrap();

    let manager = Manager::new();
    let subscriber = tracing_subscriber::registry().with(manager.layer());
    let _guard = tracing::subscriber::set_default(subscriber);

    manager.set_target_store(store).await.unwrap();
    tracing::info!(bucket = "photos", "object uploaded");

    // one timer flush carries the event; the request it makes must not
    // produce the next batch
    tokio::time::sleep(Duration::from_millis(3500)).await;
    manager.close().await;

    mock.assert_async().await;
}
