//! Read and write topic tests.
//!
//! Covers queue capacity, pull vs. callback consumption, concurrent waiters
//! and the change detection of `set_put`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;

use telebus_core::time::TimeService;
use telebus_core::{
    ComponentMetadata, Domain, Error, Fields, MemoryTransport, ReadTopic, ReadTopicOptions,
    Session, SessionConfig, StaticMetadata, TopicKind, WriteTopic,
};

fn metadata() -> StaticMetadata {
    StaticMetadata::new().with(
        ComponentMetadata::new("Test")
            .indexed(true)
            .with_event("scalars")
            .with_telemetry("arrays"),
    )
}

fn domain() -> Domain {
    Domain::with_parts(
        Arc::new(MemoryTransport::new()),
        Arc::new(TimeService::builtin()),
        1,
    )
}

fn config() -> SessionConfig {
    SessionConfig::new("test")
        .with_history_sync(Duration::from_millis(100))
        .with_wait_timeout(Duration::from_millis(200))
}

fn value(value: i64) -> Fields {
    json!({ "value": value }).as_object().unwrap().clone()
}

/// A started writer session (index 1) and reader session (any index).
struct Pair {
    domain: Domain,
    writer: Session,
    reader: Session,
}

impl Pair {
    fn new() -> Self {
        let domain = domain();
        let metadata = metadata();
        let writer = Session::new(&domain, "Test", 1, &metadata, config()).unwrap();
        let reader = Session::new(&domain, "Test", 0, &metadata, config()).unwrap();
        Self {
            domain,
            writer,
            reader,
        }
    }

    async fn start(&self) {
        self.writer.start().await.unwrap();
        self.reader.start().await.unwrap();
    }

    async fn close(&self) {
        self.domain.close().await;
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn latest_value(topic: &ReadTopic) -> Option<i64> {
    topic.get().and_then(|s| s.field::<i64>("value").ok())
}

#[tokio::test]
async fn test_queue_drops_oldest_when_full() {
    let pair = Pair::new();
    let evt = ReadTopic::new(
        &pair.reader,
        TopicKind::Event,
        "scalars",
        ReadTopicOptions::event().with_queue_len(10),
    )
    .unwrap();
    let out = WriteTopic::new(&pair.writer, TopicKind::Event, "scalars").unwrap();
    pair.start().await;

    for i in 1..=15 {
        out.put(Some(value(i))).unwrap();
    }
    wait_until(|| latest_value(&evt) == Some(15)).await;

    assert_eq!(evt.len(), 10);
    let oldest = evt.get_oldest().unwrap().unwrap();
    assert_eq!(oldest.field::<i64>("value").unwrap(), 6);
    pair.close().await;
}

#[tokio::test]
async fn test_get_does_not_consume() {
    let pair = Pair::new();
    let evt = ReadTopic::new(&pair.reader, TopicKind::Event, "scalars", ReadTopicOptions::event())
        .unwrap();
    let out = WriteTopic::new(&pair.writer, TopicKind::Event, "scalars").unwrap();
    pair.start().await;

    assert!(evt.get().is_none());
    assert!(!evt.has_data());
    out.put(Some(value(7))).unwrap();
    wait_until(|| evt.has_data()).await;

    let first = evt.get().unwrap();
    let second = evt.get().unwrap();
    assert!(first.same_as(&second));
    assert_eq!(evt.len(), 1);

    let sample = evt.next(false, Some(Duration::from_secs(1))).await.unwrap();
    assert!(sample.same_as(&first));
    assert!(evt.is_empty());
    // The latest sample stays available after it was consumed.
    assert_eq!(latest_value(&evt), Some(7));
    pair.close().await;
}

#[tokio::test]
async fn test_next_times_out() {
    let pair = Pair::new();
    let evt = ReadTopic::new(&pair.reader, TopicKind::Event, "scalars", ReadTopicOptions::event())
        .unwrap();
    let out = WriteTopic::new(&pair.writer, TopicKind::Event, "scalars").unwrap();
    pair.start().await;

    let started = Instant::now();
    let err = evt
        .next(false, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(started.elapsed() >= Duration::from_millis(50));

    // flush_first discards what is already queued.
    out.put(Some(value(1))).unwrap();
    wait_until(|| evt.len() == 1).await;
    let started = Instant::now();
    let err = evt
        .next(true, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(started.elapsed() >= Duration::from_millis(50));
    pair.close().await;
}

#[tokio::test]
async fn test_pull_and_callback_are_exclusive() {
    let pair = Pair::new();
    let evt = ReadTopic::new(&pair.reader, TopicKind::Event, "scalars", ReadTopicOptions::event())
        .unwrap();
    let tel = ReadTopic::new(
        &pair.reader,
        TopicKind::Telemetry,
        "arrays",
        ReadTopicOptions::telemetry(),
    )
    .unwrap();
    pair.start().await;

    evt.set_callback(|_sample| async {}).unwrap();
    assert!(evt.has_callback());
    assert!(matches!(evt.get_oldest(), Err(Error::InvalidMode(_))));
    assert!(matches!(evt.flush(), Err(Error::InvalidMode(_))));
    assert!(matches!(
        evt.next(false, Some(Duration::from_millis(10))).await,
        Err(Error::InvalidMode(_))
    ));
    // get is allowed in every mode.
    assert!(evt.get().is_none());

    // Clearing the callback makes pull operations legal again.
    evt.clear_callback();
    assert!(evt.get_oldest().unwrap().is_none());

    assert!(tel.get_oldest().unwrap().is_none());
    let err = tel.set_callback(|_sample| async {}).unwrap_err();
    assert!(matches!(err, Error::InvalidMode(_)));
    pair.close().await;
}

#[tokio::test]
async fn test_concurrent_waiters_get_same_sample() {
    let pair = Pair::new();
    let evt = ReadTopic::new(&pair.reader, TopicKind::Event, "scalars", ReadTopicOptions::event())
        .unwrap();
    let out = WriteTopic::new(&pair.writer, TopicKind::Event, "scalars").unwrap();
    pair.start().await;

    let first = {
        let evt = evt.clone();
        tokio::spawn(async move { evt.next(false, Some(Duration::from_secs(5))).await })
    };
    let second = {
        let evt = evt.clone();
        tokio::spawn(async move { evt.next(false, Some(Duration::from_secs(5))).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    out.put(Some(value(42))).unwrap();

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();
    assert!(a.same_as(&b));
    assert_eq!(a.field::<i64>("value").unwrap(), 42);
    assert!(evt.is_empty());
    pair.close().await;
}

#[tokio::test]
async fn test_callbacks_run_in_order() {
    let pair = Pair::new();
    let evt = ReadTopic::new(&pair.reader, TopicKind::Event, "scalars", ReadTopicOptions::event())
        .unwrap();
    let out = WriteTopic::new(&pair.writer, TopicKind::Event, "scalars").unwrap();
    pair.start().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    evt.set_callback(move |sample| {
        let sink = Arc::clone(&sink);
        async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            sink.lock().push(sample.field::<i64>("value").unwrap());
        }
    })
    .unwrap();

    for i in 1..=5 {
        out.put(Some(value(i))).unwrap();
    }
    wait_until(|| seen.lock().len() == 5).await;
    assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
    pair.close().await;
}

#[tokio::test]
async fn test_panicking_callback_keeps_loop_alive() {
    let pair = Pair::new();
    let evt = ReadTopic::new(&pair.reader, TopicKind::Event, "scalars", ReadTopicOptions::event())
        .unwrap();
    let out = WriteTopic::new(&pair.writer, TopicKind::Event, "scalars").unwrap();
    pair.start().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    evt.set_callback(move |sample| {
        let sink = Arc::clone(&sink);
        async move {
            let value = sample.field::<i64>("value").unwrap();
            if value == 1 {
                panic!("bad sample");
            }
            sink.lock().push(value);
        }
    })
    .unwrap();

    out.put(Some(value(1))).unwrap();
    out.put(Some(value(2))).unwrap();
    wait_until(|| seen.lock().len() == 1).await;
    assert_eq!(*seen.lock(), vec![2]);
    pair.close().await;
}

#[tokio::test]
async fn test_set_put_publishes_changes() {
    let pair = Pair::new();
    let evt = ReadTopic::new(&pair.reader, TopicKind::Event, "scalars", ReadTopicOptions::event())
        .unwrap();
    let out = WriteTopic::new(&pair.writer, TopicKind::Event, "scalars").unwrap();
    pair.start().await;

    assert!(!out.has_data());
    assert!(out.set_put(value(1), false).unwrap());
    assert!(!out.set_put(value(1), false).unwrap());
    assert!(out.set_put(value(1), true).unwrap());
    assert!(out.set_put(value(2), false).unwrap());
    assert!(out.has_data());
    assert_eq!(out.data().get("value"), Some(&json!(2)));

    wait_until(|| latest_value(&evt) == Some(2)).await;
    assert_eq!(evt.len(), 3);
    pair.close().await;
}

#[tokio::test]
async fn test_invalid_options_rejected() {
    let pair = Pair::new();
    let err = ReadTopic::new(
        &pair.reader,
        TopicKind::Event,
        "scalars",
        ReadTopicOptions::event().with_queue_len(1).with_max_history(2),
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidValue(_)));

    let err = ReadTopic::new(&pair.reader, TopicKind::Event, "missing", ReadTopicOptions::event())
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn test_write_after_close_fails() {
    let pair = Pair::new();
    let evt = ReadTopic::new(&pair.reader, TopicKind::Event, "scalars", ReadTopicOptions::event())
        .unwrap();
    let out = WriteTopic::new(&pair.writer, TopicKind::Event, "scalars").unwrap();
    pair.start().await;
    pair.close().await;

    assert!(matches!(out.put(Some(value(1))), Err(Error::Closed(_))));
    assert!(matches!(
        evt.next(false, Some(Duration::from_millis(10))).await,
        Err(Error::Closed(_))
    ));
}
