//! Session lifecycle tests: start, historical data, dispatch failures and
//! close.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use telebus_core::time::TimeService;
use telebus_core::{
    ComponentMetadata, Domain, Error, Fields, MemoryTransport, ReadTopic, ReadTopicOptions,
    Session, SessionConfig, SessionStatus, StaticMetadata, TopicKey, TopicKind, WriteTopic,
};

fn metadata() -> StaticMetadata {
    StaticMetadata::new()
        .with(
            ComponentMetadata::new("Test")
                .indexed(true)
                .with_event("scalars")
                .with_telemetry("arrays"),
        )
        .with(ComponentMetadata::new("Plain").with_event("scalars"))
}

fn domain() -> (Domain, MemoryTransport) {
    let transport = MemoryTransport::new();
    let domain = Domain::with_parts(
        Arc::new(transport.clone()),
        Arc::new(TimeService::builtin()),
        1,
    );
    (domain, transport)
}

fn config() -> SessionConfig {
    SessionConfig::new("test")
        .with_history_sync(Duration::from_millis(100))
        .with_wait_timeout(Duration::from_millis(200))
}

fn value(value: i64) -> Fields {
    json!({ "value": value }).as_object().unwrap().clone()
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

#[tokio::test]
async fn test_index_validation() {
    let (domain, _) = domain();
    let metadata = metadata();

    let err = Session::new(&domain, "Plain", 3, &metadata, config()).unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    let err = Session::new(&domain, "Missing", 0, &metadata, config()).unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    let session = Session::new(&domain, "Test", 5, &metadata, config()).unwrap();
    assert_eq!(session.name_index(), "Test:5");
    assert_eq!(session.status(), SessionStatus::Created);
}

#[tokio::test]
async fn test_start_twice_and_late_topics() {
    let (domain, _) = domain();
    let metadata = metadata();
    let session = Session::new(&domain, "Test", 1, &metadata, config()).unwrap();
    let _evt = ReadTopic::new(&session, TopicKind::Event, "scalars", ReadTopicOptions::event())
        .unwrap();

    session.start().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Started);
    assert!(matches!(session.start().await, Err(Error::Protocol(_))));

    let err = ReadTopic::new(
        &session,
        TopicKind::Telemetry,
        "arrays",
        ReadTopicOptions::telemetry(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));

    // Writers may still be added.
    assert!(WriteTopic::new(&session, TopicKind::Event, "scalars").is_ok());
    session.close().await;
}

#[tokio::test]
async fn test_concurrent_close() {
    let (domain, transport) = domain();
    let metadata = metadata();
    let session = Session::new(&domain, "Test", 1, &metadata, config()).unwrap();
    let _evt = ReadTopic::new(&session, TopicKind::Event, "scalars", ReadTopicOptions::event())
        .unwrap();
    let _out = WriteTopic::new(&session, TopicKind::Event, "scalars").unwrap();
    session.start().await.unwrap();
    assert_eq!(domain.num_read_loops(), 1);

    tokio::join!(session.close(), session.close(), domain.close());

    assert_eq!(session.status(), SessionStatus::Closed);
    assert!(!session.is_open());
    assert_eq!(domain.num_read_loops(), 0);
    assert_eq!(transport.num_readers(), 0);
    assert_eq!(transport.num_writers(), 0);

    // Closing again returns at once.
    tokio::time::timeout(Duration::from_millis(100), session.close())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_close_before_start() {
    let (domain, transport) = domain();
    let metadata = metadata();
    let session = Session::new(&domain, "Test", 1, &metadata, config()).unwrap();
    let _evt = ReadTopic::new(&session, TopicKind::Event, "scalars", ReadTopicOptions::event())
        .unwrap();
    session.close().await;

    assert_eq!(session.status(), SessionStatus::Closed);
    assert_eq!(transport.num_readers(), 0);
    assert!(matches!(session.start().await, Err(Error::Closed(_))));
}

#[tokio::test]
async fn test_historical_data_delivered() {
    let (domain, _) = domain();
    let metadata = metadata();

    let writer = Session::new(&domain, "Test", 1, &metadata, config()).unwrap();
    let out = WriteTopic::new(&writer, TopicKind::Event, "scalars").unwrap();
    for i in 1..=3 {
        out.put(Some(value(i))).unwrap();
    }

    let reader = Session::new(&domain, "Test", 0, &metadata, config()).unwrap();
    let latest = ReadTopic::new(&reader, TopicKind::Event, "scalars", ReadTopicOptions::event())
        .unwrap();
    let two = ReadTopic::new(
        &reader,
        TopicKind::Event,
        "scalars",
        ReadTopicOptions::event().with_max_history(2),
    )
    .unwrap();
    let none = ReadTopic::new(
        &reader,
        TopicKind::Event,
        "scalars",
        ReadTopicOptions::event().with_max_history(0),
    )
    .unwrap();
    reader.start().await.unwrap();

    assert_eq!(latest.len(), 1);
    let sample = latest.get_oldest().unwrap().unwrap();
    assert_eq!(sample.field::<i64>("value").unwrap(), 3);

    let values: Vec<i64> = std::iter::from_fn(|| two.get_oldest().unwrap())
        .map(|s| s.field::<i64>("value").unwrap())
        .collect();
    assert_eq!(values, vec![2, 3]);

    assert!(none.is_empty());
    assert!(!none.has_data());
    domain.close().await;
}

#[tokio::test]
async fn test_start_without_historical_data() {
    let (domain, transport) = domain();
    let metadata = metadata();
    transport.set_history_available(false);

    let session = Session::new(&domain, "Test", 1, &metadata, config()).unwrap();
    let evt = ReadTopic::new(&session, TopicKind::Event, "scalars", ReadTopicOptions::event())
        .unwrap();
    session.start().await.unwrap();

    assert_eq!(session.status(), SessionStatus::Started);
    assert!(evt.is_empty());
    session.close().await;
}

#[tokio::test]
async fn test_close_during_history_wait() {
    let (domain, transport) = domain();
    let metadata = metadata();
    transport.set_history_available(false);

    let config = config().with_history_sync(Duration::from_millis(400));
    let session = Session::new(&domain, "Test", 1, &metadata, config).unwrap();
    let _evt = ReadTopic::new(&session, TopicKind::Event, "scalars", ReadTopicOptions::event())
        .unwrap();
    let starting = tokio::spawn({
        let session = session.clone();
        async move { session.start().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.close().await;

    // The interrupted start returns quietly and leaves the session closed.
    starting.await.unwrap().unwrap();
    assert_eq!(session.status(), SessionStatus::Closed);
    assert_eq!(domain.num_read_loops(), 0);
    tokio::time::timeout(Duration::from_secs(1), session.close())
        .await
        .unwrap();
    domain.close().await;
}

#[tokio::test]
async fn test_invalid_samples_skipped() {
    let (domain, transport) = domain();
    let metadata = metadata();
    let writer = Session::new(&domain, "Test", 1, &metadata, config()).unwrap();
    let out = WriteTopic::new(&writer, TopicKind::Event, "scalars").unwrap();
    let reader = Session::new(&domain, "Test", 1, &metadata, config()).unwrap();
    let evt = ReadTopic::new(&reader, TopicKind::Event, "scalars", ReadTopicOptions::event())
        .unwrap();
    reader.start().await.unwrap();

    transport.write_invalid("test", &TopicKey::event("Test", "scalars"), 1);
    out.put(Some(value(9))).unwrap();
    wait_until(|| evt.has_data()).await;

    assert_eq!(evt.len(), 1);
    assert_eq!(evt.get().unwrap().field::<i64>("value").unwrap(), 9);
    assert_eq!(reader.status(), SessionStatus::Started);
    domain.close().await;
}

#[tokio::test]
async fn test_single_take_failure_is_retried() {
    let (domain, transport) = domain();
    let metadata = metadata();
    let writer = Session::new(&domain, "Test", 1, &metadata, config()).unwrap();
    let out = WriteTopic::new(&writer, TopicKind::Event, "scalars").unwrap();
    let reader = Session::new(&domain, "Test", 1, &metadata, config()).unwrap();
    let evt = ReadTopic::new(&reader, TopicKind::Event, "scalars", ReadTopicOptions::event())
        .unwrap();
    reader.start().await.unwrap();

    transport.fail_next_takes(1);
    out.put(Some(value(1))).unwrap();
    wait_until(|| evt.has_data()).await;

    assert_eq!(reader.status(), SessionStatus::Started);
    assert!(reader.failure().is_none());
    domain.close().await;
}

#[tokio::test]
async fn test_repeated_take_failure_stops_dispatch() {
    let (domain, transport) = domain();
    let metadata = metadata();
    let writer = Session::new(&domain, "Test", 1, &metadata, config()).unwrap();
    let out = WriteTopic::new(&writer, TopicKind::Event, "scalars").unwrap();
    let reader = Session::new(&domain, "Test", 1, &metadata, config()).unwrap();
    let _evt = ReadTopic::new(&reader, TopicKind::Event, "scalars", ReadTopicOptions::event())
        .unwrap();
    reader.start().await.unwrap();
    let mut status = reader.subscribe_status();

    transport.fail_next_takes(2);
    out.put(Some(value(1))).unwrap();

    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| matches!(s, SessionStatus::Failed(_))),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(reader.failure().is_some());

    // A failed session still closes cleanly.
    reader.close().await;
    assert_eq!(reader.status(), SessionStatus::Closed);
    assert_eq!(domain.num_read_loops(), 0);
    domain.close().await;
}

#[tokio::test]
async fn test_domain_tracks_sessions() {
    let (domain, _) = domain();
    let metadata = metadata();
    let first = Session::new(&domain, "Test", 1, &metadata, config()).unwrap();
    let second = Session::new(&domain, "Test", 2, &metadata, config()).unwrap();
    assert_eq!(domain.num_sessions(), 2);

    first.start().await.unwrap();
    second.start().await.unwrap();
    assert_eq!(domain.num_read_loops(), 2);

    domain.close().await;
    assert_eq!(first.status(), SessionStatus::Closed);
    assert_eq!(second.status(), SessionStatus::Closed);
    assert_eq!(domain.num_read_loops(), 0);
}
