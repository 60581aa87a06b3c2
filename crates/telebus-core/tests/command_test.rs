//! Command protocol tests: a controller and a remote of the same component
//! talking over an in-process transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use telebus_core::time::TimeService;
use telebus_core::{
    Ack, AckCode, ComponentMetadata, Controller, Domain, Error, Fields, MemoryTransport, Remote,
    RemoteOptions, SessionConfig, StaticMetadata, HANDLER_FAILED_ERROR,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn metadata() -> StaticMetadata {
    StaticMetadata::new().with(
        ComponentMetadata::new("Test")
            .indexed(true)
            .with_command("wait")
            .with_command("fail")
            .with_command("abort")
            .with_event("scalars"),
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

fn duration(secs: f64) -> Fields {
    json!({ "duration": secs }).as_object().unwrap().clone()
}

/// Start a controller whose `wait` handler reports progress, sleeps for
/// the requested duration and completes, and whose `fail` handler rejects.
async fn start_controller(domain: &Domain, allow_multiple: bool) -> Controller {
    let controller = Controller::new(domain, "Test", 1, &metadata(), config()).unwrap();
    controller
        .cmd("wait")
        .unwrap()
        .set_handler(allow_multiple, |request| async move {
            let secs: f64 = request.field("duration")?;
            request.ack_in_progress("waiting")?;
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            Ok(None)
        })
        .unwrap();
    controller
        .cmd("fail")
        .unwrap()
        .set_handler(false, |request| async move { Err(request.reject("not today")) })
        .unwrap();
    controller.start().await.unwrap();
    controller
}

async fn connect_remote(domain: &Domain, config: SessionConfig) -> Remote {
    Remote::connect(domain, "Test", 1, &metadata(), config, RemoteOptions::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_command_completes() {
    let domain = domain();
    let _controller = start_controller(&domain, false).await;
    let remote = connect_remote(&domain, config()).await;

    let ack = remote
        .cmd("wait")
        .unwrap()
        .start(Some(duration(0.01)), TIMEOUT, true)
        .await
        .unwrap();
    assert_eq!(ack.ack, AckCode::Complete);
    assert_eq!(ack.result, "Done");
    assert_eq!(ack.identity, remote.session().identity());
    assert_eq!(remote.session().num_running_commands(), 0);
    domain.close().await;
}

#[tokio::test]
async fn test_ack_sequence() {
    let domain = domain();
    let _controller = start_controller(&domain, false).await;
    let remote = connect_remote(&domain, config()).await;

    let handle = remote.cmd("wait").unwrap().issue(Some(duration(0.05))).unwrap();
    let codes = [
        handle.next_ack(TIMEOUT).await.unwrap(),
        handle.next_ack(TIMEOUT).await.unwrap(),
        handle.next_ack(TIMEOUT).await.unwrap(),
    ];
    let codes: Vec<AckCode> = codes.iter().map(|a| a.ack).collect();
    assert_eq!(
        codes,
        vec![AckCode::Acknowledged, AckCode::InProgress, AckCode::Complete]
    );
    assert!(codes.iter().all(|c| c.is_good()));
    domain.close().await;
}

#[tokio::test]
async fn test_start_without_waiting_for_done() {
    let domain = domain();
    let _controller = start_controller(&domain, false).await;
    let remote = connect_remote(&domain, config()).await;

    let ack = remote
        .cmd("wait")
        .unwrap()
        .start(Some(duration(0.05)), TIMEOUT, false)
        .await
        .unwrap();
    assert_eq!(ack.ack, AckCode::InProgress);
    assert_eq!(ack.result, "waiting");
    domain.close().await;
}

#[tokio::test]
async fn test_failed_command() {
    let domain = domain();
    let _controller = start_controller(&domain, false).await;
    let remote = connect_remote(&domain, config()).await;

    let err = remote
        .cmd("fail")
        .unwrap()
        .start(None, TIMEOUT, true)
        .await
        .unwrap_err();
    let Error::Ack(err) = err else {
        panic!("expected an ack error, got {err:?}");
    };
    assert_eq!(err.ack.ack, AckCode::Failed);
    assert_eq!(err.ack.error, HANDLER_FAILED_ERROR);
    assert!(err.ack.result.starts_with("Failed:"));
    assert!(err.ack.result.contains("not today"));
    domain.close().await;
}

#[tokio::test]
async fn test_missing_field_fails_command() {
    let domain = domain();
    let _controller = start_controller(&domain, false).await;
    let remote = connect_remote(&domain, config()).await;

    let err = remote
        .cmd("wait")
        .unwrap()
        .start(None, TIMEOUT, true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Ack(ref e) if e.ack.ack == AckCode::Failed));
    domain.close().await;
}

#[tokio::test]
async fn test_no_ack_in_time() {
    let domain = domain();
    let _controller = start_controller(&domain, false).await;
    let remote = connect_remote(&domain, config()).await;

    let err = remote
        .cmd("wait")
        .unwrap()
        .start(Some(duration(1.0)), Duration::from_millis(200), true)
        .await
        .unwrap_err();
    let Error::Ack(err) = err else {
        panic!("expected an ack error, got {err:?}");
    };
    assert_eq!(err.ack.ack, AckCode::NoAck);
    // The last ack received is reported.
    assert_eq!(err.ack.result, "waiting");
    assert_eq!(remote.session().num_running_commands(), 0);
    domain.close().await;
}

#[tokio::test]
async fn test_close_aborts_running_commands() {
    let domain = domain();
    let _controller = start_controller(&domain, false).await;
    let remote = connect_remote(&domain, config()).await;

    let handle = remote.cmd("wait").unwrap().issue(Some(duration(1.0))).unwrap();
    let waiter = tokio::spawn(async move { handle.final_ack(TIMEOUT).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    remote.close().await;

    let err = waiter.await.unwrap().unwrap_err();
    let Error::Ack(err) = err else {
        panic!("expected an ack error, got {err:?}");
    };
    assert_eq!(err.ack.ack, AckCode::Aborted);
    assert_eq!(err.ack.result, "shutting down");
    domain.close().await;
}

#[tokio::test]
async fn test_handlers_run_one_at_a_time() {
    let domain = domain();
    let _controller = start_controller(&domain, false).await;
    let remote = connect_remote(&domain, config()).await;
    let wait = remote.cmd("wait").unwrap();

    let started = Instant::now();
    let first = wait.issue(Some(duration(0.4))).unwrap();
    let second = wait.issue(Some(duration(0.3))).unwrap();
    let (a, b) = tokio::join!(first.final_ack(TIMEOUT), second.final_ack(TIMEOUT));
    assert_eq!(a.unwrap().ack, AckCode::Complete);
    assert_eq!(b.unwrap().ack, AckCode::Complete);
    assert!(started.elapsed() >= Duration::from_millis(700));
    domain.close().await;
}

#[tokio::test]
async fn test_handlers_run_concurrently() {
    let domain = domain();
    let _controller = start_controller(&domain, true).await;
    let remote = connect_remote(&domain, config()).await;
    let wait = remote.cmd("wait").unwrap();

    let started = Instant::now();
    let first = wait.issue(Some(duration(0.4))).unwrap();
    let second = wait.issue(Some(duration(0.3))).unwrap();
    let (a, b) = tokio::join!(first.final_ack(TIMEOUT), second.final_ack(TIMEOUT));
    assert_eq!(a.unwrap().ack, AckCode::Complete);
    assert_eq!(b.unwrap().ack, AckCode::Complete);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(400));
    assert!(elapsed < Duration::from_millis(650));
    domain.close().await;
}

#[tokio::test]
async fn test_remotes_only_see_their_own_acks() {
    let domain = domain();
    let _controller = start_controller(&domain, false).await;
    let alice = connect_remote(&domain, config().with_identity("alice")).await;
    let bob = connect_remote(&domain, config().with_identity("bob")).await;

    let ack = alice
        .cmd("wait")
        .unwrap()
        .start(Some(duration(0.01)), TIMEOUT, true)
        .await
        .unwrap();
    assert_eq!(ack.identity, "alice");
    let ack = bob
        .cmd("wait")
        .unwrap()
        .start(Some(duration(0.01)), TIMEOUT, true)
        .await
        .unwrap();
    assert_eq!(ack.identity, "bob");
    domain.close().await;
}

#[tokio::test]
async fn test_manual_acks_from_handler() {
    let domain = domain();
    let controller = Controller::new(&domain, "Test", 1, &metadata(), config()).unwrap();
    controller
        .cmd("wait")
        .unwrap()
        .set_handler(false, |request| async move {
            let ack = Ack::new(request.seq_num(), AckCode::Stalled).with_result("stuck", false)?;
            Ok(Some(ack))
        })
        .unwrap();
    controller
        .cmd("fail")
        .unwrap()
        .set_handler(false, |_request| async move { Ok(None) })
        .unwrap();
    controller.start().await.unwrap();
    let remote = connect_remote(&domain, config()).await;

    let err = remote
        .cmd("wait")
        .unwrap()
        .start(None, TIMEOUT, true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Ack(ref e) if e.ack.ack == AckCode::Stalled && e.ack.result == "stuck"));
    domain.close().await;
}

#[tokio::test]
async fn test_controller_validation() {
    let domain = domain();
    let controller = Controller::new(&domain, "Test", 1, &metadata(), config()).unwrap();
    assert_eq!(controller.session().identity(), "Test:1");
    assert!(matches!(controller.cmd("fly"), Err(Error::NotFound(_))));
    assert!(controller.evt("scalars").is_ok());

    // Only the optional abort command may lack a handler.
    let err = controller.start().await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));

    let err = Controller::new(&domain, "Test", 0, &metadata(), config()).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    domain.close().await;
}

#[tokio::test]
async fn test_readonly_remote_has_no_commands() {
    let domain = domain();
    let remote = Remote::new(
        &domain,
        "Test",
        1,
        &metadata(),
        config(),
        RemoteOptions::default().readonly(true).include(["scalars"]),
    )
    .unwrap();
    assert!(matches!(remote.cmd("wait"), Err(Error::NotFound(_))));
    assert!(remote.evt("scalars").is_ok());
    domain.close().await;
}
