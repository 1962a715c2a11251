//! Full update cycles through the public agent API.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::{
    firmware_image, MockNetwork, MockTimeSync, Route, TestHarness, ENDPOINT, FIRMWARE_URL,
};
use bitflash::platform::{Method, TransportKind};
use bitflash::{CycleOutcome, Error, MetadataRequest, PollOutcome, RequestFailure, UpdateState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_test::{assert_err, assert_ok};

/// Wait until the agent has sent a request to `url`.
async fn wait_for_request(harness: &TestHarness, url: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !harness.transports.was_requested(url) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("request was never sent");
}

fn completed(outcome: PollOutcome) -> CycleOutcome {
    match outcome {
        PollOutcome::Completed(cycle) => cycle,
        other => panic!("expected a completed cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn test_same_version_installs_nothing() {
    let harness = TestHarness::setup();
    harness.offer("1.0.0");
    harness.serve_firmware(firmware_image(512));
    harness.advance_interval();

    let cycle = completed(harness.agent.poll().await);

    assert!(matches!(
        cycle,
        CycleOutcome::UpToDate { ref current, ref available } if current == "1.0.0" && available == "1.0.0"
    ));
    assert!(!harness.transports.was_requested(FIRMWARE_URL));
    assert!(harness.flash.record().begun.is_empty());
    assert_eq!(harness.restart.count(), 0);
    assert_eq!(harness.statuses(), vec!["No update available"]);
    assert_eq!(harness.agent.state(), UpdateState::Idle);
    assert!(!harness.agent.is_updating());
}

#[tokio::test]
async fn test_older_version_installs_nothing() {
    let harness = TestHarness::setup();
    harness.offer("0.9.12");
    harness.advance_interval();

    let cycle = completed(harness.agent.poll().await);

    assert!(matches!(cycle, CycleOutcome::UpToDate { .. }));
    assert!(!harness.transports.was_requested(FIRMWARE_URL));
}

#[tokio::test]
async fn test_newer_version_installs_and_restarts_once() {
    let harness = TestHarness::setup();
    let image = firmware_image(3000);
    harness.offer("1.2.0");
    harness.serve_firmware(image.clone());
    harness.advance_interval();

    let cycle = completed(harness.agent.poll().await);

    assert!(matches!(
        cycle,
        CycleOutcome::Installed { ref version, bytes: 3000 } if version == "1.2.0"
    ));
    let record = harness.flash.record();
    assert_eq!(record.begun, vec![3000]);
    assert_eq!(record.committed.as_deref(), Some(image.as_slice()));
    assert_eq!(record.commits, 1);
    assert_eq!(record.aborts, 0);
    assert_eq!(harness.restart.count(), 1);
    assert_eq!(harness.agent.state(), UpdateState::Rebooting);
    assert_eq!(harness.transports.open_count(), 0);

    assert_eq!(
        harness.statuses(),
        vec!["Update available", "Update complete, restarting..."]
    );
    let progress = harness.progress();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last(), Some(&100));
}

#[tokio::test]
async fn test_rebooting_refuses_further_cycles() {
    let harness = TestHarness::setup();
    harness.offer("2.0.0");
    harness.serve_firmware(firmware_image(100));
    harness.advance_interval();
    completed(harness.agent.poll().await);

    harness.advance_interval();
    assert!(matches!(harness.agent.poll().await, PollOutcome::Rebooting));
    assert!(matches!(harness.agent.check_now().await, PollOutcome::Rebooting));
    assert!(matches!(
        harness.agent.try_start_cycle(),
        Err(PollOutcome::Rebooting)
    ));
    assert_eq!(harness.restart.count(), 1);
    assert_eq!(harness.flash.record().commits, 1);
}

#[tokio::test]
async fn test_poll_before_interval_does_nothing() {
    let harness = TestHarness::setup();
    harness.offer("1.2.0");

    assert!(matches!(harness.agent.poll().await, PollOutcome::NotDue));
    harness.clock.advance(Duration::from_secs(30));
    assert!(matches!(harness.agent.poll().await, PollOutcome::NotDue));

    assert!(harness.transports.requests().is_empty());
    assert_eq!(harness.network.connects(), 0);
    assert!(harness.notifications().is_empty());
}

#[tokio::test]
async fn test_interval_restarts_after_each_cycle() {
    let harness = TestHarness::setup();
    harness.offer("1.0.0");
    harness.advance_interval();

    completed(harness.agent.poll().await);
    assert!(matches!(harness.agent.poll().await, PollOutcome::NotDue));

    harness.advance_interval();
    completed(harness.agent.poll().await);
    assert_eq!(harness.transports.requests().len(), 2);
}

#[tokio::test]
async fn test_check_now_ignores_interval() {
    let harness = TestHarness::setup();
    harness.offer("1.0.0");

    let cycle = completed(harness.agent.check_now().await);

    assert!(matches!(cycle, CycleOutcome::UpToDate { .. }));
    assert_eq!(harness.transports.requests().len(), 1);
}

#[tokio::test]
async fn test_concurrent_poll_is_refused_while_busy() {
    let harness = TestHarness::setup();
    let gate = Arc::new(Notify::new());
    harness.transports.route(
        ENDPOINT,
        Route::new(200, super::metadata_body("1.0.0")).gated(Arc::clone(&gate)),
    );
    harness.advance_interval();

    let task = harness.agent.try_start_cycle().ok().expect("cycle should start");
    assert!(harness.agent.is_updating());

    assert!(matches!(harness.agent.poll().await, PollOutcome::Busy));
    assert!(matches!(harness.agent.check_now().await, PollOutcome::Busy));
    assert!(matches!(harness.agent.try_start_cycle(), Err(PollOutcome::Busy)));

    wait_for_request(&harness, ENDPOINT).await;
    assert_eq!(harness.agent.state(), UpdateState::Checking);
    assert_eq!(harness.transports.requests().len(), 1);

    gate.notify_one();
    let cycle = task.join().await.unwrap();

    assert!(matches!(cycle, CycleOutcome::UpToDate { .. }));
    assert!(!harness.agent.is_updating());
    assert_eq!(harness.agent.state(), UpdateState::Idle);
}

#[tokio::test]
async fn test_cancelled_download_aborts_flash() {
    let harness = TestHarness::setup();
    let gate = Arc::new(Notify::new());
    harness.offer("1.1.0");
    harness.transports.route(
        FIRMWARE_URL,
        Route::new(200, firmware_image(2048)).gated(Arc::clone(&gate)),
    );
    harness.advance_interval();

    let task = harness.agent.try_start_cycle().ok().expect("cycle should start");
    wait_for_request(&harness, FIRMWARE_URL).await;
    assert_eq!(harness.agent.state(), UpdateState::Downloading);

    task.cancel();
    gate.notify_one();
    let cycle = task.join().await.unwrap();

    assert!(matches!(cycle.error(), Some(Error::Cancelled)));
    let record = harness.flash.record();
    assert_eq!(record.begun, vec![2048]);
    assert_eq!(record.commits, 0);
    assert_eq!(record.aborts, 1);
    assert_eq!(harness.restart.count(), 0);
    assert_eq!(harness.agent.state(), UpdateState::Idle);
    assert_eq!(harness.transports.open_count(), 0);
}

#[tokio::test]
async fn test_short_download_is_aborted() {
    let harness = TestHarness::setup();
    harness.offer("1.1.0");
    harness.transports.route(
        FIRMWARE_URL,
        Route::new(200, firmware_image(1000)).truncated(1000, 900),
    );
    harness.advance_interval();

    let cycle = completed(harness.agent.poll().await);

    assert!(matches!(
        cycle.error(),
        Some(Error::IncompleteDownload {
            expected: 1000,
            written: 900
        })
    ));
    let record = harness.flash.record();
    assert_eq!(record.aborts, 1);
    assert_eq!(record.commits, 0);
    assert!(record.committed.is_none());
    assert_eq!(harness.restart.count(), 0);
    assert_eq!(
        harness.statuses(),
        vec!["Update available", "Download incomplete"]
    );
    assert_eq!(harness.agent.state(), UpdateState::Idle);
}

#[tokio::test]
async fn test_firmware_http_error_reported_once() {
    let harness = TestHarness::setup();
    harness.offer("1.1.0");
    harness
        .transports
        .route(FIRMWARE_URL, Route::new(404, b"missing".to_vec()));
    harness.advance_interval();

    let cycle = completed(harness.agent.poll().await);

    assert!(matches!(
        cycle.error(),
        Some(Error::DownloadFailed(RequestFailure::Status(404)))
    ));
    assert_eq!(
        harness.statuses(),
        vec!["Update available", "Failed to download firmware"]
    );
    assert!(harness.flash.record().begun.is_empty());
    assert_eq!(harness.agent.state(), UpdateState::Idle);
    assert!(!harness.agent.is_updating());

    // No immediate retry.
    assert!(matches!(harness.agent.poll().await, PollOutcome::NotDue));
}

#[tokio::test]
async fn test_oversized_image_rejected_before_writing() {
    let harness = TestHarness::setup();
    harness.offer("1.1.0");
    harness.serve_firmware(firmware_image(128 * 1024));
    harness.advance_interval();

    let cycle = completed(harness.agent.poll().await);

    assert!(matches!(cycle.error(), Some(Error::InsufficientSpace { .. })));
    assert_eq!(harness.statuses().last().unwrap(), "Not enough space for update");
    assert!(harness.flash.record().staged.is_empty());
}

#[tokio::test]
async fn test_missing_firmware_url_installs_nothing() {
    let harness = TestHarness::setup();
    harness
        .transports
        .route(ENDPOINT, Route::new(200, br#"{"version":"9.9.9"}"#.to_vec()));
    harness.serve_firmware(firmware_image(100));
    harness.advance_interval();

    let cycle = completed(harness.agent.poll().await);

    assert!(matches!(
        cycle.error(),
        Some(Error::MalformedMetadata("firmware_url"))
    ));
    assert!(!harness.transports.was_requested(FIRMWARE_URL));
    assert!(harness.flash.record().begun.is_empty());
    assert_eq!(harness.statuses(), vec!["Invalid version info format"]);
}

#[tokio::test]
async fn test_unparseable_metadata_reported() {
    let harness = TestHarness::setup();
    harness
        .transports
        .route(ENDPOINT, Route::new(200, b"<html>oops</html>".to_vec()));
    harness.advance_interval();

    let cycle = completed(harness.agent.poll().await);

    assert!(matches!(cycle.error(), Some(Error::ParseFailed(_))));
    assert_eq!(harness.statuses(), vec!["Failed to parse version info"]);
}

#[tokio::test]
async fn test_malformed_advertised_version_installs_nothing() {
    let harness = TestHarness::setup();
    harness.offer("latest");
    harness.serve_firmware(firmware_image(100));
    harness.advance_interval();

    let cycle = completed(harness.agent.poll().await);

    assert!(matches!(cycle.error(), Some(Error::MalformedVersion(v)) if v == "latest"));
    assert!(!harness.transports.was_requested(FIRMWARE_URL));
}

#[tokio::test]
async fn test_unsupported_endpoint_scheme() {
    let mut config = TestHarness::default_config();
    config.endpoint = "ftp://updates.test/check".to_string();
    let harness = TestHarness::setup_with(config, MockNetwork::new());
    harness.advance_interval();

    let cycle = completed(harness.agent.poll().await);

    assert!(matches!(cycle.error(), Some(Error::InvalidProtocol(_))));
    assert!(harness.transports.requests().is_empty());
    assert_eq!(harness.statuses(), vec!["Invalid URL protocol"]);
}

#[tokio::test]
async fn test_unsupported_firmware_scheme_installs_nothing() {
    let harness = TestHarness::setup();
    let body = serde_json::json!({
        "version": "1.5.0",
        "firmware_url": "ftp://cdn.test/firmware.bin",
    });
    harness
        .transports
        .route(ENDPOINT, Route::new(200, body.to_string().into_bytes()));
    harness.advance_interval();

    let cycle = completed(harness.agent.poll().await);

    assert!(matches!(
        cycle.error(),
        Some(Error::InvalidProtocol(url)) if url == "ftp://cdn.test/firmware.bin"
    ));
    assert_eq!(
        harness.statuses(),
        vec!["Update available", "Invalid URL protocol"]
    );
    assert!(harness.flash.record().begun.is_empty());
    assert_eq!(harness.transports.requests().len(), 1);
    assert_eq!(harness.transports.open_count(), 0);
    assert_eq!(harness.restart.count(), 0);
    assert_eq!(harness.agent.state(), UpdateState::Idle);
}

#[tokio::test]
async fn test_oversized_version_info_rejected() {
    let harness = TestHarness::setup();
    let body = serde_json::json!({
        "version": "1.5.0",
        "firmware_url": FIRMWARE_URL,
        "changelog": "x".repeat(4096),
    });
    harness
        .transports
        .route(ENDPOINT, Route::new(200, body.to_string().into_bytes()));
    harness.serve_firmware(firmware_image(100));
    harness.advance_interval();

    let cycle = completed(harness.agent.poll().await);

    assert!(matches!(cycle.error(), Some(Error::ParseFailed(_))));
    assert_eq!(harness.statuses(), vec!["Failed to parse version info"]);
    assert!(!harness.transports.was_requested(FIRMWARE_URL));
}

#[tokio::test]
async fn test_leading_zero_version_is_newer() {
    let harness = TestHarness::setup();
    harness.offer("1.02.0");
    harness.serve_firmware(firmware_image(300));
    harness.advance_interval();

    let cycle = completed(harness.agent.poll().await);

    assert!(matches!(
        cycle,
        CycleOutcome::Installed { ref version, bytes: 300 } if version == "1.02.0"
    ));
    assert_eq!(harness.restart.count(), 1);
}

#[tokio::test]
async fn test_date_style_current_version_configures() {
    let mut config = TestHarness::default_config();
    config.current_version = "2024.01.15".to_string();
    let harness = TestHarness::setup_with(config, MockNetwork::new());
    harness.offer("2024.02.01");
    harness.serve_firmware(firmware_image(64));
    harness.advance_interval();

    let cycle = completed(harness.agent.poll().await);

    assert!(cycle.is_installed());
}

#[tokio::test]
async fn test_transport_kind_follows_scheme() {
    let harness = TestHarness::setup();
    harness.offer("1.1.0");
    harness.serve_firmware(firmware_image(10));
    harness.advance_interval();

    completed(harness.agent.poll().await);

    let requests = harness.transports.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[0].kind,
        TransportKind::Encrypted { verify_peer: false }
    );
    assert_eq!(requests[1].kind, TransportKind::Plain);
}

#[tokio::test]
async fn test_version_check_posts_device_id() {
    let harness = TestHarness::setup();
    harness.offer("1.0.0");
    harness.advance_interval();

    completed(harness.agent.poll().await);

    let request = &harness.transports.requests()[0];
    assert_eq!(request.method, Method::Post);
    let payload: serde_json::Value =
        serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
    assert_eq!(payload, serde_json::json!({ "id": "device-under-test" }));
}

#[tokio::test]
async fn test_bare_version_check_is_get() {
    let mut config = TestHarness::default_config();
    config.metadata_request = MetadataRequest::Bare;
    let harness = TestHarness::setup_with(config, MockNetwork::new());
    harness.offer("1.0.0");
    harness.advance_interval();

    completed(harness.agent.poll().await);

    let request = &harness.transports.requests()[0];
    assert_eq!(request.method, Method::Get);
    assert!(request.body.is_none());
}

#[tokio::test]
async fn test_start_retries_until_connected() {
    let harness = TestHarness::setup_with(TestHarness::default_config(), MockNetwork::ready_after(3));

    assert_ok!(harness.agent.start().await);

    assert!(harness.agent.is_connected().await);
    assert_eq!(harness.network.connects(), 1);
    // Two backoff sleeps of 500ms on the injected clock.
    assert_eq!(
        bitflash::platform::Clock::now(&harness.clock),
        Duration::from_millis(1000)
    );
}

#[tokio::test]
async fn test_start_gives_up_after_configured_attempts() {
    let mut config = TestHarness::default_config();
    config.connect.attempts = 4;
    let harness = TestHarness::setup_with(config, MockNetwork::unreachable());

    let err = assert_err!(harness.agent.start().await);

    assert!(matches!(err, Error::ConnectionFailed { attempts: 4 }));
    assert_eq!(harness.statuses(), vec!["WiFi connection failed"]);
    assert!(!harness.agent.is_connected().await);
}

#[tokio::test]
async fn test_start_without_auto_connect_leaves_network_alone() {
    let mut config = TestHarness::default_config();
    config.auto_connect = false;
    let harness = TestHarness::setup_with(config, MockNetwork::new());

    assert_ok!(harness.agent.start().await);

    assert_eq!(harness.network.connects(), 0);
    assert!(!harness.agent.is_connected().await);
}

#[tokio::test]
async fn test_cycle_reconnects_dropped_network() {
    let harness = TestHarness::setup();
    harness.offer("1.0.0");
    assert_ok!(harness.agent.start().await);
    harness.agent.disconnect().await;
    assert!(!harness.agent.is_connected().await);
    harness.advance_interval();

    completed(harness.agent.poll().await);

    assert_eq!(harness.network.connects(), 2);
    assert!(harness.agent.is_connected().await);
}

#[tokio::test]
async fn test_start_syncs_clock_once() {
    let harness = TestHarness::setup();
    harness.offer("1.0.0");

    assert_ok!(harness.agent.start().await);
    assert_eq!(harness.time_sync.attempts(), 1);

    harness.advance_interval();
    completed(harness.agent.poll().await);
    assert_eq!(harness.time_sync.attempts(), 1);
}

#[tokio::test]
async fn test_cycle_connection_syncs_clock() {
    let mut config = TestHarness::default_config();
    config.auto_connect = false;
    let harness = TestHarness::setup_with(config, MockNetwork::new());
    harness.offer("1.0.0");

    assert_ok!(harness.agent.start().await);
    assert_eq!(harness.time_sync.attempts(), 0);

    harness.advance_interval();
    completed(harness.agent.poll().await);
    assert_eq!(harness.network.connects(), 1);
    assert_eq!(harness.time_sync.attempts(), 1);

    harness.agent.disconnect().await;
    harness.advance_interval();
    completed(harness.agent.poll().await);
    assert_eq!(harness.network.connects(), 2);
    assert_eq!(harness.time_sync.attempts(), 1);
}

#[tokio::test]
async fn test_failed_clock_sync_retried_next_cycle() {
    let harness = TestHarness::setup_with_sync(
        TestHarness::default_config(),
        MockNetwork::new(),
        MockTimeSync::failing(1),
    );
    harness.offer("1.0.0");

    assert_ok!(harness.agent.start().await);
    assert_eq!(harness.time_sync.attempts(), 1);

    harness.advance_interval();
    let cycle = completed(harness.agent.poll().await);
    assert!(matches!(cycle, CycleOutcome::UpToDate { .. }));
    assert_eq!(harness.time_sync.attempts(), 2);

    harness.advance_interval();
    completed(harness.agent.poll().await);
    assert_eq!(harness.time_sync.attempts(), 2);
}

#[tokio::test]
async fn test_cycle_fails_when_network_unreachable() {
    let harness = TestHarness::setup_with(TestHarness::default_config(), MockNetwork::unreachable());
    harness.offer("1.1.0");
    harness.advance_interval();

    let cycle = completed(harness.agent.poll().await);

    assert!(matches!(cycle.error(), Some(Error::ConnectionFailed { .. })));
    assert!(harness.transports.requests().is_empty());
    assert_eq!(harness.statuses(), vec!["WiFi connection failed"]);
    assert_eq!(harness.agent.state(), UpdateState::Idle);
}

#[tokio::test]
async fn test_set_check_interval_applies_to_next_cycle() {
    let harness = TestHarness::setup();
    harness.offer("1.0.0");

    assert_err!(harness.agent.set_check_interval(Duration::ZERO));
    assert_ok!(harness.agent.set_check_interval(Duration::from_secs(10)));

    harness.clock.advance(Duration::from_secs(9));
    assert!(matches!(harness.agent.poll().await, PollOutcome::NotDue));
    harness.clock.advance(Duration::from_secs(1));
    completed(harness.agent.poll().await);
}

#[tokio::test]
async fn test_configure_replaces_config_between_cycles() {
    let harness = TestHarness::setup();
    harness.offer("1.1.0");
    harness.serve_firmware(firmware_image(10));

    let mut next = TestHarness::default_config();
    next.current_version = "1.1.0".to_string();
    harness.agent.configure(next).unwrap();
    harness.advance_interval();

    let cycle = completed(harness.agent.poll().await);
    assert!(matches!(cycle, CycleOutcome::UpToDate { .. }));
}

#[tokio::test]
async fn test_observer_can_be_replaced_or_removed() {
    let harness = TestHarness::setup();
    harness.offer("1.0.0");

    harness
        .agent
        .set_observer(Some(Arc::new(|_: &bitflash::Notification| {
            panic!("observer failure must not break the cycle")
        })));
    let cycle = completed(harness.agent.check_now().await);
    assert!(matches!(cycle, CycleOutcome::UpToDate { .. }));

    harness.agent.set_observer(None);
    completed(harness.agent.check_now().await);
    assert!(harness.notifications().is_empty());
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let harness = TestHarness::setup();
    harness.offer("1.0.0");
    harness.advance_interval();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let agent = harness.agent.clone();
    let runner = tokio::spawn(async move { agent.run(shutdown_rx).await });

    wait_for_request(&harness, ENDPOINT).await;
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("run should stop")
        .unwrap();
    assert_eq!(harness.statuses(), vec!["No update available"]);
}

#[tokio::test]
async fn test_run_ticks_on_injected_clock() {
    let harness = TestHarness::setup();
    harness.offer("1.0.0");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let agent = harness.agent.clone();
    let runner = tokio::spawn(async move { agent.run(shutdown_rx).await });

    // Nothing advances the clock except the loop's own ticks.
    wait_for_request(&harness, ENDPOINT).await;
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("run should stop")
        .unwrap();

    assert!(
        bitflash::platform::Clock::now(&harness.clock) >= harness.agent.config().check_interval()
    );
    assert_eq!(harness.transports.requests().len(), 1);
}

#[tokio::test]
async fn test_run_exits_after_restart() {
    let harness = TestHarness::setup();
    harness.offer("1.3.0");
    harness.serve_firmware(firmware_image(700));
    harness.advance_interval();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::time::timeout(Duration::from_secs(5), harness.agent.run(shutdown_rx))
        .await
        .expect("run should exit once a restart is pending");

    assert_eq!(harness.restart.count(), 1);
    assert_eq!(harness.agent.state(), UpdateState::Rebooting);
}
