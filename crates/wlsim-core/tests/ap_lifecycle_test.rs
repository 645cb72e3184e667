#![allow(clippy::unwrap_used)]
// AP state machine against a scripted controller, on virtual time.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::time::Instant;

use wlsim_core::ap::{DiscoverOutcome, ServiceApDiscoverWlc};
use wlsim_core::service::{ServiceResult, names, run_service};
use wlsim_core::wire::capwap::MessageType;
use wlsim_core::{ApState, WirelessConfig, WirelessDevice};

use common::*;

fn offsets(start: Instant, sent: &[(Instant, bytes::Bytes)]) -> Vec<Duration> {
    sent.iter().map(|(at, _)| *at - start).collect()
}

// ── Discovery ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_unanswered_discovery_backs_off_and_releases_slot() {
    let harness = Harness::new(WirelessConfig::default(), HandshakeMode::Finish);
    let ap = harness.add_ap(1);
    let admission = harness.env.admissions().get(names::AP_DISCOVER);
    let start = Instant::now();

    let task = tokio::spawn(run_service(Arc::clone(&ap), harness.env.clone(), ServiceApDiscoverWlc));

    tokio::time::sleep(Duration::from_millis(6900)).await;
    assert_eq!(admission.active(), 1, "slot is held for the whole attempt");

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, ServiceResult::Completed(DiscoverOutcome::RetriesExhausted));
    assert_eq!(admission.active(), 0);
    assert_eq!(ap.state(), ApState::Discover);

    let discoveries = harness.sent.matching(is_discovery);
    assert_eq!(
        offsets(start, &discoveries),
        vec![Duration::ZERO, Duration::from_secs(1), Duration::from_secs(3)]
    );
    let info = ap.core().services_info();
    assert_eq!(info.get(names::AP_DISCOVER, "success"), Some(serde_json::json!(false)));
    assert_eq!(info.get(names::AP_DISCOVER, "done"), Some(serde_json::json!(true)));
}

#[tokio::test(start_paused = true)]
async fn test_discovery_rejection_is_not_retried() {
    let mut harness = Harness::new(config_with_wlc(), HandshakeMode::Finish);
    harness.spawn_wlc(WlcScript {
        discovery_code: Some(1),
        ..WlcScript::default()
    });
    let ap = harness.add_ap(1);

    let outcome = run_service(Arc::clone(&ap), harness.env.clone(), ServiceApDiscoverWlc)
        .await
        .unwrap();

    assert_eq!(outcome, ServiceResult::Completed(DiscoverOutcome::Rejected(1)));
    assert_eq!(harness.sent.count(is_discovery), 1);
    assert_eq!(ap.state(), ApState::Discover);
}

// ── Join sequence ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_full_join_reaches_run_in_order() {
    let mut harness = Harness::new(config_with_wlc(), HandshakeMode::Finish);
    harness.spawn_wlc(WlcScript::default());
    let ap = harness.add_ap(1);
    let mut changes = ap.state_changes();

    let _tasks = harness.worker.join_aps();

    let mut seen = Vec::new();
    while seen.last() != Some(&ApState::Run) {
        let next = tokio::time::timeout(Duration::from_secs(30), changes.recv()).await;
        seen.push(next.unwrap().unwrap());
    }
    assert_eq!(
        seen,
        vec![ApState::Discover, ApState::Dtls, ApState::Join, ApState::Run]
    );

    let snapshot = ap.snapshot();
    assert_eq!(snapshot.wlc_mac, Some(WLC_MAC));
    assert_eq!(snapshot.vaps.len(), 1);
    assert!(snapshot.join_duration.is_some());
    assert_eq!(ap.ac_name(), "fake-wlc");

    let info = ap.core().services_info();
    assert!(info.get(names::AP_DISCOVER, "duration").is_some());
    assert!(info.get(names::AP_JOIN, "duration").is_some());
    assert_eq!(info.get(names::AP_DISCOVER, "success"), Some(serde_json::json!(true)));
    assert_eq!(info.get(names::AP_DTLS, "success"), Some(serde_json::json!(true)));
    assert_eq!(info.get(names::AP_JOIN, "success"), Some(serde_json::json!(true)));

    // The controller's configuration push was acknowledged.
    assert_eq!(harness.sent.count(is_request(MessageType::ConfigUpdateResponse)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_join_error_code_rolls_back_without_retry() {
    let mut harness = Harness::new(config_with_wlc(), HandshakeMode::Finish);
    harness.spawn_wlc(WlcScript {
        join_code: Some(5),
        ..WlcScript::default()
    });
    let ap = harness.add_ap(1);

    let outcome = run_service(Arc::clone(&ap), harness.env.clone(), ServiceApDiscoverWlc)
        .await
        .unwrap();

    assert_eq!(outcome, ServiceResult::Completed(DiscoverOutcome::Rollback));
    assert_eq!(harness.sent.count(is_request(MessageType::JoinRequest)), 1);
    assert_eq!(harness.sent.count(is_request(MessageType::ConfigStatusRequest)), 0);
    assert_eq!(ap.state(), ApState::Discover);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_join_is_retransmitted_with_backoff() {
    let mut harness = Harness::new(config_with_wlc(), HandshakeMode::Finish);
    harness.spawn_wlc(WlcScript {
        join_code: None,
        ..WlcScript::default()
    });
    let ap = harness.add_ap(1);

    let outcome = run_service(Arc::clone(&ap), harness.env.clone(), ServiceApDiscoverWlc)
        .await
        .unwrap();

    assert_eq!(outcome, ServiceResult::Completed(DiscoverOutcome::Rollback));
    let joins = harness.sent.matching(is_request(MessageType::JoinRequest));
    assert_eq!(joins.len(), 3);
    let first = joins[0].0;
    assert_eq!(
        offsets(first, &joins),
        vec![Duration::ZERO, Duration::from_secs(1), Duration::from_secs(3)]
    );
    assert_eq!(ap.state(), ApState::Discover);
    assert_eq!(
        harness.env.admissions().get(names::AP_DISCOVER).active(),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_missing_ssid_rolls_back_join() {
    let mut harness = Harness::new(config_with_wlc(), HandshakeMode::Finish);
    harness.spawn_wlc(WlcScript {
        push_ssid: false,
        ..WlcScript::default()
    });
    let ap = harness.add_ap(1);

    let outcome = run_service(Arc::clone(&ap), harness.env.clone(), ServiceApDiscoverWlc)
        .await
        .unwrap();

    assert_eq!(outcome, ServiceResult::Completed(DiscoverOutcome::Rollback));
    assert!(!ap.has_vaps());
    assert_eq!(ap.state(), ApState::Discover);
}

// ── DTLS ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_handshake_timeouts_roll_back_every_time() {
    let mut harness = Harness::new(config_with_wlc(), HandshakeMode::Never);
    harness.spawn_wlc(WlcScript::default());
    let ap = harness.add_ap(1);
    let admission = harness.env.admissions().get(names::AP_DISCOVER);

    for attempt in 1..=3u32 {
        let start = Instant::now();
        let outcome = run_service(Arc::clone(&ap), harness.env.clone(), ServiceApDiscoverWlc)
            .await
            .unwrap();
        assert_eq!(outcome, ServiceResult::Completed(DiscoverOutcome::Rollback));
        assert!(start.elapsed() >= Duration::from_secs(10), "waited the handshake budget");
        assert_eq!(ap.state(), ApState::Discover);
        assert_eq!(admission.active(), 0);
        assert_eq!(ap.snapshot().dtls_timeouts, attempt);
        assert!(ap.core().active_services().is_empty(), "no receive queue left open");
    }
    assert_eq!(harness.sent.count(is_request(MessageType::JoinRequest)), 0);
    assert!(harness.connector.sessions.load(std::sync::atomic::Ordering::Relaxed) >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_mid_handshake_releases_join_slot() {
    let mut harness = Harness::new(config_with_wlc(), HandshakeMode::Never);
    harness.spawn_wlc(WlcScript::default());
    let ap = harness.add_ap(1);
    let admission = harness.env.admissions().get(names::AP_DISCOVER);

    let task = tokio::spawn(run_service(Arc::clone(&ap), harness.env.clone(), ServiceApDiscoverWlc));
    assert!(eventually(Duration::from_secs(5), || ap.state() == ApState::Dtls).await);
    assert_eq!(admission.active(), 1, "slot is held during the handshake");

    ap.core().interrupt();
    let outcome = task.await.unwrap().unwrap();

    assert_eq!(outcome, ServiceResult::Interrupted);
    assert_eq!(admission.active(), 0);
    assert!(ap.core().active_services().is_empty(), "no receive queue left open");
}

#[tokio::test(start_paused = true)]
async fn test_handshake_alert_rolls_back_immediately() {
    let mut harness = Harness::new(config_with_wlc(), HandshakeMode::Alert);
    harness.spawn_wlc(WlcScript::default());
    let ap = harness.add_ap(1);
    let start = Instant::now();

    let outcome = run_service(Arc::clone(&ap), harness.env.clone(), ServiceApDiscoverWlc)
        .await
        .unwrap();

    assert_eq!(outcome, ServiceResult::Completed(DiscoverOutcome::Rollback));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(ap.snapshot().dtls_timeouts, 0);
}

// ── Admission ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_join_admission_ceiling_is_respected() {
    let mut config = config_with_wlc();
    config.concurrency.ap_join = Some(2);
    let mut harness = Harness::new(config, HandshakeMode::Finish);
    harness.spawn_wlc(WlcScript::default());
    let aps: Vec<_> = (1..=5).map(|n| harness.add_ap(n)).collect();

    let _tasks = harness.worker.join_aps();
    let all_joined = eventually(Duration::from_secs(120), || {
        aps.iter().all(|ap| ap.state() == ApState::Run)
    })
    .await;

    assert!(all_joined);
    let admission = harness.env.admissions().get(names::AP_DISCOVER);
    assert!(admission.peak() <= 2, "peak {} exceeds ceiling", admission.peak());
    assert_eq!(admission.active(), 0);
    assert!(admission.total_acquired() >= 5);
}

// ── Run and shutdown ────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_unanswered_echo_sends_ap_back_to_discover() {
    let mut harness = Harness::new(config_with_wlc(), HandshakeMode::Finish);
    harness.spawn_wlc(WlcScript {
        answer_echo: false,
        ..WlcScript::default()
    });
    let ap = harness.add_ap(1);
    let mut changes = ap.state_changes();
    let _tasks = harness.worker.join_aps();

    // Up to RUN, then one full echo interval plus the retransmissions.
    let mut seen = Vec::new();
    while seen.len() < 5 {
        let next = tokio::time::timeout(Duration::from_secs(120), changes.recv()).await;
        seen.push(next.unwrap().unwrap());
    }
    assert_eq!(seen[3], ApState::Run);
    assert_eq!(seen[4], ApState::Discover);
    assert_eq!(harness.sent.count(is_request(MessageType::EchoRequest)), 3);
}

#[tokio::test(start_paused = true)]
async fn test_stop_ap_closes_the_session() {
    let mut harness = Harness::new(config_with_wlc(), HandshakeMode::Finish);
    harness.spawn_wlc(WlcScript::default());
    let ap = harness.add_ap(1);
    let tasks = harness.worker.join_aps();
    assert!(eventually(Duration::from_secs(30), || ap.state() == ApState::Run).await);

    let result = harness.worker.stop_ap(ap.mac()).await.unwrap();

    assert_eq!(result, ServiceResult::Completed(ApState::Closed));
    assert_eq!(ap.state(), ApState::Closed);
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    // Close-notify went out through the control channel.
    let alerts = harness.sent.count(|frame| {
        wlsim_core::wire::ether::parse_udp(frame)
            .is_some_and(|udp| udp.payload.get(4) == Some(&0x15))
    });
    assert!(alerts >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_join_closes_immediately() {
    let harness = Harness::new(WirelessConfig::default(), HandshakeMode::Finish);
    let ap = harness.add_ap(1);

    let result = harness.worker.stop_ap(ap.mac()).await.unwrap();

    assert_eq!(result, ServiceResult::Completed(ApState::Closed));
    assert!(harness.worker.join_aps().is_empty(), "closed APs are not driven");
}
