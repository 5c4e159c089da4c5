use bremote_link_core::analyzer::{FailureReason, TestResult};
use bremote_link_core::channel::ChannelTarget;
use bremote_link_core::config::LinkTestConfig;
use bremote_link_core::device_checks::DeviceRole;
use bremote_link_core::loopback::{run_loopback_test, LoopbackProfile};
use bremote_link_core::orchestrator::{run_integration_test, run_link_test};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

// Short timings so each end-to-end run stays around a second. Device checks
// are left to the tests that look at them.
fn create_test_config(duration_secs: u64) -> Arc<LinkTestConfig> {
    Arc::new(LinkTestConfig {
        duration_secs,
        command_timeout_ms: 200,
        command_delay_ms: 5,
        stream_start_gap_ms: 10,
        join_timeout_ms: 300,
        charge_exit_settle_ms: 10,
        device_checks: false,
        ..Default::default()
    })
}

fn seeded(loss_rate: f64, seed: u64) -> LoopbackProfile {
    LoopbackProfile { loss_rate, seed: Some(seed), ..Default::default() }
}

#[tokio::test]
async fn test_clean_link_passes() {
    let report = run_loopback_test(create_test_config(1), seeded(0.0, 1), CancellationToken::new()).await;
    assert!(report.individual_tests.is_empty());
    assert_eq!(report.result(), TestResult::Pass);
    let report = report.radio_link_test;

    assert!(report.tx_connected && report.rx_connected);
    assert_eq!(report.result, TestResult::Pass, "report: {:?}", report);

    let verdict = report.verdict.expect("verdict for a completed run");
    assert!(verdict.tx_samples >= 12, "tx samples: {}", verdict.tx_samples);
    assert!(verdict.matched_pairs >= 10, "matched: {}", verdict.matched_pairs);
    assert!(verdict.packet_loss_percent < 20.0);
    assert_eq!(verdict.max_throttle_diff, 0);
    assert_eq!(verdict.max_steering_diff, 0);
    assert_eq!(verdict.min_rssi_dbm, Some(-65));
    assert_eq!(verdict.details, "Radio link working correctly");
}

#[tokio::test]
async fn test_dead_link_fails_with_full_loss() {
    let report = run_loopback_test(create_test_config(1), seeded(1.0, 2), CancellationToken::new())
        .await
        .radio_link_test;

    assert_eq!(report.result, TestResult::Fail);
    let verdict = report.verdict.expect("verdict for a completed run");
    assert!(verdict.tx_samples > 0);
    assert_eq!(verdict.rx_samples, 0);
    assert_eq!(verdict.matched_pairs, 0);
    assert_eq!(verdict.packet_loss_percent, 100.0);
    assert!(verdict
        .reasons
        .iter()
        .any(|r| matches!(r, FailureReason::HighPacketLoss { .. })));
    assert!(verdict
        .reasons
        .contains(&FailureReason::InsufficientSamples { matched_pairs: 0 }));
    assert!(verdict.avg_rssi_dbm.is_none());
}

#[tokio::test]
async fn test_lossy_link_fails() {
    let report = run_loopback_test(create_test_config(1), seeded(0.7, 3), CancellationToken::new())
        .await
        .radio_link_test;

    assert_eq!(report.result, TestResult::Fail);
    let verdict = report.verdict.expect("verdict for a completed run");
    assert!(verdict.packet_loss_percent > 20.0, "loss: {}", verdict.packet_loss_percent);
    assert!(verdict.details.contains("High packet loss"));
}

#[tokio::test]
async fn test_missing_devices_skip() {
    let tx = ChannelTarget::Device(PathBuf::from("/nonexistent/ttyTX"));
    let rx = ChannelTarget::Device(PathBuf::from("/nonexistent/ttyRX"));

    let report = run_link_test(create_test_config(1), &tx, &rx, CancellationToken::new()).await;
    assert_eq!(report.result, TestResult::Skip);
    assert!(!report.tx_connected);
    assert!(!report.rx_connected);
    assert!(report.verdict.is_none());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["result"], "SKIP");
    assert!(json["verdict"].is_null());
}

#[tokio::test]
async fn test_cancellation_cuts_the_run_short() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let report = run_loopback_test(create_test_config(30), seeded(0.0, 4), cancel).await.radio_link_test;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(report.duration_secs < 5.0);
    assert!(report.verdict.is_some());
}

#[tokio::test]
async fn test_device_checks_run_before_the_link() {
    let config = Arc::new(LinkTestConfig { device_checks: true, ..(*create_test_config(1)).clone() });
    let report = run_loopback_test(config, seeded(0.0, 5), CancellationToken::new()).await;

    assert_eq!(report.individual_tests.len(), 2);
    let tx = &report.individual_tests["loopback-tx"];
    assert_eq!(tx.device_type, DeviceRole::Tx);
    assert_eq!(tx.overall_result, TestResult::Pass);
    assert_eq!(tx.tests["radio"].details, "Radio: ON, last_pkt_ms: 12");
    assert!(tx.tests["hall"].details.starts_with("Throttle: "), "{:?}", tx.tests["hall"]);
    assert_eq!(tx.tests["rssi"].details, "RSSI: -65 dBm, SNR: 9.5 dB");
    assert!(tx.tests["spiffs"].details.ends_with("version=2.1.0"), "{:?}", tx.tests["spiffs"]);

    let rx = &report.individual_tests["loopback-rx"];
    assert_eq!(rx.device_type, DeviceRole::Rx);
    assert_eq!(rx.overall_result, TestResult::Pass);
    assert_eq!(rx.tests["vesc"].details, "VESC status: VESC UART connected");
    assert_eq!(rx.tests["pwm"].details, "PWM status: PWM out: 1500us");

    // The checks leave both devices quiet, so the link test still passes.
    assert_eq!(report.radio_link_test.result, TestResult::Pass, "{:?}", report.radio_link_test);
    assert_eq!(report.result(), TestResult::Pass);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["individual_tests"]["loopback-rx"]["tests"]["radio"]["test"], "Radio RX");
    assert_eq!(json["individual_tests"]["loopback-tx"]["device_type"], "tx");
}

#[tokio::test]
async fn test_integration_with_missing_devices_skips() {
    let config = Arc::new(LinkTestConfig { device_checks: true, ..(*create_test_config(1)).clone() });
    let tx = ChannelTarget::Device(PathBuf::from("/nonexistent/ttyTX"));
    let rx = ChannelTarget::Device(PathBuf::from("/nonexistent/ttyRX"));

    let report = run_integration_test(config, &tx, &rx, CancellationToken::new()).await;
    assert!(report.individual_tests.is_empty());
    assert_eq!(report.result(), TestResult::Skip);
}
