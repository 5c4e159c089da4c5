// Runs a full link test and builds the report

use crate::analyzer::{LinkVerdict, TestResult};
use crate::channel::{Channel, ChannelTarget};
use crate::config::{ChannelSettings, LinkTestConfig};
use crate::correlation::CorrelationEngine;
use crate::device_checks::{run_device_checks, DeviceReport, DeviceRole};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const TEST_NAME: &str = "Radio Link Integration";

#[derive(Debug, Clone, Serialize)]
pub struct LinkReport {
    pub test: String,
    pub started_at: String, // RFC 3339, UTC
    pub duration_secs: f64,
    pub tx_port: String,
    pub rx_port: String,
    pub tx_connected: bool,
    pub rx_connected: bool,
    pub result: TestResult,
    pub verdict: Option<LinkVerdict>, // None when the test was skipped
}

/// Device checks keyed by port, followed by the link test.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationReport {
    pub individual_tests: BTreeMap<String, DeviceReport>,
    pub radio_link_test: LinkReport,
}

impl IntegrationReport {
    /// A failed device check fails the whole run; otherwise the link test
    /// decides.
    pub fn result(&self) -> TestResult {
        if self.individual_tests.values().any(|d| d.overall_result == TestResult::Fail) {
            TestResult::Fail
        } else {
            self.radio_link_test.result
        }
    }
}

pub(crate) fn now_rfc3339() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}

async fn open_side(label: &str, target: &ChannelTarget, settings: ChannelSettings) -> Option<Channel> {
    match Channel::open(target.to_string(), target, settings).await {
        Ok(channel) => Some(channel),
        Err(e) => {
            warn!(side = label, endpoint = %target, error = %e, "failed to open device");
            None
        }
    }
}

fn skipped_report(tx_target: &ChannelTarget, rx_target: &ChannelTarget, tx_connected: bool, rx_connected: bool) -> LinkReport {
    warn!("both TX and RX are required for the radio link test");
    LinkReport {
        test: TEST_NAME.to_string(),
        started_at: now_rfc3339(),
        duration_secs: 0.0,
        tx_port: tx_target.to_string(),
        rx_port: rx_target.to_string(),
        tx_connected,
        rx_connected,
        result: TestResult::Skip,
        verdict: None,
    }
}

async fn close_all(channels: &[&Option<Arc<Channel>>]) {
    for channel in channels.iter().copied().flatten() {
        channel.close().await;
    }
}

/// Opens both devices and runs the link test over them.
///
/// A device that cannot be opened does not abort anything: the report comes
/// back as `SKIP` with the corresponding `*_connected` flag cleared.
pub async fn run_link_test(
    config: Arc<LinkTestConfig>,
    tx_target: &ChannelTarget,
    rx_target: &ChannelTarget,
    cancel: CancellationToken,
) -> LinkReport {
    let settings = config.channel_settings();
    let tx = open_side("tx", tx_target, settings).await.map(Arc::new);
    let rx = open_side("rx", rx_target, settings).await.map(Arc::new);

    let report = match (&tx, &rx) {
        (Some(tx), Some(rx)) => run_link_test_on(config, Arc::clone(tx), Arc::clone(rx), cancel).await,
        _ => skipped_report(tx_target, rx_target, tx.is_some(), rx.is_some()),
    };
    close_all(&[&tx, &rx]).await;
    report
}

/// Checks every device that could be opened, then runs the link test when
/// both are there.
pub async fn run_integration_test(
    config: Arc<LinkTestConfig>,
    tx_target: &ChannelTarget,
    rx_target: &ChannelTarget,
    cancel: CancellationToken,
) -> IntegrationReport {
    let settings = config.channel_settings();
    let tx = open_side("tx", tx_target, settings).await.map(Arc::new);
    let rx = open_side("rx", rx_target, settings).await.map(Arc::new);

    let individual_tests = check_devices(&config, &[(DeviceRole::Tx, &tx), (DeviceRole::Rx, &rx)], &cancel).await;
    let radio_link_test = match (&tx, &rx) {
        (Some(tx), Some(rx)) => run_link_test_on(Arc::clone(&config), Arc::clone(tx), Arc::clone(rx), cancel).await,
        _ => skipped_report(tx_target, rx_target, tx.is_some(), rx.is_some()),
    };
    close_all(&[&tx, &rx]).await;

    IntegrationReport { individual_tests, radio_link_test }
}

/// [`run_integration_test`] over channels the caller has already opened.
pub async fn run_integration_test_on(
    config: Arc<LinkTestConfig>,
    tx: Arc<Channel>,
    rx: Arc<Channel>,
    cancel: CancellationToken,
) -> IntegrationReport {
    let (tx_side, rx_side) = (Some(Arc::clone(&tx)), Some(Arc::clone(&rx)));
    let sides = [(DeviceRole::Tx, &tx_side), (DeviceRole::Rx, &rx_side)];
    let individual_tests = check_devices(&config, &sides, &cancel).await;
    let radio_link_test = run_link_test_on(config, tx, rx, cancel).await;
    IntegrationReport { individual_tests, radio_link_test }
}

async fn check_devices(
    config: &LinkTestConfig,
    sides: &[(DeviceRole, &Option<Arc<Channel>>)],
    cancel: &CancellationToken,
) -> BTreeMap<String, DeviceReport> {
    let mut reports = BTreeMap::new();
    if !config.device_checks {
        return reports;
    }
    for (role, channel) in sides {
        let Some(channel) = channel else { continue };
        if cancel.is_cancelled() {
            break;
        }
        let report = run_device_checks(channel, *role, config).await;
        reports.insert(report.port.clone(), report);
    }
    reports
}

/// Runs the link test over channels the caller has already opened.
pub async fn run_link_test_on(
    config: Arc<LinkTestConfig>,
    tx: Arc<Channel>,
    rx: Arc<Channel>,
    cancel: CancellationToken,
) -> LinkReport {
    let started_at = now_rfc3339();
    let started = Instant::now();
    let tx_connected = tx.is_connected();
    let rx_connected = rx.is_connected();
    info!(
        tx = tx.label(),
        rx = rx.label(),
        duration = %humantime::format_duration(config.total_duration()),
        "testing radio link (TX <-> RX)"
    );

    let mut engine = CorrelationEngine::new(Arc::clone(&tx), Arc::clone(&rx), Arc::clone(&config));
    let verdict = engine.run_until(config.total_duration(), cancel).await;
    log_summary(&verdict);

    LinkReport {
        test: TEST_NAME.to_string(),
        started_at,
        duration_secs: started.elapsed().as_secs_f64(),
        tx_port: tx.label().to_string(),
        rx_port: rx.label().to_string(),
        tx_connected,
        rx_connected,
        result: verdict.result,
        verdict: Some(verdict),
    }
}

fn log_summary(verdict: &LinkVerdict) {
    info!(
        "samples: TX={}, RX={}, matched={}",
        verdict.tx_samples, verdict.rx_samples, verdict.matched_pairs
    );
    info!("packet loss: {:.1}%", verdict.packet_loss_percent);
    info!(
        "avg throttle diff: {:.2}, avg steering diff: {:.2}",
        verdict.avg_throttle_diff, verdict.avg_steering_diff
    );
    if let (Some(avg), Some(min)) = (verdict.avg_rssi_dbm, verdict.min_rssi_dbm) {
        info!("RSSI: {:.0} dBm (min: {})", avg, min);
    }
    if let Some(snr) = verdict.avg_snr_db {
        info!("SNR: {:.1} dB", snr);
    }
    if verdict.passed() {
        info!("result: {} ({})", verdict.result, verdict.details);
    } else {
        warn!("result: {} ({})", verdict.result, verdict.details);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_unreachable_device_skips() {
        let config = Arc::new(LinkTestConfig { duration_secs: 1, ..Default::default() });
        let missing = ChannelTarget::Device(PathBuf::from("/nonexistent/bremote-tx"));
        let also_missing = ChannelTarget::Device(PathBuf::from("/nonexistent/bremote-rx"));

        let report = run_link_test(config, &missing, &also_missing, CancellationToken::new()).await;
        assert_eq!(report.result, TestResult::Skip);
        assert!(!report.tx_connected);
        assert!(!report.rx_connected);
        assert!(report.verdict.is_none());
        assert_eq!(report.tx_port, "/nonexistent/bremote-tx");
    }

    #[tokio::test]
    async fn test_report_over_open_channels() {
        let settings = ChannelSettings::default();
        let (tx_harness, _tx_device) = tokio::io::duplex(1024);
        let (rx_harness, _rx_device) = tokio::io::duplex(1024);
        let tx = Arc::new(Channel::from_stream("COM3", tx_harness, settings));
        let rx = Arc::new(Channel::from_stream("COM4", rx_harness, settings));
        let config = Arc::new(LinkTestConfig {
            duration_secs: 0,
            stream_start_gap_ms: 0,
            join_timeout_ms: 100,
            ..Default::default()
        });

        let report = run_link_test_on(config, tx, rx, CancellationToken::new()).await;
        assert_eq!(report.test, "Radio Link Integration");
        assert_eq!(report.tx_port, "COM3");
        assert_eq!(report.rx_port, "COM4");
        assert!(report.tx_connected && report.rx_connected);
        assert_eq!(report.result, TestResult::Fail);
        assert!(report.started_at.ends_with('Z'));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["result"], "FAIL");
        assert_eq!(json["verdict"]["packet_loss_percent"], 100.0);
    }

    #[tokio::test]
    async fn test_integration_skips_link_but_checks_the_open_side() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts the TX connection and never says a word.
        let device = tokio::spawn(async move { listener.accept().await.map(|(stream, _)| stream) });

        let config = Arc::new(LinkTestConfig {
            command_timeout_ms: 30,
            command_delay_ms: 1,
            charge_exit_settle_ms: 1,
            ..Default::default()
        });
        let tx = ChannelTarget::Tcp(addr.to_string());
        let rx = ChannelTarget::Device(PathBuf::from("/nonexistent/bremote-rx"));

        let report = run_integration_test(config, &tx, &rx, CancellationToken::new()).await;
        assert_eq!(report.radio_link_test.result, TestResult::Skip);
        assert!(report.radio_link_test.tx_connected);
        assert!(!report.radio_link_test.rx_connected);

        let port = format!("tcp://{}", addr);
        assert_eq!(report.individual_tests.len(), 1);
        assert_eq!(report.individual_tests[&port].device_type, DeviceRole::Tx);
        assert_eq!(report.individual_tests[&port].overall_result, TestResult::Pass);
        assert_eq!(report.result(), TestResult::Skip);
        drop(device);
    }

    #[tokio::test]
    async fn test_device_checks_can_be_turned_off() {
        let config = Arc::new(LinkTestConfig { device_checks: false, ..Default::default() });
        let missing = ChannelTarget::Device(PathBuf::from("/nonexistent/bremote-tx"));
        let report = run_integration_test(config, &missing, &missing, CancellationToken::new()).await;
        assert!(report.individual_tests.is_empty());
        assert_eq!(report.result(), TestResult::Skip);

        let json = serde_json::to_value(&report).unwrap();
        assert!(json["individual_tests"].as_object().unwrap().is_empty());
        assert_eq!(json["radio_link_test"]["result"], "SKIP");
    }
}
