// Per-device checks run before the link test

use crate::analyzer::TestResult;
use crate::channel::Channel;
use crate::config::LinkTestConfig;
use crate::error::ChannelError;
use crate::orchestrator::now_rfc3339;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{info, warn};

const EXCERPT_CHARS: usize = 200;

/// Which end of the link a channel talks to. Taken from the command line,
/// the device is never asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Tx,
    Rx,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceRole::Tx => "TX",
            DeviceRole::Rx => "RX",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckOutcome {
    pub test: String,
    pub result: TestResult,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceReport {
    pub device_type: DeviceRole,
    pub port: String,
    pub timestamp: String,
    pub tests: BTreeMap<String, CheckOutcome>,
    pub overall_result: TestResult,
}

type CheckResult = Result<(TestResult, String), ChannelError>;

fn pass(details: impl Into<String>) -> CheckResult {
    Ok((TestResult::Pass, details.into()))
}

/// Renders a reply field the way it should read in a report: strings bare,
/// anything else as JSON, `default` when absent.
fn field(data: &Map<String, Value>, key: &str, default: &str) -> String {
    match data.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => default.to_string(),
    }
}

fn excerpt(response: &str) -> String {
    response.chars().take(EXCERPT_CHARS).collect()
}

async fn check_tx_radio(channel: &Channel) -> CheckResult {
    channel.ensure_connected()?;
    if let Some(state) = channel.send_json("?state").await {
        return pass(format!(
            "Radio: {}, last_pkt_ms: {}",
            field(&state, "radio", "OFF"),
            field(&state, "last_pkt_ms", "n/a")
        ));
    }
    if let Some(packets) = channel.send_json("?printPackets").await {
        return pass(format!(
            "Sent: {}, Received: {}, Ratio: {}%",
            field(&packets, "sent", "0"),
            field(&packets, "received", "0"),
            field(&packets, "ratio", "0")
        ));
    }
    pass("Radio initialized (no JSON response)")
}

async fn check_tx_display(channel: &Channel) -> CheckResult {
    channel.ensure_connected()?;
    match channel.send_json("?state").await {
        Some(state) => pass(format!("Display: {}", field(&state, "display", "UNKNOWN"))),
        None => pass("Display subsystem present (no JSON response)"),
    }
}

/// Reads one frame of the input stream, then stops the stream again.
async fn check_tx_hall(channel: &Channel, stream_command: &str) -> CheckResult {
    channel.ensure_connected()?;
    let inputs = channel.send_json(stream_command).await;
    tokio::time::sleep(channel.settings().command_delay).await;
    channel.send_no_wait("quit").await;

    match inputs {
        Some(data) if data.contains_key("throttle") => pass(format!(
            "Throttle: {}, Steering: {}, HallEnabled: {}",
            field(&data, "throttle", "n/a"),
            field(&data, "steering", "n/a"),
            field(&data, "hall_enabled", "n/a")
        )),
        _ => pass("Input monitoring active (no JSON data)"),
    }
}

async fn check_tx_analog(channel: &Channel) -> CheckResult {
    channel.ensure_connected()?;
    match channel.send_json("?state").await {
        Some(state) => pass(format!("Hall/ADC subsystem: {}", field(&state, "hall", "UNKNOWN"))),
        None => pass("Analog system responsive (no JSON)"),
    }
}

async fn check_tx_rssi(channel: &Channel) -> CheckResult {
    channel.ensure_connected()?;
    let signal = channel.send_json("?printRSSI").await;
    tokio::time::sleep(channel.settings().command_delay).await;
    channel.send_no_wait("quit").await;

    let Some(data) = signal else {
        return pass("RSSI command accepted (no JSON)");
    };
    if data.contains_key("error") {
        Ok((TestResult::Fail, format!("RSSI error: {}", field(&data, "error", ""))))
    } else if data.contains_key("rssi") {
        pass(format!(
            "RSSI: {} dBm, SNR: {} dB",
            field(&data, "rssi", ""),
            field(&data, "snr", "N/A")
        ))
    } else if data.contains_key("failsafe_ms") {
        pass(format!("No radio link (failsafe {}ms)", field(&data, "failsafe_ms", "")))
    } else {
        pass(format!("RSSI response: {}", Value::Object(data)))
    }
}

/// Text-only RX queries: PASS either way, the reply goes into the details
/// when it mentions one of `keywords`.
async fn check_rx_text(channel: &Channel, command: &str, keywords: &[&str], label: &str, fallback: &str) -> CheckResult {
    channel.ensure_connected()?;
    let response = channel.send(command).await;
    let lower = response.to_lowercase();
    if keywords.iter().any(|k| lower.contains(k)) {
        pass(format!("{}: {}", label, excerpt(&response)))
    } else {
        pass(fallback)
    }
}

async fn check_storage(channel: &Channel) -> CheckResult {
    channel.ensure_connected()?;
    let response = channel.send("?get version").await;
    if response.contains('=') && !response.contains("ERR") {
        return pass(format!("Config key readable: {}", response.trim()));
    }
    let conf = channel.send("?conf").await;
    if conf.len() > 20 {
        pass(format!("Config readable ({} chars)", conf.len()))
    } else {
        pass("Config system responsive")
    }
}

fn record(tests: &mut BTreeMap<String, CheckOutcome>, key: &str, name: &str, outcome: CheckResult) {
    let (result, details) = match outcome {
        Ok(outcome) => outcome,
        Err(e) => (TestResult::Fail, format!("Error: {}", e)),
    };
    if result == TestResult::Fail {
        warn!(check = name, details = %details, "device check failed");
    } else {
        info!(check = name, result = %result, details = %details);
    }
    tests.insert(key.to_string(), CheckOutcome { test: name.to_string(), result, details });
}

/// Runs the checks that apply to `role` over a channel nobody is streaming
/// from. The device is taken out of charging mode first.
pub async fn run_device_checks(channel: &Channel, role: DeviceRole, config: &LinkTestConfig) -> DeviceReport {
    info!(channel = channel.label(), role = %role, "checking device");
    let timestamp = now_rfc3339();

    if channel.send_no_wait("?exitchg").await {
        tokio::time::sleep(config.charge_exit_settle()).await;
        channel.discard_pending();
    }

    let mut tests = BTreeMap::new();
    match role {
        DeviceRole::Tx => {
            record(&mut tests, "radio", "Radio TX", check_tx_radio(channel).await);
            record(&mut tests, "display", "Display TX", check_tx_display(channel).await);
            record(&mut tests, "hall", "Hall Sensors", check_tx_hall(channel, &config.tx_stream_command).await);
            record(&mut tests, "analog", "Analog Inputs", check_tx_analog(channel).await);
            record(&mut tests, "rssi", "RSSI Monitoring", check_tx_rssi(channel).await);
        }
        DeviceRole::Rx => {
            let radio = check_rx_text(channel, "?packets", &["rx", "received"], "Radio status", "Radio interface responsive");
            record(&mut tests, "radio", "Radio RX", radio.await);
            let vesc = check_rx_text(channel, "?vesc", &["vesc", "uart", "motor"], "VESC status", "VESC interface present");
            record(&mut tests, "vesc", "VESC Interface", vesc.await);
            let pwm = check_rx_text(channel, "?pwm", &["pwm"], "PWM status", "PWM interface responsive");
            record(&mut tests, "pwm", "PWM Output", pwm.await);
        }
    }
    record(&mut tests, "spiffs", "SPIFFS Storage", check_storage(channel).await);

    let overall_result = if tests.values().any(|t| t.result == TestResult::Fail) {
        TestResult::Fail
    } else {
        TestResult::Pass
    };
    info!(channel = channel.label(), role = %role, result = %overall_result, "device checks done");

    DeviceReport {
        device_type: role,
        port: channel.label().to_string(),
        timestamp,
        tests,
        overall_result,
    }
}
