// Link quality statistics and the PASS/FAIL verdict

use crate::config::VerdictThresholds;
use crate::ledger::Sample;
use serde::{Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestResult {
    Pass,
    Fail,
    Skip, // A device could not take part, nothing was measured
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TestResult::Pass => "PASS",
            TestResult::Fail => "FAIL",
            TestResult::Skip => "SKIP",
        };
        f.write_str(text)
    }
}

/// Why a link test failed. Serialized as its message.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    NoData,
    HighPacketLoss { percent: f64 },
    ValueMismatch { max_throttle_diff: u32, max_steering_diff: u32 },
    WeakSignal { avg_rssi_dbm: f64 },
    InsufficientSamples { matched_pairs: usize },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoData => write!(f, "No data collected"),
            FailureReason::HighPacketLoss { percent } => write!(f, "High packet loss: {:.1}%", percent),
            FailureReason::ValueMismatch { max_throttle_diff, max_steering_diff } => write!(
                f,
                "Value mismatch: thr_diff={}, steer_diff={}",
                max_throttle_diff, max_steering_diff
            ),
            FailureReason::WeakSignal { avg_rssi_dbm } => write!(f, "Weak signal: RSSI {:.1} dBm", avg_rssi_dbm),
            FailureReason::InsufficientSamples { matched_pairs } => {
                write!(f, "Insufficient samples: {} pairs", matched_pairs)
            }
        }
    }
}

impl Serialize for FailureReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkVerdict {
    pub result: TestResult,
    pub reasons: Vec<FailureReason>,
    pub details: String,
    pub samples_collected: usize,
    pub tx_samples: usize,
    pub rx_samples: usize,
    pub matched_pairs: usize,
    pub packet_loss_percent: f64,
    pub avg_throttle_diff: f64,
    pub max_throttle_diff: u32,
    pub avg_steering_diff: f64,
    pub max_steering_diff: u32,
    pub avg_rssi_dbm: Option<f64>,
    pub min_rssi_dbm: Option<i32>,
    pub avg_snr_db: Option<f64>,
}

impl LinkVerdict {
    pub fn passed(&self) -> bool {
        self.result == TestResult::Pass
    }

    fn no_data() -> Self {
        let reasons = vec![FailureReason::NoData];
        LinkVerdict {
            result: TestResult::Fail,
            details: join_reasons(&reasons),
            reasons,
            samples_collected: 0,
            tx_samples: 0,
            rx_samples: 0,
            matched_pairs: 0,
            packet_loss_percent: 100.0,
            avg_throttle_diff: 0.0,
            max_throttle_diff: 0,
            avg_steering_diff: 0.0,
            max_steering_diff: 0,
            avg_rssi_dbm: None,
            min_rssi_dbm: None,
            avg_snr_db: None,
        }
    }
}

/// Mean and maximum of a set of absolute differences; both 0 when empty.
fn diff_stats(diffs: &[u32]) -> (f64, u32) {
    if diffs.is_empty() {
        return (0.0, 0);
    }
    let sum: u64 = diffs.iter().map(|&d| d as u64).sum();
    let max = diffs.iter().copied().max().unwrap_or(0);
    (sum as f64 / diffs.len() as f64, max)
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn join_reasons(reasons: &[FailureReason]) -> String {
    if reasons.is_empty() {
        "Radio link working correctly".to_string()
    } else {
        reasons.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
    }
}

/// Computes link statistics over a ledger snapshot and decides the verdict.
///
/// Diffs and signal figures only look at matched samples. Loss is measured
/// against TX samples: a TX frame that never found its RX partner is lost.
pub fn analyze(samples: &[Sample], thresholds: &VerdictThresholds) -> LinkVerdict {
    if samples.is_empty() {
        return LinkVerdict::no_data();
    }

    let total_tx = samples.iter().filter(|s| s.has_tx()).count();
    let total_rx = samples.iter().filter(|s| s.has_rx()).count();
    let matched: Vec<&Sample> = samples.iter().filter(|s| s.is_matched()).collect();
    let matched_count = matched.len();

    let packet_loss = if total_tx > 0 {
        (total_tx - matched_count) as f64 / total_tx as f64 * 100.0
    } else {
        100.0
    };

    let throttle_diffs: Vec<u32> = matched
        .iter()
        .filter_map(|s| Some(s.tx_throttle?.abs_diff(s.rx_throttle?)))
        .collect();
    let steering_diffs: Vec<u32> = matched
        .iter()
        .filter_map(|s| Some(s.tx_steering?.abs_diff(s.rx_steering?)))
        .collect();
    let (avg_throttle_diff, max_throttle_diff) = diff_stats(&throttle_diffs);
    let (avg_steering_diff, max_steering_diff) = diff_stats(&steering_diffs);

    let rssi_values: Vec<i32> = matched.iter().filter_map(|s| s.rssi).collect();
    let avg_rssi = mean(&rssi_values.iter().map(|&r| r as f64).collect::<Vec<_>>());
    let min_rssi = rssi_values.iter().copied().min();

    let snr_values: Vec<f64> = matched.iter().filter_map(|s| s.snr).collect();
    let avg_snr = mean(&snr_values);

    let mut reasons = Vec::new();
    if packet_loss > thresholds.max_packet_loss_percent {
        reasons.push(FailureReason::HighPacketLoss { percent: packet_loss });
    }
    if max_throttle_diff.max(max_steering_diff) > thresholds.max_value_diff {
        reasons.push(FailureReason::ValueMismatch { max_throttle_diff, max_steering_diff });
    }
    if let Some(avg) = avg_rssi {
        if avg < thresholds.min_avg_rssi_dbm {
            reasons.push(FailureReason::WeakSignal { avg_rssi_dbm: avg });
        }
    }
    if matched_count < thresholds.min_matched_pairs {
        reasons.push(FailureReason::InsufficientSamples { matched_pairs: matched_count });
    }

    LinkVerdict {
        result: if reasons.is_empty() { TestResult::Pass } else { TestResult::Fail },
        details: join_reasons(&reasons),
        reasons,
        samples_collected: samples.len(),
        tx_samples: total_tx,
        rx_samples: total_rx,
        matched_pairs: matched_count,
        packet_loss_percent: round2(packet_loss),
        avg_throttle_diff: round2(avg_throttle_diff),
        max_throttle_diff,
        avg_steering_diff: round2(avg_steering_diff),
        max_steering_diff,
        avg_rssi_dbm: avg_rssi,
        min_rssi_dbm: min_rssi,
        avg_snr_db: avg_snr,
    }
}
