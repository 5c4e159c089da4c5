// Telemetry frame definitions
use crate::ledger::Sample;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::time::Instant;

/// One JSON object emitted by a device while streaming.
///
/// TX prints `{"throttle":N,"steering":N,"toggle":N,...}`, RX prints
/// `{"throttle":N,"steering":N,"rssi":N,"snr":F,...}`. Keys we don't use are
/// ignored; a key that is absent stays `None`, which is distinct from zero.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetryFrame {
    #[serde(default, deserialize_with = "lenient_int")]
    pub throttle: Option<i32>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub steering: Option<i32>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub rssi: Option<i32>, // dBm
    #[serde(default)]
    pub snr: Option<f64>, // dB
}

/// Integer fields also accept JSON floats, truncated toward zero. Some
/// firmware builds print `-60.0` where `-60` is meant.
fn lenient_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i32>, D::Error> {
    let Some(number) = Option::<serde_json::Number>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if let Some(value) = number.as_i64() {
        return i32::try_from(value)
            .map(Some)
            .map_err(|_| D::Error::custom(format!("{} is out of range", value)));
    }
    match number.as_f64() {
        Some(value) if value.is_finite() && value.trunc() >= i32::MIN as f64 && value.trunc() <= i32::MAX as f64 => {
            Ok(Some(value.trunc() as i32))
        }
        _ => Err(D::Error::custom(format!("{} is out of range", number))),
    }
}

impl TelemetryFrame {
    /// Builds a TX sample stamped `at`, if the frame carries a control value.
    pub fn tx_sample(&self, at: Instant) -> Option<Sample> {
        if self.throttle.is_none() && self.steering.is_none() {
            return None;
        }
        Some(Sample {
            tx_throttle: self.throttle,
            tx_steering: self.steering,
            ..Sample::at(at)
        })
    }

    /// Builds an RX update stamped `at`, if the frame carries anything the
    /// receiver reports.
    pub fn rx_update(&self, at: Instant) -> Option<Sample> {
        if self.throttle.is_none() && self.steering.is_none() && self.rssi.is_none() && self.snr.is_none() {
            return None;
        }
        Some(Sample {
            rx_throttle: self.throttle,
            rx_steering: self.steering,
            rssi: self.rssi,
            snr: self.snr,
            ..Sample::at(at)
        })
    }
}
