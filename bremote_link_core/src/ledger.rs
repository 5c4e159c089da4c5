// Samples and TX/RX matching
use std::time::{Duration, Instant};

/// One correlated observation. TX fields come from the transmitter stream,
/// RX fields (and the signal figures) from the receiver stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: Instant, // Receipt time at the harness, not device time
    pub tx_throttle: Option<i32>,
    pub tx_steering: Option<i32>,
    pub rx_throttle: Option<i32>,
    pub rx_steering: Option<i32>,
    pub rssi: Option<i32>,
    pub snr: Option<f64>,
}

impl Sample {
    /// An empty sample stamped `timestamp`.
    pub fn at(timestamp: Instant) -> Self {
        Sample {
            timestamp,
            tx_throttle: None,
            tx_steering: None,
            rx_throttle: None,
            rx_steering: None,
            rssi: None,
            snr: None,
        }
    }

    pub fn has_tx(&self) -> bool {
        self.tx_throttle.is_some() || self.tx_steering.is_some()
    }

    pub fn has_rx(&self) -> bool {
        self.rx_throttle.is_some() || self.rx_steering.is_some()
    }

    pub fn is_matched(&self) -> bool {
        self.has_tx() && self.has_rx()
    }

    /// Copies every RX-side field present in `update` over this sample.
    fn merge_rx(&mut self, update: &Sample) {
        if update.rx_throttle.is_some() {
            self.rx_throttle = update.rx_throttle;
        }
        if update.rx_steering.is_some() {
            self.rx_steering = update.rx_steering;
        }
        if update.rssi.is_some() {
            self.rssi = update.rssi;
        }
        if update.snr.is_some() {
            self.snr = update.snr;
        }
    }

    fn within(&self, other: Instant, window: Duration) -> bool {
        let delta = if self.timestamp >= other {
            self.timestamp - other
        } else {
            other - self.timestamp
        };
        delta < window
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOutcome {
    Merged(usize), // Index of the sample that absorbed the update
    Appended,
}

/// Insertion-ordered record of a link test. Samples are only ever added or
/// completed, never removed.
#[derive(Debug, Clone)]
pub struct Ledger {
    samples: Vec<Sample>,
    scan_depth: usize,
    match_window: Duration,
}

impl Ledger {
    pub fn new(scan_depth: usize, match_window: Duration) -> Self {
        Ledger {
            samples: Vec::new(),
            scan_depth,
            match_window,
        }
    }

    /// TX is the timeline anchor: always a new entry, never merged.
    pub fn record_tx(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    /// Merges `update` into the newest sample among the last `scan_depth`
    /// entries whose timestamp is inside the match window; otherwise appends
    /// it as an RX-only sample.
    pub fn record_rx(&mut self, update: Sample) -> RxOutcome {
        let start = self.samples.len().saturating_sub(self.scan_depth);
        let window = self.match_window;
        let found = self.samples[start..]
            .iter()
            .rposition(|s| s.within(update.timestamp, window))
            .map(|offset| start + offset);

        match found {
            Some(index) => {
                self.samples[index].merge_rx(&update);
                RxOutcome::Merged(index)
            }
            None => {
                self.samples.push(update);
                RxOutcome::Appended
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Owned copy for analysis outside the lock.
    pub fn snapshot(&self) -> Vec<Sample> {
        self.samples.clone()
    }
}
