// Two listeners feeding a shared ledger
use crate::analyzer::{analyze, LinkVerdict};
use crate::channel::Channel;
use crate::config::LinkTestConfig;
use crate::decoder::StreamDecoder;
use crate::ledger::{Ledger, RxOutcome, Sample};
use crate::telemetry::TelemetryFrame;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Streaming,
    Stopping,
    Analyzed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Tx,
    Rx,
}

impl Side {
    fn name(self) -> &'static str {
        match self {
            Side::Tx => "tx",
            Side::Rx => "rx",
        }
    }
}

type SharedLedger = Arc<Mutex<Ledger>>;

fn lock(ledger: &SharedLedger) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Correlates what the transmitter sent with what the receiver got.
///
/// Both devices are switched into JSON streaming mode and one listener task
/// per device drains its channel. TX frames become new ledger samples; RX
/// frames are merged into the newest sample inside the match window. When
/// the observation window closes both devices are told to `quit` and the
/// ledger snapshot is analyzed once.
pub struct CorrelationEngine {
    tx: Arc<Channel>,
    rx: Arc<Channel>,
    config: Arc<LinkTestConfig>,
    ledger: SharedLedger,
    state: EngineState,
    verdict: Option<LinkVerdict>,
}

struct Listeners {
    cancel: CancellationToken,
    tx: JoinHandle<()>,
    rx: JoinHandle<()>,
}

impl CorrelationEngine {
    pub fn new(tx: Arc<Channel>, rx: Arc<Channel>, config: Arc<LinkTestConfig>) -> Self {
        let ledger = Ledger::new(config.match_scan_depth, config.match_window());
        CorrelationEngine {
            tx,
            rx,
            config,
            ledger: Arc::new(Mutex::new(ledger)),
            state: EngineState::Idle,
            verdict: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Copy of the ledger as it stands.
    pub fn ledger_snapshot(&self) -> Vec<Sample> {
        lock(&self.ledger).snapshot()
    }

    /// Streams for `duration`, then stops and analyzes.
    pub async fn run(&mut self, duration: Duration) -> LinkVerdict {
        self.run_until(duration, CancellationToken::new()).await
    }

    /// Like [`CorrelationEngine::run`], but `cancel` ends the observation
    /// window early. The verdict then covers whatever was collected.
    pub async fn run_until(&mut self, duration: Duration, cancel: CancellationToken) -> LinkVerdict {
        if let Some(verdict) = &self.verdict {
            return verdict.clone();
        }

        let listeners = self.start().await;
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = cancel.cancelled() => info!("link test cancelled before the observation window closed"),
        }
        self.stop(listeners).await;
        self.finish()
    }

    async fn start(&mut self) -> Listeners {
        info!(
            tx = self.tx.label(),
            rx = self.rx.label(),
            window_ms = self.config.match_window_ms,
            scan_depth = self.config.match_scan_depth,
            "starting radio link correlation"
        );

        let tx_command = format!("{} json", self.config.tx_stream_command);
        let rx_command = format!("{} json", self.config.rx_stream_command);
        if !self.tx.send_no_wait(&tx_command).await {
            warn!(channel = self.tx.label(), "could not enable TX streaming");
        }
        tokio::time::sleep(self.config.stream_start_gap()).await;
        if !self.rx.send_no_wait(&rx_command).await {
            warn!(channel = self.rx.label(), "could not enable RX streaming");
        }

        let cancel = CancellationToken::new();
        let poll = self.config.poll_interval();
        let tx = tokio::spawn(listen(Side::Tx, Arc::clone(&self.tx), Arc::clone(&self.ledger), cancel.clone(), poll));
        let rx = tokio::spawn(listen(Side::Rx, Arc::clone(&self.rx), Arc::clone(&self.ledger), cancel.clone(), poll));
        self.state = EngineState::Streaming;
        Listeners { cancel, tx, rx }
    }

    async fn stop(&mut self, listeners: Listeners) {
        self.state = EngineState::Stopping;

        self.tx.send_no_wait("quit").await;
        self.rx.send_no_wait("quit").await;

        listeners.cancel.cancel();
        let join_timeout = self.config.join_timeout();
        join_listener(Side::Tx, listeners.tx, join_timeout).await;
        join_listener(Side::Rx, listeners.rx, join_timeout).await;
    }

    fn finish(&mut self) -> LinkVerdict {
        let snapshot = self.ledger_snapshot();
        let verdict = analyze(&snapshot, &self.config.thresholds);
        info!(
            result = %verdict.result,
            samples = verdict.samples_collected,
            matched = verdict.matched_pairs,
            loss_percent = verdict.packet_loss_percent,
            "radio link analyzed"
        );
        self.state = EngineState::Analyzed;
        self.verdict = Some(verdict.clone());
        verdict
    }
}

/// Waits for a listener up to `timeout`, then aborts it.
async fn join_listener(side: Side, mut handle: JoinHandle<()>, timeout: Duration) {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(())) => debug!(side = side.name(), "listener stopped"),
        Ok(Err(e)) => warn!(side = side.name(), error = %e, "listener task failed"),
        Err(_) => {
            warn!(side = side.name(), timeout_ms = timeout.as_millis() as u64, "listener did not stop in time, aborting");
            handle.abort();
        }
    }
}

/// Applies decoded frames to the ledger under one lock. Returns how many
/// frames carried usable fields.
fn record_frames(side: Side, frames: &[TelemetryFrame], ledger: &SharedLedger, received_at: Instant) -> u64 {
    let mut guard = lock(ledger);
    let mut recorded = 0;
    for frame in frames {
        match side {
            Side::Tx => {
                if let Some(sample) = frame.tx_sample(received_at) {
                    guard.record_tx(sample);
                    recorded += 1;
                }
            }
            Side::Rx => {
                if let Some(update) = frame.rx_update(received_at) {
                    if let RxOutcome::Merged(index) = guard.record_rx(update) {
                        debug!(index, "rx frame matched");
                    }
                    recorded += 1;
                }
            }
        }
    }
    recorded
}

/// Drains one channel until cancelled, feeding decoded frames to the ledger.
async fn listen(side: Side, channel: Arc<Channel>, ledger: SharedLedger, cancel: CancellationToken, poll: Duration) {
    debug!(side = side.name(), channel = channel.label(), "listener started");
    let mut decoder = StreamDecoder::new();
    let mut frames_seen: u64 = 0;

    while !cancel.is_cancelled() {
        let chunk = channel.drain_available();
        if chunk.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll) => continue,
            }
        }

        let frames: Vec<TelemetryFrame> = decoder.feed(&chunk);
        if !frames.is_empty() {
            frames_seen += record_frames(side, &frames, &ledger, Instant::now());
        }
    }

    decoder.clear();
    debug!(side = side.name(), frames = frames_seen, "listener finished");
}
