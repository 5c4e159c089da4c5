// Simulated TX/RX device pair

use crate::channel::Channel;
use crate::config::LinkTestConfig;
use crate::orchestrator::{run_integration_test_on, IntegrationReport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DUPLEX_BUFFER_BYTES: usize = 64 * 1024;

/// Behaviour of the simulated radio link.
#[derive(Debug, Clone)]
pub struct LoopbackProfile {
    pub tick: Duration,     // TX telemetry period
    pub loss_rate: f64,     // Probability that a frame never reaches RX
    pub latency: Duration,  // Air time before RX reports a frame; keep above the poll interval
    pub rssi_dbm: i32,
    pub snr_db: f64,
    pub noise_every: u32,   // A log line every N ticks, 0 disables
    pub seed: Option<u64>,  // Fixed seed for reproducible loss patterns
}

impl Default for LoopbackProfile {
    fn default() -> Self {
        LoopbackProfile {
            tick: Duration::from_millis(50),
            loss_rate: 0.0,
            latency: Duration::from_millis(20),
            rssi_dbm: -65,
            snr_db: 9.5,
            noise_every: 25,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ControlFrame {
    throttle: i32,
    steering: i32,
}

/// Harness-side channels to a simulated TX/RX pair plus the device tasks.
pub struct LoopbackPair {
    pub tx: Arc<Channel>,
    pub rx: Arc<Channel>,
    devices: Vec<JoinHandle<()>>,
}

impl LoopbackPair {
    pub fn spawn(config: &LinkTestConfig, profile: LoopbackProfile) -> Self {
        let settings = config.channel_settings();
        let (tx_harness, tx_device) = tokio::io::duplex(DUPLEX_BUFFER_BYTES);
        let (rx_harness, rx_device) = tokio::io::duplex(DUPLEX_BUFFER_BYTES);
        let (radio_tx, radio_rx) = mpsc::unbounded_channel();

        let devices = vec![
            tokio::spawn(simulated_tx(tx_device, config.tx_stream_command.clone(), profile.clone(), radio_tx)),
            tokio::spawn(simulated_rx(rx_device, config.rx_stream_command.clone(), profile, radio_rx)),
        ];

        LoopbackPair {
            tx: Arc::new(Channel::from_stream("loopback-tx", tx_harness, settings)),
            rx: Arc::new(Channel::from_stream("loopback-rx", rx_harness, settings)),
            devices,
        }
    }

    /// Closes both harness channels and stops the simulated devices.
    pub async fn shutdown(self) {
        self.tx.close().await;
        self.rx.close().await;
        for device in self.devices {
            device.abort();
        }
    }
}

/// Runs device checks and the link test against simulated devices, without
/// hardware.
pub async fn run_loopback_test(
    config: Arc<LinkTestConfig>,
    profile: LoopbackProfile,
    cancel: CancellationToken,
) -> IntegrationReport {
    let pair = LoopbackPair::spawn(&config, profile);
    let report = run_integration_test_on(config, Arc::clone(&pair.tx), Arc::clone(&pair.rx), cancel).await;
    pair.shutdown().await;
    report
}

fn rng_for(profile: &LoopbackProfile) -> StdRng {
    match profile.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Stick positions swept over time so consecutive frames differ.
fn control_at(tick: u64) -> ControlFrame {
    let phase = (tick % 200) as i32;
    let throttle = if phase < 100 { phase } else { 200 - phase };
    ControlFrame { throttle, steering: 128 + (phase % 21) - 10 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Printing {
    Off,
    Telemetry, // The stream command that drives the link test
    Signal,    // `?printRSSI json`, TX only
}

/// Replies both firmwares share. `None` means the command is not one of them.
fn common_reply(command: &str) -> Option<String> {
    match command {
        "?exitchg" => Some("Charging mode exited\r\n".to_string()),
        "?get version" => Some("version=2.1.0\r\n".to_string()),
        "?conf" => Some("confStruct: version=2.1.0 gear_count=3 failsafe_ms=1000\r\n".to_string()),
        _ => None,
    }
}

fn unknown(command: &str) -> String {
    format!("ERR unknown command: {}\r\n", command)
}

async fn simulated_tx(
    device: DuplexStream,
    stream_command: String,
    profile: LoopbackProfile,
    radio: mpsc::UnboundedSender<ControlFrame>,
) {
    let (read, mut write) = tokio::io::split(device);
    let mut commands = BufReader::new(read).lines();
    let mut ticker = tokio::time::interval(profile.tick);
    let mut rng = rng_for(&profile);
    let stream_json = format!("{} json", stream_command);
    let mut printing = Printing::Off;
    let mut tick: u64 = 0;

    loop {
        tokio::select! {
            line = commands.next_line() => {
                let command = match line {
                    Ok(Some(command)) => command,
                    _ => break, // Harness hung up
                };
                let command = command.trim();
                let reply = if command == stream_json {
                    printing = Printing::Telemetry;
                    None
                } else if command == "?printRSSI json" {
                    printing = Printing::Signal;
                    None
                } else if command == "quit" {
                    printing = Printing::Off;
                    None
                } else if command == "?state json" {
                    Some("{\"radio\":\"ON\",\"display\":\"ON\",\"hall\":\"ON\",\"locked\":false,\"gear\":1,\"last_pkt_ms\":12}\r\n".to_string())
                } else {
                    Some(common_reply(command).unwrap_or_else(|| unknown(command)))
                };
                if let Some(reply) = reply {
                    if write.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                tick += 1;
                let frame = control_at(tick);
                // The radio keeps transmitting whether or not the harness listens.
                if rng.gen::<f64>() >= profile.loss_rate {
                    let _ = radio.send(frame);
                }
                let mut out = String::new();
                match printing {
                    Printing::Off => continue,
                    Printing::Telemetry => {
                        if profile.noise_every > 0 && tick % profile.noise_every as u64 == 0 {
                            out.push_str("[bat] 4.02V 87%\r\n");
                        }
                        out.push_str(&format!(
                            "{{\"throttle\":{},\"steering\":{},\"toggle\":0}}\r\n",
                            frame.throttle, frame.steering
                        ));
                    }
                    Printing::Signal => out.push_str(&format!(
                        "{{\"rssi\":{},\"snr\":{:.1}}}\r\n",
                        profile.rssi_dbm, profile.snr_db
                    )),
                }
                if write.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("simulated TX stopped");
}

async fn simulated_rx(
    device: DuplexStream,
    stream_command: String,
    profile: LoopbackProfile,
    mut radio: mpsc::UnboundedReceiver<ControlFrame>,
) {
    let (read, mut write) = tokio::io::split(device);
    let mut commands = BufReader::new(read).lines();
    let stream_json = format!("{} json", stream_command);
    let mut streaming = false;
    let mut received: u64 = 0;

    loop {
        tokio::select! {
            line = commands.next_line() => {
                let command = match line {
                    Ok(Some(command)) => command,
                    _ => break,
                };
                let command = command.trim();
                let reply = if command == stream_json {
                    streaming = true;
                    None
                } else if command == "quit" {
                    streaming = false;
                    None
                } else {
                    Some(match command {
                        "?state json" => "{\"vesc\":\"OK\",\"pwm\":\"ON\"}\r\n".to_string(),
                        "?packets" => format!("rx packets: {} received\r\n", received),
                        "?vesc" => "VESC UART connected\r\n".to_string(),
                        "?pwm" => "PWM out: 1500us\r\n".to_string(),
                        _ => common_reply(command).unwrap_or_else(|| unknown(command)),
                    })
                };
                if let Some(reply) = reply {
                    if write.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
            frame = radio.recv() => {
                let Some(frame) = frame else { break };
                received += 1;
                if !streaming {
                    continue;
                }
                tokio::time::sleep(profile.latency).await;
                let line = format!(
                    "{{\"throttle\":{},\"steering\":{},\"rssi\":{},\"snr\":{:.1}}}\r\n",
                    frame.throttle, frame.steering, profile.rssi_dbm, profile.snr_db
                );
                if write.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("simulated RX stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkTestConfig;

    fn fast_config() -> LinkTestConfig {
        LinkTestConfig {
            command_timeout_ms: 150,
            command_delay_ms: 5,
            stream_start_gap_ms: 10,
            join_timeout_ms: 200,
            ..Default::default()
        }
    }

    #[test]
    fn test_control_sweep_stays_in_range() {
        for tick in 0..400 {
            let frame = control_at(tick);
            assert!((0..=100).contains(&frame.throttle));
            assert!((118..=138).contains(&frame.steering));
        }
        assert_eq!(control_at(150).throttle, 50);
    }

    #[tokio::test]
    async fn test_simulated_devices_answer_state_queries() {
        let pair = LoopbackPair::spawn(&fast_config(), LoopbackProfile::default());
        let tx_state = pair.tx.send_json("?state").await.unwrap();
        assert!(tx_state.contains_key("gear"));
        let rx_state = pair.rx.send_json("?state").await.unwrap();
        assert!(rx_state.contains_key("vesc"));
        assert!(pair.tx.send("?bogus").await.starts_with("ERR"));
    }

    #[tokio::test]
    async fn test_tx_streams_until_quit() {
        let profile = LoopbackProfile { tick: Duration::from_millis(10), ..Default::default() };
        let pair = LoopbackPair::spawn(&fast_config(), profile);
        assert!(pair.tx.send_no_wait("?printInputs json").await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let streamed = String::from_utf8(pair.tx.drain_available()).unwrap();
        assert!(streamed.contains("\"throttle\""));

        assert!(pair.tx.send_no_wait("quit").await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        pair.tx.discard_pending();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pair.tx.drain_available().is_empty());
    }

    #[tokio::test]
    async fn test_tx_prints_signal_until_quit() {
        let profile = LoopbackProfile { tick: Duration::from_millis(10), rssi_dbm: -71, ..Default::default() };
        let pair = LoopbackPair::spawn(&fast_config(), profile);
        let signal = pair.tx.send_json("?printRSSI").await.unwrap();
        assert_eq!(signal.get("rssi").and_then(|v| v.as_i64()), Some(-71));
        assert!(!signal.contains_key("throttle"));
        assert!(pair.tx.send_no_wait("quit").await);
        pair.shutdown().await;
    }

    #[tokio::test]
    async fn test_rx_text_replies() {
        let pair = LoopbackPair::spawn(&fast_config(), LoopbackProfile::default());
        assert!(pair.rx.send("?vesc").await.contains("VESC"));
        assert!(pair.rx.send("?pwm").await.contains("PWM"));
        assert!(pair.rx.send("?packets").await.contains("received"));
        assert_eq!(pair.rx.send("?get version").await, "version=2.1.0");

        let rx = Arc::clone(&pair.rx);
        pair.shutdown().await;
        assert!(!rx.is_connected());
    }
}
