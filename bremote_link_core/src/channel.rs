// Half-duplex command channels to the devices
use crate::config::ChannelSettings;
use crate::decoder::decode_line;
use crate::error::ChannelError;
use serde_json::{Map, Value};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const READ_CHUNK_BYTES: usize = 1024;

/// Where a device is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelTarget {
    /// Serial-over-network bridge, written `tcp://host:port`.
    Tcp(String),
    /// A tty node such as `/dev/ttyUSB0`, opened raw at the configured baud
    /// rate (8N1, no flow control).
    Device(PathBuf),
}

impl FromStr for ChannelTarget {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ChannelError::InvalidTarget(s.to_string()));
        }
        match s.strip_prefix("tcp://") {
            Some(addr) if addr.rsplit_once(':').map_or(false, |(host, port)| {
                !host.is_empty() && port.parse::<u16>().is_ok()
            }) => Ok(ChannelTarget::Tcp(addr.to_string())),
            Some(_) => Err(ChannelError::InvalidTarget(s.to_string())),
            None => Ok(ChannelTarget::Device(PathBuf::from(s))),
        }
    }
}

impl fmt::Display for ChannelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelTarget::Tcp(addr) => write!(f, "tcp://{}", addr),
            ChannelTarget::Device(path) => write!(f, "{}", path.display()),
        }
    }
}

/// State shared between a channel and its inbound pump task.
#[derive(Default)]
struct Inbound {
    bytes: Mutex<Vec<u8>>,
    connected: AtomicBool,
}

impl Inbound {
    fn bytes(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One command connection to a TX or RX unit.
///
/// A background task copies everything the device prints into an inbound
/// buffer, so [`Channel::drain_available`] never blocks. Synchronous
/// exchanges ([`Channel::send`]) are serialized by the writer lock.
///
/// Callers must not issue synchronous commands while a listener is draining
/// the same channel: both consume one byte stream and would split each
/// other's lines.
pub struct Channel {
    label: String,
    settings: ChannelSettings,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    inbound: Arc<Inbound>,
    pump: Option<JoinHandle<()>>,
}

impl Channel {
    /// Connects to `target`. Must be called inside a tokio runtime.
    pub async fn open(
        label: impl Into<String>,
        target: &ChannelTarget,
        settings: ChannelSettings,
    ) -> Result<Self, ChannelError> {
        let label = label.into();
        let (reader, writer): (BoxedReader, BoxedWriter) = match target {
            ChannelTarget::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                let (reader, writer) = stream.into_split();
                (Box::new(reader), Box::new(writer))
            }
            ChannelTarget::Device(path) => {
                // Raw mode, echo off. Reads go through the reactor, so aborting
                // the pump really releases the port.
                let port = tokio_serial::new(path.to_string_lossy(), settings.baud_rate).open_native_async()?;
                let (reader, writer) = tokio::io::split(port);
                (Box::new(reader), Box::new(writer))
            }
        };
        info!(channel = %label, endpoint = %target, baud = settings.baud_rate, "channel opened");
        Ok(Self::from_parts(label, reader, writer, settings))
    }

    /// Wraps an already connected byte stream.
    pub fn from_stream<S>(label: impl Into<String>, stream: S, settings: ChannelSettings) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(label.into(), Box::new(reader), Box::new(writer), settings)
    }

    fn from_parts(label: String, reader: BoxedReader, writer: BoxedWriter, settings: ChannelSettings) -> Self {
        let inbound = Arc::new(Inbound::default());
        inbound.connected.store(true, Ordering::SeqCst);
        let pump = spawn_pump(label.clone(), reader, Arc::clone(&inbound), settings.poll_interval);
        Channel {
            label,
            settings,
            writer: tokio::sync::Mutex::new(Some(writer)),
            inbound,
            pump: Some(pump),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn settings(&self) -> ChannelSettings {
        self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.inbound.connected.load(Ordering::SeqCst)
    }

    /// Like [`Channel::is_connected`], for callers that want an error.
    pub fn ensure_connected(&self) -> Result<(), ChannelError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ChannelError::Disconnected(self.label.clone()))
        }
    }

    /// Sends `command` and collects the response lines printed within the
    /// command timeout. Returns an empty string if the channel is closed or
    /// the write fails.
    pub async fn send(&self, command: &str) -> String {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return String::new();
        };
        if !self.is_connected() {
            return String::new();
        }

        self.discard_pending();
        if let Err(e) = write_line(writer, command).await {
            warn!(channel = %self.label, command, error = %e, "command write failed");
            return String::new();
        }
        tokio::time::sleep(self.settings.command_delay).await;
        let response = self.collect_response().await;
        debug!(channel = %self.label, command, lines = response.lines().count(), "command answered");
        response
    }

    /// Fire-and-forget variant of [`Channel::send`].
    pub async fn send_no_wait(&self, command: &str) -> bool {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return false;
        };
        if !self.is_connected() {
            return false;
        }

        self.discard_pending();
        match write_line(writer, command).await {
            Ok(()) => true,
            Err(e) => {
                warn!(channel = %self.label, command, error = %e, "command write failed");
                false
            }
        }
    }

    /// Sends `command json` and returns the first JSON object in the reply.
    pub async fn send_json(&self, command: &str) -> Option<Map<String, Value>> {
        let response = self.send(&format!("{} json", command)).await;
        response.lines().find_map(|line| decode_line(line.as_bytes()))
    }

    /// Takes whatever the device has printed since the last drain.
    pub fn drain_available(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inbound.bytes())
    }

    pub fn discard_pending(&self) {
        self.inbound.bytes().clear();
    }

    /// Shuts the write side down and stops the pump.
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(channel = %self.label, error = %e, "shutdown on close failed");
            }
        }
        if let Some(pump) = &self.pump {
            pump.abort();
        }
        self.inbound.connected.store(false, Ordering::SeqCst);
        self.discard_pending();
        info!(channel = %self.label, "channel closed");
    }

    async fn collect_response(&self) -> String {
        let deadline = tokio::time::Instant::now() + self.settings.command_timeout;
        let mut received = Vec::new();
        while tokio::time::Instant::now() < deadline {
            let chunk = self.drain_available();
            if chunk.is_empty() {
                tokio::time::sleep(self.settings.poll_interval).await;
            } else {
                received.extend_from_slice(&chunk);
            }
        }
        received.extend_from_slice(&self.drain_available());

        String::from_utf8_lossy(&received)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.label)
            .field("connected", &self.is_connected())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

async fn write_line(writer: &mut BoxedWriter, command: &str) -> io::Result<()> {
    writer.write_all(format!("{}\r\n", command).as_bytes()).await?;
    writer.flush().await
}

fn spawn_pump(label: String, mut reader: BoxedReader, inbound: Arc<Inbound>, backoff: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    info!(channel = %label, "device closed the stream");
                    inbound.connected.store(false, Ordering::SeqCst);
                    break;
                }
                Ok(n) => inbound.bytes().extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Transient on USB serial adapters; retry on the next poll.
                    warn!(channel = %label, error = %e, "read failed");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    })
}
