//! Serial transport.
//!
//! Owns the one exclusive handle to the UPS serial device. Not
//! concurrency-safe by contract: the polling loop is the sole caller, so
//! there is never more than one outstanding request on the wire.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use smsups_protocol::frame::{MAX_FRAME_LEN, TERMINATOR};

use crate::config::SerialConfig;
use crate::error::TransportError;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Health of the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The handle is open but the error rate crossed the threshold;
    /// snapshots should be reported unavailable until recovery.
    Degraded,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Degraded => write!(f, "degraded"),
        }
    }
}

/// Byte-level frame transport, the seam the polling loop is tested through.
#[async_trait]
pub trait Transport: Send {
    /// Write one request frame.
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Read one response frame, accumulating until the terminator, the
    /// frame-size cap, or `max_wait` elapses. A timeout with partial data
    /// returns the partial bytes and lets the codec decide.
    async fn read_frame(&mut self, max_wait: Duration) -> Result<Vec<u8>, TransportError>;

    /// Close and reopen the link, backing off between attempts. Returns
    /// once the link is open again; the caller bounds it with a shutdown
    /// signal.
    async fn recover(&mut self);

    fn state(&self) -> ConnectionState;
}

/// Exponential backoff, 1s doubling up to a 30s cap, unbounded attempts.
#[derive(Debug)]
struct Backoff {
    attempt: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { attempt: 0 }
    }

    fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let factor = 1u32 << (self.attempt - 1).min(5);
        (BACKOFF_BASE * factor).min(BACKOFF_CAP)
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Reconnect attempts log at full volume early, then quiet down.
    fn should_log(&self) -> bool {
        self.attempt <= 3 || self.attempt % 10 == 0
    }
}

/// Serial transport over a tokio-serial stream.
pub struct SerialTransport {
    config: SerialConfig,
    stream: Option<SerialStream>,
    state: ConnectionState,
    backoff: Backoff,
    consecutive_errors: u32,
    degraded_after: u32,
}

impl SerialTransport {
    pub fn new(config: SerialConfig, degraded_after: u32) -> Self {
        Self {
            config,
            stream: None,
            state: ConnectionState::Disconnected,
            backoff: Backoff::new(),
            consecutive_errors: 0,
            degraded_after: degraded_after.max(1),
        }
    }

    /// Open the device. On failure the transport stays disconnected and the
    /// caller decides whether to retry via [`Transport::recover`].
    pub async fn open(&mut self) -> Result<(), TransportError> {
        self.state = ConnectionState::Connecting;
        let builder = tokio_serial::new(&self.config.port, self.config.baud);
        match builder.open_native_async() {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = ConnectionState::Connected;
                self.backoff.reset();
                self.consecutive_errors = 0;
                info!(
                    port = %self.config.port,
                    baud = self.config.baud,
                    "serial port open"
                );
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(TransportError::Connection(e.to_string()))
            }
        }
    }

    fn note_failure(&mut self) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if self.consecutive_errors >= self.degraded_after
            && self.state == ConnectionState::Connected
        {
            warn!(
                errors = self.consecutive_errors,
                "serial link degraded"
            );
            self.state = ConnectionState::Degraded;
        }
    }

    fn note_success(&mut self) {
        self.consecutive_errors = 0;
        if self.state == ConnectionState::Degraded {
            info!("serial link recovered");
            self.state = ConnectionState::Connected;
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransportError::Connection("serial port not open".to_string()))?;

        debug!(frame = %hex::encode(frame), "serial write");
        match stream.write_all(frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.note_failure();
                Err(TransportError::Io(e))
            }
        }
    }

    async fn read_frame(&mut self, max_wait: Duration) -> Result<Vec<u8>, TransportError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransportError::Connection("serial port not open".to_string()))?;

        let deadline = Instant::now() + max_wait;
        let mut buf = Vec::new();
        let mut chunk = [0u8; MAX_FRAME_LEN];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, stream.read(&mut chunk)).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    self.note_failure();
                    return Err(TransportError::Io(e));
                }
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.contains(&TERMINATOR) || buf.len() >= MAX_FRAME_LEN {
                        break;
                    }
                }
            }
        }

        if buf.is_empty() {
            self.note_failure();
            Err(TransportError::Timeout(max_wait))
        } else {
            self.note_success();
            debug!(frame = %hex::encode(&buf), "serial read");
            Ok(buf)
        }
    }

    async fn recover(&mut self) {
        self.stream = None;
        if self.state != ConnectionState::Degraded {
            self.state = ConnectionState::Disconnected;
        }

        loop {
            let delay = self.backoff.next_delay();
            if self.backoff.should_log() {
                warn!(
                    attempt = self.backoff.attempt(),
                    delay_secs = delay.as_secs(),
                    port = %self.config.port,
                    "reopening serial port"
                );
            } else {
                debug!(attempt = self.backoff.attempt(), "reopening serial port");
            }
            tokio::time::sleep(delay).await;

            match self.open().await {
                Ok(()) => return,
                Err(e) => {
                    if self.backoff.should_log() {
                        warn!(error = %e, "serial reopen failed");
                    }
                }
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}
