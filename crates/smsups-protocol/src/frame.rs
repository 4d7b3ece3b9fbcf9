//! Frame encoding and decoding.
//!
//! All functions here are pure: bytes in, structured records out. The
//! transport layer decides how many bytes to read; on
//! [`DecodeError::Incomplete`] it should keep reading and call again.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::{CommandRequest, Query};
use crate::snapshot::{StatusFlags, UpsStatusSnapshot};

/// Carriage return terminates every request and most responses.
pub const TERMINATOR: u8 = 0x0D;

/// Upper bound on any response frame, used by transports to cap reads.
pub const MAX_FRAME_LEN: usize = 64;

/// Status frame length in the checksummed (Gamer) dialect:
/// start marker + 14 measurement bytes + flags + checksum.
const STATUS_LEN_GAMER: usize = 17;

/// Legacy firmware sends the same frame without the checksum byte.
const STATUS_LEN_LEGACY: usize = 16;

/// Restore code observed in hardware captures of the `R` command.
const SHUTDOWN_RESTORE_CODE: u16 = 0x270F;

/// Which response framing the connected device speaks.
///
/// Selected by configuration. Auto-detection is a non-goal: a legacy frame
/// is indistinguishable from a checksummed frame that happens to be short.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameDialect {
    /// Checksummed 17-byte status frames (current firmware).
    #[default]
    Gamer,
    /// 16-byte status frames without a trailing checksum.
    Legacy,
}

impl std::str::FromStr for FrameDialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gamer" => Ok(FrameDialect::Gamer),
            "legacy" => Ok(FrameDialect::Legacy),
            other => Err(format!("unknown frame dialect: {other}")),
        }
    }
}

impl std::fmt::Display for FrameDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameDialect::Gamer => write!(f, "gamer"),
            FrameDialect::Legacy => write!(f, "legacy"),
        }
    }
}

/// Errors raised while decoding a response frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not enough bytes yet; the caller may keep reading.
    #[error("incomplete frame: have {have} bytes, need {needed}")]
    Incomplete { have: usize, needed: usize },

    #[error("empty response")]
    Empty,

    #[error("checksum mismatch: computed {computed:#04x}, frame carries {found:#04x}")]
    Checksum { computed: u8, found: u8 },

    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl DecodeError {
    /// True when more bytes could still turn this into a valid frame.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, DecodeError::Incomplete { .. })
    }
}

/// Protocol checksum: two's complement of the byte sum, truncated to 8 bits.
pub fn checksum(payload: &[u8]) -> u8 {
    let sum = payload
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    sum.wrapping_neg()
}

fn build_frame(cmd: u8, params: [u8; 4]) -> Vec<u8> {
    let mut frame = vec![cmd, params[0], params[1], params[2], params[3]];
    frame.push(checksum(&frame));
    frame.push(TERMINATOR);
    frame
}

/// Encode a read-only query frame.
pub fn encode_query(query: Query) -> Vec<u8> {
    build_frame(query.command_byte(), [0xFF; 4])
}

/// Encode a control command frame. Deterministic; performs no I/O.
pub fn encode_command(request: &CommandRequest) -> Vec<u8> {
    match request {
        CommandRequest::ToggleBeep => build_frame(0x4D, [0xFF; 4]),
        CommandRequest::StartBatteryTest { seconds } => {
            let s = seconds.to_be_bytes();
            build_frame(0x54, [s[0], s[1], 0x00, 0x00])
        }
        CommandRequest::StartBatteryDischarge => build_frame(0x44, [0xFF; 4]),
        CommandRequest::CancelOperation => build_frame(0x43, [0xFF; 4]),
        CommandRequest::ScheduleShutdown { delay } => {
            // The wire carries the delay in tenths of a second.
            let tenths = (delay.as_millis() / 100).min(u128::from(u16::MAX)) as u16;
            let d = tenths.to_be_bytes();
            let r = SHUTDOWN_RESTORE_CODE.to_be_bytes();
            build_frame(0x52, [d[0], d[1], r[0], r[1]])
        }
    }
}

/// Decode a `Q` status response into a snapshot.
///
/// `raw` is everything the transport has accumulated so far; a trailing
/// terminator is tolerated but not required. All measurements are scaled by
/// ten on the wire.
pub fn decode_status(raw: &[u8], dialect: FrameDialect) -> Result<UpsStatusSnapshot, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }

    let needed = match dialect {
        FrameDialect::Gamer => STATUS_LEN_GAMER,
        FrameDialect::Legacy => STATUS_LEN_LEGACY,
    };

    // Framing is by length, not by terminator: the frame is binary, so a
    // measurement byte may legitimately be 0x0D and cannot delimit anything.
    // A short buffer is always answered with Incomplete; the caller bounds
    // how long it keeps reading.
    if raw.len() < needed {
        return Err(DecodeError::Incomplete {
            have: raw.len(),
            needed,
        });
    }
    let frame = &raw[..needed];

    if dialect == FrameDialect::Gamer {
        let computed = checksum(&frame[..STATUS_LEN_GAMER - 1]);
        let found = frame[STATUS_LEN_GAMER - 1];
        if computed != found {
            return Err(DecodeError::Checksum { computed, found });
        }
    }

    // Byte 0 is a start marker the firmware does not document; skip it.
    let input_voltage =
        u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as f32 / 10.0;
    let output_voltage = tenths_u16(&frame[5..7]);
    let load_percent = tenths_u16(&frame[7..9]);
    let frequency = tenths_u16(&frame[9..11]);
    let battery_percent = tenths_u16(&frame[11..13]);
    let temperature = tenths_u16(&frame[13..15]);
    let flags = StatusFlags::from_byte(frame[15]);

    Ok(UpsStatusSnapshot {
        input_voltage: Some(input_voltage),
        output_voltage: Some(output_voltage),
        load_percent: Some(load_percent),
        frequency: Some(frequency),
        battery_percent: Some(battery_percent),
        temperature: Some(temperature),
        flags,
    })
}

fn tenths_u16(bytes: &[u8]) -> f32 {
    u16::from_be_bytes([bytes[0], bytes[1]]) as f32 / 10.0
}

/// Identification data parsed from an `I` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfoFrame {
    /// Model string, when the firmware reports one.
    pub model: Option<String>,
    /// Firmware revision string.
    pub firmware: Option<String>,
    /// The printable portion of the raw response, for diagnostics.
    pub raw: String,
}

/// Extract the printable ASCII payload of a text-style response, with the
/// start marker ('#', '(' or '=' depending on revision) stripped.
fn printable_payload(raw: &[u8]) -> Result<String, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }
    let printable: String = raw
        .iter()
        .filter(|&&b| (0x20..0x7F).contains(&b))
        .map(|&b| b as char)
        .collect();
    let trimmed = printable.trim_start_matches(['#', '(', '=']).trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Malformed(
            "frame carries no printable data".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

/// Best-effort decode of the `I` (device info) response.
///
/// The info frame is loosely specified across device revisions: it carries
/// ASCII fields separated by spaces, wrapped in the usual start marker and
/// terminator. Anything non-printable is discarded.
pub fn decode_device_info(raw: &[u8]) -> Result<DeviceInfoFrame, DecodeError> {
    let text = printable_payload(raw)?;

    let mut fields = text.split_whitespace();
    let model = fields.next().map(str::to_string);
    let firmware = fields.next().map(str::to_string);

    Ok(DeviceInfoFrame {
        model,
        firmware,
        raw: text,
    })
}

/// Ratings parsed from an `F` response.
#[derive(Debug, Clone, PartialEq)]
pub struct RatedFeatures {
    pub voltage: Option<f32>,
    pub current: Option<f32>,
    pub battery_voltage: Option<f32>,
    pub frequency: Option<f32>,
    /// The printable portion of the raw response, for diagnostics.
    pub raw: String,
}

/// Best-effort decode of the `F` (rated features) response.
///
/// Same text framing as the info frame, carrying rated voltage, current,
/// battery voltage and frequency as space-separated numbers. Fields that do
/// not parse stay `None`.
pub fn decode_features(raw: &[u8]) -> Result<RatedFeatures, DecodeError> {
    let text = printable_payload(raw)?;

    let mut fields = text.split_whitespace().map(|f| f.parse::<f32>().ok());
    let voltage = fields.next().flatten();
    let current = fields.next().flatten();
    let battery_voltage = fields.next().flatten();
    let frequency = fields.next().flatten();

    Ok(RatedFeatures {
        voltage,
        current,
        battery_voltage,
        frequency,
        raw: text,
    })
}
