//! SMS Gamer UPS serial protocol codec.
//!
//! This crate is the pure, I/O-free half of the bridge: it encodes command
//! frames for the UPS and decodes its status/info responses into structured
//! records. The wire format was reverse-engineered from hardware captures;
//! the exact layout lives in [`frame`].
//!
//! ## Frame format
//!
//! Requests are six bytes plus a carriage-return terminator:
//!
//! ```text
//! [cmd] [p1] [p2] [p3] [p4] [checksum] 0x0D
//! ```
//!
//! where `checksum` is the two's complement of the byte sum. Status
//! responses are fixed-length binary frames carrying tenths-scaled
//! measurements and one flags byte; see [`frame::decode_status`].
//!
//! Some device revisions ship firmware that omits the response checksum.
//! That variant is handled by [`FrameDialect::Legacy`], selected through
//! configuration. Dialect auto-detection is deliberately not attempted
//! because the variants are not distinguishable on the wire.

pub mod command;
pub mod frame;
pub mod snapshot;

pub use command::{CommandRequest, Query};
pub use frame::{
    decode_device_info, decode_features, decode_status, encode_command, encode_query,
    DecodeError, DeviceInfoFrame, FrameDialect, RatedFeatures,
};
pub use snapshot::{StatusFlags, UpsStatusSnapshot};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
