//! Bridge error taxonomy.
//!
//! Transport and protocol failures are absorbed by the polling loop and
//! turned into connection-state transitions and unavailability publishes;
//! only configuration errors are allowed to take the process down.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Errors from the serial transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The device could not be opened or is not open.
    #[error("serial connection error: {0}")]
    Connection(String),

    /// A read or write failed mid-flight.
    #[error("serial i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// No response arrived within the allowed window.
    #[error("no response from UPS within {0:?}")]
    Timeout(Duration),
}

/// Top-level bridge error.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] smsups_protocol::DecodeError),

    #[error("mqtt client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
