//! Bridge configuration.
//!
//! Everything here maps 1:1 onto the options the supervising environment
//! passes on the command line. Validation failures are the only errors this
//! process treats as fatal.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use smsups_protocol::FrameDialect;

/// Configuration errors, fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required option: {0}")]
    Missing(&'static str),

    #[error("invalid value for {option}: {reason}")]
    Invalid {
        option: &'static str,
        reason: String,
    },
}

/// Serial link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0`.
    pub port: String,

    /// Baud rate; the SMS Gamer line speaks 2400.
    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Read timeout in seconds.
    #[serde(default = "default_serial_timeout")]
    pub timeout_secs: u64,
}

fn default_baud() -> u32 {
    2400
}
fn default_serial_timeout() -> u64 {
    3
}

impl SerialConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud: default_baud(),
            timeout_secs: default_serial_timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// MQTT broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or address.
    pub broker: String,

    /// Broker port.
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Client ID (auto-generated if not provided).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Username for authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password for authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,

    /// Base topic for state, availability and commands.
    #[serde(default = "default_topic_base")]
    pub topic_base: String,

    /// Home Assistant discovery prefix.
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,

    /// Stable device identifier used in discovery unique IDs.
    #[serde(default = "default_device_id")]
    pub device_id: String,
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_keep_alive() -> u64 {
    60
}
fn default_topic_base() -> String {
    "smsups/ups".to_string()
}
fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}
fn default_device_id() -> String {
    "smsups_gamer".to_string()
}

impl MqttConfig {
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            port: default_mqtt_port(),
            client_id: None,
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
            topic_base: default_topic_base(),
            discovery_prefix: default_discovery_prefix(),
            device_id: default_device_id(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Configured client ID, or a generated one with a random suffix so two
    /// bridge instances never collide on the broker.
    pub fn effective_client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.device_id, Uuid::new_v4()))
    }

    pub fn full_broker_addr(&self) -> String {
        format!("{}:{}", self.broker, self.port)
    }
}

/// Polling and publish-suppression options as configured (seconds granularity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Seconds between status polls.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Publish a heartbeat snapshot after this many seconds without change.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    /// A numeric field must move by more than this to trigger a publish.
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,

    /// Consecutive poll failures before the UPS is reported unavailable.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds to wait for a command acknowledgement.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_interval() -> u64 {
    10
}
fn default_heartbeat() -> u64 {
    120
}
fn default_epsilon() -> f32 {
    0.5
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_command_timeout() -> u64 {
    2
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            heartbeat_secs: default_heartbeat(),
            epsilon: default_epsilon(),
            failure_threshold: default_failure_threshold(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

/// Fully resolved polling policy handed to the polling loop.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    pub heartbeat: Duration,
    pub epsilon: f32,
    pub failure_threshold: u32,
    pub command_timeout: Duration,
    /// How long one status read may take; comes from the serial timeout.
    pub read_timeout: Duration,
}

impl PollPolicy {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.poll.interval_secs),
            heartbeat: Duration::from_secs(config.poll.heartbeat_secs),
            epsilon: config.poll.epsilon,
            failure_threshold: config.poll.failure_threshold,
            command_timeout: Duration::from_secs(config.poll.command_timeout_secs),
            read_timeout: config.serial.timeout(),
        }
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub serial: SerialConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub dialect: FrameDialect,
}

impl BridgeConfig {
    /// Reject configurations the bridge cannot run with. Called once before
    /// any loop starts; failures here are the process-fatal kind.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.port.trim().is_empty() {
            return Err(ConfigError::Missing("serial port"));
        }
        if self.mqtt.broker.trim().is_empty() {
            return Err(ConfigError::Missing("mqtt broker"));
        }
        if self.serial.baud == 0 {
            return Err(ConfigError::Invalid {
                option: "baud",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.poll.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                option: "interval",
                reason: "must be at least one second".to_string(),
            });
        }
        if self.poll.heartbeat_secs < self.poll.interval_secs {
            return Err(ConfigError::Invalid {
                option: "heartbeat",
                reason: "must not be shorter than the poll interval".to_string(),
            });
        }
        if self.poll.epsilon < 0.0 {
            return Err(ConfigError::Invalid {
                option: "epsilon",
                reason: "must not be negative".to_string(),
            });
        }
        if self.poll.failure_threshold == 0 {
            return Err(ConfigError::Invalid {
                option: "failure-threshold",
                reason: "must be at least one".to_string(),
            });
        }
        Ok(())
    }
}
