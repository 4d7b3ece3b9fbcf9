//! MQTT side of the bridge.
//!
//! One `AsyncClient` plus a spawned event-loop task. The event task owns the
//! inbound direction: it re-announces discovery and availability on every
//! (re)connect and drops parsed commands into the shared slot. The outbound
//! direction is [`MqttBridge::run`], which follows the watch channel fed by
//! the polling loop.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use smsups_protocol::{CommandRequest, UpsStatusSnapshot};

use crate::config::MqttConfig;
use crate::discovery::{discovery_messages, DeviceIdentity, DiscoveryMessage, Topics};
use crate::error::Result;
use crate::poller::{CommandSlot, StateUpdate};

const AVAILABILITY_ONLINE: &str = "online";
const AVAILABILITY_OFFLINE: &str = "offline";

/// Longest battery test the `T` command can express (p1p2 is seconds, u16).
const MAX_TEST_SECONDS: u64 = u16::MAX as u64;
/// Longest shutdown delay; the wire carries tenths of a second in a u16.
const MAX_SHUTDOWN_DELAY_SECS: u64 = (u16::MAX / 10) as u64;
const DEFAULT_TEST_SECONDS: u16 = 10;

/// Why an inbound command payload was rejected.
#[derive(Debug, Error)]
pub enum CommandParseError {
    #[error("empty command payload")]
    Empty,

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("malformed command payload: {0}")]
    Malformed(String),

    #[error("{field} out of range: {value} (max {max})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        max: u64,
    },
}

#[derive(Deserialize)]
struct CommandEnvelope {
    action: String,
    seconds: Option<u64>,
    delay_secs: Option<u64>,
}

/// Parse one payload from the command topic.
///
/// The primary form is a JSON envelope, `{"action": "battery_test",
/// "seconds": 10}`. Bare single letters matching the raw protocol commands
/// are accepted too, for poking the bridge from `mosquitto_pub` by hand.
/// The bare `R` form is rejected: scheduling a shutdown without an explicit
/// delay is never what anyone meant.
pub fn parse_command(payload: &[u8]) -> std::result::Result<CommandRequest, CommandParseError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| CommandParseError::Malformed(e.to_string()))?
        .trim();
    if text.is_empty() {
        return Err(CommandParseError::Empty);
    }

    if text.len() == 1 {
        return match text.to_ascii_uppercase().as_str() {
            "M" => Ok(CommandRequest::ToggleBeep),
            "T" => Ok(CommandRequest::StartBatteryTest {
                seconds: DEFAULT_TEST_SECONDS,
            }),
            "D" => Ok(CommandRequest::StartBatteryDischarge),
            "C" => Ok(CommandRequest::CancelOperation),
            other => Err(CommandParseError::UnknownAction(other.to_string())),
        };
    }

    let envelope: CommandEnvelope =
        serde_json::from_str(text).map_err(|e| CommandParseError::Malformed(e.to_string()))?;

    match envelope.action.as_str() {
        "toggle_beep" => Ok(CommandRequest::ToggleBeep),
        "battery_test" => {
            let seconds = envelope.seconds.unwrap_or(DEFAULT_TEST_SECONDS as u64);
            if seconds == 0 || seconds > MAX_TEST_SECONDS {
                return Err(CommandParseError::OutOfRange {
                    field: "seconds",
                    value: seconds,
                    max: MAX_TEST_SECONDS,
                });
            }
            Ok(CommandRequest::StartBatteryTest {
                seconds: seconds as u16,
            })
        }
        "battery_discharge" => Ok(CommandRequest::StartBatteryDischarge),
        "cancel" => Ok(CommandRequest::CancelOperation),
        "shutdown_restore" => {
            let delay_secs = envelope
                .delay_secs
                .ok_or_else(|| CommandParseError::Malformed("missing delay_secs".to_string()))?;
            if delay_secs == 0 || delay_secs > MAX_SHUTDOWN_DELAY_SECS {
                return Err(CommandParseError::OutOfRange {
                    field: "delay_secs",
                    value: delay_secs,
                    max: MAX_SHUTDOWN_DELAY_SECS,
                });
            }
            Ok(CommandRequest::ScheduleShutdown {
                delay: Duration::from_secs(delay_secs),
            })
        }
        other => Err(CommandParseError::UnknownAction(other.to_string())),
    }
}

/// State payload published to the state topic: the snapshot fields plus a
/// flags summary for the text sensor and a timestamp, so stale retained
/// data is recognizable.
pub fn state_payload(snapshot: &UpsStatusSnapshot) -> String {
    let mut value = serde_json::to_value(snapshot).unwrap_or_default();
    if let Some(map) = value.as_object_mut() {
        map.insert(
            "active_flags".to_string(),
            serde_json::Value::String(snapshot.flags.summary()),
        );
        map.insert(
            "updated_at".to_string(),
            serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
        );
    }
    value.to_string()
}

/// Outbound MQTT handle.
pub struct MqttBridge {
    client: AsyncClient,
    topics: Topics,
}

impl MqttBridge {
    /// Connect to the broker and spawn the event-loop task.
    ///
    /// The task never exits on its own; rumqttc reconnects internally and
    /// every reconnect replays the discovery announcements, so a restarted
    /// Home Assistant always finds the entities again.
    pub fn connect(
        config: &MqttConfig,
        identity: &DeviceIdentity,
        commands: CommandSlot,
        updates: watch::Receiver<StateUpdate>,
    ) -> Result<Self> {
        let topics = Topics::from_config(config);
        let discovery = discovery_messages(identity, &topics);

        let mut options =
            MqttOptions::new(config.effective_client_id(), &config.broker, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }
        options.set_last_will(LastWill::new(
            &topics.availability,
            AVAILABILITY_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut eventloop) = AsyncClient::new(options, 16);
        info!(broker = %config.full_broker_addr(), "connecting to MQTT broker");

        let task_client = client.clone();
        let task_topics = topics.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(event) => {
                        handle_event(
                            event,
                            &task_client,
                            &task_topics,
                            &discovery,
                            &commands,
                            &updates,
                        )
                        .await;
                    }
                    Err(e) => {
                        warn!(error = %e, "mqtt event loop error, reconnecting");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(Self { client, topics })
    }

    pub async fn publish_state(&self, snapshot: &UpsStatusSnapshot) -> Result<()> {
        self.client
            .publish(
                &self.topics.state,
                QoS::AtLeastOnce,
                true,
                state_payload(snapshot),
            )
            .await?;
        Ok(())
    }

    pub async fn publish_availability(&self, online: bool) -> Result<()> {
        let payload = if online {
            AVAILABILITY_ONLINE
        } else {
            AVAILABILITY_OFFLINE
        };
        self.client
            .publish(&self.topics.availability, QoS::AtLeastOnce, true, payload)
            .await?;
        Ok(())
    }

    /// Follow the polling loop's updates until shutdown, then leave a clean
    /// offline marker behind.
    pub async fn run(
        self,
        mut updates: watch::Receiver<StateUpdate>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        debug!("state channel closed");
                        break;
                    }
                    let update = updates.borrow_and_update().clone();
                    let result = match &update {
                        StateUpdate::Online(snapshot) => {
                            match self.publish_availability(true).await {
                                Ok(()) => self.publish_state(snapshot).await,
                                Err(e) => Err(e),
                            }
                        }
                        StateUpdate::Offline => self.publish_availability(false).await,
                    };
                    if let Err(e) = result {
                        error!(error = %e, "state publish failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("mqtt publisher stopping");
                    break;
                }
            }
        }

        if let Err(e) = self.publish_availability(false).await {
            debug!(error = %e, "final offline publish failed");
        }
    }
}

async fn handle_event(
    event: Event,
    client: &AsyncClient,
    topics: &Topics,
    discovery: &[DiscoveryMessage],
    commands: &CommandSlot,
    updates: &watch::Receiver<StateUpdate>,
) {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => {
            info!("mqtt connected, announcing entities");
            if let Err(e) = client
                .subscribe(&topics.command, QoS::AtLeastOnce)
                .await
            {
                error!(error = %e, "command topic subscribe failed");
            }
            for message in discovery {
                if let Err(e) = client
                    .publish(&message.topic, QoS::AtLeastOnce, true, message.payload.clone())
                    .await
                {
                    error!(error = %e, topic = %message.topic, "discovery publish failed");
                }
            }
            // Replay the last known state so the session after a broker
            // outage does not stay silent until the next change.
            let latest = updates.borrow().clone();
            let replay = match &latest {
                StateUpdate::Online(snapshot) => {
                    let availability = client
                        .publish(
                            &topics.availability,
                            QoS::AtLeastOnce,
                            true,
                            AVAILABILITY_ONLINE,
                        )
                        .await;
                    match availability {
                        Ok(()) => {
                            client
                                .publish(
                                    &topics.state,
                                    QoS::AtLeastOnce,
                                    true,
                                    state_payload(snapshot),
                                )
                                .await
                        }
                        Err(e) => Err(e),
                    }
                }
                StateUpdate::Offline => {
                    client
                        .publish(
                            &topics.availability,
                            QoS::AtLeastOnce,
                            true,
                            AVAILABILITY_OFFLINE,
                        )
                        .await
                }
            };
            if let Err(e) = replay {
                error!(error = %e, "state replay after reconnect failed");
            }
        }
        Event::Incoming(Packet::Publish(publish)) => {
            if publish.topic != topics.command {
                return;
            }
            match parse_command(&publish.payload) {
                Ok(request) => {
                    info!(command = request.label(), "command received");
                    commands.replace(request).await;
                }
                Err(e) => warn!(error = %e, "rejected inbound command"),
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smsups_protocol::StatusFlags;

    #[test]
    fn test_parse_json_commands() {
        assert!(matches!(
            parse_command(br#"{"action":"toggle_beep"}"#),
            Ok(CommandRequest::ToggleBeep)
        ));
        assert!(matches!(
            parse_command(br#"{"action":"battery_test","seconds":30}"#),
            Ok(CommandRequest::StartBatteryTest { seconds: 30 })
        ));
        assert!(matches!(
            parse_command(br#"{"action":"battery_test"}"#),
            Ok(CommandRequest::StartBatteryTest { seconds: 10 })
        ));
        assert!(matches!(
            parse_command(br#"{"action":"battery_discharge"}"#),
            Ok(CommandRequest::StartBatteryDischarge)
        ));
        assert!(matches!(
            parse_command(br#"{"action":"cancel"}"#),
            Ok(CommandRequest::CancelOperation)
        ));
    }

    #[test]
    fn test_parse_shutdown_requires_delay() {
        let parsed = parse_command(br#"{"action":"shutdown_restore","delay_secs":120}"#).unwrap();
        assert_eq!(
            parsed,
            CommandRequest::ScheduleShutdown {
                delay: Duration::from_secs(120)
            }
        );
        assert!(matches!(
            parse_command(br#"{"action":"shutdown_restore"}"#),
            Err(CommandParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_single_letter_aliases() {
        assert!(matches!(
            parse_command(b"M"),
            Ok(CommandRequest::ToggleBeep)
        ));
        assert!(matches!(
            parse_command(b"t"),
            Ok(CommandRequest::StartBatteryTest { seconds: 10 })
        ));
        assert!(matches!(
            parse_command(b"C"),
            Ok(CommandRequest::CancelOperation)
        ));
        assert!(matches!(
            parse_command(b"R"),
            Err(CommandParseError::UnknownAction(_))
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_command(b""), Err(CommandParseError::Empty)));
        assert!(matches!(
            parse_command(b"   "),
            Err(CommandParseError::Empty)
        ));
        assert!(matches!(
            parse_command(b"not json"),
            Err(CommandParseError::Malformed(_))
        ));
        assert!(matches!(
            parse_command(br#"{"action":"reboot"}"#),
            Err(CommandParseError::UnknownAction(_))
        ));
        assert!(matches!(
            parse_command(&[0xFF, 0xFE]),
            Err(CommandParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_bounds() {
        assert!(matches!(
            parse_command(br#"{"action":"battery_test","seconds":0}"#),
            Err(CommandParseError::OutOfRange { field: "seconds", .. })
        ));
        assert!(matches!(
            parse_command(br#"{"action":"battery_test","seconds":70000}"#),
            Err(CommandParseError::OutOfRange { field: "seconds", .. })
        ));
        assert!(matches!(
            parse_command(br#"{"action":"shutdown_restore","delay_secs":7000}"#),
            Err(CommandParseError::OutOfRange {
                field: "delay_secs",
                ..
            })
        ));
    }

    #[test]
    fn test_state_payload_carries_fields_and_timestamp() {
        let snapshot = UpsStatusSnapshot {
            input_voltage: Some(219.7),
            output_voltage: Some(220.0),
            load_percent: Some(35.0),
            frequency: Some(60.0),
            battery_percent: Some(100.0),
            temperature: Some(25.0),
            flags: StatusFlags {
                on_battery: true,
                ..StatusFlags::default()
            },
        };
        let payload = state_payload(&snapshot);
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["output_voltage"], 220.0);
        assert_eq!(parsed["on_battery"], true);
        assert_eq!(parsed["beeper_enabled"], false);
        assert!(parsed["updated_at"].is_string());
    }
}
