//! Home Assistant MQTT discovery.
//!
//! Builds the retained `config` payloads that make the UPS appear in Home
//! Assistant without manual YAML. All entities hang off one device block and
//! one JSON state topic; sensors pick their field out of the state payload
//! with a value template.

use serde::Serialize;
use serde_json::json;

use smsups_protocol::DeviceInfoFrame;

use crate::config::MqttConfig;

/// What the bridge knows about the hardware it fronts.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Stable identifier, used in unique IDs and the device registry.
    pub device_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub firmware: Option<String>,
}

impl DeviceIdentity {
    pub fn from_config(config: &MqttConfig) -> Self {
        Self {
            device_id: config.device_id.clone(),
            name: "SMS Gamer UPS".to_string(),
            manufacturer: "SMS".to_string(),
            model: "Gamer".to_string(),
            firmware: None,
        }
    }

    /// Fold in whatever the identification query returned. Missing pieces
    /// keep their configured defaults.
    pub fn enrich(&mut self, info: &DeviceInfoFrame) {
        if let Some(model) = &info.model {
            self.model = model.clone();
        }
        if info.firmware.is_some() {
            self.firmware = info.firmware.clone();
        }
    }
}

/// Every topic the bridge publishes or subscribes to, derived once from the
/// configured base so the discovery payloads and the runtime always agree.
#[derive(Debug, Clone)]
pub struct Topics {
    pub state: String,
    pub availability: String,
    pub command: String,
    discovery_prefix: String,
    device_id: String,
}

impl Topics {
    pub fn from_config(config: &MqttConfig) -> Self {
        let base = config.topic_base.trim_end_matches('/');
        Self {
            state: format!("{base}/state"),
            availability: format!("{base}/availability"),
            command: format!("{base}/command"),
            discovery_prefix: config.discovery_prefix.trim_end_matches('/').to_string(),
            device_id: config.device_id.clone(),
        }
    }

    /// Config topic for one entity, e.g.
    /// `homeassistant/sensor/smsups_gamer/input_voltage/config`.
    pub fn config_topic(&self, component: &str, object_id: &str) -> String {
        format!(
            "{}/{}/{}/{}/config",
            self.discovery_prefix, component, self.device_id, object_id
        )
    }
}

/// The `device` block shared by every entity, so Home Assistant groups them
/// under one device page.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceBlock {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
}

impl DeviceBlock {
    fn from_identity(identity: &DeviceIdentity) -> Self {
        Self {
            identifiers: vec![identity.device_id.clone()],
            name: identity.name.clone(),
            manufacturer: identity.manufacturer.clone(),
            model: identity.model.clone(),
            sw_version: identity.firmware.clone(),
        }
    }
}

/// One discovery announcement: a retained JSON payload on a config topic.
#[derive(Debug, Clone)]
pub struct DiscoveryMessage {
    pub topic: String,
    pub payload: String,
}

struct SensorSpec {
    object_id: &'static str,
    name: &'static str,
    device_class: Option<&'static str>,
    unit: Option<&'static str>,
    field: &'static str,
}

const SENSORS: &[SensorSpec] = &[
    SensorSpec {
        object_id: "input_voltage",
        name: "Input voltage",
        device_class: Some("voltage"),
        unit: Some("V"),
        field: "input_voltage",
    },
    SensorSpec {
        object_id: "output_voltage",
        name: "Output voltage",
        device_class: Some("voltage"),
        unit: Some("V"),
        field: "output_voltage",
    },
    SensorSpec {
        object_id: "load",
        name: "Load",
        device_class: None,
        unit: Some("%"),
        field: "load_percent",
    },
    SensorSpec {
        object_id: "frequency",
        name: "Output frequency",
        device_class: Some("frequency"),
        unit: Some("Hz"),
        field: "frequency",
    },
    SensorSpec {
        object_id: "battery",
        name: "Battery",
        device_class: Some("battery"),
        unit: Some("%"),
        field: "battery_percent",
    },
    SensorSpec {
        object_id: "temperature",
        name: "Temperature",
        device_class: Some("temperature"),
        unit: Some("\u{b0}C"),
        field: "temperature",
    },
];

struct BinarySensorSpec {
    object_id: &'static str,
    name: &'static str,
    device_class: Option<&'static str>,
    field: &'static str,
}

const BINARY_SENSORS: &[BinarySensorSpec] = &[
    BinarySensorSpec {
        object_id: "on_battery",
        name: "On battery",
        device_class: Some("power"),
        field: "on_battery",
    },
    BinarySensorSpec {
        object_id: "battery_low",
        name: "Battery low",
        device_class: Some("battery"),
        field: "battery_low",
    },
    BinarySensorSpec {
        object_id: "bypass",
        name: "Bypass active",
        device_class: None,
        field: "bypass",
    },
    BinarySensorSpec {
        object_id: "boost",
        name: "Voltage boost",
        device_class: None,
        field: "boost",
    },
    BinarySensorSpec {
        object_id: "fault",
        name: "Fault",
        device_class: Some("problem"),
        field: "fault",
    },
    BinarySensorSpec {
        object_id: "test_active",
        name: "Self test running",
        device_class: Some("running"),
        field: "test_active",
    },
    BinarySensorSpec {
        object_id: "shutdown_active",
        name: "Shutdown scheduled",
        device_class: None,
        field: "shutdown_active",
    },
];

struct ButtonSpec {
    object_id: &'static str,
    name: &'static str,
    /// Payload published to the command topic when pressed.
    press_payload: &'static str,
}

const BUTTONS: &[ButtonSpec] = &[
    ButtonSpec {
        object_id: "battery_test",
        name: "Battery test (10s)",
        press_payload: r#"{"action":"battery_test","seconds":10}"#,
    },
    ButtonSpec {
        object_id: "battery_discharge",
        name: "Discharge battery",
        press_payload: r#"{"action":"battery_discharge"}"#,
    },
    ButtonSpec {
        object_id: "cancel",
        name: "Cancel test/shutdown",
        press_payload: r#"{"action":"cancel"}"#,
    },
    ButtonSpec {
        object_id: "shutdown_restore",
        name: "Shutdown and restore (60s)",
        press_payload: r#"{"action":"shutdown_restore","delay_secs":60}"#,
    },
];

/// Build the full set of retained discovery announcements for this device.
pub fn discovery_messages(identity: &DeviceIdentity, topics: &Topics) -> Vec<DiscoveryMessage> {
    let device = DeviceBlock::from_identity(identity);
    let device_json = serde_json::to_value(&device).unwrap_or_default();
    let mut messages = Vec::new();

    for spec in SENSORS {
        let mut payload = json!({
            "name": spec.name,
            "unique_id": format!("{}_{}", identity.device_id, spec.object_id),
            "state_topic": topics.state,
            "availability_topic": topics.availability,
            "value_template": format!("{{{{ value_json.{} }}}}", spec.field),
            "state_class": "measurement",
            "device": device_json.clone(),
        });
        if let Some(class) = spec.device_class {
            payload["device_class"] = json!(class);
        }
        if let Some(unit) = spec.unit {
            payload["unit_of_measurement"] = json!(unit);
        }
        messages.push(DiscoveryMessage {
            topic: topics.config_topic("sensor", spec.object_id),
            payload: payload.to_string(),
        });
    }

    for spec in BINARY_SENSORS {
        let mut payload = json!({
            "name": spec.name,
            "unique_id": format!("{}_{}", identity.device_id, spec.object_id),
            "state_topic": topics.state,
            "availability_topic": topics.availability,
            "value_template": format!(
                "{{{{ 'ON' if value_json.{} else 'OFF' }}}}",
                spec.field
            ),
            "device": device_json.clone(),
        });
        if let Some(class) = spec.device_class {
            payload["device_class"] = json!(class);
        }
        messages.push(DiscoveryMessage {
            topic: topics.config_topic("binary_sensor", spec.object_id),
            payload: payload.to_string(),
        });
    }

    // Text sensor summarizing every raised flag, for dashboards and
    // automations that do not want eight separate binary sensors.
    let active_flags = json!({
        "name": "Active flags",
        "unique_id": format!("{}_active_flags", identity.device_id),
        "state_topic": topics.state,
        "availability_topic": topics.availability,
        "value_template": "{{ value_json.active_flags }}",
        "icon": "mdi:flag-outline",
        "device": device_json.clone(),
    });
    messages.push(DiscoveryMessage {
        topic: topics.config_topic("sensor", "active_flags"),
        payload: active_flags.to_string(),
    });

    // Beeper is the one writable toggle with readable state.
    let beeper = json!({
        "name": "Beeper",
        "unique_id": format!("{}_beeper", identity.device_id),
        "state_topic": topics.state,
        "availability_topic": topics.availability,
        "command_topic": topics.command,
        "value_template": "{{ 'ON' if value_json.beeper_enabled else 'OFF' }}",
        "payload_on": r#"{"action":"toggle_beep"}"#,
        "payload_off": r#"{"action":"toggle_beep"}"#,
        "icon": "mdi:volume-high",
        "device": device_json.clone(),
    });
    messages.push(DiscoveryMessage {
        topic: topics.config_topic("switch", "beeper"),
        payload: beeper.to_string(),
    });

    for spec in BUTTONS {
        let payload = json!({
            "name": spec.name,
            "unique_id": format!("{}_{}", identity.device_id, spec.object_id),
            "command_topic": topics.command,
            "availability_topic": topics.availability,
            "payload_press": spec.press_payload,
            "device": device_json.clone(),
        });
        messages.push(DiscoveryMessage {
            topic: topics.config_topic("button", spec.object_id),
            payload: payload.to_string(),
        });
    }

    messages
}
