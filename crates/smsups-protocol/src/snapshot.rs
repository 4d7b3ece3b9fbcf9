//! Decoded UPS state.

use serde::Serialize;

const BIT_ON_BATTERY: u8 = 7;
const BIT_BATTERY_LOW: u8 = 6;
const BIT_BYPASS: u8 = 5;
const BIT_BOOST: u8 = 4;
const BIT_UPS_OK: u8 = 3;
const BIT_TEST_ACTIVE: u8 = 2;
const BIT_SHUTDOWN_ACTIVE: u8 = 1;
const BIT_BEEPER: u8 = 0;

/// Boolean status flags carried in byte 15 of the status frame.
///
/// The wire carries an "ups ok" bit; it is inverted here into `fault` so
/// downstream consumers never have to reason about negated semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusFlags {
    pub on_battery: bool,
    pub battery_low: bool,
    pub bypass: bool,
    pub boost: bool,
    pub fault: bool,
    pub test_active: bool,
    pub shutdown_active: bool,
    pub beeper_enabled: bool,
}

impl StatusFlags {
    /// Decode the flags byte.
    pub fn from_byte(raw: u8) -> Self {
        let bit = |n: u8| raw & (1 << n) != 0;
        StatusFlags {
            on_battery: bit(BIT_ON_BATTERY),
            battery_low: bit(BIT_BATTERY_LOW),
            bypass: bit(BIT_BYPASS),
            boost: bit(BIT_BOOST),
            fault: !bit(BIT_UPS_OK),
            test_active: bit(BIT_TEST_ACTIVE),
            shutdown_active: bit(BIT_SHUTDOWN_ACTIVE),
            beeper_enabled: bit(BIT_BEEPER),
        }
    }

    /// Re-encode to the wire representation.
    pub fn to_byte(self) -> u8 {
        let mut raw = 0u8;
        let mut set = |cond: bool, n: u8| {
            if cond {
                raw |= 1 << n;
            }
        };
        set(self.on_battery, BIT_ON_BATTERY);
        set(self.battery_low, BIT_BATTERY_LOW);
        set(self.bypass, BIT_BYPASS);
        set(self.boost, BIT_BOOST);
        set(!self.fault, BIT_UPS_OK);
        set(self.test_active, BIT_TEST_ACTIVE);
        set(self.shutdown_active, BIT_SHUTDOWN_ACTIVE);
        set(self.beeper_enabled, BIT_BEEPER);
        raw
    }

    /// Names of the raised flags, for the diagnostics text sensor.
    pub fn active_labels(&self) -> Vec<&'static str> {
        let mut labels = Vec::new();
        let mut push = |cond: bool, name: &'static str| {
            if cond {
                labels.push(name);
            }
        };
        push(self.on_battery, "on_battery");
        push(self.battery_low, "battery_low");
        push(self.bypass, "bypass");
        push(self.boost, "boost");
        push(self.fault, "fault");
        push(self.test_active, "test_active");
        push(self.shutdown_active, "shutdown_active");
        push(self.beeper_enabled, "beeper_enabled");
        labels
    }

    /// Human-readable flag summary.
    pub fn summary(&self) -> String {
        let labels = self.active_labels();
        if labels.is_empty() {
            "none".to_string()
        } else {
            labels.join(", ")
        }
    }
}

/// One decoded poll cycle.
///
/// Numeric fields are `None` only when the value is explicitly unavailable;
/// a successful decode always fills every field. Snapshots are immutable and
/// live for one cycle, except for the copy kept to suppress redundant
/// publishes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpsStatusSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_voltage: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_voltage: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(flatten)]
    pub flags: StatusFlags,
}

impl UpsStatusSnapshot {
    /// True when any numeric field moved by more than `epsilon`, a field
    /// appeared or vanished, or any flag changed.
    pub fn differs_from(&self, other: &UpsStatusSnapshot, epsilon: f32) -> bool {
        fn moved(a: Option<f32>, b: Option<f32>, epsilon: f32) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => (a - b).abs() > epsilon,
                (None, None) => false,
                _ => true,
            }
        }

        moved(self.input_voltage, other.input_voltage, epsilon)
            || moved(self.output_voltage, other.output_voltage, epsilon)
            || moved(self.load_percent, other.load_percent, epsilon)
            || moved(self.frequency, other.frequency, epsilon)
            || moved(self.battery_percent, other.battery_percent, epsilon)
            || moved(self.temperature, other.temperature, epsilon)
            || self.flags != other.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(vin: f32, flags: StatusFlags) -> UpsStatusSnapshot {
        UpsStatusSnapshot {
            input_voltage: Some(vin),
            output_voltage: Some(220.0),
            load_percent: Some(35.0),
            frequency: Some(60.0),
            battery_percent: Some(100.0),
            temperature: Some(25.0),
            flags,
        }
    }

    #[test]
    fn test_flags_byte_roundtrip() {
        for raw in [0x00u8, 0x09, 0xC1, 0xFF, 0b1010_1010] {
            assert_eq!(StatusFlags::from_byte(raw).to_byte(), raw);
        }
    }

    #[test]
    fn test_fault_is_inverted_ups_ok() {
        assert!(!StatusFlags::from_byte(1 << 3).fault);
        assert!(StatusFlags::from_byte(0).fault);
    }

    #[test]
    fn test_summary_lists_raised_flags() {
        let flags = StatusFlags::from_byte(0b1000_1001);
        assert_eq!(flags.summary(), "on_battery, beeper_enabled");
        assert_eq!(StatusFlags::from_byte(1 << 3).summary(), "none");
    }

    #[test]
    fn test_differs_respects_epsilon() {
        let flags = StatusFlags::from_byte(0x09);
        let a = snapshot(220.0, flags);
        let b = snapshot(220.3, flags);
        assert!(!a.differs_from(&b, 0.5));
        assert!(a.differs_from(&b, 0.1));
    }

    #[test]
    fn test_differs_on_flag_change() {
        let a = snapshot(220.0, StatusFlags::from_byte(0x09));
        let b = snapshot(220.0, StatusFlags::from_byte(0x08));
        assert!(a.differs_from(&b, 1.0));
    }

    #[test]
    fn test_state_payload_shape() {
        let snap = snapshot(220.0, StatusFlags::from_byte(0x09));
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["input_voltage"], 220.0);
        assert_eq!(json["beeper_enabled"], true);
        assert_eq!(json["on_battery"], false);
    }
}
