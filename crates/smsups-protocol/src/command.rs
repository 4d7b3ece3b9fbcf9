//! Command and query requests accepted by the UPS.

use std::time::Duration;

/// Read-only query frames.
///
/// Queries are issued by the polling loop itself and are never exposed on
/// the MQTT command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    /// `Q`: current measurements and status flags.
    Status,
    /// `I`: model and firmware identification.
    DeviceInfo,
    /// `F`: rated features (nominal voltage, frequency).
    Features,
}

impl Query {
    pub(crate) fn command_byte(self) -> u8 {
        match self {
            Query::Status => 0x51,
            Query::DeviceInfo => 0x49,
            Query::Features => 0x46,
        }
    }
}

/// A control action requested over MQTT.
///
/// A request is serviced at most once and never queued: the bridge keeps a
/// single pending slot where a newer request overwrites an unserviced one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRequest {
    /// `M`: flip the audible alarm on or off.
    ToggleBeep,
    /// `T`: run a timed battery self-test.
    StartBatteryTest { seconds: u16 },
    /// `D`: discharge the battery until the UPS decides to stop.
    StartBatteryDischarge,
    /// `C`: cancel whatever test or shutdown is in flight.
    CancelOperation,
    /// `R`: cut output after `delay`, restoring power automatically.
    ScheduleShutdown { delay: Duration },
}

impl CommandRequest {
    /// Short name used in log lines and command history.
    pub fn label(&self) -> &'static str {
        match self {
            CommandRequest::ToggleBeep => "toggle_beep",
            CommandRequest::StartBatteryTest { .. } => "battery_test",
            CommandRequest::StartBatteryDischarge => "battery_discharge",
            CommandRequest::CancelOperation => "cancel",
            CommandRequest::ScheduleShutdown { .. } => "shutdown_restore",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_labels() {
        assert_eq!(CommandRequest::ToggleBeep.label(), "toggle_beep");
        assert_eq!(
            CommandRequest::StartBatteryTest { seconds: 16 }.label(),
            "battery_test"
        );
    }

    #[test]
    fn test_query_bytes() {
        assert_eq!(Query::Status.command_byte(), b'Q');
        assert_eq!(Query::DeviceInfo.command_byte(), b'I');
        assert_eq!(Query::Features.command_byte(), b'F');
    }
}
