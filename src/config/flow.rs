//! Flow configuration: triggers and actions as tagged unions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

fn default_log_level() -> String {
    "INFO".to_string()
}

/// Interval or cron specification for a `schedule` trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleSpec {
    Cron { cron: String },
    Interval(IntervalSpec),
}

/// An interval specifier map, mirroring `apscheduler`'s interval trigger
/// kwargs: any subset of `seconds`/`minutes`/`hours`/`days`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntervalSpec {
    #[serde(default)]
    pub seconds: u64,
    #[serde(default)]
    pub minutes: u64,
    #[serde(default)]
    pub hours: u64,
    #[serde(default)]
    pub days: u64,
}

impl IntervalSpec {
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.seconds + self.minutes * 60 + self.hours * 3600 + self.days * 86400,
        )
    }
}

/// A flow trigger, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FlowTriggerConfig {
    #[serde(rename = "schedule")]
    Schedule {
        #[serde(flatten)]
        schedule: ScheduleSpec,
    },
    #[serde(rename = "dbus_signal")]
    DbusSignal {
        interface: String,
        signal: String,
        #[serde(default)]
        bus_name: Option<String>,
        #[serde(default)]
        path: Option<String>,
    },
    #[serde(rename = "bus_name_added")]
    BusNameAdded,
    #[serde(rename = "bus_name_removed")]
    BusNameRemoved,
    #[serde(rename = "object_added")]
    ObjectAdded,
    #[serde(rename = "object_removed")]
    ObjectRemoved,
    #[serde(rename = "mqtt_message")]
    MqttMessage {
        topic: String,
        #[serde(default)]
        filter: Option<String>,
    },
}

impl FlowTriggerConfig {
    /// A short tag identifying this trigger's type, used for logging
    /// granularity (`schedule` logs at DEBUG, everything else at INFO).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Schedule { .. } => "schedule",
            Self::DbusSignal { .. } => "dbus_signal",
            Self::BusNameAdded => "bus_name_added",
            Self::BusNameRemoved => "bus_name_removed",
            Self::ObjectAdded => "object_added",
            Self::ObjectRemoved => "object_removed",
            Self::MqttMessage { .. } => "mqtt_message",
        }
    }
}

/// Serialization for `mqtt_publish` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadType {
    Json,
    Yaml,
    Text,
    Binary,
}

/// A flow action, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FlowActionConfig {
    #[serde(rename = "mqtt_publish")]
    MqttPublish {
        topic_template: String,
        payload_template: Value,
        #[serde(default = "default_payload_type")]
        payload_type: PayloadType,
    },
    #[serde(rename = "context_set")]
    ContextSet {
        #[serde(default)]
        global_context: HashMap<String, Value>,
        #[serde(default)]
        context: HashMap<String, Value>,
    },
    #[serde(rename = "log")]
    Log {
        message_template: String,
        #[serde(default = "default_log_level")]
        level: String,
    },
}

fn default_payload_type() -> PayloadType {
    PayloadType::Json
}

/// A named flow: a list of triggers and a list of actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default = "super::new_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub triggers: Vec<FlowTriggerConfig>,
    #[serde(default)]
    pub actions: Vec<FlowActionConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_schedule_trigger_interval() {
        let yaml = "type: schedule\nseconds: 30\n";
        let trigger: FlowTriggerConfig = serde_yaml::from_str(yaml).unwrap();
        match trigger {
            FlowTriggerConfig::Schedule { schedule: ScheduleSpec::Interval(i) } => {
                assert_eq!(i.seconds, 30);
            }
            other => panic!("unexpected trigger: {other:?}"),
        }
    }

    #[test]
    fn deserializes_schedule_trigger_cron() {
        let yaml = "type: schedule\ncron: \"0 * * * * *\"\n";
        let trigger: FlowTriggerConfig = serde_yaml::from_str(yaml).unwrap();
        match trigger {
            FlowTriggerConfig::Schedule { schedule: ScheduleSpec::Cron { cron } } => {
                assert_eq!(cron, "0 * * * * *");
            }
            other => panic!("unexpected trigger: {other:?}"),
        }
    }

    #[test]
    fn deserializes_dbus_signal_trigger() {
        let yaml = "type: dbus_signal\ninterface: org.mpris.MediaPlayer2.Player\nsignal: Seeked\n";
        let trigger: FlowTriggerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(trigger.kind(), "dbus_signal");
    }

    #[test]
    fn deserializes_mqtt_publish_action() {
        let yaml = "type: mqtt_publish\ntopic_template: dbus2mqtt/test\npayload_template:\n  test-key: test-value\n";
        let action: FlowActionConfig = serde_yaml::from_str(yaml).unwrap();
        match action {
            FlowActionConfig::MqttPublish { payload_type, .. } => assert_eq!(payload_type, PayloadType::Json),
            other => panic!("unexpected action: {other:?}"),
        }
    }
}
