//! Broker (MQTT) connection configuration.

use serde::{Deserialize, Serialize};

fn default_port() -> u16 {
    1883
}

fn default_subscription_topics() -> Vec<String> {
    vec!["dbus2mqtt/#".to_string()]
}

/// Connection details for the publish/subscribe broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_subscription_topics")]
    pub subscription_topics: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_port_and_subscription_topics() {
        let yaml = "host: localhost\n";
        let cfg: MqttConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.port, 1883);
        assert_eq!(cfg.subscription_topics, vec!["dbus2mqtt/#".to_string()]);
    }
}
