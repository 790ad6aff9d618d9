//! D-Bus side of the configuration tree: subscriptions, interfaces, signals.

use std::fmt;

use glob::Pattern;
use serde::{Deserialize, Serialize};

use super::flow::FlowConfig;

/// Which bus to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BusType {
    Session,
    System,
}

impl Default for BusType {
    fn default() -> Self {
        Self::Session
    }
}

/// A single watched signal on an interface, with an optional boolean filter
/// expression evaluated against `{ args: [...] }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    pub signal: String,
    #[serde(default)]
    pub filter: Option<String>,
}

/// An invokable method, named exactly as it appears on the bus interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodConfig {
    pub method: String,
}

/// A readable/writable property, named exactly as it appears on the bus
/// interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyConfig {
    pub property: String,
}

/// Configuration for a single D-Bus interface within a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub interface: String,
    #[serde(default)]
    pub mqtt_command_topic: Option<String>,
    #[serde(default)]
    pub mqtt_response_topic: Option<String>,
    #[serde(default)]
    pub signals: Vec<SignalConfig>,
    #[serde(default)]
    pub methods: Vec<MethodConfig>,
    #[serde(default)]
    pub properties: Vec<PropertyConfig>,
}

impl InterfaceConfig {
    /// Looks up a configured signal by its D-Bus name.
    pub fn signal(&self, name: &str) -> Option<&SignalConfig> {
        self.signals.iter().find(|s| s.signal == name)
    }

    /// Whether `method` is listed as invokable on this interface.
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.method == method)
    }

    /// Whether `property` is listed as settable on this interface.
    pub fn has_property(&self, property: &str) -> bool {
        self.properties.iter().any(|p| p.property == property)
    }
}

fn glob_matches(pattern: &str, candidate: &str) -> bool {
    Pattern::new(pattern).map(|p| p.matches(candidate)).unwrap_or(false)
}

/// A configured subscription: a glob over bus names and object paths, the
/// interfaces to watch there, and the flows attached to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub bus_name: String,
    pub path: String,
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
    #[serde(default)]
    pub flows: Vec<FlowConfig>,
    #[serde(default = "super::new_id")]
    pub id: String,
}

impl SubscriptionConfig {
    pub fn bus_name_matches(&self, bus_name: &str) -> bool {
        glob_matches(&self.bus_name, bus_name)
    }

    pub fn path_matches(&self, path: &str) -> bool {
        path == self.path || glob_matches(&self.path, path)
    }
}

impl fmt::Display for SubscriptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.bus_name, self.path)
    }
}

/// Top-level D-Bus configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbusConfig {
    #[serde(default)]
    pub bus_type: BusType,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

impl DbusConfig {
    /// Whether any configured subscription's bus-name glob matches `bus_name`.
    pub fn is_bus_name_configured(&self, bus_name: &str) -> bool {
        self.subscriptions.iter().any(|s| s.bus_name_matches(bus_name))
    }

    /// All subscription configs whose bus-name (and, if given, path) glob
    /// matches.
    pub fn subscription_configs(&self, bus_name: &str, path: Option<&str>) -> Vec<&SubscriptionConfig> {
        self.subscriptions
            .iter()
            .filter(|s| s.bus_name_matches(bus_name) && path.map(|p| s.path_matches(p)).unwrap_or(true))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(bus_name: &str, path: &str) -> SubscriptionConfig {
        SubscriptionConfig {
            bus_name: bus_name.into(),
            path: path.into(),
            interfaces: vec![],
            flows: vec![],
            id: "id".into(),
        }
    }

    #[test]
    fn bus_name_glob_matches() {
        let s = sub("org.mpris.MediaPlayer2.*", "/org/mpris/MediaPlayer2");
        assert!(s.bus_name_matches("org.mpris.MediaPlayer2.vlc"));
        assert!(!s.bus_name_matches("org.mpris.OtherThing"));
    }

    #[test]
    fn subscription_configs_filters_by_bus_name_and_path() {
        let cfg = DbusConfig {
            bus_type: BusType::Session,
            subscriptions: vec![sub("org.mpris.MediaPlayer2.*", "/org/mpris/MediaPlayer2")],
        };
        assert_eq!(cfg.subscription_configs("org.mpris.MediaPlayer2.vlc", None).len(), 1);
        assert_eq!(
            cfg.subscription_configs("org.mpris.MediaPlayer2.vlc", Some("/org/mpris/MediaPlayer2")).len(),
            1
        );
        assert_eq!(cfg.subscription_configs("org.mpris.MediaPlayer2.vlc", Some("/other")).len(), 0);
    }
}
