//! Typed configuration tree, loaded from one or more YAML files and
//! overlaid with environment variables.

pub mod dbus;
pub mod flow;
pub mod mqtt;
mod yaml;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use dbus::DbusConfig;
use flow::FlowConfig;
use mqtt::MqttConfig;

/// Generates a random stable id for configuration records that don't carry
/// one explicitly (subscriptions, flows).
pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Root configuration tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub dbus: DbusConfig,
    #[serde(default)]
    pub flows: Vec<FlowConfig>,
}

impl Config {
    /// Loads and merges one or more YAML config files in the order given,
    /// later files overriding earlier ones at the top-level key, then
    /// applies the `DBUS2MQTT_`-prefixed environment variable overlay.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        if paths.is_empty() {
            return Err(Error::with_message(ErrorKind::Config("no config path given".into()), ""));
        }

        let mut merged: Option<serde_yaml::Value> = None;
        for path in paths {
            let path = path.as_ref();
            let raw = std::fs::read_to_string(path).map_err(|err| {
                Error::with_message(ErrorKind::Config(format!("reading {}", path.display())), err.to_string())
            })?;
            let preprocessed = yaml::preprocess(&raw);
            let doc: serde_yaml::Value = serde_yaml::from_str(&preprocessed).map_err(|err| {
                Error::with_message(ErrorKind::Config(format!("parsing {}", path.display())), err.to_string())
            })?;
            merged = Some(match merged {
                Some(base) => yaml::merge_top_level(base, doc),
                None => doc,
            });
        }

        let mut value = merged.expect("at least one path was provided");
        apply_env_overlay(&mut value, "DBUS2MQTT", std::env::vars());

        serde_yaml::from_value(value)
            .map_err(|err| Error::with_message(ErrorKind::Config("validating config".into()), err.to_string()))
    }
}

/// Overlays environment variables named `{prefix}__SECTION__KEY` onto the
/// parsed YAML tree, splitting on `__` to walk into nested mappings.
fn apply_env_overlay(value: &mut serde_yaml::Value, prefix: &str, vars: impl Iterator<Item = (String, String)>) {
    let env_prefix = format!("{prefix}__");
    for (key, val) in vars {
        let Some(path) = key.strip_prefix(&env_prefix) else { continue };
        let segments: Vec<String> = path.split("__").map(|s| s.to_lowercase()).collect();
        if segments.is_empty() {
            continue;
        }
        set_nested(value, &segments, val);
    }
}

fn set_nested(root: &mut serde_yaml::Value, segments: &[String], leaf: String) {
    use serde_yaml::{Mapping, Value};

    if !root.is_mapping() {
        *root = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(map) = root else { unreachable!() };

    let key = Value::String(segments[0].clone());
    if segments.len() == 1 {
        map.insert(key, Value::String(leaf));
        return;
    }
    let entry = map.entry(key).or_insert_with(|| Value::Mapping(Mapping::new()));
    set_nested(entry, &segments[1..], leaf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overlay_sets_nested_scalar() {
        let mut value: serde_yaml::Value = serde_yaml::from_str("mqtt:\n  host: original\n").unwrap();
        apply_env_overlay(
            &mut value,
            "DBUS2MQTT",
            std::iter::once(("DBUS2MQTT__MQTT__HOST".to_string(), "overridden".to_string())),
        );
        assert_eq!(value.get("mqtt").unwrap().get("host").unwrap().as_str().unwrap(), "overridden");
    }

    #[test]
    fn env_overlay_ignores_unrelated_vars() {
        let mut value: serde_yaml::Value = serde_yaml::from_str("mqtt:\n  host: original\n").unwrap();
        apply_env_overlay(&mut value, "DBUS2MQTT", std::iter::once(("PATH".to_string(), "/bin".to_string())));
        assert_eq!(value.get("mqtt").unwrap().get("host").unwrap().as_str().unwrap(), "original");
    }

    #[test]
    fn load_rejects_empty_path_list() {
        let paths: Vec<&str> = vec![];
        let err = Config::load(&paths).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Config(_)));
    }
}
