//! Custom YAML scalar handling.
//!
//! `serde_yaml`'s default resolver follows the YAML 1.1 core schema, which
//! treats barewords like `on`, `Off`, `yes`, `TRUE`, ... as booleans. This
//! bridge's configuration uses such words as literal strings (property
//! names, enum-ish values) and also lets operators drop Jinja-style
//! expressions straight into scalar position (`{{ subscription_bus_name }}`,
//! `{% if ... %}`), which a generic YAML parser would otherwise choke on or
//! silently reinterpret. `load_str` re-quotes both cases before handing the
//! document to `serde_yaml`.

use lazy_static::lazy_static;
use regex::Regex;

/// Tokens the YAML 1.1 core schema resolves to bool/null that this format
/// treats as plain strings instead.
const LITERAL_TOKENS: &[&str] = &[
    "y", "Y", "yes", "Yes", "YES", "n", "N", "no", "No", "NO", "true", "True", "TRUE", "false",
    "False", "FALSE", "on", "On", "ON", "off", "Off", "OFF", "null", "Null", "NULL", "~",
];

lazy_static! {
    static ref VALUE_LINE: Regex =
        Regex::new(r"^(?P<prefix>\s*(?:-\s+)?(?:[^:#'\x22]+:\s+)?)(?P<value>\S.*?)\s*$").unwrap();
}

fn needs_quoting(value: &str) -> bool {
    if value.starts_with('"') || value.starts_with('\'') || value.starts_with('{') || value.starts_with('[') {
        // Already quoted, or a flow collection we should leave alone.
        return value.starts_with("{{") || value.starts_with("{%");
    }
    LITERAL_TOKENS.iter().any(|tok| *tok == value) || value.starts_with("{{") || value.starts_with("{%")
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Re-quotes bareword boolean/null literals and Jinja-style scalar values in
/// a raw YAML document so that `serde_yaml` preserves them as strings.
pub fn preprocess(source: &str) -> String {
    source
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with('#') || trimmed.is_empty() {
                return line.to_string();
            }
            match VALUE_LINE.captures(line) {
                Some(caps) => {
                    let prefix = caps.name("prefix").map(|m| m.as_str()).unwrap_or("");
                    let value = caps.name("value").map(|m| m.as_str()).unwrap_or("");
                    if needs_quoting(value) {
                        format!("{prefix}{}", quote(value))
                    } else {
                        line.to_string()
                    }
                }
                None => line.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Merges `overlay` on top of `base`, replacing top-level map keys present
/// in `overlay` wholesale (matching the "later `--config` wins" semantics).
pub fn merge_top_level(base: serde_yaml::Value, overlay: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value;
    match (base, overlay) {
        (Value::Mapping(mut base_map), Value::Mapping(overlay_map)) => {
            for (k, v) in overlay_map {
                base_map.insert(k, v);
            }
            Value::Mapping(base_map)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_bareword_booleans() {
        let src = "enabled: Off\nname: foo\n";
        let out = preprocess(src);
        assert!(out.contains("enabled: \"Off\""));
        assert!(out.contains("name: foo"));
    }

    #[test]
    fn quotes_template_markers() {
        let src = "mqtt_command_topic: {{ subscription_bus_name }}\n";
        let out = preprocess(src);
        assert!(out.contains("\"{{ subscription_bus_name }}\""));
    }

    #[test]
    fn leaves_already_quoted_alone() {
        let src = "topic: \"dbus2mqtt/test\"\n";
        let out = preprocess(src);
        assert_eq!(out.trim(), src.trim());
    }

    #[test]
    fn merge_overrides_top_level_keys() {
        let base: serde_yaml::Value = serde_yaml::from_str("mqtt:\n  host: a\nflows: []\n").unwrap();
        let overlay: serde_yaml::Value = serde_yaml::from_str("mqtt:\n  host: b\n").unwrap();
        let merged = merge_top_level(base, overlay);
        let host = merged.get("mqtt").unwrap().get("host").unwrap().as_str().unwrap();
        assert_eq!(host, "b");
        assert!(merged.get("flows").is_some());
    }
}
