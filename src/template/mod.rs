//! Template Engine: renders string and dict templates, synchronously or
//! suspended on bus-side lookups.

pub mod functions;

use std::sync::{Arc, OnceLock};

use minijinja::value::Value as MiniValue;
use minijinja::{Environment, UndefinedBehavior};
use regex::Regex;
use serde_json::Value as Json;

use crate::error::{Error, ErrorKind, Result};
use functions::BusFunctionsHandle;

/// The type a render call is required to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Bool,
    String,
    Dict,
    Any,
}

/// A template: either a single string (a literal, an embedded-expression
/// string, or a standalone `{{ expr }}`) or a map whose string leaves are
/// templates in their own right.
#[derive(Debug, Clone)]
pub enum Template {
    Str(String),
    Value(Json),
}

impl From<&str> for Template {
    fn from(s: &str) -> Self {
        Template::Str(s.to_string())
    }
}

impl From<String> for Template {
    fn from(s: String) -> Self {
        Template::Str(s)
    }
}

impl From<Json> for Template {
    fn from(v: Json) -> Self {
        match v {
            Json::String(s) => Template::Str(s),
            other => Template::Value(other),
        }
    }
}

fn bare_expression_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\{\{\s*(?P<expr>.*?)\s*\}\}$").unwrap())
}

fn minijinja_error(err: Error) -> minijinja::Error {
    minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, err.to_string())
}

fn new_environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_function("now", || -> std::result::Result<MiniValue, minijinja::Error> {
        Ok(MiniValue::from(chrono::Utc::now().to_rfc3339()))
    });
    env
}

/// Renders templates against a context map. Holds two environments: a
/// plain one with only `now`, and a "suspendable" one that also exposes the
/// `dbus_*` globals — those block the calling (blocking-pool) thread on a
/// round trip to the bus, so they must never be used from the main loop.
pub struct TemplateEngine {
    sync_env: Environment<'static>,
    suspendable_env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self { sync_env: new_environment(), suspendable_env: new_environment() }
    }

    /// Registers the bus-side globals (`dbus_list`, `dbus_call`,
    /// `dbus_property_get`) on the suspendable environment only.
    pub fn register_bus_functions(&mut self, handle: BusFunctionsHandle) {
        let h = handle.clone();
        self.suspendable_env.add_function(
            "dbus_list",
            move |name_pattern: String| -> std::result::Result<MiniValue, minijinja::Error> {
                let names = h.list(name_pattern).map_err(minijinja_error)?;
                Ok(MiniValue::from_serialize(&names))
            },
        );

        let h = handle.clone();
        self.suspendable_env.add_function(
            "dbus_call",
            move |bus_name: String, path: String, interface: String, method: String, args: MiniValue| -> std::result::Result<MiniValue, minijinja::Error> {
                let args_json: Json = serde_json::to_value(&args).map_err(|e| minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string()))?;
                let result = h.call(bus_name, path, interface, method, args_json).map_err(minijinja_error)?;
                Ok(MiniValue::from_serialize(&result))
            },
        );

        let h = handle;
        self.suspendable_env.add_function(
            "dbus_property_get",
            move |bus_name: String, path: String, interface: String, property: String, default_if_unsupported: MiniValue| -> std::result::Result<MiniValue, minijinja::Error> {
                let default_json: Json = serde_json::to_value(&default_if_unsupported).map_err(|e| minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string()))?;
                let result = h
                    .property_get(bus_name, path, interface, property, default_json)
                    .map_err(minijinja_error)?;
                Ok(MiniValue::from_serialize(&result))
            },
        );
    }

    /// Renders `template` against `context`, coercing the raw render result
    /// into `kind`.
    pub fn render(&self, template: &Template, kind: ResultKind, context: &Json) -> Result<Json> {
        self.render_with(&self.sync_env, template, kind, context)
    }

    /// Renders `template`, permitting bus-side globals. Must be called from
    /// a blocking-pool context (e.g. inside `tokio::task::spawn_blocking`);
    /// it will block the calling thread while a `dbus_*` global is
    /// in flight.
    pub fn render_suspendable(&self, template: &Template, kind: ResultKind, context: &Json) -> Result<Json> {
        self.render_with(&self.suspendable_env, template, kind, context)
    }

    /// Runs [`Self::render_suspendable`] on the blocking pool, so any
    /// `dbus_*` global it invokes blocks a pool thread rather than the
    /// event loop. The only render path flow actions and trigger filters
    /// should use, since those are the templates config is allowed to put
    /// bus-side globals into.
    pub async fn render_async(self: &Arc<Self>, template: Template, kind: ResultKind, context: Json) -> Result<Json> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.render_suspendable(&template, kind, &context)).await?
    }

    fn render_with(&self, env: &Environment<'static>, template: &Template, kind: ResultKind, context: &Json) -> Result<Json> {
        match template {
            Template::Str(s) => {
                let raw = render_string_raw(env, s, context)?;
                coerce(raw, kind)
            }
            Template::Value(value) => {
                if kind != ResultKind::Dict && kind != ResultKind::Any {
                    return Err(Error::with_message(
                        ErrorKind::Template,
                        "dict templates may not be coerced to a non-dict result type",
                    ));
                }
                render_dict_leaves(env, value, context)
            }
        }
    }
}

/// Renders a single string template, preserving the raw render's native
/// type when the whole template is one `{{ expr }}` block.
fn render_string_raw(env: &Environment<'static>, template: &str, context: &Json) -> Result<Json> {
    if template.is_empty() {
        return Ok(Json::Null);
    }
    if let Some(caps) = bare_expression_re().captures(template) {
        let expr = caps.name("expr").map(|m| m.as_str()).unwrap_or("");
        let compiled = env.compile_expression(expr)?;
        let value = compiled.eval(context)?;
        return Ok(serde_json::to_value(&value)?);
    }
    if !template.contains("{{") && !template.contains("{%") {
        return Ok(Json::String(template.to_string()));
    }
    let rendered = env.render_str(template, context)?;
    Ok(Json::String(rendered))
}

fn render_dict_leaves(env: &Environment<'static>, value: &Json, context: &Json) -> Result<Json> {
    match value {
        Json::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_dict_leaves(env, v, context)?);
            }
            Ok(Json::Object(out))
        }
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(render_dict_leaves(env, item, context)?);
            }
            Ok(Json::Array(out))
        }
        Json::String(s) => render_string_raw(env, s, context),
        other => Ok(other.clone()),
    }
}

fn to_display_string(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        Json::Bool(b) => b.to_string(),
        Json::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Applies the single conversion step from a raw render to the requested
/// result type.
fn coerce(raw: Json, kind: ResultKind) -> Result<Json> {
    if raw.is_null() {
        // `{{ None }}` always reduces to null, whatever the requested type.
        return Ok(Json::Null);
    }
    match kind {
        ResultKind::Any => Ok(raw),
        ResultKind::Bool => match raw {
            Json::Bool(_) => Ok(raw),
            Json::String(ref s) => match s.as_str() {
                "true" | "True" | "TRUE" | "1" => Ok(Json::Bool(true)),
                "false" | "False" | "FALSE" | "0" => Ok(Json::Bool(false)),
                _ => Err(Error::with_message(ErrorKind::Template, format!("cannot coerce '{s}' to bool"))),
            },
            other => Err(Error::with_message(ErrorKind::Template, format!("cannot coerce {other} to bool"))),
        },
        ResultKind::String => match raw {
            Json::String(_) => Ok(raw),
            other => Ok(Json::String(to_display_string(&other))),
        },
        ResultKind::Dict => match raw {
            Json::Object(_) => Ok(raw),
            Json::String(ref s) => serde_yaml::from_str::<Json>(s)
                .ok()
                .filter(Json::is_object)
                .ok_or_else(|| Error::with_message(ErrorKind::Template, "requesting dict from a non-dict template")),
            _ => Err(Error::with_message(ErrorKind::Template, "requesting dict from a non-dict template")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> TemplateEngine {
        TemplateEngine::new()
    }

    #[test]
    fn any_render_preserves_int_type() {
        let e = engine();
        let result = e.render(&Template::from("{{ 3 }}"), ResultKind::Any, &serde_json::json!({})).unwrap();
        assert_eq!(result, serde_json::json!(3));
    }

    #[test]
    fn string_render_stringifies_int() {
        let e = engine();
        let result = e.render(&Template::from("{{ 3 }}"), ResultKind::String, &serde_json::json!({})).unwrap();
        assert_eq!(result, serde_json::json!("3"));
    }

    #[test]
    fn none_renders_to_null_even_for_string() {
        let e = engine();
        let result =
            e.render(&Template::from("{{ none }}"), ResultKind::String, &serde_json::json!({})).unwrap();
        assert_eq!(result, Json::Null);
    }

    #[test]
    fn literal_without_markers_passes_through() {
        let e = engine();
        let result =
            e.render(&Template::from("dbus2mqtt/test"), ResultKind::Any, &serde_json::json!({})).unwrap();
        assert_eq!(result, serde_json::json!("dbus2mqtt/test"));
    }

    #[test]
    fn undefined_variable_is_a_distinct_error() {
        let e = engine();
        let err = e.render(&Template::from("{{ missing_var }}"), ResultKind::Any, &serde_json::json!({})).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UndefinedVariable(_)));
    }

    #[test]
    fn dict_template_renders_each_leaf_independently() {
        let e = engine();
        let template = Template::from(serde_json::json!({
            "test-key": "{{ value }}",
            "literal": "unchanged",
        }));
        let ctx = serde_json::json!({"value": "test-value"});
        let result = e.render(&template, ResultKind::Dict, &ctx).unwrap();
        assert_eq!(result["test-key"], serde_json::json!("test-value"));
        assert_eq!(result["literal"], serde_json::json!("unchanged"));
    }

    #[test]
    fn dict_template_cannot_be_coerced_to_string() {
        let e = engine();
        let template = Template::from(serde_json::json!({"k": "v"}));
        assert!(e.render(&template, ResultKind::String, &serde_json::json!({})).is_err());
    }

    #[test]
    fn requesting_dict_from_non_dict_template_fails() {
        let e = engine();
        let err = e.render(&Template::from("plain string"), ResultKind::Dict, &serde_json::json!({})).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Template));
    }
}
