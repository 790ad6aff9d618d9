//! Conversion between `dbus::arg::RefArg` and the portable value model, plus
//! the MQTT-argument-list → D-Bus-call-argument-list converter.

use std::collections::{BTreeMap, HashMap};

use dbus::arg::{ArgType, RefArg, Variant};
use serde_json::Value as Json;

use super::signature::split_top_level;
use crate::error::{Error, ErrorKind, Result};
use crate::value::Value;

/// Reduces a bus-returned value to the portable value model (see
/// [`crate::value::Value`]). Byte arrays are base64-encoded.
pub fn unwrap_refarg(value: &dyn RefArg) -> Value {
    match value.arg_type() {
        ArgType::Boolean => Value::Bool(value.as_i64().map(|i| i != 0).unwrap_or(false)),
        ArgType::Byte
        | ArgType::Int16
        | ArgType::UInt16
        | ArgType::Int32
        | ArgType::UInt32
        | ArgType::Int64
        | ArgType::UInt64 => Value::Int(value.as_i64().unwrap_or_default()),
        ArgType::Double => Value::Float(value.as_f64().unwrap_or_default()),
        ArgType::String | ArgType::ObjectPath | ArgType::Signature => {
            Value::String(value.as_str().unwrap_or_default().to_string())
        }
        ArgType::Variant => {
            value.as_iter().and_then(|mut it| it.next()).map(unwrap_refarg).unwrap_or(Value::Null)
        }
        ArgType::Array => unwrap_array(value),
        ArgType::Struct => {
            Value::Array(value.as_iter().map(|it| it.map(unwrap_refarg).collect()).unwrap_or_default())
        }
        ArgType::DictEntry | ArgType::Invalid | ArgType::UnixFd => Value::Null,
    }
}

fn unwrap_array(value: &dyn RefArg) -> Value {
    let sig = value.signature().to_string();
    let items: Vec<&dyn RefArg> = match value.as_iter() {
        Some(it) => it.collect(),
        None => return Value::Array(Vec::new()),
    };

    if sig == "ay" {
        let bytes: Vec<u8> = items.iter().filter_map(|i| i.as_i64()).map(|i| i as u8).collect();
        return Value::from_bytes(&bytes);
    }

    if !items.is_empty() && items.iter().all(|i| i.arg_type() == ArgType::DictEntry) {
        let mut map = BTreeMap::new();
        for entry in items {
            if let Some(mut kv) = entry.as_iter() {
                if let (Some(k), Some(v)) = (kv.next(), kv.next()) {
                    let key = k.as_str().map(str::to_string).unwrap_or_else(|| format!("{:?}", unwrap_refarg(k)));
                    map.insert(key, unwrap_refarg(v));
                }
            }
        }
        return Value::Map(map);
    }

    Value::Array(items.into_iter().map(unwrap_refarg).collect())
}

fn type_err(sig: &str, json: &Json) -> Error {
    Error::with_message(ErrorKind::Internal("argument type mismatch".into()), format!("expected {sig}, got {json}"))
}

/// Infers a primitive D-Bus signature for a JSON scalar/container and wraps
/// it as a variant: bool→b, sized ints→q/n/u/i/t/x by range, float→d,
/// string→s, list→array of variants, map→`a{sv}`.
fn infer_and_wrap(json: &Json) -> Variant<Box<dyn RefArg>> {
    Variant(infer_raw(json))
}

fn infer_raw(json: &Json) -> Box<dyn RefArg> {
    match json {
        Json::Null => Box::new(String::new()),
        Json::Bool(b) => Box::new(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                infer_int(i, n.as_u64())
            } else {
                Box::new(n.as_f64().unwrap_or_default())
            }
        }
        Json::String(s) => Box::new(s.clone()),
        Json::Array(items) => {
            let converted: Vec<Variant<Box<dyn RefArg>>> = items.iter().map(infer_and_wrap).collect();
            Box::new(converted)
        }
        Json::Object(map) => {
            let converted: HashMap<String, Variant<Box<dyn RefArg>>> =
                map.iter().map(|(k, v)| (k.clone(), infer_and_wrap(v))).collect();
            Box::new(converted)
        }
    }
}

fn infer_int(signed: i64, unsigned: Option<u64>) -> Box<dyn RefArg> {
    if signed >= 0 {
        let u = unsigned.unwrap_or(signed as u64);
        if u <= u16::MAX as u64 {
            Box::new(u as u16)
        } else if u <= u32::MAX as u64 {
            Box::new(u as u32)
        } else {
            Box::new(u)
        }
    } else if signed >= i16::MIN as i64 {
        Box::new(signed as i16)
    } else if signed >= i32::MIN as i64 {
        Box::new(signed as i32)
    } else {
        Box::new(signed)
    }
}

fn convert_array(element_sig: &str, json: &Json) -> Result<Box<dyn RefArg>> {
    let items = json.as_array().ok_or_else(|| type_err(&format!("a{element_sig}"), json))?;
    let converted: Vec<Box<dyn RefArg>> =
        items.iter().map(|item| convert_value(element_sig, item)).collect::<Result<_>>()?;
    Ok(Box::new(converted))
}

fn convert_dict_sv(json: &Json) -> Result<Box<dyn RefArg>> {
    let obj = json.as_object().ok_or_else(|| type_err("a{sv}", json))?;
    let map: HashMap<String, Variant<Box<dyn RefArg>>> =
        obj.iter().map(|(k, v)| (k.clone(), infer_and_wrap(v))).collect();
    Ok(Box::new(map))
}

fn convert_value(sig: &str, json: &Json) -> Result<Box<dyn RefArg>> {
    match sig {
        "b" => Ok(Box::new(json.as_bool().ok_or_else(|| type_err(sig, json))?)),
        "y" => Ok(Box::new(json.as_u64().ok_or_else(|| type_err(sig, json))? as u8)),
        "n" => Ok(Box::new(json.as_i64().ok_or_else(|| type_err(sig, json))? as i16)),
        "q" => Ok(Box::new(json.as_u64().ok_or_else(|| type_err(sig, json))? as u16)),
        "i" => Ok(Box::new(json.as_i64().ok_or_else(|| type_err(sig, json))? as i32)),
        "u" => Ok(Box::new(json.as_u64().ok_or_else(|| type_err(sig, json))? as u32)),
        "x" => Ok(Box::new(json.as_i64().ok_or_else(|| type_err(sig, json))?)),
        "t" => Ok(Box::new(json.as_u64().ok_or_else(|| type_err(sig, json))?)),
        "d" => Ok(Box::new(json.as_f64().ok_or_else(|| type_err(sig, json))?)),
        "s" | "o" | "g" => Ok(Box::new(json.as_str().ok_or_else(|| type_err(sig, json))?.to_string())),
        "v" => Ok(Box::new(infer_and_wrap(json))),
        "a{sv}" => convert_dict_sv(json),
        _ if sig.starts_with('a') => convert_array(&sig[1..], json),
        _ => Err(Error::with_message(ErrorKind::Internal("unsupported signature".into()), sig.to_string())),
    }
}

/// Converts an MQTT-originated argument list into D-Bus call arguments
/// matching `dbus_signature`, one complete type per argument.
pub fn convert_mqtt_args_to_dbus(dbus_signature: &str, args: &[Json]) -> Result<Vec<Box<dyn RefArg>>> {
    let parts = split_top_level(dbus_signature);
    if parts.len() != args.len() {
        return Err(Error::with_message(
            ErrorKind::Internal("signature arity mismatch".into()),
            format!("signature {dbus_signature} expects {} args, got {}", parts.len(), args.len()),
        ));
    }
    parts.iter().zip(args.iter()).map(|(sig, json)| convert_value(sig, json)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_scenario_six_signature() {
        let args = vec![
            Json::String("dbus2mqtt".into()),
            Json::from(0),
            Json::String("dialog-information".into()),
            Json::String("dbus2mqtt".into()),
            Json::String("body".into()),
            Json::Array(vec![]),
            serde_json::json!({"urgency": 1, "category": "device"}),
            Json::from(5000),
        ];
        let converted = convert_mqtt_args_to_dbus("susssasa{sv}i", &args).unwrap();
        assert_eq!(converted.len(), 8);
        assert_eq!(converted[0].as_str(), Some("dbus2mqtt"));
        assert_eq!(converted[7].as_i64(), Some(5000));
    }

    #[test]
    fn rejects_arity_mismatch() {
        let err = convert_mqtt_args_to_dbus("ss", &[Json::String("only-one".into())]).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Internal(_)));
    }
}
