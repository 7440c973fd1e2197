//! Group pub/sub wire format
//!
//! Fragments travel as camelCase JSON. Inbound payloads are matched
//! case-insensitively so publishers that serialize with a different naming
//! policy (`BubbleId`, `bubbleid`) still decode.

use serde_json::{Map, Value};

use parley_core::MessageFragment;

/// Every field name appearing in a fragment and its nested structures
const KNOWN_FIELDS: &[&str] = &[
    "bubbleId",
    "user",
    "message",
    "type",
    "pendingFunctionCall",
    "toolUpdate",
    "id",
    "pluginName",
    "functionName",
    "args",
    "createdAt",
    "functionArgs",
    "result",
    "elicitation",
    "fields",
];

/// Fields whose contents are caller data and keep their keys verbatim
const OPAQUE_FIELDS: &[&str] = &["args", "functionArgs", "result", "fields"];

/// Decode a payload, matching field names case-insensitively
pub fn decode(payload: &str) -> serde_json::Result<MessageFragment> {
    let value: Value = serde_json::from_str(payload)?;
    serde_json::from_value(canonicalize(value))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut out = Map::with_capacity(object.len());
            for (key, inner) in object {
                let canonical = KNOWN_FIELDS
                    .iter()
                    .find(|known| known.eq_ignore_ascii_case(&key))
                    .copied();
                match canonical {
                    Some(name) if OPAQUE_FIELDS.contains(&name) => {
                        out.insert(name.to_string(), inner);
                    }
                    Some(name) => {
                        out.insert(name.to_string(), canonicalize(inner));
                    }
                    None => {
                        out.insert(key, canonicalize(inner));
                    }
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
