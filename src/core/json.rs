//! JSON representation of tuples, one object per line in the CLI.
//!
//! ```text
//! {"item": "...", "property": "...", "context": "...", "time": 1700000000, "seqNr": 0, "value": 21.5}
//! ```
//!
//! `context` defaults to [`DEFAULT_CONTEXT`] and `seqNr` to 0. Values map as
//! integers to `Long`, other numbers to `Double`, `{"@id": uri}` to `Uri` and
//! a single-key object `{property: value}` to a `Record`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number};

use crate::core::{Record, Tuple, Value, DEFAULT_CONTEXT};
use crate::error::{Error, Result};

const ID_KEY: &str = "@id";

#[derive(Debug, Serialize, Deserialize)]
struct JsonTuple {
    item: String,
    property: String,
    #[serde(default = "default_context")]
    context: String,
    time: i64,
    #[serde(rename = "seqNr", default)]
    seq_nr: i32,
    value: serde_json::Value,
}

fn default_context() -> String {
    DEFAULT_CONTEXT.to_string()
}

pub fn parse_tuple(line: &str) -> Result<Tuple> {
    let raw: JsonTuple = serde_json::from_str(line)?;
    Ok(Tuple {
        item: raw.item,
        property: raw.property,
        context: raw.context,
        time: raw.time,
        seq_nr: raw.seq_nr,
        value: value_from_json(raw.value)?,
    })
}

pub fn format_tuple(tuple: &Tuple) -> Result<String> {
    let raw = JsonTuple {
        item: tuple.item.clone(),
        property: tuple.property.clone(),
        context: tuple.context.clone(),
        time: tuple.time,
        seq_nr: tuple.seq_nr,
        value: value_to_json(&tuple.value),
    };
    Ok(serde_json::to_string(&raw)?)
}

pub fn value_from_json(json: serde_json::Value) -> Result<Value> {
    // record chains are unwound iteratively
    let mut links = Vec::new();
    let mut current = json;
    let leaf = loop {
        match current {
            serde_json::Value::Number(n) => {
                break match n.as_i64() {
                    Some(v) => Value::Long(v),
                    None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
                }
            }
            serde_json::Value::String(s) => break Value::Str(s),
            serde_json::Value::Bool(b) => break Value::Bool(b),
            serde_json::Value::Object(map) if map.len() == 1 => {
                let Some((key, inner)) = map.into_iter().next() else {
                    return Err(Error::InvalidArgument("empty object value".to_string()));
                };
                if key == ID_KEY {
                    match inner {
                        serde_json::Value::String(uri) => break Value::Uri(uri),
                        _ => return Err(Error::InvalidArgument("\"@id\" must be a string".to_string())),
                    }
                }
                links.push(key);
                current = inner;
            }
            other => return Err(Error::InvalidArgument(format!("unsupported JSON value: {}", other))),
        }
    };

    let mut value = leaf;
    while let Some(property) = links.pop() {
        value = Value::Record(Record { property, value: Box::new(value) });
    }
    Ok(value)
}

pub fn value_to_json(value: &Value) -> serde_json::Value {
    let mut properties = Vec::new();
    let mut current = value;
    while let Value::Record(record) = current {
        properties.push(record.property.clone());
        current = &record.value;
    }
    let mut json = match current {
        Value::Int(v) => serde_json::Value::from(*v),
        Value::Long(v) => serde_json::Value::from(*v),
        Value::Short(v) => serde_json::Value::from(*v),
        Value::Float(v) => Number::from_f64(f64::from(*v)).map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::Double(v) => Number::from_f64(*v).map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Uri(uri) => single(ID_KEY.to_string(), serde_json::Value::String(uri.clone())),
        Value::BigInt(v) => serde_json::Value::String(v.to_string()),
        Value::BigDecimal(v) => serde_json::Value::String(v.to_string()),
        Value::Record(_) => serde_json::Value::Null,
    };
    while let Some(property) = properties.pop() {
        json = single(property, json);
    }
    json
}

fn single(key: String, value: serde_json::Value) -> serde_json::Value {
    let mut map = Map::new();
    map.insert(key, value);
    serde_json::Value::Object(map)
}
