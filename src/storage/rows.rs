//! Row layouts persisted in data and mapping files

use serde::{Deserialize, Serialize};

use crate::core::encoding::{decode_key, KEY_COLUMN, KEY_SIZE, TIME_COLUMN};
use crate::core::{values, Value};
use crate::error::Result;
use crate::storage::table::{Field, TableRow};

/// Internal storage row with encoded ids.
///
/// Exactly one of the value columns is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TupleRow {
    pub key: [u8; KEY_SIZE],
    pub time: i64,
    pub seq_nr: i32,
    pub value_int: Option<i32>,
    pub value_long: Option<i64>,
    pub value_float: Option<f32>,
    pub value_double: Option<f64>,
    pub value_string: Option<String>,
    /// 0 or 1
    pub value_bool: Option<i32>,
    pub value_object: Option<Vec<u8>>,
}

impl TupleRow {
    /// Builds a row, routing the value to its native column or the value codec.
    pub fn new(key: [u8; KEY_SIZE], time: i64, seq_nr: i32, value: &Value) -> Result<Self> {
        let mut row = TupleRow {
            key,
            time,
            seq_nr,
            value_int: None,
            value_long: None,
            value_float: None,
            value_double: None,
            value_string: None,
            value_bool: None,
            value_object: None,
        };
        match value {
            Value::Int(v) => row.value_int = Some(*v),
            Value::Long(v) => row.value_long = Some(*v),
            Value::Float(v) => row.value_float = Some(*v),
            Value::Double(v) => row.value_double = Some(*v),
            Value::Str(v) => row.value_string = Some(v.clone()),
            Value::Bool(v) => row.value_bool = Some(i32::from(*v)),
            other => row.value_object = Some(values::encode(other)?),
        }
        Ok(row)
    }

    pub fn ids(&self) -> (u64, u64, u64) {
        decode_key(&self.key)
    }

    pub fn property_id(&self) -> u64 {
        self.ids().1
    }

    /// Materializes the populated value column.
    ///
    /// A row with no populated column decodes as `None`.
    pub fn value(&self) -> Result<Option<Value>> {
        Ok(if let Some(v) = self.value_int {
            Some(Value::Int(v))
        } else if let Some(v) = self.value_long {
            Some(Value::Long(v))
        } else if let Some(v) = self.value_float {
            Some(Value::Float(v))
        } else if let Some(v) = self.value_double {
            Some(Value::Double(v))
        } else if let Some(v) = &self.value_string {
            Some(Value::Str(v.clone()))
        } else if let Some(v) = self.value_bool {
            Some(Value::Bool(v == 1))
        } else if let Some(bytes) = &self.value_object {
            Some(values::decode(bytes)?)
        } else {
            None
        })
    }
}

impl TableRow for TupleRow {
    const INDEXED_COLUMNS: &'static [&'static str] = &[KEY_COLUMN, TIME_COLUMN];

    fn field(&self, column: &str) -> Option<Field<'_>> {
        match column {
            KEY_COLUMN => Some(Field::Bytes(&self.key)),
            TIME_COLUMN => Some(Field::Int(self.time)),
            "seq_nr" => Some(Field::Int(i64::from(self.seq_nr))),
            _ => None,
        }
    }
}

pub const ID_COLUMN: &str = "id";
pub const VALUE_COLUMN: &str = "value";

/// One persisted (id, URI) pair of an identifier namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRow {
    pub id: u64,
    pub value: String,
}

impl TableRow for MappingRow {
    const INDEXED_COLUMNS: &'static [&'static str] = &[ID_COLUMN, VALUE_COLUMN];

    fn field(&self, column: &str) -> Option<Field<'_>> {
        match column {
            ID_COLUMN => Some(Field::UInt(self.id)),
            VALUE_COLUMN => Some(Field::Str(&self.value)),
            _ => None,
        }
    }
}
