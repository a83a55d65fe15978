//! Values and rows exchanged with a [`Connection`](crate::Connection).

use std::fmt;

use serde_json::Value;

/// A dynamically typed SQL value. A `None` payload is SQL `NULL`.
#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    /// Boolean value.
    Boolean(Option<bool>),
    /// 32-bit signed integer.
    Int32(Option<i32>),
    /// 64-bit signed integer.
    Int64(Option<i64>),
    /// 32-bit unsigned integer.
    Uint32(Option<u32>),
    /// 64-bit unsigned integer.
    Uint64(Option<u64>),
    /// Single precision float.
    Float(Option<f32>),
    /// Double precision float.
    Double(Option<f64>),
    /// Text.
    Str(Option<String>),
    /// Raw bytes.
    Binary(Option<Vec<u8>>),
    /// Date formatted as `%Y-%m-%d`.
    Date(Option<String>),
    /// Time formatted as `%H:%M:%S%.f`.
    Time(Option<String>),
    /// Timestamp, RFC3339 or `%Y-%m-%d %H:%M:%S%.f`.
    Timestamp(Option<String>),
}

impl DataType {
    /// Untyped SQL `NULL`.
    pub const NULL: Self = Self::Str(None);

    /// Whether the value is SQL `NULL`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(
            self,
            Self::Boolean(None)
                | Self::Int32(None)
                | Self::Int64(None)
                | Self::Uint32(None)
                | Self::Uint64(None)
                | Self::Float(None)
                | Self::Double(None)
                | Self::Str(None)
                | Self::Binary(None)
                | Self::Date(None)
                | Self::Time(None)
                | Self::Timestamp(None)
        )
    }

    /// Name of the variant, used when comparing values of different runtime types.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "boolean",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::Uint32(_) => "uint32",
            Self::Uint64(_) => "uint64",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::Str(_) => "str",
            Self::Binary(_) => "binary",
            Self::Date(_) => "date",
            Self::Time(_) => "time",
            Self::Timestamp(_) => "timestamp",
        }
    }

    /// Integer view of the value, accepting any integral variant and numeric text.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Boolean(Some(v)) => Some(i64::from(*v)),
            Self::Int32(Some(v)) => Some(i64::from(*v)),
            Self::Int64(Some(v)) => Some(*v),
            Self::Uint32(Some(v)) => Some(i64::from(*v)),
            Self::Uint64(Some(v)) => i64::try_from(*v).ok(),
            Self::Str(Some(v)) => v.trim().parse().ok(),
            _ => None,
        }
    }

    /// Text form of a non-null value.
    #[must_use]
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Boolean(Some(v)) => Some(v.to_string()),
            Self::Int32(Some(v)) => Some(v.to_string()),
            Self::Int64(Some(v)) => Some(v.to_string()),
            Self::Uint32(Some(v)) => Some(v.to_string()),
            Self::Uint64(Some(v)) => Some(v.to_string()),
            Self::Float(Some(v)) => Some(v.to_string()),
            Self::Double(Some(v)) => Some(v.to_string()),
            Self::Str(Some(v))
            | Self::Date(Some(v))
            | Self::Time(Some(v))
            | Self::Timestamp(Some(v)) => Some(v.clone()),
            Self::Binary(Some(v)) => Some(String::from_utf8_lossy(v).into_owned()),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("NULL"),
        }
    }
}

/// A named column value within a [`Row`].
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Column label as reported by the database.
    pub name: String,

    /// Column value.
    pub value: DataType,
}

/// A single result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Position of the row in the result set.
    pub index: String,

    /// Column values in result order.
    pub fields: Vec<Field>,
}

impl Row {
    /// Look up a column by label, ignoring ASCII case.
    #[must_use]
    pub fn get(&self, label: &str) -> Option<&DataType> {
        self.fields.iter().find(|field| field.name.eq_ignore_ascii_case(label)).map(|f| &f.value)
    }

    /// Value of the first column.
    #[must_use]
    pub fn first(&self) -> Option<&DataType> {
        self.fields.first().map(|field| &field.value)
    }
}

/// Convert rows into a JSON array of objects keyed by column label.
#[must_use]
pub fn into_json(rows: Vec<Row>) -> Value {
    let json_rows: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            let mut map = serde_json::Map::new();
            for field in row.fields {
                map.insert(field.name, to_json(field.value));
            }
            Value::Object(map)
        })
        .collect();

    Value::Array(json_rows)
}

/// Convert a single value into JSON. Binary values are emitted as arrays of bytes.
#[must_use]
pub fn to_json(value: DataType) -> Value {
    match value {
        DataType::Boolean(Some(v)) => Value::Bool(v),
        DataType::Int32(Some(v)) => Value::Number(v.into()),
        DataType::Int64(Some(v)) => Value::Number(v.into()),
        DataType::Uint32(Some(v)) => Value::Number(v.into()),
        DataType::Uint64(Some(v)) => Value::Number(v.into()),
        DataType::Float(Some(v)) => {
            serde_json::Number::from_f64(f64::from(v)).map_or(Value::Null, Value::Number)
        }
        DataType::Double(Some(v)) => {
            serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
        }
        DataType::Str(Some(v))
        | DataType::Date(Some(v))
        | DataType::Time(Some(v))
        | DataType::Timestamp(Some(v)) => Value::String(v),
        DataType::Binary(Some(v)) => Value::Array(v.into_iter().map(Value::from).collect()),
        _ => Value::Null,
    }
}
