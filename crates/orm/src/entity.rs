use std::sync::Arc;

use anyhow::{anyhow, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sea_query::Value;
use serde::Serialize;
use serde::de::DeserializeOwned;
use strata_sql::{DataType, Row};

use crate::error::{Error, Result};
use crate::meta::EntityMeta;
use crate::relation::Relation;

/// A struct mapped to a table (or, for join projections, to two joined tables).
///
/// Implemented with `#[derive(Entity)]` rather than by hand.
///
/// ```ignore
/// #[derive(Debug, Default, Entity)]
/// #[table(name = "t_student", soft_delete_table = "t_student_del")]
/// pub struct Student {
///     #[column(key, auto_increment)]
///     pub id: Option<i64>,
///     pub name: Option<String>,
///     #[column(cas_version)]
///     pub version: Option<i32>,
///     #[column(soft_delete)]
///     pub deleted: Option<bool>,
///     #[relation(local = "id", remote = "student_id")]
///     pub courses: Option<Vec<Course>>,
/// }
/// ```
pub trait Entity: Default + Send + Sync + 'static {
    /// Build the entity's metadata. Callers use [`crate::meta`], which caches it.
    fn describe() -> EntityMeta;

    /// Value bound to `column`, `None` when the field is null.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownColumn`] for an undeclared column and
    /// [`Error::Mapping`] when a JSON column cannot be serialized.
    fn column_value(&self, column: &str) -> Result<Option<Value>>;

    /// Assign a database value to the field bound to `column`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownColumn`] for an undeclared column and
    /// [`Error::Mapping`] when the value does not convert to the field type.
    fn set_column(&mut self, column: &str, value: &DataType) -> Result<()>;

    /// Handlers resolving the entity's relation fields (or join sides).
    #[must_use]
    fn relations() -> Vec<Arc<dyn Relation<Self>>> {
        Vec::new()
    }

    /// Map an aliased join row into a join projection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] unless the entity is a join projection.
    fn map_join_row(_row: &Row, _strict: bool) -> Result<Self> {
        Err(Error::config(format!("`{}` is not a join projection", std::any::type_name::<Self>())))
    }
}

/// Conversion from a field value into a bindable SQL value.
pub trait ToColumn {
    /// The bound value, `None` for null.
    fn to_column(&self) -> Option<Value>;
}

/// Trait for types that can be read from a database value.
///
/// Conversions are lenient: integers narrow when they fit, booleans accept
/// `0`/`1`, and date types parse their text forms.
pub trait FetchValue: Sized {
    /// Convert a non-null value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be converted to the target type.
    fn fetch(value: &DataType) -> anyhow::Result<Self>;

    /// Value used for SQL `NULL`.
    ///
    /// # Errors
    ///
    /// Returns an error for types that cannot represent `NULL`.
    fn null() -> anyhow::Result<Self> {
        bail!("unexpected NULL for a non-optional field")
    }
}

macro_rules! to_column_via_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ToColumn for $ty {
                fn to_column(&self) -> Option<Value> {
                    Some(self.clone().into())
                }
            }
        )*
    };
}

to_column_via_value!(
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    u64,
    f32,
    f64,
    String,
    Vec<u8>,
    NaiveDate,
    NaiveTime,
    NaiveDateTime,
    DateTime<Utc>,
);

impl ToColumn for serde_json::Value {
    fn to_column(&self) -> Option<Value> {
        if self.is_null() {
            return None;
        }
        Some(Value::String(Some(Box::new(self.to_string()))))
    }
}

impl<T: ToColumn> ToColumn for Option<T> {
    fn to_column(&self) -> Option<Value> {
        self.as_ref().and_then(ToColumn::to_column)
    }
}

// Outbound conversion
pub(crate) fn value_to_datatype(value: Value) -> Result<DataType> {
    let data_type = match value {
        Value::Bool(v) => DataType::Boolean(v),
        Value::TinyInt(v) => DataType::Int32(v.map(i32::from)),
        Value::SmallInt(v) => DataType::Int32(v.map(i32::from)),
        Value::Int(v) => DataType::Int32(v),
        Value::BigInt(v) => DataType::Int64(v),
        Value::TinyUnsigned(v) => DataType::Uint32(v.map(u32::from)),
        Value::SmallUnsigned(v) => DataType::Uint32(v.map(u32::from)),
        Value::Unsigned(v) => DataType::Uint32(v),
        Value::BigUnsigned(v) => DataType::Uint64(v),
        Value::Float(v) => DataType::Float(v),
        Value::Double(v) => DataType::Double(v),
        Value::String(v) => DataType::Str(v.map(|value| *value)),
        Value::ChronoDate(v) => DataType::Date(v.map(|value| {
            value.to_string() // "%Y-%m-%d"
        })),
        Value::ChronoTime(v) => DataType::Time(v.map(|value| {
            value.to_string() // "%H:%M:%S%.f"
        })),
        Value::ChronoDateTime(v) => DataType::Timestamp(v.map(|value| {
            value.to_string() // "%Y-%m-%d %H:%M:%S%.f"
        })),
        Value::ChronoDateTimeUtc(v) => DataType::Timestamp(v.map(|value| {
            value.to_rfc3339() // "%Y-%m-%dT%H:%M:%S%.f%:z"
        })),
        Value::Char(v) => DataType::Str(v.map(|ch| ch.to_string())),
        Value::Bytes(v) => DataType::Binary(v.map(|bytes| *bytes)),
        other => {
            return Err(Error::invalid(format!(
                "unsupported value {other:?} requires explicit conversion before binding"
            )));
        }
    };
    Ok(data_type)
}

// Helpers called by `#[derive(Entity)]` output.

#[doc(hidden)]
pub fn fetch_column<T: FetchValue>(column: &str, value: &DataType) -> Result<T> {
    let fetched = if value.is_null() { T::null() } else { T::fetch(value) };
    fetched.map_err(|e| Error::mapping(column, e))
}

#[doc(hidden)]
pub fn json_to_column<T: Serialize>(column: &str, value: &T) -> Result<Option<Value>> {
    let json = serde_json::to_value(value).map_err(|e| Error::mapping(column, e))?;
    if json.is_null() {
        return Ok(None);
    }
    Ok(Some(Value::String(Some(Box::new(json.to_string())))))
}

#[doc(hidden)]
pub fn json_from_column<T: DeserializeOwned>(column: &str, value: &DataType) -> Result<T> {
    let parsed = match value {
        DataType::Binary(Some(bytes)) => serde_json::from_slice(bytes),
        other => match other.as_text() {
            Some(text) => serde_json::from_str(&text),
            None => serde_json::from_value(serde_json::Value::Null),
        },
    };
    parsed.map_err(|e| Error::mapping(column, e))
}

// Inbound conversion
impl<T: FetchValue> FetchValue for Option<T> {
    fn fetch(value: &DataType) -> anyhow::Result<Self> {
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(T::fetch(value)?))
    }

    fn null() -> anyhow::Result<Self> {
        Ok(None)
    }
}

impl FetchValue for bool {
    fn fetch(value: &DataType) -> anyhow::Result<Self> {
        match value {
            DataType::Boolean(Some(v)) => Ok(*v),
            DataType::Str(Some(raw)) => match raw.trim() {
                "1" | "true" | "TRUE" => Ok(true),
                "0" | "false" | "FALSE" => Ok(false),
                _ => bail!("expected boolean, found {raw:?}"),
            },
            other => other
                .as_i64()
                .map(|v| v != 0)
                .ok_or_else(|| anyhow!("expected boolean data type, found {}", other.kind())),
        }
    }
}

macro_rules! fetch_integer {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FetchValue for $ty {
                fn fetch(value: &DataType) -> anyhow::Result<Self> {
                    if let DataType::Uint64(Some(v)) = value {
                        return Ok(<$ty>::try_from(*v)?);
                    }
                    let int = as_integer(value)?;
                    <$ty>::try_from(int)
                        .map_err(|_e| anyhow!("{int} out of range for {}", stringify!($ty)))
                }
            }
        )*
    };
}

fetch_integer!(i8, i16, i32, i64, u8, u16, u32, u64);

#[allow(clippy::cast_possible_truncation)]
fn as_integer(value: &DataType) -> anyhow::Result<i64> {
    if let Some(int) = value.as_i64() {
        return Ok(int);
    }
    match value {
        DataType::Double(Some(v)) if v.fract() == 0.0 => Ok(*v as i64),
        DataType::Float(Some(v)) if v.fract() == 0.0 => Ok(*v as i64),
        other => bail!("expected integer data type, found {}", other.kind()),
    }
}

impl FetchValue for f64 {
    #[allow(clippy::cast_precision_loss)]
    fn fetch(value: &DataType) -> anyhow::Result<Self> {
        match value {
            DataType::Double(Some(v)) => Ok(*v),
            DataType::Float(Some(v)) => Ok(Self::from(*v)),
            DataType::Str(Some(raw)) => Ok(raw.trim().parse()?),
            other => other
                .as_i64()
                .map(|v| v as Self)
                .ok_or_else(|| anyhow!("expected double data type, found {}", other.kind())),
        }
    }
}

impl FetchValue for f32 {
    #[allow(clippy::cast_possible_truncation)]
    fn fetch(value: &DataType) -> anyhow::Result<Self> {
        match value {
            DataType::Float(Some(v)) => Ok(*v),
            other => f64::fetch(other).map(|v| v as Self),
        }
    }
}

impl FetchValue for String {
    fn fetch(value: &DataType) -> anyhow::Result<Self> {
        value.as_text().ok_or_else(|| anyhow!("expected string data type"))
    }
}

impl FetchValue for Vec<u8> {
    fn fetch(value: &DataType) -> anyhow::Result<Self> {
        match value {
            DataType::Binary(Some(bytes)) => Ok(bytes.clone()),
            other => other
                .as_text()
                .map(String::into_bytes)
                .ok_or_else(|| anyhow!("expected binary data type")),
        }
    }
}

impl FetchValue for DateTime<Utc> {
    fn fetch(value: &DataType) -> anyhow::Result<Self> {
        let raw = value.as_text().ok_or_else(|| anyhow!("expected timestamp data type"))?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(parsed.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::fetch(value)?;
        Ok(Self::from_naive_utc_and_offset(naive, Utc))
    }
}

impl FetchValue for NaiveDateTime {
    fn fetch(value: &DataType) -> anyhow::Result<Self> {
        let raw = value.as_text().ok_or_else(|| anyhow!("expected timestamp data type"))?;
        for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
            if let Ok(parsed) = Self::parse_from_str(&raw, format) {
                return Ok(parsed);
            }
        }
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(parsed.naive_utc());
        }
        bail!("unsupported timestamp: {raw}; expected RFC3339 or \"%Y-%m-%d %H:%M:%S%.f\" format")
    }
}

impl FetchValue for NaiveDate {
    fn fetch(value: &DataType) -> anyhow::Result<Self> {
        let raw = value.as_text().ok_or_else(|| anyhow!("expected date data type"))?;
        let date = raw.get(..10).unwrap_or(&raw);
        Self::parse_from_str(date, "%Y-%m-%d")
            .map_err(|_e| anyhow!("unsupported date: {raw}; expected \"%Y-%m-%d\" format"))
    }
}

impl FetchValue for NaiveTime {
    fn fetch(value: &DataType) -> anyhow::Result<Self> {
        let raw = value.as_text().ok_or_else(|| anyhow!("expected time data type"))?;
        Self::parse_from_str(&raw, "%H:%M:%S%.f")
            .map_err(|_e| anyhow!("unsupported time: {raw}; expected \"%H:%M:%S%.f\" format"))
    }
}

impl FetchValue for serde_json::Value {
    fn fetch(value: &DataType) -> anyhow::Result<Self> {
        match value {
            DataType::Binary(Some(bytes)) => Ok(serde_json::from_slice(bytes)?),
            other => {
                let raw = other.as_text().ok_or_else(|| anyhow!("expected json data type"))?;
                Ok(serde_json::from_str(&raw)?)
            }
        }
    }

    fn null() -> anyhow::Result<Self> {
        Ok(Self::Null)
    }
}
