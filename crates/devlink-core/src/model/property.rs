// ── Property domain types ──

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::CoreError;

/// Where the most recent value for a property or device came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[non_exhaustive]
pub enum DataSource {
    Cloud,
    Lan,
    /// A cloud read triggered by a push hint.
    Push,
}

/// Declared value type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BaseType {
    Boolean,
    Integer,
    Decimal,
    String,
}

/// Data direction relative to the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Direction {
    /// Written by clients, consumed by the device.
    #[default]
    Input,
    /// Produced by the device; read-only for clients.
    Output,
}

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum PropertyValue {
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    String(String),
}

impl PropertyValue {
    pub fn base_type(&self) -> BaseType {
        match self {
            Self::Boolean(_) => BaseType::Boolean,
            Self::Integer(_) => BaseType::Integer,
            Self::Decimal(_) => BaseType::Decimal,
            Self::String(_) => BaseType::String,
        }
    }

    pub fn as_bool(&self) -> Result<bool, CoreError> {
        match self {
            Self::Boolean(b) => Ok(*b),
            other => Err(other.mismatch(BaseType::Boolean)),
        }
    }

    pub fn as_i64(&self) -> Result<i64, CoreError> {
        match self {
            Self::Integer(i) => Ok(*i),
            other => Err(other.mismatch(BaseType::Integer)),
        }
    }

    pub fn as_f64(&self) -> Result<f64, CoreError> {
        match self {
            Self::Decimal(d) => Ok(*d),
            other => Err(other.mismatch(BaseType::Decimal)),
        }
    }

    pub fn as_str(&self) -> Result<&str, CoreError> {
        match self {
            Self::String(s) => Ok(s),
            other => Err(other.mismatch(BaseType::String)),
        }
    }

    fn mismatch(&self, wanted: BaseType) -> CoreError {
        CoreError::InvalidArgument {
            message: format!("expected {wanted} value, found {}", self.base_type()),
        }
    }

    /// Decode a wire value according to the declared base type.
    ///
    /// Booleans arrive as `true`/`false` or `1`/`0`. `null` decodes to
    /// `None` (the property exists but was never set).
    pub fn from_json(
        base_type: BaseType,
        raw: &serde_json::Value,
    ) -> Result<Option<Self>, CoreError> {
        use serde_json::Value;

        if raw.is_null() {
            return Ok(None);
        }
        let decoded = match (base_type, raw) {
            (BaseType::Boolean, Value::Bool(b)) => Some(Self::Boolean(*b)),
            (BaseType::Boolean, Value::Number(n)) => match n.as_i64() {
                Some(0) => Some(Self::Boolean(false)),
                Some(1) => Some(Self::Boolean(true)),
                _ => None,
            },
            (BaseType::Integer, Value::Number(n)) => n.as_i64().map(Self::Integer),
            (BaseType::Decimal, Value::Number(n)) => n.as_f64().map(Self::Decimal),
            (BaseType::String, Value::String(s)) => Some(Self::String(s.clone())),
            _ => None,
        };
        decoded.map(Some).ok_or_else(|| CoreError::InvalidArgument {
            message: format!("cannot decode {raw} as {base_type}"),
        })
    }

    /// Encode for the wire. Booleans go out as `1`/`0`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Boolean(b) => serde_json::Value::from(i64::from(*b)),
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Decimal(d) => serde_json::Value::from(*d),
            Self::String(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for PropertyValue {
    fn from(d: f64) -> Self {
        Self::Decimal(d)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// Free-form datapoint metadata.
pub type Metadata = BTreeMap<String, String>;

/// Local view of one named property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyState {
    pub name: String,
    pub base_type: BaseType,
    pub value: Option<PropertyValue>,
    /// Timestamp of the datapoint that produced `value`.
    pub updated_at: Option<DateTime<Utc>>,
    pub direction: Direction,
    pub read_only: bool,
    pub display_name: Option<String>,
    pub metadata: Option<Metadata>,
    /// Set while a write to this property is in flight.
    pub pending_write: bool,
    pub source: DataSource,
}

impl PropertyState {
    pub fn is_writable(&self) -> bool {
        !self.read_only && self.direction == Direction::Input
    }
}

/// Authoritative result of a datapoint write, as echoed by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    pub property: String,
    pub value: Option<PropertyValue>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub metadata: Option<Metadata>,
    pub echo: bool,
    pub source: DataSource,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn boolean_decodes_from_integer_wire_form() {
        let v = PropertyValue::from_json(BaseType::Boolean, &json!(1)).unwrap();
        assert_eq!(v, Some(PropertyValue::Boolean(true)));
        let v = PropertyValue::from_json(BaseType::Boolean, &json!(false)).unwrap();
        assert_eq!(v, Some(PropertyValue::Boolean(false)));
    }

    #[test]
    fn boolean_rejects_out_of_range_integer() {
        let err = PropertyValue::from_json(BaseType::Boolean, &json!(2)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn null_is_unset() {
        assert_eq!(
            PropertyValue::from_json(BaseType::String, &json!(null)).unwrap(),
            None
        );
    }

    #[test]
    fn accessor_mismatch_is_invalid_argument() {
        let v = PropertyValue::Integer(7);
        assert_eq!(v.as_i64().unwrap(), 7);
        assert!(matches!(
            v.as_bool(),
            Err(CoreError::InvalidArgument { .. })
        ));
        assert!(v.as_str().is_err());
    }

    #[test]
    fn boolean_encodes_as_integer() {
        assert_eq!(PropertyValue::Boolean(true).to_json(), json!(1));
        assert_eq!(PropertyValue::Decimal(1.5).to_json(), json!(1.5));
    }

    #[test]
    fn base_type_parses_case_insensitively() {
        assert_eq!("Decimal".parse::<BaseType>().unwrap(), BaseType::Decimal);
        assert!("float".parse::<BaseType>().is_err());
    }
}
