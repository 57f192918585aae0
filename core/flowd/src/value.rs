//! Dynamically-typed values exchanged between units.
//!
//! A [`Value`] is what the controller stores as the resolved arguments of a unit
//! and as the outputs that a unit publishes. Published outputs are wrapped in an
//! [`Arc`](std::sync::Arc) and never mutated afterwards: downstream nodes may keep
//! a reference to them for as long as they want.
//!
//! Units usually work with typed records instead of raw values. Use
//! [`Value::decode`] to obtain a typed record and [`Value::encode`] to turn a
//! typed record into a `Value`.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A dynamically-typed value.
///
/// Equality is structural: two values are equal if they have the same shape
/// and the same content. The controller relies on this to detect that the
/// resolved arguments of a unit did not change, therefore floats are compared
/// with [`f64::total_cmp`]: `NaN` is equal to itself, and `-0.0` differs from `0.0`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b).is_eq(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

/// Error returned by [`Value::decode`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("null value found in array at index {0}, arrays cannot contain null")]
    NullInArray(usize),
    #[error("invalid value: {0}")]
    Invalid(#[source] toml::de::Error),
}

/// Error returned by [`Value::encode`].
#[derive(Debug, Error)]
#[error("could not encode value: {0}")]
pub struct EncodeError(#[source] toml::ser::Error);

impl Value {
    /// Creates an object from `(key, value)` pairs.
    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Creates an empty object.
    pub fn empty_object() -> Self {
        Value::Object(BTreeMap::new())
    }

    /// Returns a short, human-readable name of the type of the value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the value as a float, converting integers if needed.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Gets a field of an object. Returns `None` if `self` is not an object
    /// or if the field does not exist.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.as_object().and_then(|o| o.get(field))
    }

    /// Decodes the value into a typed record.
    ///
    /// `null` fields of objects are treated as absent, so that `Option` fields and
    /// fields with a `#[serde(default)]` work as expected. A `null` value at the top
    /// level is decoded like an empty object.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        let converted = self
            .to_toml()?
            .unwrap_or_else(|| toml::Value::Table(toml::Table::new()));
        converted.try_into().map_err(DecodeError::Invalid)
    }

    /// Encodes a typed record into a value.
    pub fn encode<T: Serialize + ?Sized>(record: &T) -> Result<Value, EncodeError> {
        let converted = toml::Value::try_from(record).map_err(EncodeError)?;
        Ok(Value::from(converted))
    }

    fn to_toml(&self) -> Result<Option<toml::Value>, DecodeError> {
        let res = match self {
            Value::Null => return Ok(None),
            Value::Bool(b) => toml::Value::Boolean(*b),
            Value::Int(i) => toml::Value::Integer(*i),
            Value::Float(f) => toml::Value::Float(*f),
            Value::String(s) => toml::Value::String(s.clone()),
            Value::Array(values) => {
                let mut array = Vec::with_capacity(values.len());
                for (i, v) in values.iter().enumerate() {
                    match v.to_toml()? {
                        Some(v) => array.push(v),
                        None => return Err(DecodeError::NullInArray(i)),
                    }
                }
                toml::Value::Array(array)
            }
            Value::Object(fields) => {
                let mut table = toml::Table::new();
                for (k, v) in fields {
                    if let Some(v) = v.to_toml()? {
                        table.insert(k.clone(), v);
                    }
                }
                toml::Value::Table(table)
            }
        };
        Ok(Some(res))
    }
}

impl From<toml::Value> for Value {
    fn from(value: toml::Value) -> Self {
        match value {
            toml::Value::String(s) => Value::String(s),
            toml::Value::Integer(i) => Value::Int(i),
            toml::Value::Float(f) => Value::Float(f),
            toml::Value::Boolean(b) => Value::Bool(b),
            toml::Value::Datetime(d) => Value::String(d.to_string()),
            toml::Value::Array(a) => Value::Array(a.into_iter().map(Value::from).collect()),
            toml::Value::Table(t) => Value::Object(t.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(value: Vec<V>) -> Self {
        Value::Array(value.into_iter().map(Into::into).collect())
    }
}

/// Formats the value with the syntax of the expression language.
impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
            Value::String(s) => write!(f, "{s:?}"),
            Value::Array(values) => {
                f.write_char('[')?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    Display::fmt(v, f)?;
                }
                f.write_char(']')
            }
            Value::Object(fields) => {
                f.write_char('{')?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_char(',')?;
                    }
                    write!(f, " {k} = {v}")?;
                }
                if !fields.is_empty() {
                    f.write_char(' ')?;
                }
                f.write_char('}')
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    use super::{DecodeError, Value};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Args {
        name: String,
        #[serde(default)]
        port: Option<u16>,
        tags: Vec<String>,
    }

    #[test]
    fn decode_record() {
        let value = Value::object([
            ("name", Value::from("scraper")),
            ("port", Value::Null),
            ("tags", Value::from(vec!["a", "b"])),
        ]);
        let args: Args = value.decode().unwrap();
        assert_eq!(
            args,
            Args {
                name: String::from("scraper"),
                port: None,
                tags: vec![String::from("a"), String::from("b")],
            }
        );
    }

    #[test]
    fn decode_type_mismatch() {
        let value = Value::object([("name", Value::Int(1)), ("tags", Value::Array(vec![]))]);
        let res = value.decode::<Args>();
        assert!(matches!(res, Err(DecodeError::Invalid(_))), "got {res:?}");
    }

    #[test]
    fn decode_null_in_array() {
        let value = Value::object([
            ("name", Value::from("x")),
            ("tags", Value::Array(vec![Value::from("a"), Value::Null])),
        ]);
        assert!(matches!(value.decode::<Args>(), Err(DecodeError::NullInArray(1))));
    }

    #[test]
    fn encode_record() {
        let args = Args {
            name: String::from("out"),
            port: Some(8080),
            tags: vec![],
        };
        let value = Value::encode(&args).unwrap();
        assert_eq!(value.get("name"), Some(&Value::from("out")));
        assert_eq!(value.get("port"), Some(&Value::Int(8080)));
        assert_eq!(value.get("tags"), Some(&Value::Array(vec![])));
    }

    #[test]
    fn structural_equality() {
        let a = Value::object([("x", Value::from(vec![1i64, 2])), ("y", Value::from("z"))]);
        let b = Value::object([("y", Value::from("z")), ("x", Value::from(vec![1i64, 2]))]);
        assert_eq!(a, b);
        assert_ne!(Value::Int(1), Value::Float(1.0));
    }

    #[test]
    fn float_equality() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_eq!(
            Value::object([("x", Value::Float(f64::NAN))]),
            Value::object([("x", Value::Float(0.0 / 0.0))])
        );
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
    }

    #[test]
    fn display() {
        let v = Value::object([("a", Value::Int(1)), ("b", Value::from(vec!["s"]))]);
        assert_eq!(v.to_string(), r#"{ a = 1, b = ["s"] }"#);
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::empty_object().to_string(), "{}");
    }
}
