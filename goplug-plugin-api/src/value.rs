//! Dynamic values exchanged with hooks and lifecycle callbacks
//!
//! Every value carries a [`TypeTag`] from a fixed alphabet: the primitive tags
//! (`nil`, `bool`, `int`, `uint`, `float`, `string`, `bytes`, `list`, `map`)
//! plus the fully-qualified name of a user type. User types cross the RPC
//! boundary only after both ends declared them in a [`TypeRegistry`].

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, PluginError};

/// A user-defined type that can travel inside a [`Value`].
///
/// `TYPE_NAME` must be fully qualified (e.g. `"geometry::Point"`) so that the
/// host and an RPC plugin agree on it without relying on compiler-local names.
pub trait PluginType: Serialize + DeserializeOwned {
    const TYPE_NAME: &'static str;
}

/// Type tag of a [`Value`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TypeTag {
    Nil,
    Bool,
    Int,
    Uint,
    Float,
    String,
    Bytes,
    List,
    Map,
    /// Fully-qualified name of a declared user type
    Custom(String),
}

impl TypeTag {
    /// Tag for a user type
    pub fn custom<T: PluginType>() -> Self {
        Self::Custom(T::TYPE_NAME.to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Nil => "nil",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Uint => "uint",
            Self::Float => "float",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::List => "list",
            Self::Map => "map",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for TypeTag {
    fn from(s: &str) -> Self {
        match s {
            "nil" => Self::Nil,
            "bool" => Self::Bool,
            "int" => Self::Int,
            "uint" => Self::Uint,
            "float" => Self::Float,
            "string" => Self::String,
            "bytes" => Self::Bytes,
            "list" => Self::List,
            "map" => Self::Map,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for TypeTag {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<TypeTag> for String {
    fn from(tag: TypeTag) -> Self {
        match tag {
            TypeTag::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

/// A dynamically typed value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A user type, serialized as JSON under its fully-qualified name
    Custom {
        type_name: String,
        data: serde_json::Value,
    },
}

impl Value {
    /// Wrap a user type
    pub fn custom<T: PluginType>(value: &T) -> Result<Self, PluginError> {
        Ok(Self::Custom {
            type_name: T::TYPE_NAME.to_string(),
            data: serde_json::to_value(value)?,
        })
    }

    /// Unwrap a user type, checking the tag first
    pub fn to_custom<T: PluginType>(&self) -> Result<T, PluginError> {
        match self {
            Self::Custom { type_name, data } if type_name == T::TYPE_NAME => {
                Ok(serde_json::from_value(data.clone())?)
            }
            other => Err(PluginError::Serialization(format!(
                "expected {}, got {}",
                T::TYPE_NAME,
                other.type_tag()
            ))),
        }
    }

    pub fn type_tag(&self) -> TypeTag {
        match self {
            Self::Nil => TypeTag::Nil,
            Self::Bool(_) => TypeTag::Bool,
            Self::Int(_) => TypeTag::Int,
            Self::Uint(_) => TypeTag::Uint,
            Self::Float(_) => TypeTag::Float,
            Self::String(_) => TypeTag::String,
            Self::Bytes(_) => TypeTag::Bytes,
            Self::List(_) => TypeTag::List,
            Self::Map(_) => TypeTag::Map,
            Self::Custom { type_name, .. } => TypeTag::Custom(type_name.clone()),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("nil"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Uint(u) => write!(f, "{u}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => f.write_str(s),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::List(items) => write!(f, "<list of {}>", items.len()),
            Self::Map(entries) => write!(f, "<map of {}>", entries.len()),
            Self::Custom { type_name, data } => write!(f, "{type_name}({data})"),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Self::Nil
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Self::Uint(u)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Nil, Into::into)
    }
}

/// User types declared for serialization across the RPC boundary
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    declared: HashSet<String>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a user type
    pub fn declare<T: PluginType>(&mut self) {
        self.declared.insert(T::TYPE_NAME.to_string());
    }

    /// Declare a user type by its fully-qualified name
    pub fn declare_name(&mut self, type_name: impl Into<String>) {
        self.declared.insert(type_name.into());
    }

    pub fn is_declared(&self, type_name: &str) -> bool {
        self.declared.contains(type_name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.declared.iter().map(String::as_str)
    }

    /// Check that every user type inside `value` is declared
    pub fn check(&self, value: &Value) -> Result<(), DispatchError> {
        match value {
            Value::Custom { type_name, .. } if !self.is_declared(type_name) => {
                Err(DispatchError::UndeclaredType {
                    type_name: type_name.clone(),
                })
            }
            Value::List(items) => items.iter().try_for_each(|v| self.check(v)),
            Value::Map(entries) => entries.values().try_for_each(|v| self.check(v)),
            _ => Ok(()),
        }
    }

    /// Check a whole argument list
    pub fn check_all(&self, values: &[Value]) -> Result<(), DispatchError> {
        values.iter().try_for_each(|v| self.check(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    impl PluginType for Point {
        const TYPE_NAME: &'static str = "geometry::Point";
    }

    #[test]
    fn test_primitive_tags() {
        assert_eq!(Value::from(1).type_tag(), TypeTag::Int);
        assert_eq!(Value::from("a").type_tag(), TypeTag::String);
        assert_eq!(Value::from(true).type_tag(), TypeTag::Bool);
        assert_eq!(Value::from(1.5).type_tag(), TypeTag::Float);
        assert_eq!(Value::Nil.type_tag(), TypeTag::Nil);
    }

    #[test]
    fn test_tag_parses_from_string() {
        assert_eq!(TypeTag::from("int"), TypeTag::Int);
        assert_eq!(
            TypeTag::from("geometry::Point"),
            TypeTag::Custom("geometry::Point".into())
        );
        assert_eq!(String::from(TypeTag::Map), "map");
    }

    #[test]
    fn test_custom_value_tag_is_type_name() {
        let v = Value::custom(&Point { x: 1, y: 2 }).unwrap();
        assert_eq!(v.type_tag(), TypeTag::custom::<Point>());
        assert_eq!(v.to_custom::<Point>().unwrap(), Point { x: 1, y: 2 });
    }

    #[test]
    fn test_to_custom_rejects_other_tags() {
        let err = Value::from(3).to_custom::<Point>().unwrap_err();
        assert!(err.to_string().contains("geometry::Point"));
    }

    #[test]
    fn test_value_wire_form_keeps_integer_kind() {
        let json = serde_json::to_string(&Value::Uint(7)).unwrap();
        assert_eq!(json, r#"{"type":"uint","value":7}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::Uint(7));
    }

    #[test]
    fn test_registry_rejects_undeclared_nested_type() {
        let point = Value::custom(&Point { x: 0, y: 0 }).unwrap();
        let list = Value::List(vec![Value::from(1), point]);

        let mut registry = TypeRegistry::new();
        let err = registry.check(&list).unwrap_err();
        assert_eq!(
            err,
            DispatchError::UndeclaredType {
                type_name: "geometry::Point".into()
            }
        );

        registry.declare::<Point>();
        assert!(registry.check(&list).is_ok());
    }

    #[test]
    fn test_option_into_value() {
        assert!(Value::from(None::<i64>).is_nil());
        assert_eq!(Value::from(Some("x")).as_str(), Some("x"));
    }
}
