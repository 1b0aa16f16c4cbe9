//! Serialization mediators between application values and JSON.
//!
//! A [`Serializer`] converts one application type to and from
//! `serde_json::Value`, reporting deserialization failures as messages.
//! Descriptors reference serializers; the typed channel never touches
//! application types directly.
//!
//! Stock serializers:
//!
//! - [`AnySerializer`] - identity over `Value`
//! - [`EmptyObjectSerializer`] - accepts any JSON, yields `()`; serializes
//!   to `{}`
//! - [`VoidSerializer`] - `()` ↔ JSON `null`
//! - [`SerdeSerializer`] - any `Serialize + DeserializeOwned` type
//!
//! The [`registry`] module resolves opaque schema handles to serializers
//! through named mappers, so hosts can plug in external schema libraries.

pub mod registry;

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

/// Converts between an application type and JSON values.
pub trait Serializer<T>: Send + Sync + 'static {
    fn serialize(&self, value: &T) -> Result<Value, String>;

    fn deserialize(&self, value: Value) -> Result<T, String>;

    /// Serialized type description consumed by the reflector. `None` when
    /// the serializer has nothing useful to say about its type.
    fn type_description(&self) -> Option<Value> {
        None
    }
}

/// Type-erased serializer working on raw JSON values.
///
/// Used by the mapper [`registry`] and by transports or tools that handle
/// values without static types.
pub trait ValueSerializer: Send + Sync + 'static {
    fn serialize(&self, value: &Value) -> Result<Value, String>;
    fn deserialize(&self, value: Value) -> Result<Value, String>;
    fn type_description(&self) -> Option<Value> {
        None
    }
}

/// Identity serializer over raw JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnySerializer;

impl Serializer<Value> for AnySerializer {
    fn serialize(&self, value: &Value) -> Result<Value, String> {
        Ok(value.clone())
    }

    fn deserialize(&self, value: Value) -> Result<Value, String> {
        Ok(value)
    }

    fn type_description(&self) -> Option<Value> {
        Some(json!({ "kind": "any" }))
    }
}

impl ValueSerializer for AnySerializer {
    fn serialize(&self, value: &Value) -> Result<Value, String> {
        Ok(value.clone())
    }

    fn deserialize(&self, value: Value) -> Result<Value, String> {
        Ok(value)
    }

    fn type_description(&self) -> Option<Value> {
        Some(json!({ "kind": "any" }))
    }
}

/// Accepts any JSON and yields `()`; serializes to `{}`.
///
/// The default params serializer: methods without parameters still put a
/// well-formed object on the wire.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyObjectSerializer;

impl Serializer<()> for EmptyObjectSerializer {
    fn serialize(&self, _value: &()) -> Result<Value, String> {
        Ok(Value::Object(Map::new()))
    }

    fn deserialize(&self, _value: Value) -> Result<(), String> {
        Ok(())
    }

    fn type_description(&self) -> Option<Value> {
        Some(json!({ "kind": "empty-object" }))
    }
}

/// `()` ↔ JSON `null`. The default result and error-data serializer.
#[derive(Debug, Default, Clone, Copy)]
pub struct VoidSerializer;

impl Serializer<()> for VoidSerializer {
    fn serialize(&self, _value: &()) -> Result<Value, String> {
        Ok(Value::Null)
    }

    fn deserialize(&self, value: Value) -> Result<(), String> {
        match value {
            Value::Null => Ok(()),
            other => Err(format!("expected null, got {}", kind_of(&other))),
        }
    }

    fn type_description(&self) -> Option<Value> {
        Some(json!({ "kind": "void" }))
    }
}

/// Serde-backed serializer for any `Serialize + DeserializeOwned` type.
pub struct SerdeSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeSerializer<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Serializer<T> for SerdeSerializer<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn serialize(&self, value: &T) -> Result<Value, String> {
        serde_json::to_value(value).map_err(|e| e.to_string())
    }

    fn deserialize(&self, value: Value) -> Result<T, String> {
        serde_json::from_value(value).map_err(|e| e.to_string())
    }

    fn type_description(&self) -> Option<Value> {
        Some(json!({ "kind": "serde", "type": std::any::type_name::<T>() }))
    }
}

/// Shorthand for `Arc<dyn Serializer<T>>`.
pub type SharedSerializer<T> = Arc<dyn Serializer<T>>;

/// Identity serializer handle.
pub fn any() -> SharedSerializer<Value> {
    Arc::new(AnySerializer)
}

/// Empty-object serializer handle.
pub fn empty_object() -> SharedSerializer<()> {
    Arc::new(EmptyObjectSerializer)
}

/// Void ↔ null serializer handle.
pub fn void_null() -> SharedSerializer<()> {
    Arc::new(VoidSerializer)
}

/// Serde-backed serializer handle for `T`.
pub fn of<T>() -> SharedSerializer<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    Arc::new(SerdeSerializer::<T>::new())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct CalcParams {
        name: String,
    }

    #[test]
    fn test_any_is_identity() {
        let s = AnySerializer;
        let v = json!({"a": [1, 2, 3]});
        assert_eq!(Serializer::serialize(&s, &v).unwrap(), v);
        assert_eq!(Serializer::deserialize(&s, v.clone()).unwrap(), v);
    }

    #[test]
    fn test_empty_object_accepts_anything_and_yields_braces() {
        let s = EmptyObjectSerializer;
        assert_eq!(s.serialize(&()).unwrap(), json!({}));
        s.deserialize(json!(null)).unwrap();
        s.deserialize(json!({"extra": true})).unwrap();
        s.deserialize(json!(42)).unwrap();
    }

    #[test]
    fn test_void_maps_unit_to_null() {
        let s = VoidSerializer;
        assert_eq!(s.serialize(&()).unwrap(), Value::Null);
        s.deserialize(Value::Null).unwrap();

        let err = s.deserialize(json!({"x": 1})).unwrap_err();
        assert!(err.contains("expected null"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let s = SerdeSerializer::<CalcParams>::new();
        let value = CalcParams { name: "foo".into() };

        let wire = s.serialize(&value).unwrap();
        assert_eq!(wire, json!({"name": "foo"}));
        assert_eq!(s.deserialize(wire).unwrap(), value);
    }

    #[test]
    fn test_serde_reports_failures_as_messages() {
        let s = SerdeSerializer::<CalcParams>::new();
        let err = s.deserialize(json!({"wrong": 1})).unwrap_err();
        assert!(err.contains("name"));
    }

    #[test]
    fn test_serde_ignores_unexpected_properties() {
        let s = SerdeSerializer::<CalcParams>::new();
        let parsed = s
            .deserialize(json!({"name": "foo", "surplus": true}))
            .unwrap();
        assert_eq!(parsed.name, "foo");
    }

    #[test]
    fn test_type_descriptions() {
        assert_eq!(
            Serializer::<Value>::type_description(&AnySerializer).unwrap()["kind"],
            "any"
        );
        let desc = SerdeSerializer::<CalcParams>::new().type_description().unwrap();
        assert_eq!(desc["kind"], "serde");
        assert!(desc["type"].as_str().unwrap().contains("CalcParams"));
    }
}
