//! Process-wide mapper registry for schema-to-serializer resolution.
//!
//! Hosts that describe methods with an external schema library register a
//! named mapper that recognizes that library's schema objects and builds a
//! [`ValueSerializer`] from them. [`convert_serializer`] walks the
//! installed mappers in registration order and returns the first match.
//!
//! Two mappers ship built in:
//!
//! - `"serializer"` - the value already is an `Arc<dyn ValueSerializer>`
//! - `"schema-fns"` - the value is a [`SchemaFns`], a pair of
//!   validate/parse functions plus an optional type description

use std::any::Any;
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::Value;

use super::ValueSerializer;

/// A named mapper: inspects an opaque schema handle and produces a
/// serializer when it recognizes it.
pub type MapperFn = Arc<dyn Fn(&dyn Any) -> Option<Arc<dyn ValueSerializer>> + Send + Sync>;

/// Adapter for schema libraries exposing validate/parse functions.
///
/// `parse` validates a JSON value and returns the (possibly normalized)
/// value, or a message describing why it was rejected.
#[derive(Clone)]
pub struct SchemaFns {
    pub parse: Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>,
    pub description: Option<Value>,
}

struct SchemaFnsSerializer(SchemaFns);

impl ValueSerializer for SchemaFnsSerializer {
    fn serialize(&self, value: &Value) -> Result<Value, String> {
        Ok(value.clone())
    }

    fn deserialize(&self, value: Value) -> Result<Value, String> {
        (self.0.parse)(value)
    }

    fn type_description(&self) -> Option<Value> {
        self.0.description.clone()
    }
}

struct Registry {
    mappers: Vec<(String, MapperFn)>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let identity: MapperFn = Arc::new(|value| {
            value
                .downcast_ref::<Arc<dyn ValueSerializer>>()
                .cloned()
        });
        let schema_fns: MapperFn = Arc::new(|value| {
            value
                .downcast_ref::<SchemaFns>()
                .map(|fns| Arc::new(SchemaFnsSerializer(fns.clone())) as Arc<dyn ValueSerializer>)
        });
        Mutex::new(Registry {
            mappers: vec![
                ("serializer".to_string(), identity),
                ("schema-fns".to_string(), schema_fns),
            ],
        })
    })
}

/// Install an additional mapper. A mapper with the same name replaces the
/// previous one; otherwise the new mapper is consulted after the existing
/// ones.
pub fn register_mapper(name: impl Into<String>, mapper: MapperFn) {
    let name = name.into();
    let mut guard = registry().lock().unwrap();
    if let Some(slot) = guard.mappers.iter_mut().find(|(n, _)| *n == name) {
        slot.1 = mapper;
    } else {
        guard.mappers.push((name, mapper));
    }
}

/// Resolve a schema handle to a serializer via the installed mappers.
pub fn convert_serializer(value: &dyn Any) -> Option<Arc<dyn ValueSerializer>> {
    let mappers: Vec<MapperFn> = registry()
        .lock()
        .unwrap()
        .mappers
        .iter()
        .map(|(_, m)| m.clone())
        .collect();
    mappers.iter().find_map(|mapper| mapper(value))
}

/// Names of the installed mappers, in consultation order.
pub fn mapper_names() -> Vec<String> {
    registry()
        .lock()
        .unwrap()
        .mappers
        .iter()
        .map(|(n, _)| n.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::AnySerializer;
    use serde_json::json;

    #[test]
    fn test_identity_mapper_recognizes_serializers() {
        let handle: Arc<dyn ValueSerializer> = Arc::new(AnySerializer);
        let resolved = convert_serializer(&handle).expect("identity mapper should match");
        assert_eq!(resolved.deserialize(json!(1)).unwrap(), json!(1));
    }

    #[test]
    fn test_schema_fns_mapper_validates() {
        let schema = SchemaFns {
            parse: Arc::new(|value| {
                if value.get("name").map(|n| n.is_string()).unwrap_or(false) {
                    Ok(value)
                } else {
                    Err("missing string field `name`".to_string())
                }
            }),
            description: Some(json!({"kind": "object", "fields": ["name"]})),
        };

        let resolved = convert_serializer(&schema).expect("schema-fns mapper should match");
        assert!(resolved.deserialize(json!({"name": "foo"})).is_ok());
        let err = resolved.deserialize(json!({})).unwrap_err();
        assert!(err.contains("name"));
        assert_eq!(resolved.type_description().unwrap()["kind"], "object");
    }

    #[test]
    fn test_unrecognized_handle_resolves_to_none() {
        assert!(convert_serializer(&42u32).is_none());
    }

    #[test]
    fn test_custom_mapper_is_consulted() {
        struct MarkerSchema;

        register_mapper(
            "marker",
            Arc::new(|value| {
                value
                    .downcast_ref::<MarkerSchema>()
                    .map(|_| Arc::new(AnySerializer) as Arc<dyn ValueSerializer>)
            }),
        );

        assert!(convert_serializer(&MarkerSchema).is_some());
        assert!(mapper_names().contains(&"marker".to_string()));
    }
}
