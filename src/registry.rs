//! Capabilities a worker process needs to take part in a run.
//!
//! A worker process starts cold: it has none of the closures or values of the
//! parent. Everything that has to cross the boundary is therefore looked up
//! by name in a [`Registry`] which both sides build the same way before the
//! run starts:
//!
//! * **functions**, so that a task can be sent as just its function key;
//! * **codecs**, so that artifact values can be turned into CBOR and back.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::{ArcStr, Data};
use crate::task::{Func, Function};

/// Encoded artifact on the wire. `tag` selects the codec used to decode
/// `body`.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct Payload {
    pub tag: String,
    pub body: ciborium::Value,
}

const NULL_TAG: &str = "null";

type Encode = fn(&Data) -> Result<ciborium::Value, String>;
type Decode = fn(&ciborium::Value) -> Result<Data, String>;

#[derive(Clone, Copy)]
struct Codec {
    encode: Encode,
    decode: Decode,
}

fn encode<T>(data: &Data) -> Result<ciborium::Value, String>
where
    T: Serialize + 'static,
{
    let value = data.downcast_ref::<T>().ok_or("codec type mismatch")?;
    ciborium::Value::serialized(value).map_err(|e| e.to_string())
}

fn decode<T>(body: &ciborium::Value) -> Result<Data, String>
where
    T: DeserializeOwned + Any + Send + Sync,
{
    body.deserialized::<T>()
        .map(Data::new)
        .map_err(|e| e.to_string())
}

/// Named functions and type codecs shared by the parent and its workers.
#[derive(Clone, Default)]
pub struct Registry {
    functions: HashMap<ArcStr, Arc<Func>>,
    by_tag: HashMap<String, Codec>,
    by_type: HashMap<TypeId, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that already knows how to move the common scalar and
    /// collection types.
    pub fn with_primitives() -> Self {
        let mut registry = Self::new();
        registry
            .register_type::<bool>()
            .register_type::<i32>()
            .register_type::<i64>()
            .register_type::<u32>()
            .register_type::<u64>()
            .register_type::<f64>()
            .register_type::<String>()
            .register_type::<Vec<i64>>()
            .register_type::<Vec<f64>>()
            .register_type::<Vec<String>>();
        registry
    }

    /// Register a function under `key` and return the handle tasks are built
    /// from. Registering the same key twice replaces the previous function.
    pub fn register_fn<F>(&mut self, key: &str, func: F) -> Function
    where
        F: Fn(Vec<Data>) -> anyhow::Result<Vec<Data>> + Send + Sync + 'static,
    {
        let key: ArcStr = key.into();
        let func: Arc<Func> = Arc::new(func);
        self.functions.insert(key.clone(), func.clone());
        Function { key, func }
    }

    pub fn function(&self, key: &str) -> Option<Function> {
        self.functions
            .get_key_value(key)
            .map(|(key, func)| Function {
                key: key.clone(),
                func: func.clone(),
            })
    }

    pub fn has_function(&self, key: &str) -> bool {
        self.functions.contains_key(key)
    }

    /// Register `T` under its Rust type name.
    pub fn register_type<T>(&mut self) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        self.register_codec::<T>(type_name::<T>())
    }

    /// Register `T` under an explicit tag. Both sides of the process boundary
    /// must use the same tag for the same type.
    pub fn register_codec<T>(&mut self, tag: &str) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        let codec = Codec {
            encode: encode::<T>,
            decode: decode::<T>,
        };
        self.by_tag.insert(tag.to_string(), codec);
        self.by_type.insert(TypeId::of::<T>(), tag.to_string());
        self
    }

    /// Whether `data` could be encoded. Null data always can.
    pub fn can_encode(&self, data: &Data) -> bool {
        match data.value_type_id() {
            Some(type_id) => self.by_type.contains_key(&type_id),
            None => true,
        }
    }

    /// Encode a value, `None` when its type has no codec.
    pub fn encode(&self, data: &Data) -> Option<Result<Payload, String>> {
        let Some(type_id) = data.value_type_id() else {
            return Some(Ok(Payload {
                tag: NULL_TAG.to_string(),
                body: ciborium::Value::Null,
            }));
        };

        let tag = self.by_type.get(&type_id)?;
        let codec = self.by_tag[tag];
        Some((codec.encode)(data).map(|body| Payload {
            tag: tag.clone(),
            body,
        }))
    }

    pub fn decode(&self, payload: &Payload) -> Result<Data, String> {
        if payload.tag == NULL_TAG {
            return Ok(Data::null());
        }

        let codec = self
            .by_tag
            .get(&payload.tag)
            .ok_or_else(|| format!("no codec registered for '{}'", payload.tag))?;
        (codec.decode)(&payload.body)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut functions: Vec<_> = self.functions.keys().collect();
        functions.sort();
        let mut codecs: Vec<_> = self.by_tag.keys().collect();
        codecs.sort();

        f.debug_struct("Registry")
            .field("functions", &functions)
            .field("codecs", &codecs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_primitive_codecs() {
        let registry = Registry::with_primitives();
        let payload = registry.encode(&Data::new(42_i64)).unwrap().unwrap();
        assert_eq!(payload.tag, "i64");

        let data = registry.decode(&payload).unwrap();
        assert_eq!(data.get::<i64>().unwrap(), &42);
    }

    #[test]
    fn test_custom_tag() {
        let mut registry = Registry::new();
        registry.register_codec::<Point>("point");

        let payload = registry
            .encode(&Data::new(Point { x: 1, y: 2 }))
            .unwrap()
            .unwrap();
        assert_eq!(payload.tag, "point");
        assert_eq!(
            registry.decode(&payload).unwrap().get::<Point>().unwrap(),
            &Point { x: 1, y: 2 }
        );
    }

    #[test]
    fn test_unregistered_type() {
        let registry = Registry::with_primitives();
        let data = Data::new(Point { x: 1, y: 2 });
        assert!(!registry.can_encode(&data));
        assert!(registry.encode(&data).is_none());
    }

    #[test]
    fn test_null_always_encodes() {
        let registry = Registry::new();
        assert!(registry.can_encode(&Data::null()));
        let payload = registry.encode(&Data::null()).unwrap().unwrap();
        assert!(registry.decode(&payload).unwrap().is_null());
    }

    #[test]
    fn test_unknown_tag() {
        let registry = Registry::new();
        let payload = Payload {
            tag: "nope".into(),
            body: ciborium::Value::Null,
        };
        assert!(registry.decode(&payload).unwrap_err().contains("nope"));
    }

    #[test]
    fn test_functions() {
        let mut registry = Registry::new();
        let function = registry.register_fn("noop", |_| Ok(vec![]));
        assert_eq!(function.key(), "noop");
        assert!(registry.has_function("noop"));
        assert_eq!(registry.function("noop").unwrap().key(), "noop");
        assert!(registry.function("missing").is_none());
    }
}
