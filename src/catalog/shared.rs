use std::sync::{Arc, Mutex, PoisonError};

use crate::catalog::Catalog;
use crate::error::CatalogError;
use crate::registry::{Payload, Registry};

/// The parent-side view of a catalog that worker processes talk to.
///
/// Worker processes have no memory in common with the parent, so they never
/// touch the catalog directly. Every `load` and `save` they issue arrives here
/// as an encoded [`Payload`], is applied to the wrapped catalog one request at
/// a time, and is answered with an encoded value. Values saved by one worker
/// are therefore visible to every other worker.
#[derive(Clone)]
pub struct SharedCatalog {
    catalog: Arc<dyn Catalog>,
    registry: Arc<Registry>,
    access: Arc<Mutex<()>>,
}

impl SharedCatalog {
    pub fn new(catalog: Arc<dyn Catalog>, registry: Arc<Registry>) -> Self {
        Self {
            catalog,
            registry,
            access: Arc::new(Mutex::new(())),
        }
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    pub fn load(&self, name: &str) -> Result<Payload, CatalogError> {
        let data = {
            let _guard = self.access.lock().unwrap_or_else(PoisonError::into_inner);
            self.catalog.load(name)?
        };

        match self.registry.encode(&data) {
            Some(Ok(payload)) => Ok(payload),
            Some(Err(message)) => Err(CatalogError::Proxy(format!(
                "Couldn't encode '{name}': {message}"
            ))),
            None => Err(CatalogError::NotSerializable {
                name: name.to_string(),
                type_name: data.type_name().to_string(),
            }),
        }
    }

    pub fn save(&self, name: &str, payload: &Payload) -> Result<(), CatalogError> {
        let data = self
            .registry
            .decode(payload)
            .map_err(|message| CatalogError::Proxy(format!("Couldn't decode '{name}': {message}")))?;

        let _guard = self.access.lock().unwrap_or_else(PoisonError::into_inner);
        self.catalog.save(name, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DataCatalog;
    use crate::core::Data;

    struct Opaque;

    fn shared() -> (Arc<DataCatalog>, SharedCatalog) {
        let catalog = Arc::new(DataCatalog::new());
        let shared = SharedCatalog::new(catalog.clone(), Arc::new(Registry::with_primitives()));
        (catalog, shared)
    }

    #[test]
    fn test_values_cross_the_proxy() {
        let (catalog, shared) = shared();
        catalog.add_feed_dict([("a", Data::new(42_i64))]);

        let payload = shared.load("a").unwrap();
        shared.save("b", &payload).unwrap();

        assert_eq!(catalog.load("b").unwrap().get::<i64>().unwrap(), &42);
    }

    #[test]
    fn test_unregistered_value() {
        let (catalog, shared) = shared();
        catalog.add_feed_dict([("a", Data::new(Opaque))]);

        let err = shared.load("a").unwrap_err();
        assert!(matches!(err, CatalogError::NotSerializable { ref type_name, .. } if type_name.ends_with("Opaque")));
    }

    #[test]
    fn test_null_payload_is_rejected_by_catalog() {
        let (_, shared) = shared();
        let payload = Payload {
            tag: "null".into(),
            body: ciborium::Value::Null,
        };
        let err = shared.save("x", &payload).unwrap_err();
        assert!(matches!(err, CatalogError::Unsupported { .. }));
    }
}
