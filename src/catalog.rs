//! Named artifact storage.
//!
//! The runner never persists anything itself. It asks a [`Catalog`] to load
//! the inputs of a task, to save its outputs, and to release artifacts as soon
//! as no remaining task needs them. [`DataCatalog`] is the implementation
//! shipped with the crate: a map from names to [`Dataset`]s, which falls back
//! to a [`MemoryDataset`] for any name it has not been told about.

mod lambda;
mod memory;
mod shared;

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

pub use lambda::LambdaDataset;
pub use memory::MemoryDataset;
pub use shared::SharedCatalog;

use crate::core::Data;
use crate::error::CatalogError;

/// A single persisted (or in-memory) artifact.
pub trait Dataset: Send + Sync {
    fn load(&self) -> anyhow::Result<Data>;

    fn save(&self, data: Data) -> anyhow::Result<()>;

    /// Drop whatever the dataset caches. Must be safe to call on an empty
    /// dataset.
    fn release(&self) {}

    /// The value, if it is already held in memory and can be handed out
    /// without doing any I/O.
    fn materialized(&self) -> Option<Data> {
        None
    }

    fn describe(&self) -> String;
}

/// What the runner needs from artifact storage.
///
/// Implementations must be safe to call from several worker threads at once.
pub trait Catalog: Send + Sync {
    fn load(&self, name: &str) -> Result<Data, CatalogError>;

    fn save(&self, name: &str, data: Data) -> Result<(), CatalogError>;

    fn release(&self, name: &str) -> Result<(), CatalogError>;

    fn contains(&self, name: &str) -> bool;

    fn list(&self) -> Vec<String>;

    /// Names the caller wants kept after the run, in addition to the outputs
    /// of the graph.
    fn run_outputs(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// See [`Dataset::materialized`].
    fn materialized(&self, _name: &str) -> Option<Data> {
        None
    }
}

/// Map of datasets guarded by a lock, usable from any number of threads.
#[derive(Default)]
pub struct DataCatalog {
    datasets: RwLock<HashMap<String, Box<dyn Dataset>>>,
    retained: RwLock<BTreeSet<String>>,
}

impl DataCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<D>(self, name: &str, dataset: D) -> Self
    where
        D: Dataset + 'static,
    {
        self.add(name, dataset);
        self
    }

    /// Register `dataset` under `name`, replacing any previous one.
    pub fn add<D>(&self, name: &str, dataset: D)
    where
        D: Dataset + 'static,
    {
        self.datasets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Box::new(dataset));
    }

    /// Register every value as an in-memory dataset.
    pub fn add_feed_dict<I, S>(&self, feed: I)
    where
        I: IntoIterator<Item = (S, Data)>,
        S: Into<String>,
    {
        let mut datasets = self.datasets.write().unwrap_or_else(PoisonError::into_inner);
        for (name, data) in feed {
            datasets.insert(name.into(), Box::new(MemoryDataset::new(data)));
        }
    }

    /// Keep `name` after the run and return it with the results.
    pub fn retain(&self, name: &str) {
        self.retained
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
    }

    pub fn describe(&self, name: &str) -> Option<String> {
        self.datasets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|dataset| dataset.describe())
    }
}

impl Catalog for DataCatalog {
    fn load(&self, name: &str) -> Result<Data, CatalogError> {
        let datasets = self.datasets.read().unwrap_or_else(PoisonError::into_inner);
        let dataset = datasets.get(name).ok_or_else(|| CatalogError::NotFound {
            name: name.to_string(),
        })?;

        tracing::debug!("Loading data from '{}' ({})", name, dataset.describe());
        dataset.load().map_err(|e| CatalogError::Dataset {
            name: name.to_string(),
            message: format!("{e:#}"),
        })
    }

    fn save(&self, name: &str, data: Data) -> Result<(), CatalogError> {
        if data.is_null() {
            return Err(CatalogError::Unsupported {
                name: name.to_string(),
                message: "Saving 'null' to a dataset is not allowed".to_string(),
            });
        }

        {
            let datasets = self.datasets.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(dataset) = datasets.get(name) {
                tracing::debug!("Saving data to '{}' ({})", name, dataset.describe());
                return dataset.save(data).map_err(|e| CatalogError::Dataset {
                    name: name.to_string(),
                    message: format!("{e:#}"),
                });
            }
        }

        // Unregistered names default to an in-memory dataset.
        tracing::debug!("Saving data to '{}' (default MemoryDataset)", name);
        self.datasets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| Box::new(MemoryDataset::empty()) as Box<dyn Dataset>)
            .save(data)
            .map_err(|e| CatalogError::Dataset {
                name: name.to_string(),
                message: format!("{e:#}"),
            })
    }

    fn release(&self, name: &str) -> Result<(), CatalogError> {
        let datasets = self.datasets.read().unwrap_or_else(PoisonError::into_inner);
        let dataset = datasets.get(name).ok_or_else(|| CatalogError::NotFound {
            name: name.to_string(),
        })?;

        tracing::debug!("Releasing data from '{}'", name);
        dataset.release();
        Ok(())
    }

    fn contains(&self, name: &str) -> bool {
        self.datasets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .datasets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn run_outputs(&self) -> BTreeSet<String> {
        self.retained
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn materialized(&self, name: &str) -> Option<Data> {
        self.datasets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)?
            .materialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_dict() {
        let catalog = DataCatalog::new();
        catalog.add_feed_dict([("a", Data::new(1_i64)), ("b", Data::new(2_i64))]);

        assert_eq!(catalog.list(), ["a", "b"]);
        assert_eq!(catalog.load("b").unwrap().get::<i64>().unwrap(), &2);
        assert!(catalog.materialized("a").is_some());
    }

    #[test]
    fn test_default_dataset() {
        let catalog = DataCatalog::new();
        assert!(!catalog.contains("x"));

        catalog.save("x", Data::new("hello".to_string())).unwrap();

        assert!(catalog.contains("x"));
        assert_eq!(catalog.describe("x").unwrap(), "MemoryDataset(data=<alloc::string::String>)");
    }

    #[test]
    fn test_null_save_is_unsupported() {
        let catalog = DataCatalog::new();
        let err = catalog.save("x", Data::null()).unwrap_err();
        assert!(matches!(err, CatalogError::Unsupported { ref name, .. } if name == "x"));
        assert!(err.to_string().contains("Saving 'null' to a dataset is not allowed"));
    }

    #[test]
    fn test_release() {
        let catalog = DataCatalog::new();
        catalog.add_feed_dict([("a", Data::new(1_i64))]);
        catalog.release("a").unwrap();

        let err = catalog.load("a").unwrap_err();
        assert!(matches!(err, CatalogError::Dataset { .. }));
        assert!(catalog.release("missing").is_err());
    }

    #[test]
    fn test_missing() {
        let catalog = DataCatalog::new();
        assert_eq!(
            catalog.load("nope").unwrap_err(),
            CatalogError::NotFound { name: "nope".into() }
        );
    }

    #[test]
    fn test_retain() {
        let catalog = DataCatalog::new();
        catalog.retain("keep");
        assert_eq!(catalog.run_outputs(), BTreeSet::from(["keep".to_string()]));
    }
}
