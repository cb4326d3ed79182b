use std::sync::{Mutex, PoisonError};

use anyhow::anyhow;

use crate::catalog::Dataset;
use crate::core::Data;

/// Keeps a single value in memory until it is released.
///
/// This is what the catalog uses for every intermediate artifact it was not
/// explicitly told how to persist.
#[derive(Default)]
pub struct MemoryDataset {
    data: Mutex<Option<Data>>,
}

impl MemoryDataset {
    pub fn new(data: Data) -> Self {
        Self {
            data: Mutex::new(Some(data)),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl Dataset for MemoryDataset {
    fn load(&self) -> anyhow::Result<Data> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| anyhow!("Data for MemoryDataset has not been saved yet."))
    }

    fn save(&self, data: Data) -> anyhow::Result<()> {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = Some(data);
        Ok(())
    }

    fn release(&self) {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn materialized(&self) -> Option<Data> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn describe(&self) -> String {
        match &*self.data.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(data) => format!("MemoryDataset(data=<{}>)", data.type_name()),
            None => String::from("MemoryDataset()"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let dataset = MemoryDataset::empty();
        assert!(dataset.materialized().is_none());
        assert!(dataset.load().is_err());
        assert_eq!(dataset.describe(), "MemoryDataset()");

        dataset.save(Data::new(7_u32)).unwrap();
        assert!(dataset.materialized().is_some());
        assert_eq!(dataset.load().unwrap().get::<u32>().unwrap(), &7);
        assert_eq!(dataset.describe(), "MemoryDataset(data=<u32>)");

        dataset.release();
        assert!(dataset.materialized().is_none());
    }
}
