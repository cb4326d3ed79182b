use crate::catalog::Dataset;
use crate::core::Data;

type LoadFn = Box<dyn Fn() -> anyhow::Result<Data> + Send + Sync>;
type SaveFn = Box<dyn Fn(Data) -> anyhow::Result<()> + Send + Sync>;
type ReleaseFn = Box<dyn Fn() + Send + Sync>;

/// A dataset whose behaviour is supplied as closures, for wiring existing
/// storage code into a catalog without writing a new [`Dataset`] type.
pub struct LambdaDataset {
    load: LoadFn,
    save: Option<SaveFn>,
    release: Option<ReleaseFn>,
}

impl LambdaDataset {
    pub fn new<L>(load: L) -> Self
    where
        L: Fn() -> anyhow::Result<Data> + Send + Sync + 'static,
    {
        Self {
            load: Box::new(load),
            save: None,
            release: None,
        }
    }

    pub fn on_save<S>(mut self, save: S) -> Self
    where
        S: Fn(Data) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.save = Some(Box::new(save));
        self
    }

    pub fn on_release<R>(mut self, release: R) -> Self
    where
        R: Fn() + Send + Sync + 'static,
    {
        self.release = Some(Box::new(release));
        self
    }
}

impl Dataset for LambdaDataset {
    fn load(&self) -> anyhow::Result<Data> {
        (self.load)()
    }

    fn save(&self, data: Data) -> anyhow::Result<()> {
        match &self.save {
            Some(save) => save(data),
            None => anyhow::bail!("Cannot save to a LambdaDataset without a save function"),
        }
    }

    fn release(&self) {
        if let Some(release) = &self.release {
            release();
        }
    }

    fn describe(&self) -> String {
        format!(
            "LambdaDataset(save={}, release={})",
            self.save.is_some(),
            self.release.is_some()
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_closures_are_called() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();

        let dataset = LambdaDataset::new(|| Ok(Data::new(1_i64)))
            .on_release(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        assert_eq!(dataset.load().unwrap().get::<i64>().unwrap(), &1);
        assert!(dataset.save(Data::new(2_i64)).is_err());
        dataset.release();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(dataset.describe(), "LambdaDataset(save=false, release=true)");
    }
}
