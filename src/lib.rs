#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod catalog;
mod context;
mod core;
mod engine;
mod error;
pub mod logging;
mod pipeline;
pub mod process;
mod registry;
mod task;

use std::collections::HashMap;
use std::sync::Arc;

pub use crate::catalog::{Catalog, DataCatalog, Dataset, LambdaDataset, MemoryDataset, SharedCatalog};
pub use crate::context::{ProjectIdentity, RunContext, current as current_context};
pub use crate::core::Data;
pub use crate::engine::{
    Diagnostics, Host, MAX_WINDOWS_WORKERS, Mode, ResumeSuggestion, Runner, RunnerBuilder, Sizing,
    TaskExecution, required_workers,
};
pub use crate::error::*;
pub use crate::logging::LoggingConfig;
pub use crate::pipeline::{Graph, Pipeline};
pub use crate::process::WorkerCommand;
pub use crate::registry::{Payload, Registry};
pub use crate::task::{Func, Function, Task, TaskFn, run_task};

/// Everything a single call to [`run`] can be configured with.
#[derive(Debug, Default)]
pub struct RunOptions {
    pub mode: Mode,
    pub max_workers: Option<usize>,
    /// Forwarded to worker processes.
    pub logging: Option<LoggingConfig>,
    pub project: Option<ProjectIdentity>,
    /// Required in process mode unless every value is a primitive and no
    /// task is registered, which is rarely the case.
    pub registry: Option<Registry>,
    pub worker: Option<WorkerCommand>,
}

/// Build a [`Runner`] from `options` and run `graph` once.
pub fn run<G>(
    graph: &G,
    catalog: Arc<dyn Catalog>,
    options: RunOptions,
) -> Result<HashMap<String, Data>, RunError>
where
    G: Graph + ?Sized,
{
    let RunOptions {
        mode,
        max_workers,
        logging,
        project,
        registry,
        worker,
    } = options;

    let mut builder = Runner::builder().mode(mode);
    if let Some(max_workers) = max_workers {
        builder = builder.max_workers(max_workers);
    }
    if let Some(logging) = logging {
        builder = builder.logging(logging);
    }
    if let Some(project) = project {
        builder = builder.project(project);
    }
    if let Some(registry) = registry {
        builder = builder.registry(registry);
    }
    if let Some(worker) = worker {
        builder = builder.worker(worker);
    }

    builder.build()?.run(graph, catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_with_options() {
        let pipeline = Pipeline::new([Task::new("negate", TaskFn::closure(|inputs| {
            Ok(vec![Data::new(-inputs[0].get::<i64>()?)])
        }))
        .inputs(["x"])
        .outputs(["y"])])
        .unwrap();

        let catalog = DataCatalog::new();
        catalog.add_feed_dict([("x", Data::new(7_i64))]);

        let outputs = run(
            &pipeline,
            Arc::new(catalog),
            RunOptions {
                max_workers: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(outputs["y"].get::<i64>().unwrap(), &-7);
    }

    #[test]
    fn test_run_rejects_zero_workers() {
        let pipeline = Pipeline::new(Vec::<Task>::new()).unwrap();
        let err = run(
            &pipeline,
            Arc::new(DataCatalog::new()),
            RunOptions {
                max_workers: Some(0),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, RunError::Config(ConfigError::MaxWorkers(0))));
    }
}
