mod dispatch;
mod runner;
mod sizing;

use std::collections::HashMap;
use std::fmt::Display;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, SharedCatalog};
use crate::context::{self, ProjectIdentity, RunContext};
use crate::core::Data;
use crate::error::{ConfigError, RunError};
use crate::logging::{self, LoggingConfig};
use crate::pipeline::Graph;
use crate::process::{Bootstrap, ProcessDispatch, WorkerCommand, guard};
use crate::registry::Registry;

pub(crate) use dispatch::{Dispatch, ThreadDispatch};
pub use runner::{Diagnostics, ResumeSuggestion, TaskExecution};
pub use sizing::{Host, MAX_WINDOWS_WORKERS, Sizing, required_workers};

/// Where task bodies run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Worker threads of this process, sharing the catalog directly.
    #[default]
    Thread,
    /// Worker processes, talking to the catalog through the parent.
    Process,
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Thread => f.write_str("thread"),
            Mode::Process => f.write_str("process"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thread" => Ok(Mode::Thread),
            "process" => Ok(Mode::Process),
            other => Err(format!("unknown mode '{other}', expected 'thread' or 'process'")),
        }
    }
}

/// Runs a task graph to completion with bounded concurrency.
///
/// ```rust
/// use std::sync::Arc;
/// use nagare::{Data, DataCatalog, Pipeline, Runner, Task, TaskFn};
///
/// let pipeline = Pipeline::new([
///     Task::new("double", TaskFn::closure(|inputs| {
///         Ok(vec![Data::new(inputs[0].get::<i64>()? * 2)])
///     }))
///     .inputs(["x"])
///     .outputs(["y"]),
/// ])
/// .unwrap();
///
/// let catalog = DataCatalog::new();
/// catalog.add_feed_dict([("x", Data::new(21_i64))]);
///
/// let runner = Runner::builder().build().unwrap();
/// let outputs = runner.run(&pipeline, Arc::new(catalog)).unwrap();
///
/// assert_eq!(outputs["y"].get::<i64>().unwrap(), &42);
/// ```
#[derive(Debug, Clone)]
pub struct Runner {
    mode: Mode,
    max_workers: Option<NonZeroUsize>,
    logging: Option<LoggingConfig>,
    project: Option<ProjectIdentity>,
    registry: Arc<Registry>,
    worker: Option<WorkerCommand>,
}

#[derive(Debug, Default)]
pub struct RunnerBuilder {
    mode: Mode,
    max_workers: Option<usize>,
    logging: Option<LoggingConfig>,
    project: Option<ProjectIdentity>,
    registry: Option<Arc<Registry>>,
    worker: Option<WorkerCommand>,
}

impl RunnerBuilder {
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Upper bound on concurrently running tasks. Must be positive.
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    /// Logging set up in every worker process. Defaults to whatever
    /// [`logging::init`] installed in this process, if anything.
    pub fn logging(mut self, config: LoggingConfig) -> Self {
        self.logging = Some(config);
        self
    }

    pub fn project(mut self, project: ProjectIdentity) -> Self {
        self.project = Some(project);
        self
    }

    /// Functions and codecs available to worker processes. Only consulted in
    /// [`Mode::Process`].
    pub fn registry(mut self, registry: impl Into<Arc<Registry>>) -> Self {
        self.registry = Some(registry.into());
        self
    }

    /// Program spawned as worker process, the current executable by default.
    pub fn worker(mut self, command: WorkerCommand) -> Self {
        self.worker = Some(command);
        self
    }

    pub fn build(self) -> Result<Runner, ConfigError> {
        let max_workers = match self.max_workers {
            Some(n) => Some(NonZeroUsize::new(n).ok_or(ConfigError::MaxWorkers(n))?),
            None => None,
        };

        Ok(Runner {
            mode: self.mode,
            max_workers,
            logging: self.logging,
            project: self.project,
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(Registry::with_primitives())),
            worker: self.worker,
        })
    }
}

impl Runner {
    pub fn builder() -> RunnerBuilder {
        RunnerBuilder::default()
    }

    /// Number of workers a run of `graph` would use on this host.
    pub fn workers_for<G>(&self, graph: &G) -> usize
    where
        G: Graph + ?Sized,
    {
        Sizing::detect(self.max_workers).workers(graph, self.mode)
    }

    /// Run `graph` and return the values of its run outputs: the artifacts no
    /// task consumes, plus whatever the catalog asked to retain.
    pub fn run<G>(&self, graph: &G, catalog: Arc<dyn Catalog>) -> Result<HashMap<String, Data>, RunError>
    where
        G: Graph + ?Sized,
    {
        self.run_with_diagnostics(graph, catalog)
            .map(|(outputs, _)| outputs)
    }

    pub fn run_with_diagnostics<G>(
        &self,
        graph: &G,
        catalog: Arc<dyn Catalog>,
    ) -> Result<(HashMap<String, Data>, Diagnostics), RunError>
    where
        G: Graph + ?Sized,
    {
        let missing: Vec<String> = graph
            .inputs()
            .into_iter()
            .filter(|name| !catalog.contains(name))
            .collect();
        if !missing.is_empty() {
            return Err(RunError::MissingInputs(missing));
        }

        let context = RunContext {
            run_id: uuid::Uuid::new_v4().to_string(),
            mode: self.mode,
            project: self.project.clone(),
        };
        context::install(&context);

        let workers = self.workers_for(graph);
        tracing::info!(
            "Running {} tasks with {} {} worker(s) (run {})",
            graph.task_units().len(),
            workers,
            self.mode,
            context.run_id
        );

        let dispatch: Box<dyn Dispatch> = match self.mode {
            Mode::Thread => Box::new(ThreadDispatch::new(catalog.clone())),
            Mode::Process => {
                guard::assert_graph_transferable(graph, catalog.as_ref(), &self.registry)?;

                let command = match &self.worker {
                    Some(command) => command.clone(),
                    None => WorkerCommand::current().map_err(RunError::WorkerCommand)?,
                };
                let bootstrap = Bootstrap {
                    context: context.clone(),
                    logging: self
                        .logging
                        .clone()
                        .or_else(|| logging::installed().cloned())
                        .map(|config| LoggingConfig {
                            progress: false,
                            ..config
                        }),
                };

                Box::new(ProcessDispatch::new(
                    command,
                    SharedCatalog::new(catalog.clone(), self.registry.clone()),
                    bootstrap,
                ))
            }
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("nagare-worker-{i}"))
            .build()?;

        let diagnostics = runner::run_graph(graph, catalog.as_ref(), dispatch.as_ref(), &pool)?;

        let mut names = graph.outputs();
        names.extend(catalog.run_outputs());

        let mut outputs = HashMap::with_capacity(names.len());
        for name in names {
            let data = catalog.load(&name)?;
            outputs.insert(name, data);
        }

        Ok((outputs, diagnostics))
    }
}
