mod diagnostics;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::LazyLock;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use rayon::ThreadPool;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::catalog::Catalog;
use crate::engine::Dispatch;
use crate::error::{CatalogError, RunError, TaskError};
use crate::pipeline::Graph;
use crate::task::{Task, panic_message};

pub use diagnostics::{Diagnostics, ResumeSuggestion};

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

static RUN_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

static TASK_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("  {spinner:.blue} {msg} [{elapsed}]")
        .expect("Error setting progress bar template")
});

/// Sent back from a pool thread once a task is over.
struct Completion<'g> {
    task: &'g Task,
    result: Result<(), TaskError>,
    start: Instant,
    duration: Duration,
}

/// Reference counts deciding when an artifact can be dropped from the
/// catalog.
struct Releases<'g> {
    /// Number of tasks that still have to load each artifact.
    load_counts: HashMap<&'g str, usize>,
    /// Free inputs and run outputs, never released.
    keep: BTreeSet<String>,
    released: HashSet<&'g str>,
}

impl<'g> Releases<'g> {
    fn new<G>(graph: &'g G, catalog: &dyn Catalog) -> Self
    where
        G: Graph + ?Sized,
    {
        let mut load_counts = HashMap::new();
        for task in graph.task_units() {
            for input in task.input_names() {
                *load_counts.entry(input.as_str()).or_default() += 1;
            }
        }

        let mut keep = graph.inputs();
        keep.extend(graph.outputs());
        keep.extend(catalog.run_outputs());

        Self {
            load_counts,
            keep,
            released: HashSet::new(),
        }
    }

    /// Account for a completed task and release whatever nobody needs
    /// anymore.
    fn complete(&mut self, task: &'g Task, catalog: &dyn Catalog) -> Result<(), CatalogError> {
        for input in task.input_names() {
            if let Some(count) = self.load_counts.get_mut(input.as_str()) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.release(input, catalog)?;
                }
            }
        }

        for output in task.output_names() {
            if self.load_counts.get(output.as_str()).copied().unwrap_or(0) == 0 {
                self.release(output, catalog)?;
            }
        }

        Ok(())
    }

    fn release(&mut self, name: &'g str, catalog: &dyn Catalog) -> Result<(), CatalogError> {
        if self.keep.contains(name) || !self.released.insert(name) {
            return Ok(());
        }

        catalog.release(name)
    }
}

fn unschedulable(todo: &BTreeSet<&str>, done: &BTreeSet<&str>) -> RunError {
    RunError::Unschedulable {
        stuck: todo.iter().map(|name| name.to_string()).collect(),
        done: done.iter().map(|name| name.to_string()).collect(),
    }
}

/// Execute every task of `graph` on `pool`, each as soon as the tasks it
/// depends on are done.
///
/// The algorithm works as follows:
/// 1. Every task whose dependencies are all done is handed to `dispatch` on
///    the pool.
/// 2. The calling thread blocks until at least one of them reports back, then
///    takes every other result already available.
/// 3. A completed task is marked done; inputs no remaining task needs, and
///    outputs nobody will ever load, are released from the catalog.
/// 4. A failed task, or an artifact the catalog refused to release, stops
///    scheduling. Tasks still running are waited for and the failure is
///    returned together with a resume suggestion.
/// 5. The loop ends when nothing is left to run or running.
pub(crate) fn run_graph<G>(
    graph: &G,
    catalog: &dyn Catalog,
    dispatch: &dyn Dispatch,
    pool: &ThreadPool,
) -> Result<Diagnostics, RunError>
where
    G: Graph + ?Sized,
{
    let tasks = graph.task_units();
    let total = tasks.len();
    if total == 0 {
        return Ok(Diagnostics::default());
    }

    let by_name: HashMap<&str, &Task> = tasks.iter().map(|task| (task.name(), task)).collect();
    let dependencies = graph.dependency_map();
    let mut releases = Releases::new(graph, catalog);

    let mut todo: BTreeSet<&str> = by_name.keys().copied().collect();
    let mut in_flight: BTreeSet<&str> = BTreeSet::new();
    let mut done: BTreeSet<&str> = BTreeSet::new();
    let mut execution_times = HashMap::new();

    let root_span = tracing::span!(Level::INFO, "running_tasks");
    root_span.pb_set_length(total as u64);
    root_span.pb_set_style(&RUN_STYLE);
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    pool.in_place_scope(|s| -> Result<(), RunError> {
        let (sender, receiver) = channel::<Completion>();

        loop {
            let ready: Vec<&str> = todo
                .iter()
                .copied()
                .filter(|name| {
                    dependencies
                        .get(*name)
                        .is_none_or(|deps| deps.iter().all(|dep| done.contains(dep.as_str())))
                })
                .collect();

            for name in ready {
                todo.remove(name);
                in_flight.insert(name);

                let task = by_name[name];
                let sender = sender.clone();
                s.spawn(move |_| {
                    let span = tracing::span!(Level::INFO, "task", name = task.name());
                    span.pb_set_style(&TASK_STYLE);
                    span.pb_set_message(&format!("Running {}", task.name()));
                    let _enter = span.enter();

                    // Catalog calls may panic as well, and every job has to
                    // report back.
                    let start = Instant::now();
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| dispatch.execute(task)))
                        .unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(&*panic))));
                    let duration = start.elapsed();

                    // The receiver is gone only if the loop bailed out.
                    let _ = sender.send(Completion {
                        task,
                        result,
                        start,
                        duration,
                    });
                });
            }

            if in_flight.is_empty() {
                if todo.is_empty() {
                    break;
                }
                return Err(unschedulable(&todo, &done));
            }

            let Ok(first) = receiver.recv() else {
                return Err(unschedulable(&todo, &done));
            };

            let mut failure = None;
            for completion in std::iter::once(first).chain(receiver.try_iter()) {
                let name = completion.task.name();
                in_flight.remove(name);
                execution_times.insert(
                    name.to_string(),
                    TaskExecution {
                        start: completion.start,
                        duration: completion.duration,
                    },
                );

                match completion.result {
                    Ok(()) => {
                        done.insert(name);
                        root_span.pb_inc(1);
                        tracing::info!("Completed task: {}", name);
                        tracing::info!("Completed {} out of {} tasks", done.len(), total);
                        if failure.is_none()
                            && let Err(e) = releases.complete(completion.task, catalog)
                        {
                            tracing::error!("Couldn't release the artifacts of task '{}': {}", name, e);
                            failure = Some((name, TaskError::Catalog(e)));
                        }
                    }
                    Err(source) if failure.is_none() => failure = Some((name, source)),
                    Err(source) => tracing::error!("Task '{}' also failed: {}", name, source),
                }
            }

            if let Some((task, source)) = failure {
                tracing::error!("Task '{}' failed: {}", task, source);

                let resume = ResumeSuggestion::new(&dependencies, &done);
                resume.log();

                if !in_flight.is_empty() {
                    tracing::info!("Waiting for {} running task(s) to finish", in_flight.len());
                }
                while !in_flight.is_empty() {
                    let Ok(completion) = receiver.recv() else {
                        break;
                    };
                    let name = completion.task.name();
                    in_flight.remove(name);
                    match completion.result {
                        Ok(()) => tracing::debug!("Task '{}' finished after the run failed", name),
                        Err(e) => tracing::warn!("Task '{}' failed after the run failed: {}", name, e),
                    }
                }

                return Err(RunError::Task {
                    task: task.to_string(),
                    source,
                    resume,
                });
            }
        }

        Ok(())
    })?;

    tracing::info!("Pipeline execution completed successfully.");
    Ok(Diagnostics { execution_times })
}
