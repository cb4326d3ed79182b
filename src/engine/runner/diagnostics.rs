use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::engine::TaskExecution;
use crate::pipeline::Graph;

/// Run diagnostics and performance metrics.
///
/// Returned by [`Runner::run_with_diagnostics`](crate::Runner::run_with_diagnostics),
/// holds the start time and duration of every task that ran.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Task name to its execution metrics.
    pub execution_times: HashMap<String, TaskExecution>,
}

impl Diagnostics {
    /// Renders the task graph as a Mermaid diagram, color-coded by execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Grey**: Did not run
    pub fn render_mermaid<G>(&self, graph: &G) -> String
    where
        G: Graph + ?Sized,
    {
        use std::fmt::Write;

        let mut f = String::new();
        writeln!(f, "graph LR").unwrap();

        let times = &self.execution_times;
        let (min_time, max_time) = times
            .values()
            .map(|t| t.duration.as_secs_f64())
            .fold(None, |acc: Option<(f64, f64)>, secs| match acc {
                Some((lo, hi)) => Some((lo.min(secs), hi.max(secs))),
                None => Some((secs, secs)),
            })
            .unwrap_or((0.0, 0.0));

        // Avoid divide by zero if all tasks took same time
        let span = if (max_time - min_time).abs() < f64::EPSILON {
            1.0
        } else {
            max_time - min_time
        };

        let tasks = graph.task_units();
        let ids: HashMap<&str, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, task)| (task.name(), i))
            .collect();

        for (i, task) in tasks.iter().enumerate() {
            let name = task.name().replace('"', "\\\"");

            let (label_extra, color_code) = match times.get(task.name()) {
                Some(exec) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / span;
                    (format!("{:.2?}", exec.duration), duration_color(t))
                }
                None => ("Not run".to_string(), "#D3D3D3".to_string()),
            };

            writeln!(f, "    {i}[\"{name}\\n{label_extra}\"]").unwrap();
            writeln!(f, "    style {i} fill:{color_code}").unwrap();
        }

        let mut edges: Vec<(usize, usize)> = graph
            .dependency_map()
            .iter()
            .filter_map(|(task, deps)| ids.get(task.as_str()).map(|&target| (deps, target)))
            .flat_map(|(deps, target)| {
                deps.iter()
                    .filter_map(|dep| ids.get(dep.as_str()).copied())
                    .map(move |source| (source, target))
            })
            .collect();
        edges.sort_unstable();

        for (source, target) in edges {
            writeln!(f, "    {source} --> {target}").unwrap();
        }

        f
    }
}

/// 0.0 (Green) -> 0.5 (Yellow) -> 1.0 (Red)
fn duration_color(t: f64) -> String {
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };
    format!("#{r:02X}{g:02X}00")
}

/// What is left to do after a failed run, and where to pick it up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeSuggestion {
    pub completed: BTreeSet<String>,
    pub remaining: BTreeSet<String>,
    /// Remaining tasks whose dependencies all completed. Running the
    /// pipeline from these tasks redoes exactly the remaining work.
    pub resume_from: BTreeSet<String>,
}

impl ResumeSuggestion {
    pub(crate) fn new(dependencies: &HashMap<String, BTreeSet<String>>, done: &BTreeSet<&str>) -> Self {
        let completed: BTreeSet<String> = done.iter().map(|name| name.to_string()).collect();

        let remaining: BTreeSet<String> = dependencies
            .keys()
            .filter(|name| !done.contains(name.as_str()))
            .cloned()
            .collect();

        let resume_from = remaining
            .iter()
            .filter(|name| {
                dependencies[name.as_str()]
                    .iter()
                    .all(|dep| done.contains(dep.as_str()))
            })
            .cloned()
            .collect();

        Self {
            completed,
            remaining,
            resume_from,
        }
    }

    /// The argument to pass to rerun only the remaining work, if anything
    /// completed at all.
    pub fn hint(&self) -> Option<String> {
        if self.completed.is_empty() || self.resume_from.is_empty() {
            return None;
        }

        let names: Vec<&str> = self.resume_from.iter().map(String::as_str).collect();
        Some(format!("--from-tasks \"{}\"", names.join(",")))
    }

    pub(crate) fn log(&self) {
        match self.hint() {
            Some(hint) => tracing::warn!(
                "There are {} tasks that have not run.\nYou can resume the pipeline run by adding \
                 the following argument to your previous command:\n  {}",
                self.remaining.len(),
                console::style(hint).for_stderr().yellow()
            ),
            None => tracing::warn!("There are {} tasks that have not run.", self.remaining.len()),
        }
    }
}

impl Display for ResumeSuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} completed, {} remaining", self.completed.len(), self.remaining.len())?;
        if let Some(hint) = self.hint() {
            write!(f, ", resume with {hint}")?;
        }
        Ok(())
    }
}
