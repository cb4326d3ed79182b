//! The task graph.
//!
//! Tasks are wired implicitly: an edge goes from the task producing an
//! artifact to every task listing it as an input. The runner only needs the
//! [`Graph`] view of that structure; [`Pipeline`] is the implementation
//! shipped with the crate and keeps the edges in a `petgraph` graph.

use std::collections::{BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use crate::error::PipelineError;
use crate::task::Task;

/// What the runner consumes from a task graph.
pub trait Graph {
    fn task_units(&self) -> &[Task];

    /// For each task name, the names of the tasks producing its inputs.
    fn dependency_map(&self) -> HashMap<String, BTreeSet<String>>;

    /// Groups of mutually independent tasks, in dependency order. Only used
    /// for worker sizing.
    fn topological_layers(&self) -> Vec<Vec<String>>;

    /// Free inputs: artifacts consumed by some task and produced by none.
    fn inputs(&self) -> BTreeSet<String>;

    /// Artifacts produced by some task and consumed by none.
    fn outputs(&self) -> BTreeSet<String>;
}

/// A validated, acyclic set of tasks.
#[derive(Debug, Clone)]
pub struct Pipeline {
    tasks: Vec<Task>,
    /// Node weights index into `tasks`, edge weights are artifact names.
    graph: DiGraph<usize, String>,
}

impl Pipeline {
    pub fn new(tasks: impl IntoIterator<Item = Task>) -> Result<Self, PipelineError> {
        let tasks: Vec<Task> = tasks.into_iter().collect();

        let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
        let mut by_name = HashMap::with_capacity(tasks.len());
        let mut producers: HashMap<&str, usize> = HashMap::new();

        for (i, task) in tasks.iter().enumerate() {
            if by_name.insert(task.name(), graph.add_node(i)).is_some() {
                return Err(PipelineError::DuplicateTask(task.name().to_string()));
            }

            for output in task.output_names() {
                if let Some(first) = producers.insert(output, i) {
                    return Err(PipelineError::DuplicateOutput {
                        output: output.clone(),
                        first: tasks[first].name().to_string(),
                        second: task.name().to_string(),
                    });
                }
            }
        }

        for (i, task) in tasks.iter().enumerate() {
            let consumer = NodeIndex::new(i);
            for input in task.input_names() {
                if let Some(&producer) = producers.get(input.as_str()) {
                    graph.add_edge(NodeIndex::new(producer), consumer, input.clone());
                }
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            let task = tasks[graph[cycle.node_id()]].name().to_string();
            return Err(PipelineError::Cycle { task });
        }

        Ok(Self { tasks, graph })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The sub-pipeline made of the named tasks and every task downstream of
    /// them. This is how a run is resumed from a
    /// [`ResumeSuggestion`](crate::ResumeSuggestion).
    pub fn from_tasks<S: AsRef<str>>(&self, names: &[S]) -> Result<Self, PipelineError> {
        let mut keep = BTreeSet::new();

        for name in names {
            let name = name.as_ref();
            let start = self
                .tasks
                .iter()
                .position(|task| task.name() == name)
                .ok_or_else(|| PipelineError::UnknownTask(name.to_string()))?;

            let mut dfs = Dfs::new(&self.graph, NodeIndex::new(start));
            while let Some(index) = dfs.next(&self.graph) {
                keep.insert(self.graph[index]);
            }
        }

        Self::new(keep.into_iter().map(|i| self.tasks[i].clone()))
    }

    fn all_inputs(&self) -> BTreeSet<String> {
        self.tasks
            .iter()
            .flat_map(|task| task.input_names().iter().cloned())
            .collect()
    }

    fn all_outputs(&self) -> BTreeSet<String> {
        self.tasks
            .iter()
            .flat_map(|task| task.output_names().iter().cloned())
            .collect()
    }

    /// Render the graph as a Mermaid diagram with artifacts on the edges.
    pub fn to_mermaid(&self) -> String {
        use petgraph::visit::EdgeRef;
        use std::fmt::Write;

        let mut f = String::new();
        writeln!(f, "graph LR").unwrap();

        for index in self.graph.node_indices() {
            let name = self.tasks[self.graph[index]].name().replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name).unwrap();
        }

        for edge in self.graph.edge_references() {
            writeln!(
                f,
                "    {:?} -- \"{}\" --> {:?}",
                edge.source().index(),
                edge.weight().replace('"', "\\\""),
                edge.target().index()
            )
            .unwrap();
        }

        f
    }
}

impl Graph for Pipeline {
    fn task_units(&self) -> &[Task] {
        &self.tasks
    }

    fn dependency_map(&self) -> HashMap<String, BTreeSet<String>> {
        self.graph
            .node_indices()
            .map(|index| {
                let dependencies = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .map(|dep| self.tasks[self.graph[dep]].name().to_string())
                    .collect();
                (self.tasks[self.graph[index]].name().to_string(), dependencies)
            })
            .collect()
    }

    fn topological_layers(&self) -> Vec<Vec<String>> {
        // Graph was checked for cycles on construction.
        let order = toposort(&self.graph, None).unwrap_or_default();

        // depth(task) = 1 + max(depth(dependency)), roots are at depth 0.
        let mut depth = vec![0usize; self.tasks.len()];
        for &index in &order {
            depth[index.index()] = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .map(|dep| depth[dep.index()] + 1)
                .max()
                .unwrap_or(0);
        }

        let mut layers: Vec<Vec<String>> = Vec::new();
        for index in self.graph.node_indices() {
            let d = depth[index.index()];
            if layers.len() <= d {
                layers.resize_with(d + 1, Vec::new);
            }
            layers[d].push(self.tasks[self.graph[index]].name().to_string());
        }
        for layer in &mut layers {
            layer.sort();
        }
        layers
    }

    fn inputs(&self) -> BTreeSet<String> {
        let outputs = self.all_outputs();
        self.all_inputs()
            .into_iter()
            .filter(|name| !outputs.contains(name))
            .collect()
    }

    fn outputs(&self) -> BTreeSet<String> {
        let inputs = self.all_inputs();
        self.all_outputs()
            .into_iter()
            .filter(|name| !inputs.contains(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Data;
    use crate::task::TaskFn;

    fn task(name: &str, inputs: &[&str], outputs: &[&str]) -> Task {
        let n = outputs.len();
        Task::new(
            name,
            TaskFn::closure(move |_| Ok(vec![Data::null(); n])),
        )
        .inputs(inputs.iter().copied())
        .outputs(outputs.iter().copied())
    }

    /// A -> {B, C, D} -> Z
    fn fan_out_fan_in() -> Pipeline {
        Pipeline::new([
            task("identity_1", &["A"], &["B"]),
            task("identity_2", &["B"], &["C"]),
            task("identity_3", &["B"], &["D"]),
            task("identity_4", &["B"], &["E"]),
            task("fan_in", &["C", "D", "E"], &["Z"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_inputs_outputs() {
        let pipeline = fan_out_fan_in();
        assert_eq!(pipeline.inputs(), BTreeSet::from(["A".to_string()]));
        assert_eq!(pipeline.outputs(), BTreeSet::from(["Z".to_string()]));
    }

    #[test]
    fn test_dependency_map() {
        let deps = fan_out_fan_in().dependency_map();
        assert!(deps["identity_1"].is_empty());
        assert_eq!(deps["identity_2"], BTreeSet::from(["identity_1".to_string()]));
        assert_eq!(deps["fan_in"].len(), 3);
    }

    #[test]
    fn test_layers() {
        let layers = fan_out_fan_in().topological_layers();
        assert_eq!(
            layers,
            vec![
                vec!["identity_1".to_string()],
                vec![
                    "identity_2".to_string(),
                    "identity_3".to_string(),
                    "identity_4".to_string()
                ],
                vec!["fan_in".to_string()],
            ]
        );
    }

    #[test]
    fn test_cycle() {
        let err = Pipeline::new([task("a", &["x"], &["y"]), task("b", &["y"], &["x"])])
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cycle { .. }));
    }

    #[test]
    fn test_duplicate_output() {
        let err = Pipeline::new([task("a", &[], &["x"]), task("b", &[], &["x"])]).unwrap_err();
        assert_eq!(
            err,
            PipelineError::DuplicateOutput {
                output: "x".into(),
                first: "a".into(),
                second: "b".into(),
            }
        );
    }

    #[test]
    fn test_duplicate_task() {
        let err = Pipeline::new([task("a", &[], &["x"]), task("a", &[], &["y"])]).unwrap_err();
        assert_eq!(err, PipelineError::DuplicateTask("a".into()));
    }

    #[test]
    fn test_from_tasks() {
        let pipeline = fan_out_fan_in();
        let sub = pipeline.from_tasks(&["identity_3"]).unwrap();
        let mut names: Vec<_> = sub.task_units().iter().map(|t| t.name()).collect();
        names.sort();
        assert_eq!(names, ["fan_in", "identity_3"]);
        // B, C and E are produced by tasks left out.
        assert_eq!(sub.inputs(), BTreeSet::from(["B", "C", "E"].map(String::from)));
    }

    #[test]
    fn test_from_unknown_task() {
        let err = fan_out_fan_in().from_tasks(&["nope"]).unwrap_err();
        assert_eq!(err, PipelineError::UnknownTask("nope".into()));
    }

    #[test]
    fn test_mermaid() {
        let mermaid = fan_out_fan_in().to_mermaid();
        assert!(mermaid.starts_with("graph LR"));
        assert!(mermaid.contains("\"fan_in\""));
        assert!(mermaid.contains("-- \"B\" -->"));
    }
}
