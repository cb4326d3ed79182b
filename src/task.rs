//! Task units, the nodes of a pipeline.
//!
//! A [`Task`] is a named computation with an ordered list of input artifact
//! names and an ordered list of output artifact names. The runner wires tasks
//! together purely by these names: a task depends on whichever task produces
//! one of its inputs.
//!
//! The computation is a [`TaskFn`]. It is either a function registered by name
//! in a [`Registry`](crate::Registry), which a worker process can look up on
//! its own, or an ad-hoc closure which only ever runs in the process that
//! built it.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::core::{ArcStr, Data};
use crate::error::TaskError;

/// Signature shared by every task body: one value per declared input in, one
/// value per declared output out.
pub type Func = dyn Fn(Vec<Data>) -> anyhow::Result<Vec<Data>> + Send + Sync;

/// A function registered under a stable key.
///
/// Obtained from [`Registry::register_fn`](crate::Registry::register_fn) or
/// [`Registry::function`](crate::Registry::function).
#[derive(Clone)]
pub struct Function {
    pub(crate) key: ArcStr,
    pub(crate) func: Arc<Func>,
}

impl Function {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Function({})", self.key)
    }
}

/// The computation of a task.
#[derive(Clone)]
pub enum TaskFn {
    /// Resolvable by key in any process holding the same registry.
    Registered(Function),
    /// Bound to this process.
    Closure(Arc<Func>),
}

impl TaskFn {
    pub fn closure<F>(func: F) -> Self
    where
        F: Fn(Vec<Data>) -> anyhow::Result<Vec<Data>> + Send + Sync + 'static,
    {
        TaskFn::Closure(Arc::new(func))
    }

    /// Registry key, `None` for closures.
    pub fn key(&self) -> Option<&str> {
        match self {
            TaskFn::Registered(function) => Some(function.key()),
            TaskFn::Closure(_) => None,
        }
    }

    fn call(&self, inputs: Vec<Data>) -> anyhow::Result<Vec<Data>> {
        match self {
            TaskFn::Registered(function) => (function.func)(inputs),
            TaskFn::Closure(func) => func(inputs),
        }
    }
}

impl From<Function> for TaskFn {
    fn from(function: Function) -> Self {
        TaskFn::Registered(function)
    }
}

impl From<&Function> for TaskFn {
    fn from(function: &Function) -> Self {
        TaskFn::Registered(function.clone())
    }
}

/// A single unit of work in a pipeline.
///
/// ```rust
/// use nagare::{Data, Task, TaskFn};
///
/// let task = Task::new("double", TaskFn::closure(|inputs| {
///     let x = inputs[0].get::<i64>()?;
///     Ok(vec![Data::new(x * 2)])
/// }))
/// .inputs(["x"])
/// .outputs(["y"]);
///
/// assert_eq!(task.name(), "double");
/// ```
#[derive(Clone)]
pub struct Task {
    name: ArcStr,
    inputs: Vec<String>,
    outputs: Vec<String>,
    func: TaskFn,
}

impl Task {
    pub fn new(name: impl Into<String>, func: impl Into<TaskFn>) -> Self {
        let name: String = name.into();
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            func: func.into(),
        }
    }

    pub fn inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_names(&self) -> &[String] {
        &self.inputs
    }

    pub fn output_names(&self) -> &[String] {
        &self.outputs
    }

    pub fn func(&self) -> &TaskFn {
        &self.func
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("func", &self.func.key().unwrap_or("<closure>"))
            .finish()
    }
}

/// Text of a panic payload, as far as it can be recovered.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}

/// Run one task against a catalog: load its inputs, call it, save its
/// outputs.
///
/// Both the thread and the process workers end up here, the latter with a
/// catalog proxy that forwards to the parent process.
pub fn run_task(task: &Task, catalog: &dyn Catalog) -> Result<(), TaskError> {
    let mut inputs = Vec::with_capacity(task.inputs.len());
    for name in &task.inputs {
        inputs.push(catalog.load(name)?);
    }

    // We use AssertUnwindSafe because the task only sees owned inputs and
    // the catalog keeps its own state consistent across a panic.
    let outputs = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        task.func.call(inputs)
    })) {
        Ok(result) => result.map_err(TaskError::Failed)?,
        Err(panic) => return Err(TaskError::Panicked(panic_message(&*panic))),
    };

    if outputs.len() != task.outputs.len() {
        return Err(TaskError::Arity {
            expected: task.outputs.len(),
            found: outputs.len(),
        });
    }

    for (name, data) in task.outputs.iter().zip(outputs) {
        catalog.save(name, data)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DataCatalog;
    use crate::error::CatalogError;

    fn add_one() -> Task {
        Task::new(
            "add_one",
            TaskFn::closure(|inputs| Ok(vec![Data::new(inputs[0].get::<i64>()? + 1)])),
        )
        .inputs(["a"])
        .outputs(["b"])
    }

    #[test]
    fn test_run_task() {
        let catalog = DataCatalog::new();
        catalog.add_feed_dict([("a", Data::new(1_i64))]);

        run_task(&add_one(), &catalog).unwrap();

        assert_eq!(catalog.load("b").unwrap().get::<i64>().unwrap(), &2);
    }

    #[test]
    fn test_missing_input() {
        let catalog = DataCatalog::new();
        let err = run_task(&add_one(), &catalog).unwrap_err();
        assert!(matches!(
            err,
            TaskError::Catalog(CatalogError::NotFound { ref name }) if name == "a"
        ));
    }

    #[test]
    fn test_arity() {
        let catalog = DataCatalog::new();
        let task = Task::new("none", TaskFn::closure(|_| Ok(vec![]))).outputs(["x"]);
        let err = run_task(&task, &catalog).unwrap_err();
        assert!(matches!(err, TaskError::Arity { expected: 1, found: 0 }));
    }

    #[test]
    fn test_panic_is_caught() {
        let catalog = DataCatalog::new();
        let task = Task::new("boom", TaskFn::closure(|_| panic!("kaboom")));
        let err = run_task(&task, &catalog).unwrap_err();
        assert!(matches!(err, TaskError::Panicked(ref msg) if msg == "kaboom"));
    }

    #[test]
    fn test_debug_names_function() {
        let task = add_one();
        let debug = format!("{task:?}");
        assert!(debug.contains("<closure>"));
        assert!(debug.contains("add_one"));
    }
}
