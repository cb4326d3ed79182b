use std::num::NonZeroUsize;

use crate::engine::Mode;
use crate::pipeline::Graph;

/// Windows can't wait on more than 63 handles at once, and a process pool
/// needs a couple of them for itself.
pub const MAX_WINDOWS_WORKERS: usize = 61;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Host {
    Windows,
    Other,
}

impl Host {
    pub fn current() -> Self {
        if cfg!(windows) {
            Host::Windows
        } else {
            Host::Other
        }
    }
}

/// Upper bound on the number of tasks of `graph` that can ever run at once.
///
/// The number of tasks is a safe estimate. It's also safe to reduce it by the
/// number of layers minus one, because each additional layer means some tasks
/// depend on others and can't run next to them. Not exact, but cheap and
/// never too small.
pub fn required_workers<G>(graph: &G, max_workers: Option<NonZeroUsize>) -> usize
where
    G: Graph + ?Sized,
{
    let upper = (graph.task_units().len() + 1)
        .saturating_sub(graph.topological_layers().len())
        .max(1);

    match max_workers {
        Some(max) => upper.min(max.get()),
        None => upper,
    }
}

/// Everything the worker count depends on besides the graph.
#[derive(Debug, Clone, Copy)]
pub struct Sizing {
    pub max_workers: Option<NonZeroUsize>,
    pub cpu_count: NonZeroUsize,
    pub host: Host,
}

impl Sizing {
    pub fn detect(max_workers: Option<NonZeroUsize>) -> Self {
        Self {
            max_workers,
            cpu_count: std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
            host: Host::current(),
        }
    }

    /// Most worker processes this host should run: the user's choice or the
    /// CPU count, capped on Windows.
    pub fn process_ceiling(&self) -> NonZeroUsize {
        let ceiling = self.max_workers.unwrap_or(self.cpu_count);
        match self.host {
            Host::Windows => {
                NonZeroUsize::new(ceiling.get().min(MAX_WINDOWS_WORKERS)).unwrap_or(ceiling)
            }
            Host::Other => ceiling,
        }
    }

    pub fn workers<G>(&self, graph: &G, mode: Mode) -> usize
    where
        G: Graph + ?Sized,
    {
        match mode {
            Mode::Thread => required_workers(graph, self.max_workers),
            Mode::Process => required_workers(graph, Some(self.process_ceiling())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Data;
    use crate::pipeline::Pipeline;
    use crate::task::{Task, TaskFn};

    fn task(name: &str, inputs: &[&str], output: &str) -> Task {
        Task::new(name, TaskFn::closure(|_| Ok(vec![Data::null()])))
            .inputs(inputs.iter().copied())
            .outputs([output])
    }

    /// Needs three workers: five tasks in three layers.
    fn fan_out_fan_in() -> Pipeline {
        Pipeline::new([
            task("identity_1", &["A"], "B"),
            task("identity_2", &["B"], "C"),
            task("identity_3", &["B"], "D"),
            task("identity_4", &["B"], "E"),
            task("fan_in", &["C", "D", "E"], "Z"),
        ])
        .unwrap()
    }

    fn sizing(cpu_count: usize, max_workers: Option<usize>, host: Host) -> Sizing {
        Sizing {
            max_workers: max_workers.and_then(NonZeroUsize::new),
            cpu_count: NonZeroUsize::new(cpu_count).unwrap(),
            host,
        }
    }

    #[test]
    fn test_required_workers() {
        let pipeline = fan_out_fan_in();
        assert_eq!(required_workers(&pipeline, None), 3);
        assert_eq!(required_workers(&pipeline, NonZeroUsize::new(2)), 2);
        assert_eq!(required_workers(&pipeline, NonZeroUsize::new(6)), 3);
    }

    #[test]
    fn test_empty_graph_needs_one_worker() {
        let pipeline = Pipeline::new(Vec::<Task>::new()).unwrap();
        assert_eq!(required_workers(&pipeline, None), 1);
    }

    #[test]
    fn test_process_workers() {
        let pipeline = fan_out_fan_in();
        let cases = [
            // The pipeline only needs 3 processes, no need for more.
            (4, Some(6), 3),
            (4, None, 3),
            // We need 3 processes, but only 2 CPU cores available.
            (2, None, 2),
            // Even though we have 1 CPU core, allow the user to use more.
            (1, Some(2), 2),
        ];

        for (cpu_count, max_workers, expected) in cases {
            let sizing = sizing(cpu_count, max_workers, Host::Other);
            assert_eq!(
                sizing.workers(&pipeline, Mode::Process),
                expected,
                "cpu_count={cpu_count}, max_workers={max_workers:?}"
            );
        }
    }

    #[test]
    fn test_thread_workers_ignore_cpu_count() {
        let pipeline = fan_out_fan_in();
        assert_eq!(sizing(1, None, Host::Other).workers(&pipeline, Mode::Thread), 3);
        assert_eq!(sizing(1, Some(2), Host::Other).workers(&pipeline, Mode::Thread), 2);
    }

    #[test]
    fn test_windows_ceiling() {
        assert_eq!(
            sizing(100, None, Host::Windows).process_ceiling().get(),
            MAX_WINDOWS_WORKERS
        );
        assert_eq!(sizing(100, Some(80), Host::Windows).process_ceiling().get(), 61);
        assert_eq!(sizing(100, None, Host::Other).process_ceiling().get(), 100);
        assert_eq!(sizing(8, None, Host::Windows).process_ceiling().get(), 8);
    }
}
