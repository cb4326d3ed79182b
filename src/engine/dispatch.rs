use std::sync::Arc;

use crate::catalog::Catalog;
use crate::error::TaskError;
use crate::task::{Task, run_task};

/// How a single ready task gets executed.
///
/// The control loop is the same in every mode; only this step differs. It is
/// called from pool threads, several at a time.
pub(crate) trait Dispatch: Send + Sync {
    fn execute(&self, task: &Task) -> Result<(), TaskError>;
}

/// Runs the task on the calling pool thread against the shared catalog.
pub(crate) struct ThreadDispatch {
    catalog: Arc<dyn Catalog>,
}

impl ThreadDispatch {
    pub(crate) fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }
}

impl Dispatch for ThreadDispatch {
    fn execute(&self, task: &Task) -> Result<(), TaskError> {
        run_task(task, self.catalog.as_ref())
    }
}
