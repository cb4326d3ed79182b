//! Checks run before any worker process is started.
//!
//! A worker can only rebuild a task from its function key, and can only
//! receive values the registry has a codec for. Anything else would fail
//! halfway through the run, so it is rejected up front.

use crate::catalog::Catalog;
use crate::error::TransferError;
use crate::pipeline::Graph;
use crate::registry::Registry;
use crate::task::Task;

pub fn assert_transferable(
    task: &Task,
    catalog: &dyn Catalog,
    registry: &Registry,
) -> Result<(), TransferError> {
    let key = task.func().key().ok_or_else(|| TransferError::Task {
        task: task.name().to_string(),
    })?;

    if !registry.has_function(key) {
        return Err(TransferError::Function {
            task: task.name().to_string(),
            key: key.to_string(),
        });
    }

    // Only values already sitting in memory can be checked this early.
    for name in task.input_names() {
        if let Some(data) = catalog.materialized(name)
            && !registry.can_encode(&data)
        {
            return Err(TransferError::Value {
                name: name.clone(),
                type_name: data.type_name().to_string(),
            });
        }
    }

    Ok(())
}

pub fn assert_graph_transferable<G>(
    graph: &G,
    catalog: &dyn Catalog,
    registry: &Registry,
) -> Result<(), TransferError>
where
    G: Graph + ?Sized,
{
    graph
        .task_units()
        .iter()
        .try_for_each(|task| assert_transferable(task, catalog, registry))
}
