//! The pipeline run by the `nagare` binary, also used by the integration
//! tests, which start that binary as their worker process.

use anyhow::Context;
use nagare::{Data, Function, Pipeline, Registry, Task};

pub const FAIL_MESSAGE: &str = "This task is designed to fail";

/// Holds a lock, so there is no sensible way to serialize it.
pub struct Unserializable(pub std::sync::Mutex<i64>);

fn sum(inputs: Vec<Data>) -> anyhow::Result<Vec<Data>> {
    let mut total = 0_i64;
    for input in &inputs {
        total += input.get::<i64>()?;
    }
    Ok(vec![Data::new(total)])
}

pub fn registry() -> Registry {
    let mut registry = Registry::with_primitives();
    registry.register_fn("identity", |inputs| Ok(inputs));
    registry.register_fn("fan_in", sum);
    registry.register_fn("exception", |_| anyhow::bail!(FAIL_MESSAGE));
    registry.register_fn("return_none", |_| Ok(vec![Data::null()]));
    registry.register_fn("return_not_serializable", |_| {
        Ok(vec![Data::new(Unserializable(std::sync::Mutex::new(0)))])
    });
    registry
}

pub fn function(registry: &Registry, key: &str) -> anyhow::Result<Function> {
    registry
        .function(key)
        .with_context(|| format!("function '{key}' is not registered"))
}

/// `A` goes through `identity_1`, fans out to three identities and is summed
/// back into `Z`. Needs three workers.
///
/// Every task named in `fail` is swapped for one that always fails.
pub fn fan_out_fan_in(registry: &Registry, fail: &[String]) -> anyhow::Result<Pipeline> {
    let pick = |name: &str, key: &str| {
        if fail.iter().any(|f| f == name) {
            function(registry, "exception")
        } else {
            function(registry, key)
        }
    };

    let pipeline = Pipeline::new([
        Task::new("identity_1", pick("identity_1", "identity")?).inputs(["A"]).outputs(["B"]),
        Task::new("identity_2", pick("identity_2", "identity")?).inputs(["B"]).outputs(["C"]),
        Task::new("identity_3", pick("identity_3", "identity")?).inputs(["B"]).outputs(["D"]),
        Task::new("identity_4", pick("identity_4", "identity")?).inputs(["B"]).outputs(["E"]),
        Task::new("fan_in", pick("fan_in", "fan_in")?)
            .inputs(["C", "D", "E"])
            .outputs(["Z"]),
    ])?;

    Ok(pipeline)
}
