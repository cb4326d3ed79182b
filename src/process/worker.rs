//! The worker side of process mode.

use std::collections::BTreeSet;
use std::io::{ErrorKind, Read, Write};
use std::sync::{Mutex, PoisonError};

use crate::catalog::Catalog;
use crate::core::Data;
use crate::error::{CatalogError, ProtocolError, TaskError};
use crate::process::protocol::{FromWorker, Job, ToWorker, read_frame, write_frame};
use crate::registry::Registry;
use crate::task::{Task, run_task};

/// Set in the environment of every worker process.
pub const WORKER_ENV: &str = "NAGARE_WORKER";

pub fn is_worker() -> bool {
    std::env::var_os(WORKER_ENV).is_some_and(|value| value == "1")
}

/// Serve the parent over stdin and stdout if this process was started as a
/// worker. Call it first thing in `main`, once `registry` is built:
///
/// ```rust,no_run
/// # fn main() -> anyhow::Result<()> {
/// let registry = nagare::Registry::with_primitives();
/// if let Some(result) = nagare::process::serve_if_worker(&registry) {
///     return Ok(result?);
/// }
/// # Ok(())
/// # }
/// ```
///
/// Task code running in a worker must not write to stdout.
pub fn serve_if_worker(registry: &Registry) -> Option<Result<(), ProtocolError>> {
    is_worker().then(|| serve(registry))
}

pub fn serve(registry: &Registry) -> Result<(), ProtocolError> {
    tracing::debug!("Worker {} ready", std::process::id());
    serve_on(registry, std::io::stdin(), std::io::stdout())
}

struct Conversation<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> Conversation<R, W>
where
    R: Read,
    W: Write,
{
    fn request(&mut self, message: &FromWorker) -> Result<ToWorker, ProtocolError> {
        write_frame(&mut self.writer, message)?;
        read_frame(&mut self.reader)
    }
}

fn serve_on<R, W>(registry: &Registry, reader: R, writer: W) -> Result<(), ProtocolError>
where
    R: Read + Send,
    W: Write + Send,
{
    let conversation = Mutex::new(Conversation { reader, writer });

    loop {
        let message = {
            let mut conversation = conversation.lock().unwrap_or_else(PoisonError::into_inner);
            match read_frame(&mut conversation.reader) {
                Ok(message) => message,
                // Parent went away without saying goodbye.
                Err(ProtocolError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            }
        };

        match message {
            ToWorker::Execute(job) => {
                let proxy = ProxyCatalog {
                    conversation: &conversation,
                    registry,
                };

                let reply = match execute_in_subprocess(&job, &proxy, registry) {
                    Ok(()) => FromWorker::Done,
                    Err(e) => {
                        tracing::debug!("Task '{}' failed in worker: {}", job.task, e);
                        FromWorker::Failed(e.into())
                    }
                };

                let mut conversation = conversation.lock().unwrap_or_else(PoisonError::into_inner);
                write_frame(&mut conversation.writer, &reply)?;
            }
            ToWorker::Shutdown => {
                tracing::debug!("Worker {} shutting down", std::process::id());
                return Ok(());
            }
            _ => return Err(ProtocolError::Unexpected("expected a task or shutdown")),
        }
    }
}

/// Bootstrap this process for the job's run, rebuild the task from the
/// registry and run it against `catalog`.
pub(crate) fn execute_in_subprocess(
    job: &Job,
    catalog: &dyn Catalog,
    registry: &Registry,
) -> Result<(), TaskError> {
    job.bootstrap
        .apply()
        .map_err(|e| TaskError::Failed(anyhow::Error::new(e)))?;

    let function = registry.function(&job.key).ok_or_else(|| {
        TaskError::Failed(anyhow::anyhow!(
            "Function '{}' is not registered in this worker",
            job.key
        ))
    })?;

    let task = Task::new(job.task.as_str(), function)
        .inputs(&job.inputs)
        .outputs(&job.outputs);

    run_task(&task, catalog)
}

/// The catalog as seen from inside a worker: every call is a round trip to
/// the parent.
struct ProxyCatalog<'a, R, W> {
    conversation: &'a Mutex<Conversation<R, W>>,
    registry: &'a Registry,
}

impl<R, W> ProxyCatalog<'_, R, W>
where
    R: Read,
    W: Write,
{
    fn request(&self, message: &FromWorker) -> Result<ToWorker, CatalogError> {
        self.conversation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .request(message)
            .map_err(|e| CatalogError::Proxy(e.to_string()))
    }
}

fn unexpected(request: &str) -> CatalogError {
    CatalogError::Proxy(format!("Unexpected reply to {request}"))
}

impl<R, W> Catalog for ProxyCatalog<'_, R, W>
where
    R: Read + Send,
    W: Write + Send,
{
    fn load(&self, name: &str) -> Result<Data, CatalogError> {
        let request = FromWorker::Load {
            name: name.to_string(),
        };

        match self.request(&request)? {
            ToWorker::Value(payload) => self
                .registry
                .decode(&payload)
                .map_err(|message| CatalogError::Proxy(format!("Couldn't decode '{name}': {message}"))),
            ToWorker::Error(e) => Err(e),
            _ => Err(unexpected("load")),
        }
    }

    fn save(&self, name: &str, data: Data) -> Result<(), CatalogError> {
        let payload = match self.registry.encode(&data) {
            Some(Ok(payload)) => payload,
            Some(Err(message)) => {
                return Err(CatalogError::Proxy(format!("Couldn't encode '{name}': {message}")));
            }
            None => {
                return Err(CatalogError::NotSerializable {
                    name: name.to_string(),
                    type_name: data.type_name().to_string(),
                });
            }
        };

        let request = FromWorker::Save {
            name: name.to_string(),
            payload,
        };

        match self.request(&request)? {
            ToWorker::Ack => Ok(()),
            ToWorker::Error(e) => Err(e),
            _ => Err(unexpected("save")),
        }
    }

    fn release(&self, name: &str) -> Result<(), CatalogError> {
        Err(CatalogError::Unsupported {
            name: name.to_string(),
            message: "Worker processes cannot release datasets".to_string(),
        })
    }

    fn contains(&self, name: &str) -> bool {
        self.list().iter().any(|n| n == name)
    }

    fn list(&self) -> Vec<String> {
        match self.request(&FromWorker::List) {
            Ok(ToWorker::Names(names)) => names,
            Ok(_) => {
                tracing::warn!("{}, treating the catalog as empty", unexpected("list"));
                Vec::new()
            }
            Err(e) => {
                tracing::warn!("Couldn't list the parent catalog, treating it as empty: {}", e);
                Vec::new()
            }
        }
    }

    fn run_outputs(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::context::RunContext;
    use crate::engine::Mode;
    use crate::process::Bootstrap;
    use crate::process::protocol::Failure;
    use crate::registry::Payload;

    struct Opaque;

    fn registry() -> Registry {
        let mut registry = Registry::with_primitives();
        registry.register_fn("double", |inputs| Ok(vec![Data::new(inputs[0].get::<i64>()? * 2)]));
        registry.register_fn("opaque", |_| Ok(vec![Data::new(Opaque)]));
        registry
    }

    fn job(key: &str) -> Job {
        Job {
            task: key.to_string(),
            key: key.to_string(),
            inputs: vec!["x".into()],
            outputs: vec!["y".into()],
            bootstrap: Bootstrap {
                context: RunContext {
                    run_id: "test".into(),
                    mode: Mode::Process,
                    project: None,
                },
                logging: None,
            },
        }
    }

    /// Script what the parent says, let the worker talk, return what it said.
    fn converse(messages: &[ToWorker]) -> Vec<FromWorker> {
        let mut input = Vec::new();
        for message in messages {
            write_frame(&mut input, message).unwrap();
        }

        let mut output = Vec::new();
        serve_on(&registry(), Cursor::new(input), &mut output).unwrap();

        let mut replies = Vec::new();
        let mut reader = Cursor::new(output);
        while (reader.position() as usize) < reader.get_ref().len() {
            replies.push(read_frame(&mut reader).unwrap());
        }
        replies
    }

    fn int(value: i64) -> Payload {
        Registry::with_primitives()
            .encode(&Data::new(value))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_execute_round_trip() {
        let replies = converse(&[
            ToWorker::Execute(Box::new(job("double"))),
            ToWorker::Value(int(21)),
            ToWorker::Ack,
            ToWorker::Shutdown,
        ]);

        assert_eq!(replies.len(), 3);
        assert!(matches!(&replies[0], FromWorker::Load { name } if name == "x"));
        let FromWorker::Save { name, payload } = &replies[1] else {
            panic!("expected a save, got {:?}", replies[1]);
        };
        assert_eq!(name, "y");
        let saved = Registry::with_primitives().decode(payload).unwrap();
        assert_eq!(saved.get::<i64>().unwrap(), &42);
        assert!(matches!(replies[2], FromWorker::Done));
    }

    #[test]
    fn test_catalog_error_is_reported() {
        let replies = converse(&[
            ToWorker::Execute(Box::new(job("double"))),
            ToWorker::Error(CatalogError::NotFound { name: "x".into() }),
        ]);

        assert!(matches!(
            &replies[1],
            FromWorker::Failed(Failure::Catalog(CatalogError::NotFound { name })) if name == "x"
        ));
    }

    #[test]
    fn test_unregistered_output_type() {
        let replies = converse(&[ToWorker::Execute(Box::new(job("opaque"))), ToWorker::Value(int(1))]);

        let FromWorker::Failed(Failure::Catalog(CatalogError::NotSerializable { name, type_name })) = &replies[1]
        else {
            panic!("expected a serialization failure, got {:?}", replies[1]);
        };
        assert_eq!(name, "y");
        assert!(type_name.ends_with("Opaque"));
        assert!(
            CatalogError::NotSerializable {
                name: name.clone(),
                type_name: type_name.clone()
            }
            .to_string()
            .contains("cannot be serialized")
        );
    }

    #[test]
    fn test_unknown_function() {
        let replies = converse(&[ToWorker::Execute(Box::new(job("missing")))]);
        assert!(matches!(&replies[0], FromWorker::Failed(Failure::Failed(msg)) if msg.contains("missing")));
    }

    #[test]
    fn test_unexpected_first_message() {
        let mut input = Vec::new();
        write_frame(&mut input, &ToWorker::Ack).unwrap();

        let err = serve_on(&registry(), Cursor::new(input), Vec::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::Unexpected(_)));
    }
}
