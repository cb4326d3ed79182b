//! Process mode: every task runs in a separate worker process.
//!
//! Worker processes are started from a [`WorkerCommand`], by default the
//! current executable, with [`WORKER_ENV`] set. Such a process must call
//! [`serve_if_worker`] before doing anything else; it then receives tasks as
//! registry keys over stdin, and reaches the catalog by asking the parent
//! over stdout. Workers are kept alive and reused for the whole run.

mod bootstrap;
pub mod guard;
mod protocol;
mod worker;

use std::io::{BufReader, ErrorKind};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Mutex, PoisonError};

use crate::catalog::SharedCatalog;
use crate::engine::Dispatch;
use crate::error::{ProtocolError, TaskError, TransferError};
use crate::process::protocol::{FromWorker, Job, ToWorker, read_frame, write_frame};
use crate::task::Task;

pub use bootstrap::{Applied, Bootstrap};
pub use worker::{WORKER_ENV, is_worker, serve, serve_if_worker};

/// Program and arguments used to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The executable of this very process.
    pub fn current() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
    }
}

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl WorkerProcess {
    fn spawn(command: &WorkerCommand) -> Result<Self, TaskError> {
        let mut child = command.spawn().map_err(TaskError::Spawn)?;
        tracing::debug!("Spawned worker process {}", child.id());

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TaskError::WorkerExited);
        };

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Hand `job` to the worker and serve its catalog requests until it
    /// reports back.
    fn execute(&mut self, job: Job, catalog: &SharedCatalog) -> Result<(), TaskError> {
        self.send(&ToWorker::Execute(Box::new(job)))?;

        loop {
            let reply = match self.receive()? {
                FromWorker::Load { name } => match catalog.load(&name) {
                    Ok(payload) => ToWorker::Value(payload),
                    Err(e) => ToWorker::Error(e),
                },
                FromWorker::Save { name, payload } => match catalog.save(&name, &payload) {
                    Ok(()) => ToWorker::Ack,
                    Err(e) => ToWorker::Error(e),
                },
                FromWorker::List => ToWorker::Names(catalog.catalog().list()),
                FromWorker::Done => return Ok(()),
                FromWorker::Failed(failure) => return Err(failure.into()),
            };

            self.send(&reply)?;
        }
    }

    fn send(&mut self, message: &ToWorker) -> Result<(), TaskError> {
        write_frame(&mut self.stdin, message).map_err(lost)
    }

    fn receive(&mut self) -> Result<FromWorker, TaskError> {
        read_frame(&mut self.stdout).map_err(lost)
    }

    fn shutdown(mut self) {
        let _ = write_frame(&mut self.stdin, &ToWorker::Shutdown);
        drop(self.stdin);
        match self.child.wait() {
            Ok(status) => tracing::debug!("Worker process {} exited with {}", self.child.id(), status),
            Err(e) => tracing::warn!("Couldn't reap worker process {}: {}", self.child.id(), e),
        }
    }

    fn kill(mut self) {
        tracing::debug!("Killing worker process {}", self.child.id());
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A closed pipe means the worker died, most likely mid-task.
fn lost(error: ProtocolError) -> TaskError {
    match error {
        ProtocolError::Io(e) if matches!(e.kind(), ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe) => {
            TaskError::WorkerExited
        }
        other => TaskError::Protocol(other),
    }
}

/// Sends each task to a worker process, at most one process per pool
/// thread.
pub(crate) struct ProcessDispatch {
    command: WorkerCommand,
    catalog: SharedCatalog,
    bootstrap: Bootstrap,
    idle: Mutex<Vec<WorkerProcess>>,
}

impl ProcessDispatch {
    pub(crate) fn new(command: WorkerCommand, catalog: SharedCatalog, bootstrap: Bootstrap) -> Self {
        Self {
            command,
            catalog,
            bootstrap,
            idle: Mutex::new(Vec::new()),
        }
    }

    fn job(&self, task: &Task) -> Result<Job, TaskError> {
        let key = task.func().key().ok_or_else(|| {
            TaskError::Failed(
                TransferError::Task {
                    task: task.name().to_string(),
                }
                .into(),
            )
        })?;

        Ok(Job {
            task: task.name().to_string(),
            key: key.to_string(),
            inputs: task.input_names().to_vec(),
            outputs: task.output_names().to_vec(),
            bootstrap: self.bootstrap.clone(),
        })
    }
}

impl Dispatch for ProcessDispatch {
    fn execute(&self, task: &Task) -> Result<(), TaskError> {
        let job = self.job(task)?;

        let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let mut worker = match idle {
            Some(worker) => worker,
            None => WorkerProcess::spawn(&self.command)?,
        };

        let result = worker.execute(job, &self.catalog);
        match &result {
            Err(TaskError::Protocol(_) | TaskError::WorkerExited) => worker.kill(),
            _ => self
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(worker),
        }
        result
    }
}

impl Drop for ProcessDispatch {
    fn drop(&mut self) {
        let idle = std::mem::take(self.idle.get_mut().unwrap_or_else(PoisonError::into_inner));
        for worker in idle {
            worker.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::DataCatalog;
    use crate::context::RunContext;
    use crate::engine::Mode;
    use crate::registry::Registry;
    use crate::task::TaskFn;

    fn dispatch(command: WorkerCommand) -> ProcessDispatch {
        ProcessDispatch::new(
            command,
            SharedCatalog::new(Arc::new(DataCatalog::new()), Arc::new(Registry::with_primitives())),
            Bootstrap {
                context: RunContext {
                    run_id: "test".into(),
                    mode: Mode::Process,
                    project: None,
                },
                logging: None,
            },
        )
    }

    #[test]
    fn test_worker_command() {
        let command = WorkerCommand::new("/usr/bin/nagare").arg("--quiet");
        assert_eq!(command.program, PathBuf::from("/usr/bin/nagare"));
        assert_eq!(command.args, ["--quiet"]);
        assert!(WorkerCommand::current().is_ok());
    }

    #[test]
    fn test_spawn_failure() {
        let mut registry = Registry::new();
        let task = Task::new("t", registry.register_fn("t", |inputs| Ok(inputs)));

        let err = dispatch(WorkerCommand::new("/nonexistent/nagare-worker"))
            .execute(&task)
            .unwrap_err();
        assert!(matches!(err, TaskError::Spawn(_)));
    }

    #[test]
    fn test_closure_never_reaches_a_worker() {
        let task = Task::new("t", TaskFn::closure(|inputs| Ok(inputs)));
        let err = dispatch(WorkerCommand::new("/nonexistent/nagare-worker"))
            .execute(&task)
            .unwrap_err();
        assert!(matches!(err, TaskError::Failed(_)));
    }

    #[test]
    fn test_broken_pipe_is_worker_exit() {
        let error = ProtocolError::Io(std::io::Error::from(ErrorKind::UnexpectedEof));
        assert!(matches!(lost(error), TaskError::WorkerExited));
        assert!(matches!(
            lost(ProtocolError::Decode("bad".into())),
            TaskError::Protocol(_)
        ));
    }
}
