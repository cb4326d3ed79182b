//! Wire format between the parent and its worker processes.
//!
//! Every message is one frame: a big-endian `u32` length followed by that
//! many bytes of CBOR. The parent opens every conversation with
//! [`ToWorker::Execute`]; the worker answers with any number of catalog
//! requests, each answered by the parent, and closes with
//! [`FromWorker::Done`] or [`FromWorker::Failed`].

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, ProtocolError, TaskError};
use crate::process::Bootstrap;
use crate::registry::Payload;

/// Largest frame either side accepts.
pub(crate) const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// A task, reduced to what a worker process can rebuild it from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Job {
    pub task: String,
    pub key: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub bootstrap: Bootstrap,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum ToWorker {
    Execute(Box<Job>),
    /// Answer to [`FromWorker::Load`].
    Value(Payload),
    /// Answer to [`FromWorker::Save`].
    Ack,
    /// Answer to [`FromWorker::List`].
    Names(Vec<String>),
    /// The catalog refused a load or save.
    Error(CatalogError),
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum FromWorker {
    Load { name: String },
    Save { name: String, payload: Payload },
    List,
    Done,
    Failed(Failure),
}

/// A [`TaskError`] that survived the trip from the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Failure {
    Failed(String),
    Catalog(CatalogError),
    Panicked(String),
    Arity { expected: usize, found: usize },
}

impl From<TaskError> for Failure {
    fn from(error: TaskError) -> Self {
        match error {
            TaskError::Failed(e) => Failure::Failed(format!("{e:#}")),
            TaskError::Catalog(e) => Failure::Catalog(e),
            TaskError::Panicked(msg) => Failure::Panicked(msg),
            TaskError::Arity { expected, found } => Failure::Arity { expected, found },
            other => Failure::Failed(other.to_string()),
        }
    }
}

impl From<Failure> for TaskError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Failed(msg) => TaskError::Failed(anyhow::Error::msg(msg)),
            Failure::Catalog(e) => TaskError::Catalog(e),
            Failure::Panicked(msg) => TaskError::Panicked(msg),
            Failure::Arity { expected, found } => TaskError::Arity { expected, found },
        }
    }
}

pub(crate) fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: Write,
    T: Serialize,
{
    let mut payload = Vec::new();
    ciborium::into_writer(message, &mut payload).map_err(|e| ProtocolError::Encode(e.to_string()))?;

    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::Encode(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }

    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

pub(crate) fn read_frame<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: Read,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len == 0 {
        return Err(ProtocolError::Decode("empty frame".into()));
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Decode(format!("frame too large: {len} bytes")));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    ciborium::from_reader(payload.as_slice()).map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_frames_are_length_prefixed() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &FromWorker::Load { name: "a".into() }).unwrap();

        let len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        assert_eq!(len, buf.len() - 4);

        let message: FromWorker = read_frame(&mut Cursor::new(buf)).unwrap();
        assert!(matches!(message, FromWorker::Load { ref name } if name == "a"));
    }

    #[test]
    fn test_empty_frame() {
        let err = read_frame::<_, ToWorker>(&mut Cursor::new(vec![0, 0, 0, 0])).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn test_oversized_frame() {
        let err = read_frame::<_, ToWorker>(&mut Cursor::new(vec![0xFF, 0xFF, 0xFF, 0xFF])).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(ref msg) if msg.contains("too large")));
    }

    #[test]
    fn test_truncated_frame() {
        let err = read_frame::<_, ToWorker>(&mut Cursor::new(vec![0, 0, 0, 8, 1])).unwrap_err();
        assert!(matches!(err, ProtocolError::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_failure_keeps_catalog_errors() {
        let error = TaskError::Catalog(CatalogError::NotFound { name: "x".into() });
        let back: TaskError = Failure::from(error).into();
        assert!(matches!(back, TaskError::Catalog(CatalogError::NotFound { ref name }) if name == "x"));
    }
}
