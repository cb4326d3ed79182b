//! Process-wide run context.
//!
//! Task bodies sometimes need to know which project they belong to, e.g. to
//! find their own configuration files. In the parent process the runner
//! installs the context before the first task is dispatched; worker processes
//! receive it as part of every dispatch and install it during bootstrap.

use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::engine::Mode;

/// Identity of the project a run belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectIdentity {
    pub name: String,
    pub root: PathBuf,
}

impl ProjectIdentity {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: String,
    pub mode: Mode,
    pub project: Option<ProjectIdentity>,
}

static CURRENT: RwLock<Option<RunContext>> = RwLock::new(None);

/// The context of the run this process is currently taking part in.
pub fn current() -> Option<RunContext> {
    CURRENT.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Install `context`, returning `false` when the very same context was already
/// installed.
pub(crate) fn install(context: &RunContext) -> bool {
    install_into(&CURRENT, context)
}

pub(crate) fn install_into(slot: &RwLock<Option<RunContext>>, context: &RunContext) -> bool {
    let mut current = slot.write().unwrap_or_else(PoisonError::into_inner);
    if current.as_ref() == Some(context) {
        return false;
    }

    *current = Some(context.clone());
    true
}
