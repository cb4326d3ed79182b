use serde::{Deserialize, Serialize};

use crate::context::{self, RunContext};
use crate::error::ConfigError;
use crate::logging::{self, LoggingConfig};

/// State a worker process needs before it can run a task of the parent's
/// run. Sent along with every task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bootstrap {
    pub context: RunContext,
    /// `None` leaves the worker's logging alone.
    pub logging: Option<LoggingConfig>,
}

/// What [`Bootstrap::apply`] actually changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub logging: bool,
    pub context: bool,
}

impl Bootstrap {
    /// Bring this process in line with the payload. Calling it again with the
    /// same payload changes nothing.
    pub fn apply(&self) -> Result<Applied, ConfigError> {
        self.apply_with(context::install)
    }

    fn apply_with<F>(&self, install: F) -> Result<Applied, ConfigError>
    where
        F: FnOnce(&RunContext) -> bool,
    {
        let logging = match &self.logging {
            Some(config) => logging::init(config)?,
            None => false,
        };

        Ok(Applied {
            logging,
            context: install(&self.context),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::RwLock;

    use super::*;
    use crate::context::{ProjectIdentity, install_into};
    use crate::engine::Mode;

    fn payload() -> Bootstrap {
        Bootstrap {
            context: RunContext {
                run_id: "run-1".into(),
                mode: Mode::Process,
                project: Some(ProjectIdentity::new("demo", "/srv/demo")),
            },
            logging: Some(LoggingConfig {
                filter: "warn".into(),
                ansi: false,
                progress: false,
            }),
        }
    }

    #[test]
    fn test_second_bootstrap_is_a_no_op() {
        let slot = RwLock::new(None);
        let payload = payload();

        let first = payload.apply_with(|context| install_into(&slot, context)).unwrap();
        assert!(first.context);

        let second = payload.apply_with(|context| install_into(&slot, context)).unwrap();
        assert_eq!(second, Applied::default());
    }

    #[test]
    fn test_new_run_replaces_context() {
        let slot = RwLock::new(None);
        let mut payload = payload();
        payload.logging = None;
        payload.apply_with(|context| install_into(&slot, context)).unwrap();

        payload.context.run_id = "run-2".into();
        let applied = payload.apply_with(|context| install_into(&slot, context)).unwrap();

        assert_eq!(applied, Applied { logging: false, context: true });
        assert_eq!(slot.read().unwrap().as_ref().unwrap().run_id, "run-2");
    }
}
