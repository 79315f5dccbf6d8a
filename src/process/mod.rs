//! External process execution.
//!
//! # Module Structure
//!
//! - `command`: `Process` backed by a `tokio::process::Command`
//! - `manager`: Bounded-concurrency supervisor and its promise-style reducer chain

pub mod command;
pub mod manager;

pub use command::CommandProcess;
pub use manager::{
    DEFAULT_MAX_CONCURRENCY, DEFAULT_POLL_INTERVAL, ManagedProcess, ProcessManager, ProcessPromise,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("a process named '{0}' is already registered")]
    DuplicateName(String),
    #[error("process has already been started")]
    AlreadyStarted,
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("processes can only be started inside a tokio runtime")]
    NoRuntime,
}

/// Captured result of a terminated process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` when killed, timed out or never spawned
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Why the process did not exit on its own
    pub failure: Option<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.failure.is_none() && self.exit_code == Some(0)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Process spawn primitive.
///
/// Status is observed, never pushed: callers poll `is_running` and
/// `is_terminated`, and a process is terminated once it has exited for any
/// reason, successful or not.
pub trait Process: Send {
    /// Begin execution without waiting for it to finish.
    ///
    /// Once this returns `Ok`, `is_started()` must be true. A start that fails
    /// should still report `is_started()` and `is_terminated()`, with the
    /// reason in `output().failure`. An implementation that returns `Err` and
    /// stays unstarted is settled by [`ProcessManager`] and never retried.
    fn start(&mut self) -> Result<(), ProcessError>;

    fn is_started(&self) -> bool;

    fn is_terminated(&self) -> bool;

    fn is_running(&self) -> bool {
        self.is_started() && !self.is_terminated()
    }

    /// Output once terminated.
    fn output(&self) -> Option<ProcessOutput>;

    fn pid(&self) -> Option<u32>;
}

impl<P: Process + ?Sized> Process for Box<P> {
    fn start(&mut self) -> Result<(), ProcessError> {
        (**self).start()
    }

    fn is_started(&self) -> bool {
        (**self).is_started()
    }

    fn is_terminated(&self) -> bool {
        (**self).is_terminated()
    }

    fn is_running(&self) -> bool {
        (**self).is_running()
    }

    fn output(&self) -> Option<ProcessOutput> {
        (**self).output()
    }

    fn pid(&self) -> Option<u32> {
        (**self).pid()
    }
}
