use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::{Process, ProcessError, ProcessOutput};

/// A child process run to completion on the tokio runtime.
///
/// The child is killed when its timeout elapses; that and a failed spawn both
/// leave the process terminated with a failed [`ProcessOutput`].
pub struct CommandProcess {
    command: Option<Command>,
    label: String,
    timeout: Duration,
    started: bool,
    pid: Option<u32>,
    output: Arc<Mutex<Option<ProcessOutput>>>,
}

impl CommandProcess {
    pub fn new(mut command: Command, timeout: Duration) -> Self {
        let label = format!("{:?}", command.as_std());
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Self {
            command: Some(command),
            label,
            timeout,
            started: false,
            pid: None,
            output: Arc::new(Mutex::new(None)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn record(&self, output: ProcessOutput) {
        let mut slot = self.output.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(output);
    }
}

impl Process for CommandProcess {
    fn start(&mut self) -> Result<(), ProcessError> {
        let mut command = self.command.take().ok_or(ProcessError::AlreadyStarted)?;
        self.started = true;

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.record(ProcessOutput::failed("no async runtime"));
                return Err(ProcessError::NoRuntime);
            }
        };

        // Spawning registers the child with the runtime's reactor.
        let child = {
            let _guard = handle.enter();
            command.spawn()
        };
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %self.label, error = %e, "failed to spawn process");
                self.record(ProcessOutput::failed(format!("spawn failed: {}", e)));
                return Err(ProcessError::Spawn(e));
            }
        };

        self.pid = child.id();
        debug!(command = %self.label, pid = ?self.pid, "process started");

        let slot = Arc::clone(&self.output);
        let timeout = self.timeout;
        let label = self.label.clone();
        handle.spawn(async move {
            let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(Ok(output)) => ProcessOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    failure: None,
                },
                Ok(Err(e)) => ProcessOutput::failed(format!("wait failed: {}", e)),
                Err(_) => {
                    warn!(command = %label, ?timeout, "process timed out");
                    ProcessOutput::failed(format!("timed out after {:?}", timeout))
                }
            };
            debug!(command = %label, exit_code = ?output.exit_code, "process terminated");
            let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(output);
        });

        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }

    fn is_terminated(&self) -> bool {
        self.output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn output(&self) -> Option<ProcessOutput> {
        self.output.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl std::fmt::Debug for CommandProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProcess")
            .field("command", &self.label)
            .field("started", &self.started)
            .field("pid", &self.pid)
            .finish()
    }
}
