//! Thin wrapper around one spawned OS process.
//!
//! Stdout and stderr are merged into a capture file. Completion is detected by
//! polling; there is no push notification.

use cloudrun_core::KILLED_EXIT_CODE;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("empty command line")]
    EmptyCommand,
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("cannot create output file {path}: {source}")]
    OutputFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("failed waiting for process: {0}")]
    Wait(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Map an exit status to a plain code; signal deaths become [`KILLED_EXIT_CODE`].
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(KILLED_EXIT_CODE)
}

/// Owns one child process.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Option<Child>,
    pid: Option<u32>,
    output_path: PathBuf,
    exit_code: Option<i32>,
    stop_requested: bool,
}

impl ProcessHandle {
    /// Spawn `argv` in `working_dir`, with stdout and stderr going to `output_path`.
    ///
    /// The output file is truncated if it exists. The process is killed if the
    /// handle is dropped while it is still running.
    pub fn launch(argv: &[String], output_path: &Path, working_dir: &Path) -> Result<Self> {
        let (program, args) = argv.split_first().ok_or(ProcessError::EmptyCommand)?;

        let file = File::create(output_path).map_err(|source| ProcessError::OutputFile {
            path: output_path.to_path_buf(),
            source,
        })?;
        let stderr = file.try_clone().map_err(|source| ProcessError::OutputFile {
            path: output_path.to_path_buf(),
            source,
        })?;

        let child = Command::new(program)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    ProcessError::ExecutableNotFound(program.clone())
                } else {
                    ProcessError::Spawn {
                        program: program.clone(),
                        source,
                    }
                }
            })?;

        let pid = child.id();
        debug!(pid, program = %program, output = %output_path.display(), "spawned process");

        Ok(Self {
            child: Some(child),
            pid,
            output_path: output_path.to_path_buf(),
            exit_code: None,
            stop_requested: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Non-blocking check for completion.
    ///
    /// Returns the exit code once the process has exited; `None` while it is
    /// still running. The child is reaped on the first observation and the
    /// code is cached after that.
    pub fn poll(&mut self) -> Option<i32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                let code = exit_code(status);
                self.exit_code = Some(code);
                self.child = None;
                self.pid = None;
                Some(code)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "failed to poll process");
                None
            }
        }
    }

    /// Block until the process exits and return its exit code.
    pub async fn wait(&mut self) -> Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(KILLED_EXIT_CODE);
        };
        let status = child.wait().await.map_err(ProcessError::Wait)?;
        let code = exit_code(status);
        self.exit_code = Some(code);
        self.child = None;
        self.pid = None;
        Ok(code)
    }

    /// Ask the process to exit (SIGTERM on unix). Only the first request is sent.
    pub fn request_stop(&mut self) {
        if self.child.is_none() || self.stop_requested {
            return;
        }
        self.stop_requested = true;
        self.send_stop_signal();
    }

    #[cfg(unix)]
    fn send_stop_signal(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM failed; process likely gone");
        }
    }

    #[cfg(not(unix))]
    fn send_stop_signal(&mut self) {
        self.terminate();
    }

    /// Wait for the process to exit, killing it if it is still running at
    /// `deadline`.
    pub async fn wait_until(&mut self, deadline: Instant) -> Result<i32> {
        if let Ok(code) = tokio::time::timeout_at(deadline, self.wait()).await {
            return code;
        }
        warn!(pid = self.pid, "process did not exit in time; killing");
        self.terminate();
        self.wait().await
    }

    /// Best-effort kill. A process that already exited is not an error.
    pub fn terminate(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!(pid = self.pid, error = %e, "kill failed; process likely gone");
            }
        }
    }
}
