//! Per-run context shared by every component.
//!
//! Built once at startup and passed by reference. The signal handler holds an
//! `Arc` to it; cancellation flows through the token, never through globals.

use chrono::{DateTime, Utc};
use cloudrun_core::Config;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Name of the directory, inside the output dir, holding failing tests' output.
pub const FAILED_DIR_NAME: &str = "failed";

#[derive(Debug)]
pub struct RunContext {
    config: Config,
    test_root: PathBuf,
    output_dir: PathBuf,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    /// Set by the first signal; later signals see it and back off.
    handling_signal: AtomicBool,
}

impl RunContext {
    pub fn new(config: Config, test_root: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            config,
            test_root,
            output_dir,
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            handling_signal: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn test_root(&self) -> &Path {
        &self.test_root
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn failed_output_dir(&self) -> PathBuf {
        self.output_dir.join(FAILED_DIR_NAME)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the run has been told to tear down.
    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Flip the run into teardown.
    ///
    /// Returns `true` only for the first caller; re-entrant requests are ignored.
    pub fn request_termination(&self) -> bool {
        if self
            .handling_signal
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Sleep for `duration` unless the run is cancelled first.
    ///
    /// Returns `false` if cancellation cut the sleep short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = self.cancel.cancelled() => false,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms)
    }

    /// Per-test deadline, if one is configured.
    pub fn test_timeout(&self) -> Option<Duration> {
        (self.config.test_timeout_sec > 0).then(|| Duration::from_secs(self.config.test_timeout_sec))
    }
}
