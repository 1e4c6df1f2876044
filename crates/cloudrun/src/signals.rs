//! Interrupt handling.
//!
//! SIGINT and SIGTERM flip the run into teardown through [`RunContext`]. The
//! scheduler notices at its next check and kills tests and clouds. Signals
//! after the first are swallowed so teardown is never interrupted.

use crate::context::RunContext;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Banner printed when the first signal arrives.
pub fn teardown_banner(signum: i32) -> String {
    format!("SIGNAL CAUGHT ({signum}).  TEARING DOWN CLOUDS.")
}

/// Record a signal. Returns `true` if it started the teardown.
pub fn handle_signal(ctx: &RunContext, signum: i32) -> bool {
    if !ctx.request_termination() {
        debug!(signum, "already tearing down; ignoring signal");
        return false;
    }
    let rule = "-".repeat(70);
    println!();
    println!("{rule}");
    println!("{}", teardown_banner(signum));
    println!("{rule}");
    warn!(signum, "signal caught; tearing down clouds");
    true
}

#[derive(Debug)]
pub struct SignalCoordinator;

impl SignalCoordinator {
    /// Register handlers and spawn the task that listens for them.
    #[cfg(unix)]
    pub fn install(ctx: Arc<RunContext>) -> std::io::Result<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        const SIGINT: i32 = 2;
        const SIGTERM: i32 = 15;

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        Ok(tokio::spawn(async move {
            loop {
                let signum = tokio::select! {
                    received = sigint.recv() => match received {
                        Some(()) => SIGINT,
                        None => return,
                    },
                    received = sigterm.recv() => match received {
                        Some(()) => SIGTERM,
                        None => return,
                    },
                };
                handle_signal(&ctx, signum);
            }
        }))
    }

    #[cfg(not(unix))]
    pub fn install(ctx: Arc<RunContext>) -> std::io::Result<JoinHandle<()>> {
        const SIGINT: i32 = 2;

        Ok(tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                handle_signal(&ctx, SIGINT);
            }
        }))
    }
}
