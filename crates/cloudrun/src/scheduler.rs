//! Test scheduler.
//!
//! Starts the clouds, runs the one-time setup step, then keeps one test
//! running per cloud until the queue drains. Completion is found by polling.
//! Every test moves `not_started -> running -> completed` exactly once.
//! Cancellation is checked before each unit of work and at every sleep.

use crate::cloud::{Cloud, CloudError};
use crate::context::RunContext;
use crate::process::{ProcessError, ProcessHandle};
use crate::reporter::{Reporter, ReporterError};
use crate::test_unit::{TestUnit, TestUnitError};
use cloudrun_core::config::expand_command;
use cloudrun_core::{RunSummary, TestRecord, TestSpec, TolerancePolicy};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capture file for the setup step, inside the output directory.
pub const SETUP_OUTPUT_FILE: &str = "runnerSetupPackage.out.txt";

/// How long stopped workers get to exit before they are killed.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no clouds to run tests on")]
    NoClouds,
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error(transparent)]
    Test(#[from] TestUnitError),
    #[error(transparent)]
    Report(#[from] ReporterError),
    #[error("setup step failed to launch: {0}")]
    SetupLaunch(#[source] ProcessError),
    #[error("setup step failed with exit code {code}; see {}", .output.display())]
    SetupFailed { code: i32, output: PathBuf },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// What a finished (or interrupted) run produced.
#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    /// The run was torn down before it finished.
    pub terminated: bool,
}

impl RunReport {
    pub fn regression_passed(&self) -> bool {
        !self.terminated && self.summary.summary.regression_passed
    }
}

/// Wrap discovered tests, deciding tolerance up front.
pub fn build_test_units(specs: Vec<TestSpec>, tolerance: &TolerancePolicy) -> Vec<TestUnit> {
    specs
        .into_iter()
        .map(|spec| {
            let tolerated = tolerance.is_tolerated(&spec.file_name);
            TestUnit::new(spec, tolerated)
        })
        .collect()
}

#[derive(Debug)]
pub struct Scheduler<'a, C: Cloud> {
    ctx: &'a RunContext,
    clouds: Vec<C>,
    reporter: Reporter,
    total: usize,
    not_started: VecDeque<TestUnit>,
    running: Vec<TestUnit>,
    completed: Vec<TestUnit>,
    records: Vec<TestRecord>,
    torn_down: bool,
}

impl<'a, C: Cloud> Scheduler<'a, C> {
    pub fn new(ctx: &'a RunContext, clouds: Vec<C>, tests: Vec<TestUnit>, reporter: Reporter) -> Self {
        Self {
            ctx,
            clouds,
            reporter,
            total: tests.len(),
            not_started: tests.into(),
            running: Vec::new(),
            completed: Vec::new(),
            records: Vec::new(),
            torn_down: false,
        }
    }

    /// Run every test and summarize.
    ///
    /// An interrupted run still produces a summary. A fatal error tears
    /// everything down and is returned without one.
    pub async fn run(mut self) -> Result<RunReport> {
        if self.clouds.is_empty() {
            return Err(SchedulerError::NoClouds);
        }
        if let Err(e) = self.drive().await {
            self.terminate().await;
            return Err(e);
        }
        self.finish()
    }

    async fn drive(&mut self) -> Result<()> {
        self.start_clouds().await?;
        if self.abort_if_terminated().await {
            return Ok(());
        }
        self.run_setup().await?;
        if self.abort_if_terminated().await {
            return Ok(());
        }
        self.run_tests().await?;
        if self.abort_if_terminated().await {
            return Ok(());
        }
        self.stop_clouds().await?;
        Ok(())
    }

    async fn abort_if_terminated(&mut self) -> bool {
        if self.ctx.is_terminated() {
            self.terminate().await;
            true
        } else {
            false
        }
    }

    fn total_nodes(&self) -> usize {
        self.clouds.iter().map(Cloud::node_count).sum()
    }

    async fn start_clouds(&mut self) -> Result<()> {
        let ctx = self.ctx;
        let cancel = ctx.cancel_token();
        for cloud in &mut self.clouds {
            if cancel.is_cancelled() {
                return Ok(());
            }
            cloud.start()?;
        }
        for cloud in &mut self.clouds {
            if cancel.is_cancelled() {
                return Ok(());
            }
            cloud.wait_until_ready(cancel).await?;
            if let Ok(endpoint) = cloud.address() {
                info!(cloud = cloud.name(), %endpoint, "cloud is ready");
            }
        }
        Ok(())
    }

    /// Run the one-time setup command against the first cloud.
    async fn run_setup(&mut self) -> Result<()> {
        let ctx = self.ctx;
        let template = ctx.config().setup_cmd.as_str();
        if template.trim().is_empty() {
            return Ok(());
        }

        let endpoint = self.clouds[0].address()?.to_string();
        let root = ctx.test_root().to_string_lossy().into_owned();
        let argv = expand_command(
            template,
            &[("root", root.as_str()), ("endpoint", endpoint.as_str())],
        );
        let output = ctx.output_dir().join(SETUP_OUTPUT_FILE);

        self.reporter.log("")?;
        self.reporter.log("Running setup step...")?;
        info!("+ CMD: {}", argv.join(" "));
        let mut handle = ProcessHandle::launch(&argv, &output, ctx.test_root())
            .map_err(SchedulerError::SetupLaunch)?;

        let code = tokio::select! {
            code = handle.wait() => code.map_err(SchedulerError::SetupLaunch)?,
            () = ctx.cancel_token().cancelled() => {
                handle.terminate();
                let _ = handle.wait().await;
                return Ok(());
            }
        };
        if code != 0 {
            return Err(SchedulerError::SetupFailed { code, output });
        }
        debug!("setup step finished");
        Ok(())
    }

    async fn run_tests(&mut self) -> Result<()> {
        let nodes = self.total_nodes();
        self.reporter.log("")?;
        if nodes == 0 {
            self.reporter
                .log(&format!("Starting {} tests...", self.total))?;
        } else {
            self.reporter
                .log(&format!("Starting {} tests on {nodes} total nodes...", self.total))?;
        }
        self.reporter.log("")?;

        let primed = self.clouds.len().min(self.not_started.len());
        for cloud_index in 0..primed {
            self.dispatch(cloud_index)?;
        }

        while !self.not_started.is_empty() {
            let Some(done) = self.wait_for_completion().await else {
                return Ok(());
            };
            let cloud_index = done.cloud_index();
            self.report(done)?;
            if let Some(cloud_index) = cloud_index {
                self.dispatch(cloud_index)?;
            }
        }

        while !self.running.is_empty() {
            let Some(done) = self.wait_for_completion().await else {
                return Ok(());
            };
            self.report(done)?;
        }
        Ok(())
    }

    /// Start the next queued test on `cloud_index`.
    fn dispatch(&mut self, cloud_index: usize) -> Result<()> {
        if self.not_started.is_empty() {
            return Ok(());
        }
        let cloud = &mut self.clouds[cloud_index];
        let endpoint = cloud.address()?;
        let Some(mut test) = self.not_started.pop_front() else {
            return Ok(());
        };
        debug_assert!(
            !self
                .running
                .iter()
                .any(|t| t.cloud_index() == Some(cloud_index)),
            "cloud already has a running test"
        );

        cloud.record_job();
        let started = test.start(
            cloud_index,
            endpoint,
            self.ctx.output_dir(),
            &self.ctx.config().test_cmd,
        );
        // Keep the test accounted for even if it failed to launch.
        self.running.push(test);
        started?;
        Ok(())
    }

    /// Sweep running tests until one completes.
    ///
    /// Returns `None` if the run is cancelled or nothing is running.
    async fn wait_for_completion(&mut self) -> Option<TestUnit> {
        let ctx = self.ctx;
        let timeout = ctx.test_timeout();
        loop {
            if self.running.is_empty() {
                return None;
            }
            for i in 0..self.running.len() {
                if ctx.is_terminated() {
                    return None;
                }
                if let Some(timeout) = timeout {
                    self.running[i].enforce_deadline(timeout);
                }
                if self.running[i].is_completed() {
                    return Some(self.running.remove(i));
                }
            }
            if !ctx.sleep(ctx.poll_interval()).await {
                return None;
            }
        }
    }

    fn report(&mut self, test: TestUnit) -> Result<()> {
        let record = self.reporter.report_test(&test)?;
        self.records.push(record);
        self.completed.push(test);
        debug_assert_eq!(
            self.not_started.len() + self.running.len() + self.completed.len(),
            self.total
        );
        Ok(())
    }

    async fn stop_clouds(&mut self) -> Result<()> {
        self.reporter.log("")?;
        if self.total_nodes() == 0 {
            self.reporter.log("All tests completed...")?;
        } else {
            self.reporter
                .log("All tests completed; tearing down clouds...")?;
        }
        self.reporter.log("")?;

        for cloud in &mut self.clouds {
            debug!(cloud = cloud.name(), jobs_run = cloud.jobs_run(), "stopping cloud");
            cloud.stop();
        }
        self.wait_for_clouds().await;
        Ok(())
    }

    /// Give stopped clouds [`STOP_GRACE`] to exit, then kill what is left.
    async fn wait_for_clouds(&mut self) {
        let deadline = Instant::now() + STOP_GRACE;
        for cloud in &mut self.clouds {
            cloud.wait_stopped(deadline).await;
        }
    }

    /// Cancel queued tests, kill running ones, then shut down the clouds.
    async fn terminate(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        warn!(
            queued = self.not_started.len(),
            running = self.running.len(),
            "tearing down clouds"
        );
        for test in &mut self.not_started {
            test.cancel();
        }
        for test in &mut self.running {
            test.terminate();
        }
        for cloud in &mut self.clouds {
            cloud.terminate();
        }
        self.wait_for_clouds().await;
    }

    /// Account for unfinished tests and write the summary.
    fn finish(mut self) -> Result<RunReport> {
        for mut test in self.not_started.drain(..) {
            test.cancel();
            self.records.push(test.record(None));
            self.completed.push(test);
        }
        for mut test in self.running.drain(..) {
            test.terminate();
            self.records.push(test.record(None));
            self.completed.push(test);
        }
        debug_assert_eq!(self.completed.len(), self.total);

        let summary = self
            .reporter
            .summarize(std::mem::take(&mut self.records), self.ctx.started_at())?;
        Ok(RunReport {
            summary,
            terminated: self.ctx.is_terminated(),
        })
    }
}
