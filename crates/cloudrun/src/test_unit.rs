//! One scheduled test: its process, timing, and result.

use crate::process::{ProcessError, ProcessHandle};
use cloudrun_core::config::expand_command;
use cloudrun_core::{Endpoint, TestOutcome, TestRecord, TestSpec, DID_NOT_RUN};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TestUnitError {
    #[error("test {name} failed to launch: {source}")]
    Launch {
        name: String,
        #[source]
        source: ProcessError,
    },
}

pub type Result<T> = std::result::Result<T, TestUnitError>;

#[derive(Debug)]
pub struct TestUnit {
    spec: TestSpec,
    tolerated: bool,
    cloud_index: Option<usize>,
    endpoint: Option<Endpoint>,
    process: Option<ProcessHandle>,
    output_path: Option<PathBuf>,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
    returncode: i32,
    cancelled: bool,
    terminated: bool,
    timed_out: bool,
}

impl TestUnit {
    pub fn new(spec: TestSpec, tolerated: bool) -> Self {
        Self {
            spec,
            tolerated,
            cloud_index: None,
            endpoint: None,
            process: None,
            output_path: None,
            started_at: None,
            ended_at: None,
            returncode: DID_NOT_RUN,
            cancelled: false,
            terminated: false,
            timed_out: false,
        }
    }

    pub fn spec(&self) -> &TestSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.file_name
    }

    pub fn is_tolerated(&self) -> bool {
        self.tolerated
    }

    pub fn cloud_index(&self) -> Option<usize> {
        self.cloud_index
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    pub fn returncode(&self) -> i32 {
        self.returncode
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Launch the test against `endpoint` on cloud `cloud_index`.
    ///
    /// The process runs from the test's own directory. A cancelled or
    /// terminated test is not started.
    pub fn start(
        &mut self,
        cloud_index: usize,
        endpoint: Endpoint,
        output_dir: &Path,
        test_cmd: &str,
    ) -> Result<()> {
        if self.cancelled || self.terminated {
            debug!(test = %self.spec.file_name, "not starting cancelled test");
            return Ok(());
        }

        let address = endpoint.to_string();
        let argv = expand_command(
            test_cmd,
            &[
                ("test", self.spec.file_name.as_str()),
                ("endpoint", address.as_str()),
            ],
        );
        let output_path = output_dir.join(self.spec.output_file_name());

        info!(cloud = cloud_index, "+ CMD: {}", argv.join(" "));
        let handle = ProcessHandle::launch(&argv, &output_path, self.spec.dir()).map_err(
            |source| TestUnitError::Launch {
                name: self.spec.file_name.clone(),
                source,
            },
        )?;

        self.process = Some(handle);
        self.output_path = Some(output_path);
        self.cloud_index = Some(cloud_index);
        self.endpoint = Some(endpoint);
        self.started_at = Some(Instant::now());
        Ok(())
    }

    /// Poll for completion. Records the exit code and end time on first observation.
    pub fn is_completed(&mut self) -> bool {
        if self.returncode != DID_NOT_RUN {
            return true;
        }
        if self.terminated {
            return false;
        }
        let Some(handle) = self.process.as_mut() else {
            return false;
        };
        match handle.poll() {
            Some(code) => {
                self.returncode = code;
                self.ended_at = Some(Instant::now());
                self.process = None;
                true
            }
            None => false,
        }
    }

    /// Mark the test so it is never started.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    /// Kill the test and forget its process; it will not be reported as completed.
    pub fn terminate(&mut self) {
        self.terminated = true;
        if let Some(mut handle) = self.process.take() {
            debug!(test = %self.spec.file_name, pid = handle.pid(), "killing test");
            handle.terminate();
        }
    }

    /// Wall time since the test started; fixed once it has completed.
    pub fn elapsed(&self) -> Option<Duration> {
        let started = self.started_at?;
        Some(match self.ended_at {
            Some(ended) => ended.duration_since(started),
            None => started.elapsed(),
        })
    }

    /// Kill the test if it has run longer than `timeout`.
    ///
    /// The process is kept so its exit is observed on a later poll, which
    /// makes the test report as failed rather than unfinished.
    pub fn enforce_deadline(&mut self, timeout: Duration) -> bool {
        if self.timed_out || self.returncode != DID_NOT_RUN {
            return false;
        }
        if !self.elapsed().is_some_and(|e| e > timeout) {
            return false;
        }
        if let Some(handle) = self.process.as_mut() {
            info!(test = %self.spec.file_name, timeout_secs = timeout.as_secs(), "test exceeded deadline; killing");
            handle.terminate();
            self.timed_out = true;
        }
        self.timed_out
    }

    pub fn outcome(&self) -> TestOutcome {
        TestOutcome::classify(self.returncode, self.is_started(), self.tolerated)
    }

    /// Snapshot for reporting. `seed` is the seed scraped from the output, if any.
    pub fn record(&self, seed: Option<String>) -> TestRecord {
        TestRecord {
            name: self.spec.file_name.clone(),
            path: self.spec.path.to_string_lossy().to_string(),
            outcome: self.outcome(),
            exit_code: (self.returncode != DID_NOT_RUN).then_some(self.returncode),
            port: self.endpoint.as_ref().map(|e| e.port),
            elapsed_secs: self
                .elapsed()
                .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX)),
            output_file: self
                .output_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            seed: seed.filter(|s| !s.is_empty()),
            timed_out: self.timed_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        out: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("tests");
        let out = dir.path().join("results");
        fs::create_dir_all(root.join("testdir_misc")).unwrap();
        fs::create_dir_all(&out).unwrap();
        Fixture {
            _dir: dir,
            root,
            out,
        }
    }

    fn unit(fx: &Fixture, name: &str, body: &str, tolerated: bool) -> TestUnit {
        let path = fx.root.join("testdir_misc").join(name);
        fs::write(&path, body).unwrap();
        TestUnit::new(TestSpec::new(&path, &fx.root), tolerated)
    }

    async fn wait_done(unit: &mut TestUnit) {
        for _ in 0..500 {
            if unit.is_completed() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("test did not complete");
    }

    #[tokio::test]
    async fn passing_test_runs_in_its_directory() {
        let fx = fixture();
        let mut t = unit(&fx, "runit_ok.sh", "pwd; echo \"endpoint $1\"\n", false);
        t.start(0, Endpoint::new("127.0.0.1", 40001), &fx.out, "sh {test} {endpoint}")
            .unwrap();
        assert!(t.is_started());
        wait_done(&mut t).await;

        assert_eq!(t.returncode(), 0);
        assert_eq!(t.outcome(), TestOutcome::Passed);
        let output = fs::read_to_string(t.output_path().unwrap()).unwrap();
        assert!(output.contains("testdir_misc"));
        assert!(output.contains("endpoint 127.0.0.1:40001"));
        assert_eq!(
            t.output_path().unwrap(),
            fx.out.join("testdir_misc_runit_ok.sh.out.txt")
        );
    }

    #[tokio::test]
    async fn failing_test_is_failed_or_tolerated() {
        let fx = fixture();
        let mut t = unit(&fx, "runit_bad.sh", "exit 2\n", false);
        t.start(0, Endpoint::new("h", 1), &fx.out, "sh {test}").unwrap();
        wait_done(&mut t).await;
        assert_eq!(t.outcome(), TestOutcome::Failed);
        let record = t.record(Some("77".to_string()));
        assert_eq!(record.exit_code, Some(2));
        assert_eq!(record.seed.as_deref(), Some("77"));

        let mut t = unit(&fx, "runit_NOPASS_bad.sh", "exit 2\n", true);
        t.start(0, Endpoint::new("h", 1), &fx.out, "sh {test}").unwrap();
        wait_done(&mut t).await;
        assert_eq!(t.outcome(), TestOutcome::Tolerated);
    }

    #[test]
    fn cancelled_test_never_starts() {
        let fx = fixture();
        let mut t = unit(&fx, "runit_x.sh", "true\n", false);
        t.cancel();
        t.start(0, Endpoint::new("h", 1), &fx.out, "sh {test}").unwrap();
        assert!(!t.is_started());
        assert!(!t.is_completed());
        assert_eq!(t.outcome(), TestOutcome::Cancelled);
        let record = t.record(None);
        assert_eq!(record.exit_code, None);
        assert_eq!(record.elapsed_secs, None);
    }

    #[tokio::test]
    async fn terminated_test_did_not_complete() {
        let fx = fixture();
        let mut t = unit(&fx, "runit_slow.sh", "sleep 30\n", false);
        t.start(0, Endpoint::new("h", 1), &fx.out, "sh {test}").unwrap();
        t.terminate();
        assert!(!t.is_completed());
        assert_eq!(t.returncode(), DID_NOT_RUN);
        assert_eq!(t.outcome(), TestOutcome::DidNotComplete);
    }

    #[tokio::test]
    async fn overdue_test_is_killed_and_fails() {
        let fx = fixture();
        let mut t = unit(&fx, "runit_hang.sh", "sleep 30\n", false);
        t.start(0, Endpoint::new("h", 1), &fx.out, "sh {test}").unwrap();
        assert!(!t.enforce_deadline(Duration::from_secs(60)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(t.enforce_deadline(Duration::from_millis(1)));
        wait_done(&mut t).await;
        assert!(t.timed_out());
        assert_eq!(t.outcome(), TestOutcome::Failed);
        assert!(t.record(None).timed_out);
    }

    #[test]
    fn launch_failure_names_the_test() {
        let fx = fixture();
        let mut t = unit(&fx, "runit_x.sh", "true\n", false);
        let err = t
            .start(0, Endpoint::new("h", 1), &fx.out, "no_such_interpreter_xyz {test}")
            .unwrap_err();
        assert!(err.to_string().contains("runit_x.sh"));
        assert!(!t.is_started());
    }
}
