//! Result reporting.
//!
//! Every line goes to stdout and is appended to `summary.txt`. Non-passing
//! tests are also appended to `failed.txt`, and their output is copied into
//! `failed/` unless the test is tolerated. The run ends with a summary block
//! and a machine-readable `summary.json`.

use crate::test_unit::TestUnit;
use chrono::{DateTime, Utc};
use cloudrun_core::report::{format_fail_line, format_pass_line, scrape_seed};
use cloudrun_core::{RunSummary, Summary, TestOutcome, TestRecord};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub const SUMMARY_FILE: &str = "summary.txt";
pub const FAILED_LIST_FILE: &str = "failed.txt";
pub const SUMMARY_JSON_FILE: &str = "summary.json";

#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("output directory already exists: {0} (try adding --wipe)")]
    OutputDirExists(PathBuf),
    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize summary: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReporterError>;

#[derive(Debug, Clone)]
pub struct Reporter {
    output_dir: PathBuf,
    failed_dir: PathBuf,
}

impl Reporter {
    pub fn new(output_dir: &Path, failed_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            failed_dir: failed_dir.to_path_buf(),
        }
    }

    pub fn summary_path(&self) -> PathBuf {
        self.output_dir.join(SUMMARY_FILE)
    }

    pub fn failed_list_path(&self) -> PathBuf {
        self.output_dir.join(FAILED_LIST_FILE)
    }

    pub fn summary_json_path(&self) -> PathBuf {
        self.output_dir.join(SUMMARY_JSON_FILE)
    }

    /// Create the output directory and its `failed/` subdirectory.
    ///
    /// An existing output directory is an error so results from a previous
    /// run are never mixed in.
    pub fn create_output_dirs(&self) -> Result<()> {
        if self.output_dir.exists() {
            return Err(ReporterError::OutputDirExists(self.output_dir.clone()));
        }
        for dir in [&self.output_dir, &self.failed_dir] {
            fs::create_dir_all(dir).map_err(|source| ReporterError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Print a line and append it to `summary.txt`.
    pub fn log(&self, line: &str) -> Result<()> {
        println!("{line}");
        append_line(&self.summary_path(), line)
    }

    /// Report one completed test and return its record.
    pub fn report_test(&self, test: &TestUnit) -> Result<TestRecord> {
        let output = test.output_path().map(Path::to_path_buf);
        let seed = output
            .as_deref()
            .and_then(|p| fs::read_to_string(p).ok())
            .map(|content| scrape_seed(&content));
        let record = test.record(seed);

        let port = record.port.unwrap_or_default();
        let elapsed = record.elapsed_secs.unwrap_or_default();

        if record.outcome == TestOutcome::Passed {
            self.log(&format_pass_line(port, elapsed, &record.name))?;
            return Ok(record);
        }

        let output_file = record.output_file.clone().unwrap_or_default();
        let line = format_fail_line(
            port,
            elapsed,
            &record.name,
            &output_file,
            record.seed.as_deref().unwrap_or_default(),
            record.timed_out,
        );
        self.log(&line)?;
        append_line(&self.failed_list_path(), &record.path)?;

        if record.outcome != TestOutcome::Tolerated {
            if let Some(src) = output {
                self.copy_failed_output(&src);
            }
        }
        Ok(record)
    }

    fn copy_failed_output(&self, src: &Path) {
        let Some(name) = src.file_name() else {
            return;
        };
        let dest = self.failed_dir.join(name);
        match fs::copy(src, &dest) {
            Ok(_) => debug!(dest = %dest.display(), "copied failing output"),
            Err(e) => warn!(src = %src.display(), error = %e, "failed to copy failing output"),
        }
    }

    /// Print the summary block and write `summary.json`.
    pub fn summarize(
        &self,
        records: Vec<TestRecord>,
        started_at: DateTime<Utc>,
    ) -> Result<RunSummary> {
        let ended_at = Utc::now();
        let total_secs = (ended_at - started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let summary = Summary::from_records(&records, total_secs);

        for line in summary.render() {
            self.log(&line)?;
        }

        let run = RunSummary {
            start_ms: started_at.timestamp_millis(),
            end_ms: ended_at.timestamp_millis(),
            summary,
            tests: records,
        };
        let path = self.summary_json_path();
        let json = serde_json::to_string_pretty(&run)?;
        fs::write(&path, json).map_err(|source| ReporterError::Write { path, source })?;
        Ok(run)
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| ReporterError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    writeln!(file, "{line}").map_err(|source| ReporterError::Write {
        path: path.to_path_buf(),
        source,
    })
}
