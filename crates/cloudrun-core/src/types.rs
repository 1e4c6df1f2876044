//! Core types for the test-cloud orchestrator.
//!
//! Endpoints, test descriptors, size classes, and per-test outcomes.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Return code recorded for a test that never produced a real exit code.
///
/// Far below any value an OS process can exit with, so it can never collide.
pub const DID_NOT_RUN: i32 = -9_999_999;

/// Exit code recorded for a process that was killed by a signal.
pub const KILLED_EXIT_CODE: i32 = -1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("expected ip:port, got '{0}'")]
    Malformed(String),
    #[error("invalid port in '{0}'")]
    InvalidPort(String),
}

/// Network address of a cloud (always the address of its first node).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    /// Parse `ip:port`. The port must be a positive integer without a leading zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((ip, port)) = s.rsplit_once(':') else {
            return Err(EndpointError::Malformed(s.to_string()));
        };
        if ip.is_empty() || ip.chars().any(char::is_whitespace) {
            return Err(EndpointError::Malformed(s.to_string()));
        }
        if port.starts_with('0') || !port.chars().all(|c| c.is_ascii_digit()) {
            return Err(EndpointError::InvalidPort(s.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| EndpointError::InvalidPort(s.to_string()))?;
        Ok(Self::new(ip, port))
    }
}

/// Rough runtime class of a test, derived from its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestSize {
    Small,
    Medium,
    Large,
}

impl TestSize {
    /// `large` anywhere in the name wins over `medium`; everything else is small.
    pub fn from_file_name(name: &str) -> Self {
        if name.contains("large") {
            Self::Large
        } else if name.contains("medium") {
            Self::Medium
        } else {
            Self::Small
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

/// Which test sizes a directory walk should keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeFilter {
    pub small: bool,
    pub medium: bool,
    pub large: bool,
}

impl Default for SizeFilter {
    fn default() -> Self {
        Self {
            small: true,
            medium: true,
            large: true,
        }
    }
}

impl SizeFilter {
    pub fn allows(&self, size: TestSize) -> bool {
        match size {
            TestSize::Small => self.small,
            TestSize::Medium => self.medium,
            TestSize::Large => self.large,
        }
    }
}

impl FromStr for SizeFilter {
    type Err = String;

    /// Parse a combination of `s`, `m`, `l` (e.g. `sm`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.chars().all(|c| matches!(c, 's' | 'm' | 'l')) {
            return Err(format!("test size must combine s, m, l; got '{s}'"));
        }
        Ok(Self {
            small: s.contains('s'),
            medium: s.contains('m'),
            large: s.contains('l'),
        })
    }
}

/// A discovered test, before it is scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSpec {
    /// Absolute path to the test file.
    pub path: PathBuf,
    /// Directory of the test relative to the test root.
    pub short_dir: String,
    /// File name with the directory removed.
    pub file_name: String,
}

impl TestSpec {
    /// Build a descriptor for `path`, computing `short_dir` against `test_root`.
    pub fn new(path: &Path, test_root: &Path) -> Self {
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        let short_dir = match dir.strip_prefix(test_root) {
            Ok(rel) => rel.to_string_lossy().to_string(),
            Err(_) => dir.to_string_lossy().to_string(),
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            short_dir,
            file_name,
        }
    }

    /// Directory holding the test; the test process runs from here.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Capture file name: short dir with separators flattened, then the file name.
    pub fn output_file_name(&self) -> String {
        let flat = self.short_dir.replace(['/', '\\'], "_");
        format!("{flat}_{}.out.txt", self.file_name)
    }
}

/// Final classification of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed,
    /// Failed, but marked as known-flaky.
    Tolerated,
    /// Started but never observed to exit.
    DidNotComplete,
    /// Never started because the run was interrupted.
    Cancelled,
}

impl TestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Tolerated => "TOLERATED",
            Self::DidNotComplete => "DID_NOT_COMPLETE",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Whether this outcome keeps the overall regression green.
    pub fn is_acceptable(&self) -> bool {
        matches!(self, Self::Passed | Self::Tolerated)
    }

    /// Classify from the recorded return code and bookkeeping flags.
    pub fn classify(returncode: i32, started: bool, tolerated: bool) -> Self {
        if returncode == 0 {
            Self::Passed
        } else if returncode != DID_NOT_RUN {
            if tolerated {
                Self::Tolerated
            } else {
                Self::Failed
            }
        } else if started {
            Self::DidNotComplete
        } else {
            Self::Cancelled
        }
    }
}

/// Decides which failing tests are known-flaky.
///
/// A test is tolerated if its file name is on the allow-list, or if it
/// contains the marker substring (an empty marker disables matching).
#[derive(Debug, Clone, Default)]
pub struct TolerancePolicy {
    marker: String,
    allow: HashSet<String>,
}

impl TolerancePolicy {
    pub fn new(marker: impl Into<String>, allow: impl IntoIterator<Item = String>) -> Self {
        Self {
            marker: marker.into(),
            allow: allow.into_iter().collect(),
        }
    }

    pub fn is_tolerated(&self, file_name: &str) -> bool {
        self.allow.contains(file_name)
            || (!self.marker.is_empty() && file_name.contains(&self.marker))
    }
}
