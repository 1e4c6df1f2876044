//! Test discovery.
//!
//! Every strategy produces the same ordered list of [`TestSpec`]s, so the
//! scheduler never needs to know which one was used:
//! - a single explicit test path,
//! - a list file (one path per line, e.g. a previous run's `failed.txt`),
//! - a recursive walk of the test root with group and size filters.

use crate::types::{SizeFilter, TestSize, TestSpec};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("test does not exist: {0}")]
    TestNotFound(String),
    #[error("failure reading test list {path}: {source}")]
    ListUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failure walking {path}: {source}")]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// A strategy that enumerates tests to run.
pub trait TestDiscoverer {
    /// Produce the ordered list of tests.
    fn discover(&self) -> Result<Vec<TestSpec>>;
}

/// Resolve a user-supplied test path.
///
/// An existing path is used as-is (made absolute). Otherwise the test root is
/// searched for a file with that name.
pub fn find_test(test: &str, test_root: &Path) -> Result<PathBuf> {
    let candidate = Path::new(test);
    if candidate.exists() {
        return absolute(candidate)
            .map_err(|_| DiscoveryError::TestNotFound(test.to_string()));
    }

    collect_files(test_root, |_| true)?
        .into_iter()
        .find(|p| p.file_name().is_some_and(|n| n == test))
        .ok_or_else(|| DiscoveryError::TestNotFound(test.to_string()))
}

/// One explicitly named test.
#[derive(Debug, Clone)]
pub struct SingleTest {
    pub test: String,
    pub test_root: PathBuf,
}

impl TestDiscoverer for SingleTest {
    fn discover(&self) -> Result<Vec<TestSpec>> {
        let path = find_test(&self.test, &self.test_root)?;
        Ok(vec![TestSpec::new(&path, &self.test_root)])
    }
}

/// Tests listed one per line in a file; blank and `#` lines are skipped.
#[derive(Debug, Clone)]
pub struct TestListFile {
    pub list: PathBuf,
    pub test_root: PathBuf,
}

impl TestDiscoverer for TestListFile {
    fn discover(&self) -> Result<Vec<TestSpec>> {
        let content =
            fs::read_to_string(&self.list).map_err(|source| DiscoveryError::ListUnreadable {
                path: self.list.clone(),
                source,
            })?;

        let mut specs = Vec::new();
        for line in content.lines() {
            let stripped = line.trim();
            if stripped.is_empty() || stripped.starts_with('#') {
                continue;
            }
            let path = find_test(stripped, &self.test_root)?;
            specs.push(TestSpec::new(&path, &self.test_root));
        }
        Ok(specs)
    }
}

/// Recursive walk of the test root.
#[derive(Debug, Clone)]
pub struct DirectoryWalk {
    pub test_root: PathBuf,
    /// Substring of the file name that marks a test (e.g. `runit`).
    pub marker: String,
    /// Accepted file extensions, without the dot.
    pub extensions: Vec<String>,
    /// Optional group; kept tests have it (lower-cased) in their short dir.
    pub group: Option<String>,
    pub sizes: SizeFilter,
}

impl DirectoryWalk {
    fn is_test_file(&self, name: &str) -> bool {
        if !name.contains(&self.marker) {
            return false;
        }
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|x| x == ext))
    }
}

impl TestDiscoverer for DirectoryWalk {
    fn discover(&self) -> Result<Vec<TestSpec>> {
        let files = collect_files(&self.test_root, |dir| {
            !dir.file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with("Util"))
        })?;

        let group = self.group.as_ref().map(|g| g.to_lowercase());
        let mut specs = Vec::new();
        for path in files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if !self.is_test_file(&name) {
                continue;
            }
            if !self.sizes.allows(TestSize::from_file_name(&name)) {
                continue;
            }
            let spec = TestSpec::new(&path, &self.test_root);
            if let Some(ref group) = group {
                if !spec.short_dir.contains(group.as_str()) {
                    continue;
                }
            }
            specs.push(spec);
        }
        Ok(specs)
    }
}

/// Collect every file under `root` in sorted order, descending only into
/// directories accepted by `descend`. Directory symlinks are not followed.
fn collect_files(root: &Path, descend: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_type().is_dir() || descend(e.path()));

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|source| DiscoveryError::Walk {
            path: source
                .path()
                .map_or_else(|| root.to_path_buf(), Path::to_path_buf),
            source,
        })?;
        let is_file = entry.file_type().is_file()
            || (entry.path_is_symlink() && entry.path().is_file());
        if is_file {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
