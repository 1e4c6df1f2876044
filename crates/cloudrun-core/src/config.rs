//! Configuration parsing for the test-cloud orchestrator.
//!
//! Uses a `key=value` format (`#` comments, optional quotes), read from
//! `--config <file>` or `<test_root>/.cloudrun/config`.
//! Precedence: CLI flags > config file > defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Relative location of the per-test-root config file.
pub const CONFIG_RELATIVE_PATH: &str = ".cloudrun/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("unknown placeholder in {key}: {placeholder}")]
    UnknownPlaceholder { key: String, placeholder: String },
    #[error("{0} must not be empty")]
    EmptyCommand(&'static str),
}

/// Orchestrator configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Cloud layout
    pub base_port: u16,
    pub num_clouds: usize,
    pub nodes_per_cloud: usize,
    /// Address used to reach every locally started node.
    pub cloud_ip: String,
    pub cloud_name_prefix: String,

    // Worker launch
    /// Worker command template; placeholders: {memory} {jar} {name} {port}.
    pub worker_cmd: String,
    pub worker_jar: PathBuf,
    pub worker_memory: String,
    /// Extra config file passed to every worker, only if it exists.
    pub worker_aux_config: Option<PathBuf>,
    pub worker_aux_flag: String,

    // Test launch
    /// Test command template; placeholders: {test} {endpoint}.
    pub test_cmd: String,
    /// One-time setup command run against cloud 0; placeholders: {root} {endpoint}.
    /// Empty disables the setup step.
    pub setup_cmd: String,

    // Discovery
    pub test_marker: String,
    pub test_extensions: Vec<String>,

    // Tolerated failures
    pub nopass_marker: String,
    pub tolerated_tests: Vec<String>,
    pub tolerate_list: Option<PathBuf>,

    // Timing
    pub port_scrape_retries: u32,
    pub port_scrape_interval_ms: u64,
    pub poll_interval_ms: u64,
    /// Per-test deadline in seconds (0 = no deadline).
    pub test_timeout_sec: u64,

    // Persisted state
    pub output_dir: Option<PathBuf>,
    pub seed_file: String,
    pub sandbox_marker: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_port: 40000,
            num_clouds: 5,
            nodes_per_cloud: 1,
            cloud_ip: "127.0.0.1".to_string(),
            cloud_name_prefix: "H2O_runit".to_string(),
            worker_cmd: "java -Xmx{memory} -ea -jar {jar} -name {name} -baseport {port} -hdfs_version cdh3"
                .to_string(),
            worker_jar: PathBuf::from("../../target/h2o.jar"),
            worker_memory: "1g".to_string(),
            worker_aux_config: dirs::home_dir().map(|h| h.join(".ec2/core-site.xml")),
            worker_aux_flag: "-hdfs_config".to_string(),
            test_cmd: "R -f {test} --args {endpoint}".to_string(),
            setup_cmd: "R --quiet -f {root}/Utils/runnerSetupPackage.R --args {endpoint}"
                .to_string(),
            test_marker: "runit".to_string(),
            test_extensions: vec!["R".to_string(), "r".to_string()],
            nopass_marker: "NOPASS".to_string(),
            tolerated_tests: Vec::new(),
            tolerate_list: None,
            port_scrape_retries: 30,
            port_scrape_interval_ms: 1000,
            poll_interval_ms: 1000,
            test_timeout_sec: 0,
            output_dir: None,
            seed_file: "master_seed".to_string(),
            sandbox_marker: "Rsandbox".to_string(),
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load the config for a test root: `<root>/.cloudrun/config` if present, else defaults.
    pub fn for_test_root(test_root: &Path) -> Result<Self, ConfigError> {
        let path = test_root.join(CONFIG_RELATIVE_PATH);
        if path.exists() {
            Self::from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "base_port" => self.base_port = Self::parse_int(key, value)?,
            "num_clouds" => self.num_clouds = Self::parse_int(key, value)?,
            "nodes_per_cloud" => self.nodes_per_cloud = Self::parse_int(key, value)?,
            "cloud_ip" => self.cloud_ip = value.to_string(),
            "cloud_name_prefix" => self.cloud_name_prefix = value.to_string(),
            "worker_cmd" => self.worker_cmd = value.to_string(),
            "worker_jar" => self.worker_jar = PathBuf::from(value),
            "worker_memory" => self.worker_memory = value.to_string(),
            "worker_aux_config" => {
                self.worker_aux_config = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "worker_aux_flag" => self.worker_aux_flag = value.to_string(),
            "test_cmd" => self.test_cmd = value.to_string(),
            "setup_cmd" => self.setup_cmd = value.to_string(),
            "test_marker" => self.test_marker = value.to_string(),
            "test_extensions" => {
                self.test_extensions = value.split_whitespace().map(str::to_string).collect();
            }
            "nopass_marker" => self.nopass_marker = value.to_string(),
            "tolerated_tests" => {
                self.tolerated_tests = value.split_whitespace().map(str::to_string).collect();
            }
            "tolerate_list" => {
                self.tolerate_list = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "port_scrape_retries" => self.port_scrape_retries = Self::parse_int(key, value)?,
            "port_scrape_interval_ms" => {
                self.port_scrape_interval_ms = Self::parse_int(key, value)?;
            }
            "poll_interval_ms" => self.poll_interval_ms = Self::parse_int(key, value)?,
            "test_timeout_sec" => self.test_timeout_sec = Self::parse_int(key, value)?,
            "output_dir" => self.output_dir = Some(PathBuf::from(value)),
            "seed_file" => self.seed_file = value.to_string(),
            "sandbox_marker" => self.sandbox_marker = value.to_string(),
            _ => {
                warn!(key, "unknown config key, ignoring");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Resolve relative paths against the test root.
    pub fn resolve_paths(&mut self, test_root: &Path) {
        if self.worker_jar.is_relative() {
            self.worker_jar = test_root.join(&self.worker_jar);
        }
        if let Some(ref list) = self.tolerate_list {
            if list.is_relative() {
                self.tolerate_list = Some(test_root.join(list));
            }
        }
        if let Some(ref out) = self.output_dir {
            if out.is_relative() {
                self.output_dir = Some(test_root.join(out));
            }
        }
    }

    /// Check command templates for unknown placeholders.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_cmd.trim().is_empty() {
            return Err(ConfigError::EmptyCommand("worker_cmd"));
        }
        if self.test_cmd.trim().is_empty() {
            return Err(ConfigError::EmptyCommand("test_cmd"));
        }
        check_placeholders("worker_cmd", &self.worker_cmd, &["memory", "jar", "name", "port"])?;
        check_placeholders("test_cmd", &self.test_cmd, &["test", "endpoint"])?;
        check_placeholders("setup_cmd", &self.setup_cmd, &["root", "endpoint"])?;
        Ok(())
    }

    /// Names tolerated by the allow-list: `tolerated_tests` plus the `tolerate_list` file.
    pub fn tolerated_names(&self) -> Result<Vec<String>, ConfigError> {
        let mut names = self.tolerated_tests.clone();
        if let Some(ref path) = self.tolerate_list {
            let content = std::fs::read_to_string(path)?;
            names.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string),
            );
        }
        Ok(names)
    }
}

/// Expand a command template into argv.
///
/// The template is split on whitespace first, so substituted values containing
/// spaces stay a single argument.
pub fn expand_command(template: &str, vars: &[(&str, &str)]) -> Vec<String> {
    template
        .split_whitespace()
        .map(|token| {
            let mut arg = token.to_string();
            for (name, value) in vars {
                arg = arg.replace(&format!("{{{name}}}"), value);
            }
            arg
        })
        .collect()
}

fn check_placeholders(key: &str, template: &str, allowed: &[&str]) -> Result<(), ConfigError> {
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            break;
        };
        let name = &after[..close];
        if !allowed.contains(&name) {
            return Err(ConfigError::UnknownPlaceholder {
                key: key.to_string(),
                placeholder: name.to_string(),
            });
        }
        rest = &after[close + 1..];
    }
    Ok(())
}
