//! One worker process belonging to a cloud.

use crate::process::{ProcessError, ProcessHandle};
use crate::scraper::{PortScraper, ScrapeError};
use cloudrun_core::config::expand_command;
use cloudrun_core::{Config, Endpoint};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("node {cloud}.{node} has no port in range")]
    PortOutOfRange { cloud: usize, node: usize },
    #[error("worker launch failed: {0}")]
    Launch(#[from] ProcessError),
    #[error("{0}")]
    Scrape(#[from] ScrapeError),
    #[error("node {cloud}.{node} has no known port")]
    PortUnknown { cloud: usize, node: usize },
}

pub type Result<T> = std::result::Result<T, NodeError>;

/// First port a node listens on. Each node reserves two consecutive ports.
pub fn node_base_port(
    base_port: u16,
    cloud_index: usize,
    nodes_per_cloud: usize,
    node_index: usize,
) -> Result<u16> {
    cloud_index
        .checked_mul(nodes_per_cloud)
        .and_then(|n| n.checked_add(node_index))
        .and_then(|n| n.checked_mul(2))
        .and_then(|offset| offset.checked_add(usize::from(base_port)))
        .and_then(|port| u16::try_from(port).ok())
        .ok_or(NodeError::PortOutOfRange {
            cloud: cloud_index,
            node: node_index,
        })
}

/// A single worker: its launch line, process, and discovered port.
#[derive(Debug)]
pub struct Node {
    cloud_index: usize,
    node_index: usize,
    base_port: u16,
    ip: String,
    argv: Vec<String>,
    output_path: PathBuf,
    working_dir: PathBuf,
    process: Option<ProcessHandle>,
    port: Option<u16>,
    terminated: bool,
}

impl Node {
    /// Prepare a node. Nothing is spawned until [`Node::start`].
    pub fn new(
        cloud_index: usize,
        node_index: usize,
        cloud_name: &str,
        config: &Config,
        output_dir: &Path,
    ) -> Result<Self> {
        let base_port = node_base_port(
            config.base_port,
            cloud_index,
            config.nodes_per_cloud,
            node_index,
        )?;

        let jar = config.worker_jar.to_string_lossy().into_owned();
        let port = base_port.to_string();
        let mut argv = expand_command(
            &config.worker_cmd,
            &[
                ("memory", config.worker_memory.as_str()),
                ("jar", jar.as_str()),
                ("name", cloud_name),
                ("port", port.as_str()),
            ],
        );
        if let Some(ref aux) = config.worker_aux_config {
            if aux.exists() && !config.worker_aux_flag.is_empty() {
                argv.push(config.worker_aux_flag.clone());
                argv.push(aux.to_string_lossy().to_string());
            }
        }

        let output_path =
            output_dir.join(format!("worker_{cloud_index}_{node_index}.out.txt"));

        Ok(Self {
            cloud_index,
            node_index,
            base_port,
            ip: config.cloud_ip.clone(),
            argv,
            output_path,
            working_dir: output_dir.to_path_buf(),
            process: None,
            port: None,
            terminated: false,
        })
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ProcessHandle::pid)
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Spawn the worker process.
    pub fn start(&mut self) -> Result<()> {
        info!("+ CMD: {}", self.argv.join(" "));
        let handle = ProcessHandle::launch(&self.argv, &self.output_path, &self.working_dir)?;
        info!(
            cloud = self.cloud_index,
            node = self.node_index,
            pid = handle.pid(),
            "started worker"
        );
        self.process = Some(handle);
        Ok(())
    }

    /// Scrape the worker's output until it announces its port.
    ///
    /// Leaves the port unset if the scrape is cancelled.
    pub async fn resolve_port(
        &mut self,
        scraper: &PortScraper,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let terminated = self.terminated;
        let port = scraper
            .scrape(&self.output_path, cancel, || terminated)
            .await?;
        if let Some(port) = port {
            info!(cloud = self.cloud_index, node = self.node_index, port, "worker is listening");
        }
        self.port = port;
        Ok(())
    }

    /// Ask the worker to shut down. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(handle) = self.process.as_mut() {
            info!(
                cloud = self.cloud_index,
                node = self.node_index,
                pid = handle.pid(),
                "stopping worker"
            );
            handle.request_stop();
        }
    }

    /// Wait for a stopped worker to exit, killing it at `deadline`.
    pub async fn wait_stopped(&mut self, deadline: Instant) {
        let Some(mut handle) = self.process.take() else {
            return;
        };
        handle.request_stop();
        match handle.wait_until(deadline).await {
            Ok(code) => debug!(cloud = self.cloud_index, node = self.node_index, code, "worker exited"),
            Err(e) => warn!(cloud = self.cloud_index, node = self.node_index, error = %e, "failed waiting for worker"),
        }
    }

    /// Stop the node and refuse any further port scraping.
    pub fn terminate(&mut self) {
        self.terminated = true;
        self.stop();
    }

    pub fn address(&self) -> Result<Endpoint> {
        self.port
            .map(|port| Endpoint::new(self.ip.clone(), port))
            .ok_or(NodeError::PortUnknown {
                cloud: self.cloud_index,
                node: self.node_index,
            })
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Node")?;
        writeln!(f, "    cloud_index: {}", self.cloud_index)?;
        writeln!(f, "    node_index:  {}", self.node_index)?;
        writeln!(f, "    base_port:   {}", self.base_port)?;
        writeln!(f, "    ip:          {}", self.ip)?;
        match self.port {
            Some(port) => writeln!(f, "    port:        {port}")?,
            None => writeln!(f, "    port:        (unknown)")?,
        }
        match self.pid() {
            Some(pid) => writeln!(f, "    pid:         {pid}")?,
            None => writeln!(f, "    pid:         (not running)")?,
        }
        writeln!(f, "    output:      {}", self.output_path.display())
    }
}
