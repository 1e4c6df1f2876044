//! Clouds: the servers tests run against.
//!
//! A [`ManagedCloud`] is started and owned by this process. A
//! [`UserSuppliedCloud`] is an address the operator already has running; it
//! is never started or stopped. The scheduler treats both through [`Cloud`].

use crate::naming;
use crate::node::{Node, NodeError};
use crate::scraper::PortScraper;
use cloudrun_core::{Config, Endpoint};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("multi-node clouds are not supported (nodes_per_cloud = {0})")]
    MultiNodeUnsupported(usize),
    #[error("cloud {name}: {source}")]
    Node {
        name: String,
        #[source]
        source: NodeError,
    },
}

pub type Result<T> = std::result::Result<T, CloudError>;

/// Lifecycle shared by every kind of cloud.
#[allow(async_fn_in_trait)]
pub trait Cloud {
    fn name(&self) -> &str;

    /// Launch the cloud's processes, if it has any.
    fn start(&mut self) -> Result<()>;

    /// Block until every node has announced its port, or `cancel` fires.
    async fn wait_until_ready(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Ask the cloud's processes to shut down. Safe to call repeatedly.
    fn stop(&mut self);

    /// Wait for stopped processes to exit, killing whatever is left at `deadline`.
    async fn wait_stopped(&mut self, deadline: Instant);

    /// Stop the cloud and refuse further startup work.
    fn terminate(&mut self);

    /// Address tests should connect to.
    fn address(&self) -> Result<Endpoint>;

    /// Count one more test dispatched to this cloud.
    fn record_job(&mut self);

    fn jobs_run(&self) -> usize;

    /// Worker processes this cloud runs; zero when it is not ours to manage.
    fn node_count(&self) -> usize;
}

/// A cloud whose workers this process launches.
#[derive(Debug)]
pub struct ManagedCloud {
    index: usize,
    name: String,
    nodes: Vec<Node>,
    scraper: PortScraper,
    jobs_run: usize,
    terminated: bool,
}

impl ManagedCloud {
    /// Prepare cloud `index` with a freshly generated name.
    pub fn new(index: usize, config: &Config, output_dir: &Path) -> Result<Self> {
        let name = naming::generate_cloud_name(&config.cloud_name_prefix);
        Self::with_name(index, name, config, output_dir)
    }

    pub fn with_name(index: usize, name: String, config: &Config, output_dir: &Path) -> Result<Self> {
        let nodes = (0..config.nodes_per_cloud)
            .map(|node_index| Node::new(index, node_index, &name, config, output_dir))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|source| CloudError::Node {
                name: name.clone(),
                source,
            })?;

        Ok(Self {
            index,
            name,
            nodes,
            scraper: PortScraper::from_config(config),
            jobs_run: 0,
            terminated: false,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

/// Build the configured number of managed clouds.
pub fn build_managed_clouds(config: &Config, output_dir: &Path) -> Result<Vec<ManagedCloud>> {
    (0..config.num_clouds)
        .map(|index| ManagedCloud::new(index, config, output_dir))
        .collect()
}

impl Cloud for ManagedCloud {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        if self.nodes.len() != 1 {
            return Err(CloudError::MultiNodeUnsupported(self.nodes.len()));
        }
        if self.terminated {
            warn!(cloud = %self.name, "not starting terminated cloud");
            return Ok(());
        }
        info!(cloud = %self.name, index = self.index, "starting cloud");
        debug!("{self}");
        for node in &mut self.nodes {
            node.start().map_err(|source| CloudError::Node {
                name: self.name.clone(),
                source,
            })?;
        }
        Ok(())
    }

    async fn wait_until_ready(&mut self, cancel: &CancellationToken) -> Result<()> {
        for node in &mut self.nodes {
            if self.terminated || cancel.is_cancelled() {
                return Ok(());
            }
            node.resolve_port(&self.scraper, cancel)
                .await
                .map_err(|source| CloudError::Node {
                    name: self.name.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    fn stop(&mut self) {
        for node in &mut self.nodes {
            node.stop();
        }
    }

    async fn wait_stopped(&mut self, deadline: Instant) {
        for node in &mut self.nodes {
            node.wait_stopped(deadline).await;
        }
    }

    fn terminate(&mut self) {
        self.terminated = true;
        for node in &mut self.nodes {
            node.terminate();
        }
    }

    fn address(&self) -> Result<Endpoint> {
        let Some(node) = self.nodes.first() else {
            return Err(CloudError::MultiNodeUnsupported(0));
        };
        node.address().map_err(|source| CloudError::Node {
            name: self.name.clone(),
            source,
        })
    }

    fn record_job(&mut self) {
        self.jobs_run += 1;
    }

    fn jobs_run(&self) -> usize {
        self.jobs_run
    }

    fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl fmt::Display for ManagedCloud {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cloud")?;
        writeln!(f, "  name:     {}", self.name)?;
        writeln!(f, "  index:    {}", self.index)?;
        writeln!(f, "  jobs_run: {}", self.jobs_run)?;
        for node in &self.nodes {
            write!(f, "{node}")?;
        }
        Ok(())
    }
}

/// An externally managed server at a fixed address.
#[derive(Debug, Clone)]
pub struct UserSuppliedCloud {
    name: String,
    endpoint: Endpoint,
    jobs_run: usize,
}

impl UserSuppliedCloud {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            name: format!("user-supplied@{endpoint}"),
            endpoint,
            jobs_run: 0,
        }
    }
}

impl Cloud for UserSuppliedCloud {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn wait_until_ready(&mut self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}

    async fn wait_stopped(&mut self, _deadline: Instant) {}

    fn terminate(&mut self) {}

    fn address(&self) -> Result<Endpoint> {
        Ok(self.endpoint.clone())
    }

    fn record_job(&mut self) {
        self.jobs_run += 1;
    }

    fn jobs_run(&self) -> usize {
        self.jobs_run
    }

    fn node_count(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config() -> Config {
        Config {
            worker_aux_config: None,
            worker_jar: PathBuf::from("/opt/worker.jar"),
            num_clouds: 3,
            ..Default::default()
        }
    }

    #[test]
    fn build_managed_clouds_lays_out_ports() {
        let dir = TempDir::new().unwrap();
        let clouds = build_managed_clouds(&config(), dir.path()).unwrap();
        assert_eq!(clouds.len(), 3);
        let ports: Vec<u16> = clouds.iter().map(|c| c.nodes()[0].base_port()).collect();
        assert_eq!(ports, vec![40000, 40002, 40004]);
        assert!(clouds.iter().all(|c| c.name().starts_with("H2O_runit_")));
    }

    #[test]
    fn multi_node_cloud_fails_fast() {
        let dir = TempDir::new().unwrap();
        let cfg = Config {
            nodes_per_cloud: 2,
            ..config()
        };
        let mut cloud = ManagedCloud::with_name(0, "c".to_string(), &cfg, dir.path()).unwrap();
        assert!(matches!(
            cloud.start(),
            Err(CloudError::MultiNodeUnsupported(2))
        ));
    }

    #[test]
    fn managed_cloud_has_no_address_before_ready() {
        let dir = TempDir::new().unwrap();
        let cloud = ManagedCloud::with_name(0, "c".to_string(), &config(), dir.path()).unwrap();
        assert!(matches!(cloud.address(), Err(CloudError::Node { .. })));
        assert!(cloud.to_string().contains("name:     c"));
    }

    #[tokio::test]
    async fn terminated_cloud_skips_startup() {
        let dir = TempDir::new().unwrap();
        let mut cloud = ManagedCloud::with_name(0, "c".to_string(), &config(), dir.path()).unwrap();
        cloud.terminate();
        cloud.start().unwrap();
        cloud
            .wait_until_ready(&CancellationToken::new())
            .await
            .unwrap();
        assert!(cloud.nodes()[0].pid().is_none());
    }

    #[tokio::test]
    async fn user_supplied_cloud_is_always_ready() {
        let mut cloud = UserSuppliedCloud::new(Endpoint::new("10.0.0.1", 54321));
        cloud.start().unwrap();
        cloud
            .wait_until_ready(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(cloud.address().unwrap().to_string(), "10.0.0.1:54321");
        cloud.record_job();
        cloud.record_job();
        assert_eq!(cloud.jobs_run(), 2);
        assert_eq!(cloud.node_count(), 0);
        cloud.terminate();
        assert_eq!(cloud.address().unwrap().port, 54321);
    }
}
