//! Deployment descriptor and node registration
//!
//! The descriptor is what a cluster launcher consumes: which algorithm to
//! run, how many nodes, how much memory. The engine itself only interprets
//! the node count; the rest is passed through to the launcher.
//!
//! Node registration: every node actor reports `node_ready` as it comes up;
//! the provisioner releases worker creation once all expected nodes are in,
//! in deterministic id order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::GraphError;

fn default_memory_per_node() -> u32 {
    512
}

fn default_number_of_nodes() -> u32 {
    1
}

fn default_cluster_type() -> String {
    "yarn".to_string()
}

/// What to deploy and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Name of the algorithm entry point
    pub algorithm: String,

    /// Free-form parameters handed to the algorithm
    #[serde(default)]
    pub algorithm_parameters: HashMap<String, String>,

    /// Memory per node in megabytes
    #[serde(default = "default_memory_per_node")]
    pub memory_per_node: u32,

    #[serde(default = "default_number_of_nodes")]
    pub number_of_nodes: u32,

    /// Extra files shipped to every node
    #[serde(default)]
    pub copy_files: Vec<PathBuf>,

    #[serde(default = "default_cluster_type")]
    pub cluster_type: String,
}

impl DeploymentConfig {
    pub fn new(algorithm: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            algorithm_parameters: HashMap::new(),
            memory_per_node: default_memory_per_node(),
            number_of_nodes: default_number_of_nodes(),
            copy_files: Vec::new(),
            cluster_type: default_cluster_type(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        serde_json::from_str(json)
            .map_err(|e| GraphError::config(format!("invalid deployment descriptor: {e}")))
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.algorithm_parameters.get(key).map(String::as_str)
    }
}

/// The node registration protocol seam.
#[async_trait]
pub trait NodeProvisioner: Send + Sync {
    /// Called by each node actor as it comes up
    fn node_ready(&self, node_id: usize);

    /// Resolves once every expected node reported ready; node ids are
    /// returned in ascending order so worker creation is deterministic
    async fn await_ready(&self) -> Result<Vec<usize>, GraphError>;
}

/// In-process provisioner used for single-machine deployments.
pub struct LocalNodeProvisioner {
    expected: usize,
    ready: Mutex<Vec<usize>>,
    notify: Notify,
}

impl LocalNodeProvisioner {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            ready: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    fn ready_ids(&self) -> Option<Vec<usize>> {
        let guard = self.ready.lock().ok()?;
        let mut ids = guard.clone();
        ids.sort_unstable();
        ids.dedup();
        (ids.len() >= self.expected).then_some(ids)
    }
}

#[async_trait]
impl NodeProvisioner for LocalNodeProvisioner {
    fn node_ready(&self, node_id: usize) {
        debug!(node = node_id, "node ready");
        if let Ok(mut ready) = self.ready.lock() {
            ready.push(node_id);
        }
        self.notify.notify_waiters();
    }

    async fn await_ready(&self) -> Result<Vec<usize>, GraphError> {
        loop {
            let notified = self.notify.notified();
            if let Some(ids) = self.ready_ids() {
                return Ok(ids);
            }
            notified.await;
        }
    }
}
