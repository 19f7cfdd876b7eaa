//! Graph and execution configuration
//!
//! [`GraphConfig`] shapes the deployment: worker count, node layout, timing,
//! and throttling thresholds. It is fixed when the graph is built.
//! [`ExecutionConfig`] shapes a single `execute` call: mode, thresholds, and
//! limits. Both follow the builder pattern with validated defaults.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregation::GlobalTerminationCondition;
use crate::error::GraphError;
use crate::vertex::{SignalValue, VertexId};

/// Deployment-shape configuration, fixed at graph build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Total workers across all nodes
    pub number_of_workers: usize,

    /// Workers hosted per node; must divide `number_of_workers`
    pub workers_per_node: usize,

    /// Coordinator heartbeat period
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Worker mailbox reception-idle timeout before checking convergence
    #[serde(with = "humantime_serde")]
    pub receive_timeout: Duration,

    /// How often workers refresh their status without a state change
    #[serde(with = "humantime_serde")]
    pub status_update_interval: Duration,

    /// Average in-flight messages each worker may contribute before
    /// outgoing signals are suppressed
    pub throttle_inbox_threshold_per_worker: u64,

    /// Maximum acceptable coordinator-heartbeat age before outgoing
    /// signals are suppressed
    #[serde(with = "humantime_serde")]
    pub throttle_heartbeat_age_threshold: Duration,

    /// Outgoing signals buffered per destination before a flush; 1 sends
    /// every signal immediately
    pub bulk_flush_threshold: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        let workers = num_cpus::get().max(1);
        Self {
            number_of_workers: workers,
            workers_per_node: workers,
            heartbeat_interval: Duration::from_millis(200),
            receive_timeout: Duration::from_millis(5),
            status_update_interval: Duration::from_millis(200),
            throttle_inbox_threshold_per_worker: 100_000,
            throttle_heartbeat_age_threshold: Duration::from_secs(1),
            bulk_flush_threshold: 1,
        }
    }
}

impl GraphConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total worker count; also hosts them all on one node unless
    /// `with_workers_per_node` is called afterwards
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.number_of_workers = workers;
        self.workers_per_node = workers;
        self
    }

    pub fn with_workers_per_node(mut self, workers_per_node: usize) -> Self {
        self.workers_per_node = workers_per_node;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.status_update_interval = interval;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn with_throttle_inbox_threshold(mut self, threshold: u64) -> Self {
        self.throttle_inbox_threshold_per_worker = threshold;
        self
    }

    pub fn with_throttle_heartbeat_age(mut self, age: Duration) -> Self {
        self.throttle_heartbeat_age_threshold = age;
        self
    }

    pub fn with_bulk_flush_threshold(mut self, threshold: usize) -> Self {
        self.bulk_flush_threshold = threshold;
        self
    }

    /// Number of nodes implied by the worker layout
    pub fn number_of_nodes(&self) -> usize {
        self.number_of_workers / self.workers_per_node.max(1)
    }

    /// Reject invalid layouts at build time
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.number_of_workers == 0 {
            return Err(GraphError::config("number_of_workers must be > 0"));
        }
        if self.workers_per_node == 0 {
            return Err(GraphError::config("workers_per_node must be > 0"));
        }
        if self.number_of_workers % self.workers_per_node != 0 {
            return Err(GraphError::config(format!(
                "workers_per_node {} must divide number_of_workers {}",
                self.workers_per_node, self.number_of_workers
            )));
        }
        if self.bulk_flush_threshold == 0 {
            return Err(GraphError::config("bulk_flush_threshold must be > 0"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(GraphError::config("heartbeat_interval must be > 0"));
        }
        Ok(())
    }
}

/// How an `execute` call drives the computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Barrier-separated signal/collect supersteps driven by the coordinator
    Synchronous,

    /// One initial synchronous signal step, then continuous asynchronous
    /// processing until global idle
    #[default]
    OptimizedAsynchronous,

    /// Continuous asynchronous processing until global idle
    PureAsynchronous,

    /// Start the workers and return immediately; the graph keeps computing
    ContinuousAsynchronous,

    /// Leave the workers paused; steps are driven manually
    Interactive,
}

impl ExecutionMode {
    /// Modes whose `execute` call only returns at global idle
    pub fn awaits_global_idle(&self) -> bool {
        matches!(
            self,
            ExecutionMode::OptimizedAsynchronous | ExecutionMode::PureAsynchronous
        )
    }
}

/// Why an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// No scores above threshold, no messages in flight
    Converged,
    /// The configured wall-clock limit expired
    TimeLimitReached,
    /// The global termination condition was met
    GlobalConstraintMet,
    /// Execution stopped at a step limit or was left paused
    Paused,
    /// A continuous execution was started and is still running
    Ongoing,
    /// A worker or transport failure aborted the job
    Error,
}

/// Per-run execution parameters.
pub struct ExecutionConfig<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    pub mode: ExecutionMode,
    /// Signal scores must exceed this for a signal operation to run
    pub signal_threshold: f64,
    /// Collect scores must exceed this for a collect operation to run
    pub collect_threshold: f64,
    /// Wall-clock limit for the whole execution
    pub time_limit: Option<Duration>,
    /// Superstep limit; only meaningful in synchronous mode
    pub steps_limit: Option<usize>,
    /// Optional aggregation-based stop criterion
    pub global_termination: Option<Arc<GlobalTerminationCondition<Id, Signal>>>,
}

impl<Id, Signal> Default for ExecutionConfig<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            signal_threshold: 0.001,
            collect_threshold: 0.0,
            time_limit: None,
            steps_limit: None,
            global_termination: None,
        }
    }
}

impl<Id, Signal> Clone for ExecutionConfig<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    fn clone(&self) -> Self {
        Self {
            mode: self.mode,
            signal_threshold: self.signal_threshold,
            collect_threshold: self.collect_threshold,
            time_limit: self.time_limit,
            steps_limit: self.steps_limit,
            global_termination: self.global_termination.clone(),
        }
    }
}

impl<Id, Signal> std::fmt::Debug for ExecutionConfig<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionConfig")
            .field("mode", &self.mode)
            .field("signal_threshold", &self.signal_threshold)
            .field("collect_threshold", &self.collect_threshold)
            .field("time_limit", &self.time_limit)
            .field("steps_limit", &self.steps_limit)
            .field("has_global_termination", &self.global_termination.is_some())
            .finish()
    }
}

impl<Id, Signal> ExecutionConfig<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn synchronous() -> Self {
        Self::new(ExecutionMode::Synchronous)
    }

    pub fn with_signal_threshold(mut self, threshold: f64) -> Self {
        self.signal_threshold = threshold;
        self
    }

    pub fn with_collect_threshold(mut self, threshold: f64) -> Self {
        self.collect_threshold = threshold;
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn with_steps_limit(mut self, limit: usize) -> Self {
        self.steps_limit = Some(limit);
        self
    }

    pub fn with_global_termination(
        mut self,
        condition: GlobalTerminationCondition<Id, Signal>,
    ) -> Self {
        self.global_termination = Some(Arc::new(condition));
        self
    }
}
