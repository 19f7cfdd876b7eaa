//! signalgraph: a vertex-centric signal/collect compute engine
//!
//! A computation is modeled as a directed graph whose vertices carry state
//! and whose edges produce signals; the engine propagates signals until the
//! graph reaches a user-defined notion of convergence.
//!
//! - **Vertex** trait: scoring-gated signal/collect callbacks
//! - **Workers**: single-threaded event loops, each owning one vertex shard
//! - **MessageBus**: deterministic routing by vertex id with atomic counters
//! - **Coordinator**: convergence detection through message conservation
//! - **Execution modes**: synchronous supersteps or asynchronous processing
//!
//! # Example
//!
//! ```rust,ignore
//! use signalgraph::{Graph, GraphBuilder, GraphEditor, ExecutionConfig};
//!
//! let mut graph: Graph<u32, f64> = GraphBuilder::new().with_workers(4).build().await?;
//! graph.add_vertex(Box::new(RankVertex::new(1)));
//! graph.add_vertex(Box::new(RankVertex::new(2)));
//! graph.add_edge(1, Edge::unit(2));
//!
//! let info = graph.execute(ExecutionConfig::default()).await?;
//! println!("{:?} after {:?}", info.termination_reason, info.duration);
//! graph.shutdown().await?;
//! ```

pub mod aggregation;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod deployment;
pub mod editor;
pub mod error;
pub mod graph;
pub mod mapper;
pub mod messages;
pub mod node;
pub mod store;
pub mod vertex;
pub mod worker;

// Re-exports for convenience
pub use aggregation::{AggregationOperation, GlobalTerminationCondition};
pub use config::{ExecutionConfig, ExecutionMode, GraphConfig, TerminationReason};
pub use coordinator::{CoordinatorSnapshot, ExecutionInformation, ExecutionStatistics};
pub use deployment::{DeploymentConfig, LocalNodeProvisioner, NodeProvisioner};
pub use editor::GraphEditor;
pub use error::GraphError;
pub use graph::{Graph, GraphBuilder};
pub use mapper::{DefaultVertexMapper, VertexToWorkerMapper};
pub use messages::{Heartbeat, NodeStatus, SentMessagesStats, SignalMessage, WorkerStatus};
pub use vertex::{BoxedVertex, Edge, EdgeId, EdgeList, SignalValue, Vertex, VertexId};
pub use worker::{
    UndeliverableSignalHandler, WorkerOperationCounters, WorkerSnapshot, WorkerState,
};
