//! The graph facade
//!
//! [`GraphBuilder`] validates the configuration, wires the bus registry,
//! runs the node-registration protocol, and spawns the worker, node, and
//! coordinator event loops. The resulting [`Graph`] is the user's handle:
//! it implements [`GraphEditor`] for loading and mutating the graph, and
//! exposes `execute`, `await_idle`, `aggregate`, and `shutdown`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregation::{AggregationOperation, ErasedAggregation};
use crate::bus::{BusRegistry, MessageBus, MessageCounters};
use crate::config::{ExecutionConfig, GraphConfig};
use crate::coordinator::{
    Coordinator, CoordinatorMessage, CoordinatorSnapshot, ExecutionInformation,
};
use crate::deployment::{LocalNodeProvisioner, NodeProvisioner};
use crate::editor::GraphEditor;
use crate::error::GraphError;
use crate::mapper::{DefaultVertexMapper, VertexToWorkerMapper};
use crate::messages::Request;
use crate::node::{NodeActor, NodeCore, NodeMessage};
use crate::vertex::{BoxedVertex, Edge, EdgeId, SignalValue, Vertex, VertexId};
use crate::worker::{
    BusEditor, UndeliverableSignalHandler, WorkerActor, WorkerCore, WorkerMessage, WorkerSnapshot,
};

/// Builder for a running graph.
pub struct GraphBuilder<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    config: GraphConfig,
    mapper: Option<Arc<dyn VertexToWorkerMapper<Id>>>,
    undeliverable: Option<UndeliverableSignalHandler<Id, Signal>>,
    provisioner: Option<Arc<dyn NodeProvisioner>>,
}

impl<Id, Signal> Default for GraphBuilder<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Id, Signal> GraphBuilder<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    pub fn new() -> Self {
        Self {
            config: GraphConfig::default(),
            mapper: None,
            undeliverable: None,
            provisioner: None,
        }
    }

    pub fn with_config(mut self, config: GraphConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config = self.config.with_workers(workers);
        self
    }

    /// Override vertex placement
    pub fn with_mapper(mut self, mapper: Arc<dyn VertexToWorkerMapper<Id>>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Receive every signal whose target vertex is absent at delivery time
    pub fn with_undeliverable_signal_handler(
        mut self,
        handler: UndeliverableSignalHandler<Id, Signal>,
    ) -> Self {
        self.undeliverable = Some(handler);
        self
    }

    /// Override the node-registration protocol
    pub fn with_node_provisioner(mut self, provisioner: Arc<dyn NodeProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Validate, wire, and spawn everything.
    ///
    /// Worker creation follows the provisioning protocol: node actors come
    /// up first and report ready; once all nodes are in, workers spawn per
    /// node in deterministic id order.
    pub async fn build(self) -> Result<Graph<Id, Signal>, GraphError> {
        self.config.validate()?;
        let config = self.config;
        let workers = config.number_of_workers;
        let workers_per_node = config.workers_per_node;
        let nodes = config.number_of_nodes();

        let mapper: Arc<dyn VertexToWorkerMapper<Id>> = match self.mapper {
            Some(mapper) => mapper,
            None => Arc::new(DefaultVertexMapper::new(workers, workers_per_node)),
        };

        // Create every mailbox before any actor runs, so nothing is ever
        // routed into the void
        let registry = Arc::new(BusRegistry::new(workers, nodes));
        let mut worker_mailboxes = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            registry.register_worker(index, tx);
            worker_mailboxes.push(Some(rx));
        }
        let mut node_mailboxes = Vec::with_capacity(nodes);
        for index in 0..nodes {
            let (tx, rx) = mpsc::unbounded_channel();
            registry.register_node(index, tx);
            node_mailboxes.push(Some(rx));
        }
        let (coordinator_tx, coordinator_rx) = mpsc::unbounded_channel();
        registry.register_coordinator(coordinator_tx.clone());

        if !registry.is_initialized() {
            return Err(GraphError::config("bus registry wiring incomplete"));
        }

        let mut handles = Vec::new();

        // Node actors first; each reports ready to the provisioner
        let provisioner: Arc<dyn NodeProvisioner> = match self.provisioner {
            Some(provisioner) => provisioner,
            None => Arc::new(LocalNodeProvisioner::new(nodes)),
        };
        for node in 0..nodes {
            let bus = MessageBus::new(
                Arc::clone(&registry),
                Arc::clone(&mapper),
                Arc::new(MessageCounters::new()),
                1,
            );
            let core = NodeCore::new(node, node * workers_per_node, workers_per_node, bus);
            let mailbox = node_mailboxes[node]
                .take()
                .ok_or_else(|| GraphError::config("node mailbox missing"))?;
            let actor = NodeActor::new(core, mailbox);
            let report_to = Arc::clone(&provisioner);
            handles.push(tokio::spawn(async move {
                report_to.node_ready(node);
                actor.run().await;
            }));
        }
        let ready_nodes = provisioner.await_ready().await?;
        debug!(nodes = ready_nodes.len(), "all nodes ready");

        // Workers per node, in id order
        for node in ready_nodes {
            for slot in 0..workers_per_node {
                let worker = node * workers_per_node + slot;
                let bus = MessageBus::new(
                    Arc::clone(&registry),
                    Arc::clone(&mapper),
                    Arc::new(MessageCounters::new()),
                    config.bulk_flush_threshold,
                );
                let core = WorkerCore::new(
                    worker,
                    node,
                    bus,
                    config.clone(),
                    self.undeliverable.clone(),
                );
                let mailbox = worker_mailboxes
                    .get_mut(worker)
                    .and_then(Option::take)
                    .ok_or_else(|| GraphError::config("worker mailbox missing"))?;
                handles.push(tokio::spawn(WorkerActor::new(core, mailbox).run()));
            }
        }

        // Facade sends share their counters with the coordinator so external
        // injections are part of the conservation totals immediately
        let system_counters = Arc::new(MessageCounters::new());
        let coordinator_bus = MessageBus::new(
            Arc::clone(&registry),
            Arc::clone(&mapper),
            Arc::new(MessageCounters::new()),
            1,
        );
        handles.push(tokio::spawn(
            Coordinator::new(
                coordinator_bus,
                Arc::clone(&system_counters),
                config.clone(),
                coordinator_rx,
            )
            .run(),
        ));

        let facade_bus = MessageBus::new(registry, mapper, system_counters, 1);
        info!(workers, nodes, "graph started");

        Ok(Graph {
            bus: facade_bus,
            coordinator_tx,
            config,
            handles,
        })
    }
}

/// A running graph computation.
pub struct Graph<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    bus: MessageBus<Id, Signal>,
    coordinator_tx: mpsc::UnboundedSender<CoordinatorMessage<Id, Signal>>,
    config: GraphConfig,
    handles: Vec<JoinHandle<()>>,
}

impl<Id, Signal> Graph<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.bus.is_initialized()
    }

    fn send_to_coordinator(
        &self,
        message: CoordinatorMessage<Id, Signal>,
        context: &str,
    ) -> Result<(), GraphError> {
        self.coordinator_tx
            .send(message)
            .map_err(|_| GraphError::delivery(format!("coordinator gone during {context}")))
    }

    /// Drive the computation to its termination under the given execution
    /// configuration
    pub async fn execute(
        &mut self,
        config: ExecutionConfig<Id, Signal>,
    ) -> Result<ExecutionInformation, GraphError> {
        let (reply, receiver) = oneshot::channel();
        self.send_to_coordinator(CoordinatorMessage::Execute { config, reply }, "execute")?;
        receiver
            .await
            .map_err(|_| GraphError::request_dropped("coordinator", "execute"))?
    }

    /// Complete once every worker is idle and no messages are in flight
    pub async fn await_idle(&self) -> Result<(), GraphError> {
        let (reply, receiver) = oneshot::channel();
        self.send_to_coordinator(CoordinatorMessage::AwaitIdle { reply }, "await_idle")?;
        receiver
            .await
            .map_err(|_| GraphError::request_dropped("coordinator", "await_idle"))
    }

    /// Bounded variant of [`await_idle`](Self::await_idle); true when the
    /// system went idle within the given duration
    pub async fn await_idle_within(&self, limit: Duration) -> bool {
        matches!(
            tokio::time::timeout(limit, self.await_idle()).await,
            Ok(Ok(()))
        )
    }

    /// The coordinator's current view of the system
    pub async fn snapshot(&self) -> Result<CoordinatorSnapshot, GraphError> {
        let (reply, receiver) = oneshot::channel();
        self.send_to_coordinator(CoordinatorMessage::Snapshot { reply }, "snapshot")?;
        receiver
            .await
            .map_err(|_| GraphError::request_dropped("coordinator", "snapshot"))
    }

    /// Fold an aggregation over every vertex; shard results are combined by
    /// the coordinator
    pub async fn aggregate<A>(&self, operation: Arc<A>) -> Result<A::Output, GraphError>
    where
        A: AggregationOperation<Id, Signal>,
    {
        let erased: Arc<dyn ErasedAggregation<Id, Signal>> = operation;
        let (reply, receiver) = oneshot::channel();
        self.send_to_coordinator(
            CoordinatorMessage::Aggregate {
                operation: erased,
                reply,
            },
            "aggregate",
        )?;
        let value = receiver
            .await
            .map_err(|_| GraphError::request_dropped("coordinator", "aggregate"))?;
        value
            .downcast::<A::Output>()
            .map(|boxed| *boxed)
            .map_err(|_| GraphError::aggregation("aggregation result carried an unexpected type"))
    }

    /// Visit every vertex of the graph; completes when all shards replied
    pub async fn for_each_vertex(
        &self,
        f: Arc<dyn Fn(&dyn Vertex<Id, Signal>) + Send + Sync>,
    ) -> Result<(), GraphError> {
        let mut receivers = Vec::with_capacity(self.config.number_of_workers);
        for worker in 0..self.config.number_of_workers {
            let visit = Arc::clone(&f);
            let (request, receiver) =
                Request::with_reply(move |core: &mut WorkerCore<Id, Signal>| {
                    core.for_each_vertex(visit.as_ref());
                    None
                });
            self.bus
                .send_to_worker(worker, WorkerMessage::Request(request));
            receivers.push((worker, receiver));
        }
        for (worker, receiver) in receivers {
            receiver.await.map_err(|_| {
                GraphError::request_dropped(format!("worker {worker}"), "for_each_vertex")
            })?;
        }
        Ok(())
    }

    /// Apply a mutator on one worker's editing surface; routed by the
    /// optional vertex hint, worker 0 otherwise
    pub fn modify_graph(
        &self,
        mutator: Box<dyn FnOnce(&mut dyn GraphEditor<Id, Signal>) + Send>,
        vertex_hint: Option<Id>,
    ) {
        let worker = vertex_hint
            .map(|id| self.bus.mapper().worker_for(&id))
            .unwrap_or(0);
        self.bus.send_to_worker(
            worker,
            WorkerMessage::Request(Request::counted(
                move |core: &mut WorkerCore<Id, Signal>| {
                    core.modify(mutator);
                    None
                },
            )),
        );
    }

    /// One manual signal step across all workers (interactive stepping)
    pub async fn signal_step(&self) -> Result<(), GraphError> {
        self.broadcast_with_reply(|| {
            |core: &mut WorkerCore<Id, Signal>| {
                core.signal_step();
                None
            }
        })
        .await?;
        Ok(())
    }

    /// One manual collect step across all workers; true when every worker's
    /// `to_signal` stayed empty
    pub async fn collect_step(&self) -> Result<bool, GraphError> {
        let replies = self
            .broadcast_with_reply(|| {
                |core: &mut WorkerCore<Id, Signal>| {
                    Some(Box::new(core.collect_step()) as crate::messages::RequestResult)
                }
            })
            .await?;
        Ok(replies
            .into_iter()
            .all(|payload| payload.downcast::<bool>().map(|b| *b).unwrap_or(false)))
    }

    /// Point-in-time view of every worker
    pub async fn worker_snapshots(&self) -> Result<Vec<WorkerSnapshot>, GraphError> {
        let replies = self
            .broadcast_with_reply(|| {
                |core: &mut WorkerCore<Id, Signal>| {
                    Some(Box::new(core.snapshot()) as crate::messages::RequestResult)
                }
            })
            .await?;
        Ok(replies
            .into_iter()
            .filter_map(|payload| payload.downcast::<WorkerSnapshot>().ok().map(|b| *b))
            .collect())
    }

    async fn broadcast_with_reply<F, C>(
        &self,
        mut make: F,
    ) -> Result<Vec<crate::messages::RequestResult>, GraphError>
    where
        F: FnMut() -> C,
        C: FnOnce(&mut WorkerCore<Id, Signal>) -> Option<crate::messages::RequestResult>
            + Send
            + 'static,
    {
        let mut receivers = Vec::with_capacity(self.config.number_of_workers);
        for worker in 0..self.config.number_of_workers {
            let (request, receiver) = Request::with_reply(make());
            self.bus
                .send_to_worker(worker, WorkerMessage::Request(request));
            receivers.push((worker, receiver));
        }
        let mut replies = Vec::with_capacity(receivers.len());
        for (worker, receiver) in receivers {
            let payload = receiver.await.map_err(|_| {
                GraphError::request_dropped(format!("worker {worker}"), "broadcast")
            })?;
            replies.push(payload);
        }
        Ok(replies)
    }

    /// Stop every actor and wait for the event loops to finish.
    ///
    /// Workers release their vertex stores on the way out.
    pub async fn shutdown(self) -> Result<(), GraphError> {
        info!("graph shutting down");
        for worker in 0..self.config.number_of_workers {
            self.bus.send_to_worker(worker, WorkerMessage::PoisonPill);
        }
        for node in 0..self.config.number_of_nodes() {
            self.bus.send_to_node(node, NodeMessage::PoisonPill);
        }
        let _ = self.coordinator_tx.send(CoordinatorMessage::PoisonPill);

        for handle in self.handles {
            if handle.await.is_err() {
                warn!("actor task panicked during shutdown");
            }
        }
        Ok(())
    }
}

impl<Id, Signal> GraphEditor<Id, Signal> for Graph<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    fn send_signal(&mut self, signal: Signal, target: Id, source: Option<Id>) {
        BusEditor { bus: &mut self.bus }.send_signal(signal, target, source);
    }

    fn add_vertex(&mut self, vertex: BoxedVertex<Id, Signal>) {
        BusEditor { bus: &mut self.bus }.add_vertex(vertex);
    }

    fn add_edge(&mut self, source: Id, edge: Edge<Id>) {
        BusEditor { bus: &mut self.bus }.add_edge(source, edge);
    }

    fn remove_vertex(&mut self, id: Id) {
        BusEditor { bus: &mut self.bus }.remove_vertex(id);
    }

    fn remove_edge(&mut self, edge_id: EdgeId<Id>) {
        BusEditor { bus: &mut self.bus }.remove_edge(edge_id);
    }
}
