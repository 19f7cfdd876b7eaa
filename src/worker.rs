//! The partitioned worker runtime
//!
//! A worker is a single-threaded event loop owning one vertex shard. It
//! drains its mailbox, buffers incoming signals into `to_collect`, evaluates
//! requests, and between messages executes one scheduled signal or collect
//! unit at a time, alternating between the two queues so freshly signaled
//! vertices can receive new deliveries promptly. That cooperative
//! interleaving is what provides asynchronous fairness without preemption.
//!
//! Vertex callbacks run to completion; a panic inside one is caught, logged
//! at error level, and contained to that vertex so it cannot poison
//! convergence.

use std::ops::ControlFlow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::aggregation::ErasedAggregation;
use crate::bus::MessageBus;
use crate::config::GraphConfig;
use crate::editor::GraphEditor;
use crate::messages::{Heartbeat, Request, RequestResult, SignalMessage, WorkerStatus};
use crate::node::NodeMessage;
use crate::store::VertexStore;
use crate::vertex::{BoxedVertex, Edge, EdgeId, SignalValue, Vertex, VertexId};

/// Callback invoked for every buffered signal whose target vertex is absent
/// at delivery time. The default is a silent drop.
pub type UndeliverableSignalHandler<Id, Signal> =
    Arc<dyn Fn(&SignalMessage<Id, Signal>) + Send + Sync>;

/// Everything a worker's mailbox can carry.
#[derive(Debug)]
pub enum WorkerMessage<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    /// A single signal for a vertex on this worker
    Signal(SignalMessage<Id, Signal>),
    /// A batch of signals from a bulk-flushing sender
    BulkSignal(Vec<SignalMessage<Id, Signal>>),
    /// A command to evaluate against this worker
    Request(Request<WorkerCore<Id, Signal>>),
    /// Periodic coordinator broadcast carrying the global inbox size
    Heartbeat(Heartbeat),
    /// Shut down after releasing the vertex store
    PoisonPill,
}

impl<Id, Signal> WorkerMessage<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    /// Whether a send of this message participates in the conservation
    /// invariant. Bulk batches are counted signal-by-signal at buffer time.
    pub fn is_counted(&self) -> bool {
        match self {
            WorkerMessage::Signal(_) => true,
            WorkerMessage::BulkSignal(_) => false,
            WorkerMessage::Request(request) => request.counted,
            WorkerMessage::Heartbeat(_) | WorkerMessage::PoisonPill => false,
        }
    }
}

/// The worker state machine, derived from the paused/idle flags and the
/// work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Paused,
    Running,
    Converged,
    Idle,
}

/// Per-worker operation counters, reported in snapshots and summed into
/// execution statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOperationCounters {
    pub signal_operations_executed: u64,
    pub collect_operations_executed: u64,
    pub vertices_added: u64,
    pub vertices_removed: u64,
    pub outgoing_edges_added: u64,
    pub outgoing_edges_removed: u64,
    pub incoming_edges_added: u64,
    pub incoming_edges_removed: u64,
    pub signal_steps: u64,
    pub collect_steps: u64,
}

impl WorkerOperationCounters {
    pub fn combine(self, other: Self) -> Self {
        Self {
            signal_operations_executed: self.signal_operations_executed
                + other.signal_operations_executed,
            collect_operations_executed: self.collect_operations_executed
                + other.collect_operations_executed,
            vertices_added: self.vertices_added + other.vertices_added,
            vertices_removed: self.vertices_removed + other.vertices_removed,
            outgoing_edges_added: self.outgoing_edges_added + other.outgoing_edges_added,
            outgoing_edges_removed: self.outgoing_edges_removed + other.outgoing_edges_removed,
            incoming_edges_added: self.incoming_edges_added + other.incoming_edges_added,
            incoming_edges_removed: self.incoming_edges_removed + other.incoming_edges_removed,
            signal_steps: self.signal_steps + other.signal_steps,
            collect_steps: self.collect_steps + other.collect_steps,
        }
    }

    /// Field-wise difference against an earlier snapshot
    pub fn since(self, baseline: Self) -> Self {
        Self {
            signal_operations_executed: self
                .signal_operations_executed
                .saturating_sub(baseline.signal_operations_executed),
            collect_operations_executed: self
                .collect_operations_executed
                .saturating_sub(baseline.collect_operations_executed),
            vertices_added: self.vertices_added.saturating_sub(baseline.vertices_added),
            vertices_removed: self
                .vertices_removed
                .saturating_sub(baseline.vertices_removed),
            outgoing_edges_added: self
                .outgoing_edges_added
                .saturating_sub(baseline.outgoing_edges_added),
            outgoing_edges_removed: self
                .outgoing_edges_removed
                .saturating_sub(baseline.outgoing_edges_removed),
            incoming_edges_added: self
                .incoming_edges_added
                .saturating_sub(baseline.incoming_edges_added),
            incoming_edges_removed: self
                .incoming_edges_removed
                .saturating_sub(baseline.incoming_edges_removed),
            signal_steps: self.signal_steps.saturating_sub(baseline.signal_steps),
            collect_steps: self.collect_steps.saturating_sub(baseline.collect_steps),
        }
    }
}

/// Point-in-time view of one worker, fetched through a request.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub worker_id: usize,
    pub state: WorkerState,
    pub counters: WorkerOperationCounters,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub vertex_count: usize,
    pub to_signal_len: usize,
    pub to_collect_len: usize,
    pub is_throttled: bool,
}

/// Graph editor that routes every operation through the message bus to the
/// owning worker. Used both inside vertex callbacks and by the facade.
pub(crate) struct BusEditor<'a, Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    pub bus: &'a mut MessageBus<Id, Signal>,
}

impl<Id, Signal> GraphEditor<Id, Signal> for BusEditor<'_, Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    fn send_signal(&mut self, signal: Signal, target: Id, source: Option<Id>) {
        self.bus.send_signal(signal, target, source);
    }

    fn add_vertex(&mut self, vertex: BoxedVertex<Id, Signal>) {
        let id = vertex.id().clone();
        self.bus.send_to_worker_for_vertex_id(
            Request::counted(move |worker: &mut WorkerCore<Id, Signal>| {
                worker.add_vertex(vertex);
                None
            }),
            &id,
        );
    }

    fn add_edge(&mut self, source: Id, edge: Edge<Id>) {
        let route = source.clone();
        self.bus.send_to_worker_for_vertex_id(
            Request::counted(move |worker: &mut WorkerCore<Id, Signal>| {
                worker.add_outgoing_edge(&source, edge);
                None
            }),
            &route,
        );
    }

    fn remove_vertex(&mut self, id: Id) {
        let route = id.clone();
        self.bus.send_to_worker_for_vertex_id(
            Request::counted(move |worker: &mut WorkerCore<Id, Signal>| {
                worker.remove_vertex(&id);
                None
            }),
            &route,
        );
    }

    fn remove_edge(&mut self, edge_id: EdgeId<Id>) {
        let route = edge_id.source.clone();
        self.bus.send_to_worker_for_vertex_id(
            Request::counted(move |worker: &mut WorkerCore<Id, Signal>| {
                worker.remove_outgoing_edge(&edge_id);
                None
            }),
            &route,
        );
    }
}

/// The state a worker's requests are evaluated against: the vertex shard,
/// this worker's bus handle, counters, and the pause/throttle flags.
pub struct WorkerCore<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    worker_id: usize,
    node_id: usize,
    store: VertexStore<Id, Signal>,
    bus: MessageBus<Id, Signal>,
    config: GraphConfig,
    counters: WorkerOperationCounters,
    signal_threshold: f64,
    collect_threshold: f64,
    paused: bool,
    pending_pause: Option<bool>,
    idle: bool,
    throttled: bool,
    signal_first: bool,
    undeliverable: Option<UndeliverableSignalHandler<Id, Signal>>,
}

impl<Id, Signal> WorkerCore<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    pub fn new(
        worker_id: usize,
        node_id: usize,
        bus: MessageBus<Id, Signal>,
        config: GraphConfig,
        undeliverable: Option<UndeliverableSignalHandler<Id, Signal>>,
    ) -> Self {
        Self {
            worker_id,
            node_id,
            store: VertexStore::new(),
            bus,
            config,
            counters: WorkerOperationCounters::default(),
            signal_threshold: 0.001,
            collect_threshold: 0.0,
            paused: true,
            pending_pause: None,
            idle: false,
            throttled: false,
            signal_first: true,
            undeliverable,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    /// Both work queues drained
    pub fn is_fully_converged(&self) -> bool {
        self.store.to_signal.is_empty() && self.store.to_collect.is_empty()
    }

    pub fn state(&self) -> WorkerState {
        if self.idle {
            WorkerState::Idle
        } else if self.paused {
            WorkerState::Paused
        } else if self.is_fully_converged() {
            WorkerState::Converged
        } else {
            WorkerState::Running
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.worker_id,
            state: self.state(),
            counters: self.counters,
            messages_sent: self.bus.counters().counted_sent(),
            messages_received: self.bus.counters().counted_received(),
            vertex_count: self.store.len(),
            to_signal_len: self.store.to_signal.len(),
            to_collect_len: self.store.to_collect.len(),
            is_throttled: self.throttled,
        }
    }

    /// Adjust the score gates; takes effect for all subsequent operations
    pub fn set_thresholds(&mut self, signal_threshold: f64, collect_threshold: f64) {
        self.signal_threshold = signal_threshold;
        self.collect_threshold = collect_threshold;
    }

    pub fn request_pause(&mut self) {
        self.pending_pause = Some(true);
    }

    pub fn request_start(&mut self) {
        self.pending_pause = Some(false);
    }

    /// Apply a pending start/pause command.
    ///
    /// A transition always leaves the idle state, so the next quiet interval
    /// republishes a status with fresh counters.
    pub fn apply_pending_pause(&mut self) {
        if let Some(pause) = self.pending_pause.take() {
            if pause != self.paused {
                self.paused = pause;
                debug!(worker = self.worker_id, paused = pause, "pause state changed");
                if self.idle {
                    self.idle = false;
                    self.publish_status();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Graph mutations
    // ------------------------------------------------------------------

    /// Insert a vertex, run its initialization hook, and schedule it for
    /// signaling when its score clears the threshold
    pub fn add_vertex(&mut self, vertex: BoxedVertex<Id, Signal>) {
        let id = vertex.id().clone();
        if !self.store.put(vertex) {
            warn!(vertex = ?id, "vertex already present, add ignored");
            return;
        }
        self.counters.vertices_added += 1;

        if let Some(vertex) = self.store.get_mut(&id) {
            let mut editor = BusEditor { bus: &mut self.bus };
            if catch_unwind(AssertUnwindSafe(|| vertex.after_initialization(&mut editor))).is_err()
            {
                error!(vertex = ?id, "after_initialization panicked");
            }
        }
        let wants_signal = self
            .store
            .get(&id)
            .is_some_and(|vertex| vertex.score_signal() > self.signal_threshold);
        if wants_signal {
            self.store.to_signal.add(id);
        }
    }

    /// Attach an outgoing edge to a local vertex and mirror an
    /// incoming-edge record at the target's worker, fire-and-forget
    pub fn add_outgoing_edge(&mut self, source: &Id, edge: Edge<Id>) {
        let Some(vertex) = self.store.get_mut(source) else {
            warn!(vertex = ?source, "edge addition to missing vertex ignored");
            return;
        };
        let target = edge.target.clone();
        let weight = edge.weight;
        if !vertex.add_outgoing_edge(edge) {
            debug!(vertex = ?source, target = ?target, "duplicate edge ignored");
            return;
        }
        self.counters.outgoing_edges_added += 1;
        self.schedule_reevaluation(source.clone());

        let record = Edge::new(source.clone(), weight);
        let record_target = target.clone();
        self.bus.send_to_worker_for_vertex_id(
            Request::counted(move |worker: &mut WorkerCore<Id, Signal>| {
                worker.add_incoming_edge(&record_target, record);
                None
            }),
            &target,
        );
    }

    /// Store an incoming-edge record on a local vertex. The record's
    /// `target` field holds the far end of the edge.
    pub fn add_incoming_edge(&mut self, target: &Id, record: Edge<Id>) {
        match self.store.get_mut(target) {
            Some(vertex) => {
                if vertex.add_incoming_edge(record) {
                    self.counters.incoming_edges_added += 1;
                }
            }
            None => debug!(vertex = ?target, "incoming edge record for unknown vertex dropped"),
        }
    }

    /// Attach an index-style edge: no mirror record, no edge counter
    pub fn add_pattern_edge(&mut self, source: &Id, edge: Edge<Id>) {
        let Some(vertex) = self.store.get_mut(source) else {
            warn!(vertex = ?source, "pattern edge for missing vertex ignored");
            return;
        };
        if vertex.add_outgoing_edge(edge) {
            self.schedule_reevaluation(source.clone());
        }
    }

    /// Remove a local vertex after running its removal hook.
    ///
    /// Signals still buffered for the vertex stay queued and surface
    /// through the undeliverable handler when drained.
    pub fn remove_vertex(&mut self, id: &Id) {
        if !self.store.contains(id) {
            warn!(vertex = ?id, "removal of missing vertex ignored");
            return;
        }
        if let Some(vertex) = self.store.get_mut(id) {
            let mut editor = BusEditor { bus: &mut self.bus };
            if catch_unwind(AssertUnwindSafe(|| vertex.before_removal(&mut editor))).is_err() {
                error!(vertex = ?id, "before_removal panicked");
            }
        }
        self.store.remove(id);
        self.counters.vertices_removed += 1;
    }

    /// Detach an outgoing edge and forward the mirror-record removal to the
    /// target's worker, fire-and-forget
    pub fn remove_outgoing_edge(&mut self, edge_id: &EdgeId<Id>) {
        let Some(vertex) = self.store.get_mut(&edge_id.source) else {
            warn!(vertex = ?edge_id.source, "edge removal on missing vertex ignored");
            return;
        };
        if !vertex.remove_outgoing_edge(edge_id) {
            warn!(edge = ?edge_id, "removal of missing edge ignored");
            return;
        }
        self.counters.outgoing_edges_removed += 1;
        self.schedule_reevaluation(edge_id.source.clone());

        let record_id = edge_id.clone();
        let route = edge_id.target.clone();
        self.bus.send_to_worker_for_vertex_id(
            Request::counted(move |worker: &mut WorkerCore<Id, Signal>| {
                let target = record_id.target.clone();
                worker.remove_incoming_edge(&target, &record_id);
                None
            }),
            &route,
        );
    }

    /// Drop an incoming-edge record from a local vertex
    pub fn remove_incoming_edge(&mut self, target: &Id, edge_id: &EdgeId<Id>) {
        match self.store.get_mut(target) {
            Some(vertex) => {
                if vertex.remove_incoming_edge(edge_id) {
                    self.counters.incoming_edges_removed += 1;
                }
            }
            None => debug!(vertex = ?target, "incoming edge removal for unknown vertex dropped"),
        }
    }

    /// Apply a mutator closure against this worker's editing surface
    pub fn modify(&mut self, mutator: Box<dyn FnOnce(&mut dyn GraphEditor<Id, Signal>) + Send>) {
        let mut editor = BusEditor { bus: &mut self.bus };
        mutator(&mut editor);
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    fn schedule_reevaluation(&mut self, id: Id) {
        self.store.to_collect.add_vertex(id.clone());
        self.store.to_signal.add(id);
    }

    /// Re-test the threshold gates for every owned vertex
    pub fn recalculate_scores(&mut self) {
        for id in self.store.ids() {
            self.schedule_reevaluation(id);
        }
    }

    /// Re-test the threshold gates for one vertex
    pub fn recalculate_scores_for_vertex(&mut self, id: &Id) {
        if self.store.contains(id) {
            self.schedule_reevaluation(id.clone());
        } else {
            warn!(vertex = ?id, "score recalculation for missing vertex ignored");
        }
    }

    // ------------------------------------------------------------------
    // Signal / collect execution
    // ------------------------------------------------------------------

    fn execute_signal(&mut self, id: &Id) {
        let Some(vertex) = self.store.get_mut(id) else {
            debug!(vertex = ?id, "scheduled vertex vanished before signal step");
            return;
        };
        if vertex.score_signal() <= self.signal_threshold {
            return;
        }
        let mut editor = BusEditor { bus: &mut self.bus };
        match catch_unwind(AssertUnwindSafe(|| vertex.execute_signal_operation(&mut editor))) {
            Ok(()) => {
                self.counters.signal_operations_executed += 1;
                self.store.update_state_of_vertex(id);
            }
            Err(_) => error!(worker = self.worker_id, vertex = ?id, "signal operation panicked"),
        }
    }

    fn execute_collect(
        &mut self,
        id: &Id,
        signals: Vec<SignalMessage<Id, Signal>>,
        add_to_signal: bool,
    ) {
        let Some(vertex) = self.store.get_mut(id) else {
            for message in &signals {
                match &self.undeliverable {
                    Some(handler) => handler(message),
                    None => debug!(vertex = ?id, "undeliverable signal dropped"),
                }
            }
            return;
        };

        if vertex.score_collect(&signals) > self.collect_threshold {
            let mut editor = BusEditor { bus: &mut self.bus };
            match catch_unwind(AssertUnwindSafe(|| {
                vertex.execute_collect_operation(signals, &mut editor)
            })) {
                Ok(()) => {
                    self.counters.collect_operations_executed += 1;
                    self.store.update_state_of_vertex(id);
                }
                Err(_) => {
                    error!(worker = self.worker_id, vertex = ?id, "collect operation panicked")
                }
            }
        }

        if add_to_signal {
            let wants_signal = self
                .store
                .get(id)
                .is_some_and(|vertex| vertex.score_signal() > self.signal_threshold);
            if wants_signal {
                self.store.to_signal.add(id.clone());
            }
        }
    }

    /// Buffer an incoming signal for its target
    pub fn deliver_signal(&mut self, message: SignalMessage<Id, Signal>) {
        self.bus.note_received();
        self.mark_busy();
        self.store.to_collect.add_signal(message);
    }

    /// Drain `to_signal` completely; driven by the coordinator
    pub fn signal_step(&mut self) {
        self.counters.signal_steps += 1;
        while let Some(id) = self.store.to_signal.pop() {
            self.execute_signal(&id);
        }
        self.bus.flush();
    }

    /// Drain `to_collect` completely; returns whether `to_signal` stayed
    /// empty, so the coordinator knows if another signal step is needed
    pub fn collect_step(&mut self) -> bool {
        self.counters.collect_steps += 1;
        while let Some((id, signals)) = self.store.to_collect.pop() {
            self.execute_collect(&id, signals, true);
        }
        self.bus.flush();
        self.store.to_signal.is_empty()
    }

    /// Execute one scheduled unit, alternating between the queues.
    /// While throttled only collect units run, so in-flight traffic drains
    /// without new signal emissions.
    pub fn process_work_unit(&mut self) -> bool {
        if self.paused {
            return false;
        }
        let signal_first = self.signal_first;
        self.signal_first = !signal_first;
        if signal_first {
            self.try_signal_unit() || self.try_collect_unit()
        } else {
            self.try_collect_unit() || self.try_signal_unit()
        }
    }

    fn try_signal_unit(&mut self) -> bool {
        if self.throttled {
            return false;
        }
        match self.store.to_signal.pop() {
            Some(id) => {
                self.execute_signal(&id);
                true
            }
            None => false,
        }
    }

    fn try_collect_unit(&mut self) -> bool {
        match self.store.to_collect.pop() {
            Some((id, signals)) => {
                self.execute_collect(&id, signals, true);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Aggregation and inspection
    // ------------------------------------------------------------------

    /// Fold the erased aggregation over this shard
    pub fn aggregate(&self, operation: &Arc<dyn ErasedAggregation<Id, Signal>>) -> RequestResult {
        let mut accumulator = operation.neutral();
        for vertex in self.store.iter() {
            accumulator = operation.fold(accumulator, vertex.as_ref());
        }
        accumulator
    }

    /// Visit every owned vertex
    pub fn for_each_vertex(&self, f: &dyn Fn(&dyn Vertex<Id, Signal>)) {
        self.store.for_each(|vertex| f(vertex));
    }

    // ------------------------------------------------------------------
    // Status and lifecycle
    // ------------------------------------------------------------------

    fn mark_busy(&mut self) {
        if self.idle {
            self.idle = false;
            self.publish_status();
        }
    }

    /// Re-derive idleness after a quiet reception interval; the caller
    /// guarantees the mailbox is empty
    pub fn refresh_idle(&mut self) {
        let idle_now = self.paused || self.is_fully_converged();
        if idle_now != self.idle {
            self.idle = idle_now;
            self.publish_status();
        }
    }

    /// Push a fresh status to this worker's node actor
    pub fn publish_status(&mut self) {
        self.bus.flush();
        let status = WorkerStatus {
            worker_id: self.worker_id,
            is_idle: self.idle,
            is_paused: self.paused,
            messages_sent: self.bus.counters().counted_sent(),
            messages_received: self.bus.counters().counted_received(),
        };
        self.bus
            .send_to_node(self.node_id, NodeMessage::WorkerStatus(status));
    }

    /// Apply a heartbeat: update the throttle flag from the backlog and the
    /// heartbeat's age, then refresh the coordinator's view of this worker
    pub fn on_heartbeat(&mut self, heartbeat: Heartbeat) {
        let workers = self.config.number_of_workers.max(1) as u64;
        let backlog_per_worker = heartbeat.global_inbox_size / workers;
        let age = heartbeat.sent_at.elapsed();

        let should_throttle = backlog_per_worker > self.config.throttle_inbox_threshold_per_worker
            || age > self.config.throttle_heartbeat_age_threshold;
        if should_throttle != self.throttled {
            self.throttled = should_throttle;
            debug!(
                worker = self.worker_id,
                throttled = should_throttle,
                backlog_per_worker,
                "throttle state changed"
            );
        }
        self.publish_status();
    }

    pub(crate) fn bus_mut(&mut self) -> &mut MessageBus<Id, Signal> {
        &mut self.bus
    }

    /// Release the shard; runs on every worker exit path
    pub fn shut_down(&mut self) {
        self.store.clean_up();
        debug!(worker = self.worker_id, "worker stopped");
    }
}

/// The worker event loop: owns the core and its private mailbox.
pub(crate) struct WorkerActor<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    core: WorkerCore<Id, Signal>,
    mailbox: mpsc::UnboundedReceiver<WorkerMessage<Id, Signal>>,
    receive_timeout: Duration,
}

impl<Id, Signal> WorkerActor<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    pub fn new(
        core: WorkerCore<Id, Signal>,
        mailbox: mpsc::UnboundedReceiver<WorkerMessage<Id, Signal>>,
    ) -> Self {
        let receive_timeout = core.config.receive_timeout;
        Self {
            core,
            mailbox,
            receive_timeout,
        }
    }

    pub async fn run(mut self) {
        debug!(worker = self.core.worker_id, "worker started");
        loop {
            // Drain everything already queued before doing local work
            let mut processed = 0usize;
            loop {
                match self.mailbox.try_recv() {
                    Ok(message) => {
                        if self.handle(message).is_break() {
                            self.core.shut_down();
                            return;
                        }
                        processed += 1;
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.core.shut_down();
                        return;
                    }
                }
            }

            self.core.apply_pending_pause();

            // One unit between mailbox probes keeps delivery latency bounded
            let worked = self.core.process_work_unit();
            if worked || processed > 0 {
                tokio::task::yield_now().await;
                continue;
            }

            // Quiet: flush buffered sends, then wait out the reception
            // timeout before concluding anything about idleness
            self.core.bus_mut().flush();
            match timeout(self.receive_timeout, self.mailbox.recv()).await {
                Ok(Some(message)) => {
                    if self.handle(message).is_break() {
                        self.core.shut_down();
                        return;
                    }
                }
                Ok(None) => {
                    self.core.shut_down();
                    return;
                }
                Err(_) => self.core.refresh_idle(),
            }
        }
    }

    fn handle(&mut self, message: WorkerMessage<Id, Signal>) -> ControlFlow<()> {
        match message {
            WorkerMessage::Signal(signal) => self.core.deliver_signal(signal),
            WorkerMessage::BulkSignal(batch) => {
                for signal in batch {
                    self.core.deliver_signal(signal);
                }
            }
            WorkerMessage::Request(request) => {
                if request.counted {
                    self.core.bus.note_received();
                    self.core.mark_busy();
                }
                let result = (request.command)(&mut self.core);
                if let Some(reply) = request.reply {
                    let payload = result.unwrap_or_else(|| Box::new(()) as RequestResult);
                    if reply.send(payload).is_err() {
                        debug!(worker = self.core.worker_id, "reply receiver dropped");
                    }
                }
            }
            WorkerMessage::Heartbeat(heartbeat) => self.core.on_heartbeat(heartbeat),
            WorkerMessage::PoisonPill => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }
}
