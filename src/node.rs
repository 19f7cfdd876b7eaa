//! The node actor
//!
//! One node actor co-hosts a contiguous block of workers and sits between
//! them and the coordinator. Worker statuses land here first; they are
//! forwarded to the coordinator in a batch once every hosted worker is idle,
//! which keeps the status channel quiet under load while still surfacing a
//! tight convergence decision. A coordinator heartbeat forces a refresh of
//! the latest statuses plus a node status, so throttling always works with
//! current numbers.

use std::ops::ControlFlow;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::MessageBus;
use crate::coordinator::CoordinatorMessage;
use crate::messages::{Heartbeat, NodeStatus, Request, RequestResult, WorkerStatus};
use crate::vertex::{SignalValue, VertexId};

/// Everything a node actor's mailbox can carry.
#[derive(Debug)]
pub enum NodeMessage<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    /// Status update from a hosted worker
    WorkerStatus(WorkerStatus),
    /// Periodic coordinator broadcast
    Heartbeat(Heartbeat),
    /// A command to evaluate against this node
    Request(Request<NodeCore<Id, Signal>>),
    /// Shut down
    PoisonPill,
}

/// The state node requests are evaluated against.
pub struct NodeCore<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    node_id: usize,
    first_worker: usize,
    workers_on_node: usize,
    worker_status: Vec<Option<WorkerStatus>>,
    is_worker_idle: Vec<bool>,
    forwarded_to_coordinator: Vec<bool>,
    number_of_idle_workers: usize,
    bus: MessageBus<Id, Signal>,
    received_messages: u64,
}

impl<Id, Signal> NodeCore<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    pub fn new(
        node_id: usize,
        first_worker: usize,
        workers_on_node: usize,
        bus: MessageBus<Id, Signal>,
    ) -> Self {
        Self {
            node_id,
            first_worker,
            workers_on_node,
            worker_status: vec![None; workers_on_node],
            is_worker_idle: vec![false; workers_on_node],
            forwarded_to_coordinator: vec![false; workers_on_node],
            number_of_idle_workers: 0,
            bus,
            received_messages: 0,
        }
    }

    pub fn node_id(&self) -> usize {
        self.node_id
    }

    pub fn number_of_idle_workers(&self) -> usize {
        self.number_of_idle_workers
    }

    /// Current node status: this node's own send counters plus its
    /// processed-message count
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node_id,
            messages_sent: self.bus.counters().sent_stats(),
            messages_received: self.received_messages,
        }
    }

    /// Record a worker status; once every hosted worker is idle, forward
    /// all not-yet-forwarded statuses and emit a node status
    pub fn record_worker_status(&mut self, status: WorkerStatus) {
        self.received_messages += 1;

        let Some(slot) = status
            .worker_id
            .checked_sub(self.first_worker)
            .filter(|slot| *slot < self.workers_on_node)
        else {
            warn!(
                node = self.node_id,
                worker = status.worker_id,
                "status from a worker this node does not host"
            );
            return;
        };

        let is_newer = match &self.worker_status[slot] {
            Some(existing) => status.is_newer_than(existing),
            None => true,
        };
        if !is_newer {
            return;
        }

        if self.is_worker_idle[slot] != status.is_idle {
            if status.is_idle {
                self.number_of_idle_workers += 1;
            } else {
                self.number_of_idle_workers -= 1;
            }
            self.is_worker_idle[slot] = status.is_idle;
        }
        self.worker_status[slot] = Some(status);
        self.forwarded_to_coordinator[slot] = false;

        if self.number_of_idle_workers == self.workers_on_node {
            self.forward_pending_statuses();
            self.emit_node_status();
        }
    }

    /// Heartbeat handling: refresh the coordinator's view even when the
    /// hosted workers are busy, then report this node
    pub fn on_heartbeat(&mut self, _heartbeat: Heartbeat) {
        self.forward_latest_statuses();
        self.emit_node_status();
    }

    fn forward_pending_statuses(&mut self) {
        for slot in 0..self.workers_on_node {
            if self.forwarded_to_coordinator[slot] {
                continue;
            }
            if let Some(status) = self.worker_status[slot] {
                self.bus
                    .send_to_coordinator(CoordinatorMessage::WorkerStatus(status));
                self.forwarded_to_coordinator[slot] = true;
            }
        }
    }

    fn forward_latest_statuses(&mut self) {
        for slot in 0..self.workers_on_node {
            if let Some(status) = self.worker_status[slot] {
                self.bus
                    .send_to_coordinator(CoordinatorMessage::WorkerStatus(status));
                self.forwarded_to_coordinator[slot] = true;
            }
        }
    }

    fn emit_node_status(&self) {
        self.bus
            .send_to_coordinator(CoordinatorMessage::NodeStatus(self.status()));
    }
}

/// The node event loop.
pub(crate) struct NodeActor<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    core: NodeCore<Id, Signal>,
    mailbox: mpsc::UnboundedReceiver<NodeMessage<Id, Signal>>,
}

impl<Id, Signal> NodeActor<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    pub fn new(
        core: NodeCore<Id, Signal>,
        mailbox: mpsc::UnboundedReceiver<NodeMessage<Id, Signal>>,
    ) -> Self {
        Self { core, mailbox }
    }

    pub async fn run(mut self) {
        debug!(node = self.core.node_id, "node started");
        while let Some(message) = self.mailbox.recv().await {
            if self.handle(message).is_break() {
                break;
            }
        }
        debug!(node = self.core.node_id, "node stopped");
    }

    fn handle(&mut self, message: NodeMessage<Id, Signal>) -> ControlFlow<()> {
        match message {
            NodeMessage::WorkerStatus(status) => self.core.record_worker_status(status),
            NodeMessage::Heartbeat(heartbeat) => self.core.on_heartbeat(heartbeat),
            NodeMessage::Request(request) => {
                let result = (request.command)(&mut self.core);
                if let Some(reply) = request.reply {
                    // A command without a value still answers: explicit unit
                    // instead of a null the transport might reject
                    let payload = result.unwrap_or_else(|| Box::new(()) as RequestResult);
                    if reply.send(payload).is_err() {
                        debug!(node = self.core.node_id, "reply receiver dropped");
                    }
                }
            }
            NodeMessage::PoisonPill => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusRegistry, MessageCounters};
    use crate::mapper::DefaultVertexMapper;
    use std::sync::Arc;

    fn test_node(
        workers: usize,
    ) -> (
        NodeCore<u32, f64>,
        mpsc::UnboundedReceiver<CoordinatorMessage<u32, f64>>,
    ) {
        let registry = Arc::new(BusRegistry::new(workers, 1));
        let (coord_tx, coord_rx) = mpsc::unbounded_channel();
        registry.register_coordinator(coord_tx);
        let bus = MessageBus::new(
            registry,
            Arc::new(DefaultVertexMapper::new(workers, workers)),
            Arc::new(MessageCounters::new()),
            1,
        );
        (NodeCore::new(0, 0, workers, bus), coord_rx)
    }

    fn status(worker_id: usize, is_idle: bool, sent: u64, received: u64) -> WorkerStatus {
        WorkerStatus {
            worker_id,
            is_idle,
            is_paused: false,
            messages_sent: sent,
            messages_received: received,
        }
    }

    #[tokio::test]
    async fn test_no_forward_until_all_idle() {
        let (mut core, mut coord_rx) = test_node(2);

        core.record_worker_status(status(0, true, 1, 1));
        assert!(coord_rx.try_recv().is_err());
        assert_eq!(core.number_of_idle_workers(), 1);

        core.record_worker_status(status(1, true, 2, 2));
        // Batch: both worker statuses, then the node status
        let mut worker_statuses = 0;
        let mut node_statuses = 0;
        while let Ok(message) = coord_rx.try_recv() {
            match message {
                CoordinatorMessage::WorkerStatus(_) => worker_statuses += 1,
                CoordinatorMessage::NodeStatus(_) => node_statuses += 1,
                _ => {}
            }
        }
        assert_eq!(worker_statuses, 2);
        assert_eq!(node_statuses, 1);
    }

    #[tokio::test]
    async fn test_stale_status_is_dropped() {
        let (mut core, _coord_rx) = test_node(1);

        core.record_worker_status(status(0, false, 10, 10));
        core.record_worker_status(status(0, true, 3, 3));

        // The stale idle report must not flip the idle count
        assert_eq!(core.number_of_idle_workers(), 0);
    }

    #[tokio::test]
    async fn test_idle_flip_with_same_counters_lands() {
        let (mut core, _coord_rx) = test_node(1);

        core.record_worker_status(status(0, false, 5, 5));
        core.record_worker_status(status(0, true, 5, 5));
        assert_eq!(core.number_of_idle_workers(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_forwards_latest_and_node_status() {
        let (mut core, mut coord_rx) = test_node(2);
        core.record_worker_status(status(0, false, 4, 2));

        core.on_heartbeat(Heartbeat::new(0));
        let mut worker_statuses = 0;
        let mut node_statuses = 0;
        while let Ok(message) = coord_rx.try_recv() {
            match message {
                CoordinatorMessage::WorkerStatus(s) => {
                    assert_eq!(s.worker_id, 0);
                    worker_statuses += 1;
                }
                CoordinatorMessage::NodeStatus(s) => {
                    assert_eq!(s.node_id, 0);
                    assert_eq!(s.messages_received, 1);
                    node_statuses += 1;
                }
                _ => {}
            }
        }
        assert_eq!(worker_statuses, 1);
        assert_eq!(node_statuses, 1);
    }

    #[tokio::test]
    async fn test_foreign_worker_status_rejected() {
        let (mut core, _coord_rx) = test_node(1);
        core.record_worker_status(status(7, true, 1, 1));
        assert_eq!(core.number_of_idle_workers(), 0);
    }
}
