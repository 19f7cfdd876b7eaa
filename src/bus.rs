//! Message routing between actors
//!
//! The bus owns no actors: it holds a registry of mailbox senders plus the
//! mapper that turns a vertex id into its owning worker. Every actor carries
//! its own [`MessageBus`] instance with its own counters, all pointing at
//! the same shared [`BusRegistry`]; this is what breaks the worker/bus
//! ownership cycle.
//!
//! Counting: `counted_sent`/`counted_received` track the user-visible
//! message flow (signals and worker-addressed requests) and feed the global
//! conservation invariant. Heartbeats, coordinator control broadcasts,
//! status messages, and replies are elided on both sides by construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::warn;

use crate::coordinator::CoordinatorMessage;
use crate::mapper::VertexToWorkerMapper;
use crate::messages::{Heartbeat, Request, SentMessagesStats, SignalMessage};
use crate::node::NodeMessage;
use crate::vertex::{SignalValue, VertexId};
use crate::worker::{WorkerCore, WorkerMessage};

/// Atomic send/receive counters of one bus instance.
#[derive(Debug, Default)]
pub struct MessageCounters {
    counted_sent: AtomicU64,
    counted_received: AtomicU64,
    to_workers: AtomicU64,
    to_nodes: AtomicU64,
    to_coordinator: AtomicU64,
    to_others: AtomicU64,
}

impl MessageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the receipt of one counted message
    pub fn note_received(&self) {
        self.counted_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counted_sent(&self) -> u64 {
        self.counted_sent.load(Ordering::Relaxed)
    }

    pub fn counted_received(&self) -> u64 {
        self.counted_received.load(Ordering::Relaxed)
    }

    pub fn sent_stats(&self) -> SentMessagesStats {
        SentMessagesStats {
            to_workers: self.to_workers.load(Ordering::Relaxed),
            to_nodes: self.to_nodes.load(Ordering::Relaxed),
            to_coordinator: self.to_coordinator.load(Ordering::Relaxed),
            to_others: self.to_others.load(Ordering::Relaxed),
        }
    }

    fn note_sent_to_worker(&self, counted: bool) {
        self.to_workers.fetch_add(1, Ordering::Relaxed);
        if counted {
            self.counted_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn note_sent_to_node(&self) {
        self.to_nodes.fetch_add(1, Ordering::Relaxed);
    }

    fn note_sent_to_coordinator(&self) {
        self.to_coordinator.fetch_add(1, Ordering::Relaxed);
    }
}

struct RegistryInner<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    workers: Vec<Option<mpsc::UnboundedSender<WorkerMessage<Id, Signal>>>>,
    nodes: Vec<Option<mpsc::UnboundedSender<NodeMessage<Id, Signal>>>>,
    coordinator: Option<mpsc::UnboundedSender<CoordinatorMessage<Id, Signal>>>,
}

/// The shared wiring table: one mailbox sender per worker and node plus the
/// coordinator sink. Filled during bootstrap, read-only afterwards.
pub struct BusRegistry<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    inner: RwLock<RegistryInner<Id, Signal>>,
}

impl<Id, Signal> BusRegistry<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    pub fn new(number_of_workers: usize, number_of_nodes: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                workers: vec![None; number_of_workers],
                nodes: vec![None; number_of_nodes],
                coordinator: None,
            }),
        }
    }

    pub fn register_worker(
        &self,
        index: usize,
        sender: mpsc::UnboundedSender<WorkerMessage<Id, Signal>>,
    ) {
        if let Ok(mut inner) = self.inner.write() {
            if index < inner.workers.len() {
                inner.workers[index] = Some(sender);
            }
        }
    }

    pub fn register_node(
        &self,
        index: usize,
        sender: mpsc::UnboundedSender<NodeMessage<Id, Signal>>,
    ) {
        if let Ok(mut inner) = self.inner.write() {
            if index < inner.nodes.len() {
                inner.nodes[index] = Some(sender);
            }
        }
    }

    pub fn register_coordinator(
        &self,
        sender: mpsc::UnboundedSender<CoordinatorMessage<Id, Signal>>,
    ) {
        if let Ok(mut inner) = self.inner.write() {
            inner.coordinator = Some(sender);
        }
    }

    /// True once every worker, every node, and the coordinator are wired
    pub fn is_initialized(&self) -> bool {
        match self.inner.read() {
            Ok(inner) => {
                inner.workers.iter().all(Option::is_some)
                    && inner.nodes.iter().all(Option::is_some)
                    && inner.coordinator.is_some()
            }
            Err(_) => false,
        }
    }

    pub fn number_of_workers(&self) -> usize {
        self.inner.read().map(|i| i.workers.len()).unwrap_or(0)
    }

    fn worker_sender(
        &self,
        index: usize,
    ) -> Option<mpsc::UnboundedSender<WorkerMessage<Id, Signal>>> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.workers.get(index).cloned().flatten())
    }

    fn node_sender(&self, index: usize) -> Option<mpsc::UnboundedSender<NodeMessage<Id, Signal>>> {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.nodes.get(index).cloned().flatten())
    }

    fn coordinator_sender(
        &self,
    ) -> Option<mpsc::UnboundedSender<CoordinatorMessage<Id, Signal>>> {
        self.inner.read().ok().and_then(|inner| inner.coordinator.clone())
    }
}

/// One actor's handle on the routing fabric.
pub struct MessageBus<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    registry: Arc<BusRegistry<Id, Signal>>,
    mapper: Arc<dyn VertexToWorkerMapper<Id>>,
    counters: Arc<MessageCounters>,
    flush_threshold: usize,
    bulk: Vec<Vec<SignalMessage<Id, Signal>>>,
}

impl<Id, Signal> MessageBus<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    pub fn new(
        registry: Arc<BusRegistry<Id, Signal>>,
        mapper: Arc<dyn VertexToWorkerMapper<Id>>,
        counters: Arc<MessageCounters>,
        flush_threshold: usize,
    ) -> Self {
        let workers = registry.number_of_workers();
        let bulk = if flush_threshold > 1 {
            (0..workers).map(|_| Vec::new()).collect()
        } else {
            Vec::new()
        };
        Self {
            registry,
            mapper,
            counters,
            flush_threshold,
            bulk,
        }
    }

    pub fn counters(&self) -> &Arc<MessageCounters> {
        &self.counters
    }

    pub fn mapper(&self) -> &Arc<dyn VertexToWorkerMapper<Id>> {
        &self.mapper
    }

    pub fn is_initialized(&self) -> bool {
        self.registry.is_initialized()
    }

    /// False once the worker's mailbox is gone; the job cannot recover
    /// from that and is expected to abort
    pub fn worker_is_reachable(&self, index: usize) -> bool {
        self.registry
            .worker_sender(index)
            .is_some_and(|sender| !sender.is_closed())
    }

    /// Record the receipt of one counted message on this actor's side
    pub fn note_received(&self) {
        self.counters.note_received();
    }

    /// Route a signal to its target's owning worker.
    ///
    /// With a flush threshold above 1 the signal is buffered per destination
    /// and shipped in bulk; delivery guarantees are unchanged.
    pub fn send_signal(&mut self, signal: Signal, target: Id, source: Option<Id>) {
        let message = SignalMessage {
            source,
            target,
            edge_id: None,
            signal,
        };
        self.send_signal_message(message);
    }

    pub fn send_signal_message(&mut self, message: SignalMessage<Id, Signal>) {
        let worker = self.mapper.worker_for(&message.target);
        self.counters.note_sent_to_worker(true);

        if self.flush_threshold > 1 {
            if let Some(buffer) = self.bulk.get_mut(worker) {
                buffer.push(message);
                if buffer.len() >= self.flush_threshold {
                    self.flush_worker(worker);
                }
                return;
            }
        }
        self.deliver_to_worker(worker, WorkerMessage::Signal(message));
    }

    /// Ship any buffered signals for the given worker
    fn flush_worker(&mut self, worker: usize) {
        if let Some(buffer) = self.bulk.get_mut(worker) {
            if buffer.is_empty() {
                return;
            }
            let batch = std::mem::take(buffer);
            self.deliver_to_worker(worker, WorkerMessage::BulkSignal(batch));
        }
    }

    /// Ship every buffered signal; called before an actor reports idle
    pub fn flush(&mut self) {
        for worker in 0..self.bulk.len() {
            self.flush_worker(worker);
        }
    }

    /// Route a counted request to the worker owning the given vertex id
    pub fn send_to_worker_for_vertex_id(
        &self,
        request: Request<WorkerCore<Id, Signal>>,
        id: &Id,
    ) {
        let worker = self.mapper.worker_for(id);
        self.send_to_worker(worker, WorkerMessage::Request(request));
    }

    /// Send directly to a worker by index; counts according to the message
    pub fn send_to_worker(&self, index: usize, message: WorkerMessage<Id, Signal>) {
        let counted = message.is_counted();
        self.counters.note_sent_to_worker(counted);
        self.deliver_to_worker(index, message);
    }

    /// Broadcast one message per worker; `counted` applies to every copy
    pub fn send_to_workers(
        &self,
        mut make: impl FnMut(usize) -> WorkerMessage<Id, Signal>,
        counted: bool,
    ) {
        for index in 0..self.registry.number_of_workers() {
            self.counters.note_sent_to_worker(counted);
            self.deliver_to_worker(index, make(index));
        }
    }

    /// Broadcast a heartbeat to every worker; never counted
    pub fn broadcast_heartbeat(&self, heartbeat: Heartbeat) {
        self.send_to_workers(|_| WorkerMessage::Heartbeat(heartbeat), false);
    }

    pub fn send_to_node(&self, index: usize, message: NodeMessage<Id, Signal>) {
        self.counters.note_sent_to_node();
        match self.registry.node_sender(index) {
            Some(sender) => {
                if sender.send(message).is_err() {
                    warn!(node = index, "node mailbox closed, message dropped");
                }
            }
            None => warn!(node = index, "no node registered at index"),
        }
    }

    pub fn send_to_coordinator(&self, message: CoordinatorMessage<Id, Signal>) {
        self.counters.note_sent_to_coordinator();
        match self.registry.coordinator_sender() {
            Some(sender) => {
                if sender.send(message).is_err() {
                    warn!("coordinator mailbox closed, message dropped");
                }
            }
            None => warn!("no coordinator registered"),
        }
    }

    fn deliver_to_worker(&self, index: usize, message: WorkerMessage<Id, Signal>) {
        match self.registry.worker_sender(index) {
            Some(sender) => {
                if sender.send(message).is_err() {
                    warn!(worker = index, "worker mailbox closed, message dropped");
                }
            }
            None => warn!(worker = index, "no worker registered at index"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::DefaultVertexMapper;

    fn test_bus(
        workers: usize,
        flush: usize,
    ) -> (
        MessageBus<u32, f64>,
        Vec<mpsc::UnboundedReceiver<WorkerMessage<u32, f64>>>,
    ) {
        let registry = Arc::new(BusRegistry::new(workers, 1));
        let mut receivers = Vec::new();
        for i in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            registry.register_worker(i, tx);
            receivers.push(rx);
        }
        let bus = MessageBus::new(
            registry,
            Arc::new(DefaultVertexMapper::new(workers, workers)),
            Arc::new(MessageCounters::new()),
            flush,
        );
        (bus, receivers)
    }

    #[test]
    fn test_is_initialized_requires_full_wiring() {
        let registry: BusRegistry<u32, f64> = BusRegistry::new(2, 1);
        assert!(!registry.is_initialized());

        let (w0, _r0) = mpsc::unbounded_channel();
        let (w1, _r1) = mpsc::unbounded_channel();
        registry.register_worker(0, w0);
        registry.register_worker(1, w1);
        assert!(!registry.is_initialized());

        let (n, _rn) = mpsc::unbounded_channel();
        registry.register_node(0, n);
        assert!(!registry.is_initialized());

        let (c, _rc) = mpsc::unbounded_channel();
        registry.register_coordinator(c);
        assert!(registry.is_initialized());
    }

    #[tokio::test]
    async fn test_send_signal_routes_and_counts() {
        let (mut bus, mut receivers) = test_bus(1, 1);

        bus.send_signal(0.5, 7u32, Some(1u32));
        assert_eq!(bus.counters().counted_sent(), 1);
        assert_eq!(bus.counters().sent_stats().to_workers, 1);

        match receivers[0].try_recv() {
            Ok(WorkerMessage::Signal(msg)) => {
                assert_eq!(msg.target, 7);
                assert_eq!(msg.source, Some(1));
            }
            other => panic!("expected signal, got {:?}", other.map(|_| "message")),
        }
    }

    #[tokio::test]
    async fn test_bulk_buffering_flushes_at_threshold() {
        let (mut bus, mut receivers) = test_bus(1, 3);

        bus.send_signal(0.1, 1u32, None);
        bus.send_signal(0.2, 1u32, None);
        assert!(receivers[0].try_recv().is_err());
        // Counted at buffer time
        assert_eq!(bus.counters().counted_sent(), 2);

        bus.send_signal(0.3, 1u32, None);
        match receivers[0].try_recv() {
            Ok(WorkerMessage::BulkSignal(batch)) => assert_eq!(batch.len(), 3),
            _ => panic!("expected bulk signal"),
        }
    }

    #[tokio::test]
    async fn test_explicit_flush_ships_partial_batch() {
        let (mut bus, mut receivers) = test_bus(1, 100);

        bus.send_signal(0.1, 1u32, None);
        bus.flush();

        match receivers[0].try_recv() {
            Ok(WorkerMessage::BulkSignal(batch)) => assert_eq!(batch.len(), 1),
            _ => panic!("expected bulk signal"),
        }
        // A second flush has nothing to ship
        bus.flush();
        assert!(receivers[0].try_recv().is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_broadcast_is_uncounted() {
        let (bus, mut receivers) = test_bus(2, 1);

        bus.broadcast_heartbeat(Heartbeat::new(0));
        assert_eq!(bus.counters().counted_sent(), 0);
        assert_eq!(bus.counters().sent_stats().to_workers, 2);

        for rx in receivers.iter_mut() {
            assert!(matches!(rx.try_recv(), Ok(WorkerMessage::Heartbeat(_))));
        }
    }
}
