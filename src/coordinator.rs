//! The coordinator
//!
//! A single-threaded event loop that drives global execution. It aggregates
//! worker statuses relayed by the node actors, detects convergence through
//! the message-conservation invariant, broadcasts heartbeats carrying the
//! global inbox size, and implements both the barrier-separated synchronous
//! protocol and asynchronous idle detection.
//!
//! Global idleness holds exactly when every worker reported idle and the
//! system-wide sent and received counts of user-visible messages are equal:
//! an unequal pair means a signal or mutation is still in flight somewhere.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregation::{ErasedAggregation, GlobalTerminationCondition};
use crate::bus::{MessageBus, MessageCounters};
use crate::config::{ExecutionConfig, ExecutionMode, GraphConfig, TerminationReason};
use crate::error::GraphError;
use crate::messages::{Heartbeat, NodeStatus, Request, RequestResult, WorkerStatus};
use crate::node::NodeMessage;
use crate::vertex::{SignalValue, VertexId};
use crate::worker::{
    WorkerCore, WorkerMessage, WorkerOperationCounters, WorkerSnapshot, WorkerState,
};

/// Everything the coordinator's mailbox can carry.
pub enum CoordinatorMessage<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    /// Worker status relayed by a node actor
    WorkerStatus(WorkerStatus),
    /// Node status emitted on all-idle or heartbeat
    NodeStatus(NodeStatus),
    /// Drive an execution to its termination
    Execute {
        config: ExecutionConfig<Id, Signal>,
        reply: oneshot::Sender<Result<ExecutionInformation, GraphError>>,
    },
    /// Complete once the system is globally idle
    AwaitIdle { reply: oneshot::Sender<()> },
    /// Fetch the coordinator's current view of the system
    Snapshot {
        reply: oneshot::Sender<CoordinatorSnapshot>,
    },
    /// Run an aggregation across all workers
    Aggregate {
        operation: Arc<dyn ErasedAggregation<Id, Signal>>,
        reply: oneshot::Sender<RequestResult>,
    },
    /// Shut down
    PoisonPill,
}

impl<Id, Signal> std::fmt::Debug for CoordinatorMessage<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CoordinatorMessage::WorkerStatus(_) => "WorkerStatus",
            CoordinatorMessage::NodeStatus(_) => "NodeStatus",
            CoordinatorMessage::Execute { .. } => "Execute",
            CoordinatorMessage::AwaitIdle { .. } => "AwaitIdle",
            CoordinatorMessage::Snapshot { .. } => "Snapshot",
            CoordinatorMessage::Aggregate { .. } => "Aggregate",
            CoordinatorMessage::PoisonPill => "PoisonPill",
        };
        f.write_str(name)
    }
}

/// The coordinator's current view of the system, for callers and tests.
#[derive(Debug, Clone)]
pub struct CoordinatorSnapshot {
    pub worker_status: Vec<Option<WorkerStatus>>,
    pub node_status: Vec<Option<NodeStatus>>,
    pub total_messages_sent: u64,
    pub total_messages_received: u64,
    pub global_inbox_size: u64,
    pub is_idle: bool,
}

/// Operation totals accumulated during one execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionStatistics {
    /// Operations executed during this run, summed over all workers
    pub operations: WorkerOperationCounters,
    /// System-wide counted messages sent, at the end of the run
    pub messages_sent: u64,
    /// System-wide counted messages received, at the end of the run
    pub messages_received: u64,
}

/// What an `execute` call returns.
#[derive(Debug, Clone)]
pub struct ExecutionInformation {
    pub execution_id: Uuid,
    pub mode: ExecutionMode,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub termination_reason: TerminationReason,
    pub statistics: ExecutionStatistics,
}

struct ActiveRun {
    reply: oneshot::Sender<Result<ExecutionInformation, GraphError>>,
    execution_id: Uuid,
    mode: ExecutionMode,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    deadline: Option<Instant>,
    baseline: WorkerOperationCounters,
    ticks_since_check: usize,
}

/// The coordinator event loop.
pub(crate) struct Coordinator<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    bus: MessageBus<Id, Signal>,
    system_counters: Arc<MessageCounters>,
    config: GraphConfig,
    worker_status: Vec<Option<WorkerStatus>>,
    node_status: Vec<Option<NodeStatus>>,
    on_idle: Vec<oneshot::Sender<()>>,
    active_run: Option<ActiveRun>,
    active_termination: Option<Arc<GlobalTerminationCondition<Id, Signal>>>,
    mailbox: mpsc::UnboundedReceiver<CoordinatorMessage<Id, Signal>>,
}

impl<Id, Signal> Coordinator<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    pub fn new(
        bus: MessageBus<Id, Signal>,
        system_counters: Arc<MessageCounters>,
        config: GraphConfig,
        mailbox: mpsc::UnboundedReceiver<CoordinatorMessage<Id, Signal>>,
    ) -> Self {
        let workers = config.number_of_workers;
        let nodes = config.number_of_nodes();
        Self {
            bus,
            system_counters,
            config,
            worker_status: vec![None; workers],
            node_status: vec![None; nodes],
            on_idle: Vec::new(),
            active_run: None,
            active_termination: None,
            mailbox,
        }
    }

    pub async fn run(mut self) {
        debug!("coordinator started");
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_message = self.mailbox.recv() => match maybe_message {
                    Some(message) => {
                        if self.handle(message).await.is_break() {
                            debug!("coordinator stopped");
                            return;
                        }
                    }
                    None => {
                        debug!("coordinator mailbox closed");
                        return;
                    }
                },
                _ = heartbeat.tick() => self.on_heartbeat_tick().await,
            }
        }
    }

    async fn handle(&mut self, message: CoordinatorMessage<Id, Signal>) -> ControlFlow<()> {
        match message {
            CoordinatorMessage::WorkerStatus(status) => {
                self.record_worker_status(status);
                self.check_idle().await;
            }
            CoordinatorMessage::NodeStatus(status) => {
                if let Some(slot) = self.node_status.get_mut(status.node_id) {
                    *slot = Some(status);
                } else {
                    warn!(node = status.node_id, "status from unknown node");
                }
            }
            CoordinatorMessage::Execute { config, reply } => {
                self.start_execution(config, reply).await;
            }
            CoordinatorMessage::AwaitIdle { reply } => {
                self.on_idle.push(reply);
                self.check_idle().await;
            }
            CoordinatorMessage::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            CoordinatorMessage::Aggregate { operation, reply } => {
                let value = self.run_aggregation(operation).await;
                let _ = reply.send(value);
            }
            CoordinatorMessage::PoisonPill => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    // ------------------------------------------------------------------
    // Status accounting
    // ------------------------------------------------------------------

    fn record_worker_status(&mut self, status: WorkerStatus) {
        let Some(slot) = self.worker_status.get_mut(status.worker_id) else {
            warn!(worker = status.worker_id, "status from unknown worker");
            return;
        };
        let is_newer = match slot {
            Some(existing) => status.is_newer_than(existing),
            None => true,
        };
        if is_newer {
            *slot = Some(status);
        }
    }

    fn total_messages_sent(&self) -> u64 {
        let by_workers: u64 = self
            .worker_status
            .iter()
            .flatten()
            .map(|status| status.messages_sent)
            .sum();
        by_workers + self.system_counters.counted_sent()
    }

    fn total_messages_received(&self) -> u64 {
        self.worker_status
            .iter()
            .flatten()
            .map(|status| status.messages_received)
            .sum()
    }

    /// Messages sent but not yet received anywhere in the system
    fn global_inbox_size(&self) -> u64 {
        self.total_messages_sent()
            .saturating_sub(self.total_messages_received())
    }

    fn is_globally_idle(&self) -> bool {
        let all_idle = self.worker_status.iter().all(|status| match status {
            Some(status) => status.is_idle,
            None => false,
        });
        all_idle && self.total_messages_sent() == self.total_messages_received()
    }

    fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            worker_status: self.worker_status.clone(),
            node_status: self.node_status.clone(),
            total_messages_sent: self.total_messages_sent(),
            total_messages_received: self.total_messages_received(),
            global_inbox_size: self.global_inbox_size(),
            is_idle: self.is_globally_idle(),
        }
    }

    // ------------------------------------------------------------------
    // Heartbeat and idle detection
    // ------------------------------------------------------------------

    async fn on_heartbeat_tick(&mut self) {
        let heartbeat = Heartbeat::new(self.global_inbox_size());
        self.bus.broadcast_heartbeat(heartbeat);
        for node in 0..self.config.number_of_nodes() {
            self.bus.send_to_node(node, NodeMessage::Heartbeat(heartbeat));
        }

        // A dead worker mailbox is unrecoverable: abort the run and hand
        // back whatever statistics the remaining workers can report
        if self.active_run.is_some() {
            let unreachable = (0..self.config.number_of_workers)
                .any(|worker| !self.bus.worker_is_reachable(worker));
            if unreachable {
                warn!("worker unreachable, aborting execution");
                self.finish_active_run(TerminationReason::Error).await;
                return;
            }
        }

        // Limits and conditions of an asynchronous run are enforced on the
        // heartbeat cadence
        let mut deadline_hit = false;
        let mut condition_due = None;
        if let Some(run) = self.active_run.as_mut() {
            if run.mode.awaits_global_idle() {
                deadline_hit = run.deadline.is_some_and(|deadline| Instant::now() >= deadline);
                if !deadline_hit {
                    if let Some(condition) = self.active_termination.clone() {
                        run.ticks_since_check += 1;
                        if run.ticks_since_check >= condition.check_interval() {
                            run.ticks_since_check = 0;
                            condition_due = Some(condition);
                        }
                    }
                }
            }
        }

        if deadline_hit {
            self.finish_active_run(TerminationReason::TimeLimitReached)
                .await;
        } else if let Some(condition) = condition_due {
            let value = self.run_aggregation(condition.operation()).await;
            if condition.is_met(&value) {
                self.finish_active_run(TerminationReason::GlobalConstraintMet)
                    .await;
            }
        }

        self.check_idle().await;
    }

    /// Reported statuses can lag behind reality (node batching, heartbeat
    /// relays), so they only TRIGGER the idle decision. The decision itself
    /// rests on a fresh probe of every worker: a snapshot taken while a
    /// message is still in flight shows the sender's count without the
    /// receiver's, and a buffered-but-uncollected signal shows up as a
    /// non-empty queue. Either disproves quiescence.
    async fn check_idle(&mut self) {
        if self.on_idle.is_empty() && self.active_run.is_none() {
            return;
        }
        if !self.is_globally_idle() {
            return;
        }
        if !self.verify_global_quiescence().await {
            return;
        }
        for waiter in self.on_idle.drain(..) {
            let _ = waiter.send(());
        }
        let run_converged = self
            .active_run
            .as_ref()
            .is_some_and(|run| run.mode.awaits_global_idle());
        if run_converged {
            self.finish_active_run(TerminationReason::Converged).await;
        }
    }

    async fn verify_global_quiescence(&mut self) -> bool {
        let snapshots = self.gather_snapshots().await;
        if snapshots.len() < self.config.number_of_workers {
            return false;
        }
        let all_quiet = snapshots.iter().all(|snapshot| {
            matches!(snapshot.state, WorkerState::Paused | WorkerState::Idle)
                || (snapshot.to_signal_len == 0 && snapshot.to_collect_len == 0)
        });
        if !all_quiet {
            return false;
        }
        let sent: u64 = snapshots.iter().map(|s| s.messages_sent).sum::<u64>()
            + self.system_counters.counted_sent();
        let received: u64 = snapshots.iter().map(|s| s.messages_received).sum();
        sent == received
    }

    // ------------------------------------------------------------------
    // Execution protocols
    // ------------------------------------------------------------------

    async fn start_execution(
        &mut self,
        config: ExecutionConfig<Id, Signal>,
        reply: oneshot::Sender<Result<ExecutionInformation, GraphError>>,
    ) {
        if self.active_run.is_some() {
            let _ = reply.send(Err(GraphError::aborted(
                "an execution is already in progress",
            )));
            return;
        }

        let execution_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started_instant = Instant::now();
        info!(mode = ?config.mode, %execution_id, "execution started");

        self.configure_workers(&config).await;
        let baseline = self.baseline_counters().await;

        match config.mode {
            ExecutionMode::Synchronous => {
                let reason = self.run_synchronous(&config).await;
                let statistics = self.gather_statistics(baseline).await;
                let information = ExecutionInformation {
                    execution_id,
                    mode: config.mode,
                    started_at,
                    duration: started_instant.elapsed(),
                    termination_reason: reason,
                    statistics,
                };
                info!(%execution_id, reason = ?reason, "execution finished");
                let _ = reply.send(Ok(information));
            }
            ExecutionMode::OptimizedAsynchronous | ExecutionMode::PureAsynchronous => {
                if config.mode == ExecutionMode::OptimizedAsynchronous {
                    // Skip the first round of score churn with one barrier
                    // signal step before going continuous
                    self.broadcast_signal_step().await;
                }
                self.active_termination = config.global_termination.clone();
                self.active_run = Some(ActiveRun {
                    reply,
                    execution_id,
                    mode: config.mode,
                    started_at,
                    started_instant,
                    deadline: config.time_limit.map(|limit| started_instant + limit),
                    baseline,
                    ticks_since_check: 0,
                });
                // Stale idle reports must not complete the run before the
                // workers had a chance to wake up
                for status in self.worker_status.iter_mut().flatten() {
                    status.is_idle = false;
                }
                self.broadcast_start().await;
            }
            ExecutionMode::ContinuousAsynchronous => {
                self.broadcast_start().await;
                let statistics = self.gather_statistics(baseline).await;
                let information = ExecutionInformation {
                    execution_id,
                    mode: config.mode,
                    started_at,
                    duration: started_instant.elapsed(),
                    termination_reason: TerminationReason::Ongoing,
                    statistics,
                };
                let _ = reply.send(Ok(information));
            }
            ExecutionMode::Interactive => {
                let statistics = self.gather_statistics(baseline).await;
                let information = ExecutionInformation {
                    execution_id,
                    mode: config.mode,
                    started_at,
                    duration: started_instant.elapsed(),
                    termination_reason: TerminationReason::Paused,
                    statistics,
                };
                let _ = reply.send(Ok(information));
            }
        }
    }

    async fn finish_active_run(&mut self, reason: TerminationReason) {
        let Some(run) = self.active_run.take() else {
            return;
        };
        self.active_termination = None;
        self.broadcast_pause().await;
        let statistics = self.gather_statistics(run.baseline).await;
        let information = ExecutionInformation {
            execution_id: run.execution_id,
            mode: run.mode,
            started_at: run.started_at,
            duration: run.started_instant.elapsed(),
            termination_reason: reason,
            statistics,
        };
        info!(execution_id = %run.execution_id, reason = ?reason, "execution finished");
        if run.reply.send(Ok(information)).is_err() {
            debug!("execute caller went away before completion");
        }
    }

    /// The synchronous protocol: barrier supersteps of signal then collect,
    /// terminating when every worker reports both queues drained
    async fn run_synchronous(&mut self, config: &ExecutionConfig<Id, Signal>) -> TerminationReason {
        let deadline = config.time_limit.map(|limit| Instant::now() + limit);
        let mut supersteps: usize = 0;
        let mut checks_since_aggregation = 0usize;

        loop {
            if let Some(limit) = config.steps_limit {
                if supersteps >= limit {
                    info!(supersteps, "steps limit reached");
                    return TerminationReason::Paused;
                }
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return TerminationReason::TimeLimitReached;
            }

            self.broadcast_signal_step().await;
            let all_to_signal_empty = self.broadcast_collect_step().await;
            supersteps += 1;

            if let Some(condition) = &config.global_termination {
                checks_since_aggregation += 1;
                if checks_since_aggregation >= condition.check_interval() {
                    checks_since_aggregation = 0;
                    let value = self.run_aggregation(condition.operation()).await;
                    if condition.is_met(&value) {
                        return TerminationReason::GlobalConstraintMet;
                    }
                }
            }

            // Signals emitted during collect are already enqueued once every
            // collect reply is in, so a convergence probe is race-free here
            if all_to_signal_empty && self.probe_fully_converged().await {
                debug!(supersteps, "synchronous execution converged");
                return TerminationReason::Converged;
            }
        }
    }

    // ------------------------------------------------------------------
    // Worker request broadcasts
    // ------------------------------------------------------------------

    async fn configure_workers(&mut self, config: &ExecutionConfig<Id, Signal>) {
        let signal_threshold = config.signal_threshold;
        let collect_threshold = config.collect_threshold;
        self.broadcast_and_wait(move |_| {
            move |worker: &mut WorkerCore<Id, Signal>| {
                worker.set_thresholds(signal_threshold, collect_threshold);
                worker.recalculate_scores();
                None
            }
        })
        .await;
    }

    async fn broadcast_start(&mut self) {
        self.broadcast_and_wait(|_| {
            |worker: &mut WorkerCore<Id, Signal>| {
                worker.request_start();
                worker.apply_pending_pause();
                None
            }
        })
        .await;
    }

    async fn broadcast_pause(&mut self) {
        self.broadcast_and_wait(|_| {
            |worker: &mut WorkerCore<Id, Signal>| {
                worker.request_pause();
                worker.apply_pending_pause();
                None
            }
        })
        .await;
    }

    async fn broadcast_signal_step(&mut self) {
        self.broadcast_and_wait(|_| {
            |worker: &mut WorkerCore<Id, Signal>| {
                worker.signal_step();
                None
            }
        })
        .await;
    }

    /// Collect step on every worker; true when every `to_signal` stayed empty
    async fn broadcast_collect_step(&mut self) -> bool {
        let replies = self
            .broadcast_and_wait(|_| {
                |worker: &mut WorkerCore<Id, Signal>| {
                    Some(Box::new(worker.collect_step()) as RequestResult)
                }
            })
            .await;
        replies
            .into_iter()
            .all(|payload| payload.downcast::<bool>().map(|b| *b).unwrap_or(false))
    }

    /// True when every worker has both queues empty
    async fn probe_fully_converged(&mut self) -> bool {
        let replies = self
            .broadcast_and_wait(|_| {
                |worker: &mut WorkerCore<Id, Signal>| {
                    Some(Box::new(worker.is_fully_converged()) as RequestResult)
                }
            })
            .await;
        replies
            .into_iter()
            .all(|payload| payload.downcast::<bool>().map(|b| *b).unwrap_or(false))
    }

    async fn baseline_counters(&mut self) -> WorkerOperationCounters {
        self.gather_snapshots()
            .await
            .into_iter()
            .fold(WorkerOperationCounters::default(), |acc, snapshot| {
                acc.combine(snapshot.counters)
            })
    }

    async fn gather_statistics(&mut self, baseline: WorkerOperationCounters) -> ExecutionStatistics {
        let snapshots = self.gather_snapshots().await;
        let totals = snapshots
            .iter()
            .fold(WorkerOperationCounters::default(), |acc, snapshot| {
                acc.combine(snapshot.counters)
            });
        let messages_sent: u64 = snapshots.iter().map(|s| s.messages_sent).sum::<u64>()
            + self.system_counters.counted_sent();
        let messages_received: u64 = snapshots.iter().map(|s| s.messages_received).sum();
        ExecutionStatistics {
            operations: totals.since(baseline),
            messages_sent,
            messages_received,
        }
    }

    async fn gather_snapshots(&mut self) -> Vec<WorkerSnapshot> {
        let replies = self
            .broadcast_and_wait(|_| {
                |worker: &mut WorkerCore<Id, Signal>| {
                    Some(Box::new(worker.snapshot()) as RequestResult)
                }
            })
            .await;
        replies
            .into_iter()
            .filter_map(|payload| payload.downcast::<WorkerSnapshot>().ok().map(|b| *b))
            .collect()
    }

    async fn run_aggregation(
        &mut self,
        operation: Arc<dyn ErasedAggregation<Id, Signal>>,
    ) -> RequestResult {
        let partials = {
            let op = Arc::clone(&operation);
            self.broadcast_and_wait(move |_| {
                let op = Arc::clone(&op);
                move |worker: &mut WorkerCore<Id, Signal>| Some(worker.aggregate(&op))
            })
            .await
        };
        let mut accumulator = operation.neutral();
        for partial in partials {
            accumulator = operation.combine(accumulator, partial);
        }
        accumulator
    }

    /// Send one reply-carrying request per worker and await every answer.
    /// A worker that died during shutdown is logged and skipped.
    async fn broadcast_and_wait<F, C>(&mut self, mut make: F) -> Vec<RequestResult>
    where
        F: FnMut(usize) -> C,
        C: FnOnce(&mut WorkerCore<Id, Signal>) -> Option<RequestResult> + Send + 'static,
    {
        let mut receivers = Vec::with_capacity(self.config.number_of_workers);
        for worker in 0..self.config.number_of_workers {
            let (request, receiver) = Request::with_reply(make(worker));
            self.bus
                .send_to_worker(worker, WorkerMessage::Request(request));
            receivers.push((worker, receiver));
        }
        let mut replies = Vec::with_capacity(receivers.len());
        for (worker, receiver) in receivers {
            match receiver.await {
                Ok(payload) => replies.push(payload),
                Err(_) => warn!(worker, "worker dropped a coordinator request"),
            }
        }
        replies
    }
}
