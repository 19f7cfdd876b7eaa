//! Message and status types exchanged between actors
//!
//! Signals carry algorithm payloads between vertices. Requests carry
//! function-like commands evaluated on the receiving actor, optionally with
//! a reply channel. Status messages flow upward from workers through nodes
//! to the coordinator, which uses them for convergence detection.

use std::any::Any;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::vertex::EdgeId;

/// A signal in flight: payload plus addressing.
///
/// The source is optional so external injectors can stay anonymous; the
/// edge id is populated only by senders that signal along a concrete edge.
#[derive(Debug, Clone)]
pub struct SignalMessage<Id, Signal> {
    pub source: Option<Id>,
    pub target: Id,
    pub edge_id: Option<EdgeId<Id>>,
    pub signal: Signal,
}

impl<Id, Signal> SignalMessage<Id, Signal> {
    /// Create an anonymous signal
    pub fn new(target: Id, signal: Signal) -> Self {
        Self {
            source: None,
            target,
            edge_id: None,
            signal,
        }
    }

    /// Create a signal attributed to a source vertex
    pub fn from_source(source: Id, target: Id, signal: Signal) -> Self {
        Self {
            source: Some(source),
            target,
            edge_id: None,
            signal,
        }
    }
}

/// Result payload of an evaluated request.
///
/// A command that produces nothing replies with a boxed unit, so transports
/// never have to represent "null".
pub type RequestResult = Box<dyn Any + Send>;

/// A control message carrying a command evaluated on the receiving actor.
///
/// `counted` marks the request as part of the user-visible message flow:
/// counted requests participate in the send/receive conservation invariant,
/// while engine-internal control traffic is elided on both sides.
pub struct Request<C> {
    pub command: Box<dyn FnOnce(&mut C) -> Option<RequestResult> + Send>,
    pub reply: Option<oneshot::Sender<RequestResult>>,
    pub counted: bool,
}

impl<C> Request<C> {
    /// A fire-and-forget request that is part of the counted message flow
    pub fn counted(
        command: impl FnOnce(&mut C) -> Option<RequestResult> + Send + 'static,
    ) -> Self {
        Self {
            command: Box::new(command),
            reply: None,
            counted: true,
        }
    }

    /// An uncounted fire-and-forget control request
    pub fn control(
        command: impl FnOnce(&mut C) -> Option<RequestResult> + Send + 'static,
    ) -> Self {
        Self {
            command: Box::new(command),
            reply: None,
            counted: false,
        }
    }

    /// An uncounted request that expects an answer
    pub fn with_reply(
        command: impl FnOnce(&mut C) -> Option<RequestResult> + Send + 'static,
    ) -> (Self, oneshot::Receiver<RequestResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command: Box::new(command),
                reply: Some(tx),
                counted: false,
            },
            rx,
        )
    }
}

impl<C> std::fmt::Debug for Request<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("reply", &self.reply.is_some())
            .field("counted", &self.counted)
            .finish()
    }
}

/// Periodic coordinator broadcast used for throttling decisions.
///
/// Carries a monotonic send stamp and the coordinator's view of the global
/// inbox (total messages sent minus total received across the system).
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    pub sent_at: Instant,
    pub global_inbox_size: u64,
}

impl Heartbeat {
    pub fn new(global_inbox_size: u64) -> Self {
        Self {
            sent_at: Instant::now(),
            global_inbox_size,
        }
    }
}

/// A worker's self-reported state, published on every idle edge and on
/// every heartbeat receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: usize,
    pub is_idle: bool,
    pub is_paused: bool,
    pub messages_sent: u64,
    pub messages_received: u64,
}

impl WorkerStatus {
    /// Monotone freshness measure; counters only grow per worker
    pub fn freshness(&self) -> u64 {
        self.messages_sent + self.messages_received
    }

    /// Whether this snapshot supersedes `other`.
    ///
    /// Ties are accepted so idle-edge flips that change no counter still
    /// replace the stored snapshot.
    pub fn is_newer_than(&self, other: &WorkerStatus) -> bool {
        self.freshness() >= other.freshness()
    }
}

/// Per-destination-class send counters of one node's bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessagesStats {
    pub to_workers: u64,
    pub to_nodes: u64,
    pub to_coordinator: u64,
    pub to_others: u64,
}

impl SentMessagesStats {
    pub fn total(&self) -> u64 {
        self.to_workers + self.to_nodes + self.to_coordinator + self.to_others
    }
}

/// A node's self-reported state, emitted when all hosted workers are idle
/// and on every heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: usize,
    pub messages_sent: SentMessagesStats,
    pub messages_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_message_constructors() {
        let anon = SignalMessage::new(4u32, 1.5f64);
        assert!(anon.source.is_none());
        assert_eq!(anon.target, 4);

        let attributed = SignalMessage::from_source(1u32, 4u32, 1.5f64);
        assert_eq!(attributed.source, Some(1));
    }

    #[test]
    fn test_status_freshness() {
        let old = WorkerStatus {
            worker_id: 0,
            is_idle: false,
            is_paused: false,
            messages_sent: 10,
            messages_received: 5,
        };
        let newer = WorkerStatus {
            messages_received: 6,
            ..old
        };
        let tie = WorkerStatus { is_idle: true, ..old };

        assert!(newer.is_newer_than(&old));
        assert!(!old.is_newer_than(&newer));
        // Idle flip with unchanged counters must not be dropped
        assert!(tie.is_newer_than(&old));
    }

    #[test]
    fn test_sent_stats_total() {
        let stats = SentMessagesStats {
            to_workers: 3,
            to_nodes: 2,
            to_coordinator: 1,
            to_others: 4,
        };
        assert_eq!(stats.total(), 10);
    }

    #[test]
    fn test_request_evaluation() {
        struct Core {
            value: i32,
        }
        let mut core = Core { value: 0 };

        let req = Request::counted(|c: &mut Core| {
            c.value += 1;
            None
        });
        assert!(req.counted);
        let result = (req.command)(&mut core);
        assert!(result.is_none());
        assert_eq!(core.value, 1);
    }

    #[tokio::test]
    async fn test_request_with_reply() {
        struct Core;
        let (req, rx) = Request::with_reply(|_c: &mut Core| Some(Box::new(42i32) as RequestResult));
        let result = (req.command)(&mut Core);
        if let Some(tx) = req.reply {
            let payload = result.unwrap_or_else(|| Box::new(()) as RequestResult);
            tx.send(payload).ok();
        }
        let boxed = rx.await.expect("reply");
        assert_eq!(*boxed.downcast::<i32>().expect("i32"), 42);
    }
}
