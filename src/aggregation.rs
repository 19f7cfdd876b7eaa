//! Graph-wide aggregation
//!
//! An aggregation folds a value out of every vertex in the graph: each worker
//! folds over its own shard starting from the neutral element, and the
//! partial results are combined upstream with the same operation. The fold
//! must be commutative and associative across shards, since workers reply
//! in no particular order.

use std::any::Any;
use std::sync::Arc;

use tracing::error;

use crate::vertex::{SignalValue, Vertex, VertexId};

/// A fold over all vertices of the graph.
///
/// # Example
///
/// ```ignore
/// struct SumOfStates;
///
/// impl AggregationOperation<u32, f64> for SumOfStates {
///     type Output = f64;
///
///     fn neutral_element(&self) -> f64 {
///         0.0
///     }
///
///     fn extract(&self, vertex: &dyn Vertex<u32, f64>) -> f64 {
///         vertex.as_any().downcast_ref::<RankVertex>().map_or(0.0, |v| v.state)
///     }
///
///     fn aggregate(&self, a: f64, b: f64) -> f64 {
///         a + b
///     }
/// }
/// ```
pub trait AggregationOperation<Id, Signal>: Send + Sync + 'static
where
    Id: VertexId,
    Signal: SignalValue,
{
    /// The aggregated value type
    type Output: Clone + Send + 'static;

    /// Identity of the aggregation
    fn neutral_element(&self) -> Self::Output;

    /// Value contributed by a single vertex
    fn extract(&self, vertex: &dyn Vertex<Id, Signal>) -> Self::Output;

    /// Combine two partial results
    fn aggregate(&self, a: Self::Output, b: Self::Output) -> Self::Output;
}

/// Type-erased aggregation, so requests can carry any operation through the
/// bus without making the worker generic over the output type. Implemented
/// for every [`AggregationOperation`]; not meant to be implemented directly.
///
/// The boxed values are produced and consumed by the same operation, so the
/// internal downcasts cannot fail by construction; a mismatch is logged and
/// replaced by the neutral element rather than unwinding a worker.
pub trait ErasedAggregation<Id, Signal>: Send + Sync
where
    Id: VertexId,
    Signal: SignalValue,
{
    fn neutral(&self) -> Box<dyn Any + Send>;

    fn fold(
        &self,
        accumulator: Box<dyn Any + Send>,
        vertex: &dyn Vertex<Id, Signal>,
    ) -> Box<dyn Any + Send>;

    fn combine(
        &self,
        a: Box<dyn Any + Send>,
        b: Box<dyn Any + Send>,
    ) -> Box<dyn Any + Send>;
}

impl<Id, Signal, A> ErasedAggregation<Id, Signal> for A
where
    Id: VertexId,
    Signal: SignalValue,
    A: AggregationOperation<Id, Signal>,
{
    fn neutral(&self) -> Box<dyn Any + Send> {
        Box::new(self.neutral_element())
    }

    fn fold(
        &self,
        accumulator: Box<dyn Any + Send>,
        vertex: &dyn Vertex<Id, Signal>,
    ) -> Box<dyn Any + Send> {
        match accumulator.downcast::<A::Output>() {
            Ok(acc) => Box::new(self.aggregate(*acc, self.extract(vertex))),
            Err(_) => {
                error!("aggregation accumulator carried an unexpected type");
                Box::new(self.neutral_element())
            }
        }
    }

    fn combine(&self, a: Box<dyn Any + Send>, b: Box<dyn Any + Send>) -> Box<dyn Any + Send> {
        match (a.downcast::<A::Output>(), b.downcast::<A::Output>()) {
            (Ok(a), Ok(b)) => Box::new(self.aggregate(*a, *b)),
            _ => {
                error!("aggregation partial result carried an unexpected type");
                Box::new(self.neutral_element())
            }
        }
    }
}

/// A user-defined global stop criterion: an aggregation plus a predicate,
/// evaluated every `check_interval` supersteps (synchronous modes) or
/// heartbeats (asynchronous modes).
pub struct GlobalTerminationCondition<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    operation: Arc<dyn ErasedAggregation<Id, Signal>>,
    predicate: Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>,
    check_interval: usize,
}

impl<Id, Signal> GlobalTerminationCondition<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    /// Build a condition from an aggregation and a predicate over its result.
    ///
    /// `check_interval` of 0 is clamped to 1.
    pub fn new<A>(
        operation: Arc<A>,
        check_interval: usize,
        should_terminate: impl Fn(&A::Output) -> bool + Send + Sync + 'static,
    ) -> Self
    where
        A: AggregationOperation<Id, Signal>,
    {
        let predicate = Arc::new(move |value: &dyn Any| {
            value
                .downcast_ref::<A::Output>()
                .map(&should_terminate)
                .unwrap_or(false)
        });
        Self {
            operation,
            predicate,
            check_interval: check_interval.max(1),
        }
    }

    pub(crate) fn operation(&self) -> Arc<dyn ErasedAggregation<Id, Signal>> {
        Arc::clone(&self.operation)
    }

    pub(crate) fn is_met(&self, value: &Box<dyn Any + Send>) -> bool {
        (self.predicate)(value.as_ref())
    }

    pub fn check_interval(&self) -> usize {
        self.check_interval
    }
}

impl<Id, Signal> Clone for GlobalTerminationCondition<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    fn clone(&self) -> Self {
        Self {
            operation: Arc::clone(&self.operation),
            predicate: Arc::clone(&self.predicate),
            check_interval: self.check_interval,
        }
    }
}

impl<Id, Signal> std::fmt::Debug for GlobalTerminationCondition<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalTerminationCondition")
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::GraphEditor;
    use crate::messages::SignalMessage;
    use crate::vertex::{Edge, EdgeId};

    struct CountVertex {
        id: u32,
        count: u64,
    }

    impl Vertex<u32, f64> for CountVertex {
        fn id(&self) -> &u32 {
            &self.id
        }

        fn execute_signal_operation(&mut self, _editor: &mut dyn GraphEditor<u32, f64>) {}

        fn execute_collect_operation(
            &mut self,
            _signals: Vec<SignalMessage<u32, f64>>,
            _editor: &mut dyn GraphEditor<u32, f64>,
        ) {
        }

        fn score_signal(&self) -> f64 {
            0.0
        }

        fn score_collect(&self, _uncollected: &[SignalMessage<u32, f64>]) -> f64 {
            0.0
        }

        fn add_outgoing_edge(&mut self, _edge: Edge<u32>) -> bool {
            false
        }

        fn remove_outgoing_edge(&mut self, _edge_id: &EdgeId<u32>) -> bool {
            false
        }

        fn outgoing_edge_count(&self) -> usize {
            0
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct SumOfCounts;

    impl AggregationOperation<u32, f64> for SumOfCounts {
        type Output = u64;

        fn neutral_element(&self) -> u64 {
            0
        }

        fn extract(&self, vertex: &dyn Vertex<u32, f64>) -> u64 {
            vertex
                .as_any()
                .downcast_ref::<CountVertex>()
                .map_or(0, |v| v.count)
        }

        fn aggregate(&self, a: u64, b: u64) -> u64 {
            a + b
        }
    }

    #[test]
    fn test_erased_fold_and_combine() {
        let op: Arc<dyn ErasedAggregation<u32, f64>> = Arc::new(SumOfCounts);
        let v1 = CountVertex { id: 1, count: 3 };
        let v2 = CountVertex { id: 2, count: 4 };

        let mut acc = op.neutral();
        acc = op.fold(acc, &v1);
        acc = op.fold(acc, &v2);

        let other = op.fold(op.neutral(), &CountVertex { id: 3, count: 10 });
        let combined = op.combine(acc, other);

        assert_eq!(*combined.downcast::<u64>().expect("u64"), 17);
    }

    #[test]
    fn test_termination_condition() {
        let condition =
            GlobalTerminationCondition::new(Arc::new(SumOfCounts), 0, |total: &u64| *total >= 5);
        assert_eq!(condition.check_interval(), 1);

        let below: Box<dyn Any + Send> = Box::new(4u64);
        let above: Box<dyn Any + Send> = Box::new(5u64);
        assert!(!condition.is_met(&below));
        assert!(condition.is_met(&above));
    }

    #[test]
    fn test_termination_condition_wrong_type_is_not_met() {
        let condition =
            GlobalTerminationCondition::new(Arc::new(SumOfCounts), 2, |total: &u64| *total > 0);
        let wrong: Box<dyn Any + Send> = Box::new("not a u64");
        assert!(!condition.is_met(&wrong));
    }
}
