//! The graph editing surface handed to algorithm code
//!
//! Vertex callbacks receive a `&mut dyn GraphEditor` instead of direct access
//! to stores or channels: every mutation and signal is routed through the
//! message bus to the owning worker, so a callback can freely edit parts of
//! the graph it does not own.

use crate::vertex::{BoxedVertex, Edge, EdgeId, SignalValue, VertexId};

/// Operations available to algorithm code, from vertex callbacks and from
/// the graph facade alike.
///
/// All operations are asynchronous at-most-once deliveries: they are routed
/// to the owning worker and applied there, in per-sender FIFO order.
pub trait GraphEditor<Id, Signal>
where
    Id: VertexId,
    Signal: SignalValue,
{
    /// Send a signal to the target vertex
    fn send_signal(&mut self, signal: Signal, target: Id, source: Option<Id>);

    /// Add a vertex; ignored with a warning if the id already exists
    fn add_vertex(&mut self, vertex: BoxedVertex<Id, Signal>);

    /// Add an outgoing edge to the source vertex
    fn add_edge(&mut self, source: Id, edge: Edge<Id>);

    /// Remove a vertex; ignored with a warning if absent
    fn remove_vertex(&mut self, id: Id);

    /// Remove the edge with the given endpoints
    fn remove_edge(&mut self, edge_id: EdgeId<Id>);
}
