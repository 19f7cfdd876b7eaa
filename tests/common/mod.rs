//! Shared fixtures for the end-to-end scenarios: PageRank and shortest-path
//! vertices plus a few gathering helpers.
#![allow(dead_code)]

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Once};

use signalgraph::{
    Edge, EdgeId, EdgeList, Graph, GraphEditor, SignalMessage, SignalValue, Vertex,
    VertexToWorkerMapper,
};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Places vertices by id parity/remainder; used when a test needs to pin
/// vertices to specific workers.
#[derive(Debug)]
pub struct ModuloMapper {
    pub workers: usize,
    pub workers_per_node: usize,
}

impl VertexToWorkerMapper<u32> for ModuloMapper {
    fn worker_for(&self, id: &u32) -> usize {
        (*id as usize) % self.workers
    }

    fn node_for(&self, worker_index: usize) -> usize {
        worker_index / self.workers_per_node
    }
}

// ---------------------------------------------------------------------------
// PageRank
// ---------------------------------------------------------------------------

/// PageRank with the classic signal/collect formulation: signal the weighted
/// rank share along outgoing edges, collect the damped sum of the freshest
/// signal per source.
#[derive(Debug)]
pub struct PageRankVertex {
    id: u32,
    pub state: f64,
    last_signaled: f64,
    damping: f64,
    rank_per_source: HashMap<u32, f64>,
    edges: EdgeList<u32>,
}

impl PageRankVertex {
    pub fn new(id: u32) -> Self {
        let damping = 0.85;
        Self {
            id,
            state: 1.0 - damping,
            last_signaled: 0.0,
            damping,
            rank_per_source: HashMap::new(),
            edges: EdgeList::new(),
        }
    }

    pub fn boxed(id: u32) -> Box<dyn Vertex<u32, f64>> {
        Box::new(Self::new(id))
    }

    fn sum_of_out_weights(&self) -> f64 {
        self.edges.iter().map(|edge| edge.weight).sum()
    }
}

impl Vertex<u32, f64> for PageRankVertex {
    fn id(&self) -> &u32 {
        &self.id
    }

    fn execute_signal_operation(&mut self, editor: &mut dyn GraphEditor<u32, f64>) {
        let total = self.sum_of_out_weights();
        if total > 0.0 {
            for edge in self.edges.as_slice().to_vec() {
                editor.send_signal(
                    self.state * edge.weight / total,
                    edge.target,
                    Some(self.id),
                );
            }
        }
        self.last_signaled = self.state;
    }

    fn execute_collect_operation(
        &mut self,
        signals: Vec<SignalMessage<u32, f64>>,
        _editor: &mut dyn GraphEditor<u32, f64>,
    ) {
        for message in signals {
            if let Some(source) = message.source {
                self.rank_per_source.insert(source, message.signal);
            }
        }
        self.state =
            (1.0 - self.damping) + self.damping * self.rank_per_source.values().sum::<f64>();
    }

    fn score_signal(&self) -> f64 {
        (self.state - self.last_signaled).abs()
    }

    fn score_collect(&self, uncollected: &[SignalMessage<u32, f64>]) -> f64 {
        uncollected.len() as f64
    }

    fn add_outgoing_edge(&mut self, edge: Edge<u32>) -> bool {
        self.edges.add(edge)
    }

    fn remove_outgoing_edge(&mut self, edge_id: &EdgeId<u32>) -> bool {
        self.edges.remove(&edge_id.target)
    }

    fn outgoing_edge_count(&self) -> usize {
        self.edges.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Fixed-point reference for PageRank on small graphs, iterated in place.
pub fn reference_pagerank(edges: &[(u32, u32)], vertices: &[u32]) -> BTreeMap<u32, f64> {
    let damping = 0.85;
    let mut out_degree: HashMap<u32, f64> = HashMap::new();
    for (source, _) in edges {
        *out_degree.entry(*source).or_insert(0.0) += 1.0;
    }

    let mut ranks: BTreeMap<u32, f64> =
        vertices.iter().map(|id| (*id, 1.0 - damping)).collect();
    for _ in 0..10_000 {
        let mut next = BTreeMap::new();
        for id in vertices {
            let incoming: f64 = edges
                .iter()
                .filter(|(_, target)| target == id)
                .map(|(source, _)| ranks[source] / out_degree[source])
                .sum();
            next.insert(*id, (1.0 - damping) + damping * incoming);
        }
        let delta: f64 = vertices
            .iter()
            .map(|id| (next[id] - ranks[id]).abs())
            .sum();
        ranks = next;
        if delta < 1e-12 {
            break;
        }
    }
    ranks
}

// ---------------------------------------------------------------------------
// Single-source shortest paths
// ---------------------------------------------------------------------------

/// Single-source shortest paths: the source starts at distance 0, everyone
/// else unknown; signals carry the candidate distance through each edge.
#[derive(Debug)]
pub struct PathVertex {
    id: u32,
    pub state: Option<u64>,
    last_signaled: Option<u64>,
    edges: EdgeList<u32>,
}

impl PathVertex {
    pub fn new(id: u32, initial: Option<u64>) -> Self {
        Self {
            id,
            state: initial,
            last_signaled: None,
            edges: EdgeList::new(),
        }
    }

    pub fn source(id: u32) -> Box<dyn Vertex<u32, u64>> {
        Box::new(Self::new(id, Some(0)))
    }

    pub fn unreached(id: u32) -> Box<dyn Vertex<u32, u64>> {
        Box::new(Self::new(id, None))
    }
}

impl Vertex<u32, u64> for PathVertex {
    fn id(&self) -> &u32 {
        &self.id
    }

    fn execute_signal_operation(&mut self, editor: &mut dyn GraphEditor<u32, u64>) {
        if let Some(distance) = self.state {
            for edge in self.edges.as_slice().to_vec() {
                editor.send_signal(distance + edge.weight as u64, edge.target, Some(self.id));
            }
        }
        self.last_signaled = self.state;
    }

    fn execute_collect_operation(
        &mut self,
        signals: Vec<SignalMessage<u32, u64>>,
        _editor: &mut dyn GraphEditor<u32, u64>,
    ) {
        for message in signals {
            self.state = Some(match self.state {
                Some(current) => current.min(message.signal),
                None => message.signal,
            });
        }
    }

    fn score_signal(&self) -> f64 {
        if self.state == self.last_signaled {
            0.0
        } else {
            1.0
        }
    }

    fn score_collect(&self, uncollected: &[SignalMessage<u32, u64>]) -> f64 {
        uncollected.len() as f64
    }

    fn add_outgoing_edge(&mut self, edge: Edge<u32>) -> bool {
        self.edges.add(edge)
    }

    fn remove_outgoing_edge(&mut self, edge_id: &EdgeId<u32>) -> bool {
        self.edges.remove(&edge_id.target)
    }

    fn outgoing_edge_count(&self) -> usize {
        self.edges.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Gathering helpers
// ---------------------------------------------------------------------------

/// Collect a value out of every vertex into an ordered map.
pub async fn gather<Signal, T>(
    graph: &Graph<u32, Signal>,
    extract: impl Fn(&dyn Vertex<u32, Signal>) -> Option<(u32, T)> + Send + Sync + 'static,
) -> BTreeMap<u32, T>
where
    Signal: SignalValue,
    T: Clone + Send + 'static,
{
    let gathered = Arc::new(Mutex::new(BTreeMap::new()));
    let sink = Arc::clone(&gathered);
    graph
        .for_each_vertex(Arc::new(move |vertex| {
            if let Some((id, value)) = extract(vertex) {
                sink.lock().expect("gather lock").insert(id, value);
            }
        }))
        .await
        .expect("for_each_vertex");
    let guard = gathered.lock().expect("gather lock");
    guard.clone()
}

pub async fn pagerank_states(graph: &Graph<u32, f64>) -> BTreeMap<u32, f64> {
    gather(graph, |vertex| {
        vertex
            .as_any()
            .downcast_ref::<PageRankVertex>()
            .map(|v| (*v.id(), v.state))
    })
    .await
}

pub async fn path_states(graph: &Graph<u32, u64>) -> BTreeMap<u32, Option<u64>> {
    gather(graph, |vertex| {
        vertex
            .as_any()
            .downcast_ref::<PathVertex>()
            .map(|v| (*v.id(), v.state))
    })
    .await
}
