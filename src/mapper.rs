//! Vertex-to-worker placement
//!
//! A mapper turns a vertex id into the index of its owning worker, and a
//! worker index into the index of the node hosting it. The mapping must be
//! stable for the lifetime of the graph: a vertex id hashes to exactly one
//! worker, always.

use std::hash::{Hash, Hasher};

use crate::vertex::VertexId;

/// Deterministic vertex placement across workers and nodes.
pub trait VertexToWorkerMapper<Id: VertexId>: Send + Sync {
    /// Index of the worker owning the given vertex id
    fn worker_for(&self, id: &Id) -> usize;

    /// Index of the node hosting the given worker
    fn node_for(&self, worker_index: usize) -> usize;
}

/// Default placement: `hash(id) % number_of_workers`, with
/// `worker / workers_per_node` for the node index.
///
/// Uses `DefaultHasher::new()` with its fixed keys, so placement is
/// reproducible across runs of the same binary.
#[derive(Debug, Clone)]
pub struct DefaultVertexMapper {
    number_of_workers: usize,
    workers_per_node: usize,
}

impl DefaultVertexMapper {
    pub fn new(number_of_workers: usize, workers_per_node: usize) -> Self {
        debug_assert!(number_of_workers > 0);
        debug_assert!(workers_per_node > 0);
        Self {
            number_of_workers,
            workers_per_node,
        }
    }

    pub fn number_of_workers(&self) -> usize {
        self.number_of_workers
    }
}

impl<Id: VertexId> VertexToWorkerMapper<Id> for DefaultVertexMapper {
    fn worker_for(&self, id: &Id) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() % self.number_of_workers as u64) as usize
    }

    fn node_for(&self, worker_index: usize) -> usize {
        worker_index / self.workers_per_node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_is_stable() {
        let mapper = DefaultVertexMapper::new(4, 2);
        for id in 0u32..100 {
            let first: usize = VertexToWorkerMapper::worker_for(&mapper, &id);
            let second: usize = VertexToWorkerMapper::worker_for(&mapper, &id);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_mapping_in_range() {
        let mapper = DefaultVertexMapper::new(3, 3);
        for id in 0u64..1000 {
            let worker: usize = VertexToWorkerMapper::worker_for(&mapper, &id);
            assert!(worker < 3);
        }
    }

    #[test]
    fn test_node_for() {
        let mapper = DefaultVertexMapper::new(6, 2);
        let node_of = |w| VertexToWorkerMapper::<u32>::node_for(&mapper, w);
        assert_eq!(node_of(0), 0);
        assert_eq!(node_of(1), 0);
        assert_eq!(node_of(2), 1);
        assert_eq!(node_of(5), 2);
    }

    #[test]
    fn test_single_worker_takes_everything() {
        let mapper = DefaultVertexMapper::new(1, 1);
        for id in ["a", "b", "c"] {
            let worker: usize = VertexToWorkerMapper::worker_for(&mapper, &id);
            assert_eq!(worker, 0);
        }
    }
}
