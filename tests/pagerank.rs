//! PageRank end-to-end: a three-vertex cycle converges to the analytic
//! fixed point in both asynchronous and synchronous modes.

mod common;

use std::time::Duration;

use signalgraph::{
    Edge, ExecutionConfig, GraphBuilder, GraphConfig, GraphEditor, TerminationReason,
};

use common::{pagerank_states, reference_pagerank, PageRankVertex};

const EDGES: [(u32, u32); 4] = [(1, 2), (2, 1), (2, 3), (3, 2)];
const VERTICES: [u32; 3] = [1, 2, 3];

async fn build_cycle(workers: usize) -> signalgraph::Graph<u32, f64> {
    let mut graph = GraphBuilder::new()
        .with_config(
            GraphConfig::new()
                .with_workers(workers)
                .with_heartbeat_interval(Duration::from_millis(25)),
        )
        .build()
        .await
        .expect("graph builds");

    for id in VERTICES {
        graph.add_vertex(PageRankVertex::boxed(id));
    }
    for (source, target) in EDGES {
        graph.add_edge(source, Edge::unit(target));
    }
    graph
}

fn assert_close_to_reference(states: &std::collections::BTreeMap<u32, f64>) {
    let expected = reference_pagerank(&EDGES, &VERTICES);
    assert_eq!(states.len(), VERTICES.len());
    for id in VERTICES {
        let actual = states[&id];
        let reference = expected[&id];
        assert!(
            (actual - reference).abs() < 0.02,
            "vertex {id}: engine {actual} vs reference {reference}"
        );
    }
    let total: f64 = states.values().sum();
    let expected_total: f64 = expected.values().sum();
    assert!((total - expected_total).abs() < 0.05);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pagerank_converges_asynchronously() {
    common::init_tracing();
    let mut graph = build_cycle(2).await;

    let information = graph
        .execute(ExecutionConfig::default().with_signal_threshold(0.001))
        .await
        .expect("execution succeeds");

    assert_eq!(
        information.termination_reason,
        TerminationReason::Converged
    );
    assert!(information.statistics.operations.signal_operations_executed > 0);
    assert!(information.statistics.operations.collect_operations_executed > 0);

    let states = pagerank_states(&graph).await;
    assert_close_to_reference(&states);

    graph.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pagerank_converges_synchronously() {
    common::init_tracing();
    let mut graph = build_cycle(2).await;

    let information = graph
        .execute(ExecutionConfig::synchronous().with_signal_threshold(0.001))
        .await
        .expect("execution succeeds");

    assert_eq!(
        information.termination_reason,
        TerminationReason::Converged
    );

    let states = pagerank_states(&graph).await;
    assert_close_to_reference(&states);

    graph.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pagerank_single_worker_matches_partitioned() {
    common::init_tracing();

    let mut single = build_cycle(1).await;
    single
        .execute(ExecutionConfig::default())
        .await
        .expect("single-worker execution");
    let single_states = pagerank_states(&single).await;
    single.shutdown().await.expect("shutdown");

    let mut partitioned = build_cycle(3).await;
    partitioned
        .execute(ExecutionConfig::default())
        .await
        .expect("partitioned execution");
    let partitioned_states = pagerank_states(&partitioned).await;
    partitioned.shutdown().await.expect("shutdown");

    for id in VERTICES {
        assert!(
            (single_states[&id] - partitioned_states[&id]).abs() < 0.03,
            "vertex {id} diverges across partitionings"
        );
    }
}
