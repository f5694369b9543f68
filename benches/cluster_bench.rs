use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nexa_orchestrator::cluster::{ClusterOrchestrator, LocalNetwork, SessionConfig};
use nexa_orchestrator::config::ClusterConfig;
use tokio::runtime::Runtime;

async fn two_node_cluster() -> Vec<ClusterOrchestrator> {
    let network = LocalNetwork::new();
    let mut nodes: Vec<ClusterOrchestrator> = Vec::new();
    for (i, id) in ["bench-a", "bench-b"].iter().enumerate() {
        let mut config = ClusterConfig::for_node(*id, "127.0.0.1", 7800 + i as u16);
        config.max_sessions = 1_000_000;
        if let Some(first) = nodes.first() {
            config.seeds = vec![first.address().to_string()];
        }
        let node = ClusterOrchestrator::in_memory(config, network.clone()).unwrap();
        node.start().await.unwrap();
        nodes.push(node);
    }
    for node in &nodes {
        node.gossip_round().await;
    }
    nodes
}

pub fn cluster_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("cluster");
    let rt = Runtime::new().unwrap();
    let nodes = rt.block_on(two_node_cluster());

    group.bench_function("create_session", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(
                    nodes[0]
                        .create_session(SessionConfig::new("agent", "bench"))
                        .await
                        .unwrap(),
                );
            });
        })
    });

    let id = rt
        .block_on(nodes[0].create_session(SessionConfig::new("agent", "read")))
        .unwrap()
        .id;
    group.bench_function("get_session", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(nodes[1].get_session(&id).await.unwrap());
            });
        })
    });

    group.bench_function("cluster_metrics", |b| {
        b.iter(|| black_box(nodes[0].get_cluster_metrics()))
    });

    group.finish();
    rt.block_on(async {
        for node in &nodes {
            node.halt().await;
        }
    });
}

criterion_group!(benches, cluster_benchmark);
criterion_main!(benches);
