use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use shardgate::core::pool::ConnectionPool;
use shardgate::directory::metadata::{ChunkEntry, CollectionEntry, DatabaseEntry};
use shardgate::{
    ClusterMetadata, FailureDetector, Filter, InMemoryMetadataStore, KeyBound, MemoryCluster,
    PartitionDirectory, Router, ShardId, ShardInfo,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

const NAMESPACE: &str = "bench.items";

/// One chunk per shard, split evenly over `0..shard_count * 1000`
fn metadata(shard_count: usize) -> ClusterMetadata {
    let ids: Vec<ShardId> = (0..shard_count)
        .map(|i| ShardId::new(format!("shard{:04}", i)))
        .collect();
    let chunks = ids
        .iter()
        .enumerate()
        .map(|(i, id)| ChunkEntry {
            min: if i == 0 {
                KeyBound::MinKey
            } else {
                KeyBound::Value(i as i64 * 1000)
            },
            max: if i + 1 == shard_count {
                KeyBound::MaxKey
            } else {
                KeyBound::Value((i as i64 + 1) * 1000)
            },
            shard: id.clone(),
        })
        .collect();

    ClusterMetadata {
        version: 1,
        shards: ids
            .iter()
            .map(|id| ShardInfo::new(id.clone(), format!("memory://{}", id)))
            .collect(),
        databases: vec![DatabaseEntry {
            name: "bench".to_string(),
            primary: ids[0].clone(),
        }],
        collections: vec![CollectionEntry {
            namespace: NAMESPACE.to_string(),
            shard_key: "_id".to_string(),
            chunks,
        }],
    }
}

async fn router(shard_count: usize, latency: Duration) -> Router {
    let cluster = MemoryCluster::new();
    for i in 0..shard_count {
        let shard = cluster.add_shard(ShardId::new(format!("shard{:04}", i))).await;
        shard.set_latency(latency);
    }
    let pool = ConnectionPool::new(
        Arc::new(cluster),
        Arc::new(FailureDetector::new()),
        Duration::from_secs(1),
        Duration::from_secs(60),
    );
    let store = Arc::new(InMemoryMetadataStore::with_metadata(metadata(shard_count)));
    let router = Router::new(
        Arc::new(PartitionDirectory::new(store)),
        Arc::new(pool),
        Duration::from_secs(1),
    );
    router.refresh().await.unwrap();
    router
}

/// Fan-out reads: with per-shard latency the cost should track one shard,
/// not the sum over shards
fn bench_fan_out_read(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("fan_out_read");

    for shard_count in [1, 4, 16].iter() {
        let router = rt.block_on(router(*shard_count, Duration::from_millis(1)));
        let session = rt.block_on(async {
            let session = router.open_session().await;
            for i in 0..*shard_count {
                let doc = json!({"_id": i as i64 * 1000}).as_object().cloned().unwrap();
                router.route_write(&session, NAMESPACE, doc).await.unwrap();
            }
            session
        });

        group.bench_with_input(
            BenchmarkId::new("all_shards", shard_count),
            shard_count,
            |b, _| {
                b.to_async(&rt).iter(|| async {
                    let result = router
                        .route_read(&session, NAMESPACE, &Filter::All)
                        .await
                        .unwrap();
                    black_box(result);
                });
            },
        );
    }

    group.finish();
}

/// Write then ask for its acknowledgment on a warm session
fn bench_write_ack(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let router = rt.block_on(router(4, Duration::ZERO));
    let session = rt.block_on(router.open_session());
    let mut next_id: i64 = 0;

    c.bench_function("write_then_ack", |b| {
        b.to_async(&rt).iter(|| {
            next_id += 1;
            let doc = json!({"_id": next_id % 4000}).as_object().cloned().unwrap();
            let router = &router;
            let session = &session;
            async move {
                router.route_write(session, NAMESPACE, doc).await.unwrap();
                black_box(router.ack_last_write(session).await.unwrap());
            }
        });
    });
}

/// Session open and close through the pool
fn bench_session_lifecycle(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let router = rt.block_on(router(4, Duration::ZERO));

    c.bench_function("open_close_session", |b| {
        b.to_async(&rt).iter(|| async {
            let session = router.open_session().await;
            black_box(router.close_session(&session).await);
        });
    });
}

criterion_group!(
    benches,
    bench_fan_out_read,
    bench_write_ack,
    bench_session_lifecycle
);

criterion_main!(benches);
