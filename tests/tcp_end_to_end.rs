use serde_json::json;
use shardgate::config::Config;
use shardgate::transport::store::ShardStore;
use shardgate::health::HealthStatus;
use shardgate::{
    Filter, Router, RouterError, ShardId, ShardServer, TcpShardConnector, WriteOutcome,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

async fn start_shard() -> (SocketAddr, JoinHandle<()>) {
    let server = ShardServer::new(Arc::new(ShardStore::new()));
    let listener = server.bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (addr, handle)
}

fn router_for(shard0: SocketAddr, shard1: SocketAddr) -> Router {
    let mut config = Config::example();
    config.metadata.shards[0].endpoint = shard0.to_string();
    config.metadata.shards[1].endpoint = shard1.to_string();
    config.router.connect_timeout_ms = 500;
    config.router.operation_timeout_ms = 500;
    assert!(config.validate().is_ok());

    Router::from_config(&config, Arc::new(TcpShardConnector::new(Duration::from_secs(5))))
}

#[tokio::test]
async fn routes_reads_and_writes_over_tcp() {
    let (addr0, _shard0) = start_shard().await;
    let (addr1, _shard1) = start_shard().await;
    let router = router_for(addr0, addr1);
    router.refresh().await.unwrap();
    let session = router.open_session().await;

    for id in [-2, 2, -1, 1] {
        let document = json!({"_id": id}).as_object().cloned().unwrap();
        router
            .route_write(&session, "fooSharded.barSharded", document)
            .await
            .unwrap();
        assert_eq!(
            router.ack_last_write(&session).await.unwrap(),
            WriteOutcome::Success
        );
    }

    let result = router
        .route_read(&session, "fooSharded.barSharded", &Filter::All)
        .await
        .unwrap();
    let keys: Vec<i64> = result
        .documents
        .iter()
        .filter_map(|d| d["_id"].as_i64())
        .collect();
    assert_eq!(keys, vec![-2, -1, 1, 2]);
    assert_eq!(router.pool().connection_count(&session).await, 2);

    // Duplicate key on the same connection
    let duplicate = json!({"_id": 1}).as_object().cloned().unwrap();
    router
        .route_write(&session, "fooSharded.barSharded", duplicate)
        .await
        .unwrap();
    assert!(matches!(
        router.ack_last_write(&session).await.unwrap(),
        WriteOutcome::ExplicitError { .. }
    ));
}

#[tokio::test]
async fn killed_shard_over_tcp_never_acknowledges_success() {
    let (addr0, _shard0) = start_shard().await;
    let (addr1, shard1) = start_shard().await;
    let router = router_for(addr0, addr1);
    router.refresh().await.unwrap();

    let active = router.open_session().await;
    let document = json!({"_id": 5}).as_object().cloned().unwrap();
    router
        .route_write(&active, "fooSharded.barSharded", document)
        .await
        .unwrap();
    assert!(router.ack_last_write(&active).await.unwrap().is_success());

    shard1.abort();
    let _ = shard1.await;
    let fresh = router.open_session().await;

    for (session, lower_key) in [(&active, -6), (&fresh, -7)] {
        let document = json!({"_id": 6}).as_object().cloned().unwrap();
        let _ = router
            .route_write(session, "fooSharded.barSharded", document)
            .await;
        let outcome = router.ack_last_write(session).await.unwrap();
        assert!(!outcome.is_success(), "acknowledged as {}", outcome);

        let lower = json!({"_id": lower_key}).as_object().cloned().unwrap();
        router
            .route_write(session, "fooSharded.barSharded", lower)
            .await
            .unwrap();
        assert!(router.ack_last_write(session).await.unwrap().is_success());

        let result = router
            .route_read(session, "fooSharded.barSharded", &Filter::All)
            .await
            .unwrap();
        assert!(result.is_partial());
        assert_eq!(result.failed_shards(), vec![&ShardId::new("shard0001")]);
    }

    let unsharded = json!({"_id": 1}).as_object().cloned().unwrap();
    router
        .route_write(&fresh, "fooUnsharded.barUnsharded", unsharded)
        .await
        .unwrap();
    assert!(router.ack_last_write(&fresh).await.unwrap().is_success());
}

#[tokio::test]
async fn oversized_write_is_refused_without_faulting_the_shard() {
    let (addr0, _shard0) = start_shard().await;
    let (addr1, _shard1) = start_shard().await;
    let router = router_for(addr0, addr1);
    router.refresh().await.unwrap();
    let session = router.open_session().await;

    let small = json!({"_id": 1}).as_object().cloned().unwrap();
    router
        .route_write(&session, "fooSharded.barSharded", small)
        .await
        .unwrap();
    assert!(router.ack_last_write(&session).await.unwrap().is_success());

    let padding = "x".repeat(17 * 1024 * 1024);
    let huge = json!({"_id": 2, "padding": padding}).as_object().cloned().unwrap();
    let err = router
        .route_write(&session, "fooSharded.barSharded", huge)
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::InvalidDocument { .. }), "got {}", err);
    assert!(matches!(
        router.ack_last_write(&session).await.unwrap(),
        WriteOutcome::ExplicitError { .. }
    ));

    let shard1 = ShardId::new("shard0001");
    let health = router.shard_health().await;
    let status = health
        .iter()
        .find(|(id, _)| id == &shard1)
        .map(|(_, h)| h.status.clone());
    assert_eq!(status, Some(HealthStatus::Healthy));

    // Same link, still in sync
    let next = json!({"_id": 3}).as_object().cloned().unwrap();
    router
        .route_write(&session, "fooSharded.barSharded", next)
        .await
        .unwrap();
    assert!(router.ack_last_write(&session).await.unwrap().is_success());
    assert_eq!(router.pool().connection_count(&session).await, 1);
}
