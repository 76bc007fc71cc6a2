//! Replication failures, term changes and cancellation.

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::testing::{init_tracing, wait_until, SimCluster};
    use crate::types::CacheOperation;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    async fn slow_retry_cluster() -> Arc<SimCluster> {
        init_tracing();
        Arc::new(
            SimCluster::start_with(3, |mut config| {
                config.replication.retry_backoff = Duration::from_millis(300);
                config
            })
            .await,
        )
    }

    #[tokio::test]
    async fn test_failed_replication_rolls_back_then_retries() {
        let cluster = slow_retry_cluster().await;
        cluster.leader().set("k", b"A".to_vec(), None, &cancel()).await.unwrap();
        cluster.leader().faults.fail_next(1);

        let writer = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                cluster
                    .leader()
                    .set("k", b"B".to_vec(), None, &CancellationToken::new())
                    .await
            })
        };

        let metrics = cluster.leader().metrics().clone();
        assert!(wait_until(|| metrics.rollbacks.get() >= 1, Duration::from_secs(2)).await);

        // During the backoff the local store holds the pre-write value
        assert_eq!(
            cluster.leader().get("k", &cancel()).await.unwrap(),
            Some(Bytes::from("A"))
        );

        writer.await.unwrap().unwrap();
        for node in &cluster.nodes {
            assert_eq!(node.get("k", &cancel()).await.unwrap(), Some(Bytes::from("B")));
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rollbacks, 1);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(metrics.writes.get(&CacheOperation::Update.to_string()), 2);

        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_rollback_of_new_key_leaves_it_absent() {
        let cluster = slow_retry_cluster().await;
        cluster.leader().faults.fail_next(1);

        let writer = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                cluster
                    .node(1)
                    .set("fresh", b"v".to_vec(), None, &CancellationToken::new())
                    .await
            })
        };

        let metrics = cluster.leader().metrics().clone();
        assert!(wait_until(|| metrics.rollbacks.get() >= 1, Duration::from_secs(2)).await);
        assert_eq!(cluster.leader().get("fresh", &cancel()).await.unwrap(), None);

        writer.await.unwrap().unwrap();
        assert_eq!(
            cluster.node(1).get("fresh", &cancel()).await.unwrap(),
            Some(Bytes::from("v"))
        );

        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_dropped_tail_does_not_lose_other_key() {
        init_tracing();
        let cluster = Arc::new(SimCluster::start(3).await);
        let leader = cluster.leader();
        leader.faults.set_delay(Some(Duration::from_millis(50)));
        leader.faults.fail_next(1);

        let spawn_set = |key: &'static str, value: &'static str| {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                cluster
                    .leader()
                    .set(key, value.as_bytes().to_vec(), None, &CancellationToken::new())
                    .await
            })
        };

        // "a" appends first and takes the injected failure; its rollback
        // drops the tail holding "b"
        let writer_a = spawn_set("a", "A");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let writer_b = spawn_set("b", "B");

        let metrics = leader.metrics().clone();
        assert!(wait_until(|| metrics.rollbacks.get() >= 1, Duration::from_secs(2)).await);
        writer_a.await.unwrap().unwrap();

        // Later writes reuse the dropped indexes
        leader.set("c", b"C".to_vec(), None, &cancel()).await.unwrap();
        leader.set("d", b"D".to_vec(), None, &cancel()).await.unwrap();
        writer_b.await.unwrap().unwrap();

        for node in &cluster.nodes {
            for (key, value) in [("a", "A"), ("b", "B"), ("c", "C"), ("d", "D")] {
                assert_eq!(
                    node.get(key, &cancel()).await.unwrap(),
                    Some(Bytes::from(value)),
                    "{key} on {}",
                    node.endpoint()
                );
            }
        }
        assert_eq!(leader.log.last_index(), leader.log.commit_index());
        assert!(metrics.snapshot().retries >= 1);

        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_term_change_during_replication_retries() {
        let cluster = SimCluster::start(3).await;
        let leader = cluster.leader();
        assert_eq!(cluster.term(), 1);

        leader.faults.change_term_next(1);
        leader.set("k", b"v".to_vec(), None, &cancel()).await.unwrap();

        assert_eq!(cluster.term(), 2);
        assert_eq!(leader.metrics().snapshot().rollbacks, 1);
        assert_eq!(leader.status().term, 2);

        // Only the retried entry is in the log
        assert_eq!(leader.log.last_index(), leader.log.commit_index());
        for node in &cluster.nodes {
            assert_eq!(node.get("k", &cancel()).await.unwrap(), Some(Bytes::from("v")));
        }

        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_cancellation_after_local_mutation_rolls_back() {
        let cluster = Arc::new(SimCluster::start(3).await);
        cluster.leader().set("k", b"A".to_vec(), None, &cancel()).await.unwrap();
        let committed = cluster.leader().log.commit_index();
        cluster.leader().faults.set_hang(true);

        let token = CancellationToken::new();
        let writer = {
            let cluster = cluster.clone();
            let token = token.clone();
            tokio::spawn(async move {
                cluster
                    .leader()
                    .set("k", b"B".to_vec(), None, &token)
                    .await
            })
        };

        let faults = cluster.leader().faults.clone();
        assert!(wait_until(|| faults.replications() >= 2, Duration::from_secs(1)).await);

        // The change is applied locally while replication is pending
        assert_eq!(
            cluster.leader().cache().peek("k").await.map(|e| e.value),
            Some(Bytes::from("B"))
        );

        token.cancel();
        let result = writer.await.unwrap();
        match result {
            Err(Error::Change { operation, key, term, last_index, source }) => {
                assert!(source.is_cancelled());
                assert_eq!(operation, "Update");
                assert_eq!(key, "k");
                assert_eq!(term, 1);
                assert_eq!(last_index, committed + 1);
            }
            other => panic!("expected a cancelled change, got {other:?}"),
        }

        cluster.leader().faults.set_hang(false);
        assert_eq!(
            cluster.leader().get("k", &cancel()).await.unwrap(),
            Some(Bytes::from("A"))
        );
        assert_eq!(cluster.leader().log.last_index(), committed);
        assert_eq!(cluster.leader().metrics().snapshot().rollbacks, 1);
        assert_eq!(cluster.leader().metrics().snapshot().cancelled, 1);

        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_leader_rejection_surfaces_to_caller() {
        let cluster = SimCluster::start(3).await;

        // A leader that is shutting down answers with an error text
        cluster.leader().cache().shutdown().await;

        let result = cluster
            .node(1)
            .set("k", b"v".to_vec(), None, &cancel())
            .await;
        match result.as_ref().map_err(Error::root) {
            Err(Error::Redirection { operation, key, reply }) => {
                assert_eq!(operation, "Update");
                assert_eq!(key, "k");
                assert!(reply.starts_with("Unexpected error while processing the request"));
            }
            other => panic!("expected a redirection error, got {other:?}"),
        }
        assert_eq!(cluster.node(1).get("k", &cancel()).await.unwrap(), None);

        cluster.stop().await;
    }
}
