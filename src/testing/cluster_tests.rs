//! Multi-node scenarios over the simulated cluster.

#[cfg(test)]
mod tests {
    use crate::cache::CacheParts;
    use crate::config::StorageConfig;
    use crate::error::Error;
    use crate::testing::{init_tracing, wait_until, SimCluster};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_follower_write_is_redirected_to_leader() {
        init_tracing();
        let cluster = SimCluster::start(3).await;

        cluster
            .node(1)
            .set("k", b"A".to_vec(), None, &cancel())
            .await
            .unwrap();

        for node in &cluster.nodes {
            assert_eq!(
                node.get("k", &cancel()).await.unwrap(),
                Some(Bytes::from("A")),
                "node {}",
                node.endpoint()
            );
        }

        assert_eq!(cluster.node(1).metrics().snapshot().redirected, 1);
        assert_eq!(cluster.node(1).log.last_index(), cluster.leader().log.last_index());
        // The leader applied its own entry without re-locking, followers under the lock
        assert!(cluster.leader().metrics().snapshot().replay_inline >= 1);
        assert!(cluster.node(2).metrics().snapshot().replay_locked >= 1);

        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_remove_reaches_every_node() {
        let cluster = SimCluster::start(3).await;

        cluster.leader().set("k", b"A".to_vec(), None, &cancel()).await.unwrap();
        cluster.node(2).remove("k", &cancel()).await.unwrap();

        for node in &cluster.nodes {
            assert_eq!(node.get("k", &cancel()).await.unwrap(), None);
        }

        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_leader_change_moves_writes() {
        let cluster = SimCluster::start(3).await;

        cluster.set_leader(Some(1));
        assert!(cluster.node(1).is_leader());
        assert!(!cluster.node(0).is_leader());

        cluster
            .node(2)
            .set("k", b"v".to_vec(), None, &cancel())
            .await
            .unwrap();

        assert_eq!(cluster.node(1).metrics().snapshot().redirected, 0);
        assert_eq!(cluster.node(2).metrics().snapshot().redirected, 1);
        assert_eq!(
            cluster.node(0).get("k", &cancel()).await.unwrap(),
            Some(Bytes::from("v"))
        );

        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_no_leader_times_out() {
        let cluster = SimCluster::start_with(3, |mut config| {
            config.router.leader_wait_timeout = Duration::from_millis(300);
            config.router.leader_check_interval = Duration::from_millis(50);
            config
        })
        .await;

        cluster.set_leader(None);
        let started = Instant::now();
        let result = cluster
            .node(1)
            .set("k", b"v".to_vec(), None, &cancel())
            .await;

        match result {
            Err(Error::Change { operation, key, term, last_index, source }) => {
                assert_eq!(operation, "Update");
                assert_eq!(key, "k");
                assert_eq!(term, cluster.term());
                assert_eq!(last_index, 0);
                assert!(matches!(
                    *source,
                    Error::LeaderDiscoveryTimeout { waited } if waited == Duration::from_millis(300)
                ));
            }
            other => panic!("expected a leader discovery timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(cluster.node(1).get("k", &cancel()).await.unwrap(), None);

        cluster.set_leader(Some(0));
        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_removed_member_stops_receiving_changes() {
        let cluster = SimCluster::start(3).await;
        let removed = cluster.node(2).endpoint().to_string();

        cluster.node(1).remove_member(&removed, &cancel()).await.unwrap();
        assert!(!cluster.leader().members().contains(&removed));
        assert_eq!(cluster.leader().members().len(), 2);

        cluster.leader().set("k", b"v".to_vec(), None, &cancel()).await.unwrap();

        assert_eq!(
            cluster.node(1).get("k", &cancel()).await.unwrap(),
            Some(Bytes::from("v"))
        );
        assert_eq!(cluster.node(2).get("k", &cancel()).await.unwrap(), None);

        // Adding it back lets it catch up from the log
        cluster.leader().add_member(&removed, &cancel()).await.unwrap();
        cluster.leader().set("other", b"w".to_vec(), None, &cancel()).await.unwrap();
        assert_eq!(
            cluster.node(2).get("k", &cancel()).await.unwrap(),
            Some(Bytes::from("v"))
        );

        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_same_key_writes_are_serialized() {
        let cluster = Arc::new(SimCluster::start(3).await);
        cluster.leader().faults.set_delay(Some(Duration::from_millis(200)));

        let started = Instant::now();
        let handles: Vec<_> = ["A", "B"]
            .into_iter()
            .map(|value| {
                let cluster = cluster.clone();
                tokio::spawn(async move {
                    cluster
                        .leader()
                        .set("k", value.as_bytes().to_vec(), None, &CancellationToken::new())
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(started.elapsed() >= Duration::from_millis(400));
        assert!(cluster.leader().get("k", &cancel()).await.unwrap().is_some());

        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block_each_other() {
        let cluster = Arc::new(SimCluster::start(3).await);
        cluster.leader().faults.set_delay(Some(Duration::from_millis(200)));

        let started = Instant::now();
        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|key| {
                let cluster = cluster.clone();
                tokio::spawn(async move {
                    cluster
                        .leader()
                        .set(key, b"v".to_vec(), None, &CancellationToken::new())
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(started.elapsed() < Duration::from_millis(390));
        for key in ["a", "b"] {
            assert!(cluster.node(2).get(key, &cancel()).await.unwrap().is_some());
        }

        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_reader_waits_for_inflight_write() {
        let cluster = Arc::new(SimCluster::start(3).await);
        cluster.leader().set("k", b"A".to_vec(), None, &cancel()).await.unwrap();
        cluster.leader().faults.set_delay(Some(Duration::from_millis(200)));

        let writer = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                cluster
                    .leader()
                    .set("k", b"B".to_vec(), None, &CancellationToken::new())
                    .await
            })
        };
        let leader_faults = cluster.leader().faults.clone();
        assert!(wait_until(|| leader_faults.replications() >= 2, Duration::from_secs(1)).await);

        // The write lock is held until commit, so the read sees the new value
        assert_eq!(
            cluster.leader().get("k", &cancel()).await.unwrap(),
            Some(Bytes::from("B"))
        );
        writer.await.unwrap().unwrap();

        cluster.stop().await;
    }

    #[tokio::test]
    async fn test_committed_log_rebuilds_cache() {
        let cluster = SimCluster::start(3).await;
        let leader = cluster.leader();

        leader.set("a", b"1".to_vec(), None, &cancel()).await.unwrap();
        leader.set("b", b"2".to_vec(), None, &cancel()).await.unwrap();
        leader.set("a", b"3".to_vec(), None, &cancel()).await.unwrap();
        leader.remove("b", &cancel()).await.unwrap();

        let parts = CacheParts::new(&StorageConfig::default());
        let state_machine = parts.state_machine();
        cluster.node(2).log.replay_into(&state_machine).await;

        assert_eq!(
            parts.storage.peek("a").await.map(|e| e.value),
            Some(Bytes::from("3"))
        );
        assert!(parts.storage.peek("b").await.is_none());

        cluster.stop().await;
    }
}
