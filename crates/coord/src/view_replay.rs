//! Replay of view batches that were queued but never released.
//!
//! A batch stays queued when its coordinator failed between the base
//! acknowledgement and view replication, or when view replication timed out.
//! The replay task re-delivers such batches through the local coordinator.

use crate::consistency::ConsistencyLevel;
use crate::coordinator::Coordinator;
use crate::replica_client::ReplicaClient;
use cirrus_common::now_micros;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};

/// Replay local batches queued more than `min_age` ago. Returns how many
/// were replayed and released.
pub async fn replay_pending_views<R: ReplicaClient>(
    coordinator: &Coordinator<R>,
    min_age: Duration,
) -> usize {
    let replica = coordinator.local_replica();
    let cutoff = now_micros() - min_age.as_micros() as i64;
    let pending = replica.storage().read().await.pending_views();

    let mut replayed = 0usize;
    for batch in pending.into_iter().filter(|b| b.created_at <= cutoff) {
        if let Err(e) = coordinator
            .apply_mutations(&batch.mutations, ConsistencyLevel::One)
            .await
        {
            tracing::debug!("view batch {} replay failed: {}, will retry", batch.id, e);
            continue;
        }
        if let Err(e) = replica.release_views(batch.id).await {
            tracing::warn!("failed to release replayed view batch {}: {}", batch.id, e);
            continue;
        }
        replayed += 1;
        cirrus_metrics::metrics().view_batches_replayed.inc();
    }

    if replayed > 0 {
        tracing::info!("replayed {} pending view batch(es)", replayed);
    }
    replayed
}

/// Run [`replay_pending_views`] every `every` until shutdown. Batches
/// younger than one period are left to their coordinator.
pub fn spawn_view_replay_task<R: ReplicaClient>(
    coordinator: Arc<Coordinator<R>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(every);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    replay_pending_views(&coordinator, every).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("view replay task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use crate::local::InProcessReplicaClient;
    use crate::replica::{LocalReplica, TombstoneThresholds};
    use crate::replica_client::WriteMode;
    use crate::schema::{KeyPart, Schema, ViewDef};
    use cirrus_ring::{Keyspace, Membership, NodeEntry, RingSnapshot};
    use cirrus_storage::{
        Cell, ClusteringKey, EngineOptions, FsyncPolicy, Mutation, PartitionData, PartitionKey,
        ReadFilter, StorageEngine,
    };
    use tempfile::TempDir;
    use tokio::sync::RwLock;

    async fn setup(dir: &TempDir) -> (Arc<LocalReplica>, Coordinator<InProcessReplicaClient>) {
        let mut schema = Schema::new();
        schema.add_keyspace(Keyspace::simple("app", 1));
        schema.add_table("app", "users");
        schema.add_view(ViewDef::new(
            "app",
            "by_email",
            "users",
            vec![KeyPart::Column("email".into())],
            vec![],
            vec![],
        ));
        let schema = Arc::new(schema);

        let engine = StorageEngine::open(
            dir.path(),
            EngineOptions {
                fsync: FsyncPolicy::None,
                ..EngineOptions::default()
            },
        )
        .unwrap();
        let replica = Arc::new(LocalReplica::new(
            Arc::new(RwLock::new(engine)),
            schema.clone(),
            TombstoneThresholds::default(),
        ));
        let local = NodeEntry::new("n0", "dc1", "r1", 4);
        let client = InProcessReplicaClient::new();
        client.register(local.id, replica.clone()).await;
        let coordinator = Coordinator::new(
            local.clone(),
            replica.clone(),
            Arc::new(Membership::new(RingSnapshot::new(vec![local]))),
            schema,
            Arc::new(client),
            CoordinatorConfig::default(),
        );
        (replica, coordinator)
    }

    async fn base_write(replica: &LocalReplica, email: &str, ts: i64) {
        let mut data = PartitionData::new();
        data.row_mut(ClusteringKey::EMPTY)
            .set_cell("email", Cell::live(email, ts));
        replica
            .apply(
                Mutation::new(PartitionKey::new("app", "users", b"u1".to_vec()), data),
                WriteMode::Base,
            )
            .await
            .unwrap();
    }

    async fn view_rows(replica: &LocalReplica, email: &str) -> usize {
        replica
            .read(
                &PartitionKey::new("app", "by_email", email.as_bytes().to_vec()),
                &ReadFilter::all(),
            )
            .await
            .unwrap()
            .data
            .live_rows(0)
            .count()
    }

    #[tokio::test]
    async fn test_replays_unreleased_batch() {
        let dir = TempDir::new().unwrap();
        let (replica, coordinator) = setup(&dir).await;

        // A base write whose coordinator never replicated the view batch.
        base_write(&replica, "a@x", 1).await;
        assert_eq!(replica.storage().read().await.pending_view_count(), 1);

        assert_eq!(replay_pending_views(&coordinator, Duration::ZERO).await, 1);
        assert_eq!(replica.storage().read().await.pending_view_count(), 0);
        assert_eq!(view_rows(&replica, "a@x").await, 1);
    }

    #[tokio::test]
    async fn test_future_timestamped_batch_still_ages_out() {
        let dir = TempDir::new().unwrap();
        let (replica, coordinator) = setup(&dir).await;

        // Client clock an hour ahead of this node.
        base_write(&replica, "late@x", now_micros() + 3_600_000_000).await;

        assert_eq!(replay_pending_views(&coordinator, Duration::from_secs(60)).await, 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(replay_pending_views(&coordinator, Duration::from_millis(20)).await, 1);
        assert_eq!(replica.storage().read().await.pending_view_count(), 0);
        assert_eq!(view_rows(&replica, "late@x").await, 1);
    }
}
