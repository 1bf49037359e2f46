//! cirrus-node: entry point for a cirrus node.
//!
//! Loads config, opens a storage engine for every configured cluster member,
//! wires the coordinator of the local node with hinted handoff, spawns the
//! background compaction and hint delivery tasks plus a view replay task per
//! member, then executes JSON-encoded query plans read line by line from
//! stdin.

use cirrus_coord::compaction::spawn_compaction_task;
use cirrus_coord::view_replay::spawn_view_replay_task;
use cirrus_coord::{
    spawn_hint_delivery_task, Coordinator, CoordinatorConfig, HintDeliveryConfig, HintStore,
    InProcessReplicaClient, LocalReplica, QueryOutcome, QueryPlan, Schema, TombstoneThresholds,
};
use cirrus_ring::{Membership, NodeEntry, RingSnapshot};
use cirrus_storage::{EngineOptions, FsyncPolicy, StorageEngine};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{watch, RwLock};
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    cirrus_metrics::init_tracing();

    // Load config: first CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    let config = match cirrus_config::load_from_file(std::path::Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                "failed to load config from {}: {}, using defaults",
                config_path,
                e
            );
            cirrus_config::load_from_str("node:\n  name: node1\n")?
        }
    };

    // Ring membership: this node plus its configured peers
    let local = NodeEntry::new(
        &config.node.name,
        &config.node.datacenter,
        &config.node.rack,
        config.node.num_tokens,
    );
    let mut members = vec![local.clone()];
    for peer in config.cluster.iter().filter(|p| p.name != config.node.name) {
        members.push(NodeEntry::new(
            &peer.name,
            &peer.datacenter,
            &peer.rack,
            peer.num_tokens.unwrap_or(config.node.num_tokens),
        ));
    }
    let membership = Arc::new(Membership::new(RingSnapshot::new(members.clone())));
    let schema = Arc::new(Schema::from_config(&config));
    tracing::info!(
        "node {} ({}) in a ring of {} member(s)",
        local.name,
        local.id,
        members.len()
    );

    let options = EngineOptions {
        fsync: FsyncPolicy::from_str_config(&config.storage.fsync),
        flush_threshold: config.compaction.memtable_flush_threshold,
        view_queue_capacity: config.compaction.view_queue_capacity,
    };
    let thresholds = TombstoneThresholds::from(&config.tombstones);
    let grace_period_secs = config.tombstones.grace_period_seconds as i64;
    let compaction_interval = Duration::from_secs(config.compaction.interval_secs.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // One replica per member, each under its own data directory
    let client = InProcessReplicaClient::new();
    let mut local_replica = None;
    let mut peer_replicas = Vec::new();
    for member in &members {
        let engine = StorageEngine::open(&config.storage.data_dir.join(&member.name), options)?;
        let storage = Arc::new(RwLock::new(engine));
        let replica = Arc::new(LocalReplica::new(storage.clone(), schema.clone(), thresholds));
        client.register(member.id, replica.clone()).await;
        spawn_compaction_task(
            storage,
            compaction_interval,
            grace_period_secs,
            shutdown_rx.clone(),
        );
        if member.id == local.id {
            local_replica = Some(replica);
        } else {
            peer_replicas.push((member.clone(), replica));
        }
    }
    let local_replica = local_replica.ok_or("local replica was not opened")?;
    let client = Arc::new(client);

    let mut coordinator = Coordinator::new(
        local.clone(),
        local_replica,
        membership.clone(),
        schema.clone(),
        client.clone(),
        CoordinatorConfig::from_config(&config),
    );

    // Hint store and delivery (if hinted handoff is enabled)
    let mut hint_task = None;
    if config.coordinator.hinted_handoff {
        let hint_dir = config.storage.data_dir.join(&local.name).join("hints");
        let store = HintStore::open(&hint_dir, options.fsync)?;
        let (handle, task) = spawn_hint_delivery_task(
            store,
            membership.clone(),
            client.clone(),
            HintDeliveryConfig::from_config(&config.coordinator),
            shutdown_rx.clone(),
        );
        coordinator = coordinator.with_hints(handle);
        hint_task = Some(task);
    }
    let coordinator = Arc::new(coordinator);

    // Hints replay base writes on their target, which queues view batches
    // there; each member replays its own queue.
    let replay_interval = Duration::from_secs(config.coordinator.view_replay_interval_secs.max(1));
    spawn_view_replay_task(coordinator.clone(), replay_interval, shutdown_rx.clone());
    for (member, replica) in peer_replicas {
        let peer = Coordinator::new(
            member,
            replica,
            membership.clone(),
            schema.clone(),
            client.clone(),
            CoordinatorConfig::from_config(&config),
        );
        spawn_view_replay_task(Arc::new(peer), replay_interval, shutdown_rx.clone());
    }

    // Spawn metrics HTTP server if configured
    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr = std::net::SocketAddr::from(([0, 0, 0, 0], metrics_port));
        tokio::spawn(async move {
            if let Err(e) = cirrus_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    // Execute statements until stdin closes or Ctrl+C
    tracing::info!("reading query plans from stdin, one JSON object per line");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<QueryPlan>(&line) {
                    Ok(plan) => print_outcome(coordinator.execute(plan).await),
                    Err(e) => println!("error: malformed query plan: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl+C, shutting down");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(task) = hint_task {
        // The delivery task compacts the hint log on exit.
        let _ = task.await;
    }
    Ok(())
}

fn print_outcome(outcome: Result<QueryOutcome, cirrus_coord::CoordinatorError>) {
    match outcome {
        Ok(QueryOutcome::Ack(ack)) => {
            println!("ok: {}/{} acks", ack.acks_received, ack.acks_required);
        }
        Ok(QueryOutcome::Rows(result)) => {
            for warning in &result.warnings {
                println!("warning: {}", warning);
            }
            for row in &result.rows {
                let columns: Vec<String> = row
                    .columns
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, String::from_utf8_lossy(value)))
                    .collect();
                println!(
                    "row {}: {}",
                    String::from_utf8_lossy(row.clustering.as_bytes()),
                    columns.join(", ")
                );
            }
            println!("({} row(s))", result.rows.len());
        }
        Err(e) => println!("error: {}", e),
    }
}
