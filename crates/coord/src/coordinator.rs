//! Query coordinator: consistency-level fan-out over the replica set.
//!
//! The coordinator:
//! 1. Resolves the partition's replicas from a ring snapshot
//! 2. Hints replicas known to be down and fans out to the rest in parallel
//! 3. Waits until the consistency requirement is met or the deadline passes
//! 4. Replicates the view mutations its replicas queued, at the same level
//! 5. On reads, resolves responses and schedules read repair

use crate::consistency::{AckTally, ConsistencyLevel, Requirement};
use crate::error::CoordinatorError;
use crate::hint_delivery::HintHandle;
use crate::plan::{Ack, Operation, QueryOutcome, QueryPlan, QueryResult};
use crate::reconcile::{self, ReplicaResponse};
use crate::replica::LocalReplica;
use crate::replica_client::{ReplicaClient, ReplicaError, ReplicaRead, ViewBatch, WriteAck, WriteMode};
use crate::schema::{Schema, TableKind};
use cirrus_common::{now_secs, NodeId, TimestampGenerator};
use cirrus_ring::{replicas_for, token_for, Keyspace, Membership, NodeEntry};
use cirrus_storage::{Mutation, PartitionData, PartitionKey, ReadFilter};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

type WriteFuts = FuturesUnordered<JoinHandle<(NodeEntry, Result<WriteAck, ReplicaError>)>>;
type ReadFuts = FuturesUnordered<JoinHandle<(NodeEntry, Result<ReplicaRead, ReplicaError>)>>;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Probability that a read also repairs every replica in the background.
    pub read_repair_chance: f64,
    pub hinted_handoff: bool,
    /// Tombstones scanned per read above which the result carries a warning.
    pub tombstone_warn_threshold: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            read_repair_chance: 0.1,
            hinted_handoff: true,
            tombstone_warn_threshold: 1_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_config(config: &cirrus_config::NodeConfig) -> Self {
        Self {
            read_timeout: Duration::from_millis(config.coordinator.read_timeout_ms),
            write_timeout: Duration::from_millis(config.coordinator.write_timeout_ms),
            read_repair_chance: config.coordinator.read_repair_chance,
            hinted_handoff: config.coordinator.hinted_handoff,
            tombstone_warn_threshold: config.tombstones.warn_threshold,
        }
    }
}

// ---------------------------------------------------------------------------
// Query lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Resolving,
    FanningOut,
    AwaitingAcks,
    Resolved,
    Failed,
    Timeout,
}

#[derive(Debug)]
struct QueryTracker {
    id: uuid::Uuid,
    op: &'static str,
    states: Vec<QueryState>,
}

impl QueryTracker {
    fn new(op: &'static str) -> Self {
        let id = uuid::Uuid::new_v4();
        tracing::debug!("query {} ({}): {:?}", id, op, QueryState::Resolving);
        Self {
            id,
            op,
            states: vec![QueryState::Resolving],
        }
    }

    fn transition(&mut self, next: QueryState) {
        tracing::debug!("query {} ({}): {:?}", self.id, self.op, next);
        self.states.push(next);
    }

    fn finish<T>(&mut self, result: &Result<T, CoordinatorError>) {
        match result {
            Ok(_) => self.transition(QueryState::Resolved),
            Err(e) if e.is_timeout() => self.transition(QueryState::Timeout),
            Err(e) => {
                tracing::debug!("query {} ({}) failed: {}", self.id, self.op, e);
                self.transition(QueryState::Failed)
            }
        }
    }
}

/// Outcome of replicating one mutation.
#[derive(Debug)]
struct FanOut {
    acks: usize,
    required: usize,
    view_batches: Vec<(NodeEntry, ViewBatch)>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Coordinates queries on behalf of one node.
///
/// Generic over `R: ReplicaClient`; requests for the local node skip the
/// client and go straight to its [`LocalReplica`].
pub struct Coordinator<R: ReplicaClient> {
    local: NodeEntry,
    local_replica: Arc<LocalReplica>,
    membership: Arc<Membership>,
    schema: Arc<Schema>,
    client: Arc<R>,
    hints: Option<HintHandle>,
    clock: TimestampGenerator,
    config: CoordinatorConfig,
}

impl<R: ReplicaClient> std::fmt::Debug for Coordinator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("local", &self.local.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<R: ReplicaClient> Coordinator<R> {
    pub fn new(
        local: NodeEntry,
        local_replica: Arc<LocalReplica>,
        membership: Arc<Membership>,
        schema: Arc<Schema>,
        client: Arc<R>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            local,
            local_replica,
            membership,
            schema,
            client,
            hints: None,
            clock: TimestampGenerator::new(),
            config,
        }
    }

    /// Attach the hint delivery task for hinted handoff.
    pub fn with_hints(mut self, hints: HintHandle) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn local(&self) -> &NodeEntry {
        &self.local
    }

    pub fn local_replica(&self) -> &Arc<LocalReplica> {
        &self.local_replica
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub async fn execute(&self, plan: QueryPlan) -> Result<QueryOutcome, CoordinatorError> {
        self.execute_traced(plan).await.0
    }

    /// Execute a plan and also return the states it went through.
    pub async fn execute_traced(
        &self,
        plan: QueryPlan,
    ) -> (Result<QueryOutcome, CoordinatorError>, Vec<QueryState>) {
        let op = match plan.operation {
            Operation::Read => "read",
            Operation::Write { .. } => "write",
            Operation::Delete => "delete",
        };
        let mut tracker = QueryTracker::new(op);
        let result = if plan.is_read() {
            self.read(&plan, &mut tracker).await.map(QueryOutcome::Rows)
        } else {
            self.write(&plan, op, &mut tracker).await.map(QueryOutcome::Ack)
        };
        tracker.finish(&result);
        (result, tracker.states)
    }

    /// Replicate already-built mutations without view derivation.
    ///
    /// Used to re-deliver queued view batches.
    pub async fn apply_mutations(
        &self,
        mutations: &[Mutation],
        level: ConsistencyLevel,
    ) -> Result<(), CoordinatorError> {
        let deadline = Instant::now() + self.config.write_timeout;
        for mutation in mutations {
            let keyspace = self.keyspace(&mutation.partition.keyspace)?;
            self.fan_out_write(keyspace, mutation, level, WriteMode::Plain, deadline, None)
                .await?;
        }
        Ok(())
    }

    fn keyspace(&self, name: &str) -> Result<&Keyspace, CoordinatorError> {
        self.schema
            .keyspace(name)
            .ok_or_else(|| CoordinatorError::UnknownKeyspace(name.to_string()))
    }

    fn lookup(&self, plan: &QueryPlan) -> Result<(&Keyspace, TableKind), CoordinatorError> {
        let keyspace = self.keyspace(&plan.keyspace)?;
        let kind = self
            .schema
            .table_kind(&plan.keyspace, &plan.table)
            .ok_or_else(|| CoordinatorError::UnknownTable {
                keyspace: plan.keyspace.clone(),
                table: plan.table.clone(),
            })?;
        Ok((keyspace, kind))
    }

    fn hint_handle(&self) -> Option<&HintHandle> {
        self.hints.as_ref().filter(|_| self.config.hinted_handoff)
    }

    // -----------------------------------------------------------------------
    // Write
    // -----------------------------------------------------------------------

    async fn write(
        &self,
        plan: &QueryPlan,
        op: &'static str,
        tracker: &mut QueryTracker,
    ) -> Result<Ack, CoordinatorError> {
        let m = cirrus_metrics::metrics();
        let _timer = cirrus_metrics::start_op_timer(op);
        match plan.operation {
            Operation::Delete => m.deletes.inc(),
            _ => m.writes.inc(),
        }

        let (keyspace, kind) = self.lookup(plan)?;
        if kind == TableKind::View {
            return Err(CoordinatorError::InvalidRequest(format!(
                "{}.{} is a materialized view; write its base table",
                plan.keyspace, plan.table
            )));
        }

        let timestamp = match plan.timestamp {
            Some(ts) => {
                self.clock.observe(ts);
                ts
            }
            None => self.clock.next(),
        };
        let mutation = Mutation::new(plan.partition(), plan.build_update(timestamp, now_secs())?);
        let deadline = Instant::now() + self.config.write_timeout;

        let outcome = self
            .fan_out_write(
                keyspace,
                &mutation,
                plan.consistency,
                WriteMode::Base,
                deadline,
                Some(tracker),
            )
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    m.write_timeouts.inc();
                }
                e
            })?;

        if !outcome.view_batches.is_empty() {
            self.propagate_views(&outcome.view_batches, plan.consistency, deadline)
                .await?;
        }

        Ok(Ack {
            acks_received: outcome.acks,
            acks_required: outcome.required,
        })
    }

    /// Replicate one mutation to its replica set at `level`.
    async fn fan_out_write(
        &self,
        keyspace: &Keyspace,
        mutation: &Mutation,
        level: ConsistencyLevel,
        mode: WriteMode,
        deadline: Instant,
        mut tracker: Option<&mut QueryTracker>,
    ) -> Result<FanOut, CoordinatorError> {
        let m = cirrus_metrics::metrics();
        let ring = self.membership.snapshot().await;
        let replicas = replicas_for(&ring, token_for(&mutation.partition.key), keyspace)?;
        let requirement =
            Requirement::resolve(level, &keyspace.strategy, &replicas, &self.local.datacenter);
        let is_any = level == ConsistencyLevel::Any;
        let can_hint = self.hint_handle().is_some();

        let (alive, down): (Vec<NodeEntry>, Vec<NodeEntry>) =
            replicas.into_iter().partition(|n| n.is_alive());
        if !requirement.is_met(&AckTally::of(&alive)) && !(is_any && can_hint) {
            m.unavailable.inc();
            return Err(CoordinatorError::Unavailable {
                alive: alive.len(),
                required: requirement.total(),
            });
        }

        let mut hinted = 0usize;
        for node in &down {
            if self.hint(node, mutation, mode).await {
                hinted += 1;
            }
        }

        if let Some(t) = tracker.as_deref_mut() {
            t.transition(QueryState::FanningOut);
        }
        let mut futs: WriteFuts = FuturesUnordered::new();
        for replica in &alive {
            let target = replica.clone();
            let mutation = mutation.clone();
            if replica.id == self.local.id {
                let local = self.local_replica.clone();
                futs.push(tokio::spawn(async move {
                    let result = local.apply(mutation, mode).await;
                    (target, result)
                }));
            } else {
                let client = self.client.clone();
                futs.push(tokio::spawn(async move {
                    let result = client.apply(&target, &mutation, mode).await;
                    (target, result)
                }));
            }
        }

        if let Some(t) = tracker.as_deref_mut() {
            t.transition(QueryState::AwaitingAcks);
        }
        let mut tally = AckTally::new();
        let mut pending: HashMap<NodeId, NodeEntry> =
            alive.iter().map(|n| (n.id, n.clone())).collect();
        let mut view_batches = Vec::new();
        let mut rejected: Option<String> = None;

        while !requirement.is_met(&tally) {
            let Some(joined) = tokio::time::timeout_at(deadline, futs.next())
                .await
                .ok()
                .flatten()
            else {
                break;
            };
            let Ok((node, result)) = joined else {
                continue;
            };
            pending.remove(&node.id);
            match result {
                Ok(ack) => {
                    tally.record(&node.datacenter);
                    if let Some(batch) = ack.view_batch {
                        view_batches.push((node, batch));
                    }
                }
                Err(e @ ReplicaError::ViewQueueFull { .. }) => {
                    m.replica_failures.inc();
                    rejected = Some(format!("{} rejected the write: {}", node.name, e));
                    break;
                }
                Err(e) if e.is_unreachable() => {
                    m.replica_failures.inc();
                    tracing::warn!("write to {} failed: {}", node.name, e);
                    if self.hint(&node, mutation, mode).await {
                        hinted += 1;
                    }
                }
                // The replica answered and refused; a hint would hit the same refusal.
                Err(e) => {
                    m.replica_failures.inc();
                    tracing::warn!("{} refused the write: {}", node.name, e);
                }
            }
        }

        let met = requirement.is_met(&tally);
        if met || rejected.is_some() {
            self.spawn_straggler_drain(futs, pending, mutation.clone(), mode, deadline);
        } else {
            // The deadline has passed; whoever has not answered gets a hint.
            for node in pending.values() {
                if self.hint(node, mutation, mode).await {
                    hinted += 1;
                }
            }
        }

        if let Some(reason) = rejected {
            m.view_failures.inc();
            return Err(CoordinatorError::ViewUpdate(reason));
        }

        let acks = requirement.counted(&tally);
        if !met && !(is_any && hinted > 0) {
            return Err(CoordinatorError::WriteTimeout {
                acks_received: acks,
                acks_required: requirement.total(),
            });
        }

        Ok(FanOut {
            acks,
            required: requirement.total(),
            view_batches,
        })
    }

    /// Store a hint for `node`, replayed later with `mode`. Returns whether
    /// one was stored.
    async fn hint(&self, node: &NodeEntry, mutation: &Mutation, mode: WriteMode) -> bool {
        let Some(hints) = self.hint_handle() else {
            return false;
        };
        match hints.store(node.id, mutation.clone(), mode).await {
            Ok(_) => {
                tracing::debug!("stored hint for {} on {}", mutation.partition, node.name);
                true
            }
            Err(e) => {
                tracing::warn!("failed to store hint for {}: {}", node.name, e);
                false
            }
        }
    }

    /// Let replicas that have not answered finish in the background, hinting
    /// those that fail or miss the deadline.
    fn spawn_straggler_drain(
        &self,
        mut futs: WriteFuts,
        mut pending: HashMap<NodeId, NodeEntry>,
        mutation: Mutation,
        mode: WriteMode,
        deadline: Instant,
    ) {
        if pending.is_empty() {
            return;
        }
        let hints = self.hint_handle().cloned();
        tokio::spawn(async move {
            while let Some(joined) = tokio::time::timeout_at(deadline, futs.next())
                .await
                .ok()
                .flatten()
            {
                let Ok((node, result)) = joined else {
                    continue;
                };
                pending.remove(&node.id);
                match result {
                    Ok(_) => {}
                    Err(e) if e.is_unreachable() => {
                        cirrus_metrics::metrics().replica_failures.inc();
                        tracing::debug!("late write to {} failed: {}", node.name, e);
                        pending.insert(node.id, node);
                    }
                    Err(e) => {
                        cirrus_metrics::metrics().replica_failures.inc();
                        tracing::debug!("{} refused a late write: {}", node.name, e);
                    }
                }
            }

            let Some(hints) = hints else { return };
            for node in pending.into_values() {
                if let Err(e) = hints.store(node.id, mutation.clone(), mode).await {
                    tracing::warn!("failed to store hint for {}: {}", node.name, e);
                }
            }
        });
    }

    /// Replicate the view mutations queued by acknowledging replicas, then
    /// release their batches.
    async fn propagate_views(
        &self,
        batches: &[(NodeEntry, ViewBatch)],
        level: ConsistencyLevel,
        deadline: Instant,
    ) -> Result<(), CoordinatorError> {
        let m = cirrus_metrics::metrics();
        let mut merged: BTreeMap<PartitionKey, PartitionData> = BTreeMap::new();
        for (_, batch) in batches {
            for mutation in &batch.mutations {
                merged
                    .entry(mutation.partition.clone())
                    .or_default()
                    .merge(mutation.data.clone());
            }
        }

        for (partition, data) in merged {
            let keyspace = self.keyspace(&partition.keyspace)?;
            let mutation = Mutation::new(partition, data);
            if let Err(e) = self
                .fan_out_write(keyspace, &mutation, level, WriteMode::Plain, deadline, None)
                .await
            {
                m.view_failures.inc();
                tracing::warn!("view update for {} failed: {}", mutation.partition, e);
                return Err(CoordinatorError::ViewUpdate(e.to_string()));
            }
        }
        m.view_updates.inc();

        let releases = batches.iter().map(|(node, batch)| async move {
            let result = if node.id == self.local.id {
                self.local_replica.release_views(batch.id).await
            } else {
                self.client.release_views(node, batch.id).await
            };
            if let Err(e) = result {
                // The batch stays queued and is replayed later.
                tracing::debug!("release of view batch {} on {} failed: {}", batch.id, node.name, e);
            }
        });
        futures::future::join_all(releases).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Read
    // -----------------------------------------------------------------------

    async fn read(
        &self,
        plan: &QueryPlan,
        tracker: &mut QueryTracker,
    ) -> Result<QueryResult, CoordinatorError> {
        let m = cirrus_metrics::metrics();
        let _timer = cirrus_metrics::start_op_timer("read");
        m.reads.inc();

        if plan.consistency == ConsistencyLevel::Any {
            return Err(CoordinatorError::InvalidRequest(
                "ANY applies to writes only".into(),
            ));
        }
        let (keyspace, kind) = self.lookup(plan)?;
        let partition = plan.partition();
        let filter = plan.read_filter();

        let ring = self.membership.snapshot().await;
        let replicas = replicas_for(&ring, token_for(&plan.partition_key), keyspace)?;
        let requirement = Requirement::resolve(
            plan.consistency,
            &keyspace.strategy,
            &replicas,
            &self.local.datacenter,
        );

        let candidates = self.by_proximity(&replicas);
        let mut planned = AckTally::new();
        let mut targets = Vec::new();
        for node in &candidates {
            if requirement.wants(&planned, &node.datacenter) {
                planned.record(&node.datacenter);
                targets.push(node.clone());
            }
        }
        if !requirement.is_met(&planned) {
            m.unavailable.inc();
            return Err(CoordinatorError::Unavailable {
                alive: candidates.len(),
                required: requirement.total(),
            });
        }

        tracker.transition(QueryState::FanningOut);
        let deadline = Instant::now() + self.config.read_timeout;
        let mut futs = self.spawn_reads(&targets, &partition, &filter);

        tracker.transition(QueryState::AwaitingAcks);
        let mut tally = AckTally::new();
        let mut responses = Vec::new();
        let mut scanned = 0usize;
        while !requirement.is_met(&tally) {
            let Some(joined) = tokio::time::timeout_at(deadline, futs.next())
                .await
                .ok()
                .flatten()
            else {
                break;
            };
            let Ok((node, result)) = joined else {
                continue;
            };
            match result {
                Ok(read) => {
                    tally.record(&node.datacenter);
                    scanned = scanned.max(read.tombstones_scanned);
                    responses.push(ReplicaResponse {
                        node,
                        data: read.data,
                    });
                }
                Err(ReplicaError::TombstoneOverflow { scanned, threshold }) => {
                    return Err(CoordinatorError::TombstoneOverflow { scanned, threshold });
                }
                Err(e) => {
                    m.replica_failures.inc();
                    tracing::warn!("read from {} failed: {}", node.name, e);
                }
            }
        }

        if !requirement.is_met(&tally) {
            m.read_timeouts.inc();
            return Err(CoordinatorError::ReadTimeout {
                responses_received: requirement.counted(&tally),
                responses_required: requirement.total(),
            });
        }

        let resolved = reconcile::resolve(&responses);
        let repairs = reconcile::repairs(&responses, &resolved);
        if !repairs.is_empty() {
            tracing::debug!("{} replica(s) of {} are stale, repairing", repairs.len(), partition);
            reconcile::spawn_read_repair(
                self.client.clone(),
                self.local_replica.clone(),
                self.local.id,
                partition.clone(),
                repairs,
            );
        }

        let chance = self.config.read_repair_chance.clamp(0.0, 1.0);
        if candidates.len() > targets.len() && chance > 0.0 && rand::thread_rng().gen_bool(chance) {
            self.spawn_full_repair(candidates, partition, filter);
        }

        let mut result = QueryResult::from_partition(&resolved, kind, now_secs());
        if scanned > self.config.tombstone_warn_threshold {
            m.tombstone_warnings.inc();
            tracing::warn!(
                "read of {} scanned {} tombstones (warn threshold {})",
                plan.partition(),
                scanned,
                self.config.tombstone_warn_threshold
            );
            result.warnings.push(format!(
                "read scanned {} tombstones, over the warning threshold of {}",
                scanned, self.config.tombstone_warn_threshold
            ));
        }
        Ok(result)
    }

    /// Replicas ordered local node first, then local datacenter, then the
    /// rest, in ring order within each group. Down replicas are excluded.
    fn by_proximity(&self, replicas: &[NodeEntry]) -> Vec<NodeEntry> {
        let mut candidates: Vec<NodeEntry> =
            replicas.iter().filter(|n| n.is_alive()).cloned().collect();
        candidates.sort_by_key(|n| {
            if n.id == self.local.id {
                0
            } else if n.datacenter == self.local.datacenter {
                1
            } else {
                2
            }
        });
        candidates
    }

    fn spawn_reads(
        &self,
        targets: &[NodeEntry],
        partition: &PartitionKey,
        filter: &ReadFilter,
    ) -> ReadFuts {
        let futs: ReadFuts = FuturesUnordered::new();
        for replica in targets {
            let target = replica.clone();
            let partition = partition.clone();
            let filter = filter.clone();
            if replica.id == self.local.id {
                let local = self.local_replica.clone();
                futs.push(tokio::spawn(async move {
                    let result = local.read(&partition, &filter).await;
                    (target, result)
                }));
            } else {
                let client = self.client.clone();
                futs.push(tokio::spawn(async move {
                    let result = client.read(&target, &partition, &filter).await;
                    (target, result)
                }));
            }
        }
        futs
    }

    /// Read every live replica in the background and repair the stale ones.
    /// The handle yields the number of replicas repaired.
    fn spawn_full_repair(
        &self,
        replicas: Vec<NodeEntry>,
        partition: PartitionKey,
        filter: ReadFilter,
    ) -> JoinHandle<usize> {
        let mut futs = self.spawn_reads(&replicas, &partition, &filter);
        let deadline = Instant::now() + self.config.read_timeout;
        let client = self.client.clone();
        let local = self.local_replica.clone();
        let local_id = self.local.id;
        tokio::spawn(async move {
            let mut responses = Vec::new();
            while let Some(joined) = tokio::time::timeout_at(deadline, futs.next())
                .await
                .ok()
                .flatten()
            {
                if let Ok((node, Ok(read))) = joined {
                    responses.push(ReplicaResponse {
                        node,
                        data: read.data,
                    });
                }
            }
            let resolved = reconcile::resolve(&responses);
            let repairs = reconcile::repairs(&responses, &resolved);
            if repairs.is_empty() {
                return 0;
            }
            let stale = repairs.len();
            let name = partition.to_string();
            match reconcile::spawn_read_repair(client, local, local_id, partition, repairs).await {
                Ok(repaired) => {
                    tracing::debug!(
                        "background repair of {} fixed {}/{} stale replica(s)",
                        name,
                        repaired,
                        stale
                    );
                    repaired
                }
                Err(e) => {
                    tracing::warn!("background repair of {} did not finish: {}", name, e);
                    0
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hint_delivery::{spawn_hint_delivery_task, HintDeliveryConfig};
    use crate::hint_store::HintStore;
    use crate::plan::ColumnWrite;
    use crate::replica::TombstoneThresholds;
    use crate::schema::{KeyPart, ViewDef};
    use cirrus_ring::{Liveness, RingSnapshot};
    use cirrus_storage::{ClusteringKey, EngineOptions, FsyncPolicy, StorageEngine};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::{watch, RwLock};

    // -----------------------------------------------------------------------
    // Mock ReplicaClient for remote replicas
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct MockReplicaClient {
        applied: AtomicUsize,
        fail_nodes: HashSet<NodeId>,
        refuse_nodes: HashSet<NodeId>,
        slow_nodes: HashSet<NodeId>,
    }

    #[async_trait::async_trait]
    impl ReplicaClient for MockReplicaClient {
        async fn apply(
            &self,
            target: &NodeEntry,
            _mutation: &Mutation,
            _mode: WriteMode,
        ) -> Result<WriteAck, ReplicaError> {
            if self.slow_nodes.contains(&target.id) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if self.fail_nodes.contains(&target.id) {
                return Err(ReplicaError::RpcFailed("simulated failure".into()));
            }
            if self.refuse_nodes.contains(&target.id) {
                return Err(ReplicaError::Storage("disk full".into()));
            }
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(WriteAck::default())
        }

        async fn read(
            &self,
            target: &NodeEntry,
            _partition: &PartitionKey,
            _filter: &ReadFilter,
        ) -> Result<ReplicaRead, ReplicaError> {
            if self.slow_nodes.contains(&target.id) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if self.fail_nodes.contains(&target.id) {
                return Err(ReplicaError::RpcFailed("simulated failure".into()));
            }
            Ok(ReplicaRead::default())
        }

        async fn release_views(&self, _target: &NodeEntry, _batch_id: u64) -> Result<(), ReplicaError> {
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        nodes: Vec<NodeEntry>,
        membership: Arc<Membership>,
        coordinator: Coordinator<MockReplicaClient>,
    }

    fn schema() -> Arc<Schema> {
        let mut schema = Schema::new();
        schema.add_keyspace(Keyspace::simple("app", 3));
        schema.add_table("app", "users");
        schema.add_view(ViewDef::new(
            "app",
            "users_by_email",
            "users",
            vec![KeyPart::Column("email".into())],
            vec![],
            vec![],
        ));
        Arc::new(schema)
    }

    fn fixture(client: MockReplicaClient, thresholds: TombstoneThresholds) -> Fixture {
        let dir = TempDir::new().unwrap();
        let nodes: Vec<NodeEntry> = (0..3)
            .map(|i| NodeEntry::new(&format!("n{}", i), "dc1", "r1", 8))
            .collect();
        let membership = Arc::new(Membership::new(RingSnapshot::new(nodes.clone())));
        let engine = StorageEngine::open(
            dir.path(),
            EngineOptions {
                fsync: FsyncPolicy::None,
                ..EngineOptions::default()
            },
        )
        .unwrap();
        let local_replica = Arc::new(LocalReplica::new(
            Arc::new(RwLock::new(engine)),
            schema(),
            thresholds,
        ));
        let config = CoordinatorConfig {
            read_timeout: Duration::from_millis(200),
            write_timeout: Duration::from_millis(200),
            read_repair_chance: 0.0,
            hinted_handoff: true,
            tombstone_warn_threshold: thresholds.warn,
        };
        let coordinator = Coordinator::new(
            nodes[0].clone(),
            local_replica,
            membership.clone(),
            schema(),
            Arc::new(client),
            config,
        );
        Fixture {
            _dir: dir,
            nodes,
            membership,
            coordinator,
        }
    }

    fn write(level: ConsistencyLevel) -> QueryPlan {
        QueryPlan::write("app", "users", b"u1", vec![ColumnWrite::set("name", "ada")])
            .with_consistency(level)
    }

    #[tokio::test]
    async fn test_write_then_read_at_one() {
        let f = fixture(MockReplicaClient::default(), TombstoneThresholds::default());

        let ack = f
            .coordinator
            .execute(write(ConsistencyLevel::All))
            .await
            .unwrap()
            .ack()
            .unwrap();
        assert_eq!(ack.acks_required, 3);
        assert_eq!(ack.acks_received, 3);

        // ONE is served by the local replica first.
        let rows = f
            .coordinator
            .execute(QueryPlan::read("app", "users", b"u1"))
            .await
            .unwrap();
        let rows = rows.rows().unwrap();
        assert_eq!(rows.rows.len(), 1);
        assert_eq!(rows.rows[0].get("name"), Some(&b"ada"[..]));
    }

    #[tokio::test]
    async fn test_traced_states() {
        let f = fixture(MockReplicaClient::default(), TombstoneThresholds::default());
        let (result, states) = f
            .coordinator
            .execute_traced(write(ConsistencyLevel::One))
            .await;
        assert!(result.is_ok());
        assert_eq!(
            states,
            vec![
                QueryState::Resolving,
                QueryState::FanningOut,
                QueryState::AwaitingAcks,
                QueryState::Resolved
            ]
        );
    }

    #[tokio::test]
    async fn test_schema_errors() {
        let f = fixture(MockReplicaClient::default(), TombstoneThresholds::default());

        let err = f
            .coordinator
            .execute(QueryPlan::read("nope", "users", b"u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownKeyspace(_)));

        let err = f
            .coordinator
            .execute(QueryPlan::read("app", "nope", b"u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownTable { .. }));

        let err = f
            .coordinator
            .execute(QueryPlan::write("app", "users_by_email", b"a@x", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidRequest(_)));

        let err = f
            .coordinator
            .execute(QueryPlan::read("app", "users", b"u1").with_consistency(ConsistencyLevel::Any))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_unavailable_when_too_many_down() {
        let f = fixture(MockReplicaClient::default(), TombstoneThresholds::default());
        f.membership.set_status(f.nodes[1].id, Liveness::Down).await;
        f.membership.set_status(f.nodes[2].id, Liveness::Down).await;

        let (result, states) = f
            .coordinator
            .execute_traced(write(ConsistencyLevel::Quorum))
            .await;
        assert!(matches!(
            result,
            Err(CoordinatorError::Unavailable {
                alive: 1,
                required: 2
            })
        ));
        assert_eq!(states.last(), Some(&QueryState::Failed));

        // ONE still succeeds on the local replica.
        assert!(f.coordinator.execute(write(ConsistencyLevel::One)).await.is_ok());
    }

    #[tokio::test]
    async fn test_write_timeout_reports_acks() {
        let client = MockReplicaClient {
            slow_nodes: [NodeId::from_name("n1"), NodeId::from_name("n2")].into(),
            ..MockReplicaClient::default()
        };
        let f = fixture(client, TombstoneThresholds::default());

        let (result, states) = f
            .coordinator
            .execute_traced(write(ConsistencyLevel::All))
            .await;
        assert!(matches!(
            result,
            Err(CoordinatorError::WriteTimeout {
                acks_received: 1,
                acks_required: 3
            })
        ));
        assert_eq!(states.last(), Some(&QueryState::Timeout));
    }

    #[tokio::test]
    async fn test_read_timeout_when_replicas_fail() {
        let client = MockReplicaClient {
            fail_nodes: [NodeId::from_name("n1"), NodeId::from_name("n2")].into(),
            ..MockReplicaClient::default()
        };
        let f = fixture(client, TombstoneThresholds::default());

        let err = f
            .coordinator
            .execute(QueryPlan::read("app", "users", b"u1").with_consistency(ConsistencyLevel::Quorum))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::ReadTimeout {
                responses_received: 1,
                responses_required: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_any_succeeds_with_hint_only() {
        let dir = TempDir::new().unwrap();
        let f = fixture(MockReplicaClient::default(), TombstoneThresholds::default());
        for node in &f.nodes {
            f.membership.set_status(node.id, Liveness::Down).await;
        }

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (hints, _task) = spawn_hint_delivery_task(
            HintStore::open(dir.path(), FsyncPolicy::None).unwrap(),
            f.membership.clone(),
            Arc::new(MockReplicaClient::default()),
            HintDeliveryConfig {
                check_interval: Duration::from_secs(3600),
                ..HintDeliveryConfig::default()
            },
            shutdown_rx,
        );
        let coordinator = f.coordinator.with_hints(hints.clone());

        let ack = coordinator
            .execute(write(ConsistencyLevel::Any))
            .await
            .unwrap()
            .ack()
            .unwrap();
        assert_eq!(ack.acks_received, 0);
        assert_eq!(hints.pending(None).await.unwrap(), 3);

        let err = coordinator
            .execute(write(ConsistencyLevel::One))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Unavailable { alive: 0, .. }));
    }

    #[tokio::test]
    async fn test_base_write_updates_view_and_releases_batch() {
        let f = fixture(MockReplicaClient::default(), TombstoneThresholds::default());
        let plan = QueryPlan::write("app", "users", b"u1", vec![ColumnWrite::set("email", "a@x")])
            .with_consistency(ConsistencyLevel::All);
        f.coordinator.execute(plan).await.unwrap();

        let storage = f.coordinator.local_replica().storage().clone();
        assert_eq!(storage.read().await.pending_view_count(), 0);

        let rows = f
            .coordinator
            .execute(QueryPlan::read("app", "users_by_email", b"a@x"))
            .await
            .unwrap();
        assert_eq!(rows.rows().unwrap().rows.len(), 1);
    }

    #[tokio::test]
    async fn test_tombstone_warning_attached() {
        let f = fixture(
            MockReplicaClient::default(),
            TombstoneThresholds { warn: 1, fail: 100 },
        );
        for row in ["a", "b", "c"] {
            let plan = QueryPlan::delete("app", "users", b"u1")
                .with_row(ClusteringKey::from(row))
                .with_consistency(ConsistencyLevel::All);
            f.coordinator.execute(plan).await.unwrap();
        }

        let result = f
            .coordinator
            .execute(QueryPlan::read("app", "users", b"u1"))
            .await
            .unwrap();
        let result = result.rows().unwrap();
        assert!(result.rows.is_empty());
        assert_eq!(result.warnings.len(), 1);
    }

    fn hint_task(f: &Fixture, dir: &TempDir) -> (HintHandle, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (hints, _task) = spawn_hint_delivery_task(
            HintStore::open(dir.path(), FsyncPolicy::None).unwrap(),
            f.membership.clone(),
            Arc::new(MockReplicaClient::default()),
            HintDeliveryConfig {
                check_interval: Duration::from_secs(3600),
                ..HintDeliveryConfig::default()
            },
            shutdown_rx,
        );
        (hints, shutdown_tx)
    }

    #[tokio::test]
    async fn test_only_unreachable_replicas_get_hints() {
        let dir = TempDir::new().unwrap();
        let client = MockReplicaClient {
            fail_nodes: [NodeId::from_name("n1")].into(),
            refuse_nodes: [NodeId::from_name("n2")].into(),
            ..MockReplicaClient::default()
        };
        let f = fixture(client, TombstoneThresholds::default());
        let (hints, _shutdown) = hint_task(&f, &dir);
        let coordinator = f.coordinator.with_hints(hints.clone());

        let err = coordinator
            .execute(write(ConsistencyLevel::All))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::WriteTimeout { acks_received: 1, .. }));
        assert_eq!(hints.pending(Some(NodeId::from_name("n1"))).await.unwrap(), 1);
        assert_eq!(hints.pending(Some(NodeId::from_name("n2"))).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_full_repair_reports_repaired_replicas() {
        let f = fixture(MockReplicaClient::default(), TombstoneThresholds::default());
        f.coordinator.execute(write(ConsistencyLevel::All)).await.unwrap();

        // The mocks answer reads with nothing, so both are behind the local node.
        let partition = PartitionKey::new("app", "users", b"u1".to_vec());
        let repaired = f
            .coordinator
            .spawn_full_repair(f.nodes.clone(), partition, ReadFilter::all())
            .await
            .unwrap();
        assert_eq!(repaired, 2);
    }
}
