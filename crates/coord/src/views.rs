//! Materialized view maintenance.
//!
//! A replica calls [`derive`] under its storage write lock with the rows a
//! base write touches, before and after the write. The result is the set of
//! view mutations that keep every view equal to a projection of its base.
//!
//! A view row is live only while its row marker is. The marker follows a
//! single base cell: the one regular column the view references, or the base
//! row marker when it references none. The view delete issued when a row
//! leaves a view key carries the base write's timestamp, which is newer than
//! that cell and older than any later write that could move the row back.
//! Other cells of the view row may be newer than that delete and survive it,
//! so they never make a view row live on their own.

use crate::schema::{KeyPart, ViewDef};
use cirrus_storage::{
    compose, ClusteringKey, Deletion, Mutation, PartitionData, PartitionKey, Row, RowMarker,
};
use std::collections::{BTreeMap, BTreeSet};

/// Where a base row lands in a view.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ViewKey {
    partition: PartitionKey,
    clustering: ClusteringKey,
}

/// Base rows a write can change: its own rows, plus every existing row when
/// it carries a partition deletion.
pub fn affected_rows(before: &PartitionData, update: &PartitionData) -> BTreeSet<ClusteringKey> {
    let mut keys: BTreeSet<ClusteringKey> = update.rows.keys().cloned().collect();
    if update.deletion.is_some() {
        keys.extend(before.rows.keys().cloned());
    }
    keys
}

/// View mutations for applying `update` on top of `before`.
///
/// `before` must hold at least the affected rows of the base partition.
pub fn derive(
    views: &[&ViewDef],
    base: &PartitionKey,
    before: &PartitionData,
    update: &PartitionData,
    now_secs: i64,
) -> Vec<Mutation> {
    let Some(timestamp) = update.max_timestamp() else {
        return Vec::new();
    };
    if views.is_empty() {
        return Vec::new();
    }

    let mut after = before.clone();
    after.merge(update.clone());
    let rows = affected_rows(before, update);

    let mut out: BTreeMap<PartitionKey, PartitionData> = BTreeMap::new();
    for view in views {
        for clustering in &rows {
            let old_row = before.row(clustering);
            let new_row = after.row(clustering);
            let old_key = view_key(view, base, clustering, old_row, now_secs);
            let new_key = view_key(view, base, clustering, new_row, now_secs);

            if let Some(old) = &old_key {
                if new_key.as_ref() != Some(old) {
                    let row = out
                        .entry(old.partition.clone())
                        .or_default()
                        .row_mut(old.clustering.clone());
                    row.deletion = Deletion::supersede(row.deletion, Some(Deletion::new(timestamp)));
                }
            }

            if let (Some(new), Some(base_row)) = (new_key, new_row) {
                let mut data = PartitionData::new();
                data.rows.insert(
                    new.clustering,
                    project(view, base_row, after.deletion),
                );
                out.entry(new.partition).or_default().merge(data);
            }
        }
    }

    out.into_iter()
        .map(|(partition, data)| Mutation::new(partition, data))
        .collect()
}

/// The view key of a base row, or `None` when the row is not in the view.
fn view_key(
    view: &ViewDef,
    base: &PartitionKey,
    clustering: &ClusteringKey,
    row: Option<&Row>,
    now_secs: i64,
) -> Option<ViewKey> {
    let row = row.filter(|r| r.is_live(now_secs))?;
    for column in view.referenced_columns() {
        row.live_value(column, now_secs)?;
    }

    let part = |p: &KeyPart| -> Option<Vec<u8>> {
        match p {
            KeyPart::PartitionKey => Some(base.key.clone()),
            KeyPart::ClusteringKey => Some(clustering.as_bytes().to_vec()),
            KeyPart::Column(c) => row.live_value(c, now_secs).map(<[u8]>::to_vec),
        }
    };
    let partition_parts = view.partition_key.iter().map(part).collect::<Option<Vec<_>>>()?;
    let clustering_parts = view.clustering.iter().map(part).collect::<Option<Vec<_>>>()?;

    let encoded = compose(&partition_parts).and_then(|partition| {
        let clustering = if clustering_parts.is_empty() {
            ClusteringKey::EMPTY
        } else {
            ClusteringKey::new(compose(&clustering_parts)?)
        };
        Ok((partition, clustering))
    });
    match encoded {
        Ok((partition, clustering)) => Some(ViewKey {
            partition: PartitionKey::new(&view.keyspace, &view.name, partition),
            clustering,
        }),
        Err(e) => {
            tracing::warn!("{} row left out of view {}: {}", base, view.name, e);
            None
        }
    }
}

/// The view row for a live base row.
fn project(view: &ViewDef, base_row: &Row, partition_deletion: Option<Deletion>) -> Row {
    let liveness = view
        .liveness_column()
        .and_then(|c| base_row.cells.get(c));

    let mut row = Row::new();
    row.marker = match liveness {
        Some(cell) => Some(RowMarker::new(cell.timestamp, cell.expires_at)),
        // A base row kept alive by cells alone.
        None => base_row.marker.or_else(|| {
            base_row
                .cells
                .values()
                .filter(|c| !c.is_tombstone())
                .map(|c| c.timestamp)
                .max()
                .map(|ts| RowMarker::new(ts, None))
        }),
    };
    row.deletion = Deletion::supersede(base_row.deletion, partition_deletion);

    // Nothing in the view outlives the cell that keeps the row there.
    let cap = liveness.and_then(|c| c.expires_at);
    for (column, cell) in &base_row.cells {
        let mut cell = cell.clone();
        if let (Some(cap), false) = (cap, cell.is_tombstone()) {
            cell.expires_at = Some(cell.expires_at.map_or(cap, |e| e.min(cap)));
        }
        row.cells.insert(column.clone(), cell);
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_storage::Cell;

    const NOW: i64 = 1_000;

    fn email_view() -> ViewDef {
        ViewDef::new(
            "app",
            "by_email",
            "users",
            vec![KeyPart::Column("email".into())],
            vec![],
            vec![],
        )
    }

    fn base() -> PartitionKey {
        PartitionKey::new("app", "users", b"u1".to_vec())
    }

    fn set(column: &str, value: &str, ts: i64) -> PartitionData {
        let mut p = PartitionData::new();
        let row = p.row_mut(ClusteringKey::EMPTY);
        row.marker = Some(RowMarker::new(ts, None));
        row.set_cell(column, Cell::live(value, ts));
        p
    }

    fn view_partition(email: &str) -> PartitionKey {
        PartitionKey::new("app", "by_email", email.as_bytes().to_vec())
    }

    fn view_clustering() -> ClusteringKey {
        ClusteringKey::new(compose(&[b"u1".to_vec(), Vec::new()]).unwrap())
    }

    #[test]
    fn test_insert_creates_view_row() {
        let view = email_view();
        let out = derive(&[&view], &base(), &PartitionData::new(), &set("email", "a@x", 10), NOW);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].partition, view_partition("a@x"));
        let row = out[0].data.row(&view_clustering()).unwrap();
        assert_eq!(row.marker, Some(RowMarker::new(10, None)));
        assert_eq!(row.live_value("email", NOW), Some(&b"a@x"[..]));
    }

    #[test]
    fn test_row_without_key_column_is_not_in_view() {
        let view = email_view();
        let out = derive(&[&view], &base(), &PartitionData::new(), &set("name", "bob", 10), NOW);
        assert!(out.is_empty());
    }

    #[test]
    fn test_key_change_deletes_old_view_row() {
        let view = email_view();
        let before = set("email", "a@x", 10);
        let out = derive(&[&view], &base(), &before, &set("email", "b@x", 20), NOW);
        assert_eq!(out.len(), 2);

        let old = out.iter().find(|m| m.partition == view_partition("a@x")).unwrap();
        assert_eq!(
            old.data.row(&view_clustering()).unwrap().deletion,
            Some(Deletion::new(20))
        );
        let new = out.iter().find(|m| m.partition == view_partition("b@x")).unwrap();
        assert!(new.data.row(&view_clustering()).unwrap().is_live(NOW));
    }

    #[test]
    fn test_null_key_column_deletes_view_row() {
        let view = email_view();
        let before = set("email", "a@x", 10);
        let mut update = PartitionData::new();
        update
            .row_mut(ClusteringKey::EMPTY)
            .set_cell("email", Cell::tombstone(20));
        let out = derive(&[&view], &base(), &before, &update, NOW);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].partition, view_partition("a@x"));
        assert!(out[0].data.row(&view_clustering()).unwrap().deletion.is_some());
    }

    #[test]
    fn test_partition_deletion_removes_every_row() {
        let view = email_view();
        let before = set("email", "a@x", 10);
        let out = derive(&[&view], &base(), &before, &PartitionData::deleted(20), NOW);
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].data.row(&view_clustering()).unwrap().deletion,
            Some(Deletion::new(20))
        );
    }

    #[test]
    fn test_losing_write_changes_nothing_in_key() {
        let view = email_view();
        let before = set("email", "a@x", 20);
        let out = derive(&[&view], &base(), &before, &set("email", "b@x", 10), NOW);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].partition, view_partition("a@x"));
        assert!(out[0].data.row(&view_clustering()).unwrap().deletion.is_none());
    }

    #[test]
    fn test_view_cells_expire_with_key_cell() {
        let view = email_view();
        let mut update = PartitionData::new();
        let row = update.row_mut(ClusteringKey::EMPTY);
        row.set_cell("email", Cell::expiring("a@x", 10, 2_000));
        row.set_cell("name", Cell::live("bob", 10));
        let out = derive(&[&view], &base(), &PartitionData::new(), &update, NOW);
        let row = out[0].data.row(&view_clustering()).unwrap();
        assert_eq!(row.marker, Some(RowMarker::new(10, Some(2_000))));
        assert_eq!(row.cells["name"].expires_at, Some(2_000));
        assert!(!row.is_live(2_000));
    }

    #[test]
    fn test_key_moving_back_is_not_shadowed() {
        let view = email_view();
        let mut state = PartitionData::new();
        let mut view_a = PartitionData::new();
        for (email, ts) in [("a@x", 10), ("b@x", 20), ("a@x", 30)] {
            let update = set("email", email, ts);
            for m in derive(&[&view], &base(), &state, &update, NOW) {
                if m.partition == view_partition("a@x") {
                    view_a.merge(m.data);
                }
            }
            state.merge(update);
        }
        assert!(view_a.row(&view_clustering()).unwrap().is_live(NOW));
    }

    #[test]
    fn test_newer_cell_does_not_keep_moved_row_alive() {
        let view = email_view();
        let mut state = PartitionData::new();
        let mut view_a = PartitionData::new();
        let mut view_b = PartitionData::new();
        // The key change at 15 arrives after an unrelated write at 20.
        for update in [set("email", "a@x", 10), set("name", "bob", 20), set("email", "b@x", 15)] {
            for m in derive(&[&view], &base(), &state, &update, NOW) {
                if m.partition == view_partition("a@x") {
                    view_a.merge(m.data);
                } else if m.partition == view_partition("b@x") {
                    view_b.merge(m.data);
                }
            }
            state.merge(update);
        }

        let stale = view_a.row(&view_clustering()).unwrap();
        assert_eq!(stale.live_value("name", NOW), Some(&b"bob"[..]));
        assert_eq!(view_a.marked_rows(NOW).count(), 0);
        assert_eq!(view_b.marked_rows(NOW).count(), 1);
    }

    #[test]
    fn test_marker_from_cells_when_key_has_no_column() {
        let view = ViewDef::new(
            "app",
            "by_id",
            "users",
            vec![KeyPart::PartitionKey],
            vec![],
            vec![],
        );
        let mut update = PartitionData::new();
        update
            .row_mut(ClusteringKey::EMPTY)
            .set_cell("name", Cell::live("bob", 10));
        let out = derive(&[&view], &base(), &PartitionData::new(), &update, NOW);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data.marked_rows(NOW).count(), 1);
    }

    #[test]
    fn test_oversized_view_key_is_left_out() {
        let view = ViewDef::new(
            "app",
            "by_email_name",
            "users",
            vec![KeyPart::Column("email".into()), KeyPart::Column("name".into())],
            vec![],
            vec![],
        );
        let mut update = set("email", "a@x", 10);
        let huge = "n".repeat(u16::MAX as usize + 1);
        update
            .row_mut(ClusteringKey::EMPTY)
            .set_cell("name", Cell::live(huge.as_str(), 10));
        let out = derive(&[&view], &base(), &PartitionData::new(), &update, NOW);
        assert!(out.is_empty());
    }
}
