//! Keyspaces, tables and materialized view definitions known to a node.

use cirrus_config::{NodeConfig, BASE_CLUSTERING_KEY, BASE_PARTITION_KEY};
use cirrus_ring::Keyspace;
use std::collections::{BTreeMap, BTreeSet};

/// One component of a view's partition or clustering key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    /// The base row's partition key.
    PartitionKey,
    /// The base row's clustering key.
    ClusteringKey,
    /// The value of a regular base column.
    Column(String),
}

impl KeyPart {
    pub fn parse(s: &str) -> Self {
        match s {
            BASE_PARTITION_KEY => KeyPart::PartitionKey,
            BASE_CLUSTERING_KEY => KeyPart::ClusteringKey,
            column => KeyPart::Column(column.to_string()),
        }
    }

    pub fn column(&self) -> Option<&str> {
        match self {
            KeyPart::Column(c) => Some(c),
            _ => None,
        }
    }
}

/// A materialized view over a base table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewDef {
    pub keyspace: String,
    pub name: String,
    pub base_table: String,
    pub partition_key: Vec<KeyPart>,
    pub clustering: Vec<KeyPart>,
    /// Columns that must be non-null besides those in the key.
    pub filter_columns: Vec<String>,
}

impl ViewDef {
    /// Base key parts missing from the view key are appended to its
    /// clustering key, so every base row maps to a distinct view row.
    pub fn new(
        keyspace: &str,
        name: &str,
        base_table: &str,
        partition_key: Vec<KeyPart>,
        mut clustering: Vec<KeyPart>,
        filter_columns: Vec<String>,
    ) -> Self {
        for part in [KeyPart::PartitionKey, KeyPart::ClusteringKey] {
            if !partition_key.contains(&part) && !clustering.contains(&part) {
                clustering.push(part);
            }
        }
        Self {
            keyspace: keyspace.to_string(),
            name: name.to_string(),
            base_table: base_table.to_string(),
            partition_key,
            clustering,
            filter_columns,
        }
    }

    /// Regular base columns that must be non-null for a row to be in the view.
    pub fn referenced_columns(&self) -> BTreeSet<&str> {
        self.partition_key
            .iter()
            .chain(&self.clustering)
            .filter_map(KeyPart::column)
            .chain(self.filter_columns.iter().map(String::as_str))
            .collect()
    }

    /// The base column whose cell decides the view row's liveness, if any.
    pub fn liveness_column(&self) -> Option<&str> {
        self.referenced_columns().into_iter().next()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Base,
    View,
}

/// Immutable schema shared by a node's coordinator and replica.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    keyspaces: BTreeMap<String, Keyspace>,
    tables: BTreeSet<(String, String)>,
    views: Vec<ViewDef>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        let mut schema = Schema::new();
        for ks in &config.keyspaces {
            let keyspace = match (&ks.replication_factor, &ks.datacenter_factors) {
                (_, Some(factors)) => {
                    let factors: Vec<(&str, usize)> =
                        factors.iter().map(|(dc, f)| (dc.as_str(), *f)).collect();
                    Keyspace::network_aware(&ks.name, &factors)
                }
                (factor, None) => Keyspace::simple(&ks.name, factor.unwrap_or(1)),
            };
            schema.add_keyspace(keyspace);
        }
        for table in &config.tables {
            schema.add_table(&table.keyspace, &table.name);
        }
        for view in &config.views {
            schema.add_view(ViewDef::new(
                &view.keyspace,
                &view.name,
                &view.base_table,
                view.partition_key.iter().map(|p| KeyPart::parse(p)).collect(),
                view.clustering.iter().map(|p| KeyPart::parse(p)).collect(),
                view.filter_columns.clone(),
            ));
        }
        schema
    }

    pub fn add_keyspace(&mut self, keyspace: Keyspace) {
        self.keyspaces.insert(keyspace.name.clone(), keyspace);
    }

    pub fn add_table(&mut self, keyspace: &str, table: &str) {
        self.tables.insert((keyspace.to_string(), table.to_string()));
    }

    pub fn add_view(&mut self, view: ViewDef) {
        self.views.push(view);
    }

    pub fn keyspace(&self, name: &str) -> Option<&Keyspace> {
        self.keyspaces.get(name)
    }

    pub fn table_kind(&self, keyspace: &str, table: &str) -> Option<TableKind> {
        if self
            .tables
            .contains(&(keyspace.to_string(), table.to_string()))
        {
            return Some(TableKind::Base);
        }
        self.views
            .iter()
            .any(|v| v.keyspace == keyspace && v.name == table)
            .then_some(TableKind::View)
    }

    /// Views maintained from a base table.
    pub fn views_for(&self, keyspace: &str, base_table: &str) -> Vec<&ViewDef> {
        self.views
            .iter()
            .filter(|v| v.keyspace == keyspace && v.base_table == base_table)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_ring::ReplicationStrategy;

    #[test]
    fn test_view_key_always_carries_base_key() {
        let view = ViewDef::new(
            "app",
            "by_email",
            "users",
            vec![KeyPart::Column("email".into())],
            vec![],
            vec![],
        );
        assert_eq!(
            view.clustering,
            vec![KeyPart::PartitionKey, KeyPart::ClusteringKey]
        );
        assert_eq!(view.liveness_column(), Some("email"));

        let keyed = ViewDef::new(
            "app",
            "v",
            "users",
            vec![KeyPart::ClusteringKey],
            vec![KeyPart::PartitionKey],
            vec![],
        );
        assert_eq!(keyed.clustering, vec![KeyPart::PartitionKey]);
        assert_eq!(keyed.liveness_column(), None);
    }

    #[test]
    fn test_schema_from_config() {
        let config = cirrus_config::load_from_str(
            r#"
keyspaces:
  - name: app
    replication_factor: 3
  - name: geo
    datacenter_factors: { east: 2, west: 1 }
tables:
  - keyspace: app
    name: users
views:
  - keyspace: app
    name: users_by_email
    base_table: users
    partition_key: [email]
"#,
        )
        .unwrap();
        let schema = Schema::from_config(&config);

        assert_eq!(
            schema.keyspace("app").unwrap().strategy,
            ReplicationStrategy::Simple { factor: 3 }
        );
        assert_eq!(
            schema.keyspace("geo").unwrap().strategy.replication_factor(),
            3
        );
        assert_eq!(schema.table_kind("app", "users"), Some(TableKind::Base));
        assert_eq!(
            schema.table_kind("app", "users_by_email"),
            Some(TableKind::View)
        );
        assert_eq!(schema.table_kind("app", "missing"), None);
        assert_eq!(schema.views_for("app", "users").len(), 1);
        assert!(schema.views_for("geo", "users").is_empty());
    }
}
