//! manifest.json parsing
//!
//! The manifest is the arena that owns every node for one invocation.
//! Sources are kept apart from executable nodes, mirroring the on-disk
//! layout, but lookups treat both maps as one namespace.

use dagsmith_core::{Node, NodeId, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Node container (subset of manifest.json we care about)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Metadata about the manifest
    #[serde(default)]
    pub metadata: ManifestMetadata,

    /// Model, seed, snapshot, test and macro-call nodes
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, Node>,

    /// Source definitions
    #[serde(default)]
    pub sources: BTreeMap<NodeId, Node>,

    /// User-defined macros, keyed by unique_id
    #[serde(default)]
    pub macros: BTreeMap<String, MacroDefinition>,
}

impl Manifest {
    /// Load manifest from file
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ManifestError::IoError(path.display().to_string(), e.to_string()))?;

        Self::from_str(&contents)
    }

    /// Parse manifest from JSON string
    ///
    /// Disabled nodes are dropped immediately; they never reach the graph.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(json: &str) -> Result<Self, ManifestError> {
        let mut manifest: Manifest = serde_json::from_str(json)
            .map_err(|e| ManifestError::ParseError(e.to_string()))?;
        manifest.remove_disabled();
        Ok(manifest)
    }

    /// Build a manifest from already-parsed nodes
    pub fn from_nodes<I>(nodes: I) -> Self
    where
        I: IntoIterator<Item = Node>,
    {
        let mut manifest = Self::default();
        for node in nodes {
            manifest.insert(node);
        }
        manifest.remove_disabled();
        manifest
    }

    /// Insert a node into the right map for its kind
    pub fn insert(&mut self, node: Node) {
        if node.resource_type == ResourceKind::Source {
            self.sources.insert(node.unique_id.clone(), node);
        } else {
            self.nodes.insert(node.unique_id.clone(), node);
        }
    }

    pub fn add_macro(&mut self, definition: MacroDefinition) {
        self.macros.insert(definition.unique_id.clone(), definition);
    }

    /// Drop disabled nodes, returning their ids
    pub fn remove_disabled(&mut self) -> Vec<NodeId> {
        let disabled: Vec<NodeId> = self
            .iter()
            .filter(|node| !node.config.enabled)
            .map(|node| node.unique_id.clone())
            .collect();

        for id in &disabled {
            self.nodes.remove(id);
            self.sources.remove(id);
        }

        if !disabled.is_empty() {
            tracing::debug!(count = disabled.len(), "dropped disabled nodes");
        }

        disabled
    }

    /// Get a node or source by unique_id
    pub fn get(&self, unique_id: &str) -> Option<&Node> {
        self.nodes
            .get(unique_id)
            .or_else(|| self.sources.get(unique_id))
    }

    /// Mutable access to an executable node; sources are never mutated
    pub fn get_mut(&mut self, unique_id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(unique_id)
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.nodes.contains_key(unique_id) || self.sources.contains_key(unique_id)
    }

    /// All nodes and sources, ordered by unique_id within each map
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().chain(self.sources.values())
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.sources.is_empty()
    }

    /// Get all model nodes
    pub fn models(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .values()
            .filter(|node| node.resource_type == ResourceKind::Model)
    }

    /// Find a node by name, optionally constrained to a package
    pub fn find_by_name(&self, package: Option<&str>, name: &str) -> Option<&Node> {
        self.iter().find(|node| {
            node.name == name && package.map_or(true, |p| node.package_name == p)
        })
    }

    /// Root project name from metadata, if recorded
    pub fn project_name(&self) -> Option<&str> {
        self.metadata.project_name.as_deref()
    }
}

/// Manifest metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    #[serde(default)]
    pub dbt_schema_version: String,

    #[serde(default)]
    pub generated_at: String,

    #[serde(default)]
    pub invocation_id: Option<String>,

    /// Name of the root project
    #[serde(default)]
    pub project_name: Option<String>,
}

/// A user-defined macro
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroDefinition {
    /// Unique identifier (e.g., "macro.my_project.cents_to_dollars")
    pub unique_id: String,

    pub name: String,

    pub package_name: String,

    /// Full `{% macro %} ... {% endmacro %}` source
    pub macro_sql: String,
}

impl MacroDefinition {
    pub fn new(package: impl Into<String>, name: impl Into<String>, macro_sql: impl Into<String>) -> Self {
        let package_name = package.into();
        let name = name.into();
        Self {
            unique_id: format!("macro.{}.{}", package_name, name),
            name,
            package_name,
            macro_sql: macro_sql.into(),
        }
    }
}

/// Manifest parsing errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read manifest file {0}: {1}")]
    IoError(String, String),

    #[error("Failed to parse manifest JSON: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "metadata": {"dbt_schema_version": "v1", "generated_at": "2024-01-01T00:00:00Z", "project_name": "jaffle"},
        "nodes": {
            "model.jaffle.orders": {
                "unique_id": "model.jaffle.orders",
                "name": "orders",
                "resource_type": "model",
                "package_name": "jaffle",
                "raw_sql": "select * from {{ source('raw', 'orders') }}",
                "depends_on": {"nodes": ["source.jaffle.raw.orders"]}
            },
            "model.jaffle.legacy": {
                "unique_id": "model.jaffle.legacy",
                "name": "legacy",
                "resource_type": "model",
                "package_name": "jaffle",
                "config": {"enabled": false}
            }
        },
        "sources": {
            "source.jaffle.raw.orders": {
                "unique_id": "source.jaffle.raw.orders",
                "name": "orders",
                "resource_type": "source",
                "package_name": "jaffle",
                "source_name": "raw",
                "schema": "raw",
                "identifier": "orders_v2"
            }
        },
        "macros": {
            "macro.jaffle.cents": {
                "unique_id": "macro.jaffle.cents",
                "name": "cents",
                "package_name": "jaffle",
                "macro_sql": "{% macro cents(c) %}{{ c }} / 100{% endmacro %}"
            }
        }
    }"#;

    #[test]
    fn parse_manifest() {
        let manifest = Manifest::from_str(MANIFEST).unwrap();

        assert_eq!(manifest.project_name(), Some("jaffle"));
        assert_eq!(manifest.len(), 2);
        assert!(manifest.contains("source.jaffle.raw.orders"));
        assert_eq!(manifest.models().count(), 1);

        let source = manifest.get("source.jaffle.raw.orders").unwrap();
        assert_eq!(source.relation_name(), "orders_v2");
        assert_eq!(manifest.macros.len(), 1);
    }

    #[test]
    fn disabled_nodes_are_dropped() {
        let manifest = Manifest::from_str(MANIFEST).unwrap();
        assert!(manifest.get("model.jaffle.legacy").is_none());
    }

    #[test]
    fn from_nodes_routes_sources() {
        let mut manifest = Manifest::from_nodes(vec![
            Node::new(ResourceKind::Model, "p", "a"),
            Node::source("p", "raw", "events"),
        ]);
        assert_eq!(manifest.nodes.len(), 1);
        assert_eq!(manifest.sources.len(), 1);
        assert!(manifest.get_mut("source.p.raw.events").is_none());
        assert_eq!(manifest.find_by_name(Some("p"), "a").unwrap().unique_id, "model.p.a");
    }

    #[test]
    fn manifest_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, MANIFEST).unwrap();

        let manifest = Manifest::from_file(&path).unwrap();
        assert_eq!(manifest.nodes.len(), 1);

        let missing = Manifest::from_file(&dir.path().join("nope.json"));
        assert!(matches!(missing, Err(ManifestError::IoError(_, _))));
    }
}
