//! Node model
//!
//! A node is one compilable unit (model, seed, snapshot, test, source or
//! macro call). Nodes are created by the project parser and mutated only by
//! the compiler, which records the compiled and injected SQL exactly once.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::InternalError;

/// Node identifier (unique_id from manifest)
pub type NodeId = String;

/// Kind of resource a node was parsed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Model,
    Seed,
    Snapshot,
    Test,
    Source,
    /// Ad-hoc macro invocation (e.g. an operation or hook statement)
    #[serde(alias = "operation")]
    MacroCall,
}

impl ResourceKind {
    /// Stable string form, used as the unique_id prefix
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Seed => "seed",
            Self::Snapshot => "snapshot",
            Self::Test => "test",
            Self::Source => "source",
            Self::MacroCall => "macro_call",
        }
    }

    /// Whether nodes of this kind can ever be executed against the backend
    pub fn is_runnable(&self) -> bool {
        !matches!(self, Self::Source)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a node is persisted in the target backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Materialization {
    View,
    Table,
    Incremental,
    /// Never executed; inlined into dependents as a CTE
    Ephemeral,
    Seed,
    Snapshot,
    /// Data tests; the SQL runs as is and no relation is built
    Test,
}

impl Materialization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Table => "table",
            Self::Incremental => "incremental",
            Self::Ephemeral => "ephemeral",
            Self::Seed => "seed",
            Self::Snapshot => "snapshot",
            Self::Test => "test",
        }
    }

    /// Whether running the node creates or replaces a relation
    pub fn builds_relation(&self) -> bool {
        !matches!(self, Self::Ephemeral | Self::Test)
    }
}

impl fmt::Display for Materialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Severity of a data test failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestSeverity {
    #[serde(alias = "WARN")]
    Warn,
    #[default]
    #[serde(alias = "ERROR")]
    Error,
}

/// Node configuration, resolved before the node reaches the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Whether the node is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Materialization override (falls back to the resource kind default)
    #[serde(default)]
    pub materialized: Option<Materialization>,

    /// Quote identifiers when rendering this node's relation
    #[serde(default)]
    pub quoting: Option<bool>,

    /// Per-node full refresh override
    #[serde(default)]
    pub full_refresh: Option<bool>,

    /// Unique key for incremental models and snapshots
    #[serde(default)]
    pub unique_key: Option<String>,

    /// Severity for test nodes
    #[serde(default)]
    pub severity: TestSeverity,

    /// Statements run before the materialization, inside its transaction
    #[serde(default, alias = "pre-hook")]
    pub pre_hook: Vec<String>,

    /// Statements run after the materialization, inside its transaction
    #[serde(default, alias = "post-hook")]
    pub post_hook: Vec<String>,

    /// Column type overrides for seeds
    #[serde(default)]
    pub column_types: BTreeMap<String, String>,

    #[serde(default)]
    pub persist_docs: serde_json::Value,

    /// Any other configuration, passed through untouched
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            materialized: None,
            quoting: None,
            full_refresh: None,
            unique_key: None,
            severity: TestSeverity::default(),
            pre_hook: Vec::new(),
            post_hook: Vec::new(),
            column_types: BTreeMap::new(),
            persist_docs: serde_json::Value::Null,
            extra: BTreeMap::new(),
        }
    }
}

/// Dependencies structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependsOn {
    /// List of node unique_ids this node depends on, in declaration order
    #[serde(default)]
    pub nodes: Vec<NodeId>,

    /// Macros referenced by this node
    #[serde(default)]
    pub macros: Vec<String>,
}

/// A CTE inlined into a node's injected SQL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedCte {
    /// unique_id of the ephemeral node the CTE was built from
    pub id: NodeId,

    /// CTE definition: `<marker> as (<sql>)`
    pub sql: String,
}

/// A compilable unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier (e.g., "model.my_project.users")
    pub unique_id: NodeId,

    /// Node name (e.g., "users")
    pub name: String,

    /// Resource kind (model, seed, test, ...)
    pub resource_type: ResourceKind,

    /// Package name
    pub package_name: String,

    /// Relative path to the source file
    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub original_file_path: String,

    /// Fully qualified name
    #[serde(default)]
    pub fqn: Vec<String>,

    #[serde(default)]
    pub database: Option<String>,

    #[serde(default)]
    pub schema: Option<String>,

    /// Alias (output relation name)
    #[serde(default, alias = "identifier")]
    pub alias: Option<String>,

    /// Source name (sources only)
    #[serde(default)]
    pub source_name: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Unrendered templated source (CSV payload for seeds)
    #[serde(default, alias = "raw_sql", alias = "raw_code")]
    pub raw_text: String,

    #[serde(default)]
    pub depends_on: DependsOn,

    #[serde(default)]
    pub config: NodeConfig,

    #[serde(default)]
    compiled: bool,

    #[serde(default, alias = "compiled_sql")]
    compiled_text: Option<String>,

    #[serde(default)]
    extra_ctes_injected: bool,

    #[serde(default)]
    extra_ctes: Vec<InjectedCte>,

    #[serde(default, alias = "injected_sql")]
    injected_text: Option<String>,
}

impl Node {
    /// Create a node with a unique_id derived from kind, package and name
    pub fn new(kind: ResourceKind, package: impl Into<String>, name: impl Into<String>) -> Self {
        let package = package.into();
        let name = name.into();
        Self {
            unique_id: Self::derive_unique_id(kind, &package, &name),
            fqn: vec![package.clone(), name.clone()],
            path: format!("{}.sql", name),
            original_file_path: String::new(),
            name,
            resource_type: kind,
            package_name: package,
            database: None,
            schema: None,
            alias: None,
            source_name: None,
            tags: Vec::new(),
            raw_text: String::new(),
            depends_on: DependsOn::default(),
            config: NodeConfig::default(),
            compiled: false,
            compiled_text: None,
            extra_ctes_injected: false,
            extra_ctes: Vec::new(),
            injected_text: None,
        }
    }

    /// Create a source node (`source.<package>.<source_name>.<name>`)
    pub fn source(package: impl Into<String>, source_name: impl Into<String>, name: impl Into<String>) -> Self {
        let source_name = source_name.into();
        let mut node = Self::new(ResourceKind::Source, package, name);
        node.unique_id = format!(
            "{}.{}.{}.{}",
            ResourceKind::Source,
            node.package_name,
            source_name,
            node.name
        );
        node.schema = Some(source_name.clone());
        node.source_name = Some(source_name);
        node
    }

    /// Derive the unique_id for a non-source node
    pub fn derive_unique_id(kind: ResourceKind, package: &str, name: &str) -> NodeId {
        format!("{}.{}.{}", kind, package, name)
    }

    pub fn with_raw_text(mut self, raw: impl Into<String>) -> Self {
        self.raw_text = raw.into();
        self
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.nodes = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_materialization(mut self, materialization: Materialization) -> Self {
        self.config.materialized = Some(materialization);
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Mark the node as already rendered with the given SQL
    ///
    /// Used when compiled SQL comes from an earlier pipeline stage (for
    /// example a manifest produced by another tool).
    pub fn with_compiled_text(mut self, compiled: impl Into<String>) -> Self {
        self.compiled_text = Some(compiled.into());
        self.compiled = true;
        self
    }

    /// Effective materialization: config override, else the kind default
    pub fn materialization(&self) -> Option<Materialization> {
        if let Some(m) = self.config.materialized {
            return Some(m);
        }
        match self.resource_type {
            ResourceKind::Model => Some(Materialization::View),
            ResourceKind::Seed => Some(Materialization::Seed),
            ResourceKind::Snapshot => Some(Materialization::Snapshot),
            ResourceKind::Test | ResourceKind::Source | ResourceKind::MacroCall => None,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.materialization() == Some(Materialization::Ephemeral)
    }

    /// Output relation name (alias, falling back to the node name)
    pub fn relation_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    pub fn is_injected(&self) -> bool {
        self.extra_ctes_injected
    }

    pub fn compiled_text(&self) -> Option<&str> {
        self.compiled_text.as_deref()
    }

    pub fn injected_text(&self) -> Option<&str> {
        self.injected_text.as_deref()
    }

    /// Flattened list of CTEs inlined into this node, deepest first
    pub fn extra_ctes(&self) -> &[InjectedCte] {
        &self.extra_ctes
    }

    /// Record the rendered SQL. May only happen once per node.
    pub fn record_compiled(&mut self, compiled: String) -> Result<(), InternalError> {
        if self.compiled {
            return Err(InternalError::AlreadyCompiled(self.unique_id.clone()));
        }
        self.compiled_text = Some(compiled);
        self.compiled = true;
        Ok(())
    }

    /// Record the final SQL after CTE inlining. May only happen once per
    /// node, and only after compilation.
    pub fn record_injected(
        &mut self,
        injected: String,
        extra_ctes: Vec<InjectedCte>,
    ) -> Result<(), InternalError> {
        if !self.compiled {
            return Err(InternalError::NotCompiled(self.unique_id.clone()));
        }
        if self.extra_ctes_injected {
            return Err(InternalError::AlreadyInjected(self.unique_id.clone()));
        }
        self.injected_text = Some(injected);
        self.extra_ctes = extra_ctes;
        self.extra_ctes_injected = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_id_derivation() {
        let model = Node::new(ResourceKind::Model, "jaffle", "orders");
        assert_eq!(model.unique_id, "model.jaffle.orders");

        let source = Node::source("jaffle", "raw", "customers");
        assert_eq!(source.unique_id, "source.jaffle.raw.customers");
        assert_eq!(source.schema.as_deref(), Some("raw"));
    }

    #[test]
    fn default_materialization_by_kind() {
        assert_eq!(
            Node::new(ResourceKind::Model, "p", "m").materialization(),
            Some(Materialization::View)
        );
        assert_eq!(
            Node::new(ResourceKind::Seed, "p", "s").materialization(),
            Some(Materialization::Seed)
        );
        assert_eq!(Node::new(ResourceKind::Test, "p", "t").materialization(), None);

        let eph = Node::new(ResourceKind::Model, "p", "e").with_materialization(Materialization::Ephemeral);
        assert!(eph.is_ephemeral());
    }

    #[test]
    fn compiled_and_injected_are_set_once() {
        let mut node = Node::new(ResourceKind::Model, "p", "m");

        // Injection before compilation violates injected => compiled
        assert!(matches!(
            node.record_injected("select 1".into(), vec![]),
            Err(InternalError::NotCompiled(_))
        ));

        node.record_compiled("select 1".into()).unwrap();
        assert!(matches!(
            node.record_compiled("select 2".into()),
            Err(InternalError::AlreadyCompiled(_))
        ));

        node.record_injected("select 1".into(), vec![]).unwrap();
        assert!(node.is_injected());
        assert!(matches!(
            node.record_injected("select 1".into(), vec![]),
            Err(InternalError::AlreadyInjected(_))
        ));
        assert_eq!(node.compiled_text(), Some("select 1"));
    }

    #[test]
    fn deserialize_manifest_node() {
        let json = r#"{
            "unique_id": "model.jaffle.orders",
            "name": "orders",
            "resource_type": "model",
            "package_name": "jaffle",
            "raw_sql": "select * from {{ ref('stg_orders') }}",
            "depends_on": {"nodes": ["model.jaffle.stg_orders"]},
            "config": {"materialized": "incremental", "unique_key": "id", "post-hook": ["analyze"]}
        }"#;

        let node: Node = serde_json::from_str(json).unwrap();
        assert_eq!(node.materialization(), Some(Materialization::Incremental));
        assert_eq!(node.config.unique_key.as_deref(), Some("id"));
        assert_eq!(node.config.post_hook, vec!["analyze".to_string()]);
        assert!(node.config.enabled);
        assert!(!node.is_compiled());
        assert_eq!(node.depends_on.nodes, vec!["model.jaffle.stg_orders".to_string()]);
    }

    #[test]
    fn deserialize_test_node_with_test_materialization() {
        let json = r#"{
            "unique_id": "test.jaffle.not_null_orders_id",
            "name": "not_null_orders_id",
            "resource_type": "test",
            "package_name": "jaffle",
            "raw_sql": "select * from {{ ref('orders') }} where id is null",
            "config": {"materialized": "test", "severity": "warn"}
        }"#;

        let node: Node = serde_json::from_str(json).unwrap();
        assert_eq!(node.materialization(), Some(Materialization::Test));
        assert_eq!(node.config.severity, TestSeverity::Warn);
        assert!(!node.is_ephemeral());
        assert!(!Materialization::Test.builds_relation());
        assert!(Materialization::Table.builds_relation());
        assert_eq!(Materialization::Test.to_string(), "test");
    }
}
