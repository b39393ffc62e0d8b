//! Relation identifiers
//!
//! Identifies a physical relation (table or view) in the target backend.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::TargetConfig;
use crate::node::Node;

/// Identifies a relation in the backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationIdentifier {
    /// Database/project name (omitted from rendering when absent)
    pub database: Option<String>,

    /// Schema/dataset name
    pub schema: String,

    /// Relation name
    pub identifier: String,
}

impl RelationIdentifier {
    pub fn new(schema: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            database: None,
            schema: schema.into(),
            identifier: identifier.into(),
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Relation a node materializes into, with target defaults applied
    pub fn for_node(node: &Node, target: &TargetConfig) -> Self {
        Self {
            database: node.database.clone().or_else(|| target.database.clone()),
            schema: node.schema.clone().unwrap_or_else(|| target.schema.clone()),
            identifier: node.relation_name().to_string(),
        }
    }

    /// Same relation with a different identifier (temp/backup relations)
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self {
            database: self.database.clone(),
            schema: self.schema.clone(),
            identifier: format!("{}{}", self.identifier, suffix),
        }
    }

    /// Case-insensitive key used for caching and locking
    ///
    /// Two nodes that differ only in case or quoting map to the same key.
    pub fn lock_key(&self) -> String {
        format!(
            "{}.{}",
            self.schema.to_lowercase(),
            self.identifier.to_lowercase()
        )
    }

    /// Case-insensitive key including the database
    pub fn cache_key(&self) -> String {
        match &self.database {
            Some(db) => format!("{}.{}", db.to_lowercase(), self.lock_key()),
            None => self.lock_key(),
        }
    }

    /// Render as SQL, optionally quoting each part
    pub fn render(&self, quote: bool) -> String {
        let part = |s: &str| {
            if quote {
                format!("\"{}\"", s.replace('"', "\"\""))
            } else {
                s.to_string()
            }
        };

        let mut parts = Vec::with_capacity(3);
        if let Some(db) = &self.database {
            parts.push(part(db));
        }
        parts.push(part(&self.schema));
        parts.push(part(&self.identifier));
        parts.join(".")
    }
}

impl fmt::Display for RelationIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ResourceKind;

    #[test]
    fn render_with_and_without_quotes() {
        let rel = RelationIdentifier::new("analytics", "orders").with_database("warehouse");
        assert_eq!(rel.render(false), "warehouse.analytics.orders");
        assert_eq!(rel.render(true), "\"warehouse\".\"analytics\".\"orders\"");
        assert_eq!(rel.to_string(), "warehouse.analytics.orders");
    }

    #[test]
    fn lock_key_ignores_case() {
        let a = RelationIdentifier::new("Analytics", "Orders");
        let b = RelationIdentifier::new("analytics", "orders");
        assert_eq!(a.lock_key(), b.lock_key());
    }

    #[test]
    fn node_relation_uses_target_defaults() {
        let target = TargetConfig::default();
        let node = Node::new(ResourceKind::Model, "p", "orders").with_alias("fct_orders");
        let rel = RelationIdentifier::for_node(&node, &target);
        assert_eq!(rel.schema, target.schema);
        assert_eq!(rel.identifier, "fct_orders");
        assert_eq!(rel.with_suffix("__dbt_tmp").identifier, "fct_orders__dbt_tmp");
    }
}
