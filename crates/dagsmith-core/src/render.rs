//! Template rendering capability
//!
//! The compiler consumes rendering as a black box: templated text plus a
//! context in, SQL out. The template language itself lives behind this trait.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::TargetConfig;
use crate::node::{NodeId, ResourceKind};

/// Turns templated text into a final string
pub trait Renderer: Send + Sync {
    /// Render `template` against `context`
    ///
    /// Fails with [`RenderError`] when the template references an undefined
    /// name or has malformed syntax.
    fn render(&self, template: &str, context: &RenderContext) -> Result<String, RenderError>;
}

/// A dependency a template may reference through `ref()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefTarget {
    pub unique_id: NodeId,
    pub package: String,
    pub name: String,

    /// What `ref()` renders to: a relation name, or an ephemeral CTE marker
    pub rendered: String,
}

/// A source table a template may reference through `source()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTarget {
    pub unique_id: NodeId,
    pub source_name: String,
    pub name: String,
    pub rendered: String,
}

/// The node being rendered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeContext {
    pub unique_id: NodeId,
    pub name: String,
    pub package_name: String,
    pub resource_type: ResourceKind,
}

/// Everything a template can see while rendering one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderContext {
    pub model: NodeContext,

    /// The node's own relation, rendered
    pub this: String,

    /// Resolved dependency nodes
    pub refs: Vec<RefTarget>,

    /// Resolved dependency sources
    pub sources: Vec<SourceTarget>,

    /// Project vars merged with per-run overrides
    pub vars: BTreeMap<String, serde_json::Value>,

    pub target: TargetConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("Undefined name '{name}'")]
    UndefinedName { name: String },

    #[error("Template syntax error: {message}")]
    Syntax { message: String },

    #[error("Render error: {message}")]
    Other { message: String },
}
