//! Template context
//!
//! Flattens a [`RenderContext`] into the values a template sees. Lookup
//! tables for `ref()`, `source()` and `var()` live under a reserved key so
//! they do not collide with user variables.

use dagsmith_core::{NodeContext, RenderContext, TargetConfig};
use serde::Serialize;
use std::collections::BTreeMap;

/// Context key holding the resolver tables
pub const RESOLVER_KEY: &str = "__dagsmith__";

/// Values visible to a template while rendering one node
#[derive(Debug, Clone, Serialize)]
pub struct TemplateContext {
    /// The node's own relation
    pub this: String,

    pub target: TargetConfig,

    pub model: NodeContext,

    #[serde(rename = "__dagsmith__")]
    pub resolver: Resolver,
}

/// Lookup tables backing the dbt-style functions
#[derive(Debug, Clone, Default, Serialize)]
pub struct Resolver {
    /// `name` and `package.name` -> rendered relation or CTE marker
    pub refs: BTreeMap<String, String>,

    /// `source_name.name` -> rendered relation
    pub sources: BTreeMap<String, String>,

    pub vars: BTreeMap<String, serde_json::Value>,
}

impl From<&RenderContext> for TemplateContext {
    fn from(ctx: &RenderContext) -> Self {
        let mut refs = BTreeMap::new();

        // Qualified keys are unambiguous
        for target in &ctx.refs {
            refs.insert(format!("{}.{}", target.package, target.name), target.rendered.clone());
        }

        // Bare names: the node's own package wins, then the first in
        // unique_id order
        let mut by_name: Vec<_> = ctx.refs.iter().collect();
        by_name.sort_by_key(|t| (t.package != ctx.model.package_name, t.unique_id.clone()));
        for target in by_name {
            refs.entry(target.name.clone())
                .or_insert_with(|| target.rendered.clone());
        }

        let sources = ctx
            .sources
            .iter()
            .map(|s| (format!("{}.{}", s.source_name, s.name), s.rendered.clone()))
            .collect();

        Self {
            this: ctx.this.clone(),
            target: ctx.target.clone(),
            model: ctx.model.clone(),
            resolver: Resolver {
                refs,
                sources,
                vars: ctx.vars.clone(),
            },
        }
    }
}
