//! Node compilation
//!
//! Compiling a node renders its template into `compiled_text`, then inlines
//! every ephemeral ancestor it references as a CTE to produce
//! `injected_text`. Ephemeral ancestors are compiled and injected on demand,
//! deepest first, and each node is processed at most once.

use dagsmith_core::{
    InjectedCte, InternalError, Node, NodeContext, NodeId, ProjectConfig, RefTarget,
    RelationIdentifier, RenderContext, RenderError, Renderer, ResourceKind, SourceTarget,
    TargetConfig,
};
use dagsmith_graph::Manifest;
use std::collections::{BTreeMap, HashSet};

use crate::cte::{cte_definition, inject_ctes, marker, sanitize, MarkerScanner};

/// Settings that shape compiled SQL
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Prefix for ephemeral markers (`__<prefix>__CTE__<name>`)
    pub cte_prefix: String,

    /// Quote relation names unless a node overrides it
    pub quoting: bool,

    pub target: TargetConfig,

    /// Project vars merged with run overrides
    pub vars: BTreeMap<String, serde_json::Value>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self::from_project(&ProjectConfig::default())
    }
}

impl CompileOptions {
    pub fn from_project(config: &ProjectConfig) -> Self {
        Self {
            cte_prefix: config.cte_prefix.clone(),
            quoting: config.quoting,
            target: config.target.clone(),
            vars: config.vars.clone(),
        }
    }

    /// Merge per-run variable overrides over the project vars
    pub fn with_var_overrides(mut self, overrides: &BTreeMap<String, serde_json::Value>) -> Self {
        for (key, value) in overrides {
            self.vars.insert(key.clone(), value.clone());
        }
        self
    }
}

/// Compiles nodes in a manifest
pub struct Compiler<R: Renderer> {
    renderer: R,
    options: CompileOptions,
    scanner: MarkerScanner,
}

impl<R: Renderer> Compiler<R> {
    pub fn new(renderer: R, options: CompileOptions) -> Result<Self, CompilationError> {
        let scanner = MarkerScanner::new(&options.cte_prefix).map_err(|e| {
            CompilationError::InvalidPrefix(options.cte_prefix.clone(), e.to_string())
        })?;
        Ok(Self {
            renderer,
            options,
            scanner,
        })
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Marker used to reference an ephemeral node
    ///
    /// Built from the sanitized name unless another ephemeral node in the
    /// manifest sanitizes to the same name; those nodes are marked by their
    /// sanitized unique_id instead.
    pub fn marker_for(&self, node: &Node, manifest: &Manifest) -> String {
        let name = sanitize(&node.name);
        let shared = manifest.nodes.values().any(|other| {
            other.unique_id != node.unique_id && other.is_ephemeral() && sanitize(&other.name) == name
        });
        if shared {
            marker(&self.options.cte_prefix, &node.unique_id)
        } else {
            marker(&self.options.cte_prefix, &node.name)
        }
    }

    fn relation_of(&self, node: &Node) -> String {
        let quote = node.config.quoting.unwrap_or(self.options.quoting);
        RelationIdentifier::for_node(node, &self.options.target).render(quote)
    }

    /// Context a node's template is rendered against
    pub fn build_context(&self, node: &Node, manifest: &Manifest) -> Result<RenderContext, CompilationError> {
        let mut refs = Vec::new();
        let mut sources = Vec::new();

        for dep_id in &node.depends_on.nodes {
            let dep = manifest
                .get(dep_id)
                .ok_or_else(|| CompilationError::UnknownNode(dep_id.clone()))?;

            if dep.resource_type == ResourceKind::Source {
                sources.push(SourceTarget {
                    unique_id: dep.unique_id.clone(),
                    source_name: dep.source_name.clone().unwrap_or_default(),
                    name: dep.name.clone(),
                    rendered: self.relation_of(dep),
                });
            } else {
                let rendered = if dep.is_ephemeral() {
                    self.marker_for(dep, manifest)
                } else {
                    self.relation_of(dep)
                };
                refs.push(RefTarget {
                    unique_id: dep.unique_id.clone(),
                    package: dep.package_name.clone(),
                    name: dep.name.clone(),
                    rendered,
                });
            }
        }

        Ok(RenderContext {
            model: NodeContext {
                unique_id: node.unique_id.clone(),
                name: node.name.clone(),
                package_name: node.package_name.clone(),
                resource_type: node.resource_type,
            },
            this: self.relation_of(node),
            refs,
            sources,
            vars: self.options.vars.clone(),
            target: self.options.target.clone(),
        })
    }

    /// Render a node's raw text; seeds carry their CSV payload verbatim
    pub fn render_node(&self, node: &Node, manifest: &Manifest) -> Result<String, CompilationError> {
        if node.resource_type == ResourceKind::Seed {
            return Ok(node.raw_text.clone());
        }

        let context = self.build_context(node, manifest)?;
        self.renderer
            .render(&node.raw_text, &context)
            .map_err(|source| CompilationError::Render {
                unique_id: node.unique_id.clone(),
                source,
            })
    }

    /// Compile one node: render, then inline ephemeral ancestors
    ///
    /// A node that is already injected is returned unchanged.
    pub fn compile_node<'m>(&self, manifest: &'m mut Manifest, unique_id: &str) -> Result<&'m Node, CompilationError> {
        let kind = manifest
            .get(unique_id)
            .map(|node| node.resource_type)
            .ok_or_else(|| CompilationError::UnknownNode(unique_id.to_string()))?;

        if kind != ResourceKind::Source {
            self.ensure_compiled(manifest, unique_id)?;
            let mut visiting = HashSet::new();
            visiting.insert(unique_id.to_string());
            self.prepend_ctes(manifest, unique_id, &mut visiting)?;
        }

        manifest
            .get(unique_id)
            .ok_or_else(|| CompilationError::UnknownNode(unique_id.to_string()))
    }

    /// Compile the given nodes in order (normally a topological order)
    pub fn compile_all(&self, manifest: &mut Manifest, order: &[NodeId]) -> Result<usize, CompilationError> {
        let mut compiled = 0;
        for unique_id in order {
            self.compile_node(manifest, unique_id)?;
            compiled += 1;
        }
        tracing::info!(nodes = compiled, "compiled nodes");
        Ok(compiled)
    }

    fn ensure_compiled(&self, manifest: &mut Manifest, unique_id: &str) -> Result<(), CompilationError> {
        let node = manifest
            .get(unique_id)
            .ok_or_else(|| CompilationError::UnknownNode(unique_id.to_string()))?;
        if node.is_compiled() {
            return Ok(());
        }

        let compiled = self.render_node(node, manifest)?;
        tracing::debug!(unique_id, "rendered node");

        manifest
            .get_mut(unique_id)
            .ok_or_else(|| CompilationError::UnknownNode(unique_id.to_string()))?
            .record_compiled(compiled)?;
        Ok(())
    }

    /// Find the ephemeral node a marker refers to
    ///
    /// Declared dependencies are searched first, then the whole manifest.
    /// More than one match is an error.
    fn resolve_marker(&self, manifest: &Manifest, node: &Node, found: &str) -> Result<Option<NodeId>, CompilationError> {
        let matches = |candidate: &Node| candidate.is_ephemeral() && self.marker_for(candidate, manifest) == found;

        let mut matched: Vec<NodeId> = node
            .depends_on
            .nodes
            .iter()
            .filter_map(|id| manifest.get(id))
            .filter(|dep| matches(dep))
            .map(|dep| dep.unique_id.clone())
            .collect();
        if matched.is_empty() {
            matched = manifest
                .nodes
                .values()
                .filter(|n| matches(n))
                .map(|n| n.unique_id.clone())
                .collect();
        }
        matched.dedup();

        match matched.len() {
            0 => Ok(None),
            1 => Ok(matched.pop()),
            _ => Err(CompilationError::AmbiguousEphemeral {
                unique_id: node.unique_id.clone(),
                marker: found.to_string(),
                candidates: matched,
            }),
        }
    }

    /// Inline the ephemeral ancestors referenced by a compiled node
    fn prepend_ctes(
        &self,
        manifest: &mut Manifest,
        unique_id: &str,
        visiting: &mut HashSet<NodeId>,
    ) -> Result<(), CompilationError> {
        let node = manifest
            .get(unique_id)
            .ok_or_else(|| CompilationError::UnknownNode(unique_id.to_string()))?;

        if node.is_injected() {
            return Ok(());
        }

        let compiled = node
            .compiled_text()
            .ok_or_else(|| InternalError::NotCompiled(unique_id.to_string()))?
            .to_string();

        let markers = if node.resource_type == ResourceKind::Seed {
            Vec::new()
        } else {
            self.scanner.scan(&compiled)
        };

        let mut targets = Vec::with_capacity(markers.len());
        for found in markers {
            let dep_id = self.resolve_marker(manifest, node, &found)?.ok_or_else(|| {
                CompilationError::DanglingEphemeral {
                    unique_id: unique_id.to_string(),
                    marker: found.clone(),
                }
            })?;
            targets.push((found, dep_id));
        }

        let mut ctes: Vec<InjectedCte> = Vec::new();
        for (found, dep_id) in targets {
            if !visiting.insert(dep_id.clone()) {
                return Err(CompilationError::RecursiveEphemeral { unique_id: dep_id });
            }
            self.ensure_compiled(manifest, &dep_id)?;
            self.prepend_ctes(manifest, &dep_id, visiting)?;
            visiting.remove(&dep_id);

            let dep = manifest
                .get(&dep_id)
                .ok_or_else(|| CompilationError::UnknownNode(dep_id.clone()))?;

            // Deeper ancestors first, each defined once
            for cte in dep.extra_ctes() {
                if !ctes.iter().any(|c| c.id == cte.id) {
                    ctes.push(cte.clone());
                }
            }
            if !ctes.iter().any(|c| c.id == dep_id) {
                let body = dep
                    .compiled_text()
                    .ok_or_else(|| InternalError::NotCompiled(dep_id.clone()))?;
                ctes.push(InjectedCte {
                    sql: cte_definition(&found, body),
                    id: dep_id,
                });
            }
        }

        let injected = inject_ctes(&compiled, &ctes);
        tracing::debug!(unique_id, ctes = ctes.len(), "injected ephemeral CTEs");

        manifest
            .get_mut(unique_id)
            .ok_or_else(|| CompilationError::UnknownNode(unique_id.to_string()))?
            .record_injected(injected, ctes)?;
        Ok(())
    }
}

/// Compilation errors; any of these aborts the run before execution
#[derive(Debug, thiserror::Error)]
pub enum CompilationError {
    #[error("Failed to render {unique_id}: {source}")]
    Render {
        unique_id: NodeId,
        source: RenderError,
    },

    #[error("{unique_id} references ephemeral marker '{marker}' but no ephemeral node matches it")]
    DanglingEphemeral { unique_id: NodeId, marker: String },

    #[error("{unique_id} references ephemeral marker '{marker}', which matches {candidates:?}")]
    AmbiguousEphemeral {
        unique_id: NodeId,
        marker: String,
        candidates: Vec<NodeId>,
    },

    #[error("Ephemeral node {unique_id} references itself")]
    RecursiveEphemeral { unique_id: NodeId },

    #[error("Unknown node '{0}'")]
    UnknownNode(NodeId),

    #[error("Invalid CTE prefix '{0}': {1}")]
    InvalidPrefix(String, String),

    #[error(transparent)]
    Internal(#[from] InternalError),
}
