//! End-to-end run
//!
//! A run has two phases. Preparation is synchronous and fatal on error:
//! build the graph, resolve the selection, compile every selected node.
//! Execution only starts once preparation succeeded, and from then on
//! failures are recorded per node.

use dagsmith_adapter::Backend;
use dagsmith_compiler::{CompilationError, CompileOptions, Compiler};
use dagsmith_core::{InternalError, ProjectConfig, Renderer, RunReport};
use dagsmith_graph::{DependencyGraph, GraphValidationError, Manifest, NodeSelector, SelectionSpec};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::materialization::{ExecutionSettings, NodeExecutor};
use crate::observer::{LoggingObserver, RunObserver};
use crate::scheduler::Scheduler;

/// Per-invocation run inputs
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub threads: usize,
    pub full_refresh: bool,
    pub select: Vec<SelectionSpec>,
    pub exclude: Vec<SelectionSpec>,

    /// Merged over the project vars
    pub vars: BTreeMap<String, serde_json::Value>,

    pub warn_error: bool,
}

impl RunConfig {
    /// Defaults taken from the project configuration
    pub fn from_project(project: &ProjectConfig) -> Self {
        Self {
            threads: project.default_threads(),
            full_refresh: false,
            select: Vec::new(),
            exclude: Vec::new(),
            vars: BTreeMap::new(),
            warn_error: project.warn_error,
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_full_refresh(mut self, full_refresh: bool) -> Self {
        self.full_refresh = full_refresh;
        self
    }

    pub fn with_select(mut self, specs: Vec<SelectionSpec>) -> Self {
        self.select = specs;
        self
    }

    pub fn with_exclude(mut self, specs: Vec<SelectionSpec>) -> Self {
        self.exclude = specs;
        self
    }

    pub fn with_vars(mut self, vars: BTreeMap<String, serde_json::Value>) -> Self {
        self.vars = vars;
        self
    }

    pub fn with_warn_error(mut self, warn_error: bool) -> Self {
        self.warn_error = warn_error;
        self
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from_project(&ProjectConfig::default())
    }
}

/// Errors that abort a run before any node executes
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Graph(#[from] GraphValidationError),

    #[error(transparent)]
    Compilation(#[from] CompilationError),

    #[error("Internal error: {0}")]
    Internal(#[from] InternalError),
}

/// Graph, selection and compilation for one run
pub struct RunTask {
    project: ProjectConfig,
    config: RunConfig,
    observer: Arc<dyn RunObserver>,
}

impl RunTask {
    pub fn new(project: ProjectConfig, config: RunConfig) -> Self {
        Self {
            project,
            config,
            observer: Arc::new(LoggingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions::from_project(&self.project).with_var_overrides(&self.config.vars)
    }

    /// Build the graph and resolve the selection, without compiling
    pub fn select(&self, manifest: &Manifest) -> Result<DependencyGraph, RunError> {
        let graph = DependencyGraph::build(manifest)?;
        let selected = NodeSelector::new(manifest, &graph).select_subgraph(&self.config.select, &self.config.exclude);
        tracing::info!(selected = selected.len(), total = graph.len(), "selected nodes");
        Ok(selected)
    }

    /// Select and compile; returns the selected subgraph
    ///
    /// Ephemeral ancestors outside the selection are compiled on demand so
    /// they can be inlined.
    pub fn prepare<R: Renderer>(&self, manifest: &mut Manifest, renderer: R) -> Result<DependencyGraph, RunError> {
        let selected = self.select(manifest)?;
        let compiler = Compiler::new(renderer, self.compile_options())?;
        compiler.compile_all(manifest, selected.topological_order())?;
        Ok(selected)
    }

    /// Execute an already prepared selection
    pub async fn execute(
        &self,
        manifest: Manifest,
        selected: &DependencyGraph,
        backend: Arc<dyn Backend>,
    ) -> Result<RunReport, RunError> {
        let settings = ExecutionSettings {
            target: self.project.target.clone(),
            quoting: self.project.quoting,
            full_refresh: self.config.full_refresh,
            warn_error: self.config.warn_error,
        };
        let executor = NodeExecutor::new(backend, settings);

        let report = Scheduler::new(self.config.threads)
            .run(selected, Arc::new(manifest), &executor, self.observer.as_ref())
            .await?;
        Ok(report)
    }

    /// Prepare, then execute
    pub async fn run<R: Renderer>(
        &self,
        mut manifest: Manifest,
        renderer: R,
        backend: Arc<dyn Backend>,
    ) -> Result<RunReport, RunError> {
        let selected = self.prepare(&mut manifest, renderer)?;
        self.execute(manifest, &selected, backend).await
    }
}
