//! Per-node execution
//!
//! [`NodeExecutor`] turns one injected node into the statement sequence for
//! its materialization and runs it inside a single transaction on a session
//! of its own:
//!
//! ```text
//! begin -> pre-hooks -> materialization statements -> post-hooks -> commit
//! ```
//!
//! Any failing statement rolls the transaction back and yields a `fail`
//! result; it never aborts the run.

use dagsmith_adapter::{AdapterResponse, Backend, ExecutionError, RelationInfo, RelationKind, Session};
use dagsmith_core::{
    InternalError, Materialization, Node, RelationIdentifier, ResourceKind, RunResult, RunStatus,
    TargetConfig, TestSeverity,
};
use std::sync::Arc;
use std::time::Instant;

use crate::cache::{RelationCache, RelationLocks};
use crate::seed::{SeedError, SeedTable};

const TMP_SUFFIX: &str = "__dbt_tmp";
const BACKUP_SUFFIX: &str = "__dbt_backup";

/// Status text for ephemeral nodes, which are never executed
pub const EPHEMERAL_STATUS: &str = "EPHEMERAL";

/// Settings shared by every node in a run
#[derive(Debug, Clone, Default)]
pub struct ExecutionSettings {
    pub target: TargetConfig,

    /// Quote relation names unless a node overrides it
    pub quoting: bool,

    /// Run-level full refresh; a node's `full_refresh` config wins
    pub full_refresh: bool,

    /// Promote test warnings to failures
    pub warn_error: bool,
}

/// Why a node's statement sequence stopped
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Invalid seed: {0}")]
    Seed(#[from] SeedError),

    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl NodeError {
    /// Terminal status for a node that stopped with this error
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Internal(_) => RunStatus::Error,
            _ => RunStatus::Fail,
        }
    }
}

/// What the materialization statements produced
struct Outcome {
    response: AdapterResponse,
}

/// Executes single nodes against a backend
///
/// Cheap to clone; clones share the backend, relation cache and locks.
#[derive(Clone)]
pub struct NodeExecutor {
    backend: Arc<dyn Backend>,
    cache: Arc<RelationCache>,
    locks: Arc<RelationLocks>,
    settings: Arc<ExecutionSettings>,
}

impl NodeExecutor {
    pub fn new(backend: Arc<dyn Backend>, settings: ExecutionSettings) -> Self {
        Self {
            backend,
            cache: Arc::new(RelationCache::new()),
            locks: Arc::new(RelationLocks::new()),
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    pub fn cache(&self) -> &RelationCache {
        &self.cache
    }

    /// Run one node to a terminal result
    #[tracing::instrument(skip_all, fields(unique_id = %node.unique_id))]
    pub async fn execute(&self, node: &Node) -> RunResult {
        let started = Instant::now();

        if node.is_ephemeral() {
            return RunResult::new(node, RunStatus::Success, EPHEMERAL_STATUS, started.elapsed());
        }

        let relation = RelationIdentifier::for_node(node, &self.settings.target);

        // Nodes that build a relation hold its lock for the whole sequence
        let _guard = if node.materialization().is_some_and(|m| m.builds_relation()) {
            Some(self.locks.acquire(&relation).await)
        } else {
            None
        };

        match self.run_in_transaction(node, &relation).await {
            Ok(outcome) => self.finish(node, outcome, started),
            Err(error) => {
                tracing::debug!(%error, "node statements failed");
                let message = error.to_string();
                match error.status() {
                    RunStatus::Error => RunResult::errored(node, message, started.elapsed()),
                    _ => RunResult::failed(node, message, started.elapsed()),
                }
            }
        }
    }

    /// Turn a completed statement sequence into a result
    fn finish(&self, node: &Node, outcome: Outcome, started: Instant) -> RunResult {
        let elapsed = started.elapsed();
        let response = outcome.response;

        if node.resource_type != ResourceKind::Test {
            return RunResult::new(node, RunStatus::Success, response.message, elapsed)
                .with_rows_affected(response.rows_affected);
        }

        let failures = response.rows_affected.unwrap_or(0);
        let status = match (failures, node.config.severity) {
            (0, _) => RunStatus::Success,
            (_, TestSeverity::Warn) if !self.settings.warn_error => RunStatus::Warn,
            _ => RunStatus::Fail,
        };

        let result = RunResult::new(node, status, failures.to_string(), elapsed)
            .with_rows_affected(Some(failures));
        if failures > 0 {
            result.with_message(format!("Got {} result(s), configured to fail if != 0", failures))
        } else {
            result
        }
    }

    async fn run_in_transaction(&self, node: &Node, relation: &RelationIdentifier) -> Result<Outcome, NodeError> {
        let session = self.backend.acquire().await?;
        let mut run = NodeRun {
            backend: self.backend.as_ref(),
            cache: &self.cache,
            settings: &self.settings,
            session,
            touched: Vec::new(),
        };

        run.session.begin().await?;
        let result = match run.run_statements(node, relation).await {
            Ok(outcome) => run.session.commit().await.map(|()| outcome).map_err(NodeError::from),
            Err(error) => {
                if let Err(rollback) = run.session.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(error)
            }
        };

        if result.is_err() {
            // Nothing this sequence recorded about relations still holds
            self.cache.invalidate(relation);
            for touched in &run.touched {
                self.cache.invalidate(touched);
            }
        }
        result
    }
}

/// One node's statement sequence, run on its own session
struct NodeRun<'a> {
    backend: &'a dyn Backend,
    cache: &'a RelationCache,
    settings: &'a ExecutionSettings,
    session: Box<dyn Session>,

    /// Relations whose cache entries the sequence changed
    touched: Vec<RelationIdentifier>,
}

impl NodeRun<'_> {
    async fn run_statements(&mut self, node: &Node, relation: &RelationIdentifier) -> Result<Outcome, NodeError> {
        let sql = node
            .injected_text()
            .ok_or_else(|| InternalError::NotInjected(node.unique_id.clone()))?;

        for hook in &node.config.pre_hook {
            self.statement(hook).await?;
        }

        let outcome = match node.materialization() {
            Some(Materialization::View) => self.view(node, relation, sql).await?,
            Some(Materialization::Table) => self.table(node, relation, sql).await?,
            Some(Materialization::Incremental) => self.incremental(node, relation, sql).await?,
            Some(Materialization::Seed) => self.seed(node, relation, sql).await?,
            Some(Materialization::Snapshot) => self.snapshot(node, relation, sql).await?,
            // Tests and macro calls run their SQL as is
            None | Some(Materialization::Ephemeral) | Some(Materialization::Test) => Outcome {
                response: self.statement(sql).await?,
            },
        };

        for hook in &node.config.post_hook {
            self.statement(hook).await?;
        }

        Ok(outcome)
    }

    async fn statement(&mut self, sql: &str) -> Result<AdapterResponse, ExecutionError> {
        tracing::debug!(sql, session = self.session.id(), "executing statement");
        self.session.execute(sql).await
    }

    fn created(&mut self, relation: &RelationIdentifier, kind: RelationKind) {
        self.cache.record_created(relation, kind);
        self.touched.push(relation.clone());
    }

    fn forget(&mut self, relation: &RelationIdentifier) {
        self.cache.invalidate(relation);
        self.touched.push(relation.clone());
    }

    /// Relation lookup through the run cache
    async fn existing(&mut self, relation: &RelationIdentifier) -> Result<Option<RelationInfo>, ExecutionError> {
        if let Some(cached) = self.cache.get(relation) {
            return Ok(cached);
        }
        let found = self.backend.get_relation(relation).await?;
        self.cache.insert(relation, found.clone());
        Ok(found)
    }

    fn full_refresh(&self, node: &Node) -> bool {
        node.config.full_refresh.unwrap_or(self.settings.full_refresh)
    }

    fn quote(&self, node: &Node) -> bool {
        node.config.quoting.unwrap_or(self.settings.quoting)
    }

    async fn drop_relation(&mut self, relation: &RelationIdentifier, kind: RelationKind, quote: bool) -> Result<(), ExecutionError> {
        self.statement(&format!("drop {} if exists {} cascade", kind, relation.render(quote)))
            .await?;
        self.forget(relation);
        Ok(())
    }

    async fn create_table_as(&mut self, relation: &RelationIdentifier, sql: &str, quote: bool) -> Result<AdapterResponse, ExecutionError> {
        let response = self
            .statement(&format!("create table {} as (\n{}\n)", relation.render(quote), sql))
            .await?;
        self.created(relation, RelationKind::Table);
        Ok(response)
    }

    async fn rename(&mut self, from: &RelationIdentifier, to: &RelationIdentifier, quote: bool) -> Result<(), ExecutionError> {
        let to_ident = if quote {
            format!("\"{}\"", to.identifier.replace('"', "\"\""))
        } else {
            to.identifier.clone()
        };
        self.statement(&format!("alter table {} rename to {}", from.render(quote), to_ident))
            .await?;
        self.forget(from);
        self.created(to, RelationKind::Table);
        Ok(())
    }

    async fn view(&mut self, node: &Node, relation: &RelationIdentifier, sql: &str) -> Result<Outcome, NodeError> {
        let quote = self.quote(node);

        if let Some(existing) = self.existing(relation).await? {
            if self.full_refresh(node) || existing.is_table() {
                self.drop_relation(relation, existing.kind, quote).await?;
            }
        }

        let response = self
            .statement(&format!("create or replace view {} as (\n{}\n)", relation.render(quote), sql))
            .await?;
        self.created(relation, RelationKind::View);
        Ok(Outcome { response })
    }

    async fn table(&mut self, node: &Node, relation: &RelationIdentifier, sql: &str) -> Result<Outcome, NodeError> {
        let quote = self.quote(node);

        let response = match self.existing(relation).await? {
            Some(existing) if existing.is_table() && !self.full_refresh(node) => {
                // Build aside, then swap into place
                let tmp = relation.with_suffix(TMP_SUFFIX);
                let backup = relation.with_suffix(BACKUP_SUFFIX);

                self.drop_relation(&tmp, RelationKind::Table, quote).await?;
                let response = self.create_table_as(&tmp, sql, quote).await?;
                self.drop_relation(&backup, RelationKind::Table, quote).await?;
                self.rename(relation, &backup, quote).await?;
                self.rename(&tmp, relation, quote).await?;
                self.drop_relation(&backup, RelationKind::Table, quote).await?;
                response
            }
            Some(existing) => {
                self.drop_relation(relation, existing.kind, quote).await?;
                self.create_table_as(relation, sql, quote).await?
            }
            None => self.create_table_as(relation, sql, quote).await?,
        };

        Ok(Outcome { response })
    }

    async fn incremental(&mut self, node: &Node, relation: &RelationIdentifier, sql: &str) -> Result<Outcome, NodeError> {
        let quote = self.quote(node);
        let target = relation.render(quote);

        let existing = match self.existing(relation).await? {
            Some(existing) if existing.is_table() && !self.full_refresh(node) => existing,
            Some(existing) => {
                tracing::debug!(relation = %relation, "rebuilding incremental relation");
                self.drop_relation(relation, existing.kind, quote).await?;
                let response = self.create_table_as(relation, sql, quote).await?;
                return Ok(Outcome { response });
            }
            None => {
                let response = self.create_table_as(relation, sql, quote).await?;
                return Ok(Outcome { response });
            }
        };
        tracing::debug!(relation = %existing.relation, "merging into existing relation");

        let response = match node.config.unique_key.as_deref() {
            Some(key) => {
                let staging = format!("{}{}", relation.identifier, TMP_SUFFIX);
                self.statement(&format!("drop table if exists {}", staging)).await?;
                self.statement(&format!("create temporary table {} as (\n{}\n)", staging, sql))
                    .await?;
                self.statement(&format!(
                    "delete from {} where ({}) in (select {} from {})",
                    target, key, key, staging
                ))
                .await?;
                let response = self
                    .statement(&format!("insert into {} select * from {}", target, staging))
                    .await?;
                self.statement(&format!("drop table if exists {}", staging)).await?;
                response
            }
            None => {
                self.statement(&format!(
                    "insert into {} select * from (\n{}\n) as dbt_incremental_source except select * from {}",
                    target, sql, target
                ))
                .await?
            }
        };

        Ok(Outcome { response })
    }

    async fn seed(&mut self, node: &Node, relation: &RelationIdentifier, payload: &str) -> Result<Outcome, NodeError> {
        let quote = self.quote(node);
        let table = SeedTable::parse(payload)?;
        let target = relation.render(quote);

        let prepared = match self.existing(relation).await? {
            Some(existing) if existing.is_table() && !self.full_refresh(node) => {
                self.statement(&format!("truncate table {}", target)).await?
            }
            existing => {
                if let Some(existing) = existing {
                    self.drop_relation(relation, existing.kind, quote).await?;
                }
                let columns = table.column_definitions(&node.config.column_types, quote);
                let response = self
                    .statement(&format!("create table {} ({})", target, columns))
                    .await?;
                self.created(relation, RelationKind::Table);
                response
            }
        };

        let statements = table.insert_statements(&target, quote);
        if statements.is_empty() {
            return Ok(Outcome { response: prepared });
        }

        let mut inserted = 0;
        for insert in &statements {
            let response = self.statement(insert).await?;
            inserted += response.rows_affected.unwrap_or(0);
        }
        tracing::debug!(relation = %relation, rows = table.rows.len(), "loaded seed");

        Ok(Outcome {
            response: AdapterResponse::new(format!("INSERT {}", inserted)).with_rows(inserted),
        })
    }

    async fn snapshot(&mut self, node: &Node, relation: &RelationIdentifier, sql: &str) -> Result<Outcome, NodeError> {
        let quote = self.quote(node);
        let target = relation.render(quote);
        let key = node.config.unique_key.as_deref().ok_or_else(|| {
            NodeError::Config(format!("Snapshot {} requires a unique_key", node.unique_id))
        })?;

        let existing = match self.existing(relation).await? {
            Some(existing) if existing.is_table() && !self.full_refresh(node) => existing,
            existing => {
                if let Some(existing) = existing {
                    self.drop_relation(relation, existing.kind, quote).await?;
                }
                let build = format!(
                    "select *, current_timestamp as dbt_valid_from, cast(null as timestamp) as dbt_valid_to from (\n{}\n) as snapshot_query",
                    sql
                );
                let response = self.create_table_as(relation, &build, quote).await?;
                return Ok(Outcome { response });
            }
        };

        let staging = format!("{}{}", relation.identifier, TMP_SUFFIX);
        self.statement(&format!("drop table if exists {}", staging)).await?;
        self.statement(&format!("create temporary table {} as (\n{}\n)", staging, sql))
            .await?;

        // Close current rows whose key disappeared or, when the columns are
        // known, whose values changed
        let tracked: Vec<&String> = existing
            .columns
            .iter()
            .filter(|c| !c.eq_ignore_ascii_case("dbt_valid_from") && !c.eq_ignore_ascii_case("dbt_valid_to"))
            .collect();
        let changed = if tracked.is_empty() {
            String::new()
        } else {
            let differs = tracked
                .iter()
                .map(|c| format!("src.{c} is distinct from snapshot.{c}"))
                .collect::<Vec<_>>()
                .join(" or ");
            format!(
                " or exists (select 1 from {} as src where src.{} = snapshot.{} and ({}))",
                staging, key, key, differs
            )
        };
        self.statement(&format!(
            "update {} as snapshot set dbt_valid_to = current_timestamp where snapshot.dbt_valid_to is null and (snapshot.{} not in (select {} from {}){})",
            target, key, key, staging, changed
        ))
        .await?;

        let response = self
            .statement(&format!(
                "insert into {} select *, current_timestamp as dbt_valid_from, cast(null as timestamp) as dbt_valid_to from {} where {} not in (select {} from {} where dbt_valid_to is null)",
                target, staging, key, key, target
            ))
            .await?;
        self.statement(&format!("drop table if exists {}", staging)).await?;

        Ok(Outcome { response })
    }
}
