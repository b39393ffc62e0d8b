//! Mock backend for testing and dry runs
//!
//! This backend keeps an in-memory relation catalog and interprets the DDL
//! the runner emits, without connecting to any warehouse.
//! Sessions journal their catalog changes while a transaction is open, and
//! a rollback restores exactly the entries that session changed. There is no
//! isolation: uncommitted changes are visible to every session.
//! It's useful for:
//! - Testing materialization statement sequences
//! - Dry runs from the CLI
//! - Simulating statement failures, latency and concurrency
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dagsmith_adapter::{Backend, MockBackend, RelationKind};
//! use dagsmith_core::RelationIdentifier;
//!
//! let backend = MockBackend::new();
//! let mut session = backend.acquire().await?;
//! session.begin().await?;
//! session.execute("create table public.orders as (select 1 as id)").await?;
//! session.commit().await?;
//!
//! let rel = RelationIdentifier::new("public", "orders");
//! let info = backend.get_relation(&rel).await?.unwrap();
//! assert_eq!(info.kind, RelationKind::Table);
//! ```
//!
//! ## Simulating Failures
//!
//! ```rust,ignore
//! // Any statement containing the substring fails
//! let backend = MockBackendBuilder::new()
//!     .with_failure("from missing_table", "relation \"missing_table\" does not exist")
//!     .with_latency(20)
//!     .build();
//! ```

use crate::adapter::{AdapterResponse, Backend, ExecutionError, RelationInfo, RelationKind, Session};
use dagsmith_core::RelationIdentifier;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use tokio::sync::RwLock;

static CREATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)^\s*create\s+(?P<replace>or\s+replace\s+)?(?:temporary\s+|temp\s+)?(?P<kind>table|view)\s+(?:if\s+not\s+exists\s+)?(?P<rel>[\w."]+)(?P<rest>.*)$"#,
    )
    .expect("create pattern compiles")
});

static DROP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)^\s*drop\s+(?P<kind>table|view)\s+(?P<if_exists>if\s+exists\s+)?(?P<rel>[\w."]+)"#)
        .expect("drop pattern compiles")
});

static RENAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)^\s*alter\s+(?:table|view)\s+(?P<rel>[\w."]+)\s+rename\s+to\s+(?P<to>[\w"]+)"#)
        .expect("rename pattern compiles")
});

static DML_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)^\s*(?P<verb>insert\s+into|delete\s+from|truncate\s+table|truncate|update)\s+(?P<rel>[\w."]+)"#,
    )
    .expect("dml pattern compiles")
});

static VALUES_TUPLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\)\s*,\s*\(").expect("values pattern compiles"));

/// Session id under which autocommit statements are logged
pub const AUTOCOMMIT_SESSION: u64 = 0;

/// Catalog entries as they were before a session changed them
type Journal = Vec<(String, Option<RelationInfo>)>;

fn remember(journal: &mut Option<&mut Journal>, catalog: &HashMap<String, RelationInfo>, key: &str) {
    if let Some(journal) = journal.as_deref_mut() {
        journal.push((key.to_string(), catalog.get(key).cloned()));
    }
}

/// Split a rendered relation into unquoted parts
fn relation_parts(rendered: &str) -> Vec<String> {
    rendered
        .split('.')
        .map(|part| part.trim_matches('"').to_string())
        .collect()
}

fn catalog_key(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| p.to_lowercase())
        .collect::<Vec<_>>()
        .join(".")
}

fn identifier_from_parts(parts: &[String]) -> RelationIdentifier {
    match parts {
        [database, schema, identifier] => {
            RelationIdentifier::new(schema.as_str(), identifier.as_str()).with_database(database.as_str())
        }
        [schema, identifier] => RelationIdentifier::new(schema.as_str(), identifier.as_str()),
        _ => RelationIdentifier::new("", parts.last().cloned().unwrap_or_default()),
    }
}

/// Column names from a `(col type, ...)` definition list
fn column_names(rest: &str) -> Vec<String> {
    let rest = rest.trim();
    if !rest.starts_with('(') {
        return Vec::new();
    }
    let inner = rest.trim_start_matches('(');
    let inner = match inner.rfind(')') {
        Some(end) => &inner[..end],
        None => inner,
    };
    inner
        .split(',')
        .filter_map(|def| def.split_whitespace().next())
        .map(|name| name.trim_matches('"').to_string())
        .collect()
}

/// Mock backend for testing
///
/// State is shared between clones, so a test can hand one clone to the
/// runner and inspect the other.
pub struct MockBackend {
    /// Relation catalog keyed by lower-cased dotted name
    catalog: Arc<RwLock<HashMap<String, RelationInfo>>>,

    /// Every statement received, in order, with the session that sent it
    statements: Arc<RwLock<Vec<(u64, String)>>>,

    next_session: Arc<AtomicU64>,

    /// Substring -> error message for statements that must fail
    failures: Arc<RwLock<Vec<(String, String)>>>,

    /// Substring -> row count for queries
    query_results: Arc<RwLock<Vec<(String, u64)>>>,

    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    relation_lookups: Arc<AtomicUsize>,

    /// Simulate connection failure
    fail_connection: bool,

    /// Simulate statement latency (milliseconds)
    latency_ms: u64,

    /// Name to return from name() method
    backend_name: &'static str,
}

impl MockBackend {
    /// Create a new mock backend with an empty catalog
    pub fn new() -> Self {
        MockBackendBuilder::new().build()
    }

    /// Add an existing relation to the catalog
    pub async fn add_relation(&self, info: RelationInfo) {
        let key = info.relation.cache_key();
        self.catalog.write().await.insert(key, info);
    }

    /// Make any statement containing `pattern` fail with `message`
    pub async fn fail_on(&self, pattern: impl Into<String>, message: impl Into<String>) {
        self.failures.write().await.push((pattern.into(), message.into()));
    }

    /// Row count returned by queries containing `pattern`
    pub async fn set_query_result(&self, pattern: impl Into<String>, rows: u64) {
        self.query_results.write().await.push((pattern.into(), rows));
    }

    /// Configure to fail every statement with a connection error
    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    /// Configure simulated latency for every statement
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Set a custom backend name
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.backend_name = name;
        self
    }

    /// All statements received so far
    pub async fn statements(&self) -> Vec<String> {
        self.statements
            .read()
            .await
            .iter()
            .map(|(_, sql)| sql.clone())
            .collect()
    }

    /// Statements grouped by the session that sent them
    ///
    /// Autocommit statements are under [`AUTOCOMMIT_SESSION`].
    pub async fn statements_by_session(&self) -> BTreeMap<u64, Vec<String>> {
        let mut grouped: BTreeMap<u64, Vec<String>> = BTreeMap::new();
        for (session, sql) in self.statements.read().await.iter() {
            grouped.entry(*session).or_default().push(sql.clone());
        }
        grouped
    }

    /// Statements containing `pattern` (case-insensitive)
    pub async fn statements_matching(&self, pattern: &str) -> Vec<String> {
        let pattern = pattern.to_lowercase();
        self.statements
            .read()
            .await
            .iter()
            .map(|(_, sql)| sql)
            .filter(|sql| sql.to_lowercase().contains(&pattern))
            .cloned()
            .collect()
    }

    pub async fn clear_statements(&self) {
        self.statements.write().await.clear();
    }

    pub async fn has_relation(&self, relation: &RelationIdentifier) -> bool {
        self.catalog.read().await.contains_key(&relation.cache_key())
    }

    pub async fn relation_count(&self) -> usize {
        self.catalog.read().await.len()
    }

    /// Highest number of statements observed executing at once
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of `get_relation` calls served
    pub fn relation_lookups(&self) -> usize {
        self.relation_lookups.load(Ordering::SeqCst)
    }

    /// Simulate latency if configured
    async fn simulate_latency(&self) {
        if self.latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.latency_ms)).await;
        }
    }

    async fn configured_failure(&self, sql: &str) -> Option<ExecutionError> {
        if self.fail_connection {
            return Some(ExecutionError::Connection("Simulated connection failure".to_string()));
        }
        self.failures
            .read()
            .await
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, message)| ExecutionError::Database(message.clone()))
    }

    async fn query_rows(&self, sql: &str) -> u64 {
        self.query_results
            .read()
            .await
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map_or(0, |(_, rows)| *rows)
    }

    async fn log(&self, session: u64, sql: &str) {
        self.statements.write().await.push((session, sql.to_string()));
    }

    /// Log, delay, then apply one statement
    async fn run(&self, session: u64, sql: &str, journal: Option<&mut Journal>) -> Result<AdapterResponse, ExecutionError> {
        self.log(session, sql).await;

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        self.simulate_latency().await;

        let result = match self.configured_failure(sql).await {
            Some(error) => Err(error),
            None => self.interpret(sql, journal).await,
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match &result {
            Ok(response) => tracing::trace!(backend = self.backend_name, session, status = %response, "statement executed"),
            Err(error) => tracing::debug!(backend = self.backend_name, session, %error, "statement failed"),
        }
        result
    }

    /// Apply one statement to the catalog, journaling what it changes
    async fn interpret(&self, sql: &str, mut journal: Option<&mut Journal>) -> Result<AdapterResponse, ExecutionError> {
        if let Some(caps) = CREATE_RE.captures(sql) {
            let kind = if caps["kind"].eq_ignore_ascii_case("view") {
                RelationKind::View
            } else {
                RelationKind::Table
            };
            let parts = relation_parts(&caps["rel"]);
            let key = catalog_key(&parts);
            let replace = caps.name("replace").is_some();

            let mut catalog = self.catalog.write().await;
            if let Some(existing) = catalog.get(&key) {
                if !replace {
                    return Err(ExecutionError::Database(format!(
                        "relation \"{}\" already exists",
                        &caps["rel"]
                    )));
                }
                if existing.kind != kind {
                    return Err(ExecutionError::Database(format!(
                        "\"{}\" is not a {}",
                        &caps["rel"], kind
                    )));
                }
            }

            let info = RelationInfo::new(identifier_from_parts(&parts), kind)
                .with_columns(column_names(&caps["rest"]));
            remember(&mut journal, &catalog, &key);
            catalog.insert(key, info);

            let message = match kind {
                RelationKind::View => "CREATE VIEW",
                RelationKind::Table => "CREATE TABLE",
            };
            return Ok(AdapterResponse::new(message));
        }

        if let Some(caps) = DROP_RE.captures(sql) {
            let key = catalog_key(&relation_parts(&caps["rel"]));
            let mut catalog = self.catalog.write().await;
            remember(&mut journal, &catalog, &key);
            let removed = catalog.remove(&key);
            if removed.is_none() && caps.name("if_exists").is_none() {
                return Err(ExecutionError::Database(format!(
                    "relation \"{}\" does not exist",
                    &caps["rel"]
                )));
            }
            let message = format!("DROP {}", caps["kind"].to_uppercase());
            return Ok(AdapterResponse::new(message));
        }

        if let Some(caps) = RENAME_RE.captures(sql) {
            let parts = relation_parts(&caps["rel"]);
            let mut renamed = parts.clone();
            if let Some(last) = renamed.last_mut() {
                *last = caps["to"].trim_matches('"').to_string();
            }

            let old_key = catalog_key(&parts);
            let new_key = catalog_key(&renamed);
            let mut catalog = self.catalog.write().await;
            remember(&mut journal, &catalog, &old_key);
            remember(&mut journal, &catalog, &new_key);

            let mut info = catalog.remove(&old_key).ok_or_else(|| {
                ExecutionError::Database(format!("relation \"{}\" does not exist", &caps["rel"]))
            })?;
            if catalog.contains_key(&new_key) {
                let message = format!("relation \"{}\" already exists", &caps["to"]);
                catalog.insert(old_key, info);
                return Err(ExecutionError::Database(message));
            }
            info.relation = identifier_from_parts(&renamed);
            catalog.insert(new_key, info);
            return Ok(AdapterResponse::new("ALTER TABLE"));
        }

        if let Some(caps) = DML_RE.captures(sql) {
            let key = catalog_key(&relation_parts(&caps["rel"]));
            if !self.catalog.read().await.contains_key(&key) {
                return Err(ExecutionError::Database(format!(
                    "relation \"{}\" does not exist",
                    &caps["rel"]
                )));
            }

            let verb = caps["verb"].to_lowercase();
            let response = if verb.starts_with("insert") {
                let rows = if sql.to_lowercase().contains(" values") {
                    VALUES_TUPLE_RE.find_iter(sql).count() as u64 + 1
                } else {
                    self.query_rows(sql).await
                };
                AdapterResponse::new(format!("INSERT 0 {}", rows)).with_rows(rows)
            } else if verb.starts_with("delete") {
                let rows = self.query_rows(sql).await;
                AdapterResponse::new(format!("DELETE {}", rows)).with_rows(rows)
            } else if verb.starts_with("update") {
                let rows = self.query_rows(sql).await;
                AdapterResponse::new(format!("UPDATE {}", rows)).with_rows(rows)
            } else {
                AdapterResponse::new("TRUNCATE TABLE")
            };
            return Ok(response);
        }

        let head = sql.trim_start().to_lowercase();
        if head.starts_with("select") || head.starts_with("with") {
            let rows = self.query_rows(sql).await;
            return Ok(AdapterResponse::new(format!("SELECT {}", rows)).with_rows(rows));
        }

        Ok(AdapterResponse::new("OK"))
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MockBackend {
    fn clone(&self) -> Self {
        Self {
            catalog: Arc::clone(&self.catalog),
            statements: Arc::clone(&self.statements),
            next_session: Arc::clone(&self.next_session),
            failures: Arc::clone(&self.failures),
            query_results: Arc::clone(&self.query_results),
            in_flight: Arc::clone(&self.in_flight),
            max_in_flight: Arc::clone(&self.max_in_flight),
            relation_lookups: Arc::clone(&self.relation_lookups),
            fail_connection: self.fail_connection,
            latency_ms: self.latency_ms,
            backend_name: self.backend_name,
        }
    }
}

#[async_trait::async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        self.backend_name
    }

    async fn acquire(&self) -> Result<Box<dyn Session>, ExecutionError> {
        if self.fail_connection {
            return Err(ExecutionError::Connection("Simulated connection failure".to_string()));
        }
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            id,
            backend: self.clone(),
            journal: None,
        }))
    }

    async fn execute(&self, sql: &str) -> Result<AdapterResponse, ExecutionError> {
        self.run(AUTOCOMMIT_SESSION, sql, None).await
    }

    async fn get_relation(&self, relation: &RelationIdentifier) -> Result<Option<RelationInfo>, ExecutionError> {
        self.relation_lookups.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if self.fail_connection {
            return Err(ExecutionError::Connection("Simulated connection failure".to_string()));
        }

        Ok(self.catalog.read().await.get(&relation.cache_key()).cloned())
    }
}

/// Session on a [`MockBackend`]
pub struct MockSession {
    id: u64,
    backend: MockBackend,

    /// Open while a transaction is in progress
    journal: Option<Journal>,
}

impl MockSession {
    pub fn in_transaction(&self) -> bool {
        self.journal.is_some()
    }
}

#[async_trait::async_trait]
impl Session for MockSession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn execute(&mut self, sql: &str) -> Result<AdapterResponse, ExecutionError> {
        self.backend.run(self.id, sql, self.journal.as_mut()).await
    }

    async fn begin(&mut self) -> Result<(), ExecutionError> {
        if self.journal.is_some() {
            return Err(ExecutionError::Transaction(format!(
                "session {} already has a transaction in progress",
                self.id
            )));
        }
        self.backend.log(self.id, "BEGIN").await;
        self.journal = Some(Journal::new());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), ExecutionError> {
        if self.journal.take().is_none() {
            return Err(ExecutionError::Transaction(format!(
                "session {} has no transaction in progress",
                self.id
            )));
        }
        self.backend.log(self.id, "COMMIT").await;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), ExecutionError> {
        let journal = self.journal.take().ok_or_else(|| {
            ExecutionError::Transaction(format!("session {} has no transaction in progress", self.id))
        })?;
        self.backend.log(self.id, "ROLLBACK").await;

        let mut catalog = self.backend.catalog.write().await;
        for (key, previous) in journal.into_iter().rev() {
            match previous {
                Some(info) => catalog.insert(key, info),
                None => catalog.remove(&key),
            };
        }
        tracing::debug!(session = self.id, "rolled back session changes");
        Ok(())
    }
}

/// Builder for creating MockBackend with existing relations
///
/// # Example
///
/// ```rust,ignore
/// let backend = MockBackendBuilder::new()
///     .with_relation("public", "orders", RelationKind::Table)
///     .with_query_result("dbt_internal_test", 2)
///     .with_latency(5)
///     .build();
/// ```
pub struct MockBackendBuilder {
    catalog: HashMap<String, RelationInfo>,
    failures: Vec<(String, String)>,
    query_results: Vec<(String, u64)>,
    fail_connection: bool,
    latency_ms: u64,
    backend_name: &'static str,
}

impl MockBackendBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            catalog: HashMap::new(),
            failures: Vec::new(),
            query_results: Vec::new(),
            fail_connection: false,
            latency_ms: 0,
            backend_name: "mock",
        }
    }

    /// Add an existing relation
    pub fn with_relation(mut self, schema: &str, identifier: &str, kind: RelationKind) -> Self {
        let relation = RelationIdentifier::new(schema, identifier);
        self.catalog
            .insert(relation.cache_key(), RelationInfo::new(relation, kind));
        self
    }

    /// Add an existing relation with full details
    pub fn with_relation_info(mut self, info: RelationInfo) -> Self {
        self.catalog.insert(info.relation.cache_key(), info);
        self
    }

    /// Fail statements containing `pattern`
    pub fn with_failure(mut self, pattern: &str, message: &str) -> Self {
        self.failures.push((pattern.to_string(), message.to_string()));
        self
    }

    /// Row count for queries containing `pattern`
    pub fn with_query_result(mut self, pattern: &str, rows: u64) -> Self {
        self.query_results.push((pattern.to_string(), rows));
        self
    }

    /// Configure connection failure
    pub fn with_connection_failure(mut self) -> Self {
        self.fail_connection = true;
        self
    }

    /// Configure latency
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Set backend name
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.backend_name = name;
        self
    }

    /// Build the MockBackend
    pub fn build(self) -> MockBackend {
        MockBackend {
            catalog: Arc::new(RwLock::new(self.catalog)),
            statements: Arc::new(RwLock::new(Vec::new())),
            next_session: Arc::new(AtomicU64::new(AUTOCOMMIT_SESSION + 1)),
            failures: Arc::new(RwLock::new(self.failures)),
            query_results: Arc::new(RwLock::new(self.query_results)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            relation_lookups: Arc::new(AtomicUsize::new(0)),
            fail_connection: self.fail_connection,
            latency_ms: self.latency_ms,
            backend_name: self.backend_name,
        }
    }
}

impl Default for MockBackendBuilder {
    fn default() -> Self {
        Self::new()
    }
}
