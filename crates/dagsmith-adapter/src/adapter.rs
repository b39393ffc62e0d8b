//! Backend capability set
//!
//! The runner only ever talks to a warehouse through [`Backend`]: look up a
//! relation, or open a [`Session`] that runs a node's statements inside its
//! own transaction.

use dagsmith_core::RelationIdentifier;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of relation present in the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Table,
    View,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::View => "view",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Existing relation as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationInfo {
    pub relation: RelationIdentifier,
    pub kind: RelationKind,

    /// Column names, when the backend knows them
    #[serde(default)]
    pub columns: Vec<String>,
}

impl RelationInfo {
    pub fn new(relation: RelationIdentifier, kind: RelationKind) -> Self {
        Self {
            relation,
            kind,
            columns: Vec::new(),
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_table(&self) -> bool {
        self.kind == RelationKind::Table
    }

    pub fn is_view(&self) -> bool {
        self.kind == RelationKind::View
    }
}

/// Backend response to one statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterResponse {
    /// Status text (e.g. "CREATE VIEW", "INSERT 0 3")
    pub message: String,

    /// Rows affected or returned, when the backend reports it
    pub rows_affected: Option<u64>,
}

impl AdapterResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            rows_affected: None,
        }
    }

    pub fn with_rows(mut self, rows: u64) -> Self {
        self.rows_affected = Some(rows);
        self
    }
}

impl fmt::Display for AdapterResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Errors raised by the backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transaction error: {0}")]
    Transaction(String),
}

/// One connection to the backend
///
/// A transaction opened on a session covers only the statements executed
/// through that session. Each node gets its own session, so concurrent nodes
/// never share a transaction.
#[async_trait::async_trait]
pub trait Session: Send {
    /// Identifies the session in backend logs
    fn id(&self) -> u64;

    /// Execute one statement on this session
    async fn execute(&mut self, sql: &str) -> Result<AdapterResponse, ExecutionError>;

    async fn begin(&mut self) -> Result<(), ExecutionError>;

    async fn commit(&mut self) -> Result<(), ExecutionError>;

    /// Discard everything executed since `begin`
    async fn rollback(&mut self) -> Result<(), ExecutionError>;
}

/// Trait for backends that can execute compiled nodes
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Get the backend name (e.g., "postgres", "mock")
    fn name(&self) -> &'static str;

    /// Open a new session
    async fn acquire(&self) -> Result<Box<dyn Session>, ExecutionError>;

    /// Execute one statement outside any transaction (autocommit)
    async fn execute(&self, sql: &str) -> Result<AdapterResponse, ExecutionError>;

    /// Look up a relation; `None` when it does not exist
    async fn get_relation(&self, relation: &RelationIdentifier) -> Result<Option<RelationInfo>, ExecutionError>;
}
