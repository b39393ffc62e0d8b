//! Backend adapters for executing compiled nodes
//!
//! The runner reaches the warehouse only through the [`Backend`] trait.
//! Statements that must share a transaction run through a [`Session`].
//! [`MockBackend`] keeps an in-memory relation catalog and is used for
//! tests and dry runs.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dagsmith_adapter::{Backend, MockBackend};
//! use dagsmith_core::RelationIdentifier;
//!
//! let backend = MockBackend::new();
//! let mut session = backend.acquire().await?;
//! session.begin().await?;
//! session.execute("create view public.orders as (select 1 as id)").await?;
//! session.commit().await?;
//! let existing = backend.get_relation(&RelationIdentifier::new("public", "orders")).await?;
//! ```

pub mod adapter;
pub mod mock;

pub use adapter::{AdapterResponse, Backend, ExecutionError, RelationInfo, RelationKind, Session};
pub use mock::{MockBackend, MockBackendBuilder, MockSession, AUTOCOMMIT_SESSION};
