//! Manifest loading, DAG construction and node selection
//!
//! This crate handles:
//! - Parsing manifest.json into the node arena
//! - Building and validating the dependency graph (missing edges, cycles)
//! - Stable topological ordering
//! - Selection specs and induced subgraphs

pub mod manifest;
pub mod dag;
pub mod selector;

pub use manifest::{Manifest, ManifestError, ManifestMetadata, MacroDefinition};
pub use dag::{DependencyGraph, GraphValidationError};
pub use selector::{Expansion, NodeSelector, SelectionSpec, SelectorMethod};
