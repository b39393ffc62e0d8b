//! Graph compiler
//!
//! Renders node templates and inlines ephemeral nodes as CTEs.

pub mod compiler;
pub mod cte;

pub use compiler::{CompilationError, CompileOptions, Compiler};
pub use cte::{cte_definition, inject_ctes, marker, sanitize, MarkerScanner};
