//! dagsmith core
//!
//! Core domain model shared by every stage of the pipeline: nodes and their
//! configuration, relation identifiers, the rendering capability, project
//! configuration and the run report.

pub mod node;
pub mod relation;
pub mod render;
pub mod config;
pub mod report;
pub mod error;

pub use node::{Node, NodeId, NodeConfig, DependsOn, InjectedCte, Materialization, ResourceKind, TestSeverity};
pub use relation::RelationIdentifier;
pub use render::{Renderer, RenderContext, RenderError, NodeContext, RefTarget, SourceTarget};
pub use config::{ProjectConfig, TargetConfig, ConfigError, DEFAULT_THREADS};
pub use report::{RunReport, RunResult, RunStatus, ReportSummary, ReportVersion};
pub use error::InternalError;
