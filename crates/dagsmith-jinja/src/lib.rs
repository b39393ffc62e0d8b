//! Jinja rendering for node templates
//!
//! This crate handles:
//! - The minijinja-backed [`Renderer`](dagsmith_core::Renderer) implementation
//! - dbt-style functions (ref, source, var, env_var, config)
//! - User macros resolved by package

pub mod context;
pub mod functions;
pub mod macros;
pub mod renderer;

pub use context::{Resolver, TemplateContext};
pub use functions::{config_function, env_var_function, ref_function, source_function, var_function};
pub use macros::MacroRegistry;
pub use renderer::JinjaRenderer;
