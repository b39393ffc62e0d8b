//! minijinja-backed renderer

use dagsmith_core::{RenderContext, RenderError, Renderer};
use minijinja::{Environment, Error as JinjaError, ErrorKind, UndefinedBehavior};

use crate::context::TemplateContext;
use crate::macros::MacroRegistry;

/// Renders node templates with dbt-style functions and user macros
pub struct JinjaRenderer {
    env: Environment<'static>,
    macros: MacroRegistry,
}

impl JinjaRenderer {
    /// Create a renderer with the given macros
    pub fn new(macros: MacroRegistry) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        // Register dbt functions
        env.add_function("ref", crate::functions::ref_function);
        env.add_function("source", crate::functions::source_function);
        env.add_function("var", crate::functions::var_function);
        env.add_function("env_var", crate::functions::env_var_function);
        env.add_function("config", crate::functions::config_function);

        // Additional Jinja filters commonly used in dbt
        env.add_filter("as_bool", |value: String| -> bool {
            matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")
        });

        Self { env, macros }
    }

    pub fn macros(&self) -> &MacroRegistry {
        &self.macros
    }

    /// Check if text contains Jinja templates
    pub fn has_jinja(text: &str) -> bool {
        text.contains("{{") || text.contains("{%") || text.contains("{#")
    }
}

impl Default for JinjaRenderer {
    fn default() -> Self {
        Self::new(MacroRegistry::new())
    }
}

impl Renderer for JinjaRenderer {
    fn render(&self, template: &str, context: &RenderContext) -> Result<String, RenderError> {
        // If no Jinja detected, return as-is
        if !Self::has_jinja(template) {
            return Ok(template.to_string());
        }

        let mut source = self.macros.prelude_for(&context.model.package_name);
        source.push_str(template);

        let ctx = TemplateContext::from(context);
        self.env
            .render_str(&source, &ctx)
            .map_err(|e| {
                tracing::debug!(unique_id = %context.model.unique_id, error = %e, "render failed");
                to_render_error(e)
            })
    }
}

/// Convert a minijinja error into a [`RenderError`]
fn to_render_error(error: JinjaError) -> RenderError {
    let message = error.to_string();

    match error.kind() {
        ErrorKind::UndefinedError | ErrorKind::UnknownFunction => RenderError::UndefinedName {
            name: extract_quoted_name(&message).unwrap_or(message),
        },
        ErrorKind::SyntaxError => RenderError::Syntax { message },
        _ => RenderError::Other { message },
    }
}

/// First single-quoted name in an error message
fn extract_quoted_name(message: &str) -> Option<String> {
    let start = message.find('\'')?;
    let end = message[start + 1..].find('\'')?;
    Some(message[start + 1..start + 1 + end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagsmith_core::{NodeContext, RefTarget, ResourceKind, SourceTarget, TargetConfig};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn context() -> RenderContext {
        let mut vars = BTreeMap::new();
        vars.insert("start_date".to_string(), serde_json::json!("2020-01-01"));

        RenderContext {
            model: NodeContext {
                unique_id: "model.app.orders".into(),
                name: "orders".into(),
                package_name: "app".into(),
                resource_type: ResourceKind::Model,
            },
            this: "analytics.orders".into(),
            refs: vec![RefTarget {
                unique_id: "model.app.stg_orders".into(),
                package: "app".into(),
                name: "stg_orders".into(),
                rendered: "analytics.stg_orders".into(),
            }],
            sources: vec![SourceTarget {
                unique_id: "source.app.raw.payments".into(),
                source_name: "raw".into(),
                name: "payments".into(),
                rendered: "raw.payments".into(),
            }],
            vars,
            target: TargetConfig::default(),
        }
    }

    fn render(template: &str) -> Result<String, RenderError> {
        JinjaRenderer::default().render(template, &context())
    }

    #[test]
    fn as_bool_reads_string_flags() {
        let template = "{% if var('backfill', 'Yes') | as_bool %}full{% else %}delta{% endif %}";
        assert_eq!(render(template).unwrap(), "full");
        assert_eq!(render("{% if 'no' | as_bool %}full{% else %}delta{% endif %}").unwrap(), "delta");
        assert_eq!(render("{{ '1' | as_bool }} {{ 'off' | as_bool }}").unwrap(), "true false");
    }

    #[test]
    fn no_jinja_passthrough() {
        assert_eq!(render("select 1").unwrap(), "select 1");
    }

    #[test]
    fn ref_and_source_resolve_declared_dependencies() {
        let sql = render(
            "select * from {{ ref('stg_orders') }} join {{ source('raw', 'payments') }} using (id)",
        )
        .unwrap();
        assert_eq!(sql, "select * from analytics.stg_orders join raw.payments using (id)");

        assert_eq!(
            render("{{ ref('app', 'stg_orders') }}").unwrap(),
            "analytics.stg_orders"
        );
    }

    #[test]
    fn undeclared_ref_is_an_error() {
        let err = render("select * from {{ ref('customers') }}").unwrap_err();
        assert_eq!(
            err,
            RenderError::UndefinedName { name: "customers".into() }
        );
    }

    #[test]
    fn var_with_and_without_default() {
        assert_eq!(render("{{ var('start_date') }}").unwrap(), "2020-01-01");
        assert_eq!(render("{{ var('missing', 7) }}").unwrap(), "7");
        assert!(matches!(
            render("{{ var('missing') }}"),
            Err(RenderError::UndefinedName { .. })
        ));
    }

    #[test]
    fn config_renders_nothing() {
        let sql = render("{{ config(materialized='table') }}select 1").unwrap();
        assert_eq!(sql, "select 1");
    }

    #[test]
    fn this_and_target() {
        assert_eq!(render("{{ this }} in {{ target.schema }}").unwrap(), "analytics.orders in public");
    }

    #[test]
    fn undefined_variable_is_strict() {
        assert!(matches!(
            render("select {{ nope }}"),
            Err(RenderError::UndefinedName { .. })
        ));
    }

    #[test]
    fn malformed_template_is_syntax_error() {
        assert!(matches!(
            render("select {{ ref('x' }}"),
            Err(RenderError::Syntax { .. })
        ));
    }

    #[test]
    fn env_var_default() {
        assert_eq!(
            render("{{ env_var('DAGSMITH_TEST_SURELY_UNSET', 'anon') }}").unwrap(),
            "anon"
        );
    }

    #[test]
    fn macros_shadow_by_package() {
        let mut macros = MacroRegistry::new().with_root_package("app");
        macros.register("utils", "cents", "{% macro cents(c) %}{{ c }} / 1000{% endmacro %}");
        macros.register("app", "cents", "{% macro cents(c) %}{{ c }} / 100{% endmacro %}");
        let renderer = JinjaRenderer::new(macros);

        let sql = renderer
            .render("select {{ cents('amount') }} as dollars", &context())
            .unwrap();
        assert_eq!(sql, "select amount / 100 as dollars");
    }
}
