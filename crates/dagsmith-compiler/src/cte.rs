//! Ephemeral CTE markers and injection
//!
//! An ephemeral node is referenced from compiled SQL through a marker
//! (`__dbt__CTE__<name>`). Injection turns the markers' definitions into a
//! leading `with` clause.

use dagsmith_core::InjectedCte;
use regex::Regex;
use std::sync::LazyLock;

/// A leading `with` keyword, after any whitespace or comments, plus an
/// optional `recursive`
static LEADING_WITH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^(?:\s|--[^\n]*\n|/\*.*?\*/)*with\b(?:\s+recursive\b)?")
        .expect("leading with pattern compiles")
});

/// Map any character outside `[A-Za-z0-9_]` to `_`
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Marker identifier for an ephemeral node
pub fn marker(prefix: &str, name: &str) -> String {
    format!("__{}__CTE__{}", prefix, sanitize(name))
}

/// Finds ephemeral markers in compiled SQL
#[derive(Debug, Clone)]
pub struct MarkerScanner {
    pattern: Regex,
}

impl MarkerScanner {
    pub fn new(prefix: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!(r"__{}__CTE__[A-Za-z0-9_]+", regex::escape(prefix)))?;
        Ok(Self { pattern })
    }

    /// Distinct markers in order of first appearance
    pub fn scan(&self, sql: &str) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        for m in self.pattern.find_iter(sql) {
            if !found.iter().any(|f| f == m.as_str()) {
                found.push(m.as_str().to_string());
            }
        }
        found
    }
}

/// CTE definition for an ephemeral node: `<marker> as (<sql>)`
pub fn cte_definition(marker: &str, compiled: &str) -> String {
    let body = compiled.trim();
    // A trailing line comment would swallow the closing paren
    let ends_in_comment = body.lines().last().is_some_and(|line| line.contains("--"));
    if ends_in_comment {
        format!("{} as ({}\n)", marker, body)
    } else {
        format!("{} as ({})", marker, body)
    }
}

/// Prepend CTE definitions to `sql`
///
/// If `sql` already opens with a `with` clause the new definitions go
/// first, ahead of the existing ones; otherwise a new clause is built.
/// No CTEs leaves the text unchanged.
pub fn inject_ctes(sql: &str, ctes: &[InjectedCte]) -> String {
    if ctes.is_empty() {
        return sql.to_string();
    }

    let joined = ctes
        .iter()
        .map(|cte| cte.sql.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    match LEADING_WITH.find(sql) {
        Some(m) => {
            let rest = sql[m.end()..].trim_start();
            format!("{} {}, {}", &sql[..m.end()], joined, rest)
        }
        None => format!("with {} {}", joined, sql.trim_start()),
    }
}
