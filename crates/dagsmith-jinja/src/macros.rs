//! Macro registry
//!
//! User macros keyed by (package, name). Rendering a node defines the
//! macros ahead of its template so that, for a node in package P, macros
//! of other packages come first, then the root project's, then P's own.
//! Later definitions shadow earlier ones.

use dagsmith_graph::Manifest;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct MacroRegistry {
    macros: BTreeMap<(String, String), String>,
    root_package: Option<String>,
}

impl MacroRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every macro in a manifest
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let mut registry = Self::new();
        registry.root_package = manifest.project_name().map(str::to_string);
        for def in manifest.macros.values() {
            registry.register(&def.package_name, &def.name, &def.macro_sql);
        }
        registry
    }

    pub fn with_root_package(mut self, package: impl Into<String>) -> Self {
        self.root_package = Some(package.into());
        self
    }

    /// Register a `{% macro %}` definition; replaces an existing one
    pub fn register(&mut self, package: &str, name: &str, macro_sql: &str) {
        self.macros
            .insert((package.to_string(), name.to_string()), macro_sql.trim().to_string());
    }

    pub fn get(&self, package: &str, name: &str) -> Option<&str> {
        self.macros
            .get(&(package.to_string(), name.to_string()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.macros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }

    /// Rank of a package when rendering a node of `package`
    fn rank(&self, owner: &str, package: &str) -> u8 {
        if owner == package {
            2
        } else if self.root_package.as_deref() == Some(owner) {
            1
        } else {
            0
        }
    }

    /// Macro definitions to place ahead of a template from `package`
    ///
    /// Definitions are concatenated without separators so they render to
    /// nothing.
    pub fn prelude_for(&self, package: &str) -> String {
        let mut entries: Vec<_> = self.macros.iter().collect();
        entries.sort_by_key(|((owner, name), _)| (self.rank(owner, package), owner.clone(), name.clone()));
        entries.into_iter().map(|(_, sql)| sql.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_package_comes_last() {
        let mut registry = MacroRegistry::new().with_root_package("app");
        registry.register("utils", "a", "{% macro a() %}utils{% endmacro %}");
        registry.register("app", "a", "{% macro a() %}app{% endmacro %}");
        registry.register("lib", "a", "{% macro a() %}lib{% endmacro %}");

        let prelude = registry.prelude_for("lib");
        let app = prelude.find("app").unwrap();
        let lib = prelude.find("}lib").unwrap();
        let utils = prelude.find("utils").unwrap();
        assert!(utils < app && app < lib);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn register_replaces() {
        let mut registry = MacroRegistry::new();
        registry.register("p", "m", "  {% macro m() %}1{% endmacro %}\n");
        registry.register("p", "m", "{% macro m() %}2{% endmacro %}");
        assert_eq!(registry.get("p", "m"), Some("{% macro m() %}2{% endmacro %}"));
    }
}
