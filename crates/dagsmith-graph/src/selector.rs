//! Node selection
//!
//! Selection specs pick the subgraph of nodes that participates in a run:
//!
//! ```text
//! orders            node named "orders" (or unique_id / dotted fqn)
//! +orders           orders and all its ancestors
//! orders+           orders and all its descendants
//! 2+orders+1        ancestors up to two edges away, children one edge away
//! @orders           orders, its ancestors and its descendants
//! tag:nightly       nodes tagged "nightly"
//! path:models/mart  nodes whose file path starts with the prefix
//! *                 every node
//! ```

use dagsmith_core::{Node, NodeId};
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::dag::{DependencyGraph, GraphValidationError};
use crate::manifest::Manifest;

/// How a spec matches nodes before graph operators are applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorMethod {
    /// Node name, unique_id or dotted fqn
    Name(String),
    UniqueId(String),
    Fqn(String),
    Tag(String),
    Path(String),
    All,
}

impl SelectorMethod {
    pub fn matches(&self, node: &Node) -> bool {
        match self {
            Self::Name(value) => {
                node.name == *value || node.unique_id == *value || node.fqn.join(".") == *value
            }
            Self::UniqueId(value) => node.unique_id == *value,
            Self::Fqn(value) => node.fqn.join(".") == *value,
            Self::Tag(value) => node.tags.iter().any(|t| t == value),
            Self::Path(prefix) => {
                let prefix = prefix.trim_start_matches("./");
                node.original_file_path.starts_with(prefix) || node.path.starts_with(prefix)
            }
            Self::All => true,
        }
    }
}

/// Graph expansion for one side of a spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expansion {
    #[default]
    None,
    /// Full transitive closure
    All,
    /// At most this many edges away
    Depth(usize),
}

/// A single parsed selection spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionSpec {
    pub method: SelectorMethod,
    pub parents: Expansion,
    pub children: Expansion,
}

impl SelectionSpec {
    pub fn new(method: SelectorMethod) -> Self {
        Self {
            method,
            parents: Expansion::None,
            children: Expansion::None,
        }
    }

    /// Exact name match
    pub fn name(name: impl Into<String>) -> Self {
        Self::new(SelectorMethod::Name(name.into()))
    }

    pub fn with_parents(mut self) -> Self {
        self.parents = Expansion::All;
        self
    }

    pub fn with_children(mut self) -> Self {
        self.children = Expansion::All;
        self
    }

    /// Parse a space-delimited list of specs
    pub fn parse_list(input: &str) -> Result<Vec<Self>, GraphValidationError> {
        input.split_whitespace().map(str::parse).collect()
    }
}

/// `[@][N+]body[+N]`
static SPEC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<at>@)?(?:(?P<pdepth>\d*)(?P<plus>\+))?(?P<body>[^+@]+?)(?P<cplus>\+(?P<cdepth>\d*))?$")
        .expect("selector pattern compiles")
});

fn expansion(depth: &str) -> Result<Expansion, std::num::ParseIntError> {
    if depth.is_empty() {
        Ok(Expansion::All)
    } else {
        depth.parse().map(Expansion::Depth)
    }
}

impl FromStr for SelectionSpec {
    type Err = GraphValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GraphValidationError::UnknownSelector(s.to_string());

        let caps = SPEC_RE.captures(s.trim()).ok_or_else(invalid)?;
        let body = caps.name("body").map_or("", |m| m.as_str());

        let method = match body.split_once(':') {
            None if body == "*" => SelectorMethod::All,
            None => SelectorMethod::Name(body.to_string()),
            Some(("tag", v)) if !v.is_empty() => SelectorMethod::Tag(v.to_string()),
            Some(("path", v)) if !v.is_empty() => SelectorMethod::Path(v.to_string()),
            Some(("fqn", v)) if !v.is_empty() => SelectorMethod::Fqn(v.to_string()),
            Some(("unique_id", v)) if !v.is_empty() => SelectorMethod::UniqueId(v.to_string()),
            Some(_) => return Err(invalid()),
        };

        let mut spec = SelectionSpec::new(method);

        if caps.name("at").is_some() {
            if caps.name("plus").is_some() || caps.name("cplus").is_some() {
                return Err(invalid());
            }
            spec.parents = Expansion::All;
            spec.children = Expansion::All;
            return Ok(spec);
        }

        if caps.name("plus").is_some() {
            let depth = caps.name("pdepth").map_or("", |m| m.as_str());
            spec.parents = expansion(depth).map_err(|_| invalid())?;
        }
        if caps.name("cplus").is_some() {
            let depth = caps.name("cdepth").map_or("", |m| m.as_str());
            spec.children = expansion(depth).map_err(|_| invalid())?;
        }

        Ok(spec)
    }
}

impl fmt::Display for SelectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let all_both = self.parents == Expansion::All && self.children == Expansion::All;
        if all_both {
            write!(f, "@")?;
        } else {
            match self.parents {
                Expansion::None => {}
                Expansion::All => write!(f, "+")?,
                Expansion::Depth(n) => write!(f, "{}+", n)?,
            }
        }

        match &self.method {
            SelectorMethod::Name(v) => write!(f, "{}", v)?,
            SelectorMethod::UniqueId(v) => write!(f, "unique_id:{}", v)?,
            SelectorMethod::Fqn(v) => write!(f, "fqn:{}", v)?,
            SelectorMethod::Tag(v) => write!(f, "tag:{}", v)?,
            SelectorMethod::Path(v) => write!(f, "path:{}", v)?,
            SelectorMethod::All => write!(f, "*")?,
        }

        if !all_both {
            match self.children {
                Expansion::None => {}
                Expansion::All => write!(f, "+")?,
                Expansion::Depth(n) => write!(f, "+{}", n)?,
            }
        }
        Ok(())
    }
}

/// Resolves selection specs against a manifest and its graph
pub struct NodeSelector<'a> {
    manifest: &'a Manifest,
    graph: &'a DependencyGraph,
}

impl<'a> NodeSelector<'a> {
    pub fn new(manifest: &'a Manifest, graph: &'a DependencyGraph) -> Self {
        Self { manifest, graph }
    }

    /// Nodes matched by one spec, with its graph operators applied
    pub fn resolve(&self, spec: &SelectionSpec) -> BTreeSet<NodeId> {
        let mut selected = BTreeSet::new();

        let matched = self
            .graph
            .nodes()
            .iter()
            .filter(|id| self.manifest.get(id).is_some_and(|node| spec.method.matches(node)));

        for id in matched {
            match spec.parents {
                Expansion::None => {}
                Expansion::All => selected.extend(self.graph.ancestors(id)),
                Expansion::Depth(n) => selected.extend(self.graph.ancestors_within(id, n)),
            }
            match spec.children {
                Expansion::None => {}
                Expansion::All => selected.extend(self.graph.descendants(id)),
                Expansion::Depth(n) => selected.extend(self.graph.descendants_within(id, n)),
            }
            selected.insert(id.clone());
        }

        if selected.is_empty() {
            tracing::warn!(selector = %spec, "selection spec matched no nodes");
        }

        selected
    }

    /// Selected runnable node ids
    ///
    /// An empty include list selects every node. Exclusion is applied after
    /// inclusion. Sources are never selected; they only satisfy dependencies.
    pub fn select(&self, include: &[SelectionSpec], exclude: &[SelectionSpec]) -> BTreeSet<NodeId> {
        let mut selected: BTreeSet<NodeId> = if include.is_empty() {
            self.graph.nodes().iter().cloned().collect()
        } else {
            include.iter().flat_map(|spec| self.resolve(spec)).collect()
        };

        for spec in exclude {
            for id in self.resolve(spec) {
                selected.remove(&id);
            }
        }

        selected.retain(|id| {
            self.manifest
                .get(id)
                .is_some_and(|node| node.resource_type.is_runnable())
        });

        tracing::debug!(selected = selected.len(), "resolved selection");
        selected
    }

    /// Induced subgraph of the selection
    pub fn select_subgraph(&self, include: &[SelectionSpec], exclude: &[SelectionSpec]) -> DependencyGraph {
        self.graph.subgraph(&self.select(include, exclude))
    }
}
