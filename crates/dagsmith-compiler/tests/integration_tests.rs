//! Integration tests for rendering and ephemeral CTE inlining

use dagsmith_compiler::{CompilationError, CompileOptions, Compiler};
use dagsmith_core::{InternalError, Materialization, Node, RenderError, ResourceKind};
use dagsmith_graph::{DependencyGraph, Manifest};
use dagsmith_jinja::JinjaRenderer;
use pretty_assertions::assert_eq;

fn compiler() -> Compiler<JinjaRenderer> {
    Compiler::new(JinjaRenderer::default(), CompileOptions::default()).unwrap()
}

fn model(name: &str, raw: &str, deps: &[&str]) -> Node {
    Node::new(ResourceKind::Model, "root", name)
        .with_raw_text(raw)
        .with_depends_on(deps.iter().map(|d| format!("model.root.{}", d)))
}

fn ephemeral(name: &str, raw: &str, deps: &[&str]) -> Node {
    model(name, raw, deps).with_materialization(Materialization::Ephemeral)
}

fn squash(sql: &str) -> String {
    sql.split_whitespace().collect()
}

#[test]
fn three_level_ephemeral_chain() {
    let mut manifest = Manifest::from_nodes(vec![
        model("A", r#"select * from {{ref("B")}}"#, &["B"]),
        ephemeral("B", r#"select * from {{ref("C")}}"#, &["C"]),
        ephemeral("C", "select * from source_table", &[]),
    ]);

    let compiler = compiler();
    let a = compiler.compile_node(&mut manifest, "model.root.A").unwrap();

    assert!(a.is_injected());
    assert_eq!(
        a.injected_text().unwrap(),
        "with __dbt__CTE__C as (select * from source_table), \
         __dbt__CTE__B as (select * from __dbt__CTE__C) \
         select * from __dbt__CTE__B"
    );
    let ids: Vec<&str> = a.extra_ctes().iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["model.root.C", "model.root.B"]);

    // Ancestors reached through the recursion are injected as well
    assert!(manifest.get("model.root.B").unwrap().is_injected());
    assert!(manifest.get("model.root.C").unwrap().is_injected());
    assert_eq!(
        manifest.get("model.root.C").unwrap().injected_text(),
        Some("select * from source_table")
    );
}

#[test]
fn existing_leading_cte_is_kept_after_inlined_ones() {
    let mut manifest = Manifest::from_nodes(vec![
        model(
            "view",
            "with cte as (select * from something_else) select * from {{ ref('ephemeral') }}",
            &["ephemeral"],
        ),
        ephemeral("ephemeral", "select * from source_table", &[]),
    ]);

    let view = compiler().compile_node(&mut manifest, "model.root.view").unwrap();
    assert_eq!(
        squash(view.injected_text().unwrap()),
        squash(
            "with __dbt__CTE__ephemeral as (select * from source_table), \
             cte as (select * from something_else) \
             select * from __dbt__CTE__ephemeral"
        )
    );
}

#[test]
fn node_without_ephemeral_ancestors_is_unchanged() {
    let mut manifest = Manifest::from_nodes(vec![
        model("base", "select 1 as id", &[]),
        model("view", "select * from {{ ref('base') }}", &["base"]),
    ]);

    let view = compiler().compile_node(&mut manifest, "model.root.view").unwrap();
    assert!(view.is_injected());
    assert!(view.extra_ctes().is_empty());
    assert_eq!(view.injected_text(), Some("select * from public.base"));
    assert_eq!(view.compiled_text(), view.injected_text());
}

#[test]
fn shared_ephemeral_ancestor_is_processed_once() {
    let mut manifest = Manifest::from_nodes(vec![
        ephemeral("e", "select 1 as id", &[]),
        ephemeral("left", "select * from {{ ref('e') }}", &["e"]),
        ephemeral("right", "select * from {{ ref('e') }}", &["e"]),
        model(
            "joined",
            "select * from {{ ref('left') }} join {{ ref('right') }} using (id)",
            &["left", "right"],
        ),
    ]);

    let joined = compiler().compile_node(&mut manifest, "model.root.joined").unwrap();
    let ids: Vec<&str> = joined.extra_ctes().iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["model.root.e", "model.root.left", "model.root.right"]);
    assert_eq!(
        joined.injected_text().unwrap().matches("__dbt__CTE__e as").count(),
        1
    );
}

#[test]
fn compiling_twice_is_a_noop() {
    let mut manifest = Manifest::from_nodes(vec![
        model("A", "select * from {{ ref('B') }}", &["B"]),
        ephemeral("B", "select 1", &[]),
    ]);

    let compiler = compiler();
    let first = compiler
        .compile_node(&mut manifest, "model.root.A")
        .unwrap()
        .clone();
    let second = compiler
        .compile_node(&mut manifest, "model.root.A")
        .unwrap()
        .clone();
    assert_eq!(first, second);

    // Recording again directly is an internal error
    let node = manifest.get_mut("model.root.A").unwrap();
    assert!(matches!(
        node.record_injected("select 2".into(), vec![]),
        Err(InternalError::AlreadyInjected(_))
    ));
}

#[test]
fn dangling_marker_is_a_compilation_error() {
    let mut manifest = Manifest::from_nodes(vec![
        Node::new(ResourceKind::Model, "root", "view").with_compiled_text("select * from __dbt__CTE__gone"),
    ]);

    let err = compiler()
        .compile_node(&mut manifest, "model.root.view")
        .unwrap_err();
    match err {
        CompilationError::DanglingEphemeral { unique_id, marker } => {
            assert_eq!(unique_id, "model.root.view");
            assert_eq!(marker, "__dbt__CTE__gone");
        }
        other => panic!("expected dangling marker, got {other:?}"),
    }
}

#[test]
fn render_failure_names_the_node() {
    let mut manifest = Manifest::from_nodes(vec![model("bad", "select * from {{ ref('nowhere') }}", &[])]);

    let err = compiler().compile_node(&mut manifest, "model.root.bad").unwrap_err();
    assert!(matches!(
        err,
        CompilationError::Render {
            ref unique_id,
            source: RenderError::UndefinedName { .. },
        } if unique_id == "model.root.bad"
    ));
}

#[test]
fn sources_render_as_relations_and_are_never_compiled() {
    let raw = Node::source("root", "raw", "events");
    let mut manifest = Manifest::from_nodes(vec![
        raw.clone(),
        Node::new(ResourceKind::Model, "root", "stg")
            .with_raw_text("select * from {{ source('raw', 'events') }}")
            .with_depends_on([raw.unique_id.clone()]),
    ]);

    let compiler = compiler();
    let stg = compiler.compile_node(&mut manifest, "model.root.stg").unwrap();
    assert_eq!(stg.injected_text(), Some("select * from raw.events"));

    let source = compiler.compile_node(&mut manifest, &raw.unique_id).unwrap();
    assert!(!source.is_compiled());
}

#[test]
fn seeds_carry_csv_verbatim() {
    let mut manifest = Manifest::from_nodes(vec![
        Node::new(ResourceKind::Seed, "root", "countries").with_raw_text("code,name\nnl,{{ not jinja }}\n"),
    ]);
    let seed = compiler().compile_node(&mut manifest, "seed.root.countries").unwrap();
    assert_eq!(seed.injected_text(), Some("code,name\nnl,{{ not jinja }}\n"));
}

#[test]
fn compile_all_in_topological_order() {
    let mut manifest = Manifest::from_nodes(vec![
        model("a", "select 1", &[]),
        ephemeral("b", "select * from {{ ref('a') }}", &["a"]),
        model("c", "select * from {{ ref('b') }}", &["b"]),
    ]);
    let graph = DependencyGraph::build(&manifest).unwrap();

    let count = compiler()
        .compile_all(&mut manifest, graph.topological_order())
        .unwrap();
    assert_eq!(count, 3);
    assert!(manifest.nodes.values().all(|n| n.is_injected()));
    assert_eq!(
        manifest.get("model.root.c").unwrap().injected_text(),
        Some("with __dbt__CTE__b as (select * from public.a) select * from __dbt__CTE__b")
    );
}

#[test]
fn custom_prefix_and_quoting() {
    let mut options = CompileOptions::default();
    options.cte_prefix = "ds".to_string();
    options.quoting = true;
    let compiler = Compiler::new(JinjaRenderer::default(), options).unwrap();

    let mut manifest = Manifest::from_nodes(vec![
        model("a", "select 1", &[]),
        ephemeral("e", "select * from {{ ref('a') }}", &["a"]),
        model("c", "select * from {{ ref('e') }}", &["e"]),
    ]);

    let c = compiler.compile_node(&mut manifest, "model.root.c").unwrap();
    assert_eq!(
        c.injected_text(),
        Some("with __ds__CTE__e as (select * from \"public\".\"a\") select * from __ds__CTE__e")
    );
}

#[test]
fn same_named_ephemerals_from_different_packages_stay_distinct() {
    let mut manifest = Manifest::from_nodes(vec![
        Node::new(ResourceKind::Model, "p1", "e")
            .with_raw_text("select 1 as from_p1")
            .with_materialization(Materialization::Ephemeral),
        Node::new(ResourceKind::Model, "p2", "e")
            .with_raw_text("select 2 as from_p2")
            .with_materialization(Materialization::Ephemeral),
        Node::new(ResourceKind::Model, "root", "a")
            .with_raw_text("select * from {{ ref('p1', 'e') }} join {{ ref('p2', 'e') }} using (x)")
            .with_depends_on(["model.p1.e", "model.p2.e"]),
    ]);

    let a = compiler().compile_node(&mut manifest, "model.root.a").unwrap();
    assert_eq!(
        a.injected_text().unwrap(),
        "with __dbt__CTE__model_p1_e as (select 1 as from_p1), \
         __dbt__CTE__model_p2_e as (select 2 as from_p2) \
         select * from __dbt__CTE__model_p1_e join __dbt__CTE__model_p2_e using (x)"
    );
    let ids: Vec<&str> = a.extra_ctes().iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["model.p1.e", "model.p2.e"]);
}

#[test]
fn marker_matching_two_ephemerals_is_a_compilation_error() {
    // Both unique_ids sanitize to model_root_a_b
    let mut manifest = Manifest::from_nodes(vec![
        ephemeral("a-b", "select 1", &[]),
        ephemeral("a_b", "select 2", &[]),
        model("c", "select * from __dbt__CTE__model_root_a_b", &["a-b", "a_b"]),
    ]);

    let err = compiler().compile_node(&mut manifest, "model.root.c").unwrap_err();
    match err {
        CompilationError::AmbiguousEphemeral { unique_id, candidates, .. } => {
            assert_eq!(unique_id, "model.root.c");
            assert_eq!(candidates, vec!["model.root.a-b", "model.root.a_b"]);
        }
        other => panic!("expected AmbiguousEphemeral, got {other:?}"),
    }
}
