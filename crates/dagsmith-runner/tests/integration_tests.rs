//! End-to-end runs against the in-memory backend

use dagsmith_adapter::{Backend, MockBackend, MockBackendBuilder};
use dagsmith_core::{Materialization, Node, NodeConfig, ProjectConfig, ResourceKind, RunStatus, TestSeverity};
use dagsmith_graph::{GraphValidationError, Manifest, SelectionSpec};
use dagsmith_jinja::JinjaRenderer;
use dagsmith_runner::{NoopObserver, RunConfig, RunError, RunTask};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;

fn model(name: &str, raw: &str, deps: &[&str]) -> Node {
    Node::new(ResourceKind::Model, "root", name)
        .with_raw_text(raw)
        .with_depends_on(deps.iter().map(|d| d.to_string()))
}

/// seed -> table_model, seed -> view_model -> view_summary, seed -> incremental
fn seed_project() -> Manifest {
    Manifest::from_nodes(vec![
        Node::new(ResourceKind::Seed, "root", "seed").with_raw_text("id,name\n1,Easton\n2,Lillian\n"),
        model("table_model", "select * from {{ ref('seed') }}", &["seed.root.seed"])
            .with_materialization(Materialization::Table),
        model("view_model", "select * from {{ ref('seed') }}", &["seed.root.seed"]),
        model("view_summary", "select count(*) as n from {{ ref('view_model') }}", &["model.root.view_model"]),
        model("incremental", "select * from {{ ref('seed') }}", &["seed.root.seed"])
            .with_materialization(Materialization::Incremental),
    ])
}

fn task(config: RunConfig) -> RunTask {
    RunTask::new(ProjectConfig::default(), config).with_observer(Arc::new(NoopObserver))
}

fn select(specs: &str) -> RunConfig {
    RunConfig::default().with_select(SelectionSpec::parse_list(specs).unwrap())
}

async fn run(config: RunConfig, manifest: Manifest, backend: &MockBackend) -> Result<dagsmith_core::RunReport, RunError> {
    task(config)
        .run(manifest, JinjaRenderer::default(), Arc::new(backend.clone()))
        .await
}

#[tokio::test]
async fn full_project_runs_in_dependency_order() {
    let backend = MockBackend::new();
    let report = run(RunConfig::default().with_threads(1), seed_project(), &backend)
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(
        report.completion_order(),
        vec![
            "seed.root.seed",
            "model.root.incremental",
            "model.root.table_model",
            "model.root.view_model",
            "model.root.view_summary",
        ]
    );
    assert_eq!(report.get("seed.root.seed").unwrap().status_text, "INSERT 2");
    assert_eq!(backend.relation_count().await, 5);
}

#[tokio::test]
async fn descendant_selection_runs_two_nodes() {
    let backend = MockBackend::new();
    let report = run(select("view_model+"), seed_project(), &backend).await.unwrap();

    let mut ids = report.completion_order();
    ids.sort();
    assert_eq!(ids, vec!["model.root.view_model", "model.root.view_summary"]);
    assert!(report.get("model.root.table_model").is_none());
    assert!(report.get("model.root.incremental").is_none());

    // Unselected parents are referenced, not built
    assert!(backend.statements_matching("create table public.seed").await.is_empty());
}

#[tokio::test]
async fn ancestor_selection_runs_two_nodes() {
    let backend = MockBackend::new();
    let report = run(select("+view_model"), seed_project(), &backend).await.unwrap();

    assert_eq!(report.completion_order(), vec!["seed.root.seed", "model.root.view_model"]);
    assert_eq!(report.results.len(), 2);
}

#[tokio::test]
async fn exclusion_applies_after_inclusion() {
    let backend = MockBackend::new();
    let config = RunConfig::default()
        .with_select(SelectionSpec::parse_list("seed+").unwrap())
        .with_exclude(SelectionSpec::parse_list("view_model").unwrap());
    let report = run(config, seed_project(), &backend).await.unwrap();

    assert_eq!(report.results.len(), 4);
    assert!(report.get("model.root.view_model").is_none());
    // Its descendant still runs, and still references it
    assert_eq!(report.get("model.root.view_summary").unwrap().status, RunStatus::Success);
}

#[tokio::test]
async fn failed_node_skips_descendants_and_keeps_siblings() {
    let backend = MockBackendBuilder::new()
        .with_failure("view public.view_model ", "column \"nme\" does not exist")
        .build();
    let report = run(RunConfig::default().with_threads(2), seed_project(), &backend)
        .await
        .unwrap();

    assert_eq!(report.results.len(), 5);
    assert!(!report.is_success());

    let failed = report.get("model.root.view_model").unwrap();
    assert_eq!(failed.status, RunStatus::Fail);
    assert!(failed.message.as_deref().unwrap().contains("does not exist"));

    let skipped = report.get("model.root.view_summary").unwrap();
    assert_eq!(skipped.status, RunStatus::Skipped);
    assert!(skipped.skip && !skipped.fail);
    assert!(backend.statements_matching("view_summary").await.is_empty());

    for sibling in ["model.root.table_model", "model.root.incremental", "seed.root.seed"] {
        assert_eq!(report.get(sibling).unwrap().status, RunStatus::Success, "{sibling}");
    }
    assert_eq!(report.summary.fail, 1);
    assert_eq!(report.summary.skipped, 1);
}

#[tokio::test]
async fn full_refresh_rebuilds_incremental() {
    let backend = MockBackend::new();

    run(select("incremental"), seed_project(), &backend).await.unwrap();
    assert_eq!(
        backend.statements_matching("public.incremental").await,
        vec!["create table public.incremental as (\nselect * from public.seed\n)"]
    );

    // Second run merges
    backend.clear_statements().await;
    run(select("incremental"), seed_project(), &backend).await.unwrap();
    let merge = backend.statements_matching("public.incremental").await;
    assert_eq!(merge.len(), 1);
    assert!(merge[0].starts_with("insert into public.incremental"));

    // Full refresh drops then rebuilds
    backend.clear_statements().await;
    let report = run(select("incremental").with_full_refresh(true), seed_project(), &backend)
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(
        backend.statements_matching("public.incremental").await,
        vec![
            "drop table if exists public.incremental cascade",
            "create table public.incremental as (\nselect * from public.seed\n)",
        ]
    );
}

#[tokio::test]
async fn ephemeral_chain_is_inlined_and_never_executed() {
    let manifest = Manifest::from_nodes(vec![
        model("a", r#"select * from {{ref("b")}}"#, &["model.root.b"]),
        model("b", r#"select * from {{ref("c")}}"#, &["model.root.c"])
            .with_materialization(Materialization::Ephemeral),
        model("c", "select * from source_table", &[]).with_materialization(Materialization::Ephemeral),
    ]);
    let backend = MockBackend::new();
    let report = run(RunConfig::default(), manifest, &backend).await.unwrap();

    assert_eq!(report.results.len(), 3);
    assert_eq!(report.get("model.root.b").unwrap().status_text, "EPHEMERAL");
    assert_eq!(report.get("model.root.c").unwrap().status_text, "EPHEMERAL");

    let created = backend.statements_matching("create").await;
    assert_eq!(
        created,
        vec![
            "create or replace view public.a as (\n\
             with __dbt__CTE__c as (select * from source_table), \
             __dbt__CTE__b as (select * from __dbt__CTE__c) \
             select * from __dbt__CTE__b\n)"
        ]
    );
}

#[tokio::test]
async fn compilation_failure_aborts_before_execution() {
    let manifest = Manifest::from_nodes(vec![
        model("ok", "select 1", &[]),
        model("bad", "select * from {{ ref('undeclared') }}", &[]),
    ]);
    let backend = MockBackend::new();

    let err = run(RunConfig::default(), manifest, &backend).await.unwrap_err();
    assert!(matches!(err, RunError::Compilation(_)));
    assert!(backend.statements().await.is_empty());
}

#[tokio::test]
async fn cycle_aborts_before_execution() {
    let manifest = Manifest::from_nodes(vec![
        model("a", "select 1", &["model.root.b"]),
        model("b", "select 1", &["model.root.a"]),
    ]);
    let backend = MockBackend::new();

    let err = run(RunConfig::default(), manifest, &backend).await.unwrap_err();
    assert!(matches!(err, RunError::Graph(GraphValidationError::Cycle { .. })));
    assert!(backend.statements().await.is_empty());
}

#[tokio::test]
async fn single_thread_runs_are_deterministic() {
    let mut orders = Vec::new();
    for _ in 0..3 {
        let backend = MockBackend::new().with_latency(1);
        let report = run(RunConfig::default().with_threads(1), seed_project(), &backend)
            .await
            .unwrap();
        orders.push(report.completion_order().join(","));
    }
    assert_eq!(orders[0], orders[1]);
    assert_eq!(orders[1], orders[2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn thread_count_bounds_concurrency() {
    let nodes: Vec<Node> = (0..10)
        .map(|i| model(&format!("m{i}"), "select 1", &[]))
        .collect();
    let backend = MockBackend::new().with_latency(10);

    let report = run(RunConfig::default().with_threads(2), Manifest::from_nodes(nodes), &backend)
        .await
        .unwrap();
    assert_eq!(report.results.len(), 10);
    assert!(backend.max_concurrency() <= 2);
}

#[tokio::test]
async fn relations_differing_in_case_share_cache_and_lock() {
    let manifest = Manifest::from_nodes(vec![
        model("orders", "select 1 as id", &[]),
        model("orders_upper", "select 1 as id", &[]).with_alias("ORDERS"),
    ]);
    let backend = MockBackend::new();

    let report = run(RunConfig::default().with_threads(2), manifest, &backend)
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(backend.relation_lookups(), 1);
    assert_eq!(backend.relation_count().await, 1);
}

#[tokio::test]
async fn test_nodes_follow_severity_and_warn_error() {
    let manifest = || {
        Manifest::from_nodes(vec![
            model("orders", "select 1 as id", &[]),
            Node::new(ResourceKind::Test, "root", "not_null_orders_id")
                .with_raw_text("select * from {{ ref('orders') }} where id is null")
                .with_depends_on(["model.root.orders"])
                .with_config(NodeConfig {
                    severity: TestSeverity::Warn,
                    ..NodeConfig::default()
                }),
        ])
    };
    let backend = MockBackendBuilder::new()
        .with_query_result("where id is null", 4)
        .build();

    let report = run(RunConfig::default(), manifest(), &backend).await.unwrap();
    let test = report.get("test.root.not_null_orders_id").unwrap();
    assert_eq!(test.status, RunStatus::Warn);
    assert_eq!(test.status_text, "4");
    assert!(report.is_success());

    let report = run(RunConfig::default().with_warn_error(true), manifest(), &backend)
        .await
        .unwrap();
    assert_eq!(report.get("test.root.not_null_orders_id").unwrap().status, RunStatus::Fail);
    assert!(!report.is_success());
}

#[tokio::test]
async fn run_vars_reach_templates() {
    let manifest = Manifest::from_nodes(vec![model(
        "filtered",
        "select * from events where day >= '{{ var('start_date', '2000-01-01') }}'",
        &[],
    )]);
    let mut vars = BTreeMap::new();
    vars.insert("start_date".to_string(), serde_json::json!("2024-06-01"));
    let backend = MockBackend::new();

    run(RunConfig::default().with_vars(vars), manifest, &backend).await.unwrap();
    assert_eq!(backend.statements_matching("2024-06-01").await.len(), 1);
}

#[tokio::test]
async fn prepare_compiles_only_the_selection() {
    let mut manifest = seed_project();
    let task = task(select("view_summary"));

    let selected = task.prepare(&mut manifest, JinjaRenderer::default()).unwrap();
    assert_eq!(selected.topological_order(), ["model.root.view_summary".to_string()]);
    assert_eq!(
        manifest.get("model.root.view_summary").unwrap().injected_text(),
        Some("select count(*) as n from public.view_model")
    );
    assert!(!manifest.get("model.root.view_model").unwrap().is_compiled());

    let backend: Arc<dyn Backend> = Arc::new(MockBackend::new());
    let report = task.execute(manifest, &selected, backend).await.unwrap();
    assert_eq!(report.results.len(), 1);
}
