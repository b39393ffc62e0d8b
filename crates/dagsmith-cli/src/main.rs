use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dagsmith_adapter::MockBackend;
use dagsmith_core::{Node, ProjectConfig, ResourceKind, RunReport, RunResult, RunStatus};
use dagsmith_graph::{Manifest, SelectionSpec};
use dagsmith_jinja::{JinjaRenderer, MacroRegistry};
use dagsmith_runner::{LoggingObserver, RunConfig, RunObserver, RunStart, RunTask};

/// dagsmith - compile and run a DAG of SQL models
#[derive(Parser)]
#[command(name = "dagsmith")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: dagsmith.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to manifest.json (default: <target_path>/manifest.json)
    #[arg(short = 'f', long, global = true)]
    manifest: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Node selection flags shared by every command
#[derive(Args, Debug, Default)]
struct Selection {
    /// Nodes to include (e.g. `orders+`, `+tag:nightly`, `@customers`)
    #[arg(short, long, num_args = 1..)]
    select: Vec<String>,

    /// Nodes to remove from the selection
    #[arg(long, num_args = 1..)]
    exclude: Vec<String>,
}

impl Selection {
    fn include(&self) -> Result<Vec<SelectionSpec>> {
        Ok(SelectionSpec::parse_list(&self.select.join(" "))?)
    }

    fn exclude(&self) -> Result<Vec<SelectionSpec>> {
        Ok(SelectionSpec::parse_list(&self.exclude.join(" "))?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compile selected nodes and write their SQL to <target>/compiled
    Compile {
        #[command(flatten)]
        selection: Selection,

        /// Variable overrides as a JSON object
        #[arg(long)]
        vars: Option<String>,
    },

    /// Compile and execute selected nodes (against the in-memory backend)
    Run {
        #[command(flatten)]
        selection: Selection,

        /// Number of nodes to execute concurrently
        #[arg(short, long)]
        threads: Option<usize>,

        /// Drop and rebuild incremental models, tables and seeds
        #[arg(long)]
        full_refresh: bool,

        /// Variable overrides as a JSON object
        #[arg(long)]
        vars: Option<String>,

        /// Treat test warnings as failures
        #[arg(long)]
        warn_error: bool,

        /// Output file for run_results.json (default: <target>/run_results.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List selected nodes in execution order
    Ls {
        #[command(flatten)]
        selection: Selection,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Load config if specified
    let config = if let Some(config_path) = &cli.config {
        ProjectConfig::from_file(config_path)?
    } else if Path::new("dagsmith.toml").exists() {
        ProjectConfig::from_file(Path::new("dagsmith.toml"))?
    } else {
        if cli.verbose {
            eprintln!("{}", "No config file found, using defaults".yellow());
        }
        ProjectConfig::default()
    };

    let manifest_path = cli
        .manifest
        .clone()
        .unwrap_or_else(|| config.target_dir().join("manifest.json"));
    tracing::debug!(project = %config.name, manifest = %manifest_path.display(), "resolved project");

    match cli.command {
        Commands::Compile { selection, vars } => {
            compile_command(config, &manifest_path, &selection, vars.as_deref(), cli.verbose)
        }
        Commands::Run {
            selection,
            threads,
            full_refresh,
            vars,
            warn_error,
            output,
        } => {
            let mut run_config = RunConfig::from_project(&config)
                .with_select(selection.include()?)
                .with_exclude(selection.exclude()?)
                .with_full_refresh(full_refresh)
                .with_vars(parse_vars(vars.as_deref())?);
            if let Some(threads) = threads {
                run_config = run_config.with_threads(threads);
            }
            if warn_error {
                run_config = run_config.with_warn_error(true);
            }
            run_command(config, &manifest_path, run_config, output, cli.verbose).await
        }
        Commands::Ls { selection } => ls_command(config, &manifest_path, &selection),
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_manifest(path: &Path, verbose: bool) -> Result<Manifest> {
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "Manifest not found at {}. Pass --manifest or set target_path in dagsmith.toml.",
            path.display()
        ));
    }
    if verbose {
        eprintln!("{} {}", "Loading manifest from:".cyan(), path.display());
    }
    Manifest::from_file(path).map_err(|e| anyhow::anyhow!("Failed to load manifest: {}", e))
}

/// Parse `--vars` as a JSON object
fn parse_vars(raw: Option<&str>) -> Result<BTreeMap<String, serde_json::Value>> {
    match raw {
        None => Ok(BTreeMap::new()),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("--vars must be a JSON object: {}", e)),
    }
}

fn renderer_for(config: &ProjectConfig, manifest: &Manifest) -> JinjaRenderer {
    let root = manifest
        .project_name()
        .map(str::to_string)
        .unwrap_or_else(|| config.name.clone());
    JinjaRenderer::new(MacroRegistry::from_manifest(manifest).with_root_package(root))
}

/// Compile command - render and inline, then write SQL files
fn compile_command(
    config: ProjectConfig,
    manifest_path: &Path,
    selection: &Selection,
    vars: Option<&str>,
    verbose: bool,
) -> Result<()> {
    let mut manifest = load_manifest(manifest_path, verbose)?;
    let renderer = renderer_for(&config, &manifest);
    let target_dir = config.target_dir();

    let run_config = RunConfig::from_project(&config)
        .with_select(selection.include()?)
        .with_exclude(selection.exclude()?)
        .with_vars(parse_vars(vars)?);
    let task = RunTask::new(config, run_config);

    let selected = task.prepare(&mut manifest, renderer)?;

    let mut written = 0;
    for id in selected.topological_order() {
        let Some(node) = manifest.get(id) else {
            continue;
        };
        if let Some(path) = write_compiled(&target_dir, node)? {
            written += 1;
            if verbose {
                eprintln!("  {} {}", "wrote".green(), path.display());
            }
        }
    }

    println!(
        "{} {} nodes, wrote {} files to {}",
        "Compiled".green().bold(),
        selected.len(),
        written,
        target_dir.join("compiled").display()
    );
    Ok(())
}

/// Write a node's injected SQL to `<target>/compiled/<package>/<path>`
///
/// Seeds, ephemeral nodes and uncompiled nodes are skipped.
fn write_compiled(target_dir: &Path, node: &Node) -> Result<Option<PathBuf>> {
    if node.resource_type == ResourceKind::Seed || node.is_ephemeral() {
        return Ok(None);
    }
    let Some(sql) = node.injected_text() else {
        return Ok(None);
    };

    let relative = if node.original_file_path.is_empty() {
        PathBuf::from(&node.path)
    } else {
        PathBuf::from(&node.original_file_path)
    };
    let path = target_dir.join("compiled").join(&node.package_name).join(relative);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, sql)?;
    Ok(Some(path))
}

/// Run command - compile, execute, report
async fn run_command(
    config: ProjectConfig,
    manifest_path: &Path,
    run_config: RunConfig,
    output: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let manifest = load_manifest(manifest_path, verbose)?;
    let renderer = renderer_for(&config, &manifest);
    let output = output.unwrap_or_else(|| config.target_dir().join("run_results.json"));

    if config.target.target_type != "mock" {
        eprintln!(
            "{} target type '{}' has no adapter here; statements run against the in-memory backend",
            "Note:".yellow(),
            config.target.target_type
        );
    }

    let task = RunTask::new(config, run_config).with_observer(Arc::new(ConsoleObserver::default()));
    let backend = Arc::new(MockBackend::new());
    let report = task.run(manifest, renderer, backend).await?;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    report.save_to_file(&output)?;
    if verbose {
        eprintln!("{} {}", "Run results saved to:".green(), output.display());
    }

    print_run_summary(&report);

    // Exit with error code if any node failed
    if !report.is_success() {
        std::process::exit(1);
    }

    Ok(())
}

/// Ls command - list the selection in execution order
fn ls_command(config: ProjectConfig, manifest_path: &Path, selection: &Selection) -> Result<()> {
    let manifest = load_manifest(manifest_path, false)?;
    let run_config = RunConfig::from_project(&config)
        .with_select(selection.include()?)
        .with_exclude(selection.exclude()?);
    let selected = RunTask::new(config, run_config).select(&manifest)?;

    for id in selected.topological_order() {
        let Some(node) = manifest.get(id) else {
            continue;
        };
        let kind = node
            .materialization()
            .map(|m| m.to_string())
            .unwrap_or_else(|| node.resource_type.to_string());
        println!("{:<12} {}", kind.dimmed(), id);
    }
    Ok(())
}

/// Prints one line per finished node
#[derive(Default)]
struct ConsoleObserver {
    total: AtomicUsize,
    done: AtomicUsize,
}

impl RunObserver for ConsoleObserver {
    fn on_run_start(&self, start: &RunStart) {
        self.total.store(start.nodes, Ordering::SeqCst);
        LoggingObserver.on_run_start(start);
        println!(
            "Running {} nodes with {} threads\n",
            start.nodes.to_string().bold(),
            start.threads
        );
    }

    fn on_node_complete(&self, result: &RunResult) {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.total.load(Ordering::SeqCst);
        LoggingObserver.on_node_complete(result);
        println!(
            "{:>3} of {} {} {} [{} in {:.2}s]",
            done,
            total,
            status_label(result.status),
            result.unique_id,
            result.status_text,
            result.execution_time
        );
    }

    fn on_run_end(&self, report: &RunReport) {
        LoggingObserver.on_run_end(report);
    }
}

fn status_label(status: RunStatus) -> colored::ColoredString {
    match status {
        RunStatus::Success => "OK   ".green(),
        RunStatus::Warn => "WARN ".yellow(),
        RunStatus::Fail => "FAIL ".red().bold(),
        RunStatus::Error => "ERROR".red().bold(),
        RunStatus::Skipped => "SKIP ".dimmed(),
    }
}

/// Print run summary to stdout
fn print_run_summary(report: &RunReport) {
    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Run Summary".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    println!("Version: {}", report.version);
    println!("Timestamp: {}", report.timestamp);
    println!("Elapsed: {:.2}s", report.elapsed_time);
    println!();

    let summary = &report.summary;
    println!("{}", "Summary:".bold());
    println!("  Total:   {}", summary.total);
    println!("  Success: {}", summary.success.to_string().green());
    if summary.warn > 0 {
        println!("  Warn:    {}", summary.warn.to_string().yellow());
    } else {
        println!("  Warn:    {}", summary.warn);
    }
    if summary.fail + summary.error > 0 {
        println!("  Fail:    {}", summary.fail.to_string().red().bold());
        println!("  Error:   {}", summary.error.to_string().red().bold());
    } else {
        println!("  Fail:    {}", summary.fail.to_string().green());
        println!("  Error:   {}", summary.error.to_string().green());
    }
    println!("  Skipped: {}", summary.skipped);
    println!();

    let problems: Vec<&RunResult> = report
        .results
        .iter()
        .filter(|r| r.fail || r.warn)
        .collect();

    if problems.is_empty() {
        println!("{}", "✓ Completed successfully".green().bold());
    } else {
        println!("{}", "Details:".bold());
        for result in problems {
            println!(
                "  [{}] {}: {}",
                status_label(result.status),
                result.unique_id,
                result.message.as_deref().unwrap_or(&result.status_text)
            );
        }
    }

    println!();
    println!("{}", "=".repeat(60).bright_blue());
}
