//! AN-019: CLI subcommands: init, validate, synth, graph, plan, deploy, status.

use crate::backend::local::StateBackend;
use crate::backend::{ChangeAction, ChangeSet, ProvisioningBackend};
use crate::core::app::App;
use crate::core::builder::build_app;
use crate::core::deployer::{self, DeployConfig, StackOutcome};
use crate::core::resolver::StackGraph;
use crate::core::synth::{self, CloudAssembly};
use crate::core::{parser, state, types};
use crate::error::{Error, Result};
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new andamio project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate andamio.yaml and build the construct tree
    Validate {
        /// Path to andamio.yaml
        #[arg(short, long, default_value = "andamio.yaml")]
        file: PathBuf,
    },

    /// Synthesize stack templates and the assembly manifest
    Synth {
        /// Path to andamio.yaml
        #[arg(short, long, default_value = "andamio.yaml")]
        file: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = "andamio.out")]
        out: PathBuf,
    },

    /// Show the stack apply order and why each edge exists
    Graph {
        /// Path to andamio.yaml
        #[arg(short, long, default_value = "andamio.yaml")]
        file: PathBuf,
    },

    /// Show what a deploy would change, per stack
    Plan {
        /// Path to andamio.yaml
        #[arg(short, long, default_value = "andamio.yaml")]
        file: PathBuf,

        /// Target a single stack
        #[arg(short, long)]
        stack: Option<String>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Deploy stacks in apply order
    Deploy {
        /// Path to andamio.yaml
        #[arg(short, long, default_value = "andamio.yaml")]
        file: PathBuf,

        /// Target a single stack
        #[arg(short, long)]
        stack: Option<String>,

        /// Plan every stack without applying
        #[arg(long)]
        dry_run: bool,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// Show deployed state from lock files
    Status {
        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Target a single stack
        #[arg(short, long)]
        stack: Option<String>,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Synth { file, out } => cmd_synth(&file, &out),
        Commands::Graph { file } => cmd_graph(&file),
        Commands::Plan {
            file,
            stack,
            state_dir,
        } => cmd_plan(&file, &state_dir, stack.as_deref()),
        Commands::Deploy {
            file,
            stack,
            dry_run,
            state_dir,
        } => cmd_deploy(&file, &state_dir, stack.as_deref(), dry_run),
        Commands::Status { state_dir, stack } => cmd_status(&state_dir, stack.as_deref()),
    }
}

const INIT_TEMPLATE: &str = r#"version: "1.0"
name: my-cluster
description: "Managed by andamio"

params:
  cidr: 192.168.0.0/16

env:
  region: us-east-1

stacks:
  NetworkStack:
    constructs:
      Network:
        type: network
        name: EksVpc
        cidr: "{{params.cidr}}"

  EksStack:
    constructs:
      Cluster:
        type: eks_cluster
        network: NetworkStack/Network
        cluster_name: my-cluster
        variant: managed

  ChartStack:
    constructs:
      WebApp:
        type: web_app_chart
        cluster: EksStack/Cluster

policy:
  failure: stop_on_first
  event_log: true
  lock_file: true
"#;

fn cmd_init(path: &Path) -> Result<()> {
    let config_path = path.join("andamio.yaml");
    if config_path.exists() {
        return Err(Error::config(format!("{} already exists", config_path.display())));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| Error::io("cannot create", &state_dir, e))?;
    std::fs::write(&config_path, INIT_TEMPLATE).map_err(|e| Error::io("cannot write", &config_path, e))?;

    println!("Initialized andamio project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

/// Parse, validate and build; validation errors go to stderr.
fn load_app(file: &Path) -> Result<(types::AppConfig, App)> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        return Err(Error::config(format!("{} validation error(s)", errors.len())));
    }
    let base_dir = file.parent().unwrap_or_else(|| Path::new("."));
    let app = build_app(&config, base_dir)?;
    Ok((config, app))
}

fn cmd_validate(file: &Path) -> Result<()> {
    let (config, app) = load_app(file)?;
    let assembly = synth::synthesize(&app)?;
    let resources: usize = assembly.artifacts.iter().map(|a| a.resources.len()).sum();
    println!(
        "OK: {} ({} stacks, {} resources)",
        config.name,
        assembly.artifacts.len(),
        resources
    );
    Ok(())
}

fn cmd_synth(file: &Path, out: &Path) -> Result<()> {
    let (_, app) = load_app(file)?;
    let assembly = synth::synthesize(&app)?;
    let manifest = assembly.write_to(out)?;

    println!("Synthesized {} to {}", manifest.app, out.display());
    for stack in &manifest.apply_order {
        if let Some(entry) = manifest.stacks.get(stack) {
            println!("  {} ({} resources) {}", entry.template, entry.resources, entry.hash);
        }
    }
    Ok(())
}

fn cmd_graph(file: &Path) -> Result<()> {
    let (_, app) = load_app(file)?;
    let graph = StackGraph::build(&app)?;
    let order = graph.apply_order()?;

    println!("Apply order:");
    for (i, stack) in order.iter().enumerate() {
        println!("  {}. {}", i + 1, stack);
    }
    println!();
    println!("Edges ({}):", graph.edge_count());
    for (dependent, dependency, reason) in graph.edges() {
        println!("  {} -> {} ({})", dependent, dependency, reason);
    }
    Ok(())
}

/// Synthesize and narrow to the filtered stack.
fn assemble(file: &Path, stack_filter: Option<&str>) -> Result<(types::AppConfig, CloudAssembly)> {
    let (config, app) = load_app(file)?;
    let assembly = synth::synthesize(&app)?;
    if let Some(stack) = stack_filter {
        if assembly.artifact(stack).is_none() {
            return Err(Error::config(format!("unknown stack '{}'", stack)));
        }
    }
    Ok((config, assembly))
}

fn cmd_plan(file: &Path, state_dir: &Path, stack_filter: Option<&str>) -> Result<()> {
    let (config, assembly) = assemble(file, stack_filter)?;
    let backend = StateBackend::new(state_dir);

    println!("Planning: {} ({} stacks)", config.name, assembly.artifacts.len());
    let (mut create, mut update, mut delete, mut unchanged) = (0, 0, 0, 0);
    for artifact in &assembly.artifacts {
        if stack_filter.is_some_and(|s| s != artifact.stack_id) {
            continue;
        }
        let changes = backend.plan(artifact)?;
        print_changes(&changes);
        create += changes.to_create;
        update += changes.to_update;
        delete += changes.to_delete;
        unchanged += changes.unchanged;
    }

    println!();
    println!(
        "Plan: {} to add, {} to change, {} to delete, {} unchanged.",
        create, update, delete, unchanged
    );
    Ok(())
}

fn print_changes(changes: &ChangeSet) {
    println!();
    println!("{}:", changes.stack);
    for change in &changes.changes {
        let symbol = match change.action {
            ChangeAction::Create => "+",
            ChangeAction::Update => "~",
            ChangeAction::Delete => "-",
            ChangeAction::NoOp => " ",
        };
        println!("  {} {}", symbol, change.describe());
    }
}

fn cmd_deploy(file: &Path, state_dir: &Path, stack_filter: Option<&str>, dry_run: bool) -> Result<()> {
    let (config, assembly) = assemble(file, stack_filter)?;
    let mut backend = StateBackend::new(state_dir);
    if !config.policy.lock_file {
        backend = backend.without_lock();
    }

    let cfg = DeployConfig {
        assembly: &assembly,
        policy: &config.policy,
        state_dir,
        dry_run,
        stack_filter,
    };
    let report = deployer::deploy(&cfg, &backend)?;

    for result in &report.stacks {
        match &result.outcome {
            StackOutcome::Applied(r) => println!(
                "{}: {} created, {} updated, {} deleted, {} unchanged ({:.1}s)",
                result.stack,
                r.created,
                r.updated,
                r.deleted,
                r.unchanged,
                result.duration.as_secs_f64()
            ),
            StackOutcome::Planned(changes) => print_changes(changes),
            StackOutcome::Failed(e) => println!("{}: FAILED: {}", result.stack, e),
            StackOutcome::Skipped(reason) => println!("{}: skipped ({})", result.stack, reason),
        }
    }

    println!();
    if dry_run {
        println!("Dry run: no changes applied.");
        return Ok(());
    }
    if !report.success() {
        println!(
            "Deploy completed with errors: {} applied, {} FAILED, {} skipped",
            report.applied(),
            report.failed(),
            report.skipped()
        );
        return Err(Error::backend(format!("{} stack(s) failed", report.failed())));
    }
    println!("Deploy complete: {} stack(s) applied.", report.applied());
    Ok(())
}

fn cmd_status(state_dir: &Path, stack_filter: Option<&str>) -> Result<()> {
    let entries = std::fs::read_dir(state_dir).map_err(|e| Error::io("cannot read state dir", state_dir, e))?;

    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| stack_filter.is_none_or(|f| f == name))
        .collect();
    names.sort();

    let mut found = false;
    for name in &names {
        if let Some(lock) = state::load_lock(state_dir, name)? {
            found = true;
            println!("Stack: {}", lock.stack);
            println!("  Generated: {}", lock.generated_at);
            println!("  Generator: {}", lock.generator);
            println!("  Template:  {}", lock.template_hash);
            println!("  Resources: {}", lock.resources.len());
            for (id, rl) in &lock.resources {
                let applied = rl
                    .applied_at
                    .as_deref()
                    .map(|t| format!(" applied {}", t))
                    .unwrap_or_default();
                println!("    {}: [{}]{}", id, rl.resource_type, applied);
            }
        }
    }

    if !found {
        println!("No state found in {}", state_dir.display());
    }
    Ok(())
}
