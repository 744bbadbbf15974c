//! SD-017: CLI subcommands (init, validate, plan, deploy).

use crate::config::{self, ToolConfig};
use crate::core::error::DeployError;
use crate::core::executor::Executor;
use crate::core::types::{Deployment, ExecutionReport, Plan, TargetStatus};
use crate::core::{parser, planner, resolver};
use crate::transport::dry_run::DryRunConnector;
use crate::transport::{Connector, ExecuteContext};
use clap::Subcommand;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Config file picked up next to the manifest when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "sqldeploy.toml";

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter manifest and tool config
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate a manifest without connecting to any instance
    Validate {
        /// Path to the deployment manifest
        manifest: PathBuf,
    },

    /// Compile a manifest and show the steps each target would run
    Plan {
        /// Path to the deployment manifest
        manifest: PathBuf,

        /// Targets to plan (default: all), plus their dependencies
        targets: Vec<String>,

        /// Parameter value as name=value (repeatable)
        #[arg(short = 'a', long = "argument", value_name = "NAME=VALUE")]
        arguments: Vec<String>,

        /// Resolve relative file references against this directory
        #[arg(long)]
        base_path: Option<PathBuf>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compile a manifest and execute it against the configured instances
    Deploy {
        /// Path to the deployment manifest
        manifest: PathBuf,

        /// Targets to deploy (default: all), plus their dependencies
        targets: Vec<String>,

        /// Parameter value as name=value (repeatable)
        #[arg(short = 'a', long = "argument", value_name = "NAME=VALUE")]
        arguments: Vec<String>,

        /// Tool config (default: sqldeploy.toml beside the manifest, if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Resolve relative file references against this directory
        #[arg(long)]
        base_path: Option<PathBuf>,

        /// Maximum targets running at once (overrides config)
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Log the T-SQL that would run instead of connecting
        #[arg(long)]
        dry_run: bool,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { manifest } => cmd_validate(&manifest),
        Commands::Plan {
            manifest,
            targets,
            arguments,
            base_path,
            json,
        } => cmd_plan(&manifest, &targets, &arguments, base_path.as_deref(), json),
        Commands::Deploy {
            manifest,
            targets,
            arguments,
            config,
            base_path,
            max_parallel,
            dry_run,
        } => cmd_deploy(&DeployOptions {
            manifest,
            targets,
            arguments,
            config,
            base_path,
            max_parallel,
            dry_run,
        }),
    }
}

/// Split a `name=value` argument. The value may itself contain `=`.
pub fn parse_argument(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("argument '{}' must be NAME=VALUE", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("argument '{}' has an empty name", raw));
    }
    Ok((name.to_string(), value.to_string()))
}

/// Parse every `-a` argument; a repeated name keeps the last value.
pub fn parse_arguments(raw: &[String]) -> Result<HashMap<String, String>, String> {
    raw.iter().map(|a| parse_argument(a)).collect()
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let manifest_path = path.join("deploy.yaml");
    let config_path = path.join(DEFAULT_CONFIG_FILE);
    for existing in [&manifest_path, &config_path] {
        if existing.exists() {
            return Err(format!("{} already exists", existing.display()));
        }
    }

    let manifest = r#"name: my-deployment
description: "Managed by sqldeploy"

parameters:
  server:
    default: localhost
  appPassword:
    description: password for the application login

targets:
  database:
    instances:
      - name: "{{ params.server }}"
        operations:
          - type: database
            name: App
            recovery_model: simple
  logins:
    depends_on: [database]
    instances:
      - name: "{{ params.server }}"
        operations:
          - type: login
            name: app
            password: "{{ params.appPassword }}"
            default_database: App
"#;
    let tool_config = r#"[execution]
max_parallel = 4

[sqlcmd]
program = "sqlcmd"
login_timeout = 15

# [instances.localhost]
# server = "localhost,1433"
# user = "sa"
# password_env = "SQLDEPLOY_SA_PASSWORD"
# trust_server_certificate = true
"#;
    std::fs::create_dir_all(path)
        .map_err(|e| format!("cannot create {}: {}", path.display(), e))?;
    std::fs::write(&manifest_path, manifest)
        .map_err(|e| format!("cannot write {}: {}", manifest_path.display(), e))?;
    std::fs::write(&config_path, tool_config)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized sqldeploy project at {}", path.display());
    println!("  Created: {}", manifest_path.display());
    println!("  Created: {}", config_path.display());
    Ok(())
}

fn cmd_validate(manifest: &Path) -> Result<(), String> {
    let deployment = parser::load_deployment_file(manifest)?;
    let errors = parser::validate_deployment(&deployment);

    for target in parser::empty_targets(&deployment) {
        eprintln!("  WARNING: target '{}' has no operations", target);
    }
    for (target, param) in parser::undeclared_references(&deployment) {
        eprintln!(
            "  WARNING: target '{}' references undeclared parameter '{}'",
            target, param
        );
    }

    if errors.is_empty() {
        println!(
            "OK: {} ({} parameters, {} targets)",
            display_name(&deployment),
            deployment.parameters.len(),
            deployment.targets.len()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

/// Load and validate a manifest, returning errors if invalid.
fn load_and_validate(manifest: &Path) -> Result<Deployment, String> {
    let deployment = parser::load_deployment_file(manifest)?;
    let errors = parser::validate_deployment(&deployment);
    if errors.is_empty() {
        return Ok(deployment);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err("validation failed".to_string())
}

fn display_name(deployment: &Deployment) -> &str {
    if deployment.name.is_empty() {
        "(unnamed)"
    } else {
        &deployment.name
    }
}

/// Compile a manifest file with `name=value` arguments.
fn compile_manifest(
    manifest: &Path,
    arguments: &[String],
    base_path: Option<&Path>,
) -> Result<(Deployment, Plan), String> {
    let deployment = load_and_validate(manifest)?;
    let args = parse_arguments(arguments)?;
    let plan = planner::compile(&deployment, &args, base_path).map_err(|e| e.to_string())?;
    Ok((deployment, plan))
}

fn cmd_plan(
    manifest: &Path,
    targets: &[String],
    arguments: &[String],
    base_path: Option<&Path>,
    json: bool,
) -> Result<(), String> {
    let (deployment, plan) = compile_manifest(manifest, arguments, base_path)?;
    let selected = resolver::select_targets(&plan, targets).map_err(|e| e.to_string())?;
    let order = resolver::build_execution_order(&plan, &selected).map_err(|e| e.to_string())?;
    let fingerprint = planner::fingerprint(&plan);

    if json {
        let targets: serde_json::Map<String, serde_json::Value> = order
            .iter()
            .filter_map(|name| {
                let target = plan.get(name)?;
                serde_json::to_value(target).ok().map(|v| (name.clone(), v))
            })
            .collect();
        let doc = serde_json::json!({
            "name": deployment.name,
            "fingerprint": fingerprint,
            "order": order,
            "targets": targets,
        });
        let text = serde_json::to_string_pretty(&doc).map_err(|e| format!("JSON error: {}", e))?;
        println!("{}", text);
        return Ok(());
    }

    let steps: usize = order
        .iter()
        .filter_map(|n| plan.get(n))
        .map(|t| t.steps.len())
        .sum();
    println!(
        "Planning: {} ({} targets, {} steps)",
        display_name(&deployment),
        order.len(),
        steps
    );
    println!();
    for line in planner::describe_plan(&plan, &order) {
        println!("{}", line);
    }
    println!();
    println!("Fingerprint: {}", fingerprint);
    Ok(())
}

/// Everything `deploy` needs, gathered from the command line.
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub manifest: PathBuf,
    pub targets: Vec<String>,
    pub arguments: Vec<String>,
    pub config: Option<PathBuf>,
    pub base_path: Option<PathBuf>,
    pub max_parallel: Option<usize>,
    pub dry_run: bool,
}

/// Explicit `--config`, else `sqldeploy.toml` beside the manifest, else defaults.
fn resolve_tool_config(opts: &DeployOptions) -> Result<ToolConfig, String> {
    if let Some(ref path) = opts.config {
        return config::load_config(path);
    }
    let beside = opts
        .manifest
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(DEFAULT_CONFIG_FILE);
    if beside.is_file() {
        tracing::debug!(config = %beside.display(), "using tool config beside manifest");
        return config::load_config(&beside);
    }
    Ok(ToolConfig::default())
}

fn cmd_deploy(opts: &DeployOptions) -> Result<(), String> {
    let (deployment, plan) =
        compile_manifest(&opts.manifest, &opts.arguments, opts.base_path.as_deref())?;
    let tool_config = resolve_tool_config(opts)?;
    let max_parallel = opts
        .max_parallel
        .unwrap_or(tool_config.execution.max_parallel);
    if max_parallel == 0 {
        return Err("--max-parallel must be at least 1".to_string());
    }

    let connector: Arc<dyn Connector> = if opts.dry_run {
        Arc::new(DryRunConnector::new())
    } else {
        Arc::new(tool_config.sqlcmd_connector(|var| std::env::var(var).ok())?)
    };

    println!(
        "Deploying: {} ({} targets{})",
        display_name(&deployment),
        plan.len(),
        if opts.dry_run { ", dry run" } else { "" }
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("cannot start async runtime: {}", e))?;

    let result = runtime.block_on(async {
        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; cancelling deployment");
                on_interrupt.cancel();
            }
        });
        let executor =
            Executor::new(&plan, ExecuteContext::new(connector)).with_max_parallel(max_parallel);
        let result = executor.execute(&opts.targets, &cancel).await;
        watcher.abort();
        result
    });

    match result {
        Ok(report) => {
            print_report(&report);
            println!();
            println!(
                "Deploy complete: {} target(s) in {:.1}s.",
                report.completed().len(),
                report.duration.as_secs_f64()
            );
            Ok(())
        }
        Err(DeployError::Execution(err)) => {
            print_report(&err.report);
            println!();
            Err(err.to_string())
        }
        Err(DeployError::Compile(err)) => Err(err.to_string()),
    }
}

/// Display per-target outcomes to stdout.
fn print_report(report: &ExecutionReport) {
    for (name, status) in &report.statuses {
        match status {
            TargetStatus::Failed { error } => {
                println!("  {}: {} ({})", name, status, error.source);
                println!("    at [{}] {}", error.instance, error.step);
            }
            TargetStatus::Skipped { reason } => println!("  {}: {} ({})", name, status, reason),
            _ => println!("  {}: {}", name, status),
        }
    }
}
