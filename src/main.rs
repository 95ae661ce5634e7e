//! RiskFlow CLI Entry Point
//!
//! Provides command-line interface for workflow execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow with an input file
//! riskflow beam_design.yaml --input load_case.json
//!
//! # Dry run mode (preview levels and critical path)
//! riskflow beam_design.yaml --dry-run
//!
//! # Deterministic debugging: one step at a time
//! riskflow beam_design.yaml --input load_case.json --sequential
//!
//! # Set maximum parallel steps and keep execution records
//! riskflow beam_design.yaml --parallel 8 --records ./records
//! ```
//!
//! Exit code: 0 completed, 2 awaiting approval, 1 failed.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use riskflow::execution::{builtin_registry, ContextMetadata, Engine};
use riskflow::monitoring::{EventKind, StreamEvent};
use riskflow::workflow::DependencyGraph;
use riskflow::{
    load_definition, load_input, EngineConfig, ExecutionResult, ExecutionStatus,
    WorkflowDefinition, APP_NAME, VERSION,
};

/// Exit code for results waiting on a human approver.
const EXIT_AWAITING_APPROVAL: u8 = 2;

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    workflow_path: Option<String>,
    input_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
    dry_run: bool,
    sequential: bool,
    max_parallel: Option<usize>,
    record_dir: Option<PathBuf>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Workflow Execution Engine with Risk Routing");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: riskflow [OPTIONS] <WORKFLOW_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKFLOW_FILE>     Path to workflow YAML file");
    println!();
    println!("Options:");
    println!("  --input FILE        Workflow input (JSON or YAML, default: {{}})");
    println!("  --config FILE       Engine configuration YAML");
    println!("  --dry-run           Print the execution plan without running steps");
    println!("  --sequential        Run each level one step at a time");
    println!("  --parallel N        Maximum parallel steps per level");
    println!("  --records DIR       Write execution records to DIR");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Exit codes: 0 completed, 2 awaiting approval, 1 failed");
    println!();
    println!("Examples:");
    println!("  riskflow beam_design.yaml --input load_case.json");
    println!("  riskflow beam_design.yaml --dry-run");
    println!("  riskflow beam_design.yaml --parallel 8 --records ./records");
}

/// Reads the value following an option.
fn option_value<'a>(args: &'a [String], i: &mut usize, option: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", option))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => {
                config.dry_run = true;
            }
            "--sequential" => {
                config.sequential = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--input" => {
                config.input_path = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--config" => {
                config.config_path = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--records" => {
                config.record_dir = Some(PathBuf::from(option_value(args, &mut i, arg)?));
            }
            "--parallel" => {
                let value = option_value(args, &mut i, arg)?;
                let parallel: usize = value
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", value))?;
                if parallel == 0 {
                    return Err("--parallel must be at least 1".to_string());
                }
                config.max_parallel = Some(parallel);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.workflow_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.workflow_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    if config.workflow_path.is_none() {
        return Err("a workflow file is required".to_string());
    }
    Ok(config)
}

/// Loads the engine configuration and applies command-line overrides.
fn engine_config(cli: &Config) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = EngineConfig::load(cli.config_path.as_deref())?;
    if let Some(parallel) = cli.max_parallel {
        config.max_parallel = parallel;
    }
    if cli.sequential {
        config.sequential = true;
    }
    if let Some(dir) = &cli.record_dir {
        config.record_dir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

/// Prints levels, critical path and estimated speedup.
fn print_plan(definition: &WorkflowDefinition, graph: &DependencyGraph) {
    println!("[DRY RUN] Workflow: {} v{}", definition.label(), definition.version);
    println!();
    for (index, level) in graph.levels().iter().enumerate() {
        println!("  Level {}:", index);
        for &number in level {
            if let Some(step) = definition.get_step(number) {
                let condition = step
                    .condition
                    .as_deref()
                    .map(|c| format!(" if {}", c))
                    .unwrap_or_default();
                println!(
                    "    [{}] {} -> {} ({}){}",
                    number, step.name, step.output_variable, step.function, condition
                );
            }
        }
    }
    println!();
    println!("  Critical path: {:?}", graph.critical_path());
    println!("  Estimated speedup: {:.2}x", graph.estimated_speedup());
    println!("  Functions: {}", definition.functions().join(", "));
    println!();
}

/// Prints one live event.
fn print_event(event: &StreamEvent) {
    let step = event
        .step_number
        .map(|n| format!(" step {}", n))
        .unwrap_or_default();
    let data = &event.data;
    let field = |key: &str| data.get(key).and_then(Value::as_str).unwrap_or("").to_string();

    let line = match event.event_kind {
        EventKind::ExecutionStarted => format!(
            "execution started: {} ({} steps)",
            field("workflow_id"),
            data.get("total_steps").cloned().unwrap_or(Value::Null)
        ),
        EventKind::StepStarted => format!("{} '{}' started", step.trim(), field("name")),
        EventKind::StepCompleted => {
            format!("{} '{}' {}", step.trim(), field("name"), field("status"))
        }
        EventKind::StepFailed => format!(
            "{} '{}' failed: {}",
            step.trim(),
            field("name"),
            field("error")
        ),
        EventKind::ProgressUpdate => format!("progress {}%", event.percent().unwrap_or(0)),
        EventKind::ExecutionCompleted => format!("execution {}", field("status")),
        EventKind::ExecutionFailed => format!("execution failed: {}", field("root_cause")),
    };
    println!("  {} {}", event.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(), line);
}

/// Prints the final status, routing decision and step summary.
fn print_summary(result: &ExecutionResult) {
    let status = match result.status {
        ExecutionStatus::Completed => result.status.as_str().green().bold(),
        ExecutionStatus::AwaitingApproval => result.status.as_str().yellow().bold(),
        _ => result.status.as_str().red().bold(),
    };

    println!();
    println!("Execution {}: {}", result.execution_id, status);
    if let Some(cause) = &result.root_cause {
        println!("Root cause: {}", cause);
    }
    for violation in &result.violations {
        println!("  - {}", violation);
    }
    if let Some(step) = result.furthest_completed_step {
        println!("Furthest completed step: {}", step);
    }

    if let Some(assessment) = &result.assessment {
        println!(
            "Risk: {:.4} ({}), rules {:.4}",
            assessment.aggregate, assessment.level, assessment.rule_score
        );
    }
    if let Some(decision) = &result.decision {
        println!("Routing: {}", decision.action.as_str().bold());
        if let Some(priority) = decision.priority {
            println!("  Priority: {}", priority);
        }
        if let Some(tier) = decision.min_approver {
            println!("  Minimum approver: {}", tier);
        }
        if let Some(expires) = decision.expires_at {
            println!("  Expires: {}", expires.to_rfc3339());
        }
        for reason in &decision.reasons {
            println!("  - {}", reason);
        }
    }

    println!();
    println!("Steps:");
    for step in &result.steps {
        let retries = if step.retries() > 0 {
            format!(", {} retries", step.retries())
        } else {
            String::new()
        };
        println!(
            "  [{}] {:<20} {}{} ({} ms)",
            step.step_number, step.name, step.status, retries, step.duration_ms
        );
    }
    println!("Total execution time: {} ms", result.duration_ms);
}

fn exit_code(status: ExecutionStatus) -> ExitCode {
    match status {
        ExecutionStatus::Completed => ExitCode::SUCCESS,
        ExecutionStatus::AwaitingApproval => ExitCode::from(EXIT_AWAITING_APPROVAL),
        _ => ExitCode::FAILURE,
    }
}

/// Main application entry point.
async fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let cli = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    // Setup logging
    setup_logging(cli.verbose);

    // Print banner
    print_banner();

    let config = engine_config(&cli)?;
    let workflow_path = cli.workflow_path.clone().unwrap_or_default();

    // Load workflow
    info!("Loading workflow: {}", workflow_path);
    let definition = Arc::new(load_definition(&workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!("Could not load workflow from '{}': {}", workflow_path, e)
    })?);

    let input = match &cli.input_path {
        Some(path) => load_input(path)?,
        None => {
            warn!("No --input given; running with an empty input object");
            json!({})
        }
    };

    info!(
        "Workflow loaded: {} steps, {} risk rules",
        definition.steps.len(),
        definition.risk_rules.len()
    );

    // Create and configure engine
    let engine = Engine::with_config(builtin_registry(), config);
    let graph = engine.plan(&definition).map_err(|errors| {
        for e in &errors {
            error!("{}", e);
        }
        format!("workflow '{}' is invalid", definition.id)
    })?;

    if cli.dry_run {
        info!("Mode: DRY RUN (steps will not execute)");
        println!();
        print_plan(&definition, &graph);
        return Ok(ExitCode::SUCCESS);
    }

    // Stream events for this execution to stdout
    let execution_id = Engine::new_execution_id();
    let mut subscription = engine.events().subscribe(&execution_id);
    let printer = tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            print_event(&event);
            if event.event_kind.is_terminal() {
                break;
            }
        }
    });

    // Ctrl-C cancels the execution
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted - cancelling execution");
            interrupt.cancel();
        }
    });

    // Execute workflow
    let metadata = ContextMetadata::new(&execution_id)
        .with_actor(env::var("USER").unwrap_or_else(|_| "cli".to_string()));
    let (result, timeline) = engine
        .execute_traced(Arc::clone(&definition), input, metadata, cancel)
        .await;
    if let Err(e) = printer.await {
        warn!("Event printer stopped: {}", e);
    }

    print_summary(&result);

    let durations = timeline.durations();
    if !durations.is_empty() {
        println!("{}", timeline.gantt_chart());
        let (path, speedup) = graph.measured_critical_path(&durations);
        println!("Measured critical path: {:?} (speedup {:.2}x)", path, speedup);
    }

    Ok(exit_code(result.status))
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
