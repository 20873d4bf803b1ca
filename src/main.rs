use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow, bail};
use bunker_ci::config::EngineConfig;
use bunker_ci::credentials::CredentialStore;
use bunker_ci::definition::PipelineDefinition;
use bunker_ci::engine::{CancelToken, PipelineEngine, RunOptions};
use bunker_ci::error::PipelineError;
use bunker_ci::lockfile::generate_lock;
use bunker_ci::observability::{MetricsCollector, log_snapshot};
#[cfg(feature = "metrics-server")]
use bunker_ci::observability::server::MetricsServer;
use bunker_ci::presets::generate_preset;
use bunker_ci::report::GateStatus;
use bunker_ci::run::{PipelineRun, RunStatus};
use bunker_ci::steps::StepRegistry;
use bunker_ci::validation::validate_definition;
use bunker_ci::Verdict;
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::Shell;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

const EXIT_SUCCEEDED: u8 = 0;
const EXIT_FAILED: u8 = 1;
const EXIT_ABORTED: u8 = 2;
const EXIT_MALFORMED: u8 = 3;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let otlp_endpoint_for_tracing = match &cli.command {
        Commands::Run(args) => args.otlp_endpoint.clone(),
        _ => None,
    };

    if let Err(err) = configure_tracing(otlp_endpoint_for_tracing.as_deref()) {
        eprintln!("error: failed to configure tracing: {err:#}");
        return ExitCode::from(EXIT_FAILED);
    }

    let command_result: Result<u8> = match cli.command {
        Commands::Run(args) => run_command(args),
        Commands::ListSteps => {
            list_steps();
            Ok(EXIT_SUCCEEDED)
        }
        Commands::Validate { pipeline } => validate_pipeline_cmd(&pipeline).map(|_| EXIT_SUCCEEDED),
        Commands::Lint { pipelines } => lint_pipelines(&pipelines),
        Commands::Lock { pipeline, output } => lock_pipeline(&pipeline, &output).map(|_| EXIT_SUCCEEDED),
        Commands::Init { preset, output } => init_pipeline(&preset, output).map(|_| EXIT_SUCCEEDED),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "bunker-ci", &mut io::stdout());
            Ok(EXIT_SUCCEEDED)
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    match command_result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            if let Some(PipelineError::MalformedPipeline { errors }) = err.downcast_ref() {
                for message in errors {
                    error!("{message}");
                }
                error!("Pipeline definition is malformed ({} error(s))", errors.len());
                return ExitCode::from(EXIT_MALFORMED);
            }
            error!("{err:#}");
            ExitCode::from(EXIT_FAILED)
        }
    }
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "bunker-ci")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        } else {
            tracing_subscriber::registry()
                .with(filter.clone())
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
        }
    }

    #[cfg(not(feature = "otel"))]
    {
        if let Some(endpoint) = otlp_endpoint {
            eprintln!(
                "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
                endpoint
            );
        }

        tracing_subscriber::registry()
            .with(filter.clone())
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()
            .map_err(|err| anyhow!(err.to_string()))?;
    }

    Ok(())
}

fn run_command(args: RunArgs) -> Result<u8> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(seconds) = args.timeout {
        if seconds == 0 {
            bail!("--timeout must be greater than zero");
        }
        config = config.with_default_timeout(seconds);
    }

    let credentials = load_credentials(&config, args.secrets.as_deref())?;
    info!(credentials = credentials.len(), "Credential store initialised");

    let engine = PipelineEngine::new(config, credentials, StepRegistry::with_defaults());
    let definition = engine.load(&args.pipeline)?;

    if args.dry_run {
        print_plan(&definition);
        return Ok(EXIT_SUCCEEDED);
    }

    let metrics_handle = engine.metrics().clone();

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = &args.metrics_listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        let server = MetricsServer::start(addr, metrics_handle.clone())?;
        info!(address = %server.address(), "Metrics server listening");
        Some(server)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = &args.metrics_listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;
    let options = RunOptions {
        archive_dir: args.archive_dir.clone(),
        run_id: None,
    };
    let run = runtime.block_on(async {
        let cancel = CancelToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received; the run stops after the current stage");
                    cancel.cancel();
                }
            })
        };
        let run = engine
            .run_with(definition, &args.workspace, &cancel, &options)
            .await;
        watcher.abort();
        run
    })?;

    print_summary(&run);

    if let Some(path) = &args.report {
        write_json(path, &run, "run report")?;
    }
    write_metrics(
        &metrics_handle,
        args.print_metrics,
        args.metrics_json.as_deref(),
        args.metrics_prometheus.as_deref(),
    )?;

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    Ok(exit_code(&run))
}

fn exit_code(run: &PipelineRun) -> u8 {
    match (run.status(), run.verdict()) {
        (RunStatus::Succeeded, Verdict::Pass) => EXIT_SUCCEEDED,
        (RunStatus::Aborted, _) => EXIT_ABORTED,
        _ => EXIT_FAILED,
    }
}

fn load_credentials(config: &EngineConfig, secrets: Option<&Path>) -> Result<CredentialStore> {
    let mut store = CredentialStore::new();
    if let Some(path) = secrets.or(config.secrets_file.as_deref()) {
        store = store.merged(CredentialStore::load_file(path)?);
    }
    // Host variables win over the file so a single secret can be overridden per invocation.
    Ok(store.merged(CredentialStore::from_env()))
}

fn print_plan(definition: &PipelineDefinition) {
    println!("Pipeline '{}' ({} stage(s))", definition.name, definition.stages.len());
    for stage in &definition.stages {
        let state = if stage.enabled { "" } else { " [disabled]" };
        println!("- {}{state} (on_failure: {:?})", stage.name, stage.on_failure);
        for (index, step) in stage.steps.iter().enumerate() {
            println!("    {}. {} [{}]", index + 1, step.display_name(index), step.uses);
        }
        for gate in definition.gates_for(&stage.name) {
            println!("    gate: {} ({})", gate.label(), gate.check.kind());
        }
    }
}

fn print_summary(run: &PipelineRun) {
    println!("Run {} finished: {:?}, verdict {}", run.id(), run.status(), run.verdict());
    for stage in run.stages() {
        println!(
            "- {:<24} {:<10} {} step(s), {} ms",
            stage.name,
            format!("{:?}", stage.status).to_lowercase(),
            stage.steps.len(),
            stage.duration_ms
        );
        for step in stage.failed_steps() {
            println!(
                "    step {} '{}' {:?} (exit {})",
                step.index + 1,
                step.name,
                step.outcome,
                step.exit_code
            );
        }
    }
    for gate in run.gates() {
        let status = match gate.status {
            GateStatus::Passed => "passed",
            GateStatus::Failed => "FAILED",
            GateStatus::Error => "ERROR",
            GateStatus::NotEvaluated => "not evaluated",
        };
        println!("  gate {}: {status} ({})", gate.gate, gate.message);
    }
    if !run.archived().is_empty() {
        println!("  {} artifact(s) archived", run.archived().len());
    }
}

fn write_metrics(
    collector: &MetricsCollector,
    print_metrics: bool,
    metrics_json: Option<&Path>,
    metrics_prometheus: Option<&Path>,
) -> Result<()> {
    if !print_metrics && metrics_json.is_none() && metrics_prometheus.is_none() {
        return Ok(());
    }
    let snapshot = collector.snapshot();
    if print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = metrics_json {
        write_json(path, &snapshot, "metrics JSON")?;
    }
    if let Some(path) = metrics_prometheus {
        ensure_parent(path)?;
        std::fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T, what: &str) -> Result<()> {
    ensure_parent(path)?;
    let file = File::create(path)
        .with_context(|| format!("Failed to create {what} file: {}", path.display()))?;
    to_writer_pretty(file, value)
        .with_context(|| format!("Failed to write {what}: {}", path.display()))?;
    info!(path = %path.display(), "{what} written");
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn list_steps() {
    let registry = StepRegistry::with_defaults();
    println!("Available step kinds:");
    for name in registry.known_kinds() {
        println!("- {name}");
    }
}

fn validate_pipeline_cmd(path: &Path) -> Result<()> {
    let definition = PipelineDefinition::from_yaml(&read_pipeline(path)?)?;
    let report = validate_definition(&definition, &StepRegistry::with_defaults());

    for warning in &report.warnings {
        warn!(file = %path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %path.display(), "Pipeline validation passed");
        Ok(())
    } else {
        Err(PipelineError::MalformedPipeline {
            errors: report.errors,
        }
        .into())
    }
}

fn read_pipeline(path: &Path) -> Result<String, PipelineError> {
    std::fs::read_to_string(path).map_err(|err| {
        PipelineError::malformed(format!(
            "Failed to read pipeline file {}: {err}",
            path.display()
        ))
    })
}

fn lint_pipelines(pipelines: &[PathBuf]) -> Result<u8> {
    if pipelines.is_empty() {
        bail!("No pipeline files supplied for linting");
    }

    let mut failures = 0usize;
    for path in pipelines {
        match validate_pipeline_cmd(path) {
            Ok(()) => info!(file = %path.display(), "Lint passed"),
            Err(err) => {
                failures += 1;
                match err.downcast_ref::<PipelineError>() {
                    Some(PipelineError::MalformedPipeline { errors }) => {
                        for message in errors {
                            error!(file = %path.display(), "{message}");
                        }
                    }
                    _ => error!(file = %path.display(), "{err:#}"),
                }
            }
        }
    }

    if failures > 0 {
        error!("Lint failed for {failures} pipeline(s)");
        return Ok(EXIT_MALFORMED);
    }

    info!("All pipeline lint checks passed");
    Ok(EXIT_SUCCEEDED)
}

fn lock_pipeline(path: &Path, output_path: &Path) -> Result<()> {
    let definition = PipelineDefinition::load(path, &StepRegistry::with_defaults())?;
    ensure_parent(output_path)?;
    let lock = generate_lock(&definition, output_path)?;
    info!(
        lockfile = %output_path.display(),
        digest = %lock.definition_hash,
        "Lockfile generated successfully"
    );
    Ok(())
}

fn init_pipeline(preset: &str, output: Option<PathBuf>) -> Result<()> {
    let destination = output.unwrap_or_else(|| PathBuf::from(format!("pipelines/{preset}.yaml")));
    let generated = generate_preset(preset, &destination)?;
    info!(
        preset = %preset,
        path = %generated.display(),
        "Preset pipeline generated"
    );
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "bunker-ci",
    version,
    about = "Sequential CI/CD pipeline runner with security gates"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a pipeline definition.
    Run(RunArgs),
    /// List registered step kinds.
    ListSteps,
    /// Check a pipeline definition and report every problem found.
    Validate {
        #[arg(value_hint = ValueHint::FilePath)]
        pipeline: PathBuf,
    },
    /// Validate several pipeline definitions.
    Lint {
        #[arg(required = true, value_hint = ValueHint::FilePath)]
        pipelines: Vec<PathBuf>,
    },
    /// Write a lockfile pinning every stage, step and gate.
    Lock {
        pipeline: PathBuf,
        output: PathBuf,
    },
    /// Generate a starter pipeline from a preset.
    Init {
        #[arg(long, value_parser = ["devsecops", "minimal"])]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(long, value_hint = ValueHint::FilePath)]
    pipeline: PathBuf,
    #[arg(long, default_value = "workspace", value_hint = ValueHint::DirPath)]
    workspace: PathBuf,
    /// Default per-step timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,
    /// YAML file mapping credential names to secret values.
    #[arg(long, value_hint = ValueHint::FilePath)]
    secrets: Option<PathBuf>,
    #[arg(long = "archive-dir", value_hint = ValueHint::DirPath)]
    archive_dir: Option<PathBuf>,
    /// Write the finished run as JSON.
    #[arg(long)]
    report: Option<PathBuf>,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus")]
    metrics_prometheus: Option<PathBuf>,
    #[arg(long = "metrics-listen")]
    metrics_listen: Option<String>,
    #[arg(long = "otlp-endpoint")]
    otlp_endpoint: Option<String>,
}
