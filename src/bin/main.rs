//! Quarry CLI - validate, compile and schedule custom reports
//!
//! Usage:
//!   quarry validate <draft.json> [--full]
//!   quarry compile <draft.json> [--tenant <id>] [--dialect <dialect>] [--filters <json>]
//!   quarry analyze <draft.json>
//!   quarry recurrence '<recurrence json>' [--from <rfc3339>] [--count <n>]
//!   quarry sweep
//!   quarry scheduler
//!
//! Examples:
//!   quarry compile reports/revenue.json --tenant 42 --dialect postgres
//!   quarry recurrence '{"type":"weekly","day_of_week":"monday","time":"08:00"}' --count 3

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use quarry::advisor::QueryAdvisor;
use quarry::compiler::QueryCompiler;
use quarry::config::Settings;
use quarry::model::{DraftConfig, Recurrence, ReportLayout};
use quarry::registry::Registry;
use quarry::scheduler::compute_next_run;
use quarry::service::{filters_from_json, ReportService};
use quarry::sql::Dialect;
use quarry::validation::ConfigValidator;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quarry")]
#[command(about = "Quarry - tenant-scoped custom report engine")]
#[command(version)]
struct Cli {
    /// Path to quarry.toml (defaults to QUARRY_CONFIG, ./quarry.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a draft report configuration
    Validate {
        /// Path to the draft JSON file
        file: PathBuf,

        /// Also require name and category
        #[arg(long)]
        full: bool,
    },

    /// Compile a draft report to SQL
    Compile {
        /// Path to the draft JSON file
        file: PathBuf,

        /// Tenant the query is scoped to
        #[arg(short, long, default_value_t = 1)]
        tenant: i64,

        /// SQL dialect to generate
        #[arg(short, long, default_value = "sqlite")]
        dialect: DialectArg,

        /// Runtime filter values as a JSON object
        #[arg(long)]
        filters: Option<String>,
    },

    /// Estimate cost and suggest indexes for a draft report
    Analyze {
        /// Path to the draft JSON file
        file: PathBuf,

        /// SQL dialect for index statements
        #[arg(short, long, default_value = "sqlite")]
        dialect: DialectArg,
    },

    /// Print upcoming runs of a recurrence
    Recurrence {
        /// Recurrence as JSON, e.g. {"type":"daily","time":"08:00"}
        recurrence: String,

        /// Compute from this instant instead of now (RFC 3339)
        #[arg(long)]
        from: Option<String>,

        /// Number of runs to print
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },

    /// Run all due schedules once
    Sweep,

    /// Run the scheduler until interrupted
    Scheduler,
}

#[derive(Clone, ValueEnum)]
enum DialectArg {
    Sqlite,
    Postgres,
    Mysql,
}

impl From<DialectArg> for Dialect {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::Sqlite => Dialect::Sqlite,
            DialectArg::Postgres => Dialect::Postgres,
            DialectArg::Mysql => Dialect::MySql,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quarry=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = match load_settings(cli.config.as_deref()) {
        Ok(s) => s,
        Err(code) => return code,
    };

    match cli.command {
        Commands::Validate { file, full } => cmd_validate(&settings, file, full),
        Commands::Compile {
            file,
            tenant,
            dialect,
            filters,
        } => cmd_compile(&settings, file, tenant, dialect, filters),
        Commands::Analyze { file, dialect } => cmd_analyze(&settings, file, dialect),
        Commands::Recurrence {
            recurrence,
            from,
            count,
        } => cmd_recurrence(recurrence, from, count),
        Commands::Sweep => cmd_sweep(&settings),
        Commands::Scheduler => cmd_scheduler(&settings),
    }
}

fn load_settings(path: Option<&Path>) -> Result<Settings, ExitCode> {
    let result = match path {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    };
    result.map_err(|e| {
        eprintln!("Configuration error: {}", e);
        ExitCode::FAILURE
    })
}

fn load_registry(settings: &Settings) -> Result<Arc<Registry>, ExitCode> {
    let registry = match settings.catalog_path() {
        Ok(Some(path)) => Registry::from_file(path),
        Ok(None) => Registry::builtin(),
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return Err(ExitCode::FAILURE);
        }
    };
    registry.map(Arc::new).map_err(|e| {
        eprintln!("Catalog error: {}", e);
        ExitCode::FAILURE
    })
}

fn read_draft(file: &Path) -> Result<DraftConfig, ExitCode> {
    let source = fs::read_to_string(file).map_err(|e| {
        eprintln!("Error reading file '{}': {}", file.display(), e);
        ExitCode::FAILURE
    })?;
    DraftConfig::from_json(&source).map_err(|e| {
        eprintln!("Error parsing '{}': {}", file.display(), e);
        ExitCode::FAILURE
    })
}

/// Validate and build a layout, printing every problem on failure.
fn build_layout(
    settings: &Settings,
    registry: Arc<Registry>,
    file: &Path,
    full: bool,
) -> Result<ReportLayout, ExitCode> {
    let draft = read_draft(file)?;
    let validator = ConfigValidator::new(registry, settings.limits.clone());
    validator.build(&draft, full).map_err(|errors| {
        eprintln!("Validation errors:");
        for error in &errors {
            eprintln!("  {}", error);
        }
        ExitCode::FAILURE
    })
}

fn cmd_validate(settings: &Settings, file: PathBuf, full: bool) -> ExitCode {
    let registry = match load_registry(settings) {
        Ok(r) => r,
        Err(code) => return code,
    };
    match build_layout(settings, registry, &file, full) {
        Ok(_) => {
            println!("OK: {} is valid", file.display());
            ExitCode::SUCCESS
        }
        Err(code) => code,
    }
}

fn cmd_compile(
    settings: &Settings,
    file: PathBuf,
    tenant: i64,
    dialect: DialectArg,
    filters: Option<String>,
) -> ExitCode {
    let registry = match load_registry(settings) {
        Ok(r) => r,
        Err(code) => return code,
    };
    let layout = match build_layout(settings, Arc::clone(&registry), &file, false) {
        Ok(l) => l,
        Err(code) => return code,
    };

    let values = match filters.as_deref().map(serde_json::from_str::<serde_json::Value>) {
        Some(Ok(value)) => filters_from_json(&value),
        Some(Err(e)) => {
            eprintln!("Invalid --filters JSON: {}", e);
            return ExitCode::FAILURE;
        }
        None => Default::default(),
    };

    let compiler = QueryCompiler::new(registry);
    let compiled = match compiler.compile_layout(&layout, tenant) {
        Ok(c) => compiler.apply_user_filters(c, &values, &layout),
        Err(e) => {
            eprintln!("Compilation error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let statement = compiled.statement(dialect.into());
    println!("{}", statement.sql);
    if !statement.params.is_empty() {
        println!();
        for (i, param) in statement.params.iter().enumerate() {
            println!("-- ${} = {:?}", i + 1, param);
        }
    }
    ExitCode::SUCCESS
}

fn cmd_analyze(settings: &Settings, file: PathBuf, dialect: DialectArg) -> ExitCode {
    let registry = match load_registry(settings) {
        Ok(r) => r,
        Err(code) => return code,
    };
    let layout = match build_layout(settings, Arc::clone(&registry), &file, false) {
        Ok(l) => l,
        Err(code) => return code,
    };

    let analysis = QueryAdvisor::new(registry, settings.limits.clone()).analyze(&layout);
    match serde_json::to_string_pretty(&analysis) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing analysis: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let dialect: Dialect = dialect.into();
    if !analysis.indexes.is_empty() {
        println!();
        for index in &analysis.indexes {
            println!("{};", index.to_sql(dialect));
        }
    }
    ExitCode::SUCCESS
}

fn cmd_recurrence(recurrence: String, from: Option<String>, count: usize) -> ExitCode {
    let recurrence: Recurrence = match serde_json::from_str(&recurrence) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Invalid recurrence: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let mut now = match from.as_deref().map(DateTime::parse_from_rfc3339) {
        Some(Ok(dt)) => dt.with_timezone(&Utc),
        Some(Err(e)) => {
            eprintln!("Invalid --from timestamp: {}", e);
            return ExitCode::FAILURE;
        }
        None => Utc::now(),
    };

    for _ in 0..count {
        match compute_next_run(&recurrence, now) {
            Ok(next) => {
                println!("{}", next.to_rfc3339());
                now = next;
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}

fn runtime() -> Result<tokio::runtime::Runtime, ExitCode> {
    tokio::runtime::Runtime::new().map_err(|e| {
        eprintln!("Error starting runtime: {}", e);
        ExitCode::FAILURE
    })
}

fn open_service(settings: &Settings) -> Result<ReportService, ExitCode> {
    ReportService::from_settings(settings).map_err(|e| {
        eprintln!("Error opening report service: {}", e);
        ExitCode::FAILURE
    })
}

fn cmd_sweep(settings: &Settings) -> ExitCode {
    let (service, rt) = match open_service(settings).and_then(|s| Ok((s, runtime()?))) {
        Ok(pair) => pair,
        Err(code) => return code,
    };
    let scheduler = service.scheduler();

    let result = rt.block_on(async move {
        let now = Utc::now();
        let recovered = scheduler.recover_stale(now)?;
        let summary = scheduler.execute_due(now).await?;
        Ok::<_, quarry::scheduler::ScheduleError>((recovered, summary))
    });

    match result {
        Ok((recovered, summary)) => {
            println!(
                "due: {}, succeeded: {}, failed: {}, recovered: {}",
                summary.due, summary.succeeded, summary.failed, recovered
            );
            if summary.failed > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("Sweep failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_scheduler(settings: &Settings) -> ExitCode {
    let (service, rt) = match open_service(settings).and_then(|s| Ok((s, runtime()?))) {
        Ok(pair) => pair,
        Err(code) => return code,
    };
    let scheduler = service.scheduler();

    rt.block_on(async move {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, stopping scheduler");
            }
            let _ = shutdown_tx.send(true);
        });
        scheduler.run(shutdown_rx).await;
    });
    ExitCode::SUCCESS
}
