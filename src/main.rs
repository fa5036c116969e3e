mod cli;
mod config;
mod db;
mod error;
mod events;
mod fingerprint;
mod isolation;
mod metadata;
mod migrate;
mod orchestrator;
mod planner;
mod portref;
mod resolver;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use cli::{BuildArgs, Cli, Command, CommonPortArgs, DoctorArgs, MigrateArgs, PlanArgs};
use config::Config;
use db::Database;
use events::{ConsoleObserver, NullObserver, Observer};
use isolation::CancellationToken;
use metadata::{ExternalToolMetadataQuery, FixtureMetadataQuery, MetadataQuery};
use orchestrator::{Orchestrator, OrchestratorConfig};
use planner::Planner;
use resolver::Resolver;
use std::process::ExitCode;
use std::sync::Arc;
use uuid::Uuid;

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let result = match &cli.command {
        Command::Build(args) => run_build(&cli, args),
        Command::Plan(args) => run_plan(&cli, args),
        Command::Doctor(args) => run_doctor(args),
        Command::MigrateFingerprints(args) => run_migrate(args),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("portwright: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(config_path: Option<&std::path::Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn apply_common_overrides(config: &mut Config, common: &CommonPortArgs) {
    if let Some(ports_dir) = &common.ports_dir {
        config.ports_dir = ports_dir.clone();
    }
    if let Some(build_base) = &common.build_base {
        config.build_base = build_base.clone();
    }
    if let Some(db_path) = &common.db_path {
        config.db_path = Some(db_path.clone());
    }
}

fn make_metadata_query(
    config: &Config,
    fixtures_dir: Option<&std::path::Path>,
) -> Box<dyn MetadataQuery> {
    match fixtures_dir {
        Some(dir) => Box::new(FixtureMetadataQuery::new(dir.to_path_buf())),
        None => Box::new(ExternalToolMetadataQuery::new(
            config.ports_dir.clone(),
            config.port_metadata_tool.clone(),
        )),
    }
}

/// `build` — runs roots through resolve -> plan -> orchestrate, wiring the
/// `ctrlc` signal handler to the orchestrator's cancellation token.
fn run_build(cli: &Cli, args: &BuildArgs) -> Result<ExitCode> {
    let mut config = load_config(cli.config.as_deref())?;
    apply_common_overrides(&mut config, &args.common);
    if let Some(workers) = args.max_workers {
        config.max_workers = workers;
    }
    if let Some(backend) = &args.isolation_backend {
        config.use_isolation_backend = backend.clone();
    }
    if let Some(secs) = args.cancel_grace_secs {
        config.cancel_grace_secs = secs;
    }
    if let Some(secs) = args.per_execute_timeout_secs {
        config.per_execute_timeout_secs = secs;
    }

    std::fs::create_dir_all(&config.build_base)
        .with_context(|| format!("creating build base {}", config.build_base.display()))?;

    let db = Database::open(&config.effective_db_path())
        .with_context(|| format!("opening database at {}", config.effective_db_path().display()))?;

    let metadata = make_metadata_query(&config, args.common.metadata_fixtures_dir.as_deref());
    let mut resolution = Resolver::new(metadata.as_ref())
        .resolve(&args.common.roots)
        .context("resolving port dependency graph")?;

    let planner = Planner::new(&db, &config.ports_dir, config.propagation_policy.into());
    let plan = planner.plan(&mut resolution).context("planning build order")?;

    let observer: Box<dyn Observer> = if cli.quiet {
        Box::new(NullObserver)
    } else {
        Box::new(ConsoleObserver)
    };

    let cancellation = CancellationToken::new();
    let signal_cancellation = cancellation.clone();
    let escalate = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let escalate_flag = escalate.clone();
    // First signal cancels gracefully; a second escalates to an immediate
    // exit, for operators who kill hard when the graceful path is slow
    // (see DESIGN.md).
    ctrlc::set_handler(move || {
        if escalate_flag.swap(true, std::sync::atomic::Ordering::SeqCst) {
            std::process::exit(130);
        }
        signal_cancellation.cancel();
    })
    .context("installing signal handler")?;

    let run_id = Uuid::new_v4().to_string();
    let orchestrator_config = OrchestratorConfig {
        workers: config.max_workers,
        slow_start: config.slow_start(),
        per_execute_timeout: config.per_execute_timeout(),
        cancel_grace: config.cancel_grace(),
        isolation_backend: config.use_isolation_backend.clone(),
        build_base: config.build_base.clone(),
        isolation_helper: config.isolation_helper.clone(),
        build_command: config.build_command.clone(),
        run_id,
    };

    let orchestrator = Orchestrator::new(&db, &config.ports_dir, observer.as_ref(), orchestrator_config);
    let stats = orchestrator
        .run(resolution, &plan, cancellation)
        .context("running build orchestrator")?;

    db.close().ok();

    println!(
        "total={} success={} failed={} skipped={} skipped_pre={} ignored={} duration_ms={}",
        stats.total,
        stats.success,
        stats.failed,
        stats.skipped,
        stats.skipped_pre,
        stats.ignored,
        stats.duration_ms
    );

    // Non-zero exit iff any port failed.
    if stats.failed > 0 {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// `plan` — resolve and plan only, printing the schedule and skip reasons.
/// `--strict` surfaces `CycleError` instead of silently breaking cycles.
fn run_plan(cli: &Cli, args: &PlanArgs) -> Result<ExitCode> {
    let mut config = load_config(cli.config.as_deref())?;
    apply_common_overrides(&mut config, &args.common);

    let db = Database::open(&config.effective_db_path())
        .with_context(|| format!("opening database at {}", config.effective_db_path().display()))?;

    let metadata = make_metadata_query(&config, args.common.metadata_fixtures_dir.as_deref());
    let mut resolution = Resolver::new(metadata.as_ref())
        .resolve(&args.common.roots)
        .context("resolving port dependency graph")?;

    if args.strict {
        match resolution.topo_strict() {
            Ok(order) => {
                for id in order {
                    println!("{}", resolution.get(id).port_dir());
                }
                return Ok(ExitCode::SUCCESS);
            }
            Err(cycle) => {
                eprintln!(
                    "cycle detected: {} of {} packages ({})",
                    cycle.cycle_packages.len(),
                    cycle.total_packages,
                    cycle.cycle_packages.join(", ")
                );
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    let planner = Planner::new(&db, &config.ports_dir, config.propagation_policy.into());
    let plan = planner.plan(&mut resolution).context("planning build order")?;
    for planned in &plan.order {
        let pkg = resolution.get(planned.id);
        let label = match planned.label {
            planner::PlanLabel::NeedsBuild => "needs-build",
            planner::PlanLabel::SkippedPre => "skipped-pre",
            planner::PlanLabel::Ignored => "ignored",
            planner::PlanLabel::UpToDate => "up-to-date",
        };
        println!("{}\t{}", pkg.port_dir(), label);
    }
    Ok(ExitCode::SUCCESS)
}

/// `doctor` — opens the DB read-only and reports orphaned `running` records
/// left behind by a build that never reached a terminal status.
fn run_doctor(args: &DoctorArgs) -> Result<ExitCode> {
    let mut config = Config::default();
    if let Some(build_base) = &args.build_base {
        config.build_base = build_base.clone();
    }
    if let Some(db_path) = &args.db_path {
        config.db_path = Some(db_path.clone());
    }

    let db_path = config.effective_db_path();
    let db = Database::open(&db_path)
        .with_context(|| format!("opening database at {}", db_path.display()))?;

    let orphans = db.orphaned_records().context("scanning for orphaned records")?;
    if orphans.is_empty() {
        println!("no orphaned records");
        return Ok(ExitCode::SUCCESS);
    }

    for record in &orphans {
        println!(
            "orphan uuid={} port={}@{} started={}",
            record.uuid, record.port_dir, record.version, record.start_time
        );
    }
    println!("{} orphaned record(s)", orphans.len());
    Ok(ExitCode::SUCCESS)
}

/// `migrate-fingerprints` — imports the legacy fingerprint export.
fn run_migrate(args: &MigrateArgs) -> Result<ExitCode> {
    let mut config = Config::default();
    if let Some(build_base) = &args.build_base {
        config.build_base = build_base.clone();
    }
    if let Some(db_path) = &args.db_path {
        config.db_path = Some(db_path.clone());
    }
    std::fs::create_dir_all(&config.build_base)
        .with_context(|| format!("creating build base {}", config.build_base.display()))?;

    let db = Database::open(&config.effective_db_path())
        .with_context(|| format!("opening database at {}", config.effective_db_path().display()))?;

    let report = migrate::migrate_fingerprints(&db, &args.legacy_file)
        .map_err(|e| anyhow!(e))
        .context("importing legacy fingerprint file")?;

    println!(
        "imported={} skipped={}",
        report.imported,
        report.skipped.len()
    );
    for (line_no, content) in &report.skipped {
        eprintln!("skipped line {line_no}: {content}");
    }
    Ok(ExitCode::SUCCESS)
}
