//! CLI surface (ambient) — a `clap` derive parser over the four
//! subcommands SPEC_FULL.md §6 names: `build`, `plan`, `doctor`, and
//! `migrate-fingerprints`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "portwright",
    version,
    about = "Parallel, incremental BSD-style ports builder with an embedded build database"
)]
pub struct Cli {
    /// Path to a TOML config file; individual flags below override its fields.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Suppress the console observer; events are still counted in stats.
    #[arg(long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve, plan, and build the given port roots.
    Build(BuildArgs),
    /// Resolve and plan only; print the schedule and skip reasons.
    Plan(PlanArgs),
    /// Open the database read-only and report orphaned `running` records.
    Doctor(DoctorArgs),
    /// Import a legacy `portDir:hex-crc32` fingerprint file.
    MigrateFingerprints(MigrateArgs),
}

#[derive(Debug, Parser)]
pub struct CommonPortArgs {
    /// Root port specs: `category/name`, `category/name@flavor`, or an
    /// absolute ports-tree directory.
    pub roots: Vec<String>,

    #[arg(long)]
    pub ports_dir: Option<PathBuf>,

    #[arg(long)]
    pub build_base: Option<PathBuf>,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Use the fixture-backed metadata query instead of the external tool,
    /// reading `<fixtures-dir>/<category>/<name>[@flavor].fixture`.
    #[arg(long)]
    pub metadata_fixtures_dir: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct BuildArgs {
    #[command(flatten)]
    pub common: CommonPortArgs,

    #[arg(long)]
    pub max_workers: Option<usize>,

    #[arg(long)]
    pub isolation_backend: Option<String>,

    #[arg(long)]
    pub cancel_grace_secs: Option<u64>,

    #[arg(long)]
    pub per_execute_timeout_secs: Option<u64>,
}

#[derive(Debug, Parser)]
pub struct PlanArgs {
    #[command(flatten)]
    pub common: CommonPortArgs,

    /// Use the strict Kahn's-algorithm sort; surfaces `CycleError` if the
    /// roots contain a cycle, instead of the permissive best-effort order.
    #[arg(long)]
    pub strict: bool,
}

#[derive(Debug, Parser)]
pub struct DoctorArgs {
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub build_base: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct MigrateArgs {
    /// Path to the legacy `portDir:hex-crc32` fingerprint export.
    pub legacy_file: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub build_base: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_build_with_roots_and_flags() {
        let cli = Cli::parse_from([
            "portwright",
            "build",
            "editors/vim",
            "--max-workers",
            "4",
            "--isolation-backend",
            "mock",
        ]);
        match cli.command {
            Command::Build(args) => {
                assert_eq!(args.common.roots, vec!["editors/vim".to_string()]);
                assert_eq!(args.max_workers, Some(4));
                assert_eq!(args.isolation_backend.as_deref(), Some("mock"));
            }
            other => panic!("expected Build, got {other:?}"),
        }
    }

    #[test]
    fn parses_plan_strict_flag() {
        let cli = Cli::parse_from(["portwright", "plan", "--strict", "editors/vim"]);
        match cli.command {
            Command::Plan(args) => {
                assert!(args.strict);
                assert_eq!(args.common.roots, vec!["editors/vim".to_string()]);
            }
            other => panic!("expected Plan, got {other:?}"),
        }
    }

    #[test]
    fn parses_migrate_fingerprints_path() {
        let cli = Cli::parse_from(["portwright", "migrate-fingerprints", "legacy.crc"]);
        match cli.command {
            Command::MigrateFingerprints(args) => {
                assert_eq!(args.legacy_file, PathBuf::from("legacy.crc"));
            }
            other => panic!("expected MigrateFingerprints, got {other:?}"),
        }
    }
}
