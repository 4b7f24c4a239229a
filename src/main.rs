//! varship CLI
//!
//! Entry point for the `varship` command-line tool.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};

use varship::config::DEFAULT_CONFIG_FILE;
use varship::pipeline::{Pipeline, PipelineError};
use varship::release::publish::{Published, PublishError};
use varship::summary::ExitCode;
use varship::PipelineConfig;

#[derive(Parser)]
#[command(name = "varship")]
#[command(about = "Variant build orchestrator and release pipeline", version)]
struct Cli {
    /// Path to pipeline config (default: varship.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build variants without publishing
    Build {
        /// Variant or channel selector (default: whole matrix)
        #[arg(long, short = 'v')]
        variant: Option<String>,
    },

    /// Build the whole matrix and publish a release
    Release {
        /// Version tag (append-only, immutable once published)
        version: String,
    },

    /// Verify the environment and configuration
    Verify,

    /// Remove cache entries unused for longer than the given age
    CacheGc {
        /// Maximum entry age in days
        #[arg(long, default_value_t = 30)]
        max_age_days: u64,
    },
}

fn main() {
    let cli = Cli::parse();
    process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let config = match PipelineConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("varship: {e}");
            return ExitCode::Config.as_i32();
        }
    };

    let root = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    let pipeline = Pipeline::new(config, &root);

    match cli.command {
        Commands::Build { variant } => match pipeline.run_build(variant.as_deref()) {
            Ok(run) => {
                print!("{}", run.summary.render_human());
                run.summary.aggregate.exit_code().as_i32()
            }
            Err(e) => report_pipeline_error(&e),
        },

        Commands::Release { version } => match pipeline.run_release(&version) {
            Ok(run) => {
                print!("{}", run.build.summary.render_human());
                match run.publication {
                    Ok(Published::Created(manifest)) => {
                        println!(
                            "released {} ({} artifact(s), {} omitted)",
                            manifest.version,
                            manifest.entries.len(),
                            manifest.omitted.len()
                        );
                        run.build.summary.aggregate.exit_code().as_i32()
                    }
                    Ok(Published::Unchanged(manifest)) => {
                        println!("version {} already published, content identical", manifest.version);
                        run.build.summary.aggregate.exit_code().as_i32()
                    }
                    Err(PublishError::RequiredVariantsFailed { variants }) => {
                        eprintln!(
                            "varship: publication blocked by required variant(s): {}",
                            variants.join(", ")
                        );
                        ExitCode::RequiredBlocked.as_i32()
                    }
                    Err(e @ PublishError::VersionConflict { .. }) => {
                        eprintln!("varship: {e}");
                        ExitCode::VersionConflict.as_i32()
                    }
                    Err(e) => {
                        eprintln!("varship: publish failed: {e}");
                        ExitCode::Pipeline.as_i32()
                    }
                }
            }
            Err(e) => report_pipeline_error(&e),
        },

        Commands::Verify => match pipeline.verify() {
            Ok(report) => {
                println!(
                    "matrix: {} variant(s), {} required",
                    report.variant_count, report.required_count
                );
                println!(
                    "signing: {}",
                    if report.signing_configured {
                        "configured"
                    } else {
                        "not configured (artifacts will be unsigned)"
                    }
                );
                println!("toolchain: {}", report.toolchain_command.join(" "));
                ExitCode::Success.as_i32()
            }
            Err(e) => report_pipeline_error(&e),
        },

        Commands::CacheGc { max_age_days } => {
            let max_age = Duration::from_secs(max_age_days * 24 * 3600);
            match pipeline.cache_gc(max_age) {
                Ok(stats) => {
                    println!(
                        "cache-gc: scanned {}, removed {}",
                        stats.scanned, stats.removed
                    );
                    ExitCode::Success.as_i32()
                }
                Err(e) => report_pipeline_error(&e),
            }
        }
    }
}

fn report_pipeline_error(error: &PipelineError) -> i32 {
    eprintln!("varship: {error}");
    match error {
        PipelineError::Matrix(_) => ExitCode::InvalidMatrix.as_i32(),
        PipelineError::Config(_) | PipelineError::NoMatchingVariant(_) => {
            ExitCode::Config.as_i32()
        }
        _ => ExitCode::Pipeline.as_i32(),
    }
}
