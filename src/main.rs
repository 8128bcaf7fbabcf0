use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use lms_validator::batch::{run_batch, Assignment};
use lms_validator::compiler::{init_profiles, supported_profiles};
use lms_validator::config::{init_config, EngineConfig};
use lms_validator::files::Owner;
use lms_validator::job::{LogSink, ValidationJob};
use lms_validator::{Submission, SubmissionFile, ValidatorRegistry};

#[derive(Parser, Debug)]
#[command(name = "lms-validate")]
#[command(about = "Validate student submissions with instructor-supplied validators")]
struct Cli {
    /// Log level (trace, debug, info, warn, error), overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate one submission made of local files
    Run {
        /// Validator file (entry point or archive)
        #[arg(long)]
        validator: PathBuf,

        #[arg(long, default_value = "local")]
        submission_id: String,

        /// Submission files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Validate every assignment that has a matching validator
    Batch {
        /// Directory with one validator file per assignment
        #[arg(long)]
        validators: PathBuf,

        /// Directory with one directory per assignment, holding one directory per submission
        #[arg(long)]
        submissions: PathBuf,
    },
    /// List the available compiler profiles and validators
    Profiles,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout is reserved for results
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("lms_validator=info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();

    let config = EngineConfig::from_env().context("Failed to load configuration")?;
    init_profiles(config.compilers_path.as_deref())?;
    init_config(config)?;

    let registry = ValidatorRegistry::with_builtins();

    match cli.command {
        Command::Run {
            validator,
            submission_id,
            files,
        } => {
            let files = files
                .iter()
                .map(|path| SubmissionFile::from_local_file(path, None))
                .collect::<Result<Vec<_>>>()?;
            let submission = Submission::new(submission_id, Owner::User(0), files);
            let validator_file = SubmissionFile::from_local_file(&validator, None)?;

            let job = ValidationJob::new(submission, validator_file, Arc::new(LogSink));
            let outcome = job.start(&registry).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                match &outcome.result {
                    Some(result) => {
                        println!("Result: {}", result.verdict());
                        println!("\nStudent message:\n{}", result.student_message);
                        println!("\nTutor message:\n{}", result.tutor_message);
                    }
                    None => println!(
                        "No result, the validator could not be loaded: {}",
                        outcome.load_error.as_deref().unwrap_or("unknown reason")
                    ),
                }
            }
        }
        Command::Batch {
            validators,
            submissions,
        } => {
            let assignments = Assignment::all_from_local_dir(&submissions)?;
            info!("Loaded {} assignments from {:?}", assignments.len(), submissions);

            let summary = run_batch(&validators, &assignments, &registry, Arc::new(LogSink)).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "{} jobs: {} passed, {} failed, {} without validator result, {} aborted",
                    summary.jobs,
                    summary.passed,
                    summary.failed,
                    summary.not_loaded,
                    summary.faults.len()
                );
                for name in &summary.skipped_assignments {
                    println!("No validator for assignment '{}'", name);
                }
            }

            if !summary.faults.is_empty() {
                anyhow::bail!("Validation aborted for submissions {:?}", summary.faults);
            }
        }
        Command::Profiles => {
            println!("Compiler profiles: {}", supported_profiles().join(", "));
            println!("Validators: {}", registry.names().join(", "));
        }
    }

    Ok(())
}
