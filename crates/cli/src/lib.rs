pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "conductor",
    about = "Conductor operator CLI",
    long_about = "Run and validate workflow definitions, classify errors, and inspect Conductor runtime readiness.",
    after_help = "Examples:\n  conductor run workflow.json\n  conductor run workflow.toml --queued\n  conductor classify --message \"upstream timed out\"\n  conductor doctor --json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Run a workflow context (JSON or TOML) with the dry-run step executor")]
    Run {
        file: PathBuf,
        #[arg(long, help = "Submit through the job processor instead of running inline")]
        queued: bool,
    },
    #[command(about = "Validate a workflow context against engine limits without running it")]
    Validate { file: PathBuf },
    #[command(about = "Print the recovery classification for an error")]
    Classify {
        #[arg(long, help = "Error message to classify")]
        message: String,
        #[arg(long, help = "Error type name, e.g. TimeoutError")]
        name: Option<String>,
        #[arg(long, help = "Error code, e.g. RATE_LIMITED")]
        code: Option<String>,
    },
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, handler registration, and an engine dry run")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run { file, queued } => commands::run::run(&file, queued),
        Command::Validate { file } => commands::validate::run(&file),
        Command::Classify { message, name, code } => {
            commands::classify::run(name.as_deref(), &message, code.as_deref())
        }
        Command::Config => commands::config::run(),
        Command::Doctor { json } => commands::doctor::run(json),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
