mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "verifix-cli")]
#[command(about = "Verifix CLI - Execute, test and verify code locally", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a source file once in the sandbox
    Execute {
        /// Source file to run
        #[arg(short, long)]
        file: PathBuf,

        /// Language name (python, javascript, typescript, go, rust, bash)
        #[arg(short, long)]
        language: String,

        /// Wall-clock timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Memory limit in MB
        #[arg(short, long)]
        memory: Option<u64>,

        /// Package to install before running (repeatable)
        #[arg(short, long = "dep")]
        deps: Vec<String>,
    },

    /// Score a source file against a JSON array of test cases
    Test {
        /// Source file to test
        #[arg(short, long)]
        file: PathBuf,

        /// Language name
        #[arg(short, long)]
        language: String,

        /// JSON file holding [{"input": {...}, "expectedOutput": ..., "description": "..."}]
        #[arg(short, long)]
        cases: PathBuf,

        /// Function to call (defaults to main)
        #[arg(short, long)]
        entry_point: Option<String>,
    },

    /// Run the full execute/test/repair loop
    Verify {
        /// Source file to verify
        #[arg(short, long)]
        file: PathBuf,

        /// Language name
        #[arg(short, long)]
        language: String,

        /// JSON test cases; generated when omitted
        #[arg(short, long)]
        cases: Option<PathBuf>,

        /// Function to call (defaults to main)
        #[arg(short, long)]
        entry_point: Option<String>,

        /// Override VERIFIX_MAX_RETRIES
        #[arg(long)]
        max_retries: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable JSON.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Execute {
            file,
            language,
            timeout,
            memory,
            deps,
        } => {
            let result = commands::execute(&file, &language, timeout, memory, deps).await?;
            commands::print_json(&result)?;
            if !result.success {
                std::process::exit(1);
            }
        }
        Commands::Test {
            file,
            language,
            cases,
            entry_point,
        } => {
            let results = commands::test(&file, &language, &cases, entry_point).await?;
            commands::print_json(&results)?;
            if results.iter().any(|r| !r.passed) {
                std::process::exit(1);
            }
        }
        Commands::Verify {
            file,
            language,
            cases,
            entry_point,
            max_retries,
        } => {
            let record = commands::verify(&file, &language, cases.as_deref(), entry_point, max_retries).await?;
            commands::print_json(&record)?;
            if !commands::is_verified(&record) {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
