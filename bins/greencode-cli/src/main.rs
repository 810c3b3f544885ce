mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use greencode_common::types::Language;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "greencode-cli")]
#[command(about = "Green Code CLI - Manage sandbox images and submit code to the engine", long_about = None)]
struct Cli {
    /// Language registry used by the engine
    #[arg(long, global = true, default_value = "config/languages.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the languages in the registry
    ListLanguages,

    /// Build the sandbox Docker image for a language
    BuildImage {
        /// Language name
        #[arg(short, long)]
        name: Language,

        /// Skip build cache
        #[arg(long, default_value = "false")]
        no_cache: bool,
    },

    /// Submit a source file to a running engine
    Submit {
        /// Source file to submit
        #[arg(short, long)]
        file: PathBuf,

        /// Submission language
        #[arg(short, long)]
        language: Language,

        /// Problem the submission solves
        #[arg(short, long)]
        problem_id: i64,

        /// Engine base URL
        #[arg(long, env = "GREENCODE_ENGINE_URL", default_value = "http://127.0.0.1:8081")]
        engine_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::ListLanguages => {
            commands::list_languages(&cli.config)?;
        }
        Commands::BuildImage { name, no_cache } => {
            commands::build_docker_image(&cli.config, name, no_cache)?;
        }
        Commands::Submit {
            file,
            language,
            problem_id,
            engine_url,
        } => {
            commands::submit(&engine_url, &file, language, problem_id).await?;
        }
    }

    Ok(())
}
