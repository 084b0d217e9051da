//! Main entry point for the Chunk Translator CLI

#![forbid(unsafe_code)]

use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chunk_translator::cli::commands::{self, Commands};

/// Chunk Translator - resumable, rate-limited document translation
#[derive(Parser, Debug)]
#[command(name = "chunk-translator", version, about, long_about = None)]
struct Args {
    /// API key (optional, defaults to TRANSLATION_API_KEY env var)
    #[arg(long)]
    api_key: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Maximum chunks translated concurrently per job
    #[arg(long)]
    max_concurrent: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("chunk_translator={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Override config with CLI args if provided
    if let Some(api_key) = args.api_key {
        std::env::set_var("TRANSLATION_API_KEY", api_key);
    }

    if let Some(max_concurrent) = args.max_concurrent {
        std::env::set_var("MAX_CONCURRENT", max_concurrent.to_string());
    }

    // Execute command
    match args.command {
        Some(Commands::Translate {
            file,
            state,
            output,
            target_lang,
            tone,
            user_id,
        }) => {
            commands::handle_translate(file, state, output, target_lang, tone, user_id).await?;
        }
        Some(Commands::Resume {
            state,
            job_id,
            retry_failed,
            output,
        }) => {
            commands::handle_resume(state, job_id, retry_failed, output).await?;
        }
        Some(Commands::Status { state, job_id }) => {
            commands::handle_status(state, job_id).await?;
        }
        Some(Commands::Server { host, port }) => {
            commands::handle_server(host, port).await?;
        }
        None => {
            println!("Please specify a command. Use --help for more information.");
        }
    }

    Ok(())
}
