//! msgqueue - durable file-backed priority message queue.

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::filter::LevelFilter;

use msgqueue::cli::Command;
use msgqueue::{logging, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args = Commands::parse();

    // Only the processing loop reports progress on the console
    let console_level = match args.command {
        Command::Process { .. } => LevelFilter::INFO,
        _ => LevelFilter::WARN,
    };

    // Initialize logging; the guard flushes the log file on exit
    let _guard = match logging::init(None, console_level) {
        Ok((guard, _)) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Run the command
    match args.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
