// External crates
use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, Instrument};
use uuid::Uuid;

// Internal imports
use res_engine::{CommandError, CommandOutput, Engine, EngineConfig, Progress, ProgressEvent};

// Local modules
mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() {
    let _log_guard = res_logging::init_subscriber();
    let args = Args::parse();

    let session = Uuid::new_v4().to_string();
    let span = tracing::info_span!("res", session = %session);
    debug!(command = ?args.command, "Starting res");

    if let Err(e) = run(args).instrument(span).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading engine configuration from {}", path.display()))?,
        None => EngineConfig::load().context("loading engine configuration")?,
    };
    let engine = Engine::builder().config(config).build()?;

    match &args.command {
        Command::Exec { words } => {
            let line = Command::line(words);
            let result = execute(&engine, &line, args.progress).await;
            let failed = result.is_err();
            print_result(&result, args.json)?;
            if failed {
                std::process::exit(2);
            }
        }
        Command::Shell => {
            info!("Reading commands from stdin");
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let result = execute(&engine, line, args.progress).await;
                print_result(&result, args.json)?;
            }
        }
    }
    Ok(())
}

async fn execute(engine: &Engine, line: &str, progress: bool) -> Result<CommandOutput, CommandError> {
    if !progress {
        return engine.execute(line).await;
    }
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            eprintln!("{}", describe(&event));
        }
    });
    let result = engine.execute_with_progress(line, &Progress::to(tx)).await;
    // The sender is gone once execute returns, so the printer drains and ends.
    let _ = printer.await;
    result
}

fn describe(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::InstanceStarted { instance } => format!("{instance}: started"),
        ProgressEvent::WriteIssued { instance, write } => format!("{instance}: {write}"),
        ProgressEvent::InstanceFinished {
            instance,
            succeeded: true,
        } => format!("{instance}: done"),
        ProgressEvent::InstanceFinished { instance, .. } => format!("{instance}: failed"),
    }
}

fn print_result(result: &Result<CommandOutput, CommandError>, json: bool) -> Result<()> {
    match (result, json) {
        (Ok(output), true) => println!("{}", serde_json::to_string_pretty(output)?),
        (Ok(output), false) => println!("{}", output.to_text()),
        (Err(error), true) => println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "error": error }))?),
        (Err(error), false) => eprintln!("{:?}: {}", error.kind, error.message),
    }
    Ok(())
}
