use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;
use zoekt_broker::{Broker, BrokerConfig};

#[derive(Debug, Parser)]
#[command(name = "zoekt-broker")]
#[command(about = "Operator front door for the Zoekt capability broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List every capability as a hit summary.
    List,
    /// Search capabilities by keyword.
    Search {
        query: String,
        #[arg(long, default_value_t = 8)]
        limit: usize,
    },
    /// Print the full capability document for one id.
    Read { id: String },
    /// Run a prebuilt workflow from a CLI-style command string.
    Run {
        command: String,
        #[arg(long, default_value_t = 0)]
        timeout_seconds: i64,
        /// Emit the raw execution result as JSON instead of the report.
        #[arg(long)]
        json: bool,
    },
    /// Run caller-supplied workflow code from a file.
    RunCode {
        path: PathBuf,
        #[arg(long, default_value = "{}")]
        args_json: String,
        #[arg(long, default_value_t = 0)]
        timeout_seconds: i64,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = BrokerConfig::from_env()?;
    let broker = Broker::load(config).await?;

    match cli.command {
        Command::List => {
            println!("{}", serde_json::to_string_pretty(&broker.list_capabilities())?);
        }
        Command::Search { query, limit } => {
            println!(
                "{}",
                serde_json::to_string_pretty(&broker.search_capabilities(&query, limit))?
            );
        }
        Command::Read { id } => {
            println!("{}", serde_json::to_string_pretty(&broker.read_capability(&id))?);
        }
        Command::Run {
            command,
            timeout_seconds,
            json,
        } => {
            let outcome = broker.run_workflow_cli(&command, timeout_seconds).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome.result)?);
            } else {
                println!("{}", outcome.report);
            }
            return Ok(exit_code_for(outcome.result.exit_code));
        }
        Command::RunCode {
            path,
            args_json,
            timeout_seconds,
            json,
        } => {
            let code = tokio::fs::read_to_string(&path).await?;
            let args: Map<String, Value> = serde_json::from_str(&args_json)?;
            let outcome = broker
                .run_custom_workflow_code(&code, &args, timeout_seconds)
                .await;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome.result)?);
            } else {
                println!("{}", outcome.report);
            }
            return Ok(exit_code_for(outcome.result.exit_code));
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn exit_code_for(child_exit_code: i32) -> ExitCode {
    match u8::try_from(child_exit_code) {
        Ok(code) => ExitCode::from(code),
        Err(_) => ExitCode::FAILURE,
    }
}
