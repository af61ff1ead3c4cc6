// ABOUTME: Entry point for the corral binary: the orchestration daemon and operator commands
// ABOUTME: Loads .env, initialises tracing, wires the manager and dispatches subcommands

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::process;
use std::sync::Arc;
use tracing::info;

mod cli;

use cli::env::EnvCommands;
use corral_cli::config::Config;
use corral_sandbox::{Orchestrator, OrchestratorSettings, SandboxManager};

#[derive(Parser)]
#[command(name = "corral")]
#[command(about = "Corral - sandbox lifecycle orchestration")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciler, standby pools and execution workers until Ctrl-C
    Serve,
    /// Manage environments
    #[command(subcommand)]
    Env(EnvCommands),
    /// Run a command in an environment's primary pod
    Exec {
        /// Environment ID
        environment: String,
        /// Timeout in seconds (defaults to the configured execution timeout)
        #[arg(long)]
        timeout: Option<u64>,
        /// Command and arguments, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Check cluster connectivity and capacity
    Health {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            process::exit(1);
        }
    };
    corral_cli::logging::init_tracing(config.log_format);

    match run(cli, config).await {
        Ok(0) => {}
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}

async fn run(cli: Cli, config: Config) -> Result<i32> {
    let settings = OrchestratorSettings::from_env().context("Failed to read settings")?;
    let manager = corral_cli::build_manager(&config, settings).await?;

    match cli.command {
        Commands::Serve => serve(manager).await?,
        Commands::Env(command) => cli::env::handle_env_command(&manager, command).await?,
        Commands::Exec {
            environment,
            timeout,
            command,
        } => {
            return cli::exec::handle_exec_command(&manager, &environment, command, timeout).await;
        }
        Commands::Health { json } => cli::health::handle_health_command(&manager, json).await?,
    }
    Ok(0)
}

async fn serve(manager: Arc<SandboxManager>) -> Result<()> {
    let handle = Orchestrator::start(manager).await?;
    println!(
        "{} Corral orchestrator running. Press Ctrl-C to stop.",
        "✓".green()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown signal received");

    handle.shutdown().await;
    println!("{} Orchestrator stopped", "✓".green());
    Ok(())
}
