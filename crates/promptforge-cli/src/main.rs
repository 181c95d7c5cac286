use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use promptforge_core::{DemoExecutor, Executor, ServiceConfig};

#[derive(Parser)]
#[command(name = "promptforge")]
#[command(about = "PromptForge prompt-optimization job service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP control plane
    Serve {
        /// Bind address (overrides HOST)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (overrides PORT)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Internal: execute one job inside a child process (reads the job
    /// request from stdin, writes events to stdout)
    #[command(name = "run-job", hide = true)]
    RunJob,
}

/// The executor this binary ships. Deployments embedding a real
/// optimization engine replace this wiring and keep everything else.
fn build_executor() -> Arc<dyn Executor> {
    Arc::new(DemoExecutor::new())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // The child must not start a runtime or a stdout-format subscriber:
        // stdout carries the event stream.
        Commands::RunJob => {
            let code = promptforge_core::runner::run_child(build_executor());
            std::process::exit(code);
        }
        Commands::Serve { host, port } => {
            let mut config = ServiceConfig::from_env()?;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }

            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_lowercase())),
                )
                .init();

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(promptforge_api::run(config, build_executor()))?;
            Ok(())
        }
    }
}
