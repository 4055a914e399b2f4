use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vigil::config::SpecRegistry;
use vigil::daemon::{Supervisor, SupervisorOptions};

#[derive(Parser)]
#[command(name = "vigil", about = "Generic single-host process supervisor", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise the apps declared in a config file until SIGINT/SIGTERM
    Run {
        /// App definitions (.toml or .json)
        #[arg(short, long)]
        config: PathBuf,

        /// Default directory for per-app log files
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Validate a config file without starting anything
    Check {
        /// App definitions (.toml or .json)
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, log_dir } => {
            let registry = SpecRegistry::from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;

            let mut options = SupervisorOptions::default();
            if let Some(log_dir) = log_dir {
                options.log_dir = log_dir;
            }

            let supervisor =
                Supervisor::launch(registry, options).context("starting supervisor")?;
            supervisor.run_until_signal().await?;
        }
        Commands::Check { config } => {
            let registry = SpecRegistry::from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            println!("OK: {} app(s)", registry.len());
            for spec in registry.iter() {
                let mode = if spec.is_cron() {
                    "cron"
                } else if spec.autorestart {
                    "continuous"
                } else {
                    "one-shot"
                };
                println!("  {} ({}): {}", spec.name, mode, spec.script.display());
            }
        }
    }

    Ok(())
}
