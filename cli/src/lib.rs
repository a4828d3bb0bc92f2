//! `rmp` command line: runs resource management scenarios on the
//! in-process bus and prints what the owning components observed.

pub mod demo;
pub mod scenarios;

use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use rmp_core::ConfigLoader;
use rmp_core::RmpConfig;

#[derive(Debug, Parser)]
#[command(name = "rmp", version, about = "Resource Management Protocol scenarios")]
pub struct Cli {
    /// TOML file with `[bus]` settings.
    #[arg(long = "config", short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Worker tasks per server; overrides the config file and environment.
    #[arg(long = "workers", short = 'w', global = true)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Many consumers request one camera; it starts and stops once.
    Dedup {
        /// Number of concurrent consumers.
        #[arg(long = "consumers", short = 'n', default_value_t = 3)]
        consumers: usize,
    },
    /// Releasing sensors releases the drivers they launched.
    Cascade,
    /// Load failures and status failures reaching the callers.
    Failure,
}

impl Cli {
    /// Resolve configuration: defaults, then `--config`, then environment,
    /// then `--workers`.
    pub fn load_config(&self) -> anyhow::Result<RmpConfig> {
        let mut loader = ConfigLoader::new();
        if let Some(path) = &self.config {
            loader = loader.with_file(path);
        }
        let mut config = loader.load()?;
        if let Some(workers) = self.workers {
            config.bus.workers_per_server = workers;
            config.validate()?;
        }
        Ok(config)
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.load_config()?;
    tracing::info!(
        workers_per_server = config.bus.workers_per_server,
        queue_capacity = config.bus.queue_capacity,
        "bus configured"
    );

    match cli.command {
        Command::Dedup { consumers } => {
            let report = scenarios::dedup(&config, consumers).await?;
            println!("{report}");
        }
        Command::Cascade => {
            let report = scenarios::cascade(&config).await?;
            println!("{report}");
        }
        Command::Failure => {
            let report = scenarios::failure(&config).await?;
            println!("{report}");
        }
    }
    Ok(())
}
