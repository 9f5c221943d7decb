use anyhow::Result;
use clap::{Parser, Subcommand};
use rigup::logging::{LogFormat, init_logging};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "rigup")]
#[command(version, about = "Bring up throwaway service topologies for integration tests")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Console log format
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    pub log_format: LogFormat,

    /// Also write JSON logs to <DIR>/rigup.log
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Construct a topology without starting it and print its Apps
    Check {
        /// Topology file (TOML)
        topology: PathBuf,
    },
    /// Deploy and start a topology, wait for it to go operational, then hold
    Up {
        /// Topology file (TOML)
        topology: PathBuf,

        /// Seconds to wait for the cluster to go operational
        #[arg(long, default_value = "30")]
        timeout: u64,

        /// Artifact categories kept at cleanup (comma-separated: perm,temp,log or none)
        #[arg(long, default_value = "perm,log")]
        keep: String,

        /// Tear down as soon as the cluster is operational
        #[arg(long)]
        no_hold: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let _log_guard = init_logging(level, cli.log_format, cli.log_dir.as_deref())?;

    match &cli.command {
        Commands::Check { topology } => cmd::cmd_check(topology)?,
        Commands::Up {
            topology,
            timeout,
            keep,
            no_hold,
        } => cmd::cmd_up(topology, *timeout, keep, !*no_hold).await?,
    }

    Ok(())
}
