//! Command-line configuration.

use std::fs;
use std::path::Path;

use anyhow::Context;
use clap::Parser;
use network::NetworkConfig;
use tracing_subscriber::EnvFilter;

use crate::commands::Command;

/// Public-key addressed network node.
#[derive(Parser, Debug)]
#[command(name = "pknet", version, about = "Public-key addressed network node")]
pub struct CliConfig {
    /// Verbose logging (-v for debug, -vv for trace). Ignored when RUST_LOG is set.
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

impl CliConfig {
    /// Installs logging, starts a runtime and runs the selected command.
    pub fn run(self) -> anyhow::Result<()> {
        init_tracing(self.verbose);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        let result = runtime.block_on(self.command.execute())?;
        println!("{}", result);
        Ok(())
    }
}

fn init_tracing(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Reads a node configuration file.
pub fn load_node_config(path: &Path) -> anyhow::Result<NetworkConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let conf: NetworkConfig = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    conf.validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(conf)
}
