//! Command line of the `scan_daemon` binary.

use std::path::PathBuf;

use clap::Parser;

use crate::config::BrokerConfig;

/// Remote scan broker. Accepts client connections and runs every device
/// operation through a supervised worker process.
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "scan_daemon", version)]
pub struct Cli {
    /// TCP port to listen on (also accepted as `/Port:NNNN`)
    #[arg(long)]
    pub port: Option<u16>,
    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Worker executable
    #[arg(long)]
    pub worker: Option<PathBuf>,
    /// Pages the simulated feeder delivers per job
    #[arg(long)]
    pub mock_pages: Option<u32>,
    /// Host the simulated driver inside the broker instead of a child process
    #[arg(long)]
    pub in_process: bool,
}

impl Cli {
    /// Parse the process arguments, accepting the legacy port switch.
    pub fn from_env() -> Self {
        Self::parse_from(normalize_args(std::env::args()))
    }

    /// Fold command line overrides into `config`.
    pub fn apply(&self, config: &mut BrokerConfig) {
        if let Some(port) = self.port {
            config.service.port = port;
        }
        if let Some(worker) = &self.worker {
            config.worker.program = worker.clone();
        }
        if let Some(pages) = self.mock_pages {
            config.worker.args.push("--feeder-pages".to_string());
            config.worker.args.push(pages.to_string());
        }
    }
}

/// Rewrite `/Port:NNNN` (any case) into `--port NNNN`.
pub fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out = Vec::new();
    for arg in args {
        let legacy = arg
            .get(..6)
            .filter(|prefix| prefix.eq_ignore_ascii_case("/port:"))
            .map(|_| arg[6..].to_string());
        match legacy {
            Some(port) => {
                out.push("--port".to_string());
                out.push(port);
            }
            None => out.push(arg),
        }
    }
    out
}
