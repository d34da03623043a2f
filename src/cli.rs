//! Clap option structs for the treesync binaries

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::protocol::DEFAULT_PORT;

/// Push a local tree to a treesync server
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Push a directory tree to a treesync server")]
pub struct ClientOpts {
    /// Local file or directory to push
    pub source: PathBuf,

    /// Server as HOST or HOST:PORT
    pub server: String,

    /// Port used when SERVER has none
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Data connections open at once
    #[arg(long, default_value_t = 4)]
    pub max_transfers: usize,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,

    /// Append per-file events to this log file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Increase log verbosity
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Receive trees into PREFIX/sandbox/dest
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Serve a treesync destination")]
pub struct ServerOpts {
    /// Directory under which sandbox/dest is created
    pub prefix: PathBuf,

    /// Bind address (without port)
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Increase log verbosity
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl ServerOpts {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Local tools: fingerprinting, tree listing, replication
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "treesync local tools")]
pub struct ToolOpts {
    #[command(subcommand)]
    pub command: ToolCommand,

    /// Increase log verbosity
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ToolCommand {
    /// Fingerprint a file (or stdin) and optionally compare it to a hash
    Hash {
        block_size: usize,
        /// Hex fingerprint to compare against
        comparison: Option<String>,
        /// File to read; stdin when absent
        file: Option<PathBuf>,
    },
    /// Print a directory tree with permissions
    Tree { path: PathBuf },
    /// Replicate SRC into DEST/<name of SRC>
    Copy {
        source: PathBuf,
        destination: PathBuf,
        /// Worker threads (0 = one per CPU)
        #[arg(short = 't', long, default_value_t = 0)]
        threads: usize,
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
}

/// Initialise tracing output on stderr. `RUST_LOG` wins over `-v`.
pub fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let opts = ClientOpts::try_parse_from(["sync_client", "src", "host"]).unwrap();
        assert_eq!(opts.port, DEFAULT_PORT);
        assert_eq!(opts.max_transfers, 4);
        assert!(!opts.json);
    }

    #[test]
    fn test_tool_hash_positionals() {
        let opts = ToolOpts::try_parse_from(["treesync", "hash", "8", "00ff", "f.txt"]).unwrap();
        match opts.command {
            ToolCommand::Hash {
                block_size,
                comparison,
                file,
            } => {
                assert_eq!(block_size, 8);
                assert_eq!(comparison.as_deref(), Some("00ff"));
                assert_eq!(file, Some(PathBuf::from("f.txt")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_server_bind_addr() {
        let opts = ServerOpts::try_parse_from(["sync_server", "/tmp/x", "--port", "7000"]).unwrap();
        assert_eq!(opts.bind_addr(), "0.0.0.0:7000");
    }
}
