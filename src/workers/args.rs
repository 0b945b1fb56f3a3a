//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file
//! - Merging CLI with file config (CLI takes precedence)

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Spacedrop - P2P file transfer over WebRTC data channels.
#[derive(Parser, Deserialize, Clone, Debug, Default)]
#[command(author, version, about)]
#[command(propagate_version = true)]
#[serde(default)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Directory for all persistent data (chunk segments).
    /// Defaults to ~/.spacedrop/
    #[clap(long, global = true)]
    pub conf: Option<PathBuf>,

    /// STUN/TURN server url. Repeatable. Without any, only host candidates
    /// are gathered.
    #[clap(long = "ice-server", global = true)]
    pub ice_servers: Vec<String>,

    #[clap(subcommand)]
    #[serde(skip)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Send a file between two in-process peers over a real WebRTC link.
    Loopback {
        /// File to transfer.
        file: PathBuf,

        /// Directory the received copy is written to.
        #[clap(long, default_value = ".")]
        out: PathBuf,
    },
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Self {
        let mut cli_args = Args::parse();

        // Resolve relative paths to absolute before any working directory change
        cli_args.conf = cli_args.conf.map(Self::resolve_path);

        let default_path = PathBuf::from("config.toml");
        if let Some(file_args) = Self::from_file(&default_path) {
            return Self::merge(file_args, cli_args);
        }

        cli_args
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Load args from a TOML file.
    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        toml::from_str::<Args>(&content).ok()
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        if cli.conf.is_some() {
            file.conf = cli.conf;
        }
        if !cli.ice_servers.is_empty() {
            file.ice_servers = cli.ice_servers;
        }
        file.command = cli.command;
        file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_loopback() {
        let args = Args::parse_from(["spacedrop", "-vv", "loopback", "a.bin", "--out", "/tmp/x"]);
        assert_eq!(args.verbose, 2);
        match args.command {
            Some(Command::Loopback { file, out }) => {
                assert_eq!(file, PathBuf::from("a.bin"));
                assert_eq!(out, PathBuf::from("/tmp/x"));
            }
            None => panic!("missing subcommand"),
        }
    }

    #[test]
    fn cli_overrides_file() {
        let file: Args = toml::from_str(
            "verbose = 1\nice_servers = [\"stun:stun.example.org:3478\"]\n",
        )
        .unwrap();
        assert_eq!(file.verbose, 1);

        let cli = Args::parse_from(["spacedrop", "-vvv", "loopback", "a.bin"]);
        let merged = Args::merge(file, cli);
        assert_eq!(merged.verbose, 3);
        assert_eq!(merged.ice_servers, vec!["stun:stun.example.org:3478".to_string()]);
        assert!(merged.command.is_some());
    }
}
