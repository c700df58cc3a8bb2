//! Command-line options

use crate::config::DEFAULT_CONFIG_PATH;
use clap::Parser;
use std::path::PathBuf;

/// Receives instrument files over TCP and stores them on rotating volumes
#[derive(Clone, Debug, Parser)]
#[command(name = "ftserver", version)]
pub struct DaemonOpts {
    /// Configuration file (TOML)
    #[arg(long, short = 'c', default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Write a default configuration to --config and exit
    #[arg(long, short = 'd')]
    pub init: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_flags() {
        let o = DaemonOpts::parse_from(["ftserver"]);
        assert_eq!(o.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(!o.init);

        let o = DaemonOpts::parse_from(["ftserver", "-d", "--config", "/tmp/x.toml"]);
        assert!(o.init);
        assert_eq!(o.config, PathBuf::from("/tmp/x.toml"));
    }
}
