use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{ConfigError, TempstoreConfig};

#[derive(Parser)]
#[command(name = "tempstore", about = "Temporary artifact store with retention and starring")]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
    /// Data directory (overrides the configuration file)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create the data directory and database tables
    Init,
    /// Run the HTTP server
    Serve {
        /// Listen address
        #[arg(long)]
        bind: Option<String>,
        /// Sweep every N seconds while serving
        #[arg(long)]
        sweep_interval: Option<u64>,
    },
    /// Expire old versions and collect unreferenced blobs
    Cleanup {
        /// Override the retention window
        #[arg(long)]
        retention_days: Option<i64>,
    },
    /// Upload a file as an artifact version
    Put {
        project: String,
        version: String,
        /// File to upload
        file: PathBuf,
    },
    /// Write an artifact to a file, or to stdout
    Get {
        project: String,
        version: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Keep a version forever
    Star { project: String, version: String },
    /// Let a starred version expire again
    Unstar { project: String, version: String },
    /// List projects, or the versions of one project
    List { project: Option<String> },
}

impl Cli {
    /// Resolve the effective configuration: file (or defaults), then flags
    pub fn load_config(&self) -> Result<TempstoreConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => TempstoreConfig::from_file(path)?,
            None => TempstoreConfig::default(),
        };

        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(log_level) = &self.log_level {
            config.log_level = log_level.clone();
        }

        match &self.command {
            Command::Serve {
                bind,
                sweep_interval,
            } => {
                if let Some(bind) = bind {
                    config.bind_addr = bind.clone();
                }
                if sweep_interval.is_some() {
                    config.sweep_interval_secs = *sweep_interval;
                }
            }
            Command::Cleanup {
                retention_days: Some(days),
            } => config.retention_days = *days,
            _ => {}
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "tempstore",
            "--data-dir",
            "/srv/tempstore",
            "serve",
            "--bind",
            "0.0.0.0:9000",
            "--sweep-interval",
            "600",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/tempstore"));
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.sweep_interval_secs, Some(600));
    }

    #[test]
    fn test_cleanup_retention_override() {
        let cli = Cli::parse_from(["tempstore", "cleanup", "--retention-days", "3"]);
        assert_eq!(cli.load_config().unwrap().retention_days, 3);

        let cli = Cli::parse_from(["tempstore", "cleanup", "--retention-days", "0"]);
        assert!(cli.load_config().is_err());

        let cli = Cli::parse_from(["tempstore", "cleanup", "--retention-days", "100000000"]);
        assert!(cli.load_config().is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["tempstore", "list", "svc", "--log-level", "debug"]);
        assert!(matches!(cli.command, Command::List { project: Some(ref p) } if p == "svc"));
        assert_eq!(cli.load_config().unwrap().log_level, "debug");
    }
}
